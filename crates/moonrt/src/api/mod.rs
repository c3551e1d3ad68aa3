// The host embedding API: a stack-based surface over the current thread.
//
// Indices: positive count from the frame bottom (1 = first slot), negative
// from the top (-1 = last pushed), and two pseudo ranges address the
// registry and the running host closure's captured values. Metamethods
// triggered from here run synchronously and are non-yieldable, like any
// host-boundary call.

pub mod load;

use std::any::Any;

use crate::gc::pool::{GcRef, TableRef, ThreadRef};
use crate::gc::{apply_param, code_param, GcKind, GcState};
use crate::limits::{MIN_STACK, MULTRET};
use crate::value::func::Closure;
use crate::value::number;
use crate::value::{TypeTag, Value};
use crate::vm::arith::{self, float_only, int_arith, is_bitwise, num_le, num_lt, value_to_shift_int};
use crate::vm::call_info::Continuation;
use crate::vm::error::{CoStatus, Error, VmResult};
use crate::vm::metamethod::Tm;
use crate::vm::opcode::ArithOp;
use crate::vm::thread::{Hook, ThreadState};
use crate::vm::Lua;

/// Pseudo-index of the registry table.
pub const REGISTRY_INDEX: i32 = -1_001_000;

/// Pseudo-index of a host closure's n-th captured value (1-based).
pub const fn upvalue_index(n: u32) -> i32 {
    REGISTRY_INDEX - n as i32
}

/// Operators accepted by [`Lua::arith`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArithApiOp {
    Add,
    Sub,
    Mul,
    Div,
    IDiv,
    Mod,
    Pow,
    BAnd,
    BOr,
    BXor,
    Shl,
    Shr,
    Unm,
    BNot,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    Lt,
    Le,
}

/// GC control operations for [`Lua::gc`].
#[derive(Debug, Clone, Copy)]
pub enum GcOp {
    Stop,
    Restart,
    Collect,
    /// Total managed bytes, in kilobytes (remainder via `CountBytes`).
    Count,
    CountBytes,
    /// Run one collection step.
    Step,
    IsRunning,
    Generational,
    Incremental,
    /// Read (and optionally set) a parameter byte; returns the previous
    /// percentage value.
    Param(usize, Option<u32>),
}

enum Slot {
    Stack(usize),
    Registry,
    Upvalue(u32),
}

impl Lua {
    // ================= index resolution =================

    fn slot(&self, idx: i32) -> Slot {
        if idx > 0 {
            let func = self.th().frame().func;
            Slot::Stack(func + idx as usize)
        } else if idx > REGISTRY_INDEX {
            debug_assert!(idx != 0, "index 0 is not addressable");
            Slot::Stack((self.th().top as i64 + idx as i64) as usize)
        } else if idx == REGISTRY_INDEX {
            Slot::Registry
        } else {
            Slot::Upvalue((REGISTRY_INDEX - idx) as u32)
        }
    }

    /// The value at an acceptable index; out-of-range stack slots read nil.
    pub fn get_value(&self, idx: i32) -> Value {
        match self.slot(idx) {
            Slot::Stack(i) => {
                let th = self.th();
                if i >= th.frame().func + 1 && i < th.top {
                    th.stack[i]
                } else {
                    Value::Nil
                }
            }
            Slot::Registry => Value::Table(self.registry),
            Slot::Upvalue(n) => {
                let func = self.th().frame().func;
                match self.th().stack[func] {
                    Value::Closure(cr) => match self.pool.closure(cr) {
                        Closure::Host(hc) => {
                            hc.upvals.get(n as usize - 1).copied().unwrap_or(Value::Nil)
                        }
                        Closure::Script(_) => Value::Nil,
                    },
                    _ => Value::Nil,
                }
            }
        }
    }

    fn set_value_at(&mut self, idx: i32, v: Value) {
        match self.slot(idx) {
            Slot::Stack(i) => self.stack_set(i, v),
            Slot::Registry => {} // the registry slot itself is immutable
            Slot::Upvalue(n) => {
                let func = self.th().frame().func;
                if let Value::Closure(cr) = self.th().stack[func] {
                    if let Closure::Host(hc) = self.pool.closure_mut(cr) {
                        if let Some(slot) = hc.upvals.get_mut(n as usize - 1) {
                            *slot = v;
                        }
                    }
                    self.gc.barrier_forward(GcRef::Closure(cr), v, &mut self.pool);
                }
            }
        }
    }

    /// Convert a possibly-negative stack index into an absolute positive
    /// one, so it survives pushes and pops.
    pub fn abs_index(&self, idx: i32) -> i32 {
        if idx > 0 || idx <= REGISTRY_INDEX {
            idx
        } else {
            let func = self.th().frame().func;
            (self.th().top as i64 + idx as i64 - func as i64) as i32
        }
    }

    // ================= stack manipulation =================

    pub fn get_top(&self) -> usize {
        let th = self.th();
        th.top - (th.frame().func + 1)
    }

    pub fn set_top(&mut self, idx: i32) {
        let base = self.th().frame().func + 1;
        let new_top = if idx >= 0 {
            base + idx as usize
        } else {
            (self.th().top as i64 + idx as i64 + 1) as usize
        };
        let old_top = self.th().top;
        if new_top > old_top {
            let _ = self.ensure_stack_abs(new_top);
            let th = self.th_mut();
            for i in old_top..new_top {
                th.stack[i] = Value::Nil;
            }
        }
        self.th_mut().top = new_top;
    }

    pub fn pop(&mut self, n: usize) {
        let top = self.th().top;
        self.th_mut().top = top - n;
    }

    /// Guarantee room for `n` more pushes.
    pub fn check_stack(&mut self, n: usize) -> bool {
        let top = self.th().top;
        self.ensure_stack_abs(top + n).is_ok()
    }

    fn push_checked(&mut self, v: Value) {
        let top = self.th().top;
        self.ensure_stack_abs(top + 1)
            .expect("stack overflow on push; call check_stack");
        self.th_mut().push(v);
    }

    pub fn push_nil(&mut self) {
        self.push_checked(Value::Nil);
    }

    pub fn push_bool(&mut self, b: bool) {
        self.push_checked(Value::Bool(b));
    }

    pub fn push_integer(&mut self, i: i64) {
        self.push_checked(Value::Int(i));
    }

    pub fn push_number(&mut self, f: f64) {
        self.push_checked(Value::Float(f));
    }

    pub fn push_lstring(&mut self, bytes: &[u8]) {
        let v = self.create_string(bytes);
        self.push_checked(v);
    }

    pub fn push_string(&mut self, s: &str) {
        self.push_lstring(s.as_bytes());
    }

    pub fn push_fstring(&mut self, args: std::fmt::Arguments<'_>) {
        let s = std::fmt::format(args);
        self.push_string(&s);
    }

    pub fn push_host_fn(&mut self, f: crate::value::HostFn) {
        self.push_checked(Value::HostFn(f));
    }

    /// A host closure capturing the top `nup` values.
    pub fn push_host_closure(&mut self, f: crate::value::HostFn, nup: usize) {
        let top = self.th().top;
        let mut upvals = Vec::with_capacity(nup);
        for i in 0..nup {
            upvals.push(self.stack_get(top - nup + i));
        }
        self.th_mut().top = top - nup;
        let v = self.create_host_closure(f, upvals);
        self.push_checked(v);
    }

    pub fn push_light_userdata(&mut self, p: *mut std::ffi::c_void) {
        self.push_checked(Value::LightUserdata(p));
    }

    /// Push the running thread; true when it is the main thread.
    pub fn push_thread(&mut self) -> bool {
        let cur = self.current;
        self.push_checked(Value::Thread(cur));
        cur == self.main
    }

    pub fn push_value(&mut self, idx: i32) {
        let v = self.get_value(idx);
        self.push_checked(v);
    }

    /// Rotate the slice between `idx` and the top by `n` positions toward
    /// the top (negative `n` rotates downward).
    pub fn rotate(&mut self, idx: i32, n: i32) {
        let Slot::Stack(from) = self.slot(idx) else {
            return;
        };
        let top = self.th().top;
        let len = top - from;
        if len == 0 {
            return;
        }
        let shift = n.rem_euclid(len as i32) as usize;
        self.th_mut().stack[from..top].rotate_right(shift);
    }

    pub fn copy(&mut self, from: i32, to: i32) {
        let v = self.get_value(from);
        self.set_value_at(to, v);
    }

    pub fn insert(&mut self, idx: i32) {
        self.rotate(idx, 1);
    }

    pub fn remove(&mut self, idx: i32) {
        self.rotate(idx, -1);
        self.pop(1);
    }

    pub fn replace(&mut self, idx: i32) {
        self.copy(-1, idx);
        self.pop(1);
    }

    /// Move the top `n` values of the current thread onto `to`.
    pub fn xmove(&mut self, to: ThreadRef, n: usize) {
        if to == self.current {
            return;
        }
        let from_top = self.th().top;
        let mut vals = Vec::with_capacity(n);
        for i in 0..n {
            vals.push(self.stack_get(from_top - n + i));
        }
        self.th_mut().top = from_top - n;
        let dst = self.pool.thread_mut(to);
        for v in vals {
            let _ = dst.ensure_stack(1);
            dst.push(v);
        }
    }

    // ================= type tests and conversions =================

    pub fn type_of(&self, idx: i32) -> TypeTag {
        self.get_value(idx).type_tag()
    }

    pub fn is_nil(&self, idx: i32) -> bool {
        self.get_value(idx).is_nil()
    }

    pub fn is_number(&self, idx: i32) -> bool {
        self.coerce_number(self.get_value(idx)).is_some()
    }

    pub fn is_string(&self, idx: i32) -> bool {
        matches!(
            self.get_value(idx),
            Value::Str(_) | Value::Int(_) | Value::Float(_)
        )
    }

    pub fn is_table(&self, idx: i32) -> bool {
        matches!(self.get_value(idx), Value::Table(_))
    }

    pub fn is_function(&self, idx: i32) -> bool {
        matches!(self.get_value(idx), Value::Closure(_) | Value::HostFn(_))
    }

    pub fn to_integer(&self, idx: i32) -> Option<i64> {
        self.coerce_integer(self.get_value(idx))
    }

    pub fn to_number(&self, idx: i32) -> Option<f64> {
        match self.coerce_number(self.get_value(idx))? {
            Value::Int(i) => Some(i as f64),
            Value::Float(f) => Some(f),
            _ => None,
        }
    }

    pub fn to_boolean(&self, idx: i32) -> bool {
        self.get_value(idx).is_truthy()
    }

    /// String bytes of a string value; numbers convert, everything else is
    /// `None`.
    pub fn to_bytes(&self, idx: i32) -> Option<Vec<u8>> {
        match self.get_value(idx) {
            Value::Str(s) => Some(self.pool.str_(s).as_bytes().to_vec()),
            Value::Int(i) => Some(number::int_to_string(i).into_bytes()),
            Value::Float(f) => Some(number::float_to_string(f).into_bytes()),
            _ => None,
        }
    }

    pub fn to_rust_string(&self, idx: i32) -> Option<String> {
        self.to_bytes(idx)
            .map(|b| String::from_utf8_lossy(&b).into_owned())
    }

    pub fn to_thread(&self, idx: i32) -> Option<ThreadRef> {
        self.get_value(idx).as_thread_ref()
    }

    pub fn to_userdata(&mut self, idx: i32) -> Option<&mut dyn Any> {
        let r = self.get_value(idx).as_userdata_ref()?;
        Some(self.pool.userdata_mut(r).data.as_mut())
    }

    /// Raw length: string bytes, table border, userdata uservalue count.
    pub fn raw_len(&self, idx: i32) -> usize {
        match self.get_value(idx) {
            Value::Str(s) => self.pool.str_(s).len(),
            Value::Table(t) => self.pool.table_length(t) as usize,
            Value::Userdata(u) => self.pool.userdata_(u).uservalues.len(),
            _ => 0,
        }
    }

    // ================= tables =================

    pub fn new_table(&mut self) {
        self.new_table_sized(0, 0);
    }

    pub fn new_table_sized(&mut self, narr: usize, nrec: usize) {
        let t = self.create_table(narr, nrec);
        self.push_checked(t);
    }

    /// t[k] where t is at `idx` and k is on top; the key is replaced by the
    /// result. Honors `__index`.
    pub fn get_table(&mut self, idx: i32) -> VmResult<TypeTag> {
        let t = self.get_value(idx);
        let k = self.get_value(-1);
        let v = self.index_get(t, k)?;
        let top = self.th().top;
        self.stack_set(top - 1, v);
        Ok(v.type_tag())
    }

    /// t[k] = v with t at `idx`, key below value on top; pops both.
    pub fn set_table(&mut self, idx: i32) -> VmResult<()> {
        let t = self.get_value(idx);
        let v = self.get_value(-1);
        let k = self.get_value(-2);
        self.pop(2);
        self.index_set(t, k, v)
    }

    pub fn get_field(&mut self, idx: i32, k: &str) -> VmResult<TypeTag> {
        let t = self.get_value(idx);
        let key = self.create_string_str(k);
        let v = self.index_get(t, key)?;
        self.push_checked(v);
        Ok(v.type_tag())
    }

    pub fn set_field(&mut self, idx: i32, k: &str) -> VmResult<()> {
        let t = self.get_value(idx);
        let key = self.create_string_str(k);
        let v = self.get_value(-1);
        self.pop(1);
        self.index_set(t, key, v)
    }

    pub fn get_i(&mut self, idx: i32, i: i64) -> VmResult<TypeTag> {
        let t = self.get_value(idx);
        let v = self.index_get(t, Value::Int(i))?;
        self.push_checked(v);
        Ok(v.type_tag())
    }

    pub fn set_i(&mut self, idx: i32, i: i64) -> VmResult<()> {
        let t = self.get_value(idx);
        let v = self.get_value(-1);
        self.pop(1);
        self.index_set(t, Value::Int(i), v)
    }

    pub fn raw_get(&mut self, idx: i32) -> TypeTag {
        let t = self.get_value(idx).as_table_ref().expect("table expected");
        let k = self.get_value(-1);
        let v = self.pool.table_rawget(t, k);
        let top = self.th().top;
        self.stack_set(top - 1, v);
        v.type_tag()
    }

    pub fn raw_set(&mut self, idx: i32) -> VmResult<()> {
        let t = self.get_value(idx).as_table_ref().expect("table expected");
        let v = self.get_value(-1);
        let k = self.get_value(-2);
        self.pop(2);
        self.raw_set_with_barrier(t, k, v)
    }

    pub fn raw_get_i(&mut self, idx: i32, i: i64) -> TypeTag {
        let t = self.get_value(idx).as_table_ref().expect("table expected");
        let v = self.pool.table_rawget(t, Value::Int(i));
        self.push_checked(v);
        v.type_tag()
    }

    pub fn raw_set_i(&mut self, idx: i32, i: i64) -> VmResult<()> {
        let t = self.get_value(idx).as_table_ref().expect("table expected");
        let v = self.get_value(-1);
        self.pop(1);
        self.raw_set_with_barrier(t, Value::Int(i), v)
    }

    /// Table traversal: pops a key, pushes the next key/value pair (true)
    /// or nothing at the end (false).
    pub fn next(&mut self, idx: i32) -> VmResult<bool> {
        let t = self.get_value(idx).as_table_ref().expect("table expected");
        let k = self.get_value(-1);
        self.pop(1);
        let key = if k.is_nil() { None } else { Some(k) };
        match self.pool.table_next(t, key) {
            Ok(Some((nk, nv))) => {
                self.push_checked(nk);
                self.push_checked(nv);
                Ok(true)
            }
            Ok(None) => Ok(false),
            Err(()) => Err(self.rt_error("invalid key to 'next'")),
        }
    }

    pub fn get_global(&mut self, name: &str) -> VmResult<TypeTag> {
        let g = Value::Table(self.globals);
        let key = self.create_string_str(name);
        let v = self.index_get(g, key)?;
        self.push_checked(v);
        Ok(v.type_tag())
    }

    pub fn set_global(&mut self, name: &str) -> VmResult<()> {
        let g = Value::Table(self.globals);
        let key = self.create_string_str(name);
        let v = self.get_value(-1);
        self.pop(1);
        self.index_set(g, key, v)
    }

    // ================= metatables & userdata =================

    /// Push the metatable of the value at `idx`; false (and nothing
    /// pushed) when it has none.
    pub fn get_metatable(&mut self, idx: i32) -> bool {
        let v = self.get_value(idx);
        match self.metatable_of(v) {
            Some(mt) => {
                self.push_checked(Value::Table(mt));
                true
            }
            None => false,
        }
    }

    /// Pop a table (or nil) and install it as the metatable of the value
    /// at `idx`.
    pub fn set_metatable(&mut self, idx: i32) -> VmResult<()> {
        let v = self.get_value(idx);
        let mt = self.get_value(-1);
        self.pop(1);
        let mt = match mt {
            Value::Nil => None,
            Value::Table(t) => Some(t),
            _ => return Err(self.rt_error("metatable must be a table or nil")),
        };
        self.set_metatable_of(v, mt)
    }

    pub fn new_userdata(&mut self, data: Box<dyn Any>, nuvalue: usize) {
        let v = self.create_userdata(data, nuvalue);
        self.push_checked(v);
    }

    /// Push the n-th user value (1-based) of the userdata at `idx`.
    pub fn get_uservalue(&mut self, idx: i32, n: usize) -> VmResult<TypeTag> {
        let Some(u) = self.get_value(idx).as_userdata_ref() else {
            return Err(self.rt_error("userdata expected"));
        };
        let v = self
            .pool
            .userdata_(u)
            .uservalues
            .get(n - 1)
            .copied()
            .unwrap_or(Value::Nil);
        self.push_checked(v);
        Ok(v.type_tag())
    }

    pub fn set_uservalue(&mut self, idx: i32, n: usize) -> VmResult<()> {
        let Some(u) = self.get_value(idx).as_userdata_ref() else {
            return Err(self.rt_error("userdata expected"));
        };
        let v = self.get_value(-1);
        self.pop(1);
        match self.pool.userdata_mut(u).uservalues.get_mut(n - 1) {
            Some(slot) => {
                *slot = v;
                self.gc.barrier_forward(GcRef::Userdata(u), v, &mut self.pool);
                Ok(())
            }
            None => Err(self.rt_error("user value index out of range")),
        }
    }

    // ================= calls =================

    /// Call the function below the top `nargs` values. Non-yieldable, like
    /// any plain host-boundary call.
    pub fn call(&mut self, nargs: usize, nresults: i16) -> VmResult<()> {
        let func = self.th().top - nargs - 1;
        self.th_mut().nny += 1;
        let r = self.do_call_at(func, nresults);
        self.th_mut().nny -= 1;
        r
    }

    /// Protected call; `errf` is a stack index of a message handler or 0.
    pub fn pcall(&mut self, nargs: usize, nresults: i16, errf: i32) -> Result<(), Error> {
        let errf_abs = if errf == 0 {
            0
        } else {
            let Slot::Stack(i) = self.slot(errf) else {
                return Err(Error::Runtime);
            };
            i
        };
        self.pcall_with_cont(nargs, nresults, errf_abs, None)
    }

    /// Protected call whose body may yield; `cont` finishes the invoking
    /// host function after a resume.
    pub fn pcall_k(
        &mut self,
        nargs: usize,
        nresults: i16,
        errf: i32,
        cont: Continuation,
        ctx: i64,
    ) -> Result<(), Error> {
        let errf_abs = if errf == 0 {
            0
        } else {
            let Slot::Stack(i) = self.slot(errf) else {
                return Err(Error::Runtime);
            };
            i
        };
        self.pcall_with_cont(nargs, nresults, errf_abs, Some((cont, ctx)))
    }

    // ================= coroutines =================

    pub fn new_thread(&mut self) -> ThreadRef {
        let v = self.create_thread();
        let r = v.as_thread_ref().expect("fresh thread");
        self.push_checked(v);
        r
    }

    pub fn status_of(&self, co: ThreadRef) -> CoStatus {
        self.thread_status(co)
    }

    /// Close a coroutine, releasing its to-be-closed slots.
    pub fn close_thread(&mut self, co: ThreadRef) -> Result<(), Error> {
        self.close_coroutine(co)
    }

    // ================= errors =================

    /// Raise with the value on top of the stack as the error object.
    pub fn error(&mut self) -> Error {
        let v = self.get_value(-1);
        self.pop(1);
        self.throw_value(v)
    }

    /// Mark the slot at `idx` as to-be-closed.
    pub fn to_close(&mut self, idx: i32) -> VmResult<()> {
        let Slot::Stack(i) = self.slot(idx) else {
            return Err(self.rt_error("invalid slot for to-be-closed"));
        };
        self.mark_tbc(i)
    }

    /// Close the to-be-closed slot at `idx` immediately.
    pub fn close_slot(&mut self, idx: i32) -> VmResult<()> {
        let Slot::Stack(i) = self.slot(idx) else {
            return Err(self.rt_error("invalid slot for close"));
        };
        match self.close_tbc(i, None) {
            None => {
                self.stack_set(i, Value::Nil);
                Ok(())
            }
            Some(e) => Err(e),
        }
    }

    // ================= arith / compare / concat / len =================

    /// Apply an arithmetic operator to the top one or two values,
    /// replacing them with the result. Metamethods are honored.
    pub fn arith(&mut self, op: ArithApiOp) -> VmResult<()> {
        let (unary, binop, tm) = match op {
            ArithApiOp::Add => (false, Some(ArithOp::Add), Tm::Add),
            ArithApiOp::Sub => (false, Some(ArithOp::Sub), Tm::Sub),
            ArithApiOp::Mul => (false, Some(ArithOp::Mul), Tm::Mul),
            ArithApiOp::Div => (false, Some(ArithOp::Div), Tm::Div),
            ArithApiOp::IDiv => (false, Some(ArithOp::IDiv), Tm::IDiv),
            ArithApiOp::Mod => (false, Some(ArithOp::Mod), Tm::Mod),
            ArithApiOp::Pow => (false, Some(ArithOp::Pow), Tm::Pow),
            ArithApiOp::BAnd => (false, Some(ArithOp::BAnd), Tm::BAnd),
            ArithApiOp::BOr => (false, Some(ArithOp::BOr), Tm::BOr),
            ArithApiOp::BXor => (false, Some(ArithOp::BXor), Tm::BXor),
            ArithApiOp::Shl => (false, Some(ArithOp::Shl), Tm::Shl),
            ArithApiOp::Shr => (false, Some(ArithOp::Shr), Tm::Shr),
            ArithApiOp::Unm => (true, None, Tm::Unm),
            ArithApiOp::BNot => (true, None, Tm::BNot),
        };
        let (a, b) = if unary {
            let v = self.get_value(-1);
            self.pop(1);
            (v, v)
        } else {
            let b = self.get_value(-1);
            let a = self.get_value(-2);
            self.pop(2);
            (a, b)
        };
        let result = self.arith_values(binop, tm, a, b)?;
        self.push_checked(result);
        Ok(())
    }

    fn arith_values(
        &mut self,
        binop: Option<ArithOp>,
        tm: Tm,
        a: Value,
        b: Value,
    ) -> VmResult<Value> {
        match binop {
            Some(op) => {
                let na = self.coerce_number(a);
                let nb = self.coerce_number(b);
                if let (Some(na), Some(nb)) = (na, nb) {
                    if is_bitwise(op) {
                        match (value_to_shift_int(na), value_to_shift_int(nb)) {
                            (Some(x), Some(y)) => {
                                return Ok(Value::Int(
                                    int_arith(op, x, y).expect("bitwise never fails"),
                                ));
                            }
                            _ => {
                                return Err(
                                    self.rt_error("number has no integer representation")
                                );
                            }
                        }
                    }
                    if let (Value::Int(x), Value::Int(y)) = (na, nb) {
                        if !float_only(op) {
                            return match int_arith(op, x, y) {
                                Ok(r) => Ok(Value::Int(r)),
                                Err(_) => {
                                    let what =
                                        if op == ArithOp::Mod { "'n%0'" } else { "'n//0'" };
                                    Err(self
                                        .rt_error(&format!("attempt to perform {}", what)))
                                }
                            };
                        }
                    }
                    let x = match na {
                        Value::Int(i) => i as f64,
                        Value::Float(f) => f,
                        _ => unreachable!(),
                    };
                    let y = match nb {
                        Value::Int(i) => i as f64,
                        Value::Float(f) => f,
                        _ => unreachable!(),
                    };
                    return Ok(Value::Float(arith::float_arith(op, x, y)));
                }
            }
            None => {
                // Unary on a number.
                if tm == Tm::Unm {
                    match self.coerce_number(a) {
                        Some(Value::Int(i)) => return Ok(Value::Int(i.wrapping_neg())),
                        Some(Value::Float(f)) => return Ok(Value::Float(-f)),
                        _ => {}
                    }
                } else if let Some(i) = value_to_shift_int(a) {
                    return Ok(Value::Int(!i));
                }
            }
        }
        let mut handler = self.get_metamethod(a, tm);
        if handler.is_nil() {
            handler = self.get_metamethod(b, tm);
        }
        if handler.is_nil() {
            return Err(self.type_error("perform arithmetic on", a));
        }
        self.call_metamethod_2(handler, a, b)
    }

    /// Compare two stack values. `Eq` never errors on type mismatch.
    pub fn compare(&mut self, i: i32, j: i32, op: CompareOp) -> VmResult<bool> {
        let a = self.get_value(i);
        let b = self.get_value(j);
        match op {
            CompareOp::Eq => self.values_equal(a, b),
            CompareOp::Lt => self.compare_order(a, b, false),
            CompareOp::Le => self.compare_order(a, b, true),
        }
    }

    fn compare_order(&mut self, a: Value, b: Value, le: bool) -> VmResult<bool> {
        if let Some(r) = if le { num_le(a, b) } else { num_lt(a, b) } {
            return Ok(r);
        }
        if let (Value::Str(x), Value::Str(y)) = (a, b) {
            let (bx, by) = (self.pool.str_(x).as_bytes(), self.pool.str_(y).as_bytes());
            return Ok(if le { bx <= by } else { bx < by });
        }
        let tm_kind = if le { Tm::Le } else { Tm::Lt };
        let mut tm = self.get_metamethod(a, tm_kind);
        if tm.is_nil() {
            tm = self.get_metamethod(b, tm_kind);
        }
        if !tm.is_nil() {
            let r = self.call_metamethod_2(tm, a, b)?;
            return Ok(r.is_truthy());
        }
        if le {
            let mut tm = self.get_metamethod(a, Tm::Lt);
            if tm.is_nil() {
                tm = self.get_metamethod(b, Tm::Lt);
            }
            if !tm.is_nil() {
                let r = self.call_metamethod_2(tm, b, a)?;
                return Ok(r.is_falsy());
            }
        }
        Err(self.rt_error(&format!(
            "attempt to compare {} with {}",
            a.type_name(),
            b.type_name()
        )))
    }

    /// Concatenate the top `n` values into one, right-associatively.
    pub fn concat(&mut self, n: usize) -> VmResult<()> {
        if n == 0 {
            self.push_string("");
            return Ok(());
        }
        let mut count = n;
        while count > 1 {
            let b = self.get_value(-1);
            let a = self.get_value(-2);
            let joined = match self.concat_pair_raw(a, b) {
                Some(v) => v,
                None => {
                    let mut tm = self.get_metamethod(a, Tm::Concat);
                    if tm.is_nil() {
                        tm = self.get_metamethod(b, Tm::Concat);
                    }
                    if tm.is_nil() {
                        let culprit =
                            if matches!(a, Value::Str(_) | Value::Int(_) | Value::Float(_)) {
                                b
                            } else {
                                a
                            };
                        return Err(self.type_error("concatenate", culprit));
                    }
                    self.call_metamethod_2(tm, a, b)?
                }
            };
            self.pop(2);
            self.push_checked(joined);
            count -= 1;
        }
        Ok(())
    }

    /// Length of the value at `idx`, honoring `__len`; pushes the result.
    pub fn len(&mut self, idx: i32) -> VmResult<()> {
        let v = self.get_value(idx);
        let l = self.value_length(v)?;
        self.push_checked(l);
        Ok(())
    }

    // ================= registry refs =================

    /// Pop the top value into the registry's ref pool; returns its handle.
    pub fn create_ref(&mut self) -> VmResult<i64> {
        let v = self.get_value(-1);
        self.pop(1);
        if v.is_nil() {
            return Ok(0); // nil never gets a slot
        }
        let pool_t = self.ref_pool();
        let head = self.pool.table_rawget(pool_t, Value::Int(1));
        let slot = match head {
            Value::Int(h) if h != 0 => {
                let next = self.pool.table_rawget(pool_t, Value::Int(h));
                self.raw_set_with_barrier(pool_t, Value::Int(1), next)?;
                h
            }
            _ => {
                let len = self.pool.table_length(pool_t);
                len.max(1) + 1
            }
        };
        self.raw_set_with_barrier(pool_t, Value::Int(slot), v)?;
        Ok(slot)
    }

    pub fn push_ref(&mut self, r: i64) {
        let pool_t = self.ref_pool();
        let v = if r == 0 {
            Value::Nil
        } else {
            self.pool.table_rawget(pool_t, Value::Int(r))
        };
        self.push_checked(v);
    }

    /// Return a ref slot to the free list.
    pub fn release_ref(&mut self, r: i64) -> VmResult<()> {
        if r == 0 {
            return Ok(());
        }
        let pool_t = self.ref_pool();
        let head = self.pool.table_rawget(pool_t, Value::Int(1));
        self.raw_set_with_barrier(pool_t, Value::Int(r), head)?;
        self.raw_set_with_barrier(pool_t, Value::Int(1), Value::Int(r))?;
        Ok(())
    }

    fn ref_pool(&self) -> TableRef {
        self.pool
            .table_rawget(self.registry, Value::Int(1))
            .as_table_ref()
            .expect("registry ref pool")
    }

    // ================= GC control =================

    pub fn gc(&mut self, op: GcOp) -> i64 {
        match op {
            GcOp::Stop => {
                self.gc.stopped = true;
                0
            }
            GcOp::Restart => {
                self.gc.stopped = false;
                self.gc.set_debt(0);
                0
            }
            GcOp::Collect => {
                self.collect_garbage();
                0
            }
            GcOp::Count => self.gc.total_allocated() as i64 / 1024,
            GcOp::CountBytes => self.gc.total_allocated() as i64 % 1024,
            GcOp::Step => {
                let roots = self.gc_roots();
                match self.gc.step(&roots, &mut self.pool) {
                    crate::gc::StepOutcome::Done => {}
                    crate::gc::StepOutcome::RunFinalizer => self.run_one_finalizer(),
                }
                i64::from(self.gc.state() == GcState::Pause)
            }
            GcOp::IsRunning => i64::from(!self.gc.stopped),
            GcOp::Generational => {
                let roots = self.gc_roots();
                self.gc.set_kind(GcKind::GenMinor, &roots, &mut self.pool);
                0
            }
            GcOp::Incremental => {
                let roots = self.gc_roots();
                self.gc.set_kind(GcKind::Incremental, &roots, &mut self.pool);
                0
            }
            GcOp::Param(which, set) => {
                if which >= crate::gc::PARAM_COUNT {
                    return -1;
                }
                let old = apply_param(self.gc.params[which], 100);
                if let Some(v) = set {
                    self.gc.params[which] = code_param(v);
                }
                old as i64
            }
        }
    }

    // ================= debug hooks =================

    /// Install a hook on the current thread. `count` is the instruction
    /// period for count events.
    pub fn set_hook(&mut self, hook: Option<Hook>, mask: u8, count: u32) {
        let th = self.th_mut();
        th.hook = hook;
        th.hook_mask = if hook.is_some() { mask } else { 0 };
        th.hook_base_count = count;
        th.hook_count = count;
        th.trap = th.hook.is_some()
            && th.hook_mask & (crate::vm::thread::hook_mask::LINE | crate::vm::thread::hook_mask::COUNT)
                != 0;
    }

    // ================= misc =================

    /// Yield from the current coroutine with the top `n` values.
    pub fn yield_values(&mut self, n: u32) -> Error {
        self.do_yield(n)
    }

    /// The number of arguments a host function was called with.
    pub fn arg_count(&self) -> usize {
        self.get_top()
    }

    /// Entry point for host code: call a function with arguments already
    /// pushed, aborting through the panic chain on an unprotected error.
    pub fn call_or_panic(&mut self, nargs: usize, nresults: i16) {
        if let Err(e) = self.call(nargs, nresults) {
            if e == Error::Yield {
                return;
            }
            self.panic(e);
        }
    }

    /// Make sure a host function has its guaranteed scratch space.
    pub fn ensure_min_stack(&mut self) -> VmResult<()> {
        let top = self.th().top;
        self.ensure_stack_abs(top + MIN_STACK)
    }

    /// Whether the current thread may yield right now.
    pub fn yieldable(&self) -> bool {
        self.is_yieldable()
    }

    /// Resume a coroutine value at `idx` with the top `nargs` values.
    pub fn resume_at(&mut self, idx: i32, nargs: usize) -> Result<usize, Error> {
        let Some(co) = self.get_value(idx).as_thread_ref() else {
            let v = self.create_string_str("cannot resume a non-coroutine value");
            return Err(self.throw_value(v));
        };
        self.resume_thread(co, nargs)
    }

    /// True when the value at `idx` is dead (for coroutine introspection).
    pub fn thread_is_dead(&self, idx: i32) -> bool {
        match self.get_value(idx).as_thread_ref() {
            Some(co) => self.pool.thread(co).state == ThreadState::Dead,
            None => true,
        }
    }
}

pub use crate::vm::type_name_of;
pub const MULTRET_API: i16 = MULTRET;
