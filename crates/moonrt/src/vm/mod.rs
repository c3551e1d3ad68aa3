// The state: one global area shared by every coroutine, plus the machinery
// the executor and the host API build on — allocation checkpoints, error
// raising, metamethod lookup, table access with `__index`/`__newindex`
// chains, upvalue closing, and to-be-closed handling.

pub mod arith;
pub mod call;
pub mod call_info;
pub mod error;
pub mod execute;
pub mod metamethod;
pub mod opcode;
pub mod thread;

use std::rc::Rc;

use crate::gc::interner::hash_bytes;
use crate::gc::pool::{
    ClosureRef, GcRef, ObjectPool, StrRef, TableRef, ThreadRef, UdRef, UpvalRef,
};
use crate::gc::{Gc, GcHeader, StepOutcome};
use crate::limits::{MAX_TAG_LOOP, SHORT_STR_MAX};
use crate::value::func::{Closure, HostClosure, Proto, ScriptClosure, Upvalue};
use crate::value::number;
use crate::value::string::{ExternalBuffer, Str};
use crate::value::table::Table;
use crate::value::userdata::Userdata;
use crate::value::{float_to_exact_int, HostFn, TypeTag, Value, NUM_TYPES};
use crate::vm::error::{Error, VmResult};
use crate::vm::metamethod::{Tm, TM_COUNT, TM_NAMES};
use crate::vm::thread::{Thread, ThreadState};

pub use crate::gc::GcKind;
pub use crate::vm::error::CoStatus;

/// Handler for the warning system. `cont` marks a to-be-continued fragment.
pub type WarnHandler = Box<dyn FnMut(&str, bool)>;

/// Invoked when an unprotected error would escape the runtime; if it
/// returns, the process aborts.
pub type PanicFn = fn(&mut Lua) -> i32;

/// Compiles collected chunk bytes into a `Proto`. The front end itself is
/// a separate component; the runtime only drives this hook.
pub trait ChunkCompiler {
    fn compile(&mut self, source: &[u8], chunk_name: &str) -> Result<Rc<Proto>, String>;
}

/// Byte codec for precompiled chunks; behind a hook for the same reason.
pub trait ProtoCodec {
    /// Emit `proto` through `writer`; a nonzero writer status aborts the
    /// dump and is returned as is.
    fn dump(
        &mut self,
        proto: &Proto,
        writer: &mut dyn FnMut(&[u8]) -> i32,
        strip: bool,
    ) -> i32;
    fn undump(&mut self, bytes: &[u8], chunk_name: &str) -> Result<Rc<Proto>, String>;
}

pub struct Lua {
    pub(crate) pool: ObjectPool,
    pub(crate) gc: Gc,
    pub(crate) registry: TableRef,
    pub(crate) globals: TableRef,
    pub(crate) main: ThreadRef,
    pub(crate) current: ThreadRef,
    /// Metatables for non-table, non-userdata types.
    pub(crate) type_mt: [Option<TableRef>; NUM_TYPES],
    /// Interned metamethod event names, pinned.
    pub(crate) tm_refs: [StrRef; TM_COUNT],
    /// Pre-built message for allocation failure.
    pub(crate) memerr: StrRef,
    pub(crate) warn_handler: Option<WarnHandler>,
    pub(crate) warn_on: bool,
    pub(crate) panic_fn: Option<PanicFn>,
    pub(crate) compiler: Option<Box<dyn ChunkCompiler>>,
    pub(crate) codec: Option<Box<dyn ProtoCodec>>,
}

impl Lua {
    pub fn new() -> Box<Lua> {
        let mut pool = ObjectPool::new();
        let gc = Gc::new();

        // The main thread, pinned: it lives exactly as long as the state.
        let mut main_thread = Thread::new();
        main_thread.state = ThreadState::Running;
        main_thread.nny = 1; // the outermost frame cannot yield
        main_thread.started = true;
        let mut header = gc.new_header(main_thread.footprint());
        header.set_fixed();
        let main = pool.alloc_thread(header, main_thread);

        let mut lua = Box::new(Lua {
            pool,
            gc,
            registry: TableRef(u32::MAX),
            globals: TableRef(u32::MAX),
            main,
            current: main,
            type_mt: [None; NUM_TYPES],
            tm_refs: [StrRef(u32::MAX); TM_COUNT],
            memerr: StrRef(u32::MAX),
            warn_handler: None,
            warn_on: false,
            panic_fn: None,
            compiler: None,
            codec: None,
        });
        lua.gc.register(GcRef::Thread(main), 0);
        // No collection until the registry and pinned strings exist.
        lua.gc.stopped = true;

        // Base frame of the main thread, so host stack indices resolve.
        {
            let th = lua.pool.thread_mut(main);
            th.stack[0] = Value::Nil;
            th.top = 1;
            th.frames
                .push(crate::vm::call_info::CallInfo::host(0, 1, 1, 0));
        }

        // Pinned strings: metamethod names, the out-of-memory message.
        for i in 0..TM_COUNT {
            let r = lua.intern_pinned(TM_NAMES[i].as_bytes());
            lua.pool.str_set_extra(r, (i + 1) as u8);
            lua.tm_refs[i] = r;
        }
        lua.memerr = lua.intern_pinned(b"not enough memory");
        lua.gc.mode_key = Some(lua.tm_refs[Tm::Mode as usize]);

        // Registry layout: [1] = ref pool, [2] = globals, [3] = main thread.
        let registry = lua.new_table_raw(4, 0);
        lua.registry = registry;
        let refpool = lua.new_table_raw(4, 0);
        lua.pool
            .table_rawset(refpool, Value::Int(1), Value::Int(0))
            .expect("ref pool init");
        let globals = lua.new_table_raw(0, 16);
        lua.globals = globals;
        lua.pool
            .table_rawset(registry, Value::Int(1), Value::Table(refpool))
            .expect("registry init");
        lua.pool
            .table_rawset(registry, Value::Int(2), Value::Table(globals))
            .expect("registry init");
        lua.pool
            .table_rawset(registry, Value::Int(3), Value::Thread(main))
            .expect("registry init");
        lua.gc.stopped = false;
        lua
    }

    // ================= thread shorthand =================

    #[inline(always)]
    pub(crate) fn th(&self) -> &Thread {
        self.pool.thread(self.current)
    }

    #[inline(always)]
    pub(crate) fn th_mut(&mut self) -> &mut Thread {
        self.pool.thread_mut(self.current)
    }

    #[inline(always)]
    pub(crate) fn stack_get(&self, i: usize) -> Value {
        self.th().stack[i]
    }

    #[inline(always)]
    pub(crate) fn stack_set(&mut self, i: usize, v: Value) {
        self.th_mut().stack[i] = v;
    }

    // ================= GC driving =================

    /// Roots: registry (which anchors globals and the main thread), the
    /// per-type metatables, and the chain of running threads.
    pub(crate) fn gc_roots(&self) -> Vec<Value> {
        let mut roots = vec![Value::Table(self.registry), Value::Thread(self.main)];
        for mt in self.type_mt.iter().flatten() {
            roots.push(Value::Table(*mt));
        }
        let mut t = Some(self.current);
        while let Some(tr) = t {
            roots.push(Value::Thread(tr));
            t = self.pool.thread(tr).resumer;
        }
        roots
    }

    /// Allocation checkpoint: run one GC slice when the debt calls for it.
    #[inline]
    pub(crate) fn gc_checkpoint(&mut self) {
        if self.gc.should_step() {
            self.gc_step_once();
        }
    }

    fn gc_step_once(&mut self) {
        let roots = self.gc_roots();
        match self.gc.step(&roots, &mut self.pool) {
            StepOutcome::Done => {}
            StepOutcome::RunFinalizer => self.run_one_finalizer(),
        }
    }

    /// A full collection, also used by gc("collect").
    pub fn collect_garbage(&mut self) {
        let roots = self.gc_roots();
        self.gc.full_collection(&roots, &mut self.pool, false);
        while self.gc.has_pending_finalizers() {
            self.run_one_finalizer();
        }
    }

    /// Run one queued `__gc` in a protected frame; errors go to the
    /// warning channel.
    pub(crate) fn run_one_finalizer(&mut self) {
        let Some(r) = self.gc.take_finalizable() else {
            return;
        };
        let obj = match r {
            GcRef::Table(t) => Value::Table(t),
            GcRef::Userdata(u) => Value::Userdata(u),
            _ => return,
        };
        let tm = self.get_metamethod(obj, Tm::Gc);
        if tm.is_nil() {
            return;
        }
        // Finalizers may fire at any allocation checkpoint; stage the call
        // above the running frame's ceiling so live registers survive.
        let saved_top = self.th().top;
        let ceiling = self
            .th()
            .frames
            .last()
            .map(|ci| ci.top)
            .unwrap_or(saved_top);
        let func = saved_top.max(ceiling);
        if self.ensure_stack_abs(func + 2).is_err() {
            return;
        }
        {
            let th = self.th_mut();
            th.stack[func] = tm;
            th.stack[func + 1] = obj;
            th.top = func + 2;
        }
        self.th_mut().nny += 1;
        self.gc.stopem = true;
        let status = self.protected_call_at(func, 1, 0, 0);
        self.gc.stopem = false;
        self.th_mut().nny -= 1;
        if status.is_err() {
            let err = self.th().error_value;
            let msg = self.display_value(err);
            self.warning(&format!("error in __gc metamethod ({})", msg), false);
        }
        self.th_mut().top = saved_top;
    }

    // ================= allocation =================

    /// Intern or create a string value.
    pub fn create_string(&mut self, bytes: &[u8]) -> Value {
        self.gc_checkpoint();
        if bytes.len() <= SHORT_STR_MAX {
            let hash = hash_bytes(bytes);
            let other_white = GcHeader::other_white(self.gc.current_white);
            let mut found = None;
            for &r in self.pool.strtab.bucket(hash) {
                // Strings condemned by the current sweep are not revivable.
                if self.pool.str_header(r).is_dead(other_white) && self.gc.state().is_sweep() {
                    continue;
                }
                if self.pool.str_(r).as_bytes() == bytes {
                    found = Some(r);
                    break;
                }
            }
            if let Some(r) = found {
                return Value::Str(r);
            }
            let s = Str::short(bytes, hash);
            let size = s.footprint();
            let header = self.gc.new_header(size);
            let r = self.pool.alloc_str(header, s);
            self.pool.strtab.insert(hash, r);
            self.gc.register(GcRef::Str(r), size as usize);
            Value::Str(r)
        } else {
            let s = Str::long(bytes.into());
            let size = s.footprint();
            let header = self.gc.new_header(size);
            let r = self.pool.alloc_str(header, s);
            self.gc.register(GcRef::Str(r), size as usize);
            Value::Str(r)
        }
    }

    pub fn create_string_str(&mut self, s: &str) -> Value {
        self.create_string(s.as_bytes())
    }

    /// A long string over a host-owned buffer; the buffer's `Drop` runs at
    /// finalization.
    pub fn create_external_string(&mut self, buf: Box<dyn ExternalBuffer>) -> Value {
        self.gc_checkpoint();
        let s = Str::external(buf);
        let size = s.footprint();
        let header = self.gc.new_header(size);
        let r = self.pool.alloc_str(header, s);
        self.gc.register(GcRef::Str(r), size as usize);
        Value::Str(r)
    }

    fn intern_pinned(&mut self, bytes: &[u8]) -> StrRef {
        let v = self.create_string(bytes);
        let r = v.as_str_ref().expect("interned string");
        self.pool.str_header_mut(r).set_fixed();
        r
    }

    pub(crate) fn new_table_raw(&mut self, narr: usize, nrec: usize) -> TableRef {
        self.gc_checkpoint();
        let t = Table::new(narr, nrec);
        let size = t.footprint();
        let header = self.gc.new_header(size);
        let r = self.pool.alloc_table(header, t);
        self.gc.register(GcRef::Table(r), size as usize);
        r
    }

    pub fn create_table(&mut self, narr: usize, nrec: usize) -> Value {
        Value::Table(self.new_table_raw(narr, nrec))
    }

    pub(crate) fn create_script_closure(
        &mut self,
        proto: Rc<Proto>,
        upvals: Vec<UpvalRef>,
    ) -> ClosureRef {
        self.gc_checkpoint();
        let c = Closure::Script(ScriptClosure { proto, upvals });
        let size = c.footprint();
        let header = self.gc.new_header(size);
        let r = self.pool.alloc_closure(header, c);
        self.gc.register(GcRef::Closure(r), size as usize);
        r
    }

    pub fn create_host_closure(&mut self, func: HostFn, upvals: Vec<Value>) -> Value {
        self.gc_checkpoint();
        let c = Closure::Host(HostClosure { func, upvals });
        let size = c.footprint();
        let header = self.gc.new_header(size);
        let r = self.pool.alloc_closure(header, c);
        self.gc.register(GcRef::Closure(r), size as usize);
        Value::Closure(r)
    }

    /// Wrap a `Proto` in a closure whose first upvalue (if any) is the
    /// globals table, the convention for top-level chunks.
    pub fn create_main_closure(&mut self, proto: Rc<Proto>) -> Value {
        let mut upvals = Vec::with_capacity(proto.upvals.len());
        for _ in 0..proto.upvals.len() {
            let uv = self.create_upvalue(Upvalue::Closed(Value::Nil));
            upvals.push(uv);
        }
        if let Some(&first) = upvals.first() {
            *self.pool.upvalue_mut(first) = Upvalue::Closed(Value::Table(self.globals));
        }
        Value::Closure(self.create_script_closure(proto, upvals))
    }

    pub(crate) fn create_upvalue(&mut self, u: Upvalue) -> UpvalRef {
        self.gc_checkpoint();
        let size = std::mem::size_of::<Upvalue>() as u32 + 16;
        let header = self.gc.new_header(size);
        let r = self.pool.alloc_upvalue(header, u);
        self.gc.register(GcRef::Upval(r), size as usize);
        r
    }

    pub fn create_thread(&mut self) -> Value {
        self.gc_checkpoint();
        let t = Thread::new();
        let size = t.footprint();
        let header = self.gc.new_header(size);
        let r = self.pool.alloc_thread(header, t);
        self.gc.register(GcRef::Thread(r), size as usize);
        Value::Thread(r)
    }

    pub fn create_userdata(&mut self, data: Box<dyn std::any::Any>, nuvalue: usize) -> Value {
        self.gc_checkpoint();
        let u = Userdata::new(data, nuvalue);
        let size = u.footprint();
        let header = self.gc.new_header(size);
        let r = self.pool.alloc_userdata(header, u);
        self.gc.register(GcRef::Userdata(r), size as usize);
        Value::Userdata(r)
    }

    // ================= errors =================

    /// Park an arbitrary error value and throw.
    pub fn throw_value(&mut self, v: Value) -> Error {
        self.th_mut().error_value = v;
        Error::Runtime
    }

    /// Raise a runtime error with a `source:line:` prefix when the current
    /// frame belongs to a script function.
    pub fn rt_error(&mut self, msg: &str) -> Error {
        let prefixed = match self.current_location() {
            Some((src, line)) => format!("{}:{}: {}", src, line, msg),
            None => msg.to_string(),
        };
        let v = self.create_string(prefixed.as_bytes());
        self.throw_value(v)
    }

    /// Source name and line of the active instruction, if known.
    pub(crate) fn current_location(&self) -> Option<(String, u32)> {
        let th = self.th();
        let ci = th.frames.last()?;
        if !ci.is_script() {
            return None;
        }
        let cr = th.stack[ci.func].as_closure_ref()?;
        let sc = self.pool.closure(cr).as_script()?;
        let pc = (ci.pc as usize).saturating_sub(1);
        let line = sc.proto.line_at(pc)?;
        Some((sc.proto.source.to_string(), line))
    }

    pub(crate) fn type_error(&mut self, action: &str, v: Value) -> Error {
        self.rt_error(&format!("attempt to {} a {} value", action, v.type_name()))
    }

    pub(crate) fn mem_error(&mut self) -> Error {
        // Try to free something first; this collection runs without
        // finalizers or barrier-driven allocation.
        let roots = self.gc_roots();
        self.gc.full_collection(&roots, &mut self.pool, true);
        self.th_mut().error_value = Value::Str(self.memerr);
        Error::Memory
    }

    /// Turn a thread-level resource failure into a proper throw.
    pub(crate) fn stack_error(&mut self, e: Error) -> Error {
        match e {
            Error::Memory => self.mem_error(),
            _ => self.rt_error("stack overflow"),
        }
    }

    // ================= warnings =================

    pub fn set_warn_handler(&mut self, f: Option<WarnHandler>) {
        self.warn_handler = f;
    }

    /// Emit a warning. Control messages ("@on"/"@off") toggle emission when
    /// no handler is installed; a handler sees everything.
    pub fn warning(&mut self, msg: &str, cont: bool) {
        if let Some(mut h) = self.warn_handler.take() {
            h(msg, cont);
            if self.warn_handler.is_none() {
                self.warn_handler = Some(h);
            }
        } else {
            match msg {
                "@on" => self.warn_on = true,
                "@off" => self.warn_on = false,
                _ => {
                    if self.warn_on {
                        eprintln!("warning: {}", msg);
                    }
                }
            }
        }
    }

    pub fn set_panic(&mut self, f: Option<PanicFn>) {
        self.panic_fn = f;
    }

    pub(crate) fn panic(&mut self, _e: Error) -> ! {
        if let Some(p) = self.panic_fn {
            p(self);
        }
        std::process::abort();
    }

    // ================= metatables & metamethods =================

    pub(crate) fn metatable_of(&self, v: Value) -> Option<TableRef> {
        match v {
            Value::Table(t) => self.pool.table(t).metatable,
            Value::Userdata(u) => self.pool.userdata_(u).metatable,
            other => self.type_mt[other.type_tag() as usize],
        }
    }

    /// Event lookup on a metatable, through the known-absent cache for the
    /// fast events.
    pub(crate) fn get_tm(&mut self, mt: TableRef, tm: Tm) -> Value {
        if tm.is_fast() && self.pool.table(mt).flags & (1 << (tm as u8)) != 0 {
            return Value::Nil;
        }
        let key = Value::Str(self.tm_refs[tm as usize]);
        let v = self.pool.table_rawget(mt, key);
        if v.is_nil() && tm.is_fast() {
            self.pool.table_mut(mt).flags |= 1 << (tm as u8);
        }
        v
    }

    pub(crate) fn get_metamethod(&mut self, v: Value, tm: Tm) -> Value {
        match self.metatable_of(v) {
            Some(mt) => self.get_tm(mt, tm),
            None => Value::Nil,
        }
    }

    /// Install a metatable on a table or userdata (or the type-wide slot for
    /// other types), wiring finalization and write barriers.
    pub fn set_metatable_of(&mut self, v: Value, mt: Option<TableRef>) -> VmResult<()> {
        if let Some(m) = mt {
            // A fresh cache for the new role.
            self.pool.table_mut(m).flags = 0;
        }
        match v {
            Value::Table(t) => {
                self.pool.table_mut(t).metatable = mt;
                if let Some(m) = mt {
                    self.gc
                        .barrier_forward(GcRef::Table(t), Value::Table(m), &mut self.pool);
                    if !self.get_tm(m, Tm::Gc).is_nil() {
                        self.gc.mark_for_finalization(GcRef::Table(t), &mut self.pool);
                    }
                }
            }
            Value::Userdata(u) => {
                self.pool.userdata_mut(u).metatable = mt;
                if let Some(m) = mt {
                    self.gc
                        .barrier_forward(GcRef::Userdata(u), Value::Table(m), &mut self.pool);
                    if !self.get_tm(m, Tm::Gc).is_nil() {
                        self.gc
                            .mark_for_finalization(GcRef::Userdata(u), &mut self.pool);
                    }
                }
            }
            other => {
                self.type_mt[other.type_tag() as usize] = mt;
            }
        }
        Ok(())
    }

    // ================= table access with metamethods =================

    /// `t[k]` with the full `__index` chain.
    pub fn index_get(&mut self, mut t: Value, k: Value) -> VmResult<Value> {
        for _ in 0..MAX_TAG_LOOP {
            let tm = if let Value::Table(tr) = t {
                let raw = self.pool.table_rawget(tr, k);
                if !raw.is_nil() {
                    return Ok(raw);
                }
                let Some(mt) = self.pool.table(tr).metatable else {
                    return Ok(Value::Nil);
                };
                let tm = self.get_tm(mt, Tm::Index);
                if tm.is_nil() {
                    return Ok(Value::Nil);
                }
                tm
            } else {
                let tm = self.get_metamethod(t, Tm::Index);
                if tm.is_nil() {
                    return Err(self.type_error("index", t));
                }
                tm
            };
            match tm {
                Value::Table(_) => t = tm, // re-dispatch on the handler table
                _ => return self.call_metamethod_2(tm, t, k),
            }
        }
        Err(self.rt_error("'__index' chain too long; possible loop"))
    }

    /// `t[k] = v` with the full `__newindex` chain.
    pub fn index_set(&mut self, mut t: Value, k: Value, v: Value) -> VmResult<()> {
        for _ in 0..MAX_TAG_LOOP {
            let tm = if let Value::Table(tr) = t {
                let existing = self.pool.table_rawget(tr, k);
                if !existing.is_nil() {
                    // Overwrite of a live entry skips the metamethod.
                    self.raw_set_with_barrier(tr, k, v)?;
                    return Ok(());
                }
                let mt = self.pool.table(tr).metatable;
                let tm = match mt {
                    Some(m) => self.get_tm(m, Tm::NewIndex),
                    None => Value::Nil,
                };
                if tm.is_nil() {
                    self.raw_set_with_barrier(tr, k, v)?;
                    return Ok(());
                }
                tm
            } else {
                let tm = self.get_metamethod(t, Tm::NewIndex);
                if tm.is_nil() {
                    return Err(self.type_error("index", t));
                }
                tm
            };
            match tm {
                Value::Table(_) => t = tm,
                _ => {
                    self.call_metamethod_3(tm, t, k, v)?;
                    return Ok(());
                }
            }
        }
        Err(self.rt_error("'__newindex' chain too long; possible loop"))
    }

    /// Raw store plus the table back barrier; rejects nil/NaN keys with a
    /// proper error.
    pub fn raw_set_with_barrier(&mut self, t: TableRef, k: Value, v: Value) -> VmResult<()> {
        use crate::value::table::KeyError;
        match self.pool.table_rawset(t, k, v) {
            Ok(()) => {
                if v.gc_ref().is_some() || k.gc_ref().is_some() {
                    self.gc.barrier_back(t, &mut self.pool);
                }
                Ok(())
            }
            Err(KeyError::NilKey) => Err(self.rt_error("table index is nil")),
            Err(KeyError::NanKey) => Err(self.rt_error("table index is NaN")),
        }
    }

    /// Stage a synchronous nested call above both the logical top and the
    /// current frame's ceiling, so live registers below stay untouched.
    fn stage_call(&mut self, f: Value, args: &[Value]) -> VmResult<(usize, usize)> {
        let saved_top = self.th().top;
        let func = saved_top.max(self.th().frame().top);
        self.ensure_stack_abs(func + 1 + args.len())?;
        let th = self.th_mut();
        th.stack[func] = f;
        for (i, &arg) in args.iter().enumerate() {
            th.stack[func + 1 + i] = arg;
        }
        th.top = func + 1 + args.len();
        Ok((func, saved_top))
    }

    /// One-argument call used by the error-handler path.
    pub(crate) fn call_function_1(&mut self, f: Value, a: Value) -> VmResult<Value> {
        let (func, saved_top) = self.stage_call(f, &[a])?;
        self.th_mut().nny += 1;
        let r = self.do_call_at(func, 1);
        self.th_mut().nny -= 1;
        r?;
        let v = self.stack_get(func);
        self.th_mut().top = saved_top;
        Ok(v)
    }

    /// Call a metamethod synchronously from runtime plumbing (not from the
    /// dispatch loop, which pushes frames instead). Non-yieldable.
    pub(crate) fn call_metamethod_2(&mut self, f: Value, a: Value, b: Value) -> VmResult<Value> {
        let (func, saved_top) = self.stage_call(f, &[a, b])?;
        self.th_mut().nny += 1;
        let r = self.do_call_at(func, 1);
        self.th_mut().nny -= 1;
        r?;
        let v = self.stack_get(func);
        self.th_mut().top = saved_top;
        Ok(v)
    }

    pub(crate) fn call_metamethod_3(
        &mut self,
        f: Value,
        a: Value,
        b: Value,
        c: Value,
    ) -> VmResult<()> {
        let (func, saved_top) = self.stage_call(f, &[a, b, c])?;
        self.th_mut().nny += 1;
        let r = self.do_call_at(func, 0);
        self.th_mut().nny -= 1;
        r?;
        self.th_mut().top = saved_top;
        Ok(())
    }

    // ================= equality / length / concat =================

    /// Full equality: raw, then `__eq` when both operands are tables or
    /// both are userdata. Never errors on mismatched types.
    pub fn values_equal(&mut self, a: Value, b: Value) -> VmResult<bool> {
        if self.pool.raw_eq(a, b) {
            return Ok(true);
        }
        let comparable = matches!(
            (a, b),
            (Value::Table(_), Value::Table(_)) | (Value::Userdata(_), Value::Userdata(_))
        );
        if !comparable {
            return Ok(false);
        }
        let mut tm = self.get_metamethod(a, Tm::Eq);
        if tm.is_nil() {
            tm = self.get_metamethod(b, Tm::Eq);
        }
        if tm.is_nil() {
            return Ok(false);
        }
        let r = self.call_metamethod_2(tm, a, b)?;
        Ok(r.is_truthy())
    }

    /// The `#` operator.
    pub fn value_length(&mut self, v: Value) -> VmResult<Value> {
        match v {
            Value::Str(s) => Ok(Value::Int(self.pool.str_(s).len() as i64)),
            Value::Table(t) => {
                let tm = self.get_metamethod(v, Tm::Len);
                if tm.is_nil() {
                    Ok(Value::Int(self.pool.table_length(t)))
                } else {
                    self.call_metamethod_2(tm, v, v)
                }
            }
            _ => {
                let tm = self.get_metamethod(v, Tm::Len);
                if tm.is_nil() {
                    Err(self.type_error("get length of", v))
                } else {
                    self.call_metamethod_2(tm, v, v)
                }
            }
        }
    }

    /// String/number concatenation of two values, or None when a
    /// metamethod is needed.
    pub(crate) fn concat_pair_raw(&mut self, a: Value, b: Value) -> Option<Value> {
        let sa = self.coerce_to_string_piece(a)?;
        let sb = self.coerce_to_string_piece(b)?;
        let mut bytes = Vec::with_capacity(sa.len() + sb.len());
        bytes.extend_from_slice(&sa);
        bytes.extend_from_slice(&sb);
        Some(self.create_string(&bytes))
    }

    fn coerce_to_string_piece(&self, v: Value) -> Option<Vec<u8>> {
        match v {
            Value::Str(s) => Some(self.pool.str_(s).as_bytes().to_vec()),
            Value::Int(i) => Some(number::int_to_string(i).into_bytes()),
            Value::Float(f) => Some(number::float_to_string(f).into_bytes()),
            _ => None,
        }
    }

    // ================= numeric coercions =================

    /// Arithmetic view of a value: numbers as themselves, strings through
    /// the number grammar.
    pub(crate) fn coerce_number(&self, v: Value) -> Option<Value> {
        match v {
            Value::Int(_) | Value::Float(_) => Some(v),
            Value::Str(s) => {
                let st = self.pool.str_(s);
                number::parse_number(std::str::from_utf8(st.as_bytes()).ok()?)
            }
            _ => None,
        }
    }

    pub(crate) fn coerce_integer(&self, v: Value) -> Option<i64> {
        match v {
            Value::Int(i) => Some(i),
            Value::Float(f) => float_to_exact_int(f),
            Value::Str(s) => {
                let st = self.pool.str_(s);
                number::parse_integer(std::str::from_utf8(st.as_bytes()).ok()?)
            }
            _ => None,
        }
    }

    /// tostring() semantics without `__tostring` (that belongs to the
    /// library layer): a display form for every value.
    pub fn display_value(&self, v: Value) -> String {
        match v {
            Value::Nil => "nil".to_string(),
            Value::Bool(b) => b.to_string(),
            Value::Int(i) => number::int_to_string(i),
            Value::Float(f) => number::float_to_string(f),
            Value::Str(s) => self.pool.str_(s).to_display().into_owned(),
            Value::Table(t) => format!("table: 0x{:08x}", t.0),
            Value::Closure(c) => format!("function: 0x{:08x}", c.0),
            Value::HostFn(f) => format!("function: builtin: 0x{:x}", f as usize),
            Value::Thread(t) => format!("thread: 0x{:08x}", t.0),
            Value::Userdata(u) => format!("userdata: 0x{:08x}", u.0),
            Value::LightUserdata(p) => format!("userdata: {:p}", p),
        }
    }

    // ================= upvalues =================

    /// Find or create the open upvalue cell for a stack slot of the
    /// current thread. The open list is kept sorted by descending slot.
    pub(crate) fn find_upvalue(&mut self, slot: usize) -> UpvalRef {
        let thread = self.current;
        {
            let th = self.th();
            for &uv in &th.open_upvals {
                match self.pool.upvalue(uv) {
                    Upvalue::Open { slot: s, .. } if *s == slot => return uv,
                    Upvalue::Open { slot: s, .. } if *s < slot => break,
                    _ => {}
                }
            }
        }
        let uv = self.create_upvalue(Upvalue::Open { thread, slot });
        let pos = {
            let th = self.th();
            let mut pos = th.open_upvals.len();
            for (i, &u) in th.open_upvals.iter().enumerate() {
                if let Upvalue::Open { slot: s, .. } = self.pool.upvalue(u) {
                    if *s < slot {
                        pos = i;
                        break;
                    }
                }
            }
            pos
        };
        self.th_mut().open_upvals.insert(pos, uv);
        uv
    }

    /// Close every open upvalue at or above `level`.
    pub(crate) fn close_upvalues(&mut self, level: usize) {
        loop {
            let Some(&uv) = self.th().open_upvals.first() else {
                return;
            };
            let slot = match self.pool.upvalue(uv) {
                Upvalue::Open { slot, .. } => *slot,
                Upvalue::Closed(_) => {
                    self.th_mut().open_upvals.remove(0);
                    continue;
                }
            };
            if slot < level {
                return;
            }
            let v = self.stack_get(slot);
            *self.pool.upvalue_mut(uv) = Upvalue::Closed(v);
            self.gc.barrier_forward(GcRef::Upval(uv), v, &mut self.pool);
            self.th_mut().open_upvals.remove(0);
        }
    }

    // ================= to-be-closed =================

    /// Mark a stack slot as to-be-closed. Nil and false are ignored; any
    /// other value must have a `__close` metamethod.
    pub fn mark_tbc(&mut self, slot: usize) -> VmResult<()> {
        let v = self.stack_get(slot);
        if v.is_falsy() {
            return Ok(());
        }
        let tm = self.get_metamethod(v, Tm::Close);
        if tm.is_nil() {
            return Err(self.rt_error(&format!(
                "variable '?' got a non-closable value ({})",
                v.type_name()
            )));
        }
        self.th_mut().tbc.push(slot);
        Ok(())
    }

    /// Close to-be-closed slots down to `level`, passing `err` (or nil) to
    /// each `__close`. An error from a handler supplants the one in flight
    /// and closing continues. Returns the surviving error, if any.
    pub(crate) fn close_tbc(&mut self, level: usize, mut err: Option<Error>) -> Option<Error> {
        while let Some(&slot) = self.th().tbc.last() {
            if slot < level {
                break;
            }
            self.th_mut().tbc.pop();
            let v = self.stack_get(slot);
            if v.is_falsy() {
                continue;
            }
            let tm = self.get_metamethod(v, Tm::Close);
            if tm.is_nil() {
                continue; // metatable changed since marking; nothing to run
            }
            let errval = match err {
                Some(_) => self.th().error_value,
                None => Value::Nil,
            };
            match self.call_metamethod_2(tm, v, errval) {
                Ok(_) => {}
                Err(e) => {
                    // The close handler's own failure takes over.
                    err = Some(e);
                }
            }
        }
        err
    }
}

impl Value {
    #[inline]
    pub(crate) fn as_closure_ref(&self) -> Option<ClosureRef> {
        match self {
            Value::Closure(r) => Some(*r),
            _ => None,
        }
    }

    #[inline]
    pub(crate) fn as_userdata_ref(&self) -> Option<UdRef> {
        match self {
            Value::Userdata(r) => Some(*r),
            _ => None,
        }
    }
}

/// Public type-name helper matching `type()`.
pub fn type_name_of(tag: TypeTag) -> &'static str {
    match tag {
        TypeTag::Nil => "nil",
        TypeTag::Boolean => "boolean",
        TypeTag::Number => "number",
        TypeTag::Str => "string",
        TypeTag::Table => "table",
        TypeTag::Function => "function",
        TypeTag::Userdata | TypeTag::LightUserdata => "userdata",
        TypeTag::Thread => "thread",
    }
}
