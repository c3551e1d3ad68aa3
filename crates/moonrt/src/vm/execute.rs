// The dispatch loop.
//
// One flat loop drives every script frame of the current thread: calls push
// a CallInfo and jump back to the frame loader, returns pop one and resume
// the caller at its saved pc. No Rust recursion per script call, so tail
// calls run in constant stack and a yield can unwind to the resume point
// without losing interpreter state: everything lives in CallInfo.
//
// Metamethods triggered by instructions are dispatched as real frames. The
// interrupted instruction records what remains to be done in the caller's
// `pending` slot (copy a result, decide a comparison, keep folding a
// concat); the frame loader completes it when control returns, which also
// makes these operations transparent to yields inside script metamethods.
// Host metamethods run inline under a non-yieldable guard.

use std::rc::Rc;

use crate::limits::MAX_TAG_LOOP;
use crate::value::func::{Closure, Proto, Upvalue};
use crate::value::Value;
use crate::vm::arith::{
    self, float_only, int_arith, is_bitwise, num_le, num_lt, value_to_shift_int, ArithFail,
};
use crate::vm::call::Precalled;
use crate::vm::call_info::{call_flags, PendingOp};
use crate::vm::error::VmResult;
use crate::vm::metamethod::Tm;
use crate::vm::opcode::{ArithOp, Instr};
use crate::vm::thread::{hook_mask, HookEvent};
use crate::vm::Lua;

/// How an instruction that may call out resolved.
enum Dispatch {
    /// Finished inline; keep dispatching.
    Done,
    /// A frame was pushed (or popped); reload frame state.
    Reenter,
}

/// Run script frames of the current thread until the CallInfo chain is back
/// at `target_depth`. Returns early (Ok) when a host frame surfaces on top,
/// which happens only while a resume is unrolling a protected call.
pub(crate) fn execute(lua: &mut Lua, target_depth: usize) -> VmResult<()> {
    'startfunc: loop {
        if lua.th().depth() <= target_depth {
            return Ok(());
        }
        if lua.th().frame().is_host() {
            return Ok(());
        }

        // Finish an instruction that was interrupted by a metamethod frame.
        if let Some(p) = lua.th_mut().frame_mut().pending.take() {
            match complete_pending(lua, p)? {
                Dispatch::Done => {}
                Dispatch::Reenter => continue 'startfunc,
            }
        }

        // ===== load frame state =====
        let (func_idx, mut base, mut pc) = {
            let ci = lua.th().frame();
            (ci.func, ci.base, ci.pc as usize)
        };
        let cr = lua
            .stack_get(func_idx)
            .as_closure_ref()
            .expect("script frame without closure");
        let (proto, upvals): (Rc<Proto>, Vec<crate::gc::pool::UpvalRef>) =
            match lua.pool.closure(cr) {
                Closure::Script(sc) => (sc.proto.clone(), sc.upvals.clone()),
                Closure::Host(_) => unreachable!("host closure in script frame"),
            };

        // ===== dispatch =====
        loop {
            let instr = proto.code[pc];
            pc += 1;
            lua.th_mut().frame_mut().pc = pc as u32;

            if lua.th().trap {
                instruction_hooks(lua, &proto, pc)?;
            }

            match instr {
                Instr::Move { a, b } => {
                    let v = lua.stack_get(base + b as usize);
                    lua.stack_set(base + a as usize, v);
                }
                Instr::LoadK { a, k } => {
                    lua.stack_set(base + a as usize, proto.constants[k as usize]);
                }
                Instr::LoadInt { a, imm } => {
                    lua.stack_set(base + a as usize, Value::Int(imm as i64));
                }
                Instr::LoadFloat { a, imm } => {
                    lua.stack_set(base + a as usize, Value::Float(imm as f64));
                }
                Instr::LoadBool { a, b } => {
                    lua.stack_set(base + a as usize, Value::Bool(b));
                }
                Instr::LoadNil { a, n } => {
                    for i in 0..=n as usize {
                        lua.stack_set(base + a as usize + i, Value::Nil);
                    }
                }

                Instr::GetUpval { a, b } => {
                    let v = read_upvalue(lua, upvals[b as usize]);
                    lua.stack_set(base + a as usize, v);
                }
                Instr::SetUpval { a, b } => {
                    let v = lua.stack_get(base + b as usize);
                    write_upvalue(lua, upvals[a as usize], v);
                }
                Instr::GetTabUp { a, b, k } => {
                    let t = read_upvalue(lua, upvals[b as usize]);
                    let key = proto.constants[k as usize];
                    match finish_get(lua, base, t, key, a)? {
                        Dispatch::Done => {}
                        Dispatch::Reenter => continue 'startfunc,
                    }
                }
                Instr::SetTabUp { a, k, b } => {
                    let t = read_upvalue(lua, upvals[a as usize]);
                    let key = proto.constants[k as usize];
                    let v = lua.stack_get(base + b as usize);
                    match finish_set(lua, t, key, v)? {
                        Dispatch::Done => {}
                        Dispatch::Reenter => continue 'startfunc,
                    }
                }

                Instr::GetTable { a, b, c } => {
                    let t = lua.stack_get(base + b as usize);
                    let key = lua.stack_get(base + c as usize);
                    match finish_get(lua, base, t, key, a)? {
                        Dispatch::Done => {}
                        Dispatch::Reenter => continue 'startfunc,
                    }
                }
                Instr::GetIndex { a, b, i } => {
                    let t = lua.stack_get(base + b as usize);
                    match finish_get(lua, base, t, Value::Int(i as i64), a)? {
                        Dispatch::Done => {}
                        Dispatch::Reenter => continue 'startfunc,
                    }
                }
                Instr::GetField { a, b, k } => {
                    let t = lua.stack_get(base + b as usize);
                    let key = proto.constants[k as usize];
                    match finish_get(lua, base, t, key, a)? {
                        Dispatch::Done => {}
                        Dispatch::Reenter => continue 'startfunc,
                    }
                }
                Instr::SetTable { a, b, c } => {
                    let t = lua.stack_get(base + a as usize);
                    let key = lua.stack_get(base + b as usize);
                    let v = lua.stack_get(base + c as usize);
                    match finish_set(lua, t, key, v)? {
                        Dispatch::Done => {}
                        Dispatch::Reenter => continue 'startfunc,
                    }
                }
                Instr::SetIndex { a, i, c } => {
                    let t = lua.stack_get(base + a as usize);
                    let v = lua.stack_get(base + c as usize);
                    match finish_set(lua, t, Value::Int(i as i64), v)? {
                        Dispatch::Done => {}
                        Dispatch::Reenter => continue 'startfunc,
                    }
                }
                Instr::SetField { a, k, c } => {
                    let t = lua.stack_get(base + a as usize);
                    let key = proto.constants[k as usize];
                    let v = lua.stack_get(base + c as usize);
                    match finish_set(lua, t, key, v)? {
                        Dispatch::Done => {}
                        Dispatch::Reenter => continue 'startfunc,
                    }
                }
                Instr::NewTable { a, narr, nrec } => {
                    let t = lua.create_table(narr as usize, nrec as usize);
                    lua.stack_set(base + a as usize, t);
                }
                Instr::SelfField { a, b, k } => {
                    let t = lua.stack_get(base + b as usize);
                    lua.stack_set(base + a as usize + 1, t);
                    let key = proto.constants[k as usize];
                    match finish_get(lua, base, t, key, a)? {
                        Dispatch::Done => {}
                        Dispatch::Reenter => continue 'startfunc,
                    }
                }

                Instr::Arith { op, a, b, c } => {
                    let vb = lua.stack_get(base + b as usize);
                    let vc = lua.stack_get(base + c as usize);
                    match op_arith(lua, base, op, a, vb, vc)? {
                        Dispatch::Done => {}
                        Dispatch::Reenter => continue 'startfunc,
                    }
                }
                Instr::Unm { a, b } => {
                    let v = lua.stack_get(base + b as usize);
                    let out = match v {
                        Value::Int(i) => Some(Value::Int(i.wrapping_neg())),
                        Value::Float(f) => Some(Value::Float(-f)),
                        _ => match lua.coerce_number(v) {
                            Some(Value::Int(i)) => Some(Value::Int(i.wrapping_neg())),
                            Some(Value::Float(f)) => Some(Value::Float(-f)),
                            _ => None,
                        },
                    };
                    match out {
                        Some(r) => lua.stack_set(base + a as usize, r),
                        None => {
                            match dispatch_unop(lua, Tm::Unm, v, a)? {
                                Dispatch::Done => {}
                                Dispatch::Reenter => continue 'startfunc,
                            }
                        }
                    }
                }
                Instr::BNot { a, b } => {
                    let v = lua.stack_get(base + b as usize);
                    match value_to_shift_int(v) {
                        Some(i) => lua.stack_set(base + a as usize, Value::Int(!i)),
                        None => {
                            match dispatch_unop(lua, Tm::BNot, v, a)? {
                                Dispatch::Done => {}
                                Dispatch::Reenter => continue 'startfunc,
                            }
                        }
                    }
                }
                Instr::Not { a, b } => {
                    let v = lua.stack_get(base + b as usize);
                    lua.stack_set(base + a as usize, Value::Bool(v.is_falsy()));
                }
                Instr::Len { a, b } => {
                    let v = lua.stack_get(base + b as usize);
                    match op_len(lua, base, v, a)? {
                        Dispatch::Done => {}
                        Dispatch::Reenter => continue 'startfunc,
                    }
                }
                Instr::Concat { a, n } => {
                    match concat_step(lua, base, a, n)? {
                        Dispatch::Done => {}
                        Dispatch::Reenter => continue 'startfunc,
                    }
                }

                Instr::Jmp { off } => {
                    pc = (pc as i64 + off as i64) as usize;
                }
                Instr::Eq { a, b, expect } => {
                    let va = lua.stack_get(base + a as usize);
                    let vb = lua.stack_get(base + b as usize);
                    match op_eq(lua, va, vb, expect)? {
                        Some(skip) => {
                            if skip {
                                pc += 1;
                            }
                        }
                        None => continue 'startfunc, // __eq frame pushed
                    }
                }
                Instr::Lt { a, b, expect } => {
                    let va = lua.stack_get(base + a as usize);
                    let vb = lua.stack_get(base + b as usize);
                    match op_order(lua, va, vb, expect, false)? {
                        Some(skip) => {
                            if skip {
                                pc += 1;
                            }
                        }
                        None => continue 'startfunc,
                    }
                }
                Instr::Le { a, b, expect } => {
                    let va = lua.stack_get(base + a as usize);
                    let vb = lua.stack_get(base + b as usize);
                    match op_order(lua, va, vb, expect, true)? {
                        Some(skip) => {
                            if skip {
                                pc += 1;
                            }
                        }
                        None => continue 'startfunc,
                    }
                }
                Instr::Test { a, expect } => {
                    let v = lua.stack_get(base + a as usize);
                    if v.is_truthy() != expect {
                        pc += 1;
                    }
                }
                Instr::TestSet { a, b, expect } => {
                    let v = lua.stack_get(base + b as usize);
                    if v.is_truthy() == expect {
                        lua.stack_set(base + a as usize, v);
                    } else {
                        pc += 1;
                    }
                }

                Instr::Call { a, nargs, nres } => {
                    let func_abs = base + a as usize;
                    let nargs_actual = if nargs < 0 {
                        lua.th().top - func_abs - 1
                    } else {
                        lua.th_mut().top = func_abs + 1 + nargs as usize;
                        nargs as usize
                    };
                    match lua.precall(func_abs, nargs_actual, nres)? {
                        Precalled::Script => continue 'startfunc,
                        Precalled::HostDone => {}
                    }
                }
                Instr::TailCall { a, nargs } => {
                    let nargs_actual = if nargs < 0 {
                        lua.th().top - (base + a as usize) - 1
                    } else {
                        // As with Return: callee and args stay below the
                        // working top while this frame's scope closes.
                        lua.th_mut().top = base + a as usize + 1 + nargs as usize;
                        nargs as usize
                    };
                    op_tailcall(lua, &proto, base, a, nargs_actual)?;
                    continue 'startfunc;
                }
                Instr::Return { a, nres } => {
                    let first = base + a as usize;
                    let nret = if nres < 0 {
                        lua.th().top - first
                    } else {
                        // Keep the results below any frames `__close` pushes.
                        lua.th_mut().top = first + nres as usize;
                        nres as usize
                    };
                    // Scope exit: open upvalues close, pending slots run.
                    lua.close_upvalues(base);
                    if let Some(e) = lua.close_tbc(base, None) {
                        return Err(e);
                    }
                    if proto.is_vararg {
                        let ci = lua.th_mut().frame_mut();
                        ci.func -= ci.nextraargs as usize + proto.num_params as usize + 1;
                    }
                    lua.finish_call(first, nret)?;
                    continue 'startfunc;
                }

                Instr::ForPrep { a, jump } => {
                    match op_forprep(lua, base, a)? {
                        true => pc += jump as usize, // empty loop
                        false => {}
                    }
                }
                Instr::ForLoop { a, back } => {
                    if op_forloop(lua, base, a) {
                        pc -= back as usize;
                    }
                }
                Instr::TForPrep { a, jump } => {
                    let slot = base + a as usize + 3;
                    if !lua.stack_get(slot).is_falsy() {
                        lua.mark_tbc(slot)?;
                    }
                    pc += jump as usize;
                }
                Instr::TForCall { a, nres } => {
                    let ra = base + a as usize;
                    lua.ensure_stack_abs(ra + 7)?;
                    let (f, s, ctl) = (
                        lua.stack_get(ra),
                        lua.stack_get(ra + 1),
                        lua.stack_get(ra + 2),
                    );
                    lua.stack_set(ra + 4, f);
                    lua.stack_set(ra + 5, s);
                    lua.stack_set(ra + 6, ctl);
                    lua.th_mut().top = ra + 7;
                    match lua.precall(ra + 4, 2, nres as i16)? {
                        Precalled::Script => continue 'startfunc,
                        Precalled::HostDone => {}
                    }
                }
                Instr::TForLoop { a, back } => {
                    let ra = base + a as usize;
                    let v = lua.stack_get(ra + 4);
                    if !v.is_nil() {
                        lua.stack_set(ra + 2, v);
                        pc -= back as usize;
                    }
                }

                Instr::SetList { a, n, start } => {
                    let ra = base + a as usize;
                    let count = if n == 0 {
                        lua.th().top - ra - 1
                    } else {
                        n as usize
                    };
                    let t = match lua.stack_get(ra) {
                        Value::Table(t) => t,
                        other => return Err(lua.type_error("index", other)),
                    };
                    for i in 0..count {
                        let v = lua.stack_get(ra + 1 + i);
                        let key = Value::Int(start as i64 + i as i64 + 1);
                        lua.raw_set_with_barrier(t, key, v)?;
                    }
                    let ci_top = lua.th().frame().top;
                    lua.th_mut().top = ci_top;
                }
                Instr::MakeClosure { a, p } => {
                    let child = proto.protos[p as usize].clone();
                    let mut child_upvals = Vec::with_capacity(child.upvals.len());
                    for desc in &child.upvals {
                        if desc.in_stack {
                            child_upvals.push(lua.find_upvalue(base + desc.index as usize));
                        } else {
                            child_upvals.push(upvals[desc.index as usize]);
                        }
                    }
                    let c = lua.create_script_closure(child, child_upvals);
                    lua.stack_set(base + a as usize, Value::Closure(c));
                }
                Instr::Vararg { a, want } => {
                    let ci = lua.th().frame();
                    let n = ci.nextraargs as usize;
                    let func = ci.func;
                    let ra = base + a as usize;
                    let copy = if want < 0 { n } else { (want as usize).min(n) };
                    let total = if want < 0 { n } else { want as usize };
                    lua.ensure_stack_abs(ra + total.max(1))?;
                    for i in 0..copy {
                        let v = lua.stack_get(func - n + i);
                        lua.stack_set(ra + i, v);
                    }
                    for i in copy..total {
                        lua.stack_set(ra + i, Value::Nil);
                    }
                    if want < 0 {
                        lua.th_mut().top = ra + n;
                    }
                }
                Instr::VarargPrep => {
                    base = op_varargprep(lua, &proto)?;
                }
                Instr::Close { a } => {
                    let level = base + a as usize;
                    lua.close_upvalues(level);
                    if let Some(e) = lua.close_tbc(level, None) {
                        return Err(e);
                    }
                }
                Instr::Tbc { a } => {
                    lua.mark_tbc(base + a as usize)?;
                }
            }

            // Persist a pc mutated by jumps before the next fetch, so a
            // yield or error sees a consistent frame.
            lua.th_mut().frame_mut().pc = pc as u32;
        }
    }
}

// ================= frame helpers =================

fn read_upvalue(lua: &Lua, uv: crate::gc::pool::UpvalRef) -> Value {
    match lua.pool.upvalue(uv) {
        Upvalue::Open { thread, slot } => lua.pool.thread(*thread).stack[*slot],
        Upvalue::Closed(v) => *v,
    }
}

fn write_upvalue(lua: &mut Lua, uv: crate::gc::pool::UpvalRef, v: Value) {
    let open = match lua.pool.upvalue(uv) {
        Upvalue::Open { thread, slot } => Some((*thread, *slot)),
        Upvalue::Closed(_) => None,
    };
    match open {
        Some((thread, slot)) => {
            lua.pool.thread_mut(thread).stack[slot] = v;
        }
        None => {
            *lua.pool.upvalue_mut(uv) = Upvalue::Closed(v);
        }
    }
    lua.gc
        .barrier_forward(crate::gc::pool::GcRef::Upval(uv), v, &mut lua.pool);
}

/// Relocate a vararg frame: the callee and its fixed parameters move above
/// the supplied arguments, which become the hidden vararg area.
fn op_varargprep(lua: &mut Lua, proto: &Proto) -> VmResult<usize> {
    let (func, base) = {
        let ci = lua.th().frame();
        (ci.func, ci.base)
    };
    let nfixed = proto.num_params as usize;
    let actual = lua.th().top - base;
    let extra = actual - nfixed;
    let new_func = func + 1 + actual;
    lua.ensure_stack_abs(new_func + 1 + proto.max_stack as usize)?;
    let th = lua.th_mut();
    th.stack[new_func] = th.stack[func];
    for i in 0..nfixed {
        th.stack[new_func + 1 + i] = th.stack[base + i];
        th.stack[base + i] = Value::Nil;
    }
    let new_base = new_func + 1;
    th.top = new_base + nfixed;
    let ci = th.frames.last_mut().expect("vararg frame");
    ci.func = new_func;
    ci.base = new_base;
    ci.top = new_base + proto.max_stack as usize;
    ci.nextraargs = extra as u32;
    Ok(new_base)
}

fn op_tailcall(
    lua: &mut Lua,
    proto: &Proto,
    base: usize,
    a: u8,
    nargs: usize,
) -> VmResult<()> {
    lua.close_upvalues(base);
    if let Some(e) = lua.close_tbc(base, None) {
        return Err(e);
    }
    let fire = lua.th().hook_mask & hook_mask::TAILCALL != 0;
    if fire {
        lua.fire_hook(HookEvent::TailCall)?;
    }
    let (func_pos, nresults) = {
        let ci = lua.th_mut().frame_mut();
        if proto.is_vararg {
            ci.func -= ci.nextraargs as usize + proto.num_params as usize + 1;
        }
        (ci.func, ci.nresults)
    };
    // Slide callee and arguments into the vanishing frame's slot.
    let src = base + a as usize;
    {
        let th = lua.th_mut();
        for i in 0..=nargs {
            th.stack[func_pos + i] = th.stack[src + i];
        }
        th.top = func_pos + 1 + nargs;
        th.frames.pop();
    }
    match lua.precall(func_pos, nargs, nresults)? {
        Precalled::Script => {
            lua.th_mut().frame_mut().flags |= call_flags::TAIL;
            Ok(())
        }
        Precalled::HostDone => Ok(()),
    }
}

// ================= metamethod dispatch =================

/// Push a metamethod call frame above the current frame's ceiling and
/// record how to finish the interrupted instruction. Host metamethods run
/// inline (non-yieldable); the pending op still completes at reentry.
fn call_tm_frame(
    lua: &mut Lua,
    f: Value,
    args: &[Value],
    pending: PendingOp,
    nresults: i16,
) -> VmResult<Dispatch> {
    let ci_top = lua.th().frame().top;
    lua.ensure_stack_abs(ci_top + 1 + args.len())?;
    let caller = lua.th().depth() - 1;
    {
        let th = lua.th_mut();
        th.stack[ci_top] = f;
        for (i, &arg) in args.iter().enumerate() {
            th.stack[ci_top + 1 + i] = arg;
        }
        th.top = ci_top + 1 + args.len();
    }
    lua.th_mut().nny += 1;
    let r = lua.precall(ci_top, args.len(), nresults);
    lua.th_mut().nny -= 1;
    r?;
    lua.th_mut().frames[caller].pending = Some(pending);
    Ok(Dispatch::Reenter)
}

/// Complete an instruction whose metamethod frame has returned.
fn complete_pending(lua: &mut Lua, p: PendingOp) -> VmResult<Dispatch> {
    let (base, ci_top) = {
        let ci = lua.th().frame();
        (ci.base, ci.top)
    };
    match p {
        PendingOp::GetResult { dst, res } => {
            let v = lua.stack_get(res);
            lua.stack_set(base + dst as usize, v);
            lua.th_mut().top = ci_top;
            Ok(Dispatch::Done)
        }
        PendingOp::Restore => {
            lua.th_mut().top = ci_top;
            Ok(Dispatch::Done)
        }
        PendingOp::Compare {
            expect,
            negate,
            res,
        } => {
            let mut cond = lua.stack_get(res).is_truthy();
            if negate {
                cond = !cond;
            }
            lua.th_mut().top = ci_top;
            if cond != expect {
                lua.th_mut().frame_mut().pc += 1;
            }
            Ok(Dispatch::Done)
        }
        PendingOp::Concat { a, n, res } => {
            let v = lua.stack_get(res);
            lua.stack_set(base + a as usize + n as usize - 1, v);
            lua.th_mut().top = ci_top;
            concat_step(lua, base, a, n)
        }
    }
}

fn finish_get(lua: &mut Lua, base: usize, mut t: Value, k: Value, dst: u8) -> VmResult<Dispatch> {
    for _ in 0..MAX_TAG_LOOP {
        let tm = if let Value::Table(tr) = t {
            let v = lua.pool.table_rawget(tr, k);
            if !v.is_nil() {
                lua.stack_set(base + dst as usize, v);
                return Ok(Dispatch::Done);
            }
            let Some(mt) = lua.pool.table(tr).metatable else {
                lua.stack_set(base + dst as usize, Value::Nil);
                return Ok(Dispatch::Done);
            };
            let tm = lua.get_tm(mt, Tm::Index);
            if tm.is_nil() {
                lua.stack_set(base + dst as usize, Value::Nil);
                return Ok(Dispatch::Done);
            }
            tm
        } else {
            let tm = lua.get_metamethod(t, Tm::Index);
            if tm.is_nil() {
                return Err(lua.type_error("index", t));
            }
            tm
        };
        if matches!(tm, Value::Table(_)) {
            t = tm;
            continue;
        }
        let res = lua.th().frame().top;
        return call_tm_frame(lua, tm, &[t, k], PendingOp::GetResult { dst, res }, 1);
    }
    Err(lua.rt_error("'__index' chain too long; possible loop"))
}

fn finish_set(lua: &mut Lua, mut t: Value, k: Value, v: Value) -> VmResult<Dispatch> {
    for _ in 0..MAX_TAG_LOOP {
        let tm = if let Value::Table(tr) = t {
            let existing = lua.pool.table_rawget(tr, k);
            if !existing.is_nil() {
                lua.raw_set_with_barrier(tr, k, v)?;
                return Ok(Dispatch::Done);
            }
            let mt = lua.pool.table(tr).metatable;
            let tm = match mt {
                Some(m) => lua.get_tm(m, Tm::NewIndex),
                None => Value::Nil,
            };
            if tm.is_nil() {
                lua.raw_set_with_barrier(tr, k, v)?;
                return Ok(Dispatch::Done);
            }
            tm
        } else {
            let tm = lua.get_metamethod(t, Tm::NewIndex);
            if tm.is_nil() {
                return Err(lua.type_error("index", t));
            }
            tm
        };
        if matches!(tm, Value::Table(_)) {
            t = tm;
            continue;
        }
        return call_tm_frame(lua, tm, &[t, k, v], PendingOp::Restore, 0);
    }
    Err(lua.rt_error("'__newindex' chain too long; possible loop"))
}

fn dispatch_binop(
    lua: &mut Lua,
    tm: Tm,
    vb: Value,
    vc: Value,
    dst: u8,
) -> VmResult<Dispatch> {
    let mut handler = lua.get_metamethod(vb, tm);
    if handler.is_nil() {
        handler = lua.get_metamethod(vc, tm);
    }
    if handler.is_nil() {
        let culprit = if lua.coerce_number(vb).is_none() { vb } else { vc };
        let what = if matches!(
            tm,
            Tm::BAnd | Tm::BOr | Tm::BXor | Tm::Shl | Tm::Shr | Tm::BNot
        ) {
            "perform bitwise operation on"
        } else {
            "perform arithmetic on"
        };
        return Err(lua.type_error(what, culprit));
    }
    let res = lua.th().frame().top;
    call_tm_frame(lua, handler, &[vb, vc], PendingOp::GetResult { dst, res }, 1)
}

fn dispatch_unop(lua: &mut Lua, tm: Tm, v: Value, dst: u8) -> VmResult<Dispatch> {
    let handler = lua.get_metamethod(v, tm);
    if handler.is_nil() {
        let what = if tm == Tm::BNot {
            "perform bitwise operation on"
        } else {
            "perform arithmetic on"
        };
        return Err(lua.type_error(what, v));
    }
    let res = lua.th().frame().top;
    call_tm_frame(lua, handler, &[v, v], PendingOp::GetResult { dst, res }, 1)
}

fn op_arith(
    lua: &mut Lua,
    base: usize,
    op: ArithOp,
    a: u8,
    vb: Value,
    vc: Value,
) -> VmResult<Dispatch> {
    // Integer fast path.
    if let (Value::Int(x), Value::Int(y)) = (vb, vc) {
        if !float_only(op) {
            match int_arith(op, x, y) {
                Ok(r) => {
                    lua.stack_set(base + a as usize, Value::Int(r));
                    return Ok(Dispatch::Done);
                }
                Err(ArithFail::DivByZero) => {
                    let what = if op == ArithOp::Mod { "'n%0'" } else { "'n//0'" };
                    return Err(lua.rt_error(&format!("attempt to perform {}", what)));
                }
                Err(_) => {}
            }
        }
    }
    // Number path (strings coerce here).
    let nb = lua.coerce_number(vb);
    let nc = lua.coerce_number(vc);
    if let (Some(nb), Some(nc)) = (nb, nc) {
        if is_bitwise(op) {
            match (value_to_shift_int(nb), value_to_shift_int(nc)) {
                (Some(x), Some(y)) => {
                    let r = int_arith(op, x, y).expect("bitwise never fails");
                    lua.stack_set(base + a as usize, Value::Int(r));
                    return Ok(Dispatch::Done);
                }
                _ => {
                    return Err(lua.rt_error("number has no integer representation"));
                }
            }
        }
        if let (Value::Int(x), Value::Int(y)) = (nb, nc) {
            if !float_only(op) {
                return match int_arith(op, x, y) {
                    Ok(r) => {
                        lua.stack_set(base + a as usize, Value::Int(r));
                        Ok(Dispatch::Done)
                    }
                    Err(ArithFail::DivByZero) => {
                        let what = if op == ArithOp::Mod { "'n%0'" } else { "'n//0'" };
                        Err(lua.rt_error(&format!("attempt to perform {}", what)))
                    }
                    Err(_) => unreachable!(),
                };
            }
        }
        let x = to_f64(nb);
        let y = to_f64(nc);
        lua.stack_set(base + a as usize, Value::Float(arith::float_arith(op, x, y)));
        return Ok(Dispatch::Done);
    }
    dispatch_binop(lua, Tm::from(op), vb, vc, a)
}

fn to_f64(v: Value) -> f64 {
    match v {
        Value::Int(i) => i as f64,
        Value::Float(f) => f,
        _ => unreachable!("coerced number"),
    }
}

fn op_len(lua: &mut Lua, base: usize, v: Value, dst: u8) -> VmResult<Dispatch> {
    match v {
        Value::Str(s) => {
            let n = lua.pool.str_(s).len() as i64;
            lua.stack_set(base + dst as usize, Value::Int(n));
            Ok(Dispatch::Done)
        }
        Value::Table(t) => {
            let tm = lua.get_metamethod(v, Tm::Len);
            if tm.is_nil() {
                let n = lua.pool.table_length(t);
                lua.stack_set(base + dst as usize, Value::Int(n));
                Ok(Dispatch::Done)
            } else {
                let res = lua.th().frame().top;
                call_tm_frame(lua, tm, &[v, v], PendingOp::GetResult { dst, res }, 1)
            }
        }
        _ => {
            let tm = lua.get_metamethod(v, Tm::Len);
            if tm.is_nil() {
                return Err(lua.type_error("get length of", v));
            }
            let res = lua.th().frame().top;
            call_tm_frame(lua, tm, &[v, v], PendingOp::GetResult { dst, res }, 1)
        }
    }
}

/// Raw/metamethod equality. `Some(skip)` when decided inline, `None` when
/// an `__eq` frame was pushed.
fn op_eq(lua: &mut Lua, va: Value, vb: Value, expect: bool) -> VmResult<Option<bool>> {
    if lua.pool.raw_eq(va, vb) {
        return Ok(Some(true != expect));
    }
    let comparable = matches!(
        (va, vb),
        (Value::Table(_), Value::Table(_)) | (Value::Userdata(_), Value::Userdata(_))
    );
    if comparable {
        let mut tm = lua.get_metamethod(va, Tm::Eq);
        if tm.is_nil() {
            tm = lua.get_metamethod(vb, Tm::Eq);
        }
        if !tm.is_nil() {
            let res = lua.th().frame().top;
            call_tm_frame(
                lua,
                tm,
                &[va, vb],
                PendingOp::Compare {
                    expect,
                    negate: false,
                    res,
                },
                1,
            )?;
            return Ok(None);
        }
    }
    Ok(Some(false != expect))
}

/// `<` / `<=`, numeric then bytewise-string, then `__lt`/`__le` (with the
/// `not (b < a)` fallback when `__le` is absent).
fn op_order(
    lua: &mut Lua,
    va: Value,
    vb: Value,
    expect: bool,
    le: bool,
) -> VmResult<Option<bool>> {
    let direct = if le { num_le(va, vb) } else { num_lt(va, vb) };
    if let Some(cond) = direct {
        return Ok(Some(cond != expect));
    }
    if let (Value::Str(x), Value::Str(y)) = (va, vb) {
        let (bx, by) = (lua.pool.str_(x).as_bytes(), lua.pool.str_(y).as_bytes());
        let cond = if le { bx <= by } else { bx < by };
        return Ok(Some(cond != expect));
    }
    let tm_kind = if le { Tm::Le } else { Tm::Lt };
    let mut tm = lua.get_metamethod(va, tm_kind);
    if tm.is_nil() {
        tm = lua.get_metamethod(vb, tm_kind);
    }
    if !tm.is_nil() {
        let res = lua.th().frame().top;
        call_tm_frame(
            lua,
            tm,
            &[va, vb],
            PendingOp::Compare {
                expect,
                negate: false,
                res,
            },
            1,
        )?;
        return Ok(None);
    }
    if le {
        // __le fallback: a <= b iff not (b < a).
        let mut tm = lua.get_metamethod(va, Tm::Lt);
        if tm.is_nil() {
            tm = lua.get_metamethod(vb, Tm::Lt);
        }
        if !tm.is_nil() {
            let res = lua.th().frame().top;
            call_tm_frame(
                lua,
                tm,
                &[vb, va],
                PendingOp::Compare {
                    expect,
                    negate: true,
                    res,
                },
                1,
            )?;
            return Ok(None);
        }
    }
    Err(lua.rt_error(&format!(
        "attempt to compare {} with {}",
        va.type_name(),
        vb.type_name()
    )))
}

/// Fold `R[a..a+n]` right-associatively, dispatching `__concat` when a pair
/// resists direct concatenation.
fn concat_step(lua: &mut Lua, base: usize, a: u8, mut n: u8) -> VmResult<Dispatch> {
    while n > 1 {
        let bpos = base + a as usize + n as usize - 2;
        let vb = lua.stack_get(bpos);
        let vc = lua.stack_get(bpos + 1);
        if let Some(joined) = lua.concat_pair_raw(vb, vc) {
            lua.stack_set(bpos, joined);
            n -= 1;
            continue;
        }
        let mut tm = lua.get_metamethod(vb, Tm::Concat);
        if tm.is_nil() {
            tm = lua.get_metamethod(vc, Tm::Concat);
        }
        if tm.is_nil() {
            let culprit = if matches!(vb, Value::Str(_) | Value::Int(_) | Value::Float(_)) {
                vc
            } else {
                vb
            };
            return Err(lua.type_error("concatenate", culprit));
        }
        let res = lua.th().frame().top;
        return call_tm_frame(
            lua,
            tm,
            &[vb, vc],
            PendingOp::Concat { a, n: n - 1, res },
            1,
        );
    }
    Ok(Dispatch::Done)
}

// ================= numeric for =================

/// Returns true when the loop body must be skipped entirely.
fn op_forprep(lua: &mut Lua, base: usize, a: u8) -> VmResult<bool> {
    let ra = base + a as usize;
    let init = lua.stack_get(ra);
    let limit = lua.stack_get(ra + 1);
    let step = lua.stack_get(ra + 2);
    if let (Value::Int(i0), Value::Int(l), Value::Int(s)) = (init, limit, step) {
        if s == 0 {
            return Err(lua.rt_error("'for' step is zero"));
        }
        let empty = if s > 0 { i0 > l } else { i0 < l };
        if empty {
            return Ok(true);
        }
        // Precompute the trip count in unsigned arithmetic so the counter
        // itself can never wrap past the limit.
        let count = if s > 0 {
            (l as u64).wrapping_sub(i0 as u64) / (s as u64)
        } else {
            (i0 as u64).wrapping_sub(l as u64) / s.unsigned_abs()
        };
        lua.stack_set(ra + 1, Value::Int(count as i64));
        lua.stack_set(ra + 3, Value::Int(i0));
        Ok(false)
    } else {
        let to_num = |lua: &mut Lua, v: Value, what: &str| -> VmResult<f64> {
            match lua.coerce_number(v) {
                Some(Value::Int(i)) => Ok(i as f64),
                Some(Value::Float(f)) => Ok(f),
                _ => Err(lua.rt_error(&format!("'for' {} must be a number", what))),
            }
        };
        let i0 = to_num(lua, init, "initial value")?;
        let l = to_num(lua, limit, "limit")?;
        let s = to_num(lua, step, "step")?;
        if s == 0.0 {
            return Err(lua.rt_error("'for' step is zero"));
        }
        let empty = if s > 0.0 { i0 > l } else { i0 < l };
        if empty {
            return Ok(true);
        }
        lua.stack_set(ra, Value::Float(i0));
        lua.stack_set(ra + 1, Value::Float(l));
        lua.stack_set(ra + 2, Value::Float(s));
        lua.stack_set(ra + 3, Value::Float(i0));
        Ok(false)
    }
}

/// Returns true when the loop continues (jump back).
fn op_forloop(lua: &mut Lua, base: usize, a: u8) -> bool {
    let ra = base + a as usize;
    match lua.stack_get(ra + 2) {
        Value::Int(s) => {
            let count = match lua.stack_get(ra + 1) {
                Value::Int(c) => c as u64,
                _ => 0,
            };
            if count == 0 {
                return false;
            }
            lua.stack_set(ra + 1, Value::Int((count - 1) as i64));
            let i = match lua.stack_get(ra) {
                Value::Int(i) => i,
                _ => return false,
            };
            let ni = i.wrapping_add(s);
            lua.stack_set(ra, Value::Int(ni));
            lua.stack_set(ra + 3, Value::Int(ni));
            true
        }
        Value::Float(s) => {
            let i = match lua.stack_get(ra) {
                Value::Float(f) => f,
                _ => return false,
            };
            let l = match lua.stack_get(ra + 1) {
                Value::Float(f) => f,
                _ => return false,
            };
            let ni = i + s;
            let cont = if s > 0.0 { ni <= l } else { ni >= l };
            if cont {
                lua.stack_set(ra, Value::Float(ni));
                lua.stack_set(ra + 3, Value::Float(ni));
            }
            cont
        }
        _ => false,
    }
}

// ================= hooks =================

fn instruction_hooks(lua: &mut Lua, proto: &Proto, pc: usize) -> VmResult<()> {
    let mask = lua.th().hook_mask;
    if mask & hook_mask::COUNT != 0 {
        let fire = {
            let th = lua.th_mut();
            if th.hook_count > 0 {
                th.hook_count -= 1;
            }
            th.hook_count == 0
        };
        if fire {
            let reset = lua.th().hook_base_count.max(1);
            lua.th_mut().hook_count = reset;
            lua.fire_hook(HookEvent::Count)?;
        }
    }
    if mask & hook_mask::LINE != 0 {
        let cur = proto.line_at(pc.saturating_sub(1));
        let prev = if pc >= 2 { proto.line_at(pc - 2) } else { None };
        if let Some(line) = cur {
            if prev != cur {
                lua.fire_hook(HookEvent::Line(line))?;
            }
        }
    }
    Ok(())
}
