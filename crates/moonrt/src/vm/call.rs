// Call setup and teardown, protected runs, and the coroutine fabric.
//
// Script calls never recurse in Rust: the dispatch loop walks the CallInfo
// chain. Rust nesting happens only at host boundaries (host functions,
// metamethod plumbing, protected runs, resume), guarded by a depth counter.
//
// A protected call snapshots (depth, top, tbc length, nny) and unwinds to
// the snapshot on a throw: message handler first (the frames are still
// intact, so a traceback handler sees everything), then to-be-closed slots,
// then the CallInfo chain and stack. A yield crossing a protected host
// frame leaves recovery data in that frame's CallInfo, so an error raised
// after the resume still finds its handler ("recover").

use crate::gc::pool::ThreadRef;
use crate::limits::{EXTRA_STACK, MAX_CALL_CHAIN, MAX_CALL_DEPTH, MAX_HOST_CALLS, MIN_STACK, MULTRET};
use crate::value::func::Closure;
use crate::value::Value;
use crate::vm::call_info::{call_flags, CallInfo, Continuation, ProtFrame};
use crate::vm::error::{Error, VmResult};
use crate::vm::execute::execute;
use crate::vm::metamethod::Tm;
use crate::vm::thread::{hook_mask, HookEvent, ThreadState};
use crate::vm::Lua;

/// What `precall` did with the callee.
pub(crate) enum Precalled {
    /// A script frame was pushed; the dispatch loop takes it from here.
    Script,
    /// A host function ran to completion (results already in place).
    HostDone,
}

impl Lua {
    /// Grow the current thread's stack so slots below `limit` are usable.
    pub(crate) fn ensure_stack_abs(&mut self, limit: usize) -> VmResult<()> {
        let top = self.th().top;
        let need = (limit + EXTRA_STACK).saturating_sub(top);
        match self.th_mut().ensure_stack(need) {
            Ok(()) => Ok(()),
            Err(e) => Err(self.stack_error(e)),
        }
    }

    pub(crate) fn fire_hook(&mut self, event: HookEvent) -> VmResult<()> {
        let Some(hook) = self.th().hook else {
            return Ok(());
        };
        self.th_mut().nny += 1;
        let r = hook(self, event);
        self.th_mut().nny -= 1;
        r
    }

    /// Prepare a call to the value at stack index `func` with `nargs`
    /// arguments above it. Resolves `__call` chains, pushes the CallInfo,
    /// and runs host functions to completion.
    pub(crate) fn precall(
        &mut self,
        mut func: usize,
        mut nargs: usize,
        nresults: i16,
    ) -> VmResult<Precalled> {
        // Non-callable values defer to their `__call` metamethod, with the
        // original value inserted as the first argument.
        let mut chain = 0;
        loop {
            let callee = self.stack_get(func);
            match callee {
                Value::Closure(_) | Value::HostFn(_) => break,
                _ => {
                    chain += 1;
                    if chain > MAX_CALL_CHAIN {
                        return Err(self.type_error("call", callee));
                    }
                    let tm = self.get_metamethod(callee, Tm::Call);
                    if tm.is_nil() {
                        return Err(self.type_error("call", callee));
                    }
                    self.ensure_stack_abs(self.th().top + 1)?;
                    let top = self.th().top;
                    let th = self.th_mut();
                    // Shift func and args up one slot to make room.
                    for i in (func..top).rev() {
                        th.stack[i + 1] = th.stack[i];
                    }
                    th.stack[func] = tm;
                    th.top = top + 1;
                    nargs += 1;
                }
            }
        }

        if self.th().depth() >= MAX_CALL_DEPTH {
            return Err(self.rt_error("stack overflow"));
        }

        let callee = self.stack_get(func);
        let script = match callee {
            Value::Closure(cr) => match self.pool.closure(cr) {
                Closure::Script(sc) => Some((sc.proto.clone(), func)),
                Closure::Host(_) => None,
            },
            _ => None,
        };

        if let Some((proto, func)) = script {
            let base = func + 1;
            let numparams = proto.num_params as usize;
            self.ensure_stack_abs(base + proto.max_stack as usize)?;
            let fire = {
                let th = self.th_mut();
                for i in nargs..numparams {
                    th.stack[base + i] = Value::Nil;
                }
                th.top = base + nargs.max(numparams);
                let top = base + proto.max_stack as usize;
                th.frames.push(CallInfo::script(func, base, top, nresults));
                th.hook_mask & hook_mask::CALL != 0
            };
            if fire {
                self.fire_hook(HookEvent::Call)?;
            }
            Ok(Precalled::Script)
        } else {
            self.call_host(func, nresults)?;
            Ok(Precalled::HostDone)
        }
    }

    /// Run a host function or host closure at `func` to completion,
    /// including result placement. On a yield, the frame stays for resume.
    fn call_host(&mut self, func: usize, nresults: i16) -> VmResult<()> {
        if self.th().host_calls as usize >= MAX_HOST_CALLS {
            return Err(self.rt_error("host call stack overflow"));
        }
        self.ensure_stack_abs(self.th().top + MIN_STACK)?;
        let f = match self.stack_get(func) {
            Value::HostFn(f) => f,
            Value::Closure(cr) => match self.pool.closure(cr) {
                Closure::Host(hc) => hc.func,
                Closure::Script(_) => unreachable!("script closure in host path"),
            },
            _ => unreachable!("non-callable in host path"),
        };
        let top = self.th().top;
        let fire = {
            let th = self.th_mut();
            th.frames
                .push(CallInfo::host(func, func + 1, top + MIN_STACK, nresults));
            th.host_calls += 1;
            th.hook_mask & hook_mask::CALL != 0
        };
        if fire {
            self.fire_hook(HookEvent::Call)?;
        }
        let r = f(self);
        self.th_mut().host_calls -= 1;
        match r {
            Ok(n) => {
                let first = self.th().top - n as usize;
                self.finish_call(first, n as usize)?;
                Ok(())
            }
            Err(e) => Err(e), // on yield the frame stays; on error, unwind pops it
        }
    }

    /// Move results into the caller's slots, pad or truncate to the
    /// expected count, and pop the frame.
    pub(crate) fn finish_call(&mut self, first_result: usize, nret: usize) -> VmResult<()> {
        if self.th().hook_mask & hook_mask::RET != 0 {
            self.fire_hook(HookEvent::Return)?;
        }
        let ci = self.th_mut().frames.pop().expect("no frame to finish");
        let dst = ci.func;
        let wanted = ci.nresults;
        let th = self.th_mut();
        let nmove = if wanted < 0 {
            nret
        } else {
            (wanted as usize).min(nret)
        };
        for i in 0..nmove {
            th.stack[dst + i] = th.stack[first_result + i];
        }
        if wanted >= 0 {
            for i in nmove..wanted as usize {
                th.stack[dst + i] = Value::Nil;
            }
            th.top = dst + wanted as usize;
        } else {
            th.top = dst + nret;
        }
        Ok(())
    }

    /// Call the value at `func` (arguments already above it) and run it to
    /// completion. Entry point for host-driven calls and metamethod
    /// plumbing; the dispatch loop has its own path.
    pub(crate) fn do_call_at(&mut self, func: usize, nresults: i16) -> VmResult<()> {
        let nargs = self.th().top - func - 1;
        let target_depth = self.th().depth();
        match self.precall(func, nargs, nresults)? {
            Precalled::HostDone => Ok(()),
            Precalled::Script => execute(self, target_depth),
        }
    }

    // ================= protected calls =================

    /// Protected call used by runtime plumbing (finalizers, API `pcall`
    /// without continuation). Non-yieldable body.
    pub(crate) fn protected_call_at(
        &mut self,
        func: usize,
        _nargs: usize,
        nresults: i16,
        errf: usize,
    ) -> Result<(), Error> {
        let snap = self.snapshot(func);
        self.th_mut().nny += 1;
        let r = self.do_call_at(func, nresults);
        self.th_mut().nny -= 1;
        match r {
            Ok(()) => Ok(()),
            Err(e) => {
                debug_assert!(e != Error::Yield, "yield through non-yieldable call");
                Err(self.unwind_protected(snap, e, errf))
            }
        }
    }

    /// Full pcall: yieldable when a continuation is supplied. `errf` is an
    /// absolute stack index (0 = no handler). On success results are in
    /// place; on error the stack holds the error value alone and the error
    /// code is returned.
    pub(crate) fn pcall_with_cont(
        &mut self,
        nargs: usize,
        nresults: i16,
        errf: usize,
        cont: Option<(Continuation, i64)>,
    ) -> Result<(), Error> {
        let func = self.th().top - nargs - 1;
        let snap = self.snapshot(func);
        let yieldable = self.th().nny == 0 && cont.is_some();
        // The frame being armed: the host frame issuing this pcall.
        let armed = if yieldable {
            let depth = self.th().depth();
            let idx = depth - 1;
            let ci = &mut self.th_mut().frames[idx];
            ci.flags |= call_flags::YPCALL;
            ci.cont = cont;
            ci.prot = Some(ProtFrame {
                err_func: errf,
                saved_top: func,
                saved_tbc: snap.tbc_len,
                saved_nny: snap.nny,
                saved_depth: depth,
            });
            Some(idx)
        } else {
            // Without a continuation the body must not yield across us.
            self.th_mut().nny += 1;
            None
        };
        let r = self.do_call_at(func, nresults);
        if armed.is_none() {
            self.th_mut().nny -= 1;
        }
        let disarm = |lua: &mut Lua| {
            if let Some(idx) = armed {
                let ci = &mut lua.th_mut().frames[idx];
                ci.flags &= !call_flags::YPCALL;
                ci.cont = None;
                ci.prot = None;
            }
        };
        match r {
            Ok(()) => {
                disarm(self);
                Ok(())
            }
            Err(Error::Yield) => Err(Error::Yield), // recovery data stays armed
            Err(e) => {
                disarm(self);
                Err(self.unwind_protected(snap, e, errf))
            }
        }
    }

    fn snapshot(&self, func: usize) -> ProtSnapshot {
        let th = self.th();
        ProtSnapshot {
            depth: th.depth(),
            top: func,
            tbc_len: th.tbc.len(),
            nny: th.nny,
        }
    }

    /// Unwind to a protected snapshot: message handler, to-be-closed
    /// slots, frames, stack. Leaves the error value alone on the stack.
    fn unwind_protected(&mut self, snap: ProtSnapshot, e: Error, errf: usize) -> Error {
        let mut status = e;
        // Run the message handler while the erroring frames still exist.
        if errf != 0 && status != Error::ErrErr && status != Error::Memory {
            status = self.run_error_handler(errf);
        }
        // Close pending slots with the (possibly transformed) error.
        if let Some(e2) = self.close_tbc(snap.top, Some(status)) {
            status = e2;
        }
        let tbc_len = snap.tbc_len.min(self.th().tbc.len());
        self.th_mut().tbc.truncate(tbc_len);
        self.close_upvalues(snap.top);
        let err_value = self.th().error_value;
        let th = self.th_mut();
        th.frames.truncate(snap.depth);
        th.nny = snap.nny;
        if th.stack.len() <= snap.top {
            // Should not happen; the slot was occupied by the callee.
            th.stack.resize(snap.top + 1, Value::Nil);
        }
        th.stack[snap.top] = err_value;
        th.top = snap.top + 1;
        status
    }

    /// Invoke the message handler on the current error value. A failing
    /// handler degrades the error to `ErrErr`.
    fn run_error_handler(&mut self, errf: usize) -> Error {
        let handler = self.stack_get(errf);
        let errval = self.th().error_value;
        self.th_mut().nny += 1;
        let r = self.call_function_1(handler, errval);
        self.th_mut().nny -= 1;
        match r {
            Ok(v) => {
                self.th_mut().error_value = v;
                Error::Runtime
            }
            Err(_) => {
                let v = self.create_string_str("error in error handling");
                self.th_mut().error_value = v;
                Error::ErrErr
            }
        }
    }

    // ================= coroutines =================

    /// Build a coroutine around a function value.
    pub fn create_coroutine(&mut self, func: Value) -> VmResult<Value> {
        let co = self.create_thread();
        let tr = co.as_thread_ref().expect("fresh thread");
        {
            let th = self.pool.thread_mut(tr);
            th.stack[0] = func;
            th.top = 1;
        }
        // The function reference lives in the new thread's stack now.
        self.gc
            .barrier_forward(crate::gc::pool::GcRef::Thread(tr), func, &mut self.pool);
        Ok(co)
    }

    /// Resume `co` with the top `nargs` values of the current thread as
    /// arguments (they are popped). On return, the transfer values (yields
    /// or final results) are pushed onto the current thread and their count
    /// returned; on error, the error value is pushed instead.
    pub fn resume_thread(&mut self, co: ThreadRef, nargs: usize) -> Result<usize, Error> {
        if co == self.current {
            return Err(self.resume_error("cannot resume non-suspended coroutine", nargs));
        }
        match self.pool.thread(co).state {
            ThreadState::Suspended => {}
            ThreadState::Dead => {
                return Err(self.resume_error("cannot resume dead coroutine", nargs));
            }
            _ => {
                return Err(self.resume_error("cannot resume non-suspended coroutine", nargs));
            }
        }

        // Move arguments across.
        let args_from = self.th().top - nargs;
        let mut args = Vec::with_capacity(nargs);
        for i in 0..nargs {
            args.push(self.stack_get(args_from + i));
        }
        self.th_mut().top = args_from;

        let prev = self.current;
        self.pool.thread_mut(prev).state = ThreadState::Normal;
        {
            let th = self.pool.thread_mut(co);
            th.state = ThreadState::Running;
            th.resumer = Some(prev);
            th.nny = 0;
        }
        self.current = co;

        let outcome = self.resume_body(args);

        // Hand control back.
        self.current = prev;
        self.pool.thread_mut(prev).state = ThreadState::Running;
        self.pool.thread_mut(co).resumer = None;

        let (n, finished) = match outcome {
            ResumeOutcome::Yielded(n) => (n, false),
            ResumeOutcome::Finished(n) => (n, true),
            ResumeOutcome::Failed(e) => {
                {
                    let coth = self.pool.thread_mut(co);
                    coth.state = ThreadState::Dead;
                    coth.fault = Some(e);
                }
                let errval = self.pool.thread(co).error_value;
                self.th_mut().error_value = errval;
                let _ = self.ensure_stack_abs(self.th().top + 1);
                self.th_mut().push(errval);
                return Err(e);
            }
        };
        // Pull the transfer values over.
        let mut vals = Vec::with_capacity(n);
        {
            let coth = self.pool.thread_mut(co);
            let from = coth.top - n;
            for i in 0..n {
                vals.push(coth.stack[from + i]);
            }
            coth.top = from;
            coth.state = if finished {
                ThreadState::Dead
            } else {
                ThreadState::Suspended
            };
        }
        self.ensure_stack_abs(self.th().top + n)?;
        for v in vals {
            self.th_mut().push(v);
        }
        Ok(n)
    }

    fn resume_error(&mut self, msg: &str, nargs: usize) -> Error {
        let top = self.th().top;
        self.th_mut().top = top - nargs;
        let v = self.create_string_str(msg);
        self.th_mut().push(v);
        Error::Runtime
    }

    fn resume_body(&mut self, args: Vec<Value>) -> ResumeOutcome {
        // Deliver the arguments.
        let nargs = args.len();
        if self.ensure_stack_abs(self.th().top + nargs + 1).is_err() {
            return ResumeOutcome::Failed(Error::Memory);
        }
        for v in args {
            self.th_mut().push(v);
        }

        if !self.th().started {
            self.th_mut().started = true;
            let r = self.precall(0, nargs, MULTRET);
            match r {
                Err(Error::Yield) => {
                    return ResumeOutcome::Yielded(self.take_transfer());
                }
                Err(e) => return self.resume_fail(e),
                Ok(Precalled::HostDone) => {}
                Ok(Precalled::Script) => {}
            }
        } else {
            // Suspended inside a host frame; finish it with the resume
            // arguments (or its continuation's results).
            if let Err(e) = self.finish_interrupted_host(nargs) {
                if e == Error::Yield {
                    return ResumeOutcome::Yielded(self.take_transfer());
                }
                return self.resume_fail(e);
            }
        }
        self.unroll()
    }

    /// Drive the coroutine until it finishes, yields, or dies.
    fn unroll(&mut self) -> ResumeOutcome {
        loop {
            if self.th().depth() == 0 {
                // The body returned; results were moved to the stack base.
                return ResumeOutcome::Finished(self.th().top);
            }
            if self.th().frame().is_host() {
                // A protected host frame whose body just completed.
                match self.finish_interrupted_host(0) {
                    Ok(()) => continue,
                    Err(Error::Yield) => {
                        return ResumeOutcome::Yielded(self.take_transfer());
                    }
                    Err(e) => match self.recover(e) {
                        Ok(()) => continue,
                        Err(e) => return self.resume_fail(e),
                    },
                }
            }
            match execute(self, 0) {
                Ok(()) => continue,
                Err(Error::Yield) => {
                    return ResumeOutcome::Yielded(self.take_transfer());
                }
                Err(Error::CloseThread) => {
                    return self.resume_fail(Error::CloseThread);
                }
                Err(e) => match self.recover(e) {
                    Ok(()) => continue,
                    Err(e) => return self.resume_fail(e),
                },
            }
        }
    }

    fn take_transfer(&mut self) -> usize {
        let n = self.th().transfer as usize;
        self.th_mut().transfer = 0;
        n
    }

    fn resume_fail(&mut self, e: Error) -> ResumeOutcome {
        // Dying threads still honor their to-be-closed slots.
        if let Some(e2) = self.close_tbc(0, Some(e)) {
            let _ = e2;
        }
        self.close_upvalues(0);
        self.th_mut().frames.clear();
        let errval = self.th().error_value;
        let th = self.th_mut();
        th.stack[0] = errval;
        th.top = 1;
        ResumeOutcome::Failed(e)
    }

    /// Finish the host frame on top of the stack after a resume: run its
    /// continuation if it has one, otherwise the resume arguments become
    /// its results.
    fn finish_interrupted_host(&mut self, nargs: usize) -> VmResult<()> {
        let ci_cont = self.th().frame().cont;
        match ci_cont {
            Some((k, ctx)) => {
                let n = k(self, ctx, Ok(()))?;
                let first = self.th().top - n as usize;
                self.finish_call(first, n as usize)
            }
            None => {
                let first = self.th().top - nargs;
                self.finish_call(first, nargs)
            }
        }
    }

    /// After an error in a resumed coroutine, find the innermost protected
    /// host frame and unwind into it.
    fn recover(&mut self, e: Error) -> Result<(), Error> {
        let idx = {
            let th = self.th();
            th.frames
                .iter()
                .rposition(|ci| ci.flags & call_flags::YPCALL != 0 && ci.prot.is_some())
        };
        let Some(idx) = idx else {
            return Err(e);
        };
        let (prot, cont) = {
            let ci = &mut self.th_mut().frames[idx];
            ci.flags &= !call_flags::YPCALL;
            let prot = ci.prot.take().expect("armed protected frame");
            let cont = ci.cont.take();
            (prot, cont)
        };
        let snap = ProtSnapshot {
            depth: idx + 1,
            top: prot.saved_top,
            tbc_len: prot.saved_tbc,
            nny: prot.saved_nny,
        };
        let status = self.unwind_protected(snap, e, prot.err_func);
        // Let the protected frame wrap up through its continuation. A
        // continuation that itself raises keeps unwinding outward.
        if let Some((k, ctx)) = cont {
            match k(self, ctx, Err(status)) {
                Ok(n) => {
                    let first = self.th().top - n as usize;
                    self.finish_call(first, n as usize)?;
                }
                Err(e2) => return self.recover(e2),
            }
        }
        Ok(())
    }

    /// Yield the top `nvals` values of the current thread. Returns the
    /// status the caller must propagate.
    pub fn do_yield(&mut self, nvals: u32) -> Error {
        if self.current == self.main {
            return self.rt_error("attempt to yield from outside a coroutine");
        }
        if self.th().nny > 0 {
            return self.rt_error("attempt to yield across a non-yieldable call boundary");
        }
        self.th_mut().transfer = nvals;
        Error::Yield
    }

    /// Close a suspended or dead coroutine: run its pending to-be-closed
    /// handlers, clear its frames, and mark it dead. An error raised by a
    /// handler is pushed on the current thread and returned.
    pub fn close_coroutine(&mut self, co: ThreadRef) -> Result<(), Error> {
        if co == self.current || self.pool.thread(co).resumer.is_some() {
            let v = self.create_string_str("cannot close a running coroutine");
            return Err(self.throw_value(v));
        }
        let prev = self.current;
        self.current = co;
        let status = self.close_tbc(0, None);
        self.close_upvalues(0);
        {
            let th = self.th_mut();
            th.frames.clear();
            th.top = 0;
            th.state = ThreadState::Dead;
        }
        let errval = self.th().error_value;
        self.current = prev;
        match status {
            None => Ok(()),
            Some(e) => {
                self.th_mut().error_value = errval;
                let _ = self.ensure_stack_abs(self.th().top + 1);
                self.th_mut().push(errval);
                Err(e)
            }
        }
    }

    /// Coroutine status as the host sees it.
    pub fn thread_status(&self, co: ThreadRef) -> crate::vm::error::CoStatus {
        use crate::vm::error::CoStatus;
        if co == self.current {
            return CoStatus::Running;
        }
        let th = self.pool.thread(co);
        match th.state {
            ThreadState::Dead => CoStatus::Dead,
            ThreadState::Normal | ThreadState::Running => CoStatus::Normal,
            ThreadState::Suspended => CoStatus::Suspended,
        }
    }

    pub fn is_yieldable(&self) -> bool {
        self.current != self.main && self.th().nny == 0
    }
}

struct ProtSnapshot {
    depth: usize,
    top: usize,
    tbc_len: usize,
    nny: u32,
}

enum ResumeOutcome {
    Yielded(usize),
    Finished(usize),
    Failed(Error),
}
