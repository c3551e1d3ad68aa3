// One activation record per call on a thread.

use crate::vm::error::{Error, VmResult};
use crate::vm::Lua;

/// Frame status bits.
pub mod call_flags {
    /// Script function frame (has a pc).
    pub const SCRIPT: u32 = 1 << 0;
    /// Host function frame.
    pub const HOST: u32 = 1 << 1;
    /// Frame entered through a tail call (caller frame already gone).
    pub const TAIL: u32 = 1 << 2;
    /// Protected host frame that can recover after a yield crossed it.
    pub const YPCALL: u32 = 1 << 3;
    /// Frame is running a `__close` handler.
    pub const CLOSING: u32 = 1 << 4;
}

/// Continuation for a host frame interrupted by a yield: called on resume
/// with the status of the interrupted body, returns the frame's result
/// count like a host function would.
pub type Continuation = fn(&mut Lua, ctx: i64, status: Result<(), Error>) -> VmResult<u32>;

/// An operation of this frame interrupted by a metamethod call; completed
/// when control returns to the frame (also after a yield inside the
/// metamethod, since everything needed lives here and not in Rust locals).
#[derive(Debug, Clone, Copy)]
pub enum PendingOp {
    /// Copy the single result at `res` into R[dst], then restore the top.
    GetResult { dst: u8, res: usize },
    /// Restore the top; the metamethod was called for effect.
    Restore,
    /// Truthiness of the result at `res` decides a conditional skip, as the
    /// comparison opcodes do; `negate` flips it (the `__le`-via-`__lt`
    /// fallback).
    Compare { expect: bool, negate: bool, res: usize },
    /// A `Concat` fold was interrupted; the result at `res` replaces
    /// R[dst] and folding continues over R[a..a+n].
    Concat { a: u8, n: u8, res: usize },
}

/// Saved state for unwinding a protected frame.
#[derive(Debug, Clone, Copy)]
pub struct ProtFrame {
    /// Absolute stack index of the message handler; 0 = none.
    pub err_func: usize,
    pub saved_top: usize,
    pub saved_tbc: usize,
    pub saved_nny: u32,
    /// CallInfo depth to unwind to (the protected frame itself).
    pub saved_depth: usize,
}

pub struct CallInfo {
    /// Absolute stack index of the callee value. Vararg frames relocate it
    /// upward at `VarargPrep` and restore it at `Return`.
    pub func: usize,
    /// First register of the frame (`func + 1`).
    pub base: usize,
    /// Frame ceiling: registers live in `base..top`.
    pub top: usize,
    /// Next instruction (script frames).
    pub pc: u32,
    /// Results the caller expects; -1 = all.
    pub nresults: i16,
    pub flags: u32,
    /// Extra (vararg) arguments stashed below the relocated function slot.
    pub nextraargs: u32,
    /// Host continuation + its context, for yields across this frame.
    pub cont: Option<(Continuation, i64)>,
    /// Set while this host frame runs a protected call.
    pub prot: Option<ProtFrame>,
    /// Interrupted operation to finish when control returns here.
    pub pending: Option<PendingOp>,
}

impl CallInfo {
    pub fn script(func: usize, base: usize, top: usize, nresults: i16) -> Self {
        CallInfo {
            func,
            base,
            top,
            pc: 0,
            nresults,
            flags: call_flags::SCRIPT,
            nextraargs: 0,
            cont: None,
            prot: None,
            pending: None,
        }
    }

    pub fn host(func: usize, base: usize, top: usize, nresults: i16) -> Self {
        CallInfo {
            func,
            base,
            top,
            pc: 0,
            nresults,
            flags: call_flags::HOST,
            nextraargs: 0,
            cont: None,
            prot: None,
            pending: None,
        }
    }

    #[inline(always)]
    pub fn is_script(&self) -> bool {
        self.flags & call_flags::SCRIPT != 0
    }

    #[inline(always)]
    pub fn is_host(&self) -> bool {
        self.flags & call_flags::HOST != 0
    }
}
