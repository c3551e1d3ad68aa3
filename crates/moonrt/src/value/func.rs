// Compiled functions, closures, and upvalue cells.

use std::rc::Rc;

use smol_str::SmolStr;

use crate::gc::pool::{ThreadRef, UpvalRef};
use crate::value::{HostFn, Value};
use crate::vm::opcode::Instr;

/// Where an upvalue of a nested function comes from.
#[derive(Debug, Clone, Copy)]
pub struct UpvalDesc {
    /// True: a local (register) of the enclosing function; false: one of the
    /// enclosing function's own upvalues.
    pub in_stack: bool,
    pub index: u8,
}

/// The immutable compiled form of one script function. Produced by a
/// compiler front end (or assembled by hand); the runtime never mutates it.
pub struct Proto {
    pub code: Vec<Instr>,
    pub constants: Vec<Value>,
    pub protos: Vec<Rc<Proto>>,
    pub upvals: Vec<UpvalDesc>,
    /// Source line per instruction; may be empty when debug info is stripped.
    pub line_info: Vec<u32>,
    pub source: SmolStr,
    pub num_params: u8,
    pub is_vararg: bool,
    /// Registers this function needs; frames reserve exactly this many.
    pub max_stack: u8,
}

impl Proto {
    pub fn line_at(&self, pc: usize) -> Option<u32> {
        self.line_info.get(pc).copied()
    }
}

/// An upvalue cell. Open cells name a live stack slot of the owning thread;
/// closed cells own their value. Cells are shared between closures.
pub enum Upvalue {
    Open { thread: ThreadRef, slot: usize },
    Closed(Value),
}

pub struct ScriptClosure {
    pub proto: Rc<Proto>,
    pub upvals: Vec<UpvalRef>,
}

/// A host function plus captured values. The captures are plain values owned
/// by the closure, not shared cells.
pub struct HostClosure {
    pub func: HostFn,
    pub upvals: Vec<Value>,
}

pub enum Closure {
    Script(ScriptClosure),
    Host(HostClosure),
}

impl Closure {
    #[inline]
    pub fn as_script(&self) -> Option<&ScriptClosure> {
        match self {
            Closure::Script(c) => Some(c),
            Closure::Host(_) => None,
        }
    }

    pub fn footprint(&self) -> u32 {
        let upvals = match self {
            Closure::Script(c) => c.upvals.len(),
            Closure::Host(c) => c.upvals.len(),
        };
        (std::mem::size_of::<Closure>() + upvals * std::mem::size_of::<Value>()) as u32
    }
}
