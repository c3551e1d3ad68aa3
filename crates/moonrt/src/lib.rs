// moonrt - an embeddable Lua-family runtime core.
//
// The crate covers the hard, interlocking pieces of the language runtime:
// the value model, the hybrid table engine with metatables, the incremental
// (optionally generational) tri-color collector, the register VM, and the
// coroutine/error fabric, all behind a stack-based host API. Compilation
// front ends and the standard libraries are separate components: the state
// consumes compiled `Proto` records and registers host functions.

#[cfg(test)]
mod test;

pub mod api;
pub mod gc;
pub mod limits;
pub mod value;
pub mod vm;

pub use api::load::{LoadMode, Reader, SliceReader};
pub use api::{upvalue_index, ArithApiOp, CompareOp, GcOp, REGISTRY_INDEX};
pub use gc::pool::{ClosureRef, StrRef, TableRef, ThreadRef, UdRef, UpvalRef};
pub use gc::{GcKind, GcState};
pub use value::func::{Proto, UpvalDesc};
pub use value::string::ExternalBuffer;
pub use value::{HostFn, TypeTag, Value};
pub use vm::error::{CoStatus, Error, VmResult};
pub use vm::opcode::{ArithOp, Instr};
pub use vm::{ChunkCompiler, Lua, ProtoCodec};
