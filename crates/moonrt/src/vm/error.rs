// Error signalling.
//
// The non-local channel through the interpreter is a Copy status enum; the
// actual error *value* (any Value, typically a string) is parked in the
// faulting thread. Unwinding is explicit early-return, so CallInfo pops and
// `__close` calls are never skipped by a throw.

/// Status codes carried through `Result`. `Yield` shares the channel: a
/// coroutine yield unwinds host frames exactly like an error, but is not one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// Runtime error; error value in the thread.
    Runtime,
    /// Allocation failure after an emergency collection.
    Memory,
    /// The error handler itself errored.
    ErrErr,
    /// Load/parse failure.
    Syntax,
    /// File-level failure reported by a loader.
    File,
    /// Coroutine suspension (not an error).
    Yield,
    /// Internal: a coroutine close unwinds past every protected frame.
    CloseThread,
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Error::Runtime => "runtime error",
            Error::Memory => "not enough memory",
            Error::ErrErr => "error in error handling",
            Error::Syntax => "syntax error",
            Error::File => "file error",
            Error::Yield => "yield",
            Error::CloseThread => "thread closed",
        };
        f.write_str(s)
    }
}

impl std::error::Error for Error {}

pub type VmResult<T> = Result<T, Error>;

/// Coroutine status as reported to the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoStatus {
    /// Suspended at a yield, or not started.
    Suspended,
    /// The thread driving execution right now.
    Running,
    /// Alive but resumed someone else.
    Normal,
    /// Finished or failed.
    Dead,
}
