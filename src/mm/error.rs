//! Error codes shared across the memory subsystem.

/// Small integer error code propagated by the allocators and fault handlers.
///
/// Mirrors the taxonomy the rest of the kernel (schedulers, IPC, syscalls)
/// expects from a memory-subsystem call: allocation failure, bad arguments,
/// missing objects, permission violations, and the two non-fatal "try again"
/// codes a caller is expected to retry on.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Error {
    OutOfMemory,
    Invalid,
    NotFound,
    Exists,
    Permission,
    Fault,
    NoSys,
    Again,
    Busy,
}

pub type Result<T> = core::result::Result<T, Error>;

impl core::fmt::Display for Error {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let s = match self {
            Error::OutOfMemory => "out of memory",
            Error::Invalid => "invalid argument",
            Error::NotFound => "not found",
            Error::Exists => "already exists",
            Error::Permission => "permission denied",
            Error::Fault => "fault",
            Error::NoSys => "not implemented",
            Error::Again => "try again",
            Error::Busy => "busy",
        };
        f.write_str(s)
    }
}

/// Outcome of resolving a page fault: success, a block-and-retry request to
/// the scheduler, or a fatal error that should kill the faulting task.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FaultOutcome {
    Ok,
    Deferred,
    Fatal(Error),
}
