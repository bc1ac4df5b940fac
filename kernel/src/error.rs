//! Kernel error type shared by every subsystem.
//!
//! Syscall handlers flatten these into negative return codes; everything
//! inside the kernel propagates them as `Result<T>`.

use core::fmt;

/// Common error type used throughout the kernel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// No physical page / kernel object could be allocated
    OutOfMemory,
    /// Malformed argument or an operation that makes no sense in this state
    Invalid,
    /// A memory access could not be resolved
    Fault,
    /// Named object does not exist (or is not mapped where required)
    NotFound,
    /// Named object already exists
    Exists,
    /// Region still has live mappings
    Mapped,
    /// Region is persistent and the destroy was not forced
    Persist,
    /// Caller has no child matching the wait request
    NoChild,
    /// Write on a pipe with no readers left
    BrokenPipe,
    /// Non-blocking lock attempt lost the race
    LockBusy,
    /// Operation exists in the ABI but is not implemented here
    NotSupported,
}

impl Error {
    /// Stable negative code reported through the syscall boundary.
    pub fn code(self) -> i64 {
        match self {
            Error::OutOfMemory => -1,
            Error::Invalid => -2,
            Error::Fault => -3,
            Error::NotFound => -4,
            Error::Exists => -5,
            Error::Mapped => -6,
            Error::Persist => -7,
            Error::NoChild => -8,
            Error::BrokenPipe => -9,
            Error::LockBusy => -10,
            Error::NotSupported => -11,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::OutOfMemory => write!(f, "out of memory"),
            Error::Invalid => write!(f, "invalid argument"),
            Error::Fault => write!(f, "unresolvable memory access"),
            Error::NotFound => write!(f, "not found"),
            Error::Exists => write!(f, "already exists"),
            Error::Mapped => write!(f, "region still mapped"),
            Error::Persist => write!(f, "region is persistent"),
            Error::NoChild => write!(f, "no matching child"),
            Error::BrokenPipe => write!(f, "pipe has no readers"),
            Error::LockBusy => write!(f, "lock is busy"),
            Error::NotSupported => write!(f, "not supported"),
        }
    }
}

/// Result type for operations that can fail
pub type Result<T> = core::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_negative_and_distinct() {
        let all = [
            Error::OutOfMemory,
            Error::Invalid,
            Error::Fault,
            Error::NotFound,
            Error::Exists,
            Error::Mapped,
            Error::Persist,
            Error::NoChild,
            Error::BrokenPipe,
            Error::LockBusy,
            Error::NotSupported,
        ];
        for (i, a) in all.iter().enumerate() {
            assert!(a.code() < 0);
            for b in &all[i + 1..] {
                assert_ne!(a.code(), b.code());
            }
        }
    }
}
