//! Kernel error taxonomy
//!
//! Every kernel operation returns `Result<T, KernelError>`. The numeric
//! `code()` is what lands in a process's last-error cell and what the SVC
//! surface reports; `ERROR_OK` and `ERROR_SYNC` are the two non-error codes.

use core::fmt;

use crate::pool::PoolError;

/// Operation completed
pub const ERROR_OK: u32 = 0;
/// Operation accepted, response will arrive asynchronously
pub const ERROR_SYNC: u32 = 1;

/// Why the kernel gave up
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PanicReason {
    /// The root process was destroyed or faulted
    RootProcessDestroyed,
    /// Kernel metadata failed validation
    CorruptedObject,
    /// A fault arrived that no process could be blamed for
    UnattributedFault,
    /// An internal precondition did not hold
    Assertion,
}

/// Kernel errors
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum KernelError {
    /// Private pool exhausted
    OutOfMemory,
    /// No system pool can satisfy the request
    OutOfSystemMemory,
    AlreadyConfigured,
    NotConfigured,
    /// Target process is not active
    NotActive,
    InvalidState,
    InvalidParams,
    /// Caller does not own or hold the object, or the address is outside its memory
    AccessDenied,
    /// Handle does not name a live object of the expected kind
    InvalidMagic,
    /// Operation would wait on itself
    Deadlock,
    /// Object destroyed while the caller waited on it
    SyncObjectDestroyed,
    Timeout,
    /// Bounded queue is full
    Overflow,
    /// Pool metadata failed validation
    PoolCorrupted,
    /// Nothing matched a non-blocking query
    NotFound,
    /// Kernel-fatal condition; the runtime takes the panic path
    Panic(PanicReason),
}

impl KernelError {
    /// Numeric code stored in the last-error cell
    pub fn code(self) -> u32 {
        match self {
            KernelError::OutOfMemory => 2,
            KernelError::OutOfSystemMemory => 3,
            KernelError::AlreadyConfigured => 4,
            KernelError::NotConfigured => 5,
            KernelError::NotActive => 6,
            KernelError::InvalidState => 7,
            KernelError::InvalidParams => 8,
            KernelError::AccessDenied => 9,
            KernelError::InvalidMagic => 10,
            KernelError::Deadlock => 11,
            KernelError::SyncObjectDestroyed => 12,
            KernelError::Timeout => 13,
            KernelError::Overflow => 14,
            KernelError::PoolCorrupted => 15,
            KernelError::NotFound => 16,
            KernelError::Panic(_) => 0xFF,
        }
    }

    pub fn is_fatal(self) -> bool {
        matches!(self, KernelError::Panic(_))
    }
}

impl fmt::Display for PanicReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PanicReason::RootProcessDestroyed => f.write_str("root process destroyed"),
            PanicReason::CorruptedObject => f.write_str("corrupted kernel object"),
            PanicReason::UnattributedFault => f.write_str("unattributed fault"),
            PanicReason::Assertion => f.write_str("assertion failed"),
        }
    }
}

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KernelError::OutOfMemory => f.write_str("out of memory"),
            KernelError::OutOfSystemMemory => f.write_str("out of system memory"),
            KernelError::AlreadyConfigured => f.write_str("already configured"),
            KernelError::NotConfigured => f.write_str("not configured"),
            KernelError::NotActive => f.write_str("process not active"),
            KernelError::InvalidState => f.write_str("invalid state"),
            KernelError::InvalidParams => f.write_str("invalid parameters"),
            KernelError::AccessDenied => f.write_str("access denied"),
            KernelError::InvalidMagic => f.write_str("invalid object handle"),
            KernelError::Deadlock => f.write_str("deadlock"),
            KernelError::SyncObjectDestroyed => f.write_str("sync object destroyed"),
            KernelError::Timeout => f.write_str("timeout"),
            KernelError::Overflow => f.write_str("queue overflow"),
            KernelError::PoolCorrupted => f.write_str("pool corrupted"),
            KernelError::NotFound => f.write_str("not found"),
            KernelError::Panic(reason) => write!(f, "kernel panic: {}", reason),
        }
    }
}

impl From<PoolError> for KernelError {
    fn from(err: PoolError) -> Self {
        match err {
            PoolError::OutOfMemory => KernelError::OutOfMemory,
            PoolError::InvalidSize => KernelError::InvalidParams,
            PoolError::Corrupted(_) => KernelError::PoolCorrupted,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::string::ToString;

    #[test]
    fn test_codes_are_distinct_from_ok_and_sync() {
        let all = [
            KernelError::OutOfMemory,
            KernelError::OutOfSystemMemory,
            KernelError::AlreadyConfigured,
            KernelError::NotConfigured,
            KernelError::NotActive,
            KernelError::InvalidState,
            KernelError::InvalidParams,
            KernelError::AccessDenied,
            KernelError::InvalidMagic,
            KernelError::Deadlock,
            KernelError::SyncObjectDestroyed,
            KernelError::Timeout,
            KernelError::Overflow,
            KernelError::PoolCorrupted,
            KernelError::NotFound,
            KernelError::Panic(PanicReason::Assertion),
        ];
        for (i, a) in all.iter().enumerate() {
            assert_ne!(a.code(), ERROR_OK);
            assert_ne!(a.code(), ERROR_SYNC);
            for b in &all[i + 1..] {
                assert_ne!(a.code(), b.code(), "{:?} vs {:?}", a, b);
            }
        }
    }

    #[test]
    fn test_only_panic_is_fatal() {
        assert!(KernelError::Panic(PanicReason::RootProcessDestroyed).is_fatal());
        assert!(!KernelError::PoolCorrupted.is_fatal());
        assert_eq!(
            KernelError::Panic(PanicReason::UnattributedFault).to_string(),
            "kernel panic: unattributed fault"
        );
    }

    #[test]
    fn test_pool_error_conversion() {
        assert_eq!(KernelError::from(PoolError::OutOfMemory), KernelError::OutOfMemory);
        assert_eq!(
            KernelError::from(PoolError::Corrupted(0x40)),
            KernelError::PoolCorrupted
        );
    }
}
