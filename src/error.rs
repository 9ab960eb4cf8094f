//! Error taxonomy for the allocator core.
//!
//! Every fallible operation returns `Result<T, Error>`; nothing in this
//! crate uses panics or process aborts for recoverable conditions. Even
//! the two conditions that are effectively unrecoverable — a block
//! header whose `block_index` resolves to no registered allocator, and
//! MMF root-header corruption — are surfaced as `Err` values here rather
//! than aborting, so the caller decides what to do; a caller that wants
//! to abort on corruption can match `Error::UnknownBlock` /
//! `Error::Corrupted` and abort itself.

use thiserror::Error;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// Request exceeded the arena's maximum segment size, or the MMF
    /// ran out of free pages.
    #[error("out of memory")]
    OutOfMemory,

    /// Operation attempted after the owning allocator was disposed.
    #[error("allocator has been disposed")]
    Disposed,

    /// `ExclusiveAccessControl::exit` called with a lock id that does
    /// not match (or does not hold) the lock.
    #[error("lock exited with an id that does not hold it")]
    BadLockId,

    /// The waiter ring of an `ExclusiveAccessControl` is full.
    #[error("maximum lock concurrency exceeded")]
    ConcurrencyExceeded,

    /// A slice/index fell outside `[0, length)` of a `MemorySegment`.
    #[error("index {index} out of range for length {length}")]
    IndexOutOfRange { index: usize, length: usize },

    /// Requested capacity exceeds what the backing storage can hold.
    #[error("requested capacity {requested} exceeds storage capacity {capacity}")]
    CapacityTooBig { requested: usize, capacity: usize },

    /// Guard-page bytes around an allocation were modified (debug builds only).
    #[error("block overrun detected past the allocation's guard bytes")]
    BlockOverrun,

    /// The MMF root header's signature/version did not match on open.
    #[error("memory-mapped file root header is corrupted or incompatible")]
    Corrupted,

    /// A block header's `block_index` did not resolve to any registered
    /// allocator. This means the header was corrupted or the allocator
    /// was already torn down while blocks were live.
    #[error("block header does not resolve to a registered allocator")]
    UnknownBlock,

    /// An OS-level mapping/protection call failed; the wrapped value is
    /// the raw OS error code (`errno` on Unix, `GetLastError` on Windows).
    #[error("OS memory call failed with code {0}")]
    Os(i32),
}

pub type Result<T> = core::result::Result<T, Error>;
