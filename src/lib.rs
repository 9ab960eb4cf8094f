//! A thread-safe, multi-arena allocator producing fixed-address,
//! reference-counted blocks, backed either by process-local memory
//! (`GeneralAllocator`) or by a shared memory-mapped file
//! (`MmfAllocator`), so blocks can be shared across process boundaries.
//!
//! The core building blocks, from the bottom up:
//! - [`segment::MemorySegment`] / [`block::GenBlockHeader`]: the flat,
//!   relocatable descriptor and header every block carries.
//! - [`lock::ExclusiveAccessControl`]: a spin-wait mutex that can live
//!   inside shared memory, used by every arena and by the MMF page
//!   directory.
//! - [`bitmap::ConcurrentBitmap`] / [`page_alloc::PageAllocator`]: a
//!   hierarchical free-bit index over process-local pages.
//! - [`arena::Arena`]: the segment-list engine shared by
//!   [`sba::SmallBlockAllocator`] and [`lba::LargeBlockAllocator`].
//! - [`gpa::GeneralAllocator`]: dispatches to a thread's small/large
//!   arena chain.
//! - [`mmf::MmfAllocator`]: the cross-process, page-granular
//!   equivalent, backed by [`memmap2`].

pub mod arena;
pub mod bitmap;
pub mod block;
pub mod error;
pub mod gpa;
pub mod lba;
pub mod lock;
pub mod mmf;
pub mod options;
pub mod os;
pub mod page_alloc;
pub mod process;
pub mod referential;
pub mod sba;
pub mod segment;
pub mod stats;

pub use block::Block;
pub use error::{Error, Result};
pub use gpa::GeneralAllocator;
pub use mmf::MmfAllocator;
pub use options::Options;
pub use process::{DefaultProcessProvider, ProcessLivenessProvider};
pub use segment::MemorySegment;
pub use stats::Stats;
