//! General-purpose extent manager: tracks ownership of sub-ranges within a
//! bounded `u64` address space (I/O port ranges, physical memory windows, or
//! any other resource named by an offset and a length).
//!
//! An [`Extent`] owns a sorted, non-overlapping set of allocated regions and
//! serializes all mutation behind one mutex. Allocation entry points support
//! exact-region claims and constrained searches (alignment, skew, boundary,
//! first-fit/best-fit), with optional blocking until space or a region
//! descriptor becomes available.

mod extent;
mod pool;
mod region;

pub use extent::Extent;
pub use region::Region;

use thiserror::Error;

bitflags::bitflags! {
    /// Per-call behavior flags accepted by the allocation and free entry points.
    #[repr(transparent)]
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct AllocFlags: u32 {
        /// Block until the request can be satisfied.
        const WAIT = 1 << 0;
        /// Blocking waits may be abandoned via [`Extent::interrupt`].
        const CATCH = 1 << 1;
        /// Permit falling back to the dynamic descriptor backend even for a
        /// fixed extent whose freelist is exhausted.
        const MALLOCOK = 1 << 2;
        /// First-fit instead of the default best-fit search policy.
        const FAST = 1 << 3;
        /// Measure the boundary constraint from absolute zero instead of from
        /// the extent's start.
        const BOUNDARY_FROM_ZERO = 1 << 4;
    }
}

bitflags::bitflags! {
    /// Extent-level flags fixed at creation time.
    #[repr(transparent)]
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ExtentFlags: u32 {
        /// Region descriptors are drawn from a caller-sized bounded pool
        /// instead of the general allocator.
        const FIXED_STORAGE = 1 << 0;
        /// Never merge adjacent regions. Simpler bookkeeping at the cost of
        /// descriptor churn; partial frees are rejected.
        const NO_COALESCE = 1 << 1;
    }
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// Malformed bounds, zero-sized request, bad alignment/skew, or a
    /// boundary smaller than the requested size.
    #[error("invalid argument")]
    InvalidArgument,

    /// No region descriptor is available and neither fallback nor blocking
    /// was permitted.
    #[error("out of region descriptors")]
    OutOfDescriptors,

    /// No fitting interval exists right now and the caller declined to wait.
    #[error("no space available")]
    SpaceUnavailable,

    /// A blocking wait was abandoned through [`Extent::interrupt`].
    #[error("wait interrupted")]
    Interrupted,

    /// The caller freed a range that is not currently allocated. Only
    /// surfaced under [`ViolationPolicy::ReturnError`]; the default policy
    /// panics instead.
    #[error("extent invariant violated")]
    InvariantViolation,
}

pub type Result<T> = core::result::Result<T, Error>;

/// How an extent reacts to a detected caller bug (double free, or freeing a
/// range that was never allocated). Continuing would silently corrupt the
/// region collection, so the default preserves the original kernel severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ViolationPolicy {
    /// Panic the process.
    #[default]
    Panic,
    /// Surface [`Error::InvariantViolation`] to the caller.
    ReturnError,
}

/// Bytes of caller storage needed for a fixed extent holding up to
/// `nregions` outstanding region descriptors: the embedded header plus one
/// slot per descriptor.
pub const fn fixed_storage_size(nregions: usize) -> usize {
    core::mem::size_of::<Extent>() + nregions * core::mem::size_of::<Region>()
}
