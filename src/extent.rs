//! The extent handle and its operations.
//!
//! All mutation is serialized by one mutex. The two suspension points
//! (descriptor exhaustion, no fitting space) wait on separate condition
//! variables and re-validate everything from scratch after waking, since the
//! extent may have changed arbitrarily while the thread slept. Every
//! allocating path follows the same discipline: acquire a descriptor first
//! (that acquisition may itself block), then take the lock, validate, and
//! release the descriptor again if the request cannot proceed.

use crate::pool::{Descriptor, DescriptorPool};
use crate::region::{FreeOutcome, Region, RegionMap};
use crate::{AllocFlags, Error, ExtentFlags, Result, ViolationPolicy};
use log::{info, trace};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};

#[derive(Debug)]
struct ExtentInner {
    regions: RegionMap,
    pool: DescriptorPool,
}

/// A bounded numeric space `[start, end]` and its allocation state.
#[derive(Debug)]
pub struct Extent {
    name: String,
    start: u64,
    end: u64,
    flags: ExtentFlags,
    policy: ViolationPolicy,
    inner: Mutex<ExtentInner>,
    /// Signaled (broadcast) whenever address space is returned.
    space_available: Condvar,
    /// Signaled (one waiter) whenever a fixed descriptor slot is returned.
    descriptor_available: Condvar,
    /// Bumped by [`Extent::interrupt`]; `CATCH` waiters compare it across
    /// their sleep.
    interrupt_epoch: AtomicU64,
}

impl Extent {
    /// Creates an extent managing `[start, end]` (inclusive).
    ///
    /// For a [`FIXED_STORAGE`](ExtentFlags::FIXED_STORAGE) extent, `storage`
    /// is the byte size of the caller-provisioned descriptor storage; it
    /// must hold at least the embedded header, and the remainder is sliced
    /// into descriptor slots (see [`fixed_storage_size`](crate::fixed_storage_size)).
    /// Supplying storage to a non-fixed extent, or none to a fixed one, is
    /// an error.
    pub fn create(
        name: impl Into<String>,
        start: u64,
        end: u64,
        storage: Option<usize>,
        flags: ExtentFlags,
    ) -> Result<Self> {
        let name = name.into();
        if end < start {
            return Err(Error::InvalidArgument);
        }

        let pool = match (flags.contains(ExtentFlags::FIXED_STORAGE), storage) {
            (true, Some(bytes)) => {
                let Some(slot_bytes) = bytes.checked_sub(core::mem::size_of::<Extent>()) else {
                    return Err(Error::InvalidArgument);
                };
                DescriptorPool::fixed(slot_bytes / core::mem::size_of::<Region>())
            }
            (false, None) => DescriptorPool::dynamic(),
            _ => return Err(Error::InvalidArgument),
        };

        trace!("extent `{name}`: created [{start:#x}, {end:#x}], flags {flags:?}");

        Ok(Self {
            name,
            start,
            end,
            flags,
            policy: ViolationPolicy::default(),
            inner: Mutex::new(ExtentInner {
                regions: RegionMap::new(start, end, !flags.contains(ExtentFlags::NO_COALESCE)),
                pool,
            }),
            space_available: Condvar::new(),
            descriptor_available: Condvar::new(),
            interrupt_epoch: AtomicU64::new(0),
        })
    }

    /// Chooses how this extent reacts to a detected caller bug (spec'd
    /// default is to panic, matching the original kernel assertion).
    pub fn with_violation_policy(mut self, policy: ViolationPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Destroys the extent, releasing every remaining region and its
    /// descriptor. Exclusive ownership makes this impossible to race
    /// against other operations.
    pub fn destroy(self) {
        trace!("extent `{}`: destroyed", self.name);
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn start(&self) -> u64 {
        self.start
    }

    pub fn end(&self) -> u64 {
        self.end
    }

    pub fn flags(&self) -> ExtentFlags {
        self.flags
    }

    /// Snapshot of the allocated regions, in ascending order.
    pub fn regions(&self) -> Vec<Region> {
        self.lock().regions.iter().collect()
    }

    /// Allocates the exact interval `[start, start + size - 1]`.
    ///
    /// With [`WAIT`](AllocFlags::WAIT), blocks until the interval is free;
    /// otherwise an overlap fails with [`Error::SpaceUnavailable`].
    pub fn alloc_region(&self, start: u64, size: u64, flags: AllocFlags) -> Result<()> {
        let end = self.request_end(start, size)?;

        let desc = self.acquire_descriptor(flags)?;
        let mut inner = self.lock();
        loop {
            let Some(conflict) = inner.regions.overlap_of(start, end) else {
                let st = &mut *inner;
                let released = st.regions.insert(start, end, desc, &mut st.pool);
                drop(inner);
                self.notify_descriptors(released);
                trace!(
                    "extent `{}`: allocated region [{start:#x}, {end:#x}]",
                    self.name
                );
                return Ok(());
            };

            if !flags.contains(AllocFlags::WAIT) {
                let released = usize::from(inner.pool.release(desc));
                drop(inner);
                self.notify_descriptors(released);
                return Err(Error::SpaceUnavailable);
            }

            trace!(
                "extent `{}`: [{start:#x}, {end:#x}] conflicts with {conflict}, waiting",
                self.name
            );
            let (guard, interrupted) =
                self.wait(&self.space_available, inner, flags.contains(AllocFlags::CATCH));
            inner = guard;
            if interrupted {
                let released = usize::from(inner.pool.release(desc));
                drop(inner);
                self.notify_descriptors(released);
                return Err(Error::Interrupted);
            }
        }
    }

    /// Searches the whole extent for `size` contiguous units; returns the
    /// allocated start.
    pub fn alloc(&self, size: u64, alignment: u64, boundary: u64, flags: AllocFlags) -> Result<u64> {
        self.alloc_subregion1(self.start, self.end, size, alignment, 0, boundary, flags)
    }

    /// [`alloc`](Extent::alloc) with an explicit skew: a returned start `s`
    /// satisfies `(s - skew) % alignment == 0`.
    pub fn alloc1(
        &self,
        size: u64,
        alignment: u64,
        skew: u64,
        boundary: u64,
        flags: AllocFlags,
    ) -> Result<u64> {
        self.alloc_subregion1(self.start, self.end, size, alignment, skew, boundary, flags)
    }

    /// Searches only `[substart, subend]` for `size` contiguous units.
    pub fn alloc_subregion(
        &self,
        substart: u64,
        subend: u64,
        size: u64,
        alignment: u64,
        boundary: u64,
        flags: AllocFlags,
    ) -> Result<u64> {
        self.alloc_subregion1(substart, subend, size, alignment, 0, boundary, flags)
    }

    /// Constrained subregion search: the combined entry point every search
    /// variant funnels into.
    ///
    /// Walks the gaps between regions once, in ascending order, computing
    /// for each the lowest aligned/skewed candidate start that does not
    /// straddle a `boundary` multiple. Default policy is best-fit (smallest
    /// leftover, ties to the lowest address); [`FAST`](AllocFlags::FAST)
    /// takes the first fit. Arithmetic overflow while positioning a
    /// candidate means "does not fit", never a wrapped address.
    pub fn alloc_subregion1(
        &self,
        substart: u64,
        subend: u64,
        size: u64,
        alignment: u64,
        skew: u64,
        boundary: u64,
        flags: AllocFlags,
    ) -> Result<u64> {
        let alignment = if alignment == 0 { 1 } else { alignment };
        if size == 0 || !alignment.is_power_of_two() || skew >= alignment {
            return Err(Error::InvalidArgument);
        }
        if boundary != 0 && boundary < size {
            // A region larger than the boundary stride cannot avoid
            // straddling it.
            return Err(Error::InvalidArgument);
        }
        if substart > subend || substart < self.start || subend > self.end {
            return Err(Error::InvalidArgument);
        }

        let params = SearchParams {
            substart,
            subend,
            size,
            alignment,
            skew,
            boundary,
            boundary_base: if flags.contains(AllocFlags::BOUNDARY_FROM_ZERO) {
                0
            } else {
                self.start
            },
            first_fit: flags.contains(AllocFlags::FAST),
        };

        let desc = self.acquire_descriptor(flags)?;
        let mut inner = self.lock();
        loop {
            if let Some(chosen) = find_candidate(&inner.regions, &params) {
                // `find_candidate` proved `chosen + size - 1` fits.
                let end = chosen + (size - 1);
                let st = &mut *inner;
                let released = st.regions.insert(chosen, end, desc, &mut st.pool);
                drop(inner);
                self.notify_descriptors(released);
                trace!(
                    "extent `{}`: allocated [{chosen:#x}, {end:#x}] in [{substart:#x}, {subend:#x}]",
                    self.name
                );
                return Ok(chosen);
            }

            if !flags.contains(AllocFlags::WAIT) {
                let released = usize::from(inner.pool.release(desc));
                drop(inner);
                self.notify_descriptors(released);
                return Err(Error::SpaceUnavailable);
            }

            trace!(
                "extent `{}`: no fitting interval in [{substart:#x}, {subend:#x}], waiting",
                self.name
            );
            let (guard, interrupted) =
                self.wait(&self.space_available, inner, flags.contains(AllocFlags::CATCH));
            inner = guard;
            if interrupted {
                let released = usize::from(inner.pool.release(desc));
                drop(inner);
                self.notify_descriptors(released);
                return Err(Error::Interrupted);
            }
        }
    }

    /// Releases `[start, start + size - 1]`, previously allocated through
    /// any of the allocation entry points.
    ///
    /// Freeing an interior sub-range splits one region into two and needs a
    /// fresh descriptor; on a fixed extent with an exhausted freelist that
    /// fails with [`Error::OutOfDescriptors`] unless
    /// [`MALLOCOK`](AllocFlags::MALLOCOK) permits dynamic fallback. The
    /// acquisition never blocks: the only event that refills the freelist is
    /// another free completing.
    ///
    /// Freeing a range not currently allocated is a caller bug and is
    /// handled per the extent's [`ViolationPolicy`].
    pub fn free(&self, start: u64, size: u64, flags: AllocFlags) -> Result<()> {
        let end = self.request_end(start, size)?;

        let mut inner = self.lock();
        let st = &mut *inner;
        let spare = st.pool.try_acquire(flags.contains(AllocFlags::MALLOCOK));
        let outcome = st.regions.free(start, end, spare, &mut st.pool);
        match outcome {
            FreeOutcome::Done { released } => {
                drop(inner);
                self.notify_descriptors(released);
                self.space_available.notify_all();
                trace!("extent `{}`: freed [{start:#x}, {end:#x}]", self.name);
                Ok(())
            }
            FreeOutcome::NeedDescriptor => Err(Error::OutOfDescriptors),
            FreeOutcome::PartialNoCoalesce { released } => {
                drop(inner);
                self.notify_descriptors(released);
                Err(Error::InvalidArgument)
            }
            FreeOutcome::NotFound { released } => {
                drop(inner);
                self.notify_descriptors(released);
                self.violation(start, end)
            }
        }
    }

    /// Wakes every blocked waiter; waiters that passed
    /// [`CATCH`](AllocFlags::CATCH) abandon their wait with
    /// [`Error::Interrupted`]. The hosted stand-in for signal delivery.
    pub fn interrupt(&self) {
        self.interrupt_epoch.fetch_add(1, Ordering::SeqCst);
        // Take and drop the lock so no waiter can miss the bump between
        // sampling the epoch and parking.
        drop(self.lock());
        self.space_available.notify_all();
        self.descriptor_available.notify_all();
    }

    /// Dumps the extent bounds and every region through the logger.
    pub fn print(&self) {
        info!("{self}");
    }

    /// Validates a `[start, start + size - 1]` request against the extent
    /// bounds; returns the inclusive end.
    fn request_end(&self, start: u64, size: u64) -> Result<u64> {
        if size == 0 {
            return Err(Error::InvalidArgument);
        }
        let end = start.checked_add(size - 1).ok_or(Error::InvalidArgument)?;
        if start < self.start || end > self.end {
            return Err(Error::InvalidArgument);
        }
        Ok(end)
    }

    /// Acquires a region descriptor, blocking on the descriptor condvar if
    /// the fixed freelist is exhausted and the flags allow it.
    fn acquire_descriptor(&self, flags: AllocFlags) -> Result<Descriptor> {
        let mut inner = self.lock();
        loop {
            if let Some(desc) = inner.pool.try_acquire(flags.contains(AllocFlags::MALLOCOK)) {
                return Ok(desc);
            }
            if !flags.contains(AllocFlags::WAIT) {
                return Err(Error::OutOfDescriptors);
            }
            trace!("extent `{}`: descriptor freelist empty, waiting", self.name);
            let (guard, interrupted) = self.wait(
                &self.descriptor_available,
                inner,
                flags.contains(AllocFlags::CATCH),
            );
            inner = guard;
            if interrupted {
                return Err(Error::Interrupted);
            }
        }
    }

    /// The release-lock/block/reacquire step shared by both suspension
    /// points. Returns the reacquired guard and whether a `CATCH` wait was
    /// interrupted; the caller's loop re-validates from scratch either way.
    fn wait<'a>(
        &self,
        condvar: &Condvar,
        guard: MutexGuard<'a, ExtentInner>,
        catch: bool,
    ) -> (MutexGuard<'a, ExtentInner>, bool) {
        let epoch = self.interrupt_epoch.load(Ordering::SeqCst);
        let guard = condvar.wait(guard).unwrap_or_else(PoisonError::into_inner);
        let interrupted = catch && self.interrupt_epoch.load(Ordering::SeqCst) != epoch;
        (guard, interrupted)
    }

    fn lock(&self) -> MutexGuard<'_, ExtentInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Hands freed fixed descriptor slots to blocked acquirers, one wakeup
    /// per slot.
    fn notify_descriptors(&self, released: usize) {
        for _ in 0..released {
            self.descriptor_available.notify_one();
        }
    }

    fn violation(&self, start: u64, end: u64) -> Result<()> {
        match self.policy {
            ViolationPolicy::Panic => panic!(
                "extent `{}`: freeing unallocated range [{start:#x}, {end:#x}]",
                self.name
            ),
            ViolationPolicy::ReturnError => Err(Error::InvariantViolation),
        }
    }

    #[cfg(test)]
    fn invariants_hold(&self) -> bool {
        self.lock().regions.check_invariants()
    }
}

impl core::fmt::Display for Extent {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let inner = self.lock();
        write!(
            f,
            "extent `{}` ({:#x} - {:#x}), {} regions",
            self.name,
            self.start,
            self.end,
            inner.regions.len()
        )?;
        for region in inner.regions.iter() {
            write!(f, "\n  {region}")?;
        }
        Ok(())
    }
}

struct SearchParams {
    substart: u64,
    subend: u64,
    size: u64,
    alignment: u64,
    skew: u64,
    boundary: u64,
    boundary_base: u64,
    first_fit: bool,
}

/// Smallest `c >= value` with `(c - skew) % alignment == 0`. `None` on
/// overflow, which callers treat as "does not fit".
fn align_up_skewed(value: u64, alignment: u64, skew: u64) -> Option<u64> {
    if value <= skew {
        return Some(skew);
    }
    let rem = (value - skew) % alignment;
    if rem == 0 {
        Some(value)
    } else {
        value.checked_add(alignment - rem)
    }
}

/// Positions a candidate inside the gap `[gap_start, gap_end]`, honoring
/// alignment, skew and the boundary constraint. Returns the candidate start
/// and the leftover space behind it, or `None` if nothing fits.
fn fit_in_gap(gap_start: u64, gap_end: u64, p: &SearchParams) -> Option<(u64, u64)> {
    let mut candidate = align_up_skewed(gap_start, p.alignment, p.skew)?;
    loop {
        let candidate_end = candidate.checked_add(p.size - 1)?;
        if candidate_end > gap_end {
            return None;
        }

        if p.boundary != 0 {
            debug_assert!(candidate >= p.boundary_base);
            // First boundary line strictly above the candidate start; the
            // interval must not reach it. If computing the line overflows,
            // no line exists below `u64::MAX` and nothing can straddle.
            let next_line = ((candidate - p.boundary_base) / p.boundary)
                .checked_add(1)
                .and_then(|n| n.checked_mul(p.boundary))
                .and_then(|off| off.checked_add(p.boundary_base));
            if let Some(line) = next_line {
                if line <= candidate_end {
                    // Straddles: shift to the boundary line and re-align.
                    candidate = align_up_skewed(line, p.alignment, p.skew)?;
                    continue;
                }
            }
        }

        return Some((candidate, gap_end - candidate_end));
    }
}

/// One pass over the gaps of the region collection, clipped to the
/// subrange. Returns the chosen start per the fit policy.
fn find_candidate(regions: &RegionMap, p: &SearchParams) -> Option<u64> {
    let mut gaps: Vec<(u64, u64)> = Vec::new();
    let mut cursor = p.substart;
    let mut open = true;
    for region in regions.iter() {
        if region.end() < cursor {
            continue;
        }
        if region.start() > p.subend {
            break;
        }
        if region.start() > cursor {
            gaps.push((cursor, core::cmp::min(region.start() - 1, p.subend)));
        }
        match region.end().checked_add(1) {
            Some(next) if next <= p.subend => cursor = next,
            _ => {
                open = false;
                break;
            }
        }
    }
    if open && cursor <= p.subend {
        gaps.push((cursor, p.subend));
    }

    let mut best: Option<(u64, u64)> = None;
    for (gap_start, gap_end) in gaps {
        let Some((candidate, leftover)) = fit_in_gap(gap_start, gap_end, p) else {
            continue;
        };
        // First-fit stops at the first qualifying gap; best-fit only stops
        // early on an exact fit.
        if p.first_fit || leftover == 0 {
            return Some(candidate);
        }
        if best.map_or(true, |(_, bl)| leftover < bl) {
            best = Some((candidate, leftover));
        }
    }
    best.map(|(candidate, _)| candidate)
}
