//! Region records and the ordered region collection.
//!
//! `RegionMap` is the single owner of the sorted, non-overlapping region
//! set. The coalescing inserter lives here: it is the one place adjacency
//! merging happens, so every allocation path funnels through it.

use crate::pool::{Descriptor, DescriptorPool};
use std::collections::BTreeMap;

/// One currently-allocated sub-interval `[start, end]` (inclusive).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Region {
    start: u64,
    end: u64,
}

impl Region {
    pub(crate) fn new(start: u64, end: u64) -> Self {
        debug_assert!(start <= end);
        Self { start, end }
    }

    pub fn start(&self) -> u64 {
        self.start
    }

    pub fn end(&self) -> u64 {
        self.end
    }
}

impl core::fmt::Display for Region {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "[{:#x}, {:#x}]", self.start, self.end)
    }
}

/// Map value: region end plus the descriptor paying for the record.
#[derive(Debug)]
struct Entry {
    end: u64,
    desc: Descriptor,
}

/// Outcome of [`RegionMap::free`].
#[derive(Debug)]
pub(crate) enum FreeOutcome {
    /// The range was freed; `released` fixed descriptors went back to the
    /// pool (the caller wakes that many blocked acquirers).
    Done { released: usize },
    /// An interior split was required but no spare descriptor was supplied.
    /// Nothing was mutated.
    NeedDescriptor,
    /// Partial free of a region on a no-coalesce extent; rejected.
    PartialNoCoalesce { released: usize },
    /// No region contains the requested range: caller bug.
    NotFound { released: usize },
}

fn release_opt(spare: Option<Descriptor>, pool: &mut DescriptorPool) -> usize {
    match spare {
        Some(desc) => usize::from(pool.release(desc)),
        None => 0,
    }
}

#[derive(Debug)]
pub(crate) struct RegionMap {
    map: BTreeMap<u64, Entry>,
    bounds_start: u64,
    bounds_end: u64,
    coalesce: bool,
}

impl RegionMap {
    pub fn new(bounds_start: u64, bounds_end: u64, coalesce: bool) -> Self {
        debug_assert!(bounds_start <= bounds_end);
        Self {
            map: BTreeMap::new(),
            bounds_start,
            bounds_end,
            coalesce,
        }
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = Region> + '_ {
        self.map.iter().map(|(&s, e)| Region::new(s, e.end))
    }

    /// Returns a region overlapping `[start, end]`, if any.
    pub fn overlap_of(&self, start: u64, end: u64) -> Option<Region> {
        // Regions are disjoint and sorted, so both starts and ends ascend.
        // The candidate with the greatest start <= `end` therefore has the
        // greatest end of all regions beginning at or below `end`; if even
        // it ends below `start`, nothing overlaps.
        let (&s, e) = self.map.range(..=end).next_back()?;
        (e.end >= start).then(|| Region::new(s, e.end))
    }

    /// Coalescing inserter. `[start, end]` must not overlap any existing
    /// region; `desc` is the spare descriptor already acquired for it.
    ///
    /// Returns how many fixed descriptors were released back to the pool
    /// (the spare and/or a bridged-away neighbor's).
    pub fn insert(
        &mut self,
        start: u64,
        end: u64,
        desc: Descriptor,
        pool: &mut DescriptorPool,
    ) -> usize {
        debug_assert!(self.overlap_of(start, end).is_none());

        if !self.coalesce {
            self.map.insert(start, Entry { end, desc });
            self.debug_check();
            return 0;
        }

        let mut released = 0;

        // Try extending the predecessor forward. Neighbors cannot overlap
        // the new range, so `p.end < start` and the increment cannot wrap.
        let appended = match self.map.range_mut(..start).next_back() {
            Some((&p_start, p)) if p.end + 1 == start => {
                p.end = end;
                Some(p_start)
            }
            _ => None,
        };

        // Then the successor. This also covers the head-insert case where
        // the first existing region begins exactly past the new range.
        let succ = self.map.range(start..).next().map(|(&s, _)| s);
        if let Some(s_start) = succ {
            if end + 1 == s_start {
                let s_entry = self.map.remove(&s_start).unwrap();
                match appended {
                    Some(p_start) => {
                        // Predecessor and successor became contiguous; the
                        // successor's descriptor is now redundant.
                        self.map.get_mut(&p_start).unwrap().end = s_entry.end;
                        released += usize::from(pool.release(s_entry.desc));
                    }
                    None => {
                        // Extend the successor backward: re-key the entry.
                        self.map.insert(
                            start,
                            Entry {
                                end: s_entry.end,
                                desc: s_entry.desc,
                            },
                        );
                    }
                }
                released += usize::from(pool.release(desc));
                self.debug_check();
                return released;
            }
        }

        if appended.is_some() {
            released += usize::from(pool.release(desc));
        } else {
            self.map.insert(start, Entry { end, desc });
        }
        self.debug_check();
        released
    }

    /// Frees `[start, end]`. Exactly one of four cases applies to the region
    /// containing the range: exact removal, prefix shrink, suffix shrink, or
    /// interior split (which consumes `spare`).
    pub fn free(
        &mut self,
        start: u64,
        end: u64,
        spare: Option<Descriptor>,
        pool: &mut DescriptorPool,
    ) -> FreeOutcome {
        // The containing region, if any, is the one with the greatest
        // start <= `start`.
        let containing = self
            .map
            .range(..=start)
            .next_back()
            .map(|(&s, e)| (s, e.end));
        let (r_start, r_end) = match containing {
            Some((s, e)) if e >= end => (s, e),
            _ => {
                return FreeOutcome::NotFound {
                    released: release_opt(spare, pool),
                }
            }
        };

        let exact = r_start == start && r_end == end;
        if !exact && !self.coalesce {
            return FreeOutcome::PartialNoCoalesce {
                released: release_opt(spare, pool),
            };
        }

        let mut released = 0;
        match (r_start == start, r_end == end) {
            (true, true) => {
                let entry = self.map.remove(&r_start).unwrap();
                released += usize::from(pool.release(entry.desc));
                released += release_opt(spare, pool);
            }
            (true, false) => {
                // Prefix free: the region's start moves forward, which on a
                // start-keyed map means re-keying the entry.
                let entry = self.map.remove(&r_start).unwrap();
                self.map.insert(end + 1, entry);
                released += release_opt(spare, pool);
            }
            (false, true) => {
                self.map.get_mut(&r_start).unwrap().end = start - 1;
                released += release_opt(spare, pool);
            }
            (false, false) => {
                let Some(desc) = spare else {
                    return FreeOutcome::NeedDescriptor;
                };
                self.map.get_mut(&r_start).unwrap().end = start - 1;
                self.map.insert(end + 1, Entry { end: r_end, desc });
            }
        }

        self.debug_check();
        FreeOutcome::Done { released }
    }

    /// Verifies the core invariants: ascending order, pairwise disjoint,
    /// contained in the extent bounds, and (when coalescing) no two adjacent
    /// regions.
    pub fn check_invariants(&self) -> bool {
        let mut prev_end: Option<u64> = None;
        for (&start, entry) in &self.map {
            if start > entry.end {
                return false;
            }
            if start < self.bounds_start || entry.end > self.bounds_end {
                return false;
            }
            if let Some(pe) = prev_end {
                if start <= pe {
                    return false;
                }
                if self.coalesce && pe + 1 == start {
                    return false;
                }
            }
            prev_end = Some(entry.end);
        }
        true
    }

    fn debug_check(&self) {
        debug_assert!(self.check_invariants(), "region map invariants violated");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map() -> (RegionMap, DescriptorPool) {
        (RegionMap::new(0, 0xFFFF, true), DescriptorPool::dynamic())
    }

    fn desc(pool: &mut DescriptorPool) -> Descriptor {
        pool.try_acquire(false).unwrap()
    }

    fn regions(map: &RegionMap) -> Vec<(u64, u64)> {
        map.iter().map(|r| (r.start(), r.end())).collect()
    }

    #[test]
    fn insert_disjoint_stays_sorted() {
        let (mut m, mut p) = map();
        let d0 = desc(&mut p);
        let d1 = desc(&mut p);
        let d2 = desc(&mut p);
        m.insert(0x100, 0x1FF, d1, &mut p);
        m.insert(0x000, 0x0FF - 1, d0, &mut p);
        m.insert(0x300, 0x3FF, d2, &mut p);
        assert_eq!(regions(&m), vec![(0x000, 0x0FE), (0x100, 0x1FF), (0x300, 0x3FF)]);
        assert!(m.check_invariants());
    }

    #[test]
    fn insert_extends_predecessor() {
        let (mut m, mut p) = map();
        let d0 = desc(&mut p);
        let d1 = desc(&mut p);
        m.insert(0x100, 0x1FF, d0, &mut p);
        m.insert(0x200, 0x2FF, d1, &mut p);
        assert_eq!(regions(&m), vec![(0x100, 0x2FF)]);
    }

    #[test]
    fn insert_extends_successor_backward() {
        let (mut m, mut p) = map();
        let d0 = desc(&mut p);
        let d1 = desc(&mut p);
        m.insert(0x200, 0x2FF, d0, &mut p);
        m.insert(0x100, 0x1FF, d1, &mut p);
        assert_eq!(regions(&m), vec![(0x100, 0x2FF)]);
    }

    #[test]
    fn insert_bridges_neighbors() {
        let (mut m, mut p) = map();
        let d0 = desc(&mut p);
        let d1 = desc(&mut p);
        let d2 = desc(&mut p);
        m.insert(0x100, 0x1FF, d0, &mut p);
        m.insert(0x300, 0x3FF, d1, &mut p);
        m.insert(0x200, 0x2FF, d2, &mut p);
        assert_eq!(regions(&m), vec![(0x100, 0x3FF)]);
    }

    #[test]
    fn no_coalesce_keeps_adjacent_records() {
        let mut m = RegionMap::new(0, 0xFFFF, false);
        let mut p = DescriptorPool::dynamic();
        let d0 = desc(&mut p);
        let d1 = desc(&mut p);
        m.insert(0x100, 0x1FF, d0, &mut p);
        m.insert(0x200, 0x2FF, d1, &mut p);
        assert_eq!(regions(&m), vec![(0x100, 0x1FF), (0x200, 0x2FF)]);
        assert!(m.check_invariants());
    }

    #[test]
    fn free_exact_removes_record() {
        let (mut m, mut p) = map();
        let d0 = desc(&mut p);
        m.insert(0x100, 0x1FF, d0, &mut p);
        assert!(matches!(
            m.free(0x100, 0x1FF, None, &mut p),
            FreeOutcome::Done { .. }
        ));
        assert!(m.is_empty());
    }

    #[test]
    fn free_prefix_and_suffix_shrink() {
        let (mut m, mut p) = map();
        let d0 = desc(&mut p);
        m.insert(0x100, 0x1FF, d0, &mut p);

        assert!(matches!(
            m.free(0x100, 0x13F, None, &mut p),
            FreeOutcome::Done { .. }
        ));
        assert_eq!(regions(&m), vec![(0x140, 0x1FF)]);

        assert!(matches!(
            m.free(0x1C0, 0x1FF, None, &mut p),
            FreeOutcome::Done { .. }
        ));
        assert_eq!(regions(&m), vec![(0x140, 0x1BF)]);
    }

    #[test]
    fn free_interior_splits_with_spare() {
        let (mut m, mut p) = map();
        let d0 = desc(&mut p);
        m.insert(0x100, 0x1FF, d0, &mut p);

        // Without a spare the split must not mutate anything.
        assert!(matches!(
            m.free(0x140, 0x17F, None, &mut p),
            FreeOutcome::NeedDescriptor
        ));
        assert_eq!(regions(&m), vec![(0x100, 0x1FF)]);

        let spare = desc(&mut p);
        assert!(matches!(
            m.free(0x140, 0x17F, Some(spare), &mut p),
            FreeOutcome::Done { .. }
        ));
        assert_eq!(regions(&m), vec![(0x100, 0x13F), (0x180, 0x1FF)]);
    }

    #[test]
    fn free_unallocated_reports_not_found() {
        let (mut m, mut p) = map();
        let d0 = desc(&mut p);
        m.insert(0x100, 0x1FF, d0, &mut p);
        assert!(matches!(
            m.free(0x400, 0x4FF, None, &mut p),
            FreeOutcome::NotFound { .. }
        ));
        // A range straddling a region edge is not contained either.
        assert!(matches!(
            m.free(0x180, 0x2FF, None, &mut p),
            FreeOutcome::NotFound { .. }
        ));
    }

    #[test]
    fn partial_free_rejected_without_coalescing() {
        let mut m = RegionMap::new(0, 0xFFFF, false);
        let mut p = DescriptorPool::dynamic();
        let d0 = desc(&mut p);
        m.insert(0x100, 0x1FF, d0, &mut p);
        assert!(matches!(
            m.free(0x100, 0x17F, None, &mut p),
            FreeOutcome::PartialNoCoalesce { .. }
        ));
        assert_eq!(regions(&m), vec![(0x100, 0x1FF)]);
    }

    #[test]
    fn split_then_refill_restores_single_region() {
        let (mut m, mut p) = map();
        let d0 = desc(&mut p);
        m.insert(0x100, 0x1FF, d0, &mut p);

        let spare = desc(&mut p);
        m.free(0x140, 0x17F, Some(spare), &mut p);
        let d1 = desc(&mut p);
        m.insert(0x140, 0x17F, d1, &mut p);
        assert_eq!(regions(&m), vec![(0x100, 0x1FF)]);
    }
}
