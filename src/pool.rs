//! Region descriptor pool.
//!
//! Every outstanding region in an extent is paid for by one descriptor.
//! The dynamic backend delegates to the general allocator (region records
//! simply live in the extent's map), while the fixed backend bounds the
//! number of outstanding descriptors by the slot count carved out of the
//! caller-supplied storage size at creation, so the extent never grows its
//! bookkeeping past what the caller provisioned.

/// Token representing one region descriptor. Moves into the region map when
/// a region is inserted and returns to the pool when the region is removed
/// or merged away.
#[derive(Debug)]
pub(crate) struct Descriptor {
    /// Whether the descriptor occupies a fixed-pool slot (as opposed to
    /// having been dynamically allocated, possibly via `MALLOCOK` fallback).
    fixed: bool,
}

#[derive(Debug)]
pub(crate) enum DescriptorPool {
    /// Delegates to the general allocator; acquisition never fails.
    Dynamic,
    /// Bounded freelist of `capacity` slots.
    Fixed { free: usize, capacity: usize },
}

impl DescriptorPool {
    pub fn dynamic() -> Self {
        Self::Dynamic
    }

    pub fn fixed(capacity: usize) -> Self {
        Self::Fixed {
            free: capacity,
            capacity,
        }
    }

    /// Attempts to acquire a descriptor without blocking. `None` means the
    /// fixed freelist is empty and the caller did not permit dynamic
    /// fallback; the caller decides whether to wait or fail.
    pub fn try_acquire(&mut self, mallocok: bool) -> Option<Descriptor> {
        match self {
            Self::Dynamic => Some(Descriptor { fixed: false }),
            Self::Fixed { free, .. } => {
                if *free > 0 {
                    *free -= 1;
                    Some(Descriptor { fixed: true })
                } else if mallocok {
                    Some(Descriptor { fixed: false })
                } else {
                    None
                }
            }
        }
    }

    /// Returns a descriptor to whichever backend it came from. Returns
    /// `true` when a fixed slot went back on the freelist, in which case the
    /// caller must wake one blocked acquirer.
    pub fn release(&mut self, descriptor: Descriptor) -> bool {
        match (self, descriptor.fixed) {
            (Self::Fixed { free, capacity }, true) => {
                debug_assert!(*free < *capacity, "fixed pool freelist overflow");
                *free += 1;
                true
            }
            // Dynamically-backed descriptors go back to the general
            // allocator; dropping the token is that release.
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dynamic_never_exhausts() {
        let mut pool = DescriptorPool::dynamic();
        for _ in 0..64 {
            let d = pool.try_acquire(false).unwrap();
            assert!(!d.fixed);
        }
    }

    #[test]
    fn fixed_pool_bounds_acquisitions() {
        let mut pool = DescriptorPool::fixed(2);
        let a = pool.try_acquire(false).unwrap();
        let b = pool.try_acquire(false).unwrap();
        assert!(a.fixed && b.fixed);
        assert!(pool.try_acquire(false).is_none());

        assert!(pool.release(a));
        let c = pool.try_acquire(false).unwrap();
        assert!(c.fixed);
    }

    #[test]
    fn fixed_pool_mallocok_fallback() {
        let mut pool = DescriptorPool::fixed(1);
        let a = pool.try_acquire(false).unwrap();
        let d = pool.try_acquire(true).expect("fallback should succeed");
        assert!(!d.fixed);

        // Fallback descriptors do not return to the freelist.
        assert!(!pool.release(d));
        assert!(pool.try_acquire(false).is_none());
        assert!(pool.release(a));
    }
}
