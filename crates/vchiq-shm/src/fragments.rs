//! Bulk fragment pool.
//!
//! Fragments are fixed-size scratch areas after the data slots, used to hold
//! page-list descriptors for bulk transfers. The pool is carved in half at
//! attach time; each side runs a freelist over its own range, linked through
//! the first word of each free fragment, so no cross-side synchronization is
//! needed.

use std::sync::Mutex;

use vchiq_primitives::Region;

use crate::error::TransportError;
use crate::layout::FRAGMENT_SIZE;

const FREELIST_END: u32 = u32::MAX;

/// A claimed fragment. Returned to the pool via `FragmentPool::release`.
#[derive(Debug)]
pub struct FragmentRef {
    pub index: u32,
    /// Byte offset of the fragment in the region; doubles as its bus address
    pub offset: usize,
}

/// One side's half of the fragment pool.
pub struct FragmentPool {
    region: Region,
    base: usize,
    first_index: u32,
    count: u32,
    head: Mutex<u32>,
}

impl FragmentPool {
    /// Build the freelist over fragments `[first_index, first_index + count)`.
    ///
    /// The range must be owned exclusively by this side.
    pub fn new(region: Region, base: usize, first_index: u32, count: u32) -> Self {
        // Chain each fragment to the next through its first word
        for i in 0..count {
            let idx = first_index + i;
            let next = if i + 1 == count {
                FREELIST_END
            } else {
                idx + 1
            };
            let off = base + idx as usize * FRAGMENT_SIZE;
            unsafe { region.write_bytes(off, &next.to_le_bytes()) };
        }
        let head = if count == 0 { FREELIST_END } else { first_index };
        Self {
            region,
            base,
            first_index,
            count,
            head: Mutex::new(head),
        }
    }

    /// Claim a fragment, or `OutOfMemory` if the pool is exhausted.
    pub fn claim(&self) -> Result<FragmentRef, TransportError> {
        let mut head = self.head.lock().unwrap();
        let index = *head;
        if index == FREELIST_END {
            debug!("fragment pool exhausted");
            return Err(TransportError::OutOfMemory);
        }
        let offset = self.base + index as usize * FRAGMENT_SIZE;
        let mut next = [0u8; 4];
        unsafe { self.region.read_bytes(offset, &mut next) };
        *head = u32::from_le_bytes(next);
        trace!(index, "claimed fragment");
        Ok(FragmentRef { index, offset })
    }

    /// Return a fragment to the freelist.
    pub fn release(&self, fragment: FragmentRef) {
        debug_assert!(
            fragment.index >= self.first_index
                && fragment.index < self.first_index + self.count
        );
        let mut head = self.head.lock().unwrap();
        unsafe {
            self.region
                .write_bytes(fragment.offset, &head.to_le_bytes())
        };
        *head = fragment.index;
        trace!(index = fragment.index, "released fragment");
    }

    /// Free fragments remaining; for diagnostics and tests.
    pub fn free_count(&self) -> u32 {
        let head = self.head.lock().unwrap();
        let mut n = 0;
        let mut cursor = *head;
        while cursor != FREELIST_END {
            n += 1;
            let off = self.base + cursor as usize * FRAGMENT_SIZE;
            let mut next = [0u8; 4];
            unsafe { self.region.read_bytes(off, &mut next) };
            cursor = u32::from_le_bytes(next);
        }
        n
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vchiq_primitives::HeapRegion;

    #[test]
    fn claim_release_cycles_through_the_range() {
        let heap = HeapRegion::new_zeroed(8 * FRAGMENT_SIZE);
        let pool = FragmentPool::new(heap.region(), 0, 2, 4);

        assert_eq!(pool.free_count(), 4);
        let a = pool.claim().unwrap();
        let b = pool.claim().unwrap();
        assert_eq!(a.index, 2);
        assert_eq!(b.index, 3);
        assert_eq!(pool.free_count(), 2);

        pool.release(a);
        let c = pool.claim().unwrap();
        assert_eq!(c.index, 2, "released fragment is reused first");

        pool.release(b);
        pool.release(c);
        assert_eq!(pool.free_count(), 4);
    }

    #[test]
    fn exhaustion_reports_out_of_memory() {
        let heap = HeapRegion::new_zeroed(4 * FRAGMENT_SIZE);
        let pool = FragmentPool::new(heap.region(), 0, 0, 2);

        let _a = pool.claim().unwrap();
        let _b = pool.claim().unwrap();
        assert_eq!(pool.claim().unwrap_err(), TransportError::OutOfMemory);
    }
}
