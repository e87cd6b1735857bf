//! The object cache: three occupancy lists of slabs plus the public
//! alloc / free / shrink / release surface.

use core::ptr::NonNull;

#[cfg(feature = "log")]
use log::{debug, warn};

use crate::geometry::SlabGeometry;
use crate::page_source::PageSource;
use crate::slab_list::SlabList;
use crate::slab_node::SlabNode;
use crate::AllocResult;

/// Cumulative counters for one cache.
#[cfg(feature = "tracking")]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub slabs_acquired: u64,
    pub slabs_released: u64,
    pub objects_allocated: u64,
    pub objects_freed: u64,
}

/// Fixed-size object cache fed by a [`PageSource`].
///
/// Every slab the cache holds is in exactly one of three lists: `free`
/// (no live objects), `partial`, or `full`. Allocation prefers partial
/// slabs, then free slabs, and only then grows; `free` walks no list at
/// all, it recovers the slab straight from the pointer.
///
/// The cache never returns memory to the page source on its own. Use
/// [`shrink`](Self::shrink) to drop idle slabs and [`release`](Self::release)
/// to drop everything; a cache dropped without `release` leaks its regions.
pub struct SlabCache {
    geometry: SlabGeometry,
    free: SlabList,
    partial: SlabList,
    full: SlabList,
    #[cfg(feature = "tracking")]
    stats: CacheStats,
}

impl SlabCache {
    /// Sets up a cache for objects of `object_size` bytes (positive).
    ///
    /// Fails with [`AllocError::ConfigTooLarge`] when no slab order can
    /// house the header plus one object; no cache exists in that case.
    ///
    /// [`AllocError::ConfigTooLarge`]: crate::AllocError::ConfigTooLarge
    pub fn new(object_size: usize) -> AllocResult<Self> {
        Ok(Self {
            geometry: SlabGeometry::for_object_size(object_size)?,
            free: SlabList::new(),
            partial: SlabList::new(),
            full: SlabList::new(),
            #[cfg(feature = "tracking")]
            stats: CacheStats::default(),
        })
    }

    pub fn object_size(&self) -> usize {
        self.geometry.object_size()
    }

    pub fn slab_order(&self) -> u32 {
        self.geometry.slab_order()
    }

    pub fn objects_per_slab(&self) -> usize {
        self.geometry.objects_per_slab()
    }

    pub fn geometry(&self) -> &SlabGeometry {
        &self.geometry
    }

    /// Number of slabs with no live objects.
    pub fn free_slabs(&self) -> usize {
        self.free.len()
    }

    /// Number of slabs with some but not all slots live.
    pub fn partial_slabs(&self) -> usize {
        self.partial.len()
    }

    /// Number of slabs with every slot live.
    pub fn full_slabs(&self) -> usize {
        self.full.len()
    }

    #[cfg(feature = "tracking")]
    pub fn stats(&self) -> CacheStats {
        self.stats
    }

    /// Hands out one object of at least `object_size` bytes. The bytes are
    /// uninitialized.
    ///
    /// An [`AllocError::OutOfPages`] from the source propagates before the
    /// cache is touched, so a failed call changes nothing.
    ///
    /// [`AllocError::OutOfPages`]: crate::AllocError::OutOfPages
    pub fn alloc(&mut self, pages: &mut dyn PageSource) -> AllocResult<NonNull<u8>> {
        // Partial slabs first: they already have room, and topping them up
        // keeps the slab population dense.
        if let Some(base) = self.partial.back() {
            let mut node = SlabNode::new(base, self.geometry);
            let slot = match node.alloc_slot() {
                Some(slot) => slot,
                None => panic!("partial slab {:#x} has no free slot", base),
            };
            if node.is_full() {
                self.partial.remove(self.geometry, base);
                self.full.push_back(self.geometry, base);
            }
            return Ok(self.finish_alloc(node.object_addr(slot)));
        }

        if let Some(base) = self.free.pop_back(self.geometry) {
            let mut node = SlabNode::new(base, self.geometry);
            let slot = match node.alloc_slot() {
                Some(slot) => slot,
                None => panic!("free slab {:#x} has no free slot", base),
            };
            if node.is_full() {
                self.full.push_back(self.geometry, base);
            } else {
                self.partial.push_back(self.geometry, base);
            }
            return Ok(self.finish_alloc(node.object_addr(slot)));
        }

        // No room anywhere: grow by one slab.
        let base = pages.acquire(self.geometry.slab_order())?;
        debug!(
            "acquired slab {:#x} (order {})",
            base,
            self.geometry.slab_order()
        );
        let mut node = SlabNode::new(base, self.geometry);
        node.init_header();
        let slot = match node.alloc_slot() {
            Some(slot) => slot,
            None => panic!("fresh slab {:#x} has no free slot", base),
        };
        if node.is_full() {
            self.full.push_back(self.geometry, base);
        } else {
            self.partial.push_back(self.geometry, base);
        }
        #[cfg(feature = "tracking")]
        {
            self.stats.slabs_acquired += 1;
        }
        Ok(self.finish_alloc(node.object_addr(slot)))
    }

    fn finish_alloc(&mut self, addr: usize) -> NonNull<u8> {
        #[cfg(feature = "tracking")]
        {
            self.stats.objects_allocated += 1;
        }
        // Slab bases are non-null and the slot offset is positive.
        unsafe { NonNull::new_unchecked(addr as *mut u8) }
    }

    /// Returns `ptr` to the cache for reuse.
    ///
    /// `ptr` must come from a prior [`alloc`](Self::alloc) on this cache
    /// and must not have been freed since. Violations are caller bugs;
    /// they are detected on a best-effort basis and ignored.
    pub fn free(&mut self, ptr: NonNull<u8>) {
        let addr = ptr.as_ptr() as usize;
        let base = self.geometry.base_of(addr);
        let mut node = SlabNode::new(base, self.geometry);
        debug_assert!(node.is_valid(), "no slab header at {:#x}", base);

        let slot = match node.slot_index_of(addr) {
            Some(slot) => slot,
            None => {
                warn!("free of {:#x}: no such slot in slab {:#x}", addr, base);
                return;
            }
        };

        let was_full = node.is_full();
        if !node.free_slot(slot) {
            warn!("double free of {:#x} (slot {})", addr, slot);
            return;
        }

        if node.is_empty() {
            if was_full {
                self.full.remove(self.geometry, base);
            } else {
                self.partial.remove(self.geometry, base);
            }
            self.free.push_back(self.geometry, base);
        } else if was_full {
            self.full.remove(self.geometry, base);
            self.partial.push_back(self.geometry, base);
        }

        #[cfg(feature = "tracking")]
        {
            self.stats.objects_freed += 1;
        }
    }

    /// Releases every slab that holds no live objects back to the page
    /// source. Partial and full slabs are untouched.
    pub fn shrink(&mut self, pages: &mut dyn PageSource) {
        let released = Self::drain(&mut self.free, self.geometry, pages);
        if released > 0 {
            debug!("shrink returned {} slab(s)", released);
        }
        #[cfg(feature = "tracking")]
        {
            self.stats.slabs_released += released;
        }
    }

    /// Returns every region to the page source, live objects included.
    ///
    /// Afterwards all three lists are empty and every outstanding pointer
    /// is dead. The cache itself stays usable and grows again on the next
    /// [`alloc`](Self::alloc).
    pub fn release(&mut self, pages: &mut dyn PageSource) {
        let released = Self::drain(&mut self.free, self.geometry, pages)
            + Self::drain(&mut self.partial, self.geometry, pages)
            + Self::drain(&mut self.full, self.geometry, pages);
        if released > 0 {
            debug!("release returned {} slab(s)", released);
        }
        #[cfg(feature = "tracking")]
        {
            self.stats.slabs_released += released;
        }
    }

    fn drain(list: &mut SlabList, geometry: SlabGeometry, pages: &mut dyn PageSource) -> u64 {
        let mut released = 0;
        while let Some(base) = list.pop_back(geometry) {
            pages.release(base);
            released += 1;
        }
        released
    }
}

#[cfg(test)]
impl SlabCache {
    fn slab_count(&self) -> usize {
        self.free.len() + self.partial.len() + self.full.len()
    }

    /// Walks all three lists checking header validity, occupancy bands,
    /// and exclusive membership.
    fn check_invariants(&self) {
        let mut seen = alloc::vec::Vec::new();
        let capacity = self.geometry.objects_per_slab();

        for base in self.free.iter(self.geometry) {
            let node = SlabNode::new(base, self.geometry);
            assert!(node.is_valid());
            assert_eq!(node.in_use(), 0, "free slab {:#x} has live slots", base);
            assert!(!seen.contains(&base));
            seen.push(base);
        }
        for base in self.partial.iter(self.geometry) {
            let node = SlabNode::new(base, self.geometry);
            assert!(node.is_valid());
            assert!(
                node.in_use() > 0 && node.in_use() < capacity,
                "partial slab {:#x} has {} of {} slots live",
                base,
                node.in_use(),
                capacity
            );
            assert!(!seen.contains(&base));
            seen.push(base);
        }
        for base in self.full.iter(self.geometry) {
            let node = SlabNode::new(base, self.geometry);
            assert!(node.is_valid());
            assert_eq!(node.in_use(), capacity, "full slab {:#x} not full", base);
            assert!(!seen.contains(&base));
            seen.push(base);
        }
    }

    /// True when `addr` names a live slot of a slab this cache holds.
    fn holds_live(&self, addr: usize) -> bool {
        let base = self.geometry.base_of(addr);
        let in_lists = self
            .partial
            .iter(self.geometry)
            .chain(self.full.iter(self.geometry))
            .any(|b| b == base);
        if !in_lists {
            return false;
        }
        let node = SlabNode::new(base, self.geometry);
        match node.slot_index_of(addr) {
            Some(slot) => !node.slot_is_free(slot),
            None => false,
        }
    }
}
