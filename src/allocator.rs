//! Near-memory allocator: reserves executable pages within reach of one or
//! more target addresses and sub-allocates fixed-alignment blocks from them.

use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;

use crate::os::{self, Access};

/// Blocks are always a multiple of this many bytes.
const BLOCK_ALIGNMENT: usize = 16;

/// Default proximity window: the signed-32-bit displacement a near branch
/// can encode.
pub const DEFAULT_MAX_DISTANCE: usize = 0x7FFF_FFFF;

/// Fresh regions are filled with this trap opcode before first use.
const FILL_BYTE: u8 = 0xCC;

fn align_up(value: usize, align: usize) -> usize {
    (value + align - 1) & !(align - 1)
}

fn align_down(value: usize, align: usize) -> usize {
    value & !(align - 1)
}

fn in_range(address: usize, desired: &[usize], max_distance: usize) -> bool {
    desired.iter().all(|&d| address.abs_diff(d) <= max_distance)
}

#[derive(Clone, Copy)]
struct Block {
    base: usize,
    size: usize,
    free: bool,
}

struct Region {
    base: usize,
    size: usize,
    /// Arena-index block list instead of an intrusive linked list, to keep
    /// merge-on-free from reaching through owned pointers under the lock.
    blocks: Vec<Block>,
}

/// Process-wide (or test-local) near-memory allocator.
#[derive(Clone)]
pub struct Allocator(Arc<Mutex<Vec<Region>>>);

static GLOBAL: OnceLock<Allocator> = OnceLock::new();

impl Allocator {
    pub fn new() -> Self {
        Self(Arc::new(Mutex::new(Vec::new())))
    }

    /// The process-wide singleton allocator.
    pub fn get() -> Self {
        GLOBAL.get_or_init(Self::new).clone()
    }

    /// Allocate `size` bytes with no placement constraint.
    pub fn allocate(&self, size: usize) -> Option<Allocation> {
        self.allocate_near(&[], size, usize::MAX)
    }

    /// Allocate `size` bytes within `max_distance` of every address in
    /// `desired_addresses`. An empty list places no constraint.
    pub fn allocate_near(
        &self,
        desired_addresses: &[usize],
        size: usize,
        max_distance: usize,
    ) -> Option<Allocation> {
        if size == 0 {
            return None;
        }

        let mut regions = self.0.lock();
        let aligned = align_up(size, BLOCK_ALIGNMENT);

        if let Some(base) = Self::take_from_regions(&mut regions, desired_addresses, aligned, max_distance) {
            return Some(self.wrap(base, size));
        }

        let region = Self::reserve_region(desired_addresses, size, max_distance)?;
        regions.push(region);

        let base = Self::take_from_regions(&mut regions, desired_addresses, aligned, max_distance)?;
        Some(self.wrap(base, size))
    }

    fn wrap(&self, address: usize, size: usize) -> Allocation {
        Allocation {
            allocator: self.clone(),
            address,
            size,
        }
    }

    /// Phase 1: satisfy the request from an already-reserved region,
    /// splitting the matched block if it is larger than needed.
    fn take_from_regions(
        regions: &mut [Region],
        desired: &[usize],
        aligned_size: usize,
        max_distance: usize,
    ) -> Option<usize> {
        for region in regions.iter_mut() {
            if region.size < aligned_size {
                continue;
            }
            for i in 0..region.blocks.len() {
                let block = region.blocks[i];
                if !block.free || block.size < aligned_size {
                    continue;
                }
                if !in_range(block.base, desired, max_distance) {
                    continue;
                }

                if block.size > aligned_size {
                    let remainder = Block {
                        base: block.base + aligned_size,
                        size: block.size - aligned_size,
                        free: true,
                    };
                    region.blocks.insert(i + 1, remainder);
                }
                region.blocks[i].size = aligned_size;
                region.blocks[i].free = false;
                return Some(region.blocks[i].base);
            }
        }
        None
    }

    /// Phase 2: reserve a brand-new region near the desired addresses.
    fn reserve_region(desired: &[usize], size: usize, max_distance: usize) -> Option<Region> {
        let si = os::system_info();
        let alloc_size = align_up(size, si.granularity);

        let Some(&pivot_addr) = desired.first() else {
            let base = os::vm_alloc(0, alloc_size, Access::RWX).ok()?;
            return Some(Self::fill_region(base, alloc_size));
        };

        let mut search_start = si.min_address;
        let mut search_end = si.max_address;
        if pivot_addr.saturating_sub(search_start) > max_distance {
            search_start = pivot_addr.saturating_sub(max_distance);
        }
        if search_end.saturating_sub(pivot_addr) > max_distance {
            search_end = pivot_addr.saturating_add(max_distance);
        }
        search_start = search_start.max(si.min_address);
        search_end = search_end.min(si.max_address);
        let pivot = align_up(pivot_addr, si.granularity);

        if let Some(base) = Self::search_backward(pivot, search_start, desired, max_distance, alloc_size, &si) {
            return Some(Self::fill_region(base, alloc_size));
        }
        if let Some(base) = Self::search_forward(pivot, search_end, desired, max_distance, alloc_size, &si) {
            return Some(Self::fill_region(base, alloc_size));
        }
        None
    }

    fn search_backward(
        start: usize,
        search_start: usize,
        desired: &[usize],
        max_distance: usize,
        alloc_size: usize,
        si: &os::SystemInfo,
    ) -> Option<usize> {
        let mut p = start;
        loop {
            if p <= search_start || !in_range(p, desired, max_distance) {
                return None;
            }
            let info = os::vm_query(p).ok()?;
            if info.free && in_range(p, desired, max_distance) {
                if let Ok(base) = os::vm_alloc(p, alloc_size, Access::RWX) {
                    if in_range(base, desired, max_distance) {
                        return Some(base);
                    }
                    os::vm_free(base);
                }
            }
            let next = align_down(info.base.wrapping_sub(1), si.granularity);
            if next >= p {
                return None;
            }
            p = next;
        }
    }

    fn search_forward(
        start: usize,
        search_end: usize,
        desired: &[usize],
        max_distance: usize,
        alloc_size: usize,
        _si: &os::SystemInfo,
    ) -> Option<usize> {
        let mut p = start;
        loop {
            if p >= search_end || !in_range(p, desired, max_distance) {
                return None;
            }
            let info = os::vm_query(p).ok()?;
            if info.free && in_range(p, desired, max_distance) {
                if let Ok(base) = os::vm_alloc(p, alloc_size, Access::RWX) {
                    if in_range(base, desired, max_distance) {
                        return Some(base);
                    }
                    os::vm_free(base);
                }
            }
            let next = p.saturating_add(info.size.max(1));
            if next <= p {
                return None;
            }
            p = next;
        }
    }

    fn fill_region(base: usize, size: usize) -> Region {
        // SAFETY: base was just reserved by vm_alloc with RWX access and is
        // exactly `size` bytes.
        unsafe {
            std::ptr::write_bytes(base as *mut u8, FILL_BYTE, size);
        }
        Region {
            base,
            size,
            blocks: vec![Block {
                base,
                size,
                free: true,
            }],
        }
    }

    fn deallocate(&self, address: usize) {
        let mut regions = self.0.lock();
        for region in regions.iter_mut() {
            if address < region.base || address >= region.base + region.size {
                continue;
            }
            let Some(idx) = region.blocks.iter().position(|b| b.base == address) else {
                return;
            };
            region.blocks[idx].free = true;

            while idx + 1 < region.blocks.len() && region.blocks[idx + 1].free {
                let next = region.blocks.remove(idx + 1);
                region.blocks[idx].size += next.size;
            }
            if idx > 0 && region.blocks[idx - 1].free {
                let current = region.blocks.remove(idx);
                region.blocks[idx - 1].size += current.size;
            }
            return;
        }
        // Address was never returned by this allocator: no-op by design.
    }
}

impl Default for Allocator {
    fn default() -> Self {
        Self::new()
    }
}

/// A handle to a contiguous, executable byte range carved out of a region.
/// Move-only; dropping a live allocation returns its block to the free pool.
pub struct Allocation {
    allocator: Allocator,
    address: usize,
    size: usize,
}

impl Allocation {
    pub fn address(&self) -> usize {
        self.address
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn as_ptr<T>(&self) -> *const T {
        self.address as *const T
    }

    pub fn as_mut_ptr<T>(&self) -> *mut T {
        self.address as *mut T
    }

    /// Release the block back to the allocator's free pool. Idempotent;
    /// also invoked from `Drop`.
    pub fn free(&mut self) {
        if self.address != 0 {
            self.allocator.deallocate(self.address);
            self.address = 0;
            self.size = 0;
        }
    }
}

impl Drop for Allocation {
    fn drop(&mut self) {
        self.free();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn basic_allocation() {
        let alloc = Allocator::new();
        let a = alloc.allocate(1024).expect("allocate");
        assert_ne!(a.address(), 0);
        assert_eq!(a.size(), 1024);
    }

    #[test]
    fn proximity_constraint_is_honored() {
        let alloc = Allocator::new();
        let desired = 0x0000_7000_0000_0000usize;
        let max_distance = 0x1000_0000;
        if let Some(a) = alloc.allocate_near(&[desired], 64, max_distance) {
            assert!(a.address().abs_diff(desired) <= max_distance);
        }
    }

    #[test]
    fn block_layout_split_and_coalesce() {
        // Mirrors the "Logic Test" scenario from the original test suite:
        // three allocations of 16, 16, 32 pack tightly, freeing coalesces.
        let alloc = Allocator::new();
        let base_alloc = alloc.allocate(16).expect("a1");
        let base = base_alloc.address();

        let mut a2 = alloc.allocate(16).expect("a2");
        assert_eq!(a2.address(), base + 16);

        let mut a3 = alloc.allocate(32).expect("a3");
        assert_eq!(a3.address(), base + 32);

        a2.free();
        let a4 = alloc.allocate(32).expect("a4");
        assert_eq!(a4.address(), base + 64);

        a3.free();
        let a5 = alloc.allocate(48).expect("a5");
        assert_eq!(a5.address(), base + 16);
    }

    #[test]
    fn zero_size_request_fails() {
        let alloc = Allocator::new();
        assert!(alloc.allocate(0).is_none());
    }

    #[test]
    fn freeing_unknown_address_is_a_silent_noop() {
        let alloc = Allocator::new();
        alloc.deallocate(0xdead_beef);
    }
}
