// Physical page allocator.
//
// Free-range allocator over the RAM ranges the platform hands to `init`.
// Frames are reached through the identity physmap and zeroed on allocation.

use crate::config::PAGE_SIZE;
use crate::error::KernelError;
use crate::mem::{page_align_down, page_align_up};
use alloc::vec::Vec;
use spin::Mutex;

pub type PhysAddr = u64;

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PhysFlags: u32 {
        /// Allocate below the 16 MiB line for legacy DMA.
        const LOW = 1 << 0;
    }
}

/// Upper bound for `PhysFlags::LOW` allocations.
const LOW_LIMIT: u64 = 16 * 1024 * 1024;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PhysStatus {
    pub usable_pages: usize,
    pub used_pages: usize,
    pub reserved_pages: usize,
    pub highest_addr: PhysAddr,
}

/// Physical memory is addressed through an identity physmap: the kernel can
/// dereference a frame at its physical address.
#[inline]
pub fn phys_to_virt(pa: PhysAddr) -> *mut u8 {
    pa as *mut u8
}

pub struct FrameAllocator {
    /// Free ranges as (base, pages), sorted by base, never overlapping.
    free: Vec<(PhysAddr, usize)>,
    status: PhysStatus,
}

impl FrameAllocator {
    pub fn new() -> Self {
        Self {
            free: Vec::new(),
            status: PhysStatus::default(),
        }
    }

    /// Seed the allocator from RAM ranges given as (base, bytes).
    /// Partial pages at either end are dropped as reserved.
    pub fn init(&mut self, ram_ranges: &[(PhysAddr, usize)]) -> Result<(), KernelError> {
        if ram_ranges.is_empty() {
            return Err(KernelError::InvalidArgument);
        }

        for &(base, bytes) in ram_ranges {
            let start = page_align_up(base);
            let end = page_align_down(base + bytes as u64);
            if end <= start {
                continue;
            }
            let pages = ((end - start) as usize) / PAGE_SIZE;
            self.insert_free(start, pages);
            self.status.usable_pages += pages;
            self.status.highest_addr = self.status.highest_addr.max(end);

            let span_pages = (page_align_up(base + bytes as u64) - page_align_down(base)) as usize
                / PAGE_SIZE;
            self.status.reserved_pages += span_pages - pages;
        }

        if self.status.usable_pages == 0 {
            return Err(KernelError::InvalidArgument);
        }
        Ok(())
    }

    pub fn allocate(&mut self) -> PhysAddr {
        self.allocate_contiguous(1, PhysFlags::empty())
    }

    /// Allocate `pages` contiguous frames, zeroed. Returns 0 on exhaustion.
    pub fn allocate_contiguous(&mut self, pages: usize, flags: PhysFlags) -> PhysAddr {
        if pages == 0 {
            return 0;
        }

        let fit = self.free.iter().position(|&(base, len)| {
            if len < pages {
                return false;
            }
            if flags.contains(PhysFlags::LOW) {
                base + (pages * PAGE_SIZE) as u64 <= LOW_LIMIT
            } else {
                true
            }
        });

        let idx = match fit {
            Some(i) => i,
            None => return 0,
        };

        let (base, len) = self.free[idx];
        if len == pages {
            self.free.remove(idx);
        } else {
            self.free[idx] = (base + (pages * PAGE_SIZE) as u64, len - pages);
        }
        self.status.used_pages += pages;

        unsafe {
            core::ptr::write_bytes(phys_to_virt(base), 0, pages * PAGE_SIZE);
        }
        base
    }

    pub fn free(&mut self, pa: PhysAddr) {
        self.free_contiguous(pa, 1);
    }

    pub fn free_contiguous(&mut self, pa: PhysAddr, pages: usize) {
        if pa == 0 || pages == 0 {
            return;
        }
        self.insert_free(pa, pages);
        self.status.used_pages = self.status.used_pages.saturating_sub(pages);
    }

    pub fn status(&self, out: &mut PhysStatus) {
        *out = self.status;
    }

    /// Insert a free range, keeping the list sorted and coalesced.
    fn insert_free(&mut self, base: PhysAddr, pages: usize) {
        let idx = self
            .free
            .iter()
            .position(|&(b, _)| b > base)
            .unwrap_or(self.free.len());
        self.free.insert(idx, (base, pages));

        // Merge with successor, then predecessor.
        if idx + 1 < self.free.len() {
            let (b, l) = self.free[idx];
            let (nb, nl) = self.free[idx + 1];
            if b + (l * PAGE_SIZE) as u64 == nb {
                self.free[idx] = (b, l + nl);
                self.free.remove(idx + 1);
            }
        }
        if idx > 0 {
            let (pb, pl) = self.free[idx - 1];
            let (b, l) = self.free[idx];
            if pb + (pl * PAGE_SIZE) as u64 == b {
                self.free[idx - 1] = (pb, pl + l);
                self.free.remove(idx);
            }
        }
    }
}

static PMM: Mutex<Option<FrameAllocator>> = Mutex::new(None);

pub fn init(ram_ranges: &[(PhysAddr, usize)]) -> Result<(), KernelError> {
    let mut allocator = FrameAllocator::new();
    allocator.init(ram_ranges)?;
    let mut status = PhysStatus::default();
    allocator.status(&mut status);
    *PMM.lock() = Some(allocator);
    crate::info!(
        "pmm: {} usable pages, highest {:#x}",
        status.usable_pages,
        status.highest_addr
    );
    Ok(())
}

pub fn allocate() -> PhysAddr {
    match PMM.lock().as_mut() {
        Some(pmm) => pmm.allocate(),
        None => 0,
    }
}

pub fn allocate_contiguous(pages: usize, flags: PhysFlags) -> PhysAddr {
    match PMM.lock().as_mut() {
        Some(pmm) => pmm.allocate_contiguous(pages, flags),
        None => 0,
    }
}

pub fn free(pa: PhysAddr) {
    if let Some(pmm) = PMM.lock().as_mut() {
        pmm.free(pa);
    }
}

pub fn free_contiguous(pa: PhysAddr, pages: usize) {
    if let Some(pmm) = PMM.lock().as_mut() {
        pmm.free_contiguous(pa, pages);
    }
}

pub fn status(out: &mut PhysStatus) {
    if let Some(pmm) = PMM.lock().as_ref() {
        pmm.status(out);
    }
}

#[cfg(test)]
pub mod testutil {
    use super::*;

    /// Leak a page-aligned arena and return it as a fake RAM range.
    pub fn arena(pages: usize) -> (PhysAddr, usize) {
        let bytes = (pages + 1) * PAGE_SIZE;
        let buf = alloc::vec![0u8; bytes].leak();
        let base = page_align_up(buf.as_ptr() as u64);
        (base, pages * PAGE_SIZE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn allocator(pages: usize) -> FrameAllocator {
        let (base, bytes) = testutil::arena(pages);
        let mut pmm = FrameAllocator::new();
        pmm.init(&[(base, bytes)]).unwrap();
        pmm
    }

    #[test]
    fn allocate_returns_zeroed_distinct_frames() {
        let mut pmm = allocator(8);
        let a = pmm.allocate();
        let b = pmm.allocate();
        assert_ne!(a, 0);
        assert_ne!(b, 0);
        assert_ne!(a, b);
        let bytes = unsafe { core::slice::from_raw_parts(phys_to_virt(a), PAGE_SIZE) };
        assert!(bytes.iter().all(|&x| x == 0));
    }

    #[test]
    fn exhaustion_returns_zero_and_free_recovers() {
        let mut pmm = allocator(4);
        let frames: Vec<PhysAddr> = (0..4).map(|_| pmm.allocate()).collect();
        assert!(frames.iter().all(|&f| f != 0));
        assert_eq!(pmm.allocate(), 0);

        pmm.free(frames[2]);
        assert_eq!(pmm.allocate(), frames[2]);
    }

    #[test]
    fn contiguous_allocation_coalesces_after_free() {
        let mut pmm = allocator(8);
        let block = pmm.allocate_contiguous(4, PhysFlags::empty());
        assert_ne!(block, 0);
        pmm.free_contiguous(block, 4);
        let again = pmm.allocate_contiguous(8, PhysFlags::empty());
        assert_ne!(again, 0, "freed block should coalesce back");
    }

    #[test]
    fn status_tracks_usage() {
        let mut pmm = allocator(8);
        let mut st = PhysStatus::default();
        pmm.status(&mut st);
        assert_eq!(st.usable_pages, 8);
        assert_eq!(st.used_pages, 0);

        let f = pmm.allocate();
        pmm.status(&mut st);
        assert_eq!(st.used_pages, 1);
        pmm.free(f);
        pmm.status(&mut st);
        assert_eq!(st.used_pages, 0);
    }

    #[test]
    fn low_flag_is_honoured_or_fails() {
        // The test arena lives wherever the host heap is; a LOW request only
        // succeeds if that happens to be under the DMA line.
        let mut pmm = allocator(4);
        let pa = pmm.allocate_contiguous(1, PhysFlags::LOW);
        if pa != 0 {
            assert!(pa + PAGE_SIZE as u64 <= super::LOW_LIMIT);
        }
    }
}
