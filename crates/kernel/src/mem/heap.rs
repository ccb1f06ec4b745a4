// Kernel heap.
//
// Two layers: `kmalloc`/`kfree` hand out page-granular blocks straight from
// the PMM for payload buffers (socket messages, loaded images), and the
// freestanding global allocator backs the alloc:: containers.

use crate::config::PAGE_SIZE;
use crate::mem::phys::{self, phys_to_virt, PhysFlags};

#[repr(C)]
struct AllocHeader {
    byte_size: usize,
    page_size: usize,
}

const HEADER_SIZE: usize = core::mem::size_of::<AllocHeader>();

/// Allocate `bytes` of kernel memory backed by whole pages.
///
/// Every allocation consumes at least one page: the header sits at the base
/// of the block and the caller's pointer starts just past it. Callers with
/// tight budgets should size requests in page multiples.
pub fn kmalloc(bytes: usize) -> *mut u8 {
    if bytes == 0 {
        return core::ptr::null_mut();
    }
    let pages = (bytes + HEADER_SIZE).div_ceil(PAGE_SIZE);
    let base = phys::allocate_contiguous(pages, PhysFlags::empty());
    if base == 0 {
        return core::ptr::null_mut();
    }
    unsafe {
        let header = phys_to_virt(base) as *mut AllocHeader;
        (*header).byte_size = bytes;
        (*header).page_size = pages;
        phys_to_virt(base).add(HEADER_SIZE)
    }
}

/// Release a `kmalloc` block. The header is recovered by rounding the
/// pointer down to its page boundary.
pub fn kfree(ptr: *mut u8) {
    if ptr.is_null() {
        return;
    }
    let base = (ptr as u64) & !(PAGE_SIZE as u64 - 1);
    unsafe {
        let header = phys_to_virt(base) as *const AllocHeader;
        let pages = (*header).page_size;
        phys::free_contiguous(base, pages);
    }
}

/// Usable byte size recorded for a `kmalloc` block.
pub fn ksize(ptr: *const u8) -> usize {
    if ptr.is_null() {
        return 0;
    }
    let base = (ptr as u64) & !(PAGE_SIZE as u64 - 1);
    unsafe { (*(phys_to_virt(base) as *const AllocHeader)).byte_size }
}

#[cfg(not(test))]
mod global {
    use linked_list_allocator::LockedHeap;

    #[global_allocator]
    static ALLOCATOR: LockedHeap = LockedHeap::empty();

    const BOOT_HEAP_SIZE: usize = 4 * 1024 * 1024;

    #[repr(align(4096))]
    struct BootHeap([u8; BOOT_HEAP_SIZE]);

    static mut BOOT_HEAP: BootHeap = BootHeap([0; BOOT_HEAP_SIZE]);

    /// Point the global allocator at the boot heap. Idempotent-by-construction
    /// callers (`mem::init`) invoke it exactly once.
    pub fn init_heap() {
        unsafe {
            let base = core::ptr::addr_of_mut!(BOOT_HEAP) as *mut u8;
            ALLOCATOR.lock().init(base, BOOT_HEAP_SIZE);
        }
    }
}

#[cfg(not(test))]
pub use global::init_heap;

/// Hosted builds run on the host allocator; nothing to initialise.
#[cfg(test)]
pub fn init_heap() {}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() {
        crate::mem::ensure_test_init();
    }

    #[test]
    fn kmalloc_round_trips_data() {
        setup();
        let ptr = kmalloc(100);
        assert!(!ptr.is_null());
        assert_eq!(ksize(ptr), 100);
        unsafe {
            for i in 0..100 {
                *ptr.add(i) = i as u8;
            }
            for i in 0..100 {
                assert_eq!(*ptr.add(i), i as u8);
            }
        }
        kfree(ptr);
    }

    #[test]
    fn kmalloc_spans_pages_when_needed() {
        setup();
        let ptr = kmalloc(3 * PAGE_SIZE);
        assert!(!ptr.is_null());
        unsafe {
            // Touch first and last byte of the usable region.
            *ptr = 0xAA;
            *ptr.add(3 * PAGE_SIZE - 1) = 0xBB;
            assert_eq!(*ptr, 0xAA);
            assert_eq!(*ptr.add(3 * PAGE_SIZE - 1), 0xBB);
        }
        kfree(ptr);
    }

    #[test]
    fn kfree_permits_reallocation() {
        setup();
        for _ in 0..4 {
            let ptr = kmalloc(PAGE_SIZE * 2);
            assert!(!ptr.is_null());
            assert_eq!(ksize(ptr), PAGE_SIZE * 2);
            kfree(ptr);
        }
    }

    #[test]
    fn zero_byte_request_yields_null() {
        setup();
        assert!(kmalloc(0).is_null());
        kfree(core::ptr::null_mut());
    }
}
