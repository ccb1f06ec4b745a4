// Memory management: physical page allocator, address-space builder, kernel heap.

pub mod heap;
pub mod paging;
pub mod phys;

pub use paging::{
    classify_fault, kernel_root, FaultStatus, FaultVerdict, PteFlags, VmmFlags, KERNEL_BASE,
    USER_ADDR_MAX,
};
pub use phys::{phys_to_virt, PhysAddr, PhysFlags, PhysStatus};

use crate::config::PAGE_SIZE;

pub const fn page_align_down(addr: u64) -> u64 {
    addr & !(PAGE_SIZE as u64 - 1)
}

pub const fn page_align_up(addr: u64) -> u64 {
    (addr + PAGE_SIZE as u64 - 1) & !(PAGE_SIZE as u64 - 1)
}

/// Bring up the whole memory subsystem from the platform's RAM ranges.
/// The boot heap comes first: the allocators below it use alloc containers.
pub fn init(ram_ranges: &[(PhysAddr, usize)]) -> Result<(), crate::error::KernelError> {
    heap::init_heap();
    phys::init(ram_ranges)?;
    paging::init_kernel_root()?;
    Ok(())
}

/// Hosted tests share one arena-backed memory subsystem, installed once.
#[cfg(test)]
pub fn ensure_test_init() {
    use spin::Once;
    static INIT: Once<()> = Once::new();
    INIT.call_once(|| {
        let (base, bytes) = phys::testutil::arena(16 * 1024);
        init(&[(base, bytes)]).expect("test memory init");
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_alignment_helpers() {
        assert_eq!(page_align_down(0x1fff), 0x1000);
        assert_eq!(page_align_up(0x1001), 0x2000);
        assert_eq!(page_align_up(0x2000), 0x2000);
    }
}
