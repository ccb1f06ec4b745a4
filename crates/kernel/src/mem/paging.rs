// Page-table management.
//
// Four-level tables in the x86_64 shape, built from PMM frames and walked
// through the identity physmap. The kernel half (entries 256..512 of the
// root) is pre-populated once and aliased by value into every new root, so
// kernel mappings added later are visible in all address spaces.

use crate::config::PAGE_SIZE;
use crate::error::KernelError;
use crate::mem::phys::{self, phys_to_virt, PhysAddr};
use core::sync::atomic::{AtomicU64, Ordering};

/// First address past user space; everything below is per-process.
pub const USER_ADDR_MAX: u64 = 0x0000_8000_0000_0000;
/// Base of the kernel half.
pub const KERNEL_BASE: u64 = 0xFFFF_8000_0000_0000;

/// Kernel-half window used for kernel thread stacks.
pub const KSTACK_LOW: u64 = KERNEL_BASE + 0x4000_0000;
pub const KSTACK_HIGH: u64 = KERNEL_BASE + 0x8000_0000;

const ENTRIES: usize = 512;
const ADDR_MASK: u64 = 0x000F_FFFF_FFFF_F000;

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PteFlags: u64 {
        const PRESENT = 1 << 0;
        const WRITE = 1 << 1;
        const USER = 1 << 2;
        const NX = 1 << 63;
    }
}

bitflags::bitflags! {
    /// Permission bits callers request from the virtual allocator.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct VmmFlags: u32 {
        const USER = 1 << 0;
        const WRITE = 1 << 1;
        const EXEC = 1 << 2;
    }
}

bitflags::bitflags! {
    /// Page-fault status bits as delivered by the trap handler.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FaultStatus: u64 {
        const PRESENT = 1 << 0;
        const WRITE = 1 << 1;
        const USER = 1 << 2;
        const FETCH = 1 << 4;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultVerdict {
    /// User-mode fault: kill the offending thread, never the kernel.
    TerminateThread,
    /// Kernel-mode fault: unrecoverable.
    Fatal,
}

impl PteFlags {
    pub fn from_vmm(flags: VmmFlags) -> Self {
        let mut pte = PteFlags::PRESENT;
        if flags.contains(VmmFlags::WRITE) {
            pte |= PteFlags::WRITE;
        }
        if flags.contains(VmmFlags::USER) {
            pte |= PteFlags::USER;
        }
        if !flags.contains(VmmFlags::EXEC) {
            pte |= PteFlags::NX;
        }
        pte
    }
}

#[repr(transparent)]
#[derive(Clone, Copy)]
pub struct Pte(u64);

impl Pte {
    pub const fn empty() -> Self {
        Pte(0)
    }

    pub fn new(pa: PhysAddr, flags: PteFlags) -> Self {
        Pte((pa & ADDR_MASK) | flags.bits())
    }

    pub fn is_present(&self) -> bool {
        self.0 & PteFlags::PRESENT.bits() != 0
    }

    pub fn addr(&self) -> PhysAddr {
        self.0 & ADDR_MASK
    }

    pub fn flags(&self) -> PteFlags {
        PteFlags::from_bits_truncate(self.0)
    }
}

#[repr(C, align(4096))]
pub struct PageTable {
    pub entries: [Pte; ENTRIES],
}

/// View a frame as a page table through the physmap.
///
/// # Safety
/// `pa` must be a live table frame owned by the caller's address space.
unsafe fn table_mut(pa: PhysAddr) -> &'static mut PageTable {
    &mut *(phys_to_virt(pa) as *mut PageTable)
}

fn index(va: u64, level: usize) -> usize {
    ((va >> (12 + 9 * (level - 1))) & 0x1FF) as usize
}

/// Root of the kernel address space; every context's high half aliases it.
static KERNEL_ROOT: AtomicU64 = AtomicU64::new(0);

pub fn kernel_root() -> PhysAddr {
    KERNEL_ROOT.load(Ordering::Acquire)
}

/// Build the kernel root and pre-populate all 256 kernel-half slots so the
/// root entries never change after boot (aliasing copies them by value).
pub fn init_kernel_root() -> Result<(), KernelError> {
    if kernel_root() != 0 {
        return Ok(());
    }
    let root = phys::allocate();
    if root == 0 {
        return Err(KernelError::OutOfMemory);
    }
    let table = unsafe { table_mut(root) };
    for slot in ENTRIES / 2..ENTRIES {
        let l3 = phys::allocate();
        if l3 == 0 {
            return Err(KernelError::OutOfMemory);
        }
        table.entries[slot] = Pte::new(l3, PteFlags::PRESENT | PteFlags::WRITE);
    }
    KERNEL_ROOT.store(root, Ordering::Release);
    Ok(())
}

/// Allocate a fresh root whose kernel half aliases the kernel root.
pub fn new_root() -> Result<PhysAddr, KernelError> {
    let kroot = kernel_root();
    if kroot == 0 {
        return Err(KernelError::NotInitialized);
    }
    let root = phys::allocate();
    if root == 0 {
        return Err(KernelError::OutOfMemory);
    }
    let dst = unsafe { table_mut(root) };
    let src = unsafe { table_mut(kroot) };
    for slot in ENTRIES / 2..ENTRIES {
        dst.entries[slot] = src.entries[slot];
    }
    Ok(root)
}

/// Install a leaf mapping, creating intermediate tables as needed.
pub fn map_page(root: PhysAddr, va: u64, pa: PhysAddr, flags: PteFlags) -> Result<(), KernelError> {
    let mut table = unsafe { table_mut(root) };
    for level in (2..=4).rev() {
        let idx = index(va, level);
        let entry = table.entries[idx];
        let next = if entry.is_present() {
            entry.addr()
        } else {
            let frame = phys::allocate();
            if frame == 0 {
                return Err(KernelError::OutOfMemory);
            }
            table.entries[idx] = Pte::new(frame, PteFlags::PRESENT | PteFlags::WRITE | PteFlags::USER);
            frame
        };
        table = unsafe { table_mut(next) };
    }
    let idx = index(va, 1);
    if table.entries[idx].is_present() {
        return Err(KernelError::AlreadyExists);
    }
    table.entries[idx] = Pte::new(pa, flags);
    Ok(())
}

/// Remove a leaf mapping; the backing frame is returned, not freed.
pub fn unmap_page(root: PhysAddr, va: u64) -> Option<PhysAddr> {
    let mut table = unsafe { table_mut(root) };
    for level in (2..=4).rev() {
        let entry = table.entries[index(va, level)];
        if !entry.is_present() {
            return None;
        }
        table = unsafe { table_mut(entry.addr()) };
    }
    let idx = index(va, 1);
    let entry = table.entries[idx];
    if !entry.is_present() {
        return None;
    }
    table.entries[idx] = Pte::empty();
    Some(entry.addr())
}

/// Resolve `va` to its leaf frame and flags.
pub fn translate(root: PhysAddr, va: u64) -> Option<(PhysAddr, PteFlags)> {
    let mut table = unsafe { table_mut(root) };
    for level in (2..=4).rev() {
        let entry = table.entries[index(va, level)];
        if !entry.is_present() {
            return None;
        }
        table = unsafe { table_mut(entry.addr()) };
    }
    let entry = table.entries[index(va, 1)];
    if entry.is_present() {
        Some((entry.addr(), entry.flags()))
    } else {
        None
    }
}

/// Resolve `va` to a writable physmap pointer at the exact byte.
pub fn translate_byte(root: PhysAddr, va: u64) -> Option<*mut u8> {
    translate(root, va).map(|(pa, _)| unsafe { phys_to_virt(pa).add((va & 0xFFF) as usize) })
}

/// Replace the permission bits of an existing leaf mapping.
pub fn protect_page(root: PhysAddr, va: u64, flags: PteFlags) -> Result<(), KernelError> {
    let mut table = unsafe { table_mut(root) };
    for level in (2..=4).rev() {
        let entry = table.entries[index(va, level)];
        if !entry.is_present() {
            return Err(KernelError::NotFound);
        }
        table = unsafe { table_mut(entry.addr()) };
    }
    let idx = index(va, 1);
    let entry = table.entries[idx];
    if !entry.is_present() {
        return Err(KernelError::NotFound);
    }
    table.entries[idx] = Pte::new(entry.addr(), flags);
    Ok(())
}

/// Reserve `pages` contiguous virtual pages inside [range_low, range_high),
/// back each with a fresh frame and map with the requested permissions.
/// Returns the base virtual address, or 0 on failure.
pub fn vmm_allocate(
    root: PhysAddr,
    range_low: u64,
    range_high: u64,
    pages: usize,
    flags: VmmFlags,
) -> u64 {
    if pages == 0 {
        return 0;
    }
    let span = (pages * PAGE_SIZE) as u64;
    let mut va = crate::mem::page_align_up(range_low);

    'scan: while va + span <= range_high {
        for i in 0..pages {
            let probe = va + (i * PAGE_SIZE) as u64;
            if translate(root, probe).is_some() {
                va = probe + PAGE_SIZE as u64;
                continue 'scan;
            }
        }

        let pte = PteFlags::from_vmm(flags);
        for i in 0..pages {
            let page_va = va + (i * PAGE_SIZE) as u64;
            let frame = phys::allocate();
            if frame == 0 || map_page(root, page_va, frame, pte).is_err() {
                if frame != 0 {
                    phys::free(frame);
                }
                vmm_free(root, va, i);
                return 0;
            }
        }
        return va;
    }
    0
}

/// Undo `vmm_allocate`: unmap each page and release its frame.
pub fn vmm_free(root: PhysAddr, va: u64, pages: usize) {
    for i in 0..pages {
        if let Some(pa) = unmap_page(root, va + (i * PAGE_SIZE) as u64) {
            phys::free(pa);
        }
    }
}

/// Visit every mapped page in the user half as (va, pte).
pub fn walk_user_pages<F: FnMut(u64, Pte)>(root: PhysAddr, f: &mut F) {
    fn walk_level<F: FnMut(u64, Pte)>(table_pa: PhysAddr, level: usize, base: u64, f: &mut F) {
        let table = unsafe { table_mut(table_pa) };
        let limit = if level == 4 { ENTRIES / 2 } else { ENTRIES };
        for idx in 0..limit {
            let entry = table.entries[idx];
            if !entry.is_present() {
                continue;
            }
            let va = base + ((idx as u64) << (12 + 9 * (level - 1)));
            if level == 1 {
                f(va, entry);
            } else {
                walk_level(entry.addr(), level - 1, va, f);
            }
        }
    }
    walk_level(root, 4, 0, f);
}

/// Deep-copy the user half of `src_root` into `dst_root`: every leaf page
/// gets its own fresh frame with identical contents and permissions.
pub fn clone_user_space(dst_root: PhysAddr, src_root: PhysAddr) -> Result<(), KernelError> {
    let mut failed = false;
    walk_user_pages(src_root, &mut |va, entry| {
        if failed {
            return;
        }
        let frame = phys::allocate();
        if frame == 0 {
            failed = true;
            return;
        }
        unsafe {
            core::ptr::copy_nonoverlapping(
                phys_to_virt(entry.addr()),
                phys_to_virt(frame),
                PAGE_SIZE,
            );
        }
        if map_page(dst_root, va, frame, entry.flags()).is_err() {
            phys::free(frame);
            failed = true;
        }
    });
    if failed {
        free_user_space(dst_root);
        return Err(KernelError::OutOfMemory);
    }
    Ok(())
}

/// Free every user-half leaf frame and table frame under `root`.
/// The root frame itself stays; `clean_thread` releases it.
pub fn free_user_space(root: PhysAddr) {
    fn free_level(table_pa: PhysAddr, level: usize) {
        let table = unsafe { table_mut(table_pa) };
        for idx in 0..ENTRIES {
            let entry = table.entries[idx];
            if !entry.is_present() {
                continue;
            }
            if level == 1 {
                phys::free(entry.addr());
            } else {
                free_level(entry.addr(), level - 1);
                phys::free(entry.addr());
            }
            table.entries[idx] = Pte::empty();
        }
    }

    let table = unsafe { table_mut(root) };
    for idx in 0..ENTRIES / 2 {
        let entry = table.entries[idx];
        if !entry.is_present() {
            continue;
        }
        free_level(entry.addr(), 3);
        phys::free(entry.addr());
        table.entries[idx] = Pte::empty();
    }
}

/// Classify a page fault for the trap handler.
pub fn classify_fault(addr: u64, status: FaultStatus) -> FaultVerdict {
    if status.contains(FaultStatus::USER) {
        crate::debug!(
            "page fault at {:#x} (present={}, write={}, fetch={}): terminating thread",
            addr,
            status.contains(FaultStatus::PRESENT),
            status.contains(FaultStatus::WRITE),
            status.contains(FaultStatus::FETCH),
        );
        FaultVerdict::TerminateThread
    } else {
        crate::error!("kernel page fault at {:#x} ({:?})", addr, status);
        FaultVerdict::Fatal
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() {
        crate::mem::ensure_test_init();
    }

    #[test]
    fn map_translate_unmap() {
        setup();
        let root = new_root().unwrap();
        let frame = phys::allocate();
        let va = 0x40_0000;

        map_page(root, va, frame, PteFlags::PRESENT | PteFlags::WRITE | PteFlags::USER).unwrap();
        let (pa, flags) = translate(root, va).unwrap();
        assert_eq!(pa, frame);
        assert!(flags.contains(PteFlags::USER));

        // Double-map of the same page is refused.
        assert!(map_page(root, va, frame, PteFlags::PRESENT).is_err());

        assert_eq!(unmap_page(root, va), Some(frame));
        assert!(translate(root, va).is_none());
        phys::free(frame);
    }

    #[test]
    fn vmm_allocate_respects_window_and_frees() {
        setup();
        let root = new_root().unwrap();
        let base = vmm_allocate(root, 0x10_0000, 0x20_0000, 4, VmmFlags::USER | VmmFlags::WRITE);
        assert!(base >= 0x10_0000 && base + 4 * PAGE_SIZE as u64 <= 0x20_0000);

        // A second reservation lands elsewhere in the window.
        let other = vmm_allocate(root, 0x10_0000, 0x20_0000, 2, VmmFlags::USER | VmmFlags::WRITE);
        assert_ne!(other, 0);
        assert!(other >= base + 4 * PAGE_SIZE as u64 || other + 2 * (PAGE_SIZE as u64) <= base);

        vmm_free(root, base, 4);
        assert!(translate(root, base).is_none());
    }

    #[test]
    fn vmm_allocate_fails_when_window_too_small() {
        setup();
        let root = new_root().unwrap();
        assert_eq!(
            vmm_allocate(root, 0x10_0000, 0x10_2000, 4, VmmFlags::USER),
            0
        );
    }

    #[test]
    fn clone_copies_pages_privately() {
        setup();
        let parent = new_root().unwrap();
        let va = 0x1000;
        let base =
            vmm_allocate(parent, va, va + PAGE_SIZE as u64, 1, VmmFlags::USER | VmmFlags::WRITE);
        assert_eq!(base, va);
        unsafe {
            *(translate_byte(parent, va).unwrap() as *mut u16) = 0xDEAD;
        }

        let child = new_root().unwrap();
        clone_user_space(child, parent).unwrap();

        let child_ptr = translate_byte(child, va).unwrap() as *mut u16;
        let parent_ptr = translate_byte(parent, va).unwrap() as *mut u16;
        assert_ne!(child_ptr, parent_ptr, "clone must not share frames");
        unsafe {
            assert_eq!(*child_ptr, 0xDEAD);
            *parent_ptr = 0xBEEF;
            assert_eq!(*child_ptr, 0xDEAD, "parent write must not leak into child");
        }

        free_user_space(parent);
        free_user_space(child);
        phys::free(parent);
        phys::free(child);
    }

    #[test]
    fn free_user_space_unmaps_the_whole_low_half() {
        setup();
        let root = new_root().unwrap();
        let base = vmm_allocate(root, 0x200_0000, 0x300_0000, 8, VmmFlags::USER | VmmFlags::WRITE);
        assert_ne!(base, 0);

        free_user_space(root);
        for i in 0..8 {
            assert!(translate(root, base + (i * PAGE_SIZE) as u64).is_none());
        }

        // The low half is rebuildable afterwards.
        let again = vmm_allocate(root, 0x200_0000, 0x300_0000, 8, VmmFlags::USER | VmmFlags::WRITE);
        assert_ne!(again, 0);
        free_user_space(root);
        phys::free(root);
    }

    #[test]
    fn fault_classification() {
        setup();
        assert_eq!(
            classify_fault(0x4000, FaultStatus::USER | FaultStatus::WRITE),
            FaultVerdict::TerminateThread
        );
        assert_eq!(
            classify_fault(KERNEL_BASE + 0x100, FaultStatus::PRESENT),
            FaultVerdict::Fatal
        );
    }
}
