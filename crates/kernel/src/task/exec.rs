// ELF64 loading, execve-from-memory and fork.
//
// Static executables only: PT_LOAD segments are mapped eagerly with W^X
// enforced, entry and argv/envp go through `set_context`. Before the
// user-space file servers exist, images come from the boot ramdisk.

use crate::config::PAGE_SIZE;
use crate::error::Errno;
use crate::mem::paging::{self, map_page, protect_page, translate, PteFlags};
use crate::mem::{page_align_down, page_align_up, phys, PhysAddr, USER_ADDR_MAX};
use crate::platform::context::{
    clone_context, create_context, set_context, set_context_return, PrivilegeLevel,
};
use crate::syscall::uaccess::copy_to_user;
use crate::task::{table, IoKind, Pid, Thread, ThreadState, Tid};
use alloc::string::String;
use alloc::vec::Vec;

const ELF_MAGIC: [u8; 4] = [0x7F, b'E', b'L', b'F'];
const ELFCLASS64: u8 = 2;
const EM_X86_64: u16 = 62;

const PT_LOAD: u32 = 1;

const PF_X: u32 = 1;
const PF_W: u32 = 2;
const PF_R: u32 = 4;

#[repr(C)]
#[derive(Clone, Copy)]
struct Elf64Ehdr {
    e_ident: [u8; 16],
    e_type: u16,
    e_machine: u16,
    e_version: u32,
    e_entry: u64,
    e_phoff: u64,
    e_shoff: u64,
    e_flags: u32,
    e_ehsize: u16,
    e_phentsize: u16,
    e_phnum: u16,
    e_shentsize: u16,
    e_shnum: u16,
    e_shstrndx: u16,
}

#[repr(C)]
#[derive(Clone, Copy)]
struct Elf64Phdr {
    p_type: u32,
    p_flags: u32,
    p_offset: u64,
    p_vaddr: u64,
    p_paddr: u64,
    p_filesz: u64,
    p_memsz: u64,
    p_align: u64,
}

fn read_struct<T: Copy>(image: &[u8], offset: usize) -> Result<T, Errno> {
    let size = core::mem::size_of::<T>();
    if offset + size > image.len() {
        return Err(Errno::ENOEXEC);
    }
    // Alignment is not guaranteed in a byte buffer; read unaligned.
    Ok(unsafe { core::ptr::read_unaligned(image.as_ptr().add(offset) as *const T) })
}

/// Map and populate every PT_LOAD segment of `image` under `root`.
/// Returns the entry point and the highest mapped user address.
pub fn load_elf(root: PhysAddr, image: &[u8]) -> Result<(u64, u64), Errno> {
    let ehdr: Elf64Ehdr = read_struct(image, 0)?;
    if ehdr.e_ident[0..4] != ELF_MAGIC {
        return Err(Errno::ENOEXEC);
    }
    if ehdr.e_ident[4] != ELFCLASS64 || ehdr.e_machine != EM_X86_64 {
        return Err(Errno::ENOEXEC);
    }
    if ehdr.e_phnum == 0 {
        return Err(Errno::ENOEXEC);
    }

    let mut highest = 0u64;
    for i in 0..ehdr.e_phnum as usize {
        let phdr: Elf64Phdr =
            read_struct(image, ehdr.e_phoff as usize + i * ehdr.e_phentsize as usize)?;
        if phdr.p_type != PT_LOAD {
            continue;
        }
        if phdr.p_flags & PF_W != 0 && phdr.p_flags & PF_X != 0 {
            // W^X holds for loaded images.
            return Err(Errno::ENOEXEC);
        }
        if phdr.p_memsz < phdr.p_filesz {
            return Err(Errno::ENOEXEC);
        }
        let file_end = phdr
            .p_offset
            .checked_add(phdr.p_filesz)
            .ok_or(Errno::ENOEXEC)?;
        if file_end > image.len() as u64 {
            return Err(Errno::ENOEXEC);
        }

        let start = page_align_down(phdr.p_vaddr);
        let end = page_align_up(phdr.p_vaddr + phdr.p_memsz.max(1));
        if end > USER_ADDR_MAX {
            return Err(Errno::ENOEXEC);
        }

        // Writable while the bytes go in; final permissions afterwards.
        let mut va = start;
        while va < end {
            if translate(root, va).is_none() {
                let frame = phys::allocate();
                if frame == 0 {
                    return Err(Errno::ENOMEM);
                }
                map_page(
                    root,
                    va,
                    frame,
                    PteFlags::PRESENT | PteFlags::WRITE | PteFlags::USER | PteFlags::NX,
                )
                .map_err(|_| Errno::ENOMEM)?;
            }
            va += PAGE_SIZE as u64;
        }

        let data = &image[phdr.p_offset as usize..file_end as usize];
        copy_to_user(root, phdr.p_vaddr, data)?;

        // Readability is implied by PRESENT|USER; PF_R adds nothing here.
        let mut flags = PteFlags::PRESENT | PteFlags::USER;
        if phdr.p_flags & PF_W != 0 {
            flags |= PteFlags::WRITE;
        }
        if phdr.p_flags & PF_X == 0 {
            flags |= PteFlags::NX;
        }
        let mut va = start;
        while va < end {
            protect_page(root, va, flags).map_err(|_| Errno::ENOEXEC)?;
            va += PAGE_SIZE as u64;
        }
        highest = highest.max(end);
    }

    if highest == 0 {
        return Err(Errno::ENOEXEC);
    }
    Ok((ehdr.e_entry, highest))
}

/// Build a fresh process around an in-memory image and make its first
/// thread runnable. This is how lumen is launched at boot.
pub fn execve_memory(image: &[u8], argv: &[&str], envp: &[&str], ppid: Pid) -> Result<Pid, Errno> {
    let pid = table::create_process(ppid).map_err(|e| Errno::from(e))?;
    let ctx = create_context(PrivilegeLevel::User, 0, 0).map_err(Errno::from)?;
    let tid = table::alloc_tid().map_err(Errno::from)?;
    let mut thread = Thread::new(tid, pid, ctx, 1);

    let (entry, highest) = match load_elf(thread.ctx.root, image) {
        Ok(v) => v,
        Err(e) => {
            crate::platform::context::clean_thread(&mut thread.ctx);
            return Err(e);
        }
    };
    thread.highest = highest;
    set_context(&mut thread, entry, argv, envp).map_err(Errno::from)?;

    table::insert_thread(thread).map_err(Errno::from)?;
    crate::sched::enqueue_thread(tid);
    crate::info!("exec: pid {} entry {:#x}", pid, entry);
    Ok(pid)
}

/// Replace the calling thread's image with a ramdisk member. Until the file
/// servers come up the ramdisk is the only image source the kernel itself
/// can read.
pub fn execve_ramdisk(tid: Tid, path: &str, argv: &[String], envp: &[String]) -> Result<(), Errno> {
    let name = path.trim_start_matches('/');
    let image = crate::ramdisk::find(name).ok_or(Errno::ENOENT)?;

    let root = table::with_thread(tid, |t| t.ctx.root).ok_or(Errno::ESRCH)?;
    paging::free_user_space(root);
    table::with_thread(tid, |t| {
        t.highest = 0;
        t.ctx.signal_trampoline = 0;
    });

    let (entry, highest) = load_elf(root, image)?;
    let argv_refs: Vec<&str> = argv.iter().map(|s| s.as_str()).collect();
    let envp_refs: Vec<&str> = envp.iter().map(|s| s.as_str()).collect();
    table::with_thread(tid, |t| {
        t.highest = highest;
        set_context(t, entry, &argv_refs, &envp_refs)
    })
    .ok_or(Errno::ESRCH)?
    .map_err(Errno::from)?;
    Ok(())
}

/// Fork the calling thread's process: deep-copied address space, duplicated
/// descriptor table, child returns 0.
pub fn fork(parent_tid: Tid) -> Result<Pid, Errno> {
    let parent_pid = table::with_thread(parent_tid, |t| t.pid).ok_or(Errno::ESRCH)?;
    let child_pid = table::alloc_pid().map_err(Errno::from)?;

    let child_proc = table::with_process(parent_pid, |p| p.fork_from(child_pid))
        .ok_or(Errno::ESRCH)?;
    // Shared sockets gain a reference per inherited slot.
    for (_, slot) in child_proc.io.iter() {
        if slot.kind == IoKind::Socket {
            crate::socket::incref(slot.payload as u32);
        }
    }
    {
        let mut guard = table::processes();
        let procs = guard.as_mut().ok_or(Errno::ESRCH)?;
        procs.insert(child_pid, child_proc).map_err(Errno::from)?;
    }

    let child_tid = table::alloc_tid().map_err(Errno::from)?;
    let mut ctx = create_context(PrivilegeLevel::User, 0, 0).map_err(Errno::from)?;

    let cloned = table::with_thread(parent_tid, |parent| {
        let copy = clone_context(&mut ctx, &parent.ctx);
        (copy, parent.highest, parent.priority)
    })
    .ok_or(Errno::ESRCH)?;
    let (copy_result, parent_highest, priority) = cloned;
    if let Err(e) = copy_result {
        crate::platform::context::clean_thread(&mut ctx);
        table::processes().as_mut().and_then(|p| p.remove(child_pid));
        return Err(Errno::from(e));
    }

    // Child resumes at the same point with return value 0.
    set_context_return(&mut ctx, 0);

    let mut child = Thread::new(child_tid, child_pid, ctx, priority);
    child.highest = parent_highest;
    child.state = ThreadState::Blocked;
    table::insert_thread(child).map_err(Errno::from)?;
    crate::sched::enqueue_thread(child_tid);

    crate::debug!("fork: {} -> {}", parent_pid, child_pid);
    Ok(child_pid)
}

#[cfg(test)]
pub mod testimage {
    use super::*;

    /// Assemble a minimal static ELF64 image: one PT_LOAD at `vaddr`
    /// containing `code`.
    pub fn minimal_elf(vaddr: u64, code: &[u8]) -> Vec<u8> {
        let ehsize = core::mem::size_of::<Elf64Ehdr>();
        let phsize = core::mem::size_of::<Elf64Phdr>();
        let code_off = ehsize + phsize;

        let mut e_ident = [0u8; 16];
        e_ident[0..4].copy_from_slice(&ELF_MAGIC);
        e_ident[4] = ELFCLASS64;
        e_ident[5] = 1; // little endian
        e_ident[6] = 1; // current version

        let ehdr = Elf64Ehdr {
            e_ident,
            e_type: 2, // ET_EXEC
            e_machine: EM_X86_64,
            e_version: 1,
            e_entry: vaddr,
            e_phoff: ehsize as u64,
            e_shoff: 0,
            e_flags: 0,
            e_ehsize: ehsize as u16,
            e_phentsize: phsize as u16,
            e_phnum: 1,
            e_shentsize: 0,
            e_shnum: 0,
            e_shstrndx: 0,
        };
        let phdr = Elf64Phdr {
            p_type: PT_LOAD,
            p_flags: PF_R | PF_X,
            p_offset: code_off as u64,
            p_vaddr: vaddr,
            p_paddr: vaddr,
            p_filesz: code.len() as u64,
            p_memsz: code.len() as u64,
            p_align: PAGE_SIZE as u64,
        };

        let mut out = Vec::with_capacity(code_off + code.len());
        out.extend_from_slice(unsafe {
            core::slice::from_raw_parts(&ehdr as *const _ as *const u8, ehsize)
        });
        out.extend_from_slice(unsafe {
            core::slice::from_raw_parts(&phdr as *const _ as *const u8, phsize)
        });
        out.extend_from_slice(code);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mem::paging::new_root;

    fn setup() {
        crate::mem::ensure_test_init();
        table::ensure_test_tables();
    }

    #[test]
    fn load_elf_maps_segment_with_wx_enforced() {
        setup();
        let image = testimage::minimal_elf(0x40_0000, &[0x0F, 0x05, 0xC3]);
        let root = new_root().unwrap();
        let (entry, highest) = load_elf(root, &image).unwrap();
        assert_eq!(entry, 0x40_0000);
        assert_eq!(highest, 0x40_1000);

        let (_, flags) = translate(root, 0x40_0000).unwrap();
        assert!(flags.contains(PteFlags::USER));
        assert!(!flags.contains(PteFlags::WRITE));
        assert!(!flags.contains(PteFlags::NX), "code segment stays executable");

        // Bytes landed where the segment said.
        let ptr = paging::translate_byte(root, 0x40_0000).unwrap();
        assert_eq!(unsafe { core::slice::from_raw_parts(ptr, 3) }, &[0x0F, 0x05, 0xC3]);
    }

    #[test]
    fn load_elf_rejects_bad_magic_and_machine() {
        setup();
        let root = new_root().unwrap();

        let mut bad_magic = testimage::minimal_elf(0x40_0000, &[0x90]);
        bad_magic[0] = 0;
        assert_eq!(load_elf(root, &bad_magic).unwrap_err(), Errno::ENOEXEC);

        let mut bad_machine = testimage::minimal_elf(0x40_0000, &[0x90]);
        bad_machine[18] = 183; // EM_AARCH64
        assert_eq!(load_elf(root, &bad_machine).unwrap_err(), Errno::ENOEXEC);

        assert_eq!(load_elf(root, &[0u8; 10]).unwrap_err(), Errno::ENOEXEC);
    }

    #[test]
    fn execve_memory_builds_runnable_process() {
        let _g = crate::tests_lock();
        setup();
        crate::sched::set_scheduling(true);
        let image = testimage::minimal_elf(0x40_0000, &[0x90, 0x90]);
        let pid = execve_memory(&image, &["init"], &[], 1).unwrap();

        let tid = table::with_process(pid, |p| p.threads[0]).unwrap();
        assert_eq!(
            table::with_thread(tid, |t| t.state),
            Some(ThreadState::Queued)
        );
        assert_eq!(
            table::with_thread(tid, |t| t.ctx.regs.rip),
            Some(0x40_0000)
        );
        crate::sched::terminate_thread(tid, 0, false);
    }

    #[test]
    fn fork_deep_copies_user_memory() {
        let _g = crate::tests_lock();
        setup();
        crate::sched::set_scheduling(true);
        let image = testimage::minimal_elf(0x40_0000, &[0x90; 16]);
        let parent_pid = execve_memory(&image, &["p"], &[], 1).unwrap();
        let parent_tid = table::with_process(parent_pid, |p| p.threads[0]).unwrap();

        // Plant a heap value in the parent.
        let parent_root = table::with_thread(parent_tid, |t| t.ctx.root).unwrap();
        let va = 0x50_0000;
        assert_ne!(
            paging::vmm_allocate(
                parent_root,
                va,
                va + PAGE_SIZE as u64,
                1,
                paging::VmmFlags::USER | paging::VmmFlags::WRITE
            ),
            0
        );
        unsafe {
            *(paging::translate_byte(parent_root, va).unwrap() as *mut u16) = 0xDEAD;
        }

        let child_pid = fork(parent_tid).unwrap();
        let child_tid = table::with_process(child_pid, |p| p.threads[0]).unwrap();
        let child_root = table::with_thread(child_tid, |t| t.ctx.root).unwrap();

        unsafe {
            let child_ptr = paging::translate_byte(child_root, va).unwrap() as *mut u16;
            assert_eq!(*child_ptr, 0xDEAD);
            // Parent writes after the fork stay private.
            *(paging::translate_byte(parent_root, va).unwrap() as *mut u16) = 0xBEEF;
            assert_eq!(*child_ptr, 0xDEAD);
        }

        // Child returns 0, parent sees the child pid from the handler.
        assert_eq!(table::with_thread(child_tid, |t| t.ctx.regs.rax), Some(0));

        crate::sched::terminate_thread(child_tid, 0, false);
        crate::sched::terminate_thread(parent_tid, 0, false);
    }
}
