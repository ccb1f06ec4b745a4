// Thread context operations.
//
// A Context is the saved register file, the address-space root and the
// I/O-port bitmap of one thread. The operations here are the whole contract
// between the portable kernel and the register-level world: everything else
// manipulates contexts only through them.

use crate::config::{PAGE_SIZE, PLATFORM_THREAD_STACK, USER_STACK_PAGES};
use crate::error::KernelError;
use crate::mem::paging::{
    self, kernel_root, translate_byte, vmm_allocate, vmm_free, VmmFlags, KSTACK_HIGH, KSTACK_LOW,
    USER_ADDR_MAX,
};
use crate::mem::{page_align_up, phys, PhysAddr};
use crate::platform::ioport::IoPortBitmap;
use crate::task::Thread;

const RFLAGS_IF: u64 = 1 << 9;

const KERNEL_CS: u64 = 0x08;
const KERNEL_SS: u64 = 0x10;
const USER_CS: u64 = 0x1B;
const USER_SS: u64 = 0x23;

/// Longest string `set_context` will place in an argument page.
const ARG_MAX: usize = PAGE_SIZE - 1;

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct Registers {
    pub rax: u64,
    pub rbx: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub rsi: u64,
    pub rdi: u64,
    pub rbp: u64,
    pub r8: u64,
    pub r9: u64,
    pub r10: u64,
    pub r11: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
    pub rip: u64,
    pub rflags: u64,
    pub rsp: u64,
    pub cs: u64,
    pub ss: u64,
}

/// Register snapshot the trap stub hands to `save_context`.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct TrapFrame {
    pub regs: Registers,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrivilegeLevel {
    Kernel,
    User,
}

pub struct Context {
    pub regs: Registers,
    /// Page-table root; the high half aliases the kernel root.
    pub root: PhysAddr,
    pub iopb: IoPortBitmap,
    /// Kernel stack backing (kernel-level contexts only).
    kernel_stack: u64,
    kernel_stack_pages: usize,
    /// User-space address of the signal-return stub, 0 until `set_context`.
    pub signal_trampoline: u64,
}

/// Build a fresh context at the given privilege level.
///
/// The register file is zeroed, interrupts are enabled in the saved flags,
/// the address space aliases the kernel half, and all I/O ports are denied.
/// Kernel contexts get a stack and start at `entry` with `arg` in the first
/// argument register; user contexts are completed later by `set_context`.
pub fn create_context(
    level: PrivilegeLevel,
    entry: u64,
    arg: u64,
) -> Result<Context, KernelError> {
    let root = paging::new_root()?;
    let mut ctx = Context {
        regs: Registers::default(),
        root,
        iopb: IoPortBitmap::deny_all(),
        kernel_stack: 0,
        kernel_stack_pages: 0,
        signal_trampoline: 0,
    };
    ctx.regs.rflags = RFLAGS_IF;

    match level {
        PrivilegeLevel::Kernel => {
            ctx.regs.cs = KERNEL_CS;
            ctx.regs.ss = KERNEL_SS;
            let pages = PLATFORM_THREAD_STACK / PAGE_SIZE;
            let stack = vmm_allocate(kernel_root(), KSTACK_LOW, KSTACK_HIGH, pages, VmmFlags::WRITE);
            if stack == 0 {
                phys::free(root);
                return Err(KernelError::OutOfMemory);
            }
            ctx.kernel_stack = stack;
            ctx.kernel_stack_pages = pages;
            ctx.regs.rsp = stack + (pages * PAGE_SIZE) as u64;
            ctx.regs.rip = entry;
            ctx.regs.rdi = arg;
        }
        PrivilegeLevel::User => {
            ctx.regs.cs = USER_CS;
            ctx.regs.ss = USER_SS;
        }
    }
    Ok(ctx)
}

/// Write `bytes` into the context's address space at `va`.
fn write_user(root: PhysAddr, va: u64, bytes: &[u8]) -> Result<(), KernelError> {
    // One mapping per page: the callers below never cross a page boundary.
    let ptr = translate_byte(root, va).ok_or(KernelError::BadAddress)?;
    unsafe {
        core::ptr::copy_nonoverlapping(bytes.as_ptr(), ptr, bytes.len());
    }
    Ok(())
}

/// x86_64 signal-return stub: mov rax, SYS_SIGRETURN; syscall.
fn trampoline_code() -> [u8; 9] {
    let nr = crate::syscall::numbers::SYS_SIGRETURN as u32;
    let imm = nr.to_le_bytes();
    [0x48, 0xC7, 0xC0, imm[0], imm[1], imm[2], imm[3], 0x0F, 0x05]
}

/// Finish a user context: lay out argv/envp pages above the watermark, build
/// the two null-terminated pointer arrays, install the stack and the signal
/// trampoline, and advance the thread's heap watermark.
pub fn set_context(
    thread: &mut Thread,
    entry: u64,
    argv: &[&str],
    envp: &[&str],
) -> Result<(), KernelError> {
    let root = thread.ctx.root;

    for s in argv.iter().chain(envp.iter()) {
        if s.len() > ARG_MAX {
            return Err(KernelError::InvalidArgument);
        }
    }

    // Guard page, then one page per string, then the pointer-array page,
    // then the trampoline page.
    let base = page_align_up(thread.highest) + PAGE_SIZE as u64;
    let nstrings = argv.len() + envp.len();
    let total_pages = nstrings + 2;
    if (argv.len() + 1 + envp.len() + 1) * 8 > PAGE_SIZE {
        return Err(KernelError::InvalidArgument);
    }

    let area = vmm_allocate(
        root,
        base,
        base + (total_pages * PAGE_SIZE) as u64,
        total_pages,
        VmmFlags::USER | VmmFlags::WRITE,
    );
    if area == 0 {
        return Err(KernelError::OutOfMemory);
    }

    let mut string_vas = alloc::vec::Vec::with_capacity(nstrings);
    for (i, s) in argv.iter().chain(envp.iter()).enumerate() {
        let va = area + (i * PAGE_SIZE) as u64;
        write_user(root, va, s.as_bytes())?;
        write_user(root, va + s.len() as u64, &[0])?;
        string_vas.push(va);
    }

    // Pointer arrays share the page after the strings: argv first, envp after
    // its null terminator.
    let arrays_va = area + (nstrings * PAGE_SIZE) as u64;
    let mut offset = 0u64;
    for &va in string_vas[..argv.len()].iter() {
        write_user(root, arrays_va + offset, &va.to_le_bytes())?;
        offset += 8;
    }
    write_user(root, arrays_va + offset, &0u64.to_le_bytes())?;
    offset += 8;
    let envp_va = arrays_va + offset;
    for &va in string_vas[argv.len()..].iter() {
        write_user(root, arrays_va + offset, &va.to_le_bytes())?;
        offset += 8;
    }
    write_user(root, arrays_va + offset, &0u64.to_le_bytes())?;

    // Signal-return trampoline in its own executable page.
    let trampoline_va = area + ((total_pages - 1) * PAGE_SIZE) as u64;
    write_user(root, trampoline_va, &trampoline_code())?;
    paging::protect_page(
        root,
        trampoline_va,
        paging::PteFlags::PRESENT | paging::PteFlags::USER,
    )?;
    thread.ctx.signal_trampoline = trampoline_va;

    // Stack directly below the user address limit, one unmapped guard page
    // beneath it.
    let stack_low = USER_ADDR_MAX - (USER_STACK_PAGES * PAGE_SIZE) as u64;
    let stack = vmm_allocate(
        root,
        stack_low,
        USER_ADDR_MAX,
        USER_STACK_PAGES,
        VmmFlags::USER | VmmFlags::WRITE,
    );
    if stack == 0 {
        vmm_free(root, area, total_pages);
        return Err(KernelError::OutOfMemory);
    }

    thread.ctx.regs.rip = entry;
    thread.ctx.regs.rsp = USER_ADDR_MAX - 16;
    thread.ctx.regs.rdi = arrays_va;
    thread.ctx.regs.rsi = envp_va;
    thread.highest = area + (total_pages * PAGE_SIZE) as u64;
    Ok(())
}

/// Clone `parent` into `child`: byte-copy of the register file, deep copy of
/// the user half into the child's (empty) address space.
pub fn clone_context(child: &mut Context, parent: &Context) -> Result<(), KernelError> {
    child.regs = parent.regs;
    child.iopb = parent.iopb.clone();
    child.signal_trampoline = parent.signal_trampoline;
    paging::clone_user_space(child.root, parent.root)
}

/// Capture the trap frame into the context.
pub fn save_context(ctx: &mut Context, frame: &TrapFrame) {
    ctx.regs = frame.regs;
}

/// Resume the context; does not return.
#[cfg(all(target_arch = "x86_64", target_os = "none"))]
pub fn load_context(ctx: &Context) -> ! {
    crate::platform::switch_root(ctx.root);
    unsafe { super::x86_64::context_restore(&ctx.regs) }
}

#[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
pub fn load_context(ctx: &Context) -> ! {
    crate::platform::switch_root(ctx.root);
    panic!("load_context is only reachable on the kernel target");
}

/// Write the syscall return register.
pub fn set_context_return(ctx: &mut Context, value: i64) {
    ctx.regs.rax = value as u64;
}

/// Switch only the address-space root to this context's.
pub fn use_context(ctx: &Context) {
    crate::platform::switch_root(ctx.root);
}

/// Release everything the context owns: every user page and table page, the
/// root, and the kernel stack if one was allocated.
pub fn clean_thread(ctx: &mut Context) {
    if ctx.root != 0 {
        paging::free_user_space(ctx.root);
        phys::free(ctx.root);
        ctx.root = 0;
    }
    if ctx.kernel_stack != 0 {
        vmm_free(kernel_root(), ctx.kernel_stack, ctx.kernel_stack_pages);
        ctx.kernel_stack = 0;
    }
}

/// Materialise the thread's syscall request from its saved registers:
/// function number from rax, four parameters from rdi/rsi/rdx/r10.
pub fn create_syscall_context(thread: &mut Thread) {
    let regs = &thread.ctx.regs;
    thread.request.number = regs.rax as usize;
    thread.request.params = [regs.rdi, regs.rsi, regs.rdx, regs.r10];
    thread.request.busy = false;
    thread.request.retry = false;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::Thread;

    fn setup() {
        crate::mem::ensure_test_init();
    }

    #[test]
    fn kernel_context_gets_stack_and_entry() {
        setup();
        let mut ctx = create_context(PrivilegeLevel::Kernel, 0xFFFF_8000_1234_0000, 42).unwrap();
        assert_ne!(ctx.root, 0);
        assert_eq!(ctx.regs.rip, 0xFFFF_8000_1234_0000);
        assert_eq!(ctx.regs.rdi, 42);
        assert_ne!(ctx.regs.rsp, 0);
        assert_eq!(ctx.regs.rflags & RFLAGS_IF, RFLAGS_IF);
        assert!(!ctx.iopb.is_custom());
        clean_thread(&mut ctx);
    }

    #[test]
    fn user_context_starts_empty() {
        setup();
        let mut ctx = create_context(PrivilegeLevel::User, 0, 0).unwrap();
        assert_eq!(ctx.regs.rip, 0);
        assert_eq!(ctx.regs.rsp, 0);
        assert_eq!(ctx.regs.cs, USER_CS);
        clean_thread(&mut ctx);
    }

    #[test]
    fn set_context_lays_out_argv_and_stack() {
        setup();
        let ctx = create_context(PrivilegeLevel::User, 0, 0).unwrap();
        let mut thread = Thread::for_tests(ctx);
        set_context(&mut thread, 0x40_1000, &["lumen", "--root"], &["TERM=lux"]).unwrap();

        let regs = thread.ctx.regs;
        assert_eq!(regs.rip, 0x40_1000);
        assert!(regs.rsp < USER_ADDR_MAX);
        assert!(regs.rsp >= USER_ADDR_MAX - (USER_STACK_PAGES * PAGE_SIZE) as u64);

        // argv[0] pointer resolves to the string bytes.
        let root = thread.ctx.root;
        let argv0_ptr = translate_byte(root, regs.rdi).unwrap();
        let argv0 = u64::from_le_bytes(unsafe { *(argv0_ptr as *const [u8; 8]) });
        let s = translate_byte(root, argv0).unwrap();
        let text = unsafe { core::slice::from_raw_parts(s, 5) };
        assert_eq!(text, b"lumen");

        // envp array begins after argv's null terminator.
        assert_eq!(regs.rsi, regs.rdi + 3 * 8);
        // Watermark advanced past the block.
        assert!(thread.highest > 0);
        assert_ne!(thread.ctx.signal_trampoline, 0);

        let mut ctx = thread.ctx;
        clean_thread(&mut ctx);
    }

    #[test]
    fn clone_then_return_value_does_not_perturb_original() {
        setup();
        let mut parent = create_context(PrivilegeLevel::User, 0, 0).unwrap();
        parent.regs.rax = 7;
        let mut child = create_context(PrivilegeLevel::User, 0, 0).unwrap();
        clone_context(&mut child, &parent).unwrap();

        set_context_return(&mut child, 99);
        assert_eq!(child.regs.rax, 99);
        assert_eq!(parent.regs.rax, 7);

        clean_thread(&mut parent);
        clean_thread(&mut child);
    }

    #[test]
    fn syscall_context_extraction() {
        setup();
        let ctx = create_context(PrivilegeLevel::User, 0, 0).unwrap();
        let mut thread = Thread::for_tests(ctx);
        thread.ctx.regs.rax = 37;
        thread.ctx.regs.rdi = 1;
        thread.ctx.regs.rsi = 0x4000;
        thread.ctx.regs.rdx = 128;
        thread.ctx.regs.r10 = 0;
        thread.request.busy = true;
        thread.request.retry = true;

        create_syscall_context(&mut thread);
        assert_eq!(thread.request.number, 37);
        assert_eq!(thread.request.params, [1, 0x4000, 128, 0]);
        assert!(!thread.request.busy);
        assert!(!thread.request.retry);

        let mut ctx = thread.ctx;
        clean_thread(&mut ctx);
    }
}
