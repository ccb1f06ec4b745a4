// Platform abstraction.
//
// The context blob and its operations are the portable contract the rest of
// the kernel programs against. The trap and interrupt plumbing behind them is
// wired up by the platform shim; on hosted builds the privileged pieces keep
// per-CPU mirrors instead so the contract stays observable.

pub mod context;
pub mod ioport;

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
pub mod x86_64;

pub use context::{
    clean_thread, clone_context, create_context, create_syscall_context, load_context,
    save_context, set_context, set_context_return, use_context, Context, PrivilegeLevel,
    TrapFrame,
};
pub use ioport::IoPortBitmap;

use core::sync::atomic::{AtomicUsize, Ordering};

/// Number of CPUs the platform reported at boot.
static CPU_COUNT: AtomicUsize = AtomicUsize::new(1);

pub fn set_cpu_count(n: usize) {
    CPU_COUNT.store(n.clamp(1, crate::config::MAX_CPUS), Ordering::Relaxed);
}

pub fn cpu_count() -> usize {
    CPU_COUNT.load(Ordering::Relaxed)
}

/// Identify the executing CPU.
#[cfg(all(target_arch = "x86_64", target_os = "none"))]
pub fn current_cpu_id() -> usize {
    x86_64::cpu_id()
}

/// Hosted test builds hand every OS thread its own CPU slot so per-CPU
/// state and the reentrant scheduler lock behave as they do on hardware.
#[cfg(test)]
pub fn current_cpu_id() -> usize {
    use core::cell::Cell;
    static NEXT: AtomicUsize = AtomicUsize::new(0);
    std::thread_local! {
        static SLOT: Cell<Option<usize>> = Cell::new(None);
    }
    SLOT.with(|slot| match slot.get() {
        Some(id) => id,
        None => {
            let id = NEXT.fetch_add(1, Ordering::Relaxed) % crate::config::MAX_CPUS;
            slot.set(Some(id));
            id
        }
    })
}

#[cfg(all(not(test), not(all(target_arch = "x86_64", target_os = "none"))))]
pub fn current_cpu_id() -> usize {
    0
}

/// Disable interrupts on this CPU, returning whether they were enabled.
pub fn irq_save() -> bool {
    #[cfg(all(target_arch = "x86_64", target_os = "none"))]
    {
        x86_64::irq_save()
    }
    #[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
    {
        crate::cpu::get(current_cpu_id()).irq_mirror_save()
    }
}

/// Restore the interrupt state captured by `irq_save`.
pub fn irq_restore(enabled: bool) {
    #[cfg(all(target_arch = "x86_64", target_os = "none"))]
    {
        x86_64::irq_restore(enabled);
    }
    #[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
    {
        crate::cpu::get(current_cpu_id()).irq_mirror_restore(enabled);
    }
}

pub fn irq_enable() {
    irq_restore(true);
}

pub fn irq_disable() {
    let _ = irq_save();
}

/// Park the CPU until the next interrupt.
pub fn platform_idle() {
    #[cfg(all(target_arch = "x86_64", target_os = "none"))]
    {
        x86_64::halt_once();
    }
    #[cfg(all(test, not(target_os = "none")))]
    {
        std::thread::yield_now();
    }
}

/// Install `root` as the active address-space root on this CPU.
pub fn switch_root(root: u64) {
    crate::cpu::get(current_cpu_id()).set_active_root(root);
    #[cfg(all(target_arch = "x86_64", target_os = "none"))]
    {
        x86_64::write_root(root);
    }
}

/// Stop every CPU after a fatal invariant violation. Logs are already out.
pub fn halt_all_cpus() -> ! {
    #[cfg(all(target_arch = "x86_64", target_os = "none"))]
    {
        x86_64::halt_forever();
    }
    #[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
    {
        panic!("halt_all_cpus");
    }
}
