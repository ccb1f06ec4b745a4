// Kernel bootstrap.
//
// After the platform hands off (console, RAM map, SMP up), `kmain` brings
// the subsystems up, spawns the kernel worker and one idle thread per CPU,
// enables scheduling and parks the bootstrap path in the dispatcher. The
// worker launches lumen from the ramdisk and then pumps the server gateway
// and the syscall queue forever.

use crate::config::{idle_threshold, RAMDISK_MIN_IMAGE};
use crate::error::KernelError;
use crate::mem::PhysAddr;
use crate::platform;
use crate::sched;
use crate::syscall::queue::{dispatch_loop, syscall_process};
use crate::task::{self, table, Pid};

pub fn kmain(ram_ranges: &[(PhysAddr, usize)], ramdisk: Option<&'static [u8]>, cpus: usize) -> ! {
    #[cfg(all(target_arch = "x86_64", target_os = "none"))]
    platform::x86_64::serial_init();

    platform::set_cpu_count(cpus);
    if crate::mem::init(ram_ranges).is_err() {
        crate::error!("boot: no usable memory");
        platform::halt_all_cpus();
    }
    table::init_tables();
    crate::socket::init_sockets();
    if let Some(data) = ramdisk {
        crate::ramdisk::set(data);
    }

    let threshold = idle_threshold(cpus);
    if sched::kthread_create(kernel_worker_main, threshold as u64).is_err() {
        crate::error!("boot: cannot start kernel worker");
        platform::halt_all_cpus();
    }
    for _ in 0..cpus {
        if sched::kthread_create(idle_main, 0).is_err() {
            crate::error!("boot: cannot start idle thread");
            platform::halt_all_cpus();
        }
    }

    sched::set_scheduling(true);
    crate::info!("boot: scheduling enabled ({} cpus, idle threshold {})", cpus, threshold);
    // The bootstrap path ends here; from now on the dispatcher owns this CPU.
    dispatch_loop()
}

/// Load the lumen router image from the ramdisk and start it.
/// Anything at or under the minimum size is treated as absent.
pub fn load_lumen() -> Result<Pid, KernelError> {
    let image = match crate::ramdisk::find("lumen") {
        Some(image) if image.len() > RAMDISK_MIN_IMAGE => image,
        _ => {
            crate::error!("lumen not present");
            return Err(KernelError::NotFound);
        }
    };
    let pid = task::exec::execve_memory(image, &["lumen"], &[], task::kernel_pid())
        .map_err(|_| KernelError::InvalidArgument)?;
    task::set_lumen_pid(pid);
    crate::info!("boot: lumen started as pid {}", pid);
    Ok(pid)
}

/// The kernel worker: opens the server socket, launches lumen, then drains
/// server replies and the syscall queue, idling every `threshold` rounds.
fn kernel_worker_main(threshold: u64) -> ! {
    sched::set_local_sched(false);
    sched::set_scheduling(false);

    if let Some(pid) = crate::cpu::current().current_pid() {
        task::set_kernel_pid(pid);
    }

    if crate::server::server_init().is_err() {
        crate::error!("boot: kernel server socket failed");
        platform::halt_all_cpus();
    }
    if load_lumen().is_err() {
        platform::halt_all_cpus();
    }

    sched::set_scheduling(true);
    sched::set_local_sched(true);

    let threshold = threshold.max(1);
    let mut rounds = 0u64;
    loop {
        crate::server::server_idle();
        syscall_process();
        rounds += 1;
        if rounds % threshold == 0 {
            platform::platform_idle();
        }
    }
}

/// Idle threads drain the syscall queue and halt when it is empty.
fn idle_main(_arg: u64) -> ! {
    loop {
        if syscall_process() == 0 {
            platform::platform_idle();
        }
    }
}
