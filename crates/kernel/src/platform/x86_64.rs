// x86_64 bare-metal plumbing: IRQ gate, CR3 switch, halt, serial console.
// Only compiled for the kernel target; the hosted build keeps mirrors in
// `cpu.rs` instead.

use core::fmt::Write;
use spin::Mutex;
use uart_16550::SerialPort;
use x86_64::instructions::interrupts;
use x86_64::registers::control::{Cr3, Cr3Flags};
use x86_64::structures::paging::PhysFrame;
use x86_64::PhysAddr;

/// CPU id of the executing core. The SMP shim programs this into per-CPU
/// storage during AP bring-up; the bootstrap core is 0.
pub fn cpu_id() -> usize {
    0
}

pub fn irq_save() -> bool {
    let enabled = interrupts::are_enabled();
    interrupts::disable();
    enabled
}

pub fn irq_restore(enabled: bool) {
    if enabled {
        interrupts::enable();
    } else {
        interrupts::disable();
    }
}

pub fn halt_once() {
    x86_64::instructions::hlt();
}

pub fn halt_forever() -> ! {
    interrupts::disable();
    loop {
        x86_64::instructions::hlt();
    }
}

pub fn write_root(root: u64) {
    unsafe {
        Cr3::write(
            PhysFrame::containing_address(PhysAddr::new(root)),
            Cr3Flags::empty(),
        );
    }
}

static SERIAL: Mutex<Option<SerialPort>> = Mutex::new(None);

pub fn serial_init() {
    let mut port = unsafe { SerialPort::new(0x3F8) };
    port.init();
    *SERIAL.lock() = Some(port);
    crate::log::set_console(serial_sink);
}

fn serial_sink(s: &str) {
    if let Some(port) = SERIAL.lock().as_mut() {
        let _ = port.write_str(s);
    }
}

/// Restore a full register file and return to it with `iretq`.
///
/// # Safety
/// `regs` must describe a resumable context whose address space is active.
pub unsafe fn context_restore(regs: &crate::platform::context::Registers) -> ! {
    core::arch::asm!(
        "mov rax, rdi",
        // Interrupt frame: ss, rsp, rflags, cs, rip.
        "push qword ptr [rax + 152]",
        "push qword ptr [rax + 136]",
        "push qword ptr [rax + 128]",
        "push qword ptr [rax + 144]",
        "push qword ptr [rax + 120]",
        "mov rbx, [rax + 8]",
        "mov rcx, [rax + 16]",
        "mov rdx, [rax + 24]",
        "mov rsi, [rax + 32]",
        "mov rdi, [rax + 40]",
        "mov rbp, [rax + 48]",
        "mov r8,  [rax + 56]",
        "mov r9,  [rax + 64]",
        "mov r10, [rax + 72]",
        "mov r11, [rax + 80]",
        "mov r12, [rax + 88]",
        "mov r13, [rax + 96]",
        "mov r14, [rax + 104]",
        "mov r15, [rax + 112]",
        "mov rax, [rax]",
        "iretq",
        in("rdi") regs,
        options(noreturn),
    )
}
