// Platform abstraction: one facade, two backends. The embedded backend does
// register-level context switches through the saved stack pointer; the
// hosted backend meets the same contract by parking and waking one OS thread
// per process fiber. Only one context ever runs at a time on either side.

#[cfg(not(target_os = "none"))]
pub mod hosted;

#[cfg(all(target_arch = "riscv32", target_os = "none"))]
pub mod riscv;

use crate::process::Slot;

/// Transfer control to `target`, updating `current`. Returns when something
/// later switches back to the caller.
pub fn switch_to(target: Slot) {
    #[cfg(not(target_os = "none"))]
    hosted::switch_to(target);

    #[cfg(all(target_arch = "riscv32", target_os = "none"))]
    riscv::switch_to(target);
}

/// Relinquish the CPU to the next runnable process.
pub fn yield_now() {
    #[cfg(not(target_os = "none"))]
    {
        // The dedicated scheduler fiber picks the next process.
        hosted::switch_to(hosted::SCHEDULER_CTX);
    }

    #[cfg(all(target_arch = "riscv32", target_os = "none"))]
    {
        // No scheduler context on the embedded target: pick directly. This
        // is also where terminated processes get destroyed, since the code
        // here never runs on a terminated process's own stack for long.
        crate::kernel::reap_terminated();
        let next = crate::kernel::with(|k| k.procs.next_runnable());
        riscv::switch_to(next);
    }
}

/// Stop executing the calling process forever. The descriptor must already
/// be marked Terminated.
pub fn exit_current() -> ! {
    #[cfg(not(target_os = "none"))]
    hosted::exit_current();

    #[cfg(all(target_arch = "riscv32", target_os = "none"))]
    {
        loop {
            yield_now();
        }
    }
}

pub fn putchar(byte: u8) {
    #[cfg(not(target_os = "none"))]
    hosted::putchar(byte);

    #[cfg(all(target_arch = "riscv32", target_os = "none"))]
    riscv::putchar(byte);
}

pub fn getchar() -> Option<u8> {
    #[cfg(not(target_os = "none"))]
    return hosted::getchar();

    #[cfg(all(target_arch = "riscv32", target_os = "none"))]
    return riscv::getchar();
}

/// Address of the user-mode entry trampoline that `create` seeds as the
/// return address for user-image processes.
pub fn user_entry_addr() -> usize {
    #[cfg(not(target_os = "none"))]
    {
        // Known-absent primitive on this backend.
        panic!("binary image loading is not supported on the hosted backend");
    }

    #[cfg(all(target_arch = "riscv32", target_os = "none"))]
    {
        riscv::user_entry as usize
    }
}

/// The physical span of the kernel image plus managed RAM, identity-mapped
/// into every address space on the embedded target.
#[cfg(all(target_arch = "riscv32", target_os = "none"))]
pub fn kernel_image_range() -> (usize, usize) {
    riscv::kernel_image_range()
}
