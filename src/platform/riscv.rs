// Embedded RISC-V backend: register-level context switches through the
// saved stack pointer, sret into user mode, and a trap path that lands
// every ecall in the syscall dispatcher. Console is the memory-mapped UART
// of the virt machine.

use core::arch::{asm, naked_asm};

use volatile::Volatile;

use crate::kernel;
use crate::memory::PageAddr;
use crate::process::Slot;

extern "C" {
    static __kernel_base: u8;
    static __free_ram: u8;
    static __free_ram_end: u8;
}

pub fn free_ram_range() -> (PageAddr, PageAddr) {
    let start = unsafe { &__free_ram as *const u8 as usize };
    let end = unsafe { &__free_ram_end as *const u8 as usize };
    (PageAddr::new(start), PageAddr::new(end))
}

pub fn kernel_image_range() -> (usize, usize) {
    let base = unsafe { &__kernel_base as *const u8 as usize };
    let end = unsafe { &__free_ram_end as *const u8 as usize };
    (base, end)
}

// 8250-style UART on the virt machine.
const UART_BASE: usize = 0x1000_0000;
const UART_THR: usize = UART_BASE;
const UART_RBR: usize = UART_BASE;
const UART_LSR: usize = UART_BASE + 5;
const UART_LSR_RX_READY: u8 = 1 << 0;
const UART_LSR_TX_IDLE: u8 = 1 << 5;

pub fn putchar(byte: u8) {
    unsafe {
        while Volatile::new(&mut *(UART_LSR as *mut u8)).read() & UART_LSR_TX_IDLE == 0 {}
        Volatile::new(&mut *(UART_THR as *mut u8)).write(byte);
    }
}

pub fn getchar() -> Option<u8> {
    unsafe {
        if Volatile::new(&mut *(UART_LSR as *mut u8)).read() & UART_LSR_RX_READY != 0 {
            Some(Volatile::new(&mut *(UART_RBR as *mut u8)).read())
        } else {
            None
        }
    }
}

struct UartWriter;

impl core::fmt::Write for UartWriter {
    fn write_str(&mut self, s: &str) -> core::fmt::Result {
        for byte in s.bytes() {
            putchar(byte);
        }
        Ok(())
    }
}

pub fn console_print(args: core::fmt::Arguments) {
    use core::fmt::Write;
    let _ = UartWriter.write_fmt(args);
}

/// Swap to `target`'s saved context. The callee-saved frame layout here
/// (ra + s0..s11, 13 words) is the one `create` seeds on a fresh stack.
pub fn switch_to(target: Slot) {
    let (prev_sp, next_sp) = kernel::with(|k| {
        let prev = k.procs.current;
        k.procs.current = target;
        (
            &mut k.procs.procs[prev].stack_ptr as *mut usize,
            &mut k.procs.procs[target].stack_ptr as *mut usize,
        )
    });
    // The descriptors live in the static kernel singleton, so the pointers
    // stay valid across the unlock.
    unsafe { switch_context(prev_sp, next_sp) };
}

#[unsafe(naked)]
unsafe extern "C" fn switch_context(_prev_sp: *mut usize, _next_sp: *mut usize) {
    naked_asm!(
        ".align 2",
        "addi sp, sp, -13 * 4",
        "sw ra,  0  * 4(sp)",
        "sw s0,  1  * 4(sp)",
        "sw s1,  2  * 4(sp)",
        "sw s2,  3  * 4(sp)",
        "sw s3,  4  * 4(sp)",
        "sw s4,  5  * 4(sp)",
        "sw s5,  6  * 4(sp)",
        "sw s6,  7  * 4(sp)",
        "sw s7,  8  * 4(sp)",
        "sw s8,  9  * 4(sp)",
        "sw s9,  10 * 4(sp)",
        "sw s10, 11 * 4(sp)",
        "sw s11, 12 * 4(sp)",
        "sw sp, (a0)",
        "lw sp, (a1)",
        "lw ra,  0  * 4(sp)",
        "lw s0,  1  * 4(sp)",
        "lw s1,  2  * 4(sp)",
        "lw s2,  3  * 4(sp)",
        "lw s3,  4  * 4(sp)",
        "lw s4,  5  * 4(sp)",
        "lw s5,  6  * 4(sp)",
        "lw s6,  7  * 4(sp)",
        "lw s7,  8  * 4(sp)",
        "lw s8,  9  * 4(sp)",
        "lw s9,  10 * 4(sp)",
        "lw s10, 11 * 4(sp)",
        "lw s11, 12 * 4(sp)",
        "addi sp, sp, 13 * 4",
        "ret",
    )
}

const SSTATUS_SPIE: usize = 1 << 5;

/// Drop from supervisor to user mode at the process's user program counter.
pub fn user_entry() {
    let (pc, sp_top) = kernel::with(|k| {
        let p = k.procs.current();
        (p.user_pc, p.stack.as_ptr() as usize + p.stack.len())
    });
    unsafe {
        asm!(
            "csrw sscratch, {kernel_sp}",
            "csrw sepc, {sepc}",
            "csrw sstatus, {sstatus}",
            "sret",
            kernel_sp = in(reg) sp_top,
            sepc = in(reg) pc,
            sstatus = in(reg) SSTATUS_SPIE,
            options(noreturn),
        )
    }
}

/// Registers saved by `kernel_entry`, in stack order.
#[repr(C)]
pub struct TrapFrame {
    pub ra: usize,
    pub gp: usize,
    pub tp: usize,
    pub t0: usize,
    pub t1: usize,
    pub t2: usize,
    pub t3: usize,
    pub t4: usize,
    pub t5: usize,
    pub t6: usize,
    pub a0: usize,
    pub a1: usize,
    pub a2: usize,
    pub a3: usize,
    pub a4: usize,
    pub a5: usize,
    pub a6: usize,
    pub a7: usize,
    pub s0: usize,
    pub s1: usize,
    pub s2: usize,
    pub s3: usize,
    pub s4: usize,
    pub s5: usize,
    pub s6: usize,
    pub s7: usize,
    pub s8: usize,
    pub s9: usize,
    pub s10: usize,
    pub s11: usize,
    pub sp: usize,
}

pub fn install_trap_handler() {
    unsafe {
        asm!("csrw stvec, {}", in(reg) kernel_entry as usize);
    }
}

// Swap in the kernel stack via sscratch, save the full register file, and
// hand off to handle_trap.
#[unsafe(naked)]
unsafe extern "C" fn kernel_entry() {
    naked_asm!(
        ".align 2",
        "csrrw sp, sscratch, sp",
        "addi sp, sp, -4 * 31",
        "sw ra,  4 * 0(sp)",
        "sw gp,  4 * 1(sp)",
        "sw tp,  4 * 2(sp)",
        "sw t0,  4 * 3(sp)",
        "sw t1,  4 * 4(sp)",
        "sw t2,  4 * 5(sp)",
        "sw t3,  4 * 6(sp)",
        "sw t4,  4 * 7(sp)",
        "sw t5,  4 * 8(sp)",
        "sw t6,  4 * 9(sp)",
        "sw a0,  4 * 10(sp)",
        "sw a1,  4 * 11(sp)",
        "sw a2,  4 * 12(sp)",
        "sw a3,  4 * 13(sp)",
        "sw a4,  4 * 14(sp)",
        "sw a5,  4 * 15(sp)",
        "sw a6,  4 * 16(sp)",
        "sw a7,  4 * 17(sp)",
        "sw s0,  4 * 18(sp)",
        "sw s1,  4 * 19(sp)",
        "sw s2,  4 * 20(sp)",
        "sw s3,  4 * 21(sp)",
        "sw s4,  4 * 22(sp)",
        "sw s5,  4 * 23(sp)",
        "sw s6,  4 * 24(sp)",
        "sw s7,  4 * 25(sp)",
        "sw s8,  4 * 26(sp)",
        "sw s9,  4 * 27(sp)",
        "sw s10, 4 * 28(sp)",
        "sw s11, 4 * 29(sp)",
        "csrr a0, sscratch",
        "sw a0,  4 * 30(sp)",
        // Keep sscratch pointing at the kernel stack for nested traps.
        "addi a0, sp, 4 * 31",
        "csrw sscratch, a0",
        "mv a0, sp",
        "call {handle_trap}",
        "lw ra,  4 * 0(sp)",
        "lw gp,  4 * 1(sp)",
        "lw tp,  4 * 2(sp)",
        "lw t0,  4 * 3(sp)",
        "lw t1,  4 * 4(sp)",
        "lw t2,  4 * 5(sp)",
        "lw t3,  4 * 6(sp)",
        "lw t4,  4 * 7(sp)",
        "lw t5,  4 * 8(sp)",
        "lw t6,  4 * 9(sp)",
        "lw a0,  4 * 10(sp)",
        "lw a1,  4 * 11(sp)",
        "lw a2,  4 * 12(sp)",
        "lw a3,  4 * 13(sp)",
        "lw a4,  4 * 14(sp)",
        "lw a5,  4 * 15(sp)",
        "lw a6,  4 * 16(sp)",
        "lw a7,  4 * 17(sp)",
        "lw s0,  4 * 18(sp)",
        "lw s1,  4 * 19(sp)",
        "lw s2,  4 * 20(sp)",
        "lw s3,  4 * 21(sp)",
        "lw s4,  4 * 22(sp)",
        "lw s5,  4 * 23(sp)",
        "lw s6,  4 * 24(sp)",
        "lw s7,  4 * 25(sp)",
        "lw s8,  4 * 26(sp)",
        "lw s9,  4 * 27(sp)",
        "lw s10, 4 * 28(sp)",
        "lw s11, 4 * 29(sp)",
        "lw sp,  4 * 30(sp)",
        "sret",
        handle_trap = sym handle_trap,
    )
}

const SCAUSE_ECALL_FROM_U: usize = 8;

extern "C" fn handle_trap(frame: &mut TrapFrame) {
    let scause: usize;
    let stval: usize;
    let mut sepc: usize;
    unsafe {
        asm!("csrr {}, scause", out(reg) scause);
        asm!("csrr {}, stval", out(reg) stval);
        asm!("csrr {}, sepc", out(reg) sepc);
    }

    if scause == SCAUSE_ECALL_FROM_U {
        crate::syscall::dispatch(frame);
        sepc += 4;
        unsafe { asm!("csrw sepc, {}", in(reg) sepc) };
    } else {
        panic!(
            "unexpected trap: scause={:#x} stval={:#x} sepc={:#x}",
            scause, stval, sepc
        );
    }
}

fn wfi() -> ! {
    loop {
        unsafe { asm!("wfi") };
    }
}

pub fn kernel_exit() -> ! {
    crate::println!("kernel exiting");
    wfi()
}

#[panic_handler]
fn panic(info: &core::panic::PanicInfo) -> ! {
    crate::println!("KERNEL PANIC: {}", info);
    wfi()
}
