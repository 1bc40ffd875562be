// Driver program: brings the kernel up with a couple of demonstration
// processes. Hosted it runs as a normal binary and prints the captured
// console; on the embedded target it is the boot entry point.

#![cfg_attr(target_os = "none", no_std)]
#![cfg_attr(target_os = "none", no_main)]

use relayos::process::ProcessImage;
use relayos::syscall;
use relayos::{IpcFlags, Response};

const METHOD_INCREMENT: u32 = 0x100;
const METHOD_STOP: u32 = 0x200;

fn proc_hello() {
    syscall::io_puts("hello from a kernel process\n");
}

// A tiny increment server: replies with arg0 + 1 until told to stop.
fn proc_server() {
    loop {
        let msg = syscall::ipc_recv();
        match msg.method() {
            METHOD_INCREMENT => {
                syscall::ipc_reply(Response::ok([msg.args[0] + 1, 0, 0]));
            }
            METHOD_STOP => {
                syscall::ipc_reply(Response::ok([0, 0, 0]));
                break;
            }
            _ => syscall::ipc_reply(Response::error(relayos::ErrorCode::InvariantViolation)),
        }
    }
}

fn proc_client() {
    let server = syscall::lookup("server").expect("server process is running");
    let response = syscall::ipc_send(server, IpcFlags::empty(), METHOD_INCREMENT, 41, 0, 0);
    syscall::io_puts("client: 41 + 1 = ");
    let mut value = heapless::String::<16>::new();
    let _ = core::fmt::write(&mut value, format_args!("{}\n", response.values[0]));
    syscall::io_puts(&value);
    syscall::ipc_send(server, IpcFlags::empty(), METHOD_STOP, 0, 0, 0);
}

fn create_demo_processes() {
    relayos::create_process("hello", ProcessImage::Kernel(proc_hello), None);
    relayos::create_process("server", ProcessImage::Kernel(proc_server), None);
    relayos::create_process("client", ProcessImage::Kernel(proc_client), None);
}

#[cfg(not(target_os = "none"))]
fn main() {
    let report = relayos::boot(
        relayos::BootConfig {
            echo_console: true,
            ..Default::default()
        },
        create_demo_processes,
    );
    let stats = report.stats;
    eprintln!(
        "done: {} processes, peak {} pages",
        stats.processes_created, stats.peak_allocated
    );
}

#[cfg(all(target_arch = "riscv32", target_os = "none"))]
mod embedded {
    use super::create_demo_processes;

    core::arch::global_asm!(
        ".section .text.boot",
        ".global boot",
        "boot:",
        "la sp, __stack_top",
        "j kernel_main",
    );

    #[no_mangle]
    extern "C" fn kernel_main() -> ! {
        relayos::kernel::start(create_demo_processes)
    }
}
