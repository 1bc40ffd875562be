// The syscall surface processes see. On the hosted backend processes are
// linked into the kernel, so these are plain function calls; on the embedded
// target user programs reach the same functions through `ecall` and the
// dispatch table at the bottom.

use crate::ipc::{self, IpcFlags, Message, Response};
use crate::kernel;
use crate::memory::{KnownRegion, PageAddr};
use crate::platform;
use crate::process::{Pid, ProcessState};

/// Relinquish the CPU to the next runnable process.
pub fn yield_now() {
    platform::yield_now();
}

/// Mark the calling process terminated and give up the CPU for good. The
/// descriptor is destroyed later, from the scheduler context.
pub fn exit() -> ! {
    kernel::with(|k| {
        let cur = k.procs.current;
        k.procs.procs[cur].state = ProcessState::Terminated;
    });
    platform::exit_current()
}

/// Terminate every process and wind the kernel down.
pub fn shutdown() -> ! {
    kernel::with(|k| k.procs.shutdown_all());
    platform::exit_current()
}

/// One page for the calling process; on the embedded target it is mapped at
/// the caller's next heap address and that address is returned.
pub fn alloc_page() -> PageAddr {
    kernel::with(|k| k.alloc_page_for_current())
}

pub fn get_arg_page() -> PageAddr {
    kernel::with(|k| k.arg_page_for_current())
}

pub fn get_comm_page() -> PageAddr {
    kernel::with(|k| k.comm_page_for_current())
}

/// Pid of a live process with this name, if any.
pub fn lookup(name: &str) -> Option<Pid> {
    kernel::with(|k| k.procs.lookup(name))
}

/// Take the exclusive lease on a named memory region for the caller.
pub fn known_memory_lock(region: KnownRegion, page_count: usize) -> Option<PageAddr> {
    kernel::with(|k| k.known_memory_lock_for_current(region, page_count))
}

pub fn io_puts(s: &str) {
    for byte in s.bytes() {
        platform::putchar(byte);
    }
}

pub fn putchar(byte: u8) {
    platform::putchar(byte);
}

/// Poll the console for one byte. Yields so a process polling in a loop
/// cannot starve everyone else.
pub fn getchar() -> Option<u8> {
    let byte = platform::getchar();
    platform::yield_now();
    byte
}

pub fn ipc_send(
    target: Pid,
    flags: IpcFlags,
    method: u32,
    a0: usize,
    a1: usize,
    a2: usize,
) -> Response {
    ipc::send(target, flags, method, [a0, a1, a2])
}

pub fn ipc_recv() -> Message {
    ipc::recv()
}

pub fn ipc_reply(response: Response) {
    ipc::reply(response);
}

// Syscall numbers for the embedded ecall ABI.
pub const SYS_PUTCHAR: usize = 1;
pub const SYS_GETCHAR: usize = 2;
pub const SYS_YIELD: usize = 3;
pub const SYS_EXIT: usize = 4;
pub const SYS_ALLOC_PAGE: usize = 5;
pub const SYS_GET_ARG_PAGE: usize = 6;
pub const SYS_GET_COMM_PAGE: usize = 7;
pub const SYS_LOOKUP: usize = 8;
pub const SYS_IPC_SEND: usize = 9;
pub const SYS_IPC_RECV: usize = 10;
pub const SYS_IPC_REPLY: usize = 11;
pub const SYS_IO_PUTS: usize = 12;
pub const SYS_SHUTDOWN: usize = 13;

/// Ecall dispatch. Arguments arrive in a0..a5, the syscall number in a7;
/// results go back through a0..a3 of the saved frame.
#[cfg(all(target_arch = "riscv32", target_os = "none"))]
pub fn dispatch(frame: &mut crate::platform::riscv::TrapFrame) {
    use crate::ipc::ErrorCode;
    use crate::regstr::RegStr;

    match frame.a7 {
        SYS_PUTCHAR => platform::putchar(frame.a0 as u8),
        SYS_GETCHAR => {
            frame.a0 = match getchar() {
                Some(byte) => byte as usize,
                None => usize::MAX,
            };
        }
        SYS_YIELD => yield_now(),
        SYS_EXIT => exit(),
        SYS_ALLOC_PAGE => frame.a0 = alloc_page().raw(),
        SYS_GET_ARG_PAGE => frame.a0 = get_arg_page().raw(),
        SYS_GET_COMM_PAGE => frame.a0 = get_comm_page().raw(),
        SYS_LOOKUP => {
            // The name travels packed in two registers.
            let name = RegStr::from_raw(frame.a0 as u32, frame.a1 as u32).extract();
            let pid = core::str::from_utf8(name.as_slice())
                .ok()
                .and_then(lookup);
            frame.a0 = pid.unwrap_or(Pid::INVALID).0 as usize;
        }
        SYS_IPC_SEND => {
            let word = frame.a1 as u32;
            let response = ipc::send(
                Pid(frame.a0 as u64),
                IpcFlags::from_bits_truncate(word & crate::ipc::FLAGS_MASK),
                word & crate::ipc::METHOD_MASK,
                [frame.a2, frame.a3, frame.a4],
            );
            frame.a0 = response.error.to_raw() as usize;
            frame.a1 = response.values[0];
            frame.a2 = response.values[1];
            frame.a3 = response.values[2];
        }
        SYS_IPC_RECV => {
            let msg = ipc_recv();
            frame.a0 = msg.sender.0 as usize;
            frame.a1 = msg.method_and_flags as usize;
            frame.a2 = msg.args[0];
            frame.a3 = msg.args[1];
            frame.a4 = msg.args[2];
        }
        SYS_IPC_REPLY => {
            ipc_reply(Response {
                error: ErrorCode::from_raw(frame.a0 as i32),
                values: [frame.a1, frame.a2, frame.a3],
            });
        }
        SYS_IO_PUTS => {
            // The caller's buffer is reachable directly: user pages sit in
            // physical memory the kernel identity-maps.
            let bytes =
                unsafe { core::slice::from_raw_parts(frame.a0 as *const u8, frame.a1) };
            for &byte in bytes {
                platform::putchar(byte);
            }
            frame.a0 = 1;
        }
        SYS_SHUTDOWN => shutdown(),
        number => log::warn!("unknown syscall {}", number),
    }
}
