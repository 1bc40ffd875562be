// relayos: a small cooperative multi-process kernel core that runs on a
// 32-bit embedded RISC-V target and, unchanged, inside a userland emulator
// on the host. Physical pages are tracked per owner, scheduling is
// cooperative round-robin, and processes talk through synchronous
// rendezvous IPC with an optional comm-page payload.

#![cfg_attr(target_os = "none", no_std)]

pub mod console;
pub mod ipc;
pub mod kernel;
pub mod memory;
pub mod platform;
pub mod process;
pub mod regstr;
pub mod syscall;
pub mod vm;

pub use ipc::{ErrorCode, IpcFlags, Message, Response};
pub use kernel::{create_process, kernel_common, memory_stats};
pub use memory::{KnownRegion, MemoryStats, PageAddr, PageOwner, PAGE_SIZE};
pub use process::{Pid, ProcessImage};

#[cfg(not(target_os = "none"))]
pub use kernel::{boot, BootConfig, BootReport};
