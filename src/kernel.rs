// The kernel aggregate: page allocator, known-memory table, and process
// table behind one global lock. The cooperative model means the lock is
// never contended; the rule that makes that true is that no lock guard is
// ever held across a suspension point (yield, switch, send, recv, reply).

use lazy_static::lazy_static;
use log::{debug, warn};
use spin::Mutex;

use crate::console;
use crate::memory::{KnownMemoryTable, MemoryStats, PageAddr, PageAllocator, PAGE_SIZE};
use crate::platform;
use crate::process::{Pid, ProcessImage, ProcessTable, Slot, IDLE_SLOT};

pub struct Kernel {
    pub mem: PageAllocator,
    pub known: KnownMemoryTable,
    pub procs: ProcessTable,
}

impl Kernel {
    fn new() -> Kernel {
        Kernel {
            mem: PageAllocator::new(),
            known: KnownMemoryTable::new(),
            procs: ProcessTable::new(),
        }
    }

    pub fn create_process(
        &mut self,
        name: &str,
        image: ProcessImage,
        args: Option<&[u8]>,
    ) -> Pid {
        let Kernel { mem, procs, .. } = self;
        let slot = procs.create(mem, name, image, args);
        procs.procs[slot].pid
    }

    pub fn process_exit(&mut self, slot: Slot) {
        let Kernel { mem, known, procs } = self;
        procs.exit(mem, known, slot);
    }

    pub fn alloc_page_for_current(&mut self) -> PageAddr {
        let Kernel { mem, procs, .. } = self;
        let cur = procs.current;
        procs.alloc_mapped_page(mem, cur)
    }

    pub fn arg_page_for_current(&mut self) -> PageAddr {
        let Kernel { mem, procs, .. } = self;
        let cur = procs.current;
        procs.ensure_arg_page(mem, cur)
    }

    pub fn comm_page_for_current(&mut self) -> PageAddr {
        let Kernel { mem, procs, .. } = self;
        let cur = procs.current;
        procs.ensure_comm_page(mem, cur)
    }

    pub fn known_memory_lock_for_current(
        &mut self,
        region: crate::memory::KnownRegion,
        page_count: usize,
    ) -> Option<PageAddr> {
        let Kernel { mem, known, procs } = self;
        let holder = crate::memory::PageOwner::Proc(procs.current);
        known.lock(mem, region, page_count, holder)
    }

    fn reap(&mut self, skip: Option<Slot>) {
        while let Some(slot) = self.procs.find_terminated(skip) {
            self.process_exit(slot);
        }
    }
}

lazy_static! {
    static ref KERNEL: Mutex<Kernel> = Mutex::new(Kernel::new());
}

/// Run a short, non-suspending critical section against the kernel state.
pub fn with<R>(f: impl FnOnce(&mut Kernel) -> R) -> R {
    f(&mut KERNEL.lock())
}

// The idle body only matters if something ever switches into slot 0's
// context directly; on both backends the boot context plays that role.
fn idle_main() {
    loop {
        platform::yield_now();
    }
}

/// Shared initialisation: bring up the allocator over `[ram, ram_end)` and
/// install the idle process in slot 0 as the current process.
pub fn kernel_common(ram: PageAddr, ram_end: PageAddr) {
    with(|k| {
        k.mem.init(ram, ram_end);
        let slot = {
            let Kernel { mem, procs, .. } = k;
            procs.create(mem, "idle", ProcessImage::Kernel(idle_main), None)
        };
        assert_eq!(slot, IDLE_SLOT, "idle process must occupy slot 0");
        k.procs.procs[IDLE_SLOT].started = true;
        k.procs.current = IDLE_SLOT;
    });
    debug!("hello from kernel_common");
}

/// Destroy terminated processes, sparing the caller's own context; safe to
/// call from a process that is on its way out.
pub fn reap_terminated() {
    with(|k| {
        let cur = k.procs.current;
        k.reap(Some(cur));
    });
}

/// Destroy every terminated process. Only valid while no process context is
/// executing, i.e. from the hosted scheduler fiber.
#[cfg(not(target_os = "none"))]
fn reap_all() {
    with(|k| k.reap(None));
}

/// Create a process from the driver program or another kernel-mode process.
pub fn create_process(name: &str, image: ProcessImage, args: Option<&[u8]>) -> Pid {
    with(|k| k.create_process(name, image, args))
}

pub fn memory_stats() -> MemoryStats {
    with(|k| k.mem.stats())
}

pub fn memory_report() {
    let stats = memory_stats();
    crate::println!();
    crate::println!("=== Memory Statistics ===");
    crate::println!("Total pages: {}", stats.total);
    crate::println!("Total processes created: {}", stats.processes_created);
    crate::println!("Current allocated pages: {}", stats.allocated);
    crate::println!("Total pages freed: {}", stats.freed_lifetime);
    crate::println!("Peak memory usage: {} pages", stats.peak_allocated);
    crate::println!(
        "Current memory usage: {} KB",
        stats.allocated * PAGE_SIZE / 1024
    );
    crate::println!("=========================");
}

#[cfg(not(target_os = "none"))]
pub struct BootConfig {
    /// Size of the emulated physical memory, in pages.
    pub ram_pages: usize,
    /// Mirror console bytes to stdout as they are written.
    pub echo_console: bool,
    pub log_level: log::LevelFilter,
}

#[cfg(not(target_os = "none"))]
impl Default for BootConfig {
    fn default() -> Self {
        BootConfig {
            ram_pages: 4096,
            echo_console: false,
            log_level: log::LevelFilter::Warn,
        }
    }
}

#[cfg(not(target_os = "none"))]
pub struct BootReport {
    pub stats: MemoryStats,
    pub console: Vec<u8>,
}

#[cfg(not(target_os = "none"))]
impl BootReport {
    pub fn console_text(&self) -> String {
        String::from_utf8_lossy(&self.console).into_owned()
    }
}

/// Hosted kernel lifecycle: initialise, let `init` create processes, run
/// the scheduler until only idle is runnable, wind down, and report.
///
/// Boots are serialised process-wide; the kernel singleton is reset at the
/// start of each one.
#[cfg(not(target_os = "none"))]
pub fn boot(config: BootConfig, init: impl FnOnce()) -> BootReport {
    let _serial = platform::hosted::boot_lock();

    console::init(config.log_level);
    platform::hosted::reset(config.echo_console);
    with(|k| *k = Kernel::new());

    let (ram, ram_end) = platform::hosted::alloc_ram(config.ram_pages);
    kernel_common(ram, ram_end);

    init();
    scheduler_loop();

    reap_all();
    if with(|k| k.procs.any_runnable()) {
        warn!("reached end of kernel while programs were running");
    }
    memory_report();

    if let Some(text) = platform::hosted::take_fiber_panic() {
        panic!("a process fiber panicked during boot: {}", text);
    }

    BootReport {
        stats: memory_stats(),
        console: platform::hosted::take_console(),
    }
}

// The scheduler fiber: hand the CPU to runnable processes until none are
// left. Rendezvous switches inside send/reply bypass this loop entirely;
// control only comes back here on a plain yield or a termination.
#[cfg(not(target_os = "none"))]
fn scheduler_loop() {
    debug!("entering scheduler loop");
    loop {
        reap_all();
        let next = with(|k| k.procs.next_runnable());
        if next == IDLE_SLOT {
            break;
        }
        platform::switch_to(next);
    }
    debug!("scheduler loop finished");
}

/// Embedded kernel lifecycle: same shape as the hosted boot, but control
/// returns to the boot context (which is the idle process) via the context
/// switch primitive, and the machine halts at the end.
#[cfg(all(target_arch = "riscv32", target_os = "none"))]
pub fn start(init: impl FnOnce()) -> ! {
    console::init(log::LevelFilter::Warn);
    platform::riscv::install_trap_handler();

    let (ram, ram_end) = platform::riscv::free_ram_range();
    kernel_common(ram, ram_end);

    init();
    platform::yield_now();

    reap_terminated();
    if with(|k| k.procs.any_runnable()) {
        warn!("reached end of kernel while programs were running");
    }
    memory_report();
    platform::riscv::kernel_exit()
}
