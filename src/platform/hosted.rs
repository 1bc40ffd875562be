// Hosted fiber backend: the kernel runs as an ordinary user process and
// every kernel process gets a cooperative fiber. Fibers are OS threads
// gated by a single baton (the slot allowed to run); a thread that does not
// hold the baton is parked in a condvar wait, so exactly one context
// executes at any instant, just like the embedded target.

use std::cell::Cell;
use std::collections::VecDeque;
use std::fmt;
use std::io::Write as _;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread;

use crate::kernel;
use crate::memory::{PageAddr, PAGE_SIZE};
use crate::process::{ProcessState, Slot, IDLE_SLOT};

/// The boot thread doubles as the scheduler fiber and the idle process.
pub const SCHEDULER_CTX: Slot = IDLE_SLOT;

pub(crate) struct HostState {
    baton: Mutex<Slot>,
    wakeup: Condvar,
    console: Mutex<Vec<u8>>,
    input: Mutex<VecDeque<u8>>,
    echo_console: bool,
    fiber_panic: Mutex<Option<String>>,
}

lazy_static::lazy_static! {
    static ref HOST: Mutex<Option<Arc<HostState>>> = Mutex::new(None);
    static ref BOOT_LOCK: Mutex<()> = Mutex::new(());
}

thread_local! {
    // Which fiber this thread is. The boot thread never changes it.
    static CTX: Cell<Slot> = const { Cell::new(SCHEDULER_CTX) };
}

// A fiber that panicked poisons these mutexes on the way down; the kernel
// state itself is still consistent, so just take the guard.
fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

fn try_host() -> Option<Arc<HostState>> {
    lock(&HOST).clone()
}

fn host() -> Arc<HostState> {
    try_host().expect("hosted platform used before boot")
}

/// Serialises whole boots: kernel state is a process-wide singleton.
pub fn boot_lock() -> MutexGuard<'static, ()> {
    lock(&BOOT_LOCK)
}

/// Install a fresh platform state for one boot. Fibers left parked by a
/// previous boot keep waiting on the old state and can never run again.
pub fn reset(echo_console: bool) {
    *lock(&HOST) = Some(Arc::new(HostState {
        baton: Mutex::new(SCHEDULER_CTX),
        wakeup: Condvar::new(),
        console: Mutex::new(Vec::new()),
        input: Mutex::new(VecDeque::new()),
        echo_console,
        fiber_panic: Mutex::new(None),
    }));
}

/// Carve out the managed "physical" RAM for one boot. The region is leaked
/// on purpose: the kernel never gives physical memory back, and a parked
/// fiber from this boot may still hold pointers into it.
pub fn alloc_ram(pages: usize) -> (PageAddr, PageAddr) {
    let layout = std::alloc::Layout::from_size_align(pages * PAGE_SIZE, PAGE_SIZE)
        .expect("ram layout");
    let ptr = unsafe { std::alloc::alloc_zeroed(layout) };
    assert!(!ptr.is_null(), "failed to reserve emulated RAM");
    let start = PageAddr::new(ptr as usize);
    (start, start.add_pages(pages))
}

/// Fiber swap: publish the baton to `target` (starting its thread on first
/// use) and park until the baton comes back to the caller.
pub fn switch_to(target: Slot) {
    let host = host();

    // Swaps to the scheduler leave `current` pointing at the last process
    // that ran, so the round-robin scan keeps its origin.
    let spawn = kernel::with(|k| {
        if target == SCHEDULER_CTX {
            return false;
        }
        k.procs.current = target;
        let p = &mut k.procs.procs[target];
        let fresh = !p.started;
        p.started = true;
        fresh
    });
    if spawn {
        spawn_fiber(host.clone(), target);
    }

    let me = CTX.with(|c| c.get());
    let mut baton = lock(&host.baton);
    *baton = target;
    host.wakeup.notify_all();
    while *baton != me {
        baton = host
            .wakeup
            .wait(baton)
            .unwrap_or_else(|e| e.into_inner());
    }
}

fn spawn_fiber(host: Arc<HostState>, slot: Slot) {
    thread::Builder::new()
        .name(format!("fiber-{}", slot))
        .spawn(move || fiber_main(host, slot))
        .expect("failed to spawn process fiber");
}

// First entry point of a process fiber: waits for its first baton, runs the
// process body, then terminates the process if the body simply returned.
fn fiber_main(host: Arc<HostState>, slot: Slot) {
    {
        let mut baton = lock(&host.baton);
        while *baton != slot {
            baton = host
                .wakeup
                .wait(baton)
                .unwrap_or_else(|e| e.into_inner());
        }
    }
    CTX.with(|c| c.set(slot));

    let pc = kernel::with(|k| k.procs.procs[slot].user_pc);
    let entry: fn() = unsafe { core::mem::transmute(pc) };

    if let Err(payload) = std::panic::catch_unwind(std::panic::AssertUnwindSafe(entry)) {
        let text = panic_text(payload);
        log::warn!(target: "PROC", "process fiber {} panicked: {}", slot, text);
        *lock(&host.fiber_panic) = Some(text);
    }

    // Body returned (or died). Mark the process terminated and hand the
    // baton to the scheduler for good; this thread is finished.
    kernel::with(|k| {
        k.procs.procs[slot].state = ProcessState::Terminated;
    });
    let mut baton = lock(&host.baton);
    *baton = SCHEDULER_CTX;
    host.wakeup.notify_all();
}

fn panic_text(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Park the calling fiber forever after handing the baton back. Used by the
/// `exit`/`shutdown` syscalls, whose callers never resume.
pub fn exit_current() -> ! {
    let me = CTX.with(|c| c.get());
    assert!(
        me != SCHEDULER_CTX,
        "exit_current called outside a process fiber"
    );
    let host = host();
    {
        let mut baton = lock(&host.baton);
        *baton = SCHEDULER_CTX;
        host.wakeup.notify_all();
    }
    loop {
        thread::park();
    }
}

/// Re-raise the first fiber panic of this boot, if any, so a dead process
/// body cannot fail silently.
pub fn take_fiber_panic() -> Option<String> {
    lock(&host().fiber_panic).take()
}

// Console: byte-oriented, captured in memory, optionally echoed to stdout.

pub fn putchar(byte: u8) {
    match try_host() {
        Some(host) => {
            lock(&host.console).push(byte);
            if host.echo_console {
                let _ = std::io::stdout().write_all(&[byte]);
            }
        }
        None => {
            let _ = std::io::stdout().write_all(&[byte]);
        }
    }
}

pub fn console_print(args: fmt::Arguments) {
    match try_host() {
        Some(host) => {
            let mut buf = lock(&host.console);
            let _ = buf.write_fmt(args);
            if host.echo_console {
                print!("{}", args);
            }
        }
        None => print!("{}", args),
    }
}

pub fn take_console() -> Vec<u8> {
    std::mem::take(&mut *lock(&host().console))
}

/// Queue bytes for `getchar`, as if they were typed at the console.
pub fn push_input(bytes: &[u8]) {
    let host = host();
    lock(&host.input).extend(bytes.iter().copied());
}

pub fn getchar() -> Option<u8> {
    lock(&host().input).pop_front()
}
