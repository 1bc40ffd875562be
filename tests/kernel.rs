// End-to-end scenarios on the hosted backend: each test boots a fresh
// kernel, lets a handful of kernel-mode processes run to completion, and
// inspects the captured console and allocator statistics afterwards.
//
// Process bodies are plain functions, so they report back through statics;
// boots are serialised by the kernel, which keeps those statics race-free.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

use relayos::memory::{KnownRegion, PAGE_SIZE};
use relayos::process::ProcessImage;
use relayos::syscall;
use relayos::{BootConfig, ErrorCode, IpcFlags, Pid, Response};

fn boot_with(init: impl FnOnce()) -> relayos::BootReport {
    relayos::boot(BootConfig::default(), init)
}

// --- fair alternation -----------------------------------------------------

fn print_a() {
    for _ in 0..4 {
        syscall::io_puts("A\n");
        syscall::yield_now();
    }
}

fn print_b() {
    for _ in 0..4 {
        syscall::io_puts("B\n");
        syscall::yield_now();
    }
}

#[test]
fn two_processes_alternate_fairly() {
    let report = boot_with(|| {
        relayos::create_process("alternate_a", ProcessImage::Kernel(print_a), None);
        relayos::create_process("alternate_b", ProcessImage::Kernel(print_b), None);
    });
    let console = report.console_text();
    // Four full rounds of strict alternation before anything else prints.
    assert_eq!(&console[..16], "A\nB\nA\nB\nA\nB\nA\nB\n");
}

// --- synchronous call-reply -----------------------------------------------

const METHOD_INCREMENT: u32 = 0x100;

static INCREMENT_RESULT: AtomicUsize = AtomicUsize::new(0);
static INCREMENT_ERROR: AtomicUsize = AtomicUsize::new(usize::MAX);

fn increment_server() {
    let msg = syscall::ipc_recv();
    syscall::ipc_reply(Response::ok([msg.args[0] + 1, 0, 0]));
}

fn increment_client() {
    let server = syscall::lookup("server").expect("server is registered");
    let response = syscall::ipc_send(server, IpcFlags::empty(), METHOD_INCREMENT, 41, 0, 0);
    INCREMENT_ERROR.store(response.error.to_raw() as usize, Ordering::SeqCst);
    INCREMENT_RESULT.store(response.values[0], Ordering::SeqCst);
}

#[test]
fn ipc_send_recv_reply_round_trip() {
    boot_with(|| {
        relayos::create_process("server", ProcessImage::Kernel(increment_server), None);
        relayos::create_process("client", ProcessImage::Kernel(increment_client), None);
    });
    assert_eq!(INCREMENT_ERROR.load(Ordering::SeqCst), 0);
    assert_eq!(INCREMENT_RESULT.load(Ordering::SeqCst), 42);
}

// --- comm-page transfer ---------------------------------------------------

static SERVER_SAW: Mutex<Option<[u8; 4]>> = Mutex::new(None);
static CLIENT_SAW: Mutex<Option<[u8; 4]>> = Mutex::new(None);

fn read4(page: relayos::PageAddr) -> [u8; 4] {
    let mut out = [0u8; 4];
    unsafe { core::ptr::copy_nonoverlapping(page.as_ptr::<u8>(), out.as_mut_ptr(), 4) };
    out
}

fn write_bytes(page: relayos::PageAddr, bytes: &[u8]) {
    unsafe { core::ptr::copy_nonoverlapping(bytes.as_ptr(), page.as_ptr::<u8>(), bytes.len()) };
}

fn pong_server() {
    let comm = syscall::get_comm_page();
    let msg = syscall::ipc_recv();
    assert!(msg.flags().contains(IpcFlags::SEND_COMM_DATA));
    *SERVER_SAW.lock().unwrap() = Some(read4(comm));
    write_bytes(comm, b"pong");
    syscall::ipc_reply(Response::ok([0, 0, 0]));
}

fn ping_client() {
    let comm = syscall::get_comm_page();
    write_bytes(comm, b"ping");
    let server = syscall::lookup("server").expect("server is registered");
    let response = syscall::ipc_send(
        server,
        IpcFlags::SEND_COMM_DATA | IpcFlags::RECV_COMM_DATA,
        METHOD_INCREMENT,
        0,
        0,
        0,
    );
    assert_eq!(response.error, ErrorCode::None);
    *CLIENT_SAW.lock().unwrap() = Some(read4(comm));
}

#[test]
fn comm_page_travels_both_ways() {
    boot_with(|| {
        relayos::create_process("server", ProcessImage::Kernel(pong_server), None);
        relayos::create_process("client", ProcessImage::Kernel(ping_client), None);
    });
    assert_eq!(SERVER_SAW.lock().unwrap().unwrap(), *b"ping");
    assert_eq!(CLIENT_SAW.lock().unwrap().unwrap(), *b"pong");
}

// --- send to an unknown pid ----------------------------------------------

static UNKNOWN_TARGET_ERROR: AtomicUsize = AtomicUsize::new(usize::MAX);
static UNKNOWN_TARGET_DONE: AtomicBool = AtomicBool::new(false);

fn unknown_target_client() {
    let response = syscall::ipc_send(
        Pid(0xDEAD_BEEF),
        IpcFlags::empty(),
        METHOD_INCREMENT,
        1,
        2,
        3,
    );
    UNKNOWN_TARGET_ERROR.store(response.error.to_raw() as usize, Ordering::SeqCst);
    assert_eq!(response.values, [0, 0, 0]);
    UNKNOWN_TARGET_DONE.store(true, Ordering::SeqCst);
}

#[test]
fn send_to_unknown_pid_fails_without_blocking() {
    boot_with(|| {
        relayos::create_process("client", ProcessImage::Kernel(unknown_target_client), None);
    });
    // The client ran straight through: nothing ever blocked.
    assert!(UNKNOWN_TARGET_DONE.load(Ordering::SeqCst));
    assert_eq!(
        UNKNOWN_TARGET_ERROR.load(Ordering::SeqCst),
        ErrorCode::PidNotFound.to_raw() as usize
    );
}

// --- send to self ---------------------------------------------------------

static SELF_SEND_ERROR: AtomicUsize = AtomicUsize::new(usize::MAX);

fn self_send_client() {
    let me = syscall::lookup("narcissus").expect("own name resolves");
    let response = syscall::ipc_send(me, IpcFlags::empty(), METHOD_INCREMENT, 0, 0, 0);
    SELF_SEND_ERROR.store(response.error.to_raw() as usize, Ordering::SeqCst);
}

#[test]
fn send_to_self_is_refused() {
    boot_with(|| {
        relayos::create_process("narcissus", ProcessImage::Kernel(self_send_client), None);
    });
    assert_eq!(
        SELF_SEND_ERROR.load(Ordering::SeqCst),
        ErrorCode::SelfSend.to_raw() as usize
    );
}

// --- exit releases pages --------------------------------------------------

static ALLOCATED_MID_RUN: AtomicUsize = AtomicUsize::new(0);

fn allocate_then_exit() {
    syscall::alloc_page();
    syscall::alloc_page();
    syscall::alloc_page();
    ALLOCATED_MID_RUN.store(relayos::memory_stats().allocated, Ordering::SeqCst);
    syscall::exit();
}

#[test]
fn process_exit_returns_its_pages() {
    let report = boot_with(|| {
        relayos::create_process("mem_test", ProcessImage::Kernel(allocate_then_exit), None);
    });
    let stats = report.stats;
    let mid = ALLOCATED_MID_RUN.load(Ordering::SeqCst);
    // The three pages are gone again and counted as freed.
    assert_eq!(stats.allocated, mid - 3);
    assert_eq!(stats.freed_lifetime, 3);
    assert_eq!(stats.peak_allocated, mid);
}

// --- exit in the middle of a rendezvous ------------------------------------

static ABANDONED_SEND_ERROR: AtomicUsize = AtomicUsize::new(usize::MAX);

fn vanishing_server() {
    let _ = syscall::ipc_recv();
    // Exits without ever replying.
    syscall::exit();
}

fn abandoned_client() {
    let server = syscall::lookup("server").expect("server is registered");
    let response = syscall::ipc_send(server, IpcFlags::empty(), METHOD_INCREMENT, 7, 0, 0);
    ABANDONED_SEND_ERROR.store(response.error.to_raw() as usize, Ordering::SeqCst);
}

#[test]
fn receiver_exit_unblocks_the_sender_with_an_error() {
    boot_with(|| {
        relayos::create_process("server", ProcessImage::Kernel(vanishing_server), None);
        relayos::create_process("client", ProcessImage::Kernel(abandoned_client), None);
    });
    assert_eq!(
        ABANDONED_SEND_ERROR.load(Ordering::SeqCst),
        ErrorCode::PidNotFound.to_raw() as usize
    );
}

// --- queued sends and collisions -------------------------------------------

static QUEUED_RESULT: AtomicUsize = AtomicUsize::new(0);
static COLLIDING_ERROR: AtomicUsize = AtomicUsize::new(usize::MAX);

fn busy_server() {
    // Not yet receiving: the first send has to park its message.
    syscall::yield_now();
    syscall::yield_now();
    let msg = syscall::ipc_recv();
    syscall::ipc_reply(Response::ok([msg.args[0] * 2, 0, 0]));
}

fn queued_client() {
    let server = syscall::lookup("server").expect("server is registered");
    let response = syscall::ipc_send(server, IpcFlags::empty(), METHOD_INCREMENT, 21, 0, 0);
    QUEUED_RESULT.store(response.values[0], Ordering::SeqCst);
}

fn colliding_client() {
    let server = syscall::lookup("server").expect("server is registered");
    let response = syscall::ipc_send(server, IpcFlags::empty(), METHOD_INCREMENT, 5, 0, 0);
    COLLIDING_ERROR.store(response.error.to_raw() as usize, Ordering::SeqCst);
}

#[test]
fn second_sender_is_refused_while_a_request_is_in_flight() {
    boot_with(|| {
        relayos::create_process("server", ProcessImage::Kernel(busy_server), None);
        relayos::create_process("first", ProcessImage::Kernel(queued_client), None);
        relayos::create_process("second", ProcessImage::Kernel(colliding_client), None);
    });
    // The parked request is served once the receiver gets around to it...
    assert_eq!(QUEUED_RESULT.load(Ordering::SeqCst), 42);
    // ...while the colliding one came straight back with an error.
    assert_eq!(
        COLLIDING_ERROR.load(Ordering::SeqCst),
        ErrorCode::Overflow.to_raw() as usize
    );
}

static SPURIOUS_REPLY_SURVIVED: AtomicBool = AtomicBool::new(false);

fn spurious_replier() {
    // No request was ever received; this is soft-asserted, not fatal.
    syscall::ipc_reply(Response::ok([1, 2, 3]));
    SPURIOUS_REPLY_SURVIVED.store(true, Ordering::SeqCst);
}

#[test]
fn reply_without_a_blocked_sender_is_harmless() {
    boot_with(|| {
        relayos::create_process("replier", ProcessImage::Kernel(spurious_replier), None);
    });
    assert!(SPURIOUS_REPLY_SURVIVED.load(Ordering::SeqCst));
}

// --- pids and arg pages ----------------------------------------------------

static ARG_PAGE_TEXT: Mutex<Option<[u8; 8]>> = Mutex::new(None);

fn report_args() {
    let page = syscall::get_arg_page();
    let mut out = [0u8; 8];
    unsafe { core::ptr::copy_nonoverlapping(page.as_ptr::<u8>(), out.as_mut_ptr(), 8) };
    *ARG_PAGE_TEXT.lock().unwrap() = Some(out);
}

fn noop_body() {}

#[test]
fn pids_increase_monotonically_and_args_arrive() {
    let mut pids = Vec::new();
    boot_with(|| {
        pids.push(relayos::create_process(
            "one",
            ProcessImage::Kernel(noop_body),
            None,
        ));
        pids.push(relayos::create_process(
            "two",
            ProcessImage::Kernel(report_args),
            Some(b"config=1"),
        ));
        pids.push(relayos::create_process(
            "three",
            ProcessImage::Kernel(noop_body),
            None,
        ));
    });
    assert!(pids[0].0 < pids[1].0 && pids[1].0 < pids[2].0);
    assert_eq!(&ARG_PAGE_TEXT.lock().unwrap().unwrap(), b"config=1");
}

// --- known-memory contention ----------------------------------------------

static FB_FIRST_TRY: AtomicUsize = AtomicUsize::new(0);
static FB_SECOND_TRY: AtomicUsize = AtomicUsize::new(0);

fn framebuffer_holder() {
    let addr = syscall::known_memory_lock(KnownRegion::Framebuffer, 2)
        .expect("first lease succeeds");
    // Scribble into the region to prove it is real memory.
    unsafe { core::ptr::write_bytes(addr.as_ptr::<u8>(), 0x5A, 2 * PAGE_SIZE) };
    syscall::yield_now();
}

fn framebuffer_contender() {
    let first = syscall::known_memory_lock(KnownRegion::Framebuffer, 2);
    FB_FIRST_TRY.store(first.map_or(0, |a| a.raw()), Ordering::SeqCst);
    syscall::yield_now();
    // The holder has exited by now; its lease was released on exit.
    let second = syscall::known_memory_lock(KnownRegion::Framebuffer, 2);
    FB_SECOND_TRY.store(second.map_or(0, |a| a.raw()), Ordering::SeqCst);
}

#[test]
fn known_memory_lease_passes_on_after_exit() {
    boot_with(|| {
        relayos::create_process("holder", ProcessImage::Kernel(framebuffer_holder), None);
        relayos::create_process("contender", ProcessImage::Kernel(framebuffer_contender), None);
    });
    assert_eq!(FB_FIRST_TRY.load(Ordering::SeqCst), 0);
    assert_ne!(FB_SECOND_TRY.load(Ordering::SeqCst), 0);
}

// --- shutdown --------------------------------------------------------------

fn chatterbox() {
    loop {
        syscall::io_puts(".");
        syscall::yield_now();
    }
}

fn plug_puller() {
    syscall::yield_now();
    syscall::yield_now();
    syscall::shutdown();
}

#[test]
fn shutdown_terminates_everything() {
    // The chatterboxes never return on their own; shutdown must end the
    // boot anyway.
    let report = boot_with(|| {
        relayos::create_process("noisy_1", ProcessImage::Kernel(chatterbox), None);
        relayos::create_process("noisy_2", ProcessImage::Kernel(chatterbox), None);
        relayos::create_process("off_switch", ProcessImage::Kernel(plug_puller), None);
    });
    let console = report.console_text();
    assert!(console.contains('.'));
}

// --- console ---------------------------------------------------------------

#[test]
fn console_input_round_trips() {
    static ECHOED: AtomicUsize = AtomicUsize::new(0);

    fn echo_once() {
        if let Some(byte) = syscall::getchar() {
            syscall::putchar(byte);
            ECHOED.store(byte as usize, Ordering::SeqCst);
        }
    }

    let report = relayos::boot(BootConfig::default(), || {
        relayos::platform::hosted::push_input(b"x");
        relayos::create_process("echo", ProcessImage::Kernel(echo_once), None);
    });
    assert_eq!(ECHOED.load(Ordering::SeqCst), b'x' as usize);
    assert!(report.console_text().contains('x'));
}

#[test]
fn boot_report_includes_memory_statistics() {
    let report = boot_with(|| {
        relayos::create_process("hello", ProcessImage::Kernel(noop_body), None);
    });
    let console = report.console_text();
    assert!(console.contains("=== Memory Statistics ==="));
    // Idle plus one process.
    assert_eq!(report.stats.processes_created, 2);
    assert_eq!(report.stats.total, BootConfig::default().ram_pages);
}
