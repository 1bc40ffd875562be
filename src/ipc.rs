// Synchronous rendezvous IPC. Each process carries one pending-message slot
// (incoming request) and one pending-response slot (reply awaiting it); a
// sender parks in IpcWait until the receiver replies, so one slot of each is
// always enough.

use log::{trace, warn};

use crate::kernel;
use crate::memory::{PageAddr, PAGE_SIZE};
use crate::platform;
use crate::process::{Pid, ProcessState, Slot};

bitflags::bitflags! {
    /// Flag bits carried in the low byte of the method-and-flags word.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct IpcFlags: u32 {
        /// Copy the sender's comm page into the receiver's at send time.
        const SEND_COMM_DATA = 1 << 0;
        /// Copy the receiver's comm page back into the sender's at reply time.
        const RECV_COMM_DATA = 1 << 1;
    }
}

/// Wire layout of the method-and-flags word: high 24 bits are the method id,
/// low 8 bits are flags. Method ids are allocated in steps of 0x100 so the
/// two never collide.
pub const METHOD_MASK: u32 = !0xFF;
pub const FLAGS_MASK: u32 = 0xFF;

pub fn pack_method_flags(method: u32, flags: IpcFlags) -> u32 {
    if method & FLAGS_MASK != 0 {
        warn!(target: "IPC", "method id {:#x} overflows into the flags byte", method);
    }
    method | flags.bits()
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Message {
    pub sender: Pid,
    pub method_and_flags: u32,
    pub args: [usize; 3],
}

impl Message {
    pub fn method(&self) -> u32 {
        self.method_and_flags & METHOD_MASK
    }

    pub fn flags(&self) -> IpcFlags {
        IpcFlags::from_bits_truncate(self.method_and_flags & FLAGS_MASK)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(i32)]
pub enum ErrorCode {
    #[default]
    None = 0,
    /// Unexpected condition occurred.
    InvariantViolation = 1,
    /// IPC target pid does not name a live process.
    PidNotFound = 2,
    /// Target already has a request in flight.
    Overflow = 3,
    /// A process cannot rendezvous with itself.
    SelfSend = 4,
}

impl ErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::None => "none",
            ErrorCode::InvariantViolation => "kernel.invariant-violation",
            ErrorCode::PidNotFound => "kernel.ipc-send-message.pid-not-found",
            ErrorCode::Overflow => "kernel.ipc-send-message.overflow",
            ErrorCode::SelfSend => "kernel.ipc-send-message.self-send",
        }
    }

    pub fn to_raw(self) -> i32 {
        self as i32
    }

    pub fn from_raw(raw: i32) -> ErrorCode {
        match raw {
            0 => ErrorCode::None,
            2 => ErrorCode::PidNotFound,
            3 => ErrorCode::Overflow,
            4 => ErrorCode::SelfSend,
            _ => ErrorCode::InvariantViolation,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Response {
    pub error: ErrorCode,
    pub values: [usize; 3],
}

impl Response {
    pub fn ok(values: [usize; 3]) -> Response {
        Response {
            error: ErrorCode::None,
            values,
        }
    }

    pub fn error(error: ErrorCode) -> Response {
        Response {
            error,
            values: [0; 3],
        }
    }
}

// Both parties are paused while a comm page crosses, so a plain copy is safe.
unsafe fn copy_comm_page(src: PageAddr, dst: PageAddr) {
    core::ptr::copy_nonoverlapping(src.as_ptr::<u8>(), dst.as_ptr::<u8>(), PAGE_SIZE);
}

enum SendPath {
    Immediate(Response),
    Rendezvous(Slot),
    Queued,
}

/// Send a request to `target_pid` and block until its reply arrives.
///
/// If the target is waiting in `recv`, control passes to it directly (a
/// rendezvous, not a yield); otherwise the message is parked in the target's
/// pending slot and the sender waits its turn. Resolution failures come back
/// as an error response without blocking anyone.
pub fn send(
    target_pid: Pid,
    flags: IpcFlags,
    method: u32,
    args: [usize; 3],
) -> Response {
    let packed = pack_method_flags(method, flags);

    let path = kernel::with(|k| {
        let cur = k.procs.current;
        let cur_pid = k.procs.procs[cur].pid;

        let target = match k.procs.slot_of_pid(target_pid) {
            Some(t) => t,
            None => {
                trace!(target: "IPC", "send: target pid {:?} not found", target_pid);
                return SendPath::Immediate(Response::error(ErrorCode::PidNotFound));
            }
        };
        if target == cur {
            trace!(target: "IPC", "send: {:?} tried to send to itself", cur_pid);
            return SendPath::Immediate(Response::error(ErrorCode::SelfSend));
        }
        if k.procs.procs[target].blocked_sender.is_some()
            || k.procs.procs[target].has_pending_message
        {
            trace!(target: "IPC", "send: target slot {} already has a request in flight", target);
            return SendPath::Immediate(Response::error(ErrorCode::Overflow));
        }

        trace!(
            target: "IPC",
            "send: {:?} -> {:?} method={:#x} flags={:?}",
            cur_pid, target_pid, method, flags
        );

        if flags.contains(IpcFlags::SEND_COMM_DATA) {
            let src = k.procs.procs[cur].comm_page;
            let dst = k.procs.procs[target].comm_page;
            if !src.is_null() && !dst.is_null() {
                unsafe { copy_comm_page(src, dst) };
            }
        }

        // A target sitting in IpcWait because it is itself awaiting a reply
        // must not be woken by an unrelated request.
        let target_awaits_reply = k
            .procs
            .procs
            .iter()
            .any(|p| p.blocked_sender == Some(target));

        let t = &mut k.procs.procs[target];
        t.pending_message = Message {
            sender: cur_pid,
            method_and_flags: packed,
            args,
        };
        t.has_pending_message = true;
        t.blocked_sender = Some(cur);

        let rendezvous = t.state == ProcessState::IpcWait && !target_awaits_reply;
        if rendezvous {
            t.state = ProcessState::Runnable;
        }
        k.procs.procs[cur].state = ProcessState::IpcWait;

        if rendezvous {
            SendPath::Rendezvous(target)
        } else {
            SendPath::Queued
        }
    });

    match path {
        SendPath::Immediate(resp) => return resp,
        SendPath::Rendezvous(target) => platform::switch_to(target),
        SendPath::Queued => platform::yield_now(),
    }

    // The reply (or the target's exit) made this process runnable again and
    // filled its pending-response slot.
    kernel::with(|k| {
        let cur = k.procs.current;
        let resp = k.procs.procs[cur].pending_response;
        trace!(target: "IPC", "send returning error={:?} values={:?}", resp.error, resp.values);
        resp
    })
}

/// Block until a request arrives, then consume and return it.
pub fn recv() -> Message {
    let immediate = kernel::with(|k| {
        let cur = k.procs.current;
        let p = &mut k.procs.procs[cur];
        if p.has_pending_message {
            trace!(target: "IPC", "recv: consuming message already pending for slot {}", cur);
            p.has_pending_message = false;
            Some(p.pending_message)
        } else {
            trace!(target: "IPC", "recv: slot {} entering IPC_WAIT", cur);
            p.state = ProcessState::IpcWait;
            None
        }
    });
    if let Some(msg) = immediate {
        return msg;
    }

    platform::yield_now();

    kernel::with(|k| {
        let cur = k.procs.current;
        let p = &mut k.procs.procs[cur];
        if !p.has_pending_message {
            warn!(target: "IPC", "recv resumed without a pending message");
        }
        p.has_pending_message = false;
        p.pending_message
    })
}

/// Deliver `response` to the blocked sender of the request most recently
/// consumed by `recv`, then hand control straight back to it.
pub fn reply(response: Response) {
    let sender = kernel::with(|k| {
        let cur = k.procs.current;
        let sender = match k.procs.procs[cur].blocked_sender {
            Some(s) => s,
            None => {
                warn!(target: "IPC", "reply called with no blocked sender");
                return None;
            }
        };

        // The request's flags decide whether the comm page travels back.
        if k.procs.procs[cur]
            .pending_message
            .flags()
            .contains(IpcFlags::RECV_COMM_DATA)
        {
            let src = k.procs.procs[cur].comm_page;
            let dst = k.procs.procs[sender].comm_page;
            if !src.is_null() && !dst.is_null() {
                unsafe { copy_comm_page(src, dst) };
            }
        }

        trace!(
            target: "IPC",
            "reply: slot {} -> slot {} error={:?}",
            cur, sender, response.error
        );

        k.procs.procs[sender].pending_response = response;
        k.procs.procs[cur].blocked_sender = None;
        if k.procs.procs[sender].state == ProcessState::IpcWait {
            k.procs.procs[sender].state = ProcessState::Runnable;
        }
        Some(sender)
    });

    // The receiver resumes when it is next scheduled.
    if let Some(sender) = sender {
        platform::switch_to(sender);
    }
}
