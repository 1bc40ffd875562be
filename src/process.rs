// Process table and cooperative scheduler. Processes live in a fixed array
// of descriptors; the slot index doubles as the page-owner id, while the pid
// is globally unique and never reused. Cross-process references (the blocked
// sender of a rendezvous) are slot indices, never pointers; the table itself
// owns every descriptor.

use log::{debug, warn};

use crate::ipc::{ErrorCode, Message, Response};
use crate::memory::{KnownMemoryTable, PageAddr, PageAllocator, PageOwner};
use crate::platform;

pub const PROCS_MAX: usize = 8;
pub const IDLE_SLOT: Slot = 0;
pub const PROC_NAME_MAX: usize = 31;
pub const STACK_SIZE: usize = 8192;

/// Words the context-switch primitive pops on first entry: ra then s0..s11.
/// This must match the primitive's save/restore sequence bit-for-bit.
const CONTEXT_WORDS: usize = 13;

/// Virtual base of a loaded user image (embedded target).
pub const USER_BASE: usize = 0x0100_0000;
/// Virtual base of the per-process page heap (embedded target).
pub const HEAP_BASE: usize = 0x0400_0000;

pub type Slot = usize;

/// Globally unique, monotonically increasing process id. Outlives the slot
/// assignment; never reused after exit. `Pid(0)` is the invalid pid.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Pid(pub u64);

impl Pid {
    pub const INVALID: Pid = Pid(0);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    Unused,
    Runnable,
    IpcWait,
    Terminated,
}

/// What a new process runs: a kernel-mode entry function linked into the
/// kernel, or a user-mode binary image mapped at USER_BASE. Image loading
/// only exists on the embedded target.
#[derive(Clone, Copy)]
pub enum ProcessImage<'a> {
    Kernel(fn()),
    User(&'a [u8]),
}

pub struct Process {
    pub name: heapless::String<PROC_NAME_MAX>,
    pub pid: Pid,
    pub state: ProcessState,
    pub stack_ptr: usize,
    pub stack: [u8; STACK_SIZE],
    pub user_pc: usize,
    pub page_table: PageAddr,
    pub pending_message: Message,
    pub pending_response: Response,
    pub has_pending_message: bool,
    pub blocked_sender: Option<Slot>,
    pub arg_page: PageAddr,
    pub comm_page: PageAddr,
    pub heap_next: usize,
    pub started: bool,
}

impl Process {
    fn empty() -> Process {
        Process {
            name: heapless::String::new(),
            pid: Pid::INVALID,
            state: ProcessState::Unused,
            stack_ptr: 0,
            stack: [0; STACK_SIZE],
            user_pc: 0,
            page_table: PageAddr::NULL,
            pending_message: Message::default(),
            pending_response: Response::default(),
            has_pending_message: false,
            blocked_sender: None,
            arg_page: PageAddr::NULL,
            comm_page: PageAddr::NULL,
            heap_next: 0,
            started: false,
        }
    }
}

pub struct ProcessTable {
    pub procs: [Process; PROCS_MAX],
    pub current: Slot,
    next_pid: u64,
}

impl ProcessTable {
    pub fn new() -> Self {
        ProcessTable {
            procs: core::array::from_fn(|_| Process::empty()),
            current: IDLE_SLOT,
            next_pid: 1,
        }
    }

    pub fn current(&self) -> &Process {
        &self.procs[self.current]
    }

    pub fn current_mut(&mut self) -> &mut Process {
        let cur = self.current;
        &mut self.procs[cur]
    }

    /// Claim the first unused slot and set the descriptor up so the first
    /// context switch into it lands at its entry point. Fatal when the table
    /// is full.
    pub fn create(
        &mut self,
        mem: &mut PageAllocator,
        name: &str,
        image: ProcessImage,
        args: Option<&[u8]>,
    ) -> Slot {
        let slot = self
            .procs
            .iter()
            .position(|p| p.state == ProcessState::Unused)
            .unwrap_or_else(|| panic!("reached process limit"));

        let pid = Pid(self.next_pid);
        self.next_pid += 1;

        let entry_ra = match image {
            ProcessImage::Kernel(entry) => entry as usize,
            // User images start life in the user-entry trampoline.
            ProcessImage::User(_) => platform::user_entry_addr(),
        };

        let p = &mut self.procs[slot];
        *p = Process::empty();

        for ch in name.chars() {
            if p.name.push(ch).is_err() {
                break;
            }
        }

        p.pid = pid;
        p.state = ProcessState::Runnable;
        p.user_pc = match image {
            ProcessImage::Kernel(entry) => entry as usize,
            ProcessImage::User(_) => USER_BASE,
        };
        p.heap_next = HEAP_BASE;

        // Seed the kernel stack with the callee-saved frame the first switch
        // into this process will pop: the return address word at the bottom,
        // twelve zeroed s-registers above it.
        let frame_base = STACK_SIZE - CONTEXT_WORDS * core::mem::size_of::<usize>();
        let mut offset = frame_base;
        for word in core::iter::once(entry_ra).chain(core::iter::repeat(0).take(CONTEXT_WORDS - 1))
        {
            p.stack[offset..offset + core::mem::size_of::<usize>()]
                .copy_from_slice(&word.to_ne_bytes());
            offset += core::mem::size_of::<usize>();
        }
        p.stack_ptr = p.stack[frame_base..].as_ptr() as usize;

        if let Some(bytes) = args {
            let arg_page = mem.allocate(PageOwner::Proc(slot), 1);
            let copy_len = bytes.len().min(crate::memory::PAGE_SIZE);
            if copy_len < bytes.len() {
                warn!(target: "PROC", "arguments for '{}' truncated to one page", name);
            }
            unsafe {
                core::ptr::copy_nonoverlapping(bytes.as_ptr(), arg_page.as_ptr::<u8>(), copy_len)
            };
            self.procs[slot].arg_page = arg_page;
        }

        #[cfg(all(target_arch = "riscv32", target_os = "none"))]
        self.build_address_space(mem, slot, image);

        mem.note_process_created();

        debug!(
            target: "PROC",
            "created process '{}' pid={:?} slot={} stack_ptr={:#x}",
            self.procs[slot].name, pid, slot, self.procs[slot].stack_ptr
        );

        slot
    }

    /// Build the two-level page table for a new process: identity-map every
    /// kernel page, then copy and map the user image at USER_BASE.
    #[cfg(all(target_arch = "riscv32", target_os = "none"))]
    fn build_address_space(&mut self, mem: &mut PageAllocator, slot: Slot, image: ProcessImage) {
        use crate::memory::PAGE_SIZE;
        use crate::vm::{self, PteFlags};

        let owner = PageOwner::Proc(slot);
        let root = mem.allocate(owner, 1);

        let (kernel_base, kernel_end) = platform::kernel_image_range();
        let mut paddr = kernel_base;
        while paddr < kernel_end {
            vm::map_page(
                mem,
                root,
                paddr,
                PageAddr::new(paddr),
                PteFlags::R | PteFlags::W | PteFlags::X,
                owner,
            );
            paddr += PAGE_SIZE;
        }

        if let ProcessImage::User(bytes) = image {
            log::trace!(target: "PROC", "loading {}-byte user image for slot {}", bytes.len(), slot);
            let mut off = 0;
            while off < bytes.len() {
                let page = mem.allocate(owner, 1);
                let copy_len = PAGE_SIZE.min(bytes.len() - off);
                unsafe {
                    core::ptr::copy_nonoverlapping(
                        bytes.as_ptr().add(off),
                        page.as_ptr::<u8>(),
                        copy_len,
                    )
                };
                vm::map_page(
                    mem,
                    root,
                    USER_BASE + off,
                    page,
                    PteFlags::U | PteFlags::R | PteFlags::W | PteFlags::X,
                    owner,
                );
                off += PAGE_SIZE;
            }
        }

        self.procs[slot].page_table = root;
    }

    /// Fair round-robin: scan one slot past the current process, wrapping,
    /// and take the first runnable non-idle slot. Idle is the fallback.
    pub fn next_runnable(&self) -> Slot {
        for i in 0..PROCS_MAX {
            let slot = (self.current + i + 1) % PROCS_MAX;
            if slot != IDLE_SLOT && self.procs[slot].state == ProcessState::Runnable {
                return slot;
            }
        }
        IDLE_SLOT
    }

    pub fn lookup(&self, name: &str) -> Option<Pid> {
        self.procs
            .iter()
            .find(|p| p.state != ProcessState::Unused && p.name.as_str() == name)
            .map(|p| p.pid)
    }

    pub fn slot_of_pid(&self, pid: Pid) -> Option<Slot> {
        if pid == Pid::INVALID {
            return None;
        }
        self.procs
            .iter()
            .position(|p| p.state != ProcessState::Unused && p.pid == pid)
    }

    /// True while any non-idle slot could still be scheduled.
    pub fn any_runnable(&self) -> bool {
        self.procs
            .iter()
            .enumerate()
            .any(|(i, p)| i != IDLE_SLOT && p.state == ProcessState::Runnable)
    }

    /// A terminated slot awaiting destruction. `skip` names a slot whose
    /// kernel stack is still live (the caller's own context) and must be
    /// left alone; the scheduler fiber on the hosted backend passes `None`
    /// because no process context is running while it holds the CPU.
    pub fn find_terminated(&self, skip: Option<Slot>) -> Option<Slot> {
        self.procs
            .iter()
            .enumerate()
            .find(|(i, p)| Some(*i) != skip && p.state == ProcessState::Terminated)
            .map(|(i, _)| i)
    }

    /// Destroy a terminated process: release every page it owns and every
    /// known-memory lease it holds, resolve any rendezvous it was part of,
    /// and clear the descriptor back to Unused.
    pub fn exit(&mut self, mem: &mut PageAllocator, known: &mut KnownMemoryTable, slot: Slot) {
        debug!(
            target: "PROC",
            "process '{}' (pid={:?}, slot={}) exiting",
            self.procs[slot].name, self.procs[slot].pid, slot
        );

        // A sender still blocked on this process gets an error response
        // rather than waiting forever.
        if let Some(sender) = self.procs[slot].blocked_sender.take() {
            debug!(target: "PROC", "unblocking sender slot {} of exiting slot {}", sender, slot);
            self.procs[sender].pending_response = Response::error(ErrorCode::PidNotFound);
            if self.procs[sender].state == ProcessState::IpcWait {
                self.procs[sender].state = ProcessState::Runnable;
            }
        }
        // And nobody may keep a back-pointer at the vacated slot.
        for p in self.procs.iter_mut() {
            if p.blocked_sender == Some(slot) {
                p.blocked_sender = None;
            }
        }

        mem.free_all_owned_by(PageOwner::Proc(slot));
        known.release_all_held_by(PageOwner::Proc(slot));

        self.procs[slot] = Process::empty();
    }

    /// Mark every live process terminated; the scheduler winds down once the
    /// current context yields.
    pub fn shutdown_all(&mut self) {
        debug!(target: "PROC", "shutting down all processes");
        for p in self.procs.iter_mut() {
            if p.state != ProcessState::Unused {
                p.state = ProcessState::Terminated;
            }
        }
    }

    pub fn ensure_arg_page(&mut self, mem: &mut PageAllocator, slot: Slot) -> PageAddr {
        if self.procs[slot].arg_page.is_null() {
            self.procs[slot].arg_page = mem.allocate(PageOwner::Proc(slot), 1);
        }
        self.procs[slot].arg_page
    }

    pub fn ensure_comm_page(&mut self, mem: &mut PageAllocator, slot: Slot) -> PageAddr {
        if self.procs[slot].comm_page.is_null() {
            self.procs[slot].comm_page = mem.allocate(PageOwner::Proc(slot), 1);
        }
        self.procs[slot].comm_page
    }

    /// One fresh page for the calling process. On the embedded target the
    /// page is also mapped into the caller's address space at the next heap
    /// address and the mapped address is returned.
    pub fn alloc_mapped_page(&mut self, mem: &mut PageAllocator, slot: Slot) -> PageAddr {
        let page = mem.allocate(PageOwner::Proc(slot), 1);
        self.map_heap_page(mem, slot, page)
    }

    #[cfg(all(target_arch = "riscv32", target_os = "none"))]
    fn map_heap_page(&mut self, mem: &mut PageAllocator, slot: Slot, page: PageAddr) -> PageAddr {
        use crate::vm::{self, PteFlags};
        let vaddr = self.procs[slot].heap_next;
        let root = self.procs[slot].page_table;
        vm::map_page(
            mem,
            root,
            vaddr,
            page,
            PteFlags::U | PteFlags::R | PteFlags::W,
            PageOwner::Proc(slot),
        );
        self.procs[slot].heap_next = vaddr + crate::memory::PAGE_SIZE;
        PageAddr::new(vaddr)
    }

    #[cfg(not(all(target_arch = "riscv32", target_os = "none")))]
    fn map_heap_page(&mut self, _mem: &mut PageAllocator, _slot: Slot, page: PageAddr) -> PageAddr {
        page
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::PAGE_SIZE;

    fn test_allocator(pages: usize) -> PageAllocator {
        let layout = std::alloc::Layout::from_size_align(pages * PAGE_SIZE, PAGE_SIZE).unwrap();
        let ptr = unsafe { std::alloc::alloc_zeroed(layout) };
        assert!(!ptr.is_null());
        let start = PageAddr::new(ptr as usize);
        let mut mem = PageAllocator::new();
        mem.init(start, start.add_pages(pages));
        mem
    }

    fn noop() {}

    #[test]
    fn empty_table_schedules_idle() {
        let table = ProcessTable::new();
        assert_eq!(table.next_runnable(), IDLE_SLOT);
    }

    #[test]
    fn round_robin_starts_past_current_and_wraps() {
        let mut mem = test_allocator(32);
        let mut table = ProcessTable::new();
        table.create(&mut mem, "idle", ProcessImage::Kernel(noop), None);
        let a = table.create(&mut mem, "a", ProcessImage::Kernel(noop), None);
        let b = table.create(&mut mem, "b", ProcessImage::Kernel(noop), None);

        table.current = a;
        assert_eq!(table.next_runnable(), b);
        table.current = b;
        assert_eq!(table.next_runnable(), a);
    }

    #[test]
    fn scheduler_skips_waiting_and_terminated_slots() {
        let mut mem = test_allocator(32);
        let mut table = ProcessTable::new();
        table.create(&mut mem, "idle", ProcessImage::Kernel(noop), None);
        let a = table.create(&mut mem, "a", ProcessImage::Kernel(noop), None);
        let b = table.create(&mut mem, "b", ProcessImage::Kernel(noop), None);
        let c = table.create(&mut mem, "c", ProcessImage::Kernel(noop), None);

        table.procs[a].state = ProcessState::IpcWait;
        table.procs[b].state = ProcessState::Terminated;
        table.current = IDLE_SLOT;
        assert_eq!(table.next_runnable(), c);

        table.procs[c].state = ProcessState::Terminated;
        assert_eq!(table.next_runnable(), IDLE_SLOT);
    }

    #[test]
    fn pids_are_monotonic_and_never_reused() {
        let mut mem = test_allocator(32);
        let mut table = ProcessTable::new();
        table.create(&mut mem, "idle", ProcessImage::Kernel(noop), None);
        let a = table.create(&mut mem, "a", ProcessImage::Kernel(noop), None);
        let b = table.create(&mut mem, "b", ProcessImage::Kernel(noop), None);
        let pid_a = table.procs[a].pid;
        let pid_b = table.procs[b].pid;
        assert!(pid_b.0 > pid_a.0);

        // Recycle slot a; the pid moves on regardless.
        let mut known = KnownMemoryTable::new();
        table.procs[a].state = ProcessState::Terminated;
        table.exit(&mut mem, &mut known, a);
        let again = table.create(&mut mem, "a2", ProcessImage::Kernel(noop), None);
        assert_eq!(again, a);
        assert!(table.procs[again].pid.0 > pid_b.0);
    }

    #[test]
    fn names_truncate_at_31_bytes() {
        let mut mem = test_allocator(32);
        let mut table = ProcessTable::new();
        let long = "abcdefghijklmnopqrstuvwxyz-abcdefghijklmnop";
        let slot = table.create(&mut mem, long, ProcessImage::Kernel(noop), None);
        assert_eq!(table.procs[slot].name.len(), PROC_NAME_MAX);
        assert_eq!(table.procs[slot].name.as_str(), &long[..PROC_NAME_MAX]);
    }

    #[test]
    fn initial_stack_frame_matches_context_switch_layout() {
        let mut mem = test_allocator(32);
        let mut table = ProcessTable::new();
        let slot = table.create(&mut mem, "p", ProcessImage::Kernel(noop), None);
        let p = &table.procs[slot];

        let word = core::mem::size_of::<usize>();
        let frame_base = STACK_SIZE - CONTEXT_WORDS * word;
        assert_eq!(p.stack_ptr, p.stack[frame_base..].as_ptr() as usize);

        // Word 0 is the return address; the twelve above it are zeroed
        // callee-saved registers.
        let read_word = |i: usize| {
            let off = frame_base + i * word;
            usize::from_ne_bytes(p.stack[off..off + word].try_into().unwrap())
        };
        assert_eq!(read_word(0), noop as usize);
        for i in 1..CONTEXT_WORDS {
            assert_eq!(read_word(i), 0);
        }
    }

    #[test]
    fn argument_bytes_land_in_the_arg_page() {
        let mut mem = test_allocator(32);
        let mut table = ProcessTable::new();
        let slot = table.create(&mut mem, "p", ProcessImage::Kernel(noop), Some(b"hello args"));
        let page = table.procs[slot].arg_page;
        assert!(!page.is_null());
        let contents = unsafe { core::slice::from_raw_parts(page.as_ptr::<u8>(), 10) };
        assert_eq!(contents, b"hello args");
        assert_eq!(mem.owner_of(page), Some(PageOwner::Proc(slot)));
    }

    #[test]
    fn lookup_finds_live_processes_by_name() {
        let mut mem = test_allocator(32);
        let mut table = ProcessTable::new();
        table.create(&mut mem, "idle", ProcessImage::Kernel(noop), None);
        let s = table.create(&mut mem, "server", ProcessImage::Kernel(noop), None);
        let pid = table.procs[s].pid;
        assert_eq!(table.lookup("server"), Some(pid));
        assert_eq!(table.lookup("missing"), None);
        assert_eq!(table.slot_of_pid(pid), Some(s));
        assert_eq!(table.slot_of_pid(Pid(0xDEAD_BEEF)), None);
        assert_eq!(table.slot_of_pid(Pid::INVALID), None);
    }

    #[test]
    fn exit_releases_pages_and_leases_and_clears_the_descriptor() {
        let mut mem = test_allocator(64);
        let mut known = KnownMemoryTable::new();
        let mut table = ProcessTable::new();
        table.create(&mut mem, "idle", ProcessImage::Kernel(noop), None);
        let slot = table.create(&mut mem, "p", ProcessImage::Kernel(noop), Some(b"args"));
        table.ensure_comm_page(&mut mem, slot);
        table.alloc_mapped_page(&mut mem, slot);
        known
            .lock(&mut mem, crate::memory::KnownRegion::Framebuffer, 2, PageOwner::Proc(slot))
            .unwrap();

        assert!(mem.pages_owned_by(PageOwner::Proc(slot)) >= 3);
        table.procs[slot].state = ProcessState::Terminated;
        table.exit(&mut mem, &mut known, slot);

        assert_eq!(mem.pages_owned_by(PageOwner::Proc(slot)), 0);
        assert_eq!(
            known.holder_of(crate::memory::KnownRegion::Framebuffer),
            PageOwner::None
        );
        assert_eq!(table.procs[slot].state, ProcessState::Unused);
        assert_eq!(table.procs[slot].pid, Pid::INVALID);
        assert!(table.procs[slot].name.is_empty());
    }

    #[test]
    fn exit_unblocks_a_dangling_sender() {
        let mut mem = test_allocator(32);
        let mut known = KnownMemoryTable::new();
        let mut table = ProcessTable::new();
        table.create(&mut mem, "idle", ProcessImage::Kernel(noop), None);
        let server = table.create(&mut mem, "server", ProcessImage::Kernel(noop), None);
        let client = table.create(&mut mem, "client", ProcessImage::Kernel(noop), None);

        // Client mid-send: parked waiting for the server's reply.
        table.procs[client].state = ProcessState::IpcWait;
        table.procs[server].blocked_sender = Some(client);

        table.procs[server].state = ProcessState::Terminated;
        table.exit(&mut mem, &mut known, server);

        assert_eq!(table.procs[client].state, ProcessState::Runnable);
        assert_eq!(
            table.procs[client].pending_response.error,
            ErrorCode::PidNotFound
        );
    }

    #[test]
    #[should_panic(expected = "reached process limit")]
    fn table_overflow_is_fatal() {
        let mut mem = test_allocator(32);
        let mut table = ProcessTable::new();
        for i in 0..=PROCS_MAX {
            let name = format!("p{}", i);
            table.create(&mut mem, &name, ProcessImage::Kernel(noop), None);
        }
    }
}
