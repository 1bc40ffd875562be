// Physical page management: every page of managed RAM is tracked by a
// PageInfo record tagged with its current owner. Pages are handed out in
// page-sized units from a free list and reclaimed in bulk per owner.

use log::{debug, trace, warn};

pub const PAGE_SIZE: usize = 4096;
pub const PAGE_SHIFT: usize = 12;

/// A physical address, expected (but not forced) to be page aligned.
/// Alignment is checked at points of use.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct PageAddr(usize);

impl PageAddr {
    pub const NULL: PageAddr = PageAddr(0);

    pub const fn new(addr: usize) -> PageAddr {
        PageAddr(addr)
    }

    pub const fn raw(self) -> usize {
        self.0
    }

    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    pub const fn is_aligned(self) -> bool {
        self.0 % PAGE_SIZE == 0
    }

    pub fn as_ptr<T>(self) -> *mut T {
        self.0 as *mut T
    }

    pub const fn add_pages(self, count: usize) -> PageAddr {
        PageAddr(self.0 + count * PAGE_SIZE)
    }
}

impl core::fmt::Debug for PageAddr {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        write!(f, "PageAddr({:#x})", self.0)
    }
}

/// Who a physical page currently belongs to. `Kernel` pages survive process
/// exit; `Proc` pages are reclaimed in bulk when their slot exits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageOwner {
    None,
    Kernel,
    Proc(usize),
}

/// One record per physical page in the managed region. `next` links the
/// page into the free list and is meaningful only while `owner == None`.
#[derive(Debug, Clone, Copy)]
pub struct PageInfo {
    pub addr: PageAddr,
    pub owner: PageOwner,
    next: Option<u32>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemoryStats {
    pub total: usize,
    pub allocated: usize,
    pub freed_lifetime: usize,
    pub processes_created: usize,
    pub peak_allocated: usize,
}

/// Tracks a half-open range of physical memory in units of one page.
///
/// The PageInfo array itself lives in pages bump-carved from the low end of
/// the managed range; those bootstrap pages are owned by the kernel and are
/// never freed.
pub struct PageAllocator {
    page_infos: PageAddr,
    total: usize,
    free_head: Option<u32>,
    stats: MemoryStats,
    initialized: bool,
}

impl PageAllocator {
    pub fn new() -> Self {
        PageAllocator {
            page_infos: PageAddr::NULL,
            total: 0,
            free_head: None,
            stats: MemoryStats::default(),
            initialized: false,
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// Set up page tracking over `[ram, ram_end)`. Idempotent: a second call
    /// returns without work.
    pub fn init(&mut self, ram: PageAddr, ram_end: PageAddr) {
        if self.initialized {
            return;
        }

        debug!("initializing page allocator over {:?}..{:?}", ram, ram_end);

        let total = (ram_end.raw() - ram.raw()) / PAGE_SIZE;
        if total == 0 {
            panic!("managed memory range holds no pages");
        }

        // Bump-carve the PageInfo array from the low end of the range.
        let infos_bytes = total * core::mem::size_of::<PageInfo>();
        let infos_pages = (infos_bytes + PAGE_SIZE - 1) / PAGE_SIZE;
        if infos_pages >= total {
            panic!(
                "managed region too small: {} pages cannot hold their own tracking array",
                total
            );
        }

        debug!(
            target: "MEM",
            "total pages: {}, bootstrap pages for PageInfo array: {}",
            total, infos_pages
        );

        self.page_infos = ram;
        self.total = total;

        // Every record is written exactly once before the array is read.
        let infos = self.page_infos.as_ptr::<PageInfo>();
        let mut prev: Option<u32> = None;
        let mut head: Option<u32> = None;
        for i in 0..total {
            let addr = ram.add_pages(i);
            let owner = if i < infos_pages {
                PageOwner::Kernel
            } else {
                PageOwner::None
            };
            unsafe {
                infos.add(i).write(PageInfo {
                    addr,
                    owner,
                    next: None,
                })
            };
            if owner == PageOwner::None {
                if head.is_none() {
                    head = Some(i as u32);
                }
                if let Some(p) = prev {
                    unsafe { (*infos.add(p as usize)).next = Some(i as u32) };
                }
                prev = Some(i as u32);
            }
        }
        self.free_head = head;

        self.stats = MemoryStats {
            total,
            allocated: infos_pages,
            freed_lifetime: 0,
            processes_created: 0,
            peak_allocated: infos_pages,
        };
        self.initialized = true;

        debug!(target: "MEM", "page allocator ready, {} pages free", total - infos_pages);
    }

    fn infos(&self) -> &[PageInfo] {
        unsafe { core::slice::from_raw_parts(self.page_infos.as_ptr::<PageInfo>(), self.total) }
    }

    fn infos_mut(&mut self) -> &mut [PageInfo] {
        unsafe {
            core::slice::from_raw_parts_mut(self.page_infos.as_ptr::<PageInfo>(), self.total)
        }
    }

    /// Number of pages currently on the free list.
    pub fn free_pages(&self) -> usize {
        let infos = self.infos();
        let mut n = 0;
        let mut cursor = self.free_head;
        while let Some(i) = cursor {
            n += 1;
            cursor = infos[i as usize].next;
        }
        n
    }

    /// Remove `count` pages from the free list, tag them with `owner`, zero
    /// their contents, and return the address of the first page removed.
    ///
    /// Exhaustion is fatal: out-of-memory is not a recoverable condition
    /// here, so the caller never sees a partial allocation.
    pub fn allocate(&mut self, owner: PageOwner, count: usize) -> PageAddr {
        if !self.initialized {
            panic!("page allocator used before init");
        }
        if count == 0 {
            panic!("cannot allocate 0 pages");
        }

        trace!(target: "MEM", "allocate: owner={:?} count={}", owner, count);

        let available = self.free_pages();
        if available < count {
            panic!(
                "out of memory: requested {} pages, only {} available",
                count, available
            );
        }

        let mut first = PageAddr::NULL;
        for n in 0..count {
            let head = self.free_head.expect("free list shorter than its count");
            let (addr, next) = {
                let info = &mut self.infos_mut()[head as usize];
                info.owner = owner;
                let next = info.next;
                info.next = None;
                (info.addr, next)
            };
            self.free_head = next;
            unsafe { core::ptr::write_bytes(addr.as_ptr::<u8>(), 0, PAGE_SIZE) };
            if n == 0 {
                first = addr;
            }
            trace!(target: "MEM", "allocated page {:?} to {:?}", addr, owner);
        }

        self.stats.allocated += count;
        if self.stats.allocated > self.stats.peak_allocated {
            self.stats.peak_allocated = self.stats.allocated;
        }

        first
    }

    /// Return every page tagged with `owner` to the free list, zeroing the
    /// page contents so nothing leaks across owners. Returns the number of
    /// pages freed. No-op when uninitialised.
    pub fn free_all_owned_by(&mut self, owner: PageOwner) -> usize {
        if !self.initialized {
            debug!(target: "MEM", "free_all_owned_by before init, nothing to do");
            return 0;
        }
        if owner == PageOwner::Kernel || owner == PageOwner::None {
            warn!(target: "MEM", "refusing to bulk-free {:?} pages", owner);
            return 0;
        }

        let mut freed = 0;
        let mut free_head = self.free_head;
        for i in 0..self.total {
            let infos = self.infos_mut();
            if infos[i].owner != owner {
                continue;
            }
            let addr = infos[i].addr;
            infos[i].owner = PageOwner::None;
            infos[i].next = free_head;
            free_head = Some(i as u32);
            unsafe { core::ptr::write_bytes(addr.as_ptr::<u8>(), 0, PAGE_SIZE) };
            freed += 1;
            trace!(target: "MEM", "freed page {:?} from {:?}", addr, owner);
        }
        self.free_head = free_head;

        self.stats.allocated -= freed;
        self.stats.freed_lifetime += freed;
        debug!(target: "MEM", "freed {} pages from {:?}", freed, owner);
        freed
    }

    pub fn owner_of(&self, addr: PageAddr) -> Option<PageOwner> {
        self.infos().iter().find(|p| p.addr == addr).map(|p| p.owner)
    }

    pub fn pages_owned_by(&self, owner: PageOwner) -> usize {
        self.infos().iter().filter(|p| p.owner == owner).count()
    }

    pub fn stats(&self) -> MemoryStats {
        self.stats
    }

    pub fn note_process_created(&mut self) {
        self.stats.processes_created += 1;
    }
}

// Known memory: a small closed set of named, contiguous physical regions
// with exclusive single-holder leases. The backing pages are allocated once
// (owner Kernel, so process exit never reclaims them) and their address is
// stable for the lifetime of the kernel; only the holder changes.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KnownRegion {
    Framebuffer,
}

pub const KNOWN_REGION_COUNT: usize = 1;

impl KnownRegion {
    fn index(self) -> usize {
        match self {
            KnownRegion::Framebuffer => 0,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct KnownMemoryEntry {
    addr: PageAddr,
    page_count: usize,
    holder: PageOwner,
}

pub struct KnownMemoryTable {
    entries: [KnownMemoryEntry; KNOWN_REGION_COUNT],
}

impl KnownMemoryTable {
    pub fn new() -> Self {
        KnownMemoryTable {
            entries: [KnownMemoryEntry {
                addr: PageAddr::NULL,
                page_count: 0,
                holder: PageOwner::None,
            }; KNOWN_REGION_COUNT],
        }
    }

    /// Take the exclusive lease on `region` for `holder`, allocating the
    /// backing pages on first use. Returns the region's address, or `None`
    /// when the region is held by someone else or the request does not fit
    /// the committed size.
    pub fn lock(
        &mut self,
        mem: &mut PageAllocator,
        region: KnownRegion,
        page_count: usize,
        holder: PageOwner,
    ) -> Option<PageAddr> {
        if page_count == 0 {
            warn!(target: "MEM", "known_memory_lock: zero-page request for {:?}", region);
            return None;
        }

        let entry = &mut self.entries[region.index()];

        if entry.holder != PageOwner::None && entry.holder != holder {
            debug!(
                target: "MEM",
                "known_memory_lock: {:?} already held by {:?}", region, entry.holder
            );
            return None;
        }

        if entry.addr.is_null() {
            // First lease commits the region's address and size. This must
            // happen before the free list fragments, or the pages will not
            // be physically contiguous.
            let addr = mem.allocate(PageOwner::Kernel, page_count);
            entry.addr = addr;
            entry.page_count = page_count;
            debug!(
                target: "MEM",
                "known_memory_lock: committed {} pages at {:?} for {:?}",
                page_count, addr, region
            );
        }

        if page_count > entry.page_count {
            debug!(
                target: "MEM",
                "known_memory_lock: requested {} pages but {:?} committed {}",
                page_count, region, entry.page_count
            );
            return None;
        }

        entry.holder = holder;
        Some(entry.addr)
    }

    /// Drop every lease held by `holder`. The backing pages stay allocated;
    /// the region's address must remain stable for later holders.
    pub fn release_all_held_by(&mut self, holder: PageOwner) {
        for entry in self.entries.iter_mut() {
            if entry.holder == holder {
                debug!(target: "MEM", "releasing known region at {:?} from {:?}", entry.addr, holder);
                entry.holder = PageOwner::None;
            }
        }
    }

    pub fn holder_of(&self, region: KnownRegion) -> PageOwner {
        self.entries[region.index()].holder
    }

    pub fn address_of(&self, region: KnownRegion) -> PageAddr {
        self.entries[region.index()].addr
    }
}
