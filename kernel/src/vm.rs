//! Per-process address spaces.
//!
//! An [`AddrSpace`] is a list of [`MemRegion`]s plus a page map from virtual
//! page to physical frame and effective permissions. The region tells the
//! fault handler what a missing page means (demand-zero stack/heap, shared
//! region, plain private memory); the page map entry is what the hardware
//! checks on access.

use alloc::string::String;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};

use bitflags::bitflags;
use hashbrown::HashMap;

use crate::error::{Error, Result};
use crate::pmem::{pg_round_down, pg_round_up, PhysMem, Pfn, PAGE_SIZE};

pub type Vaddr = usize;
pub type AsId = u64;

/// Lowest address handed out by anywhere-placement.
pub const MMAP_BASE: Vaddr = 0x1000_0000;

static NEXT_AS_ID: AtomicU64 = AtomicU64::new(1);

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MemPerm: u8 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const USER = 1 << 2;
    }
}

impl MemPerm {
    /// User read-only.
    pub const UR: MemPerm = MemPerm::READ.union(MemPerm::USER);
    /// User read-write.
    pub const URW: MemPerm = MemPerm::READ.union(MemPerm::WRITE).union(MemPerm::USER);
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegionKind {
    /// Fixed-placement memory (program image).
    Fixed,
    /// Grows upward via `sbrk`; missing pages are demand-zeroed.
    Heap,
    /// Grows downward; missing pages inside the reserve are demand-zeroed.
    Stack,
    /// Backed by the named shared-memory region.
    Shared(String),
}

/// Contiguous range `[start, end)` of user address space.
#[derive(Debug, Clone)]
pub struct MemRegion {
    pub start: Vaddr,
    pub end: Vaddr,
    pub perm: MemPerm,
    pub kind: RegionKind,
}

impl MemRegion {
    pub fn contains(&self, addr: Vaddr) -> bool {
        addr >= self.start && addr < self.end
    }

    pub fn pages(&self) -> usize {
        (pg_round_up(self.end) - pg_round_down(self.start)) / PAGE_SIZE
    }
}

/// Page map entry: where a virtual page lives and what access it allows.
/// The entry's permissions may be narrower than the region's, which is
/// exactly the copy-on-write trigger.
#[derive(Debug, Clone, Copy)]
pub struct PageMapEntry {
    pub pfn: Pfn,
    pub perm: MemPerm,
}

pub struct AddrSpace {
    pub id: AsId,
    regions: Vec<MemRegion>,
    pmap: HashMap<Vaddr, PageMapEntry>,
    mmap_cursor: Vaddr,
    tlb_flushes: u64,
}

impl AddrSpace {
    pub fn new() -> Self {
        AddrSpace {
            id: NEXT_AS_ID.fetch_add(1, Ordering::Relaxed),
            regions: Vec::new(),
            pmap: HashMap::new(),
            mmap_cursor: MMAP_BASE,
            tlb_flushes: 0,
        }
    }

    // ========================================================================
    // Regions
    // ========================================================================

    pub fn regions(&self) -> &[MemRegion] {
        &self.regions
    }

    pub fn find_region(&self, addr: Vaddr) -> Option<&MemRegion> {
        self.regions.iter().find(|r| r.contains(addr))
    }

    fn overlaps(&self, start: Vaddr, end: Vaddr) -> bool {
        self.regions.iter().any(|r| start < r.end && r.start < end)
    }

    /// Carve out a region. `start == None` means "anywhere": placement
    /// comes from a bump cursor above [`MMAP_BASE`]. Zero-length regions
    /// are allowed (a fresh heap starts empty).
    pub fn map_region(
        &mut self,
        start: Option<Vaddr>,
        pages: usize,
        perm: MemPerm,
        kind: RegionKind,
    ) -> Result<Vaddr> {
        let len = pages * PAGE_SIZE;
        let start = match start {
            Some(addr) => {
                if pg_round_down(addr) != addr {
                    return Err(Error::Invalid);
                }
                addr
            }
            None => {
                let addr = self.mmap_cursor;
                self.mmap_cursor += len.max(PAGE_SIZE);
                addr
            }
        };
        if len > 0 && self.overlaps(start, start + len) {
            return Err(Error::Invalid);
        }
        self.regions.push(MemRegion {
            start,
            end: start + len,
            perm,
            kind,
        });
        Ok(start)
    }

    /// Remove the region starting at `start`, unmapping and dereferencing
    /// every present page inside it.
    pub fn unmap_region(&mut self, start: Vaddr, pmem: &PhysMem) -> Result<()> {
        let idx = self
            .regions
            .iter()
            .position(|r| r.start == start)
            .ok_or(Error::NotFound)?;
        let region = self.regions.remove(idx);
        let mut va = pg_round_down(region.start);
        while va < pg_round_up(region.end) {
            if let Some(entry) = self.pmap.remove(&va) {
                pmem.dec_ref(entry.pfn);
            }
            va += PAGE_SIZE;
        }
        self.flush_tlb();
        Ok(())
    }

    /// Extend a region's low bound downward (the stack reserve).
    pub fn extend_region_down(&mut self, start: Vaddr, new_start: Vaddr) -> Result<()> {
        if new_start > start || pg_round_down(new_start) != new_start {
            return Err(Error::Invalid);
        }
        if self.overlaps(new_start, start) {
            return Err(Error::Invalid);
        }
        let region = self
            .regions
            .iter_mut()
            .find(|r| r.start == start)
            .ok_or(Error::NotFound)?;
        region.start = new_start;
        Ok(())
    }

    /// Grow (or shrink, with negative `delta`) the heap region's top.
    /// Returns the old break. Grown pages are not mapped here; they fault
    /// in on first touch.
    pub fn sbrk(&mut self, delta: isize, pmem: &PhysMem) -> Result<Vaddr> {
        let heap = self
            .regions
            .iter()
            .position(|r| r.kind == RegionKind::Heap)
            .ok_or(Error::Invalid)?;
        let old_end = self.regions[heap].end;
        let new_end = old_end.checked_add_signed(delta).ok_or(Error::Invalid)?;
        if new_end < self.regions[heap].start {
            return Err(Error::Invalid);
        }
        let grown_end = pg_round_up(new_end);
        if grown_end > old_end
            && self
                .regions
                .iter()
                .enumerate()
                .any(|(i, r)| i != heap && old_end < r.end && r.start < grown_end)
        {
            return Err(Error::OutOfMemory);
        }
        self.regions[heap].end = new_end;
        if new_end < old_end {
            let mut va = pg_round_up(new_end);
            let mut flushed = false;
            while va < pg_round_up(old_end) {
                if let Some(entry) = self.pmap.remove(&va) {
                    pmem.dec_ref(entry.pfn);
                    flushed = true;
                }
                va += PAGE_SIZE;
            }
            if flushed {
                self.flush_tlb();
            }
        }
        Ok(old_end)
    }

    // ========================================================================
    // Page map
    // ========================================================================

    pub fn map_page(&mut self, va: Vaddr, pfn: Pfn, perm: MemPerm) {
        let va = pg_round_down(va);
        let prev = self.pmap.insert(va, PageMapEntry { pfn, perm });
        debug_assert!(prev.is_none(), "map_page: double map at {va:#x}");
    }

    pub fn lookup(&self, va: Vaddr) -> Option<PageMapEntry> {
        self.pmap.get(&pg_round_down(va)).copied()
    }

    /// Swap the frame and permissions behind an existing mapping (COW
    /// replacement copy).
    pub fn remap_page(&mut self, va: Vaddr, pfn: Pfn, perm: MemPerm) {
        let va = pg_round_down(va);
        let entry = self.pmap.get_mut(&va).expect("remap_page: unmapped page");
        entry.pfn = pfn;
        entry.perm = perm;
        self.flush_tlb();
    }

    pub fn set_perm(&mut self, va: Vaddr, perm: MemPerm) {
        let va = pg_round_down(va);
        let entry = self.pmap.get_mut(&va).expect("set_perm: unmapped page");
        entry.perm = perm;
        self.flush_tlb();
    }

    pub fn unmap_page(&mut self, va: Vaddr) -> Option<Pfn> {
        let pfn = self.pmap.remove(&pg_round_down(va)).map(|e| e.pfn);
        if pfn.is_some() {
            self.flush_tlb();
        }
        pfn
    }

    pub fn mapped_pages(&self) -> usize {
        self.pmap.len()
    }

    /// Stale-translation barrier. Hosted builds only count invocations;
    /// the count backs the test assertion that permission changes flush.
    pub fn flush_tlb(&mut self) {
        self.tlb_flushes += 1;
        #[cfg(all(not(feature = "hosted"), target_arch = "x86_64"))]
        unsafe {
            core::arch::asm!(
                "mov {tmp}, cr3",
                "mov cr3, {tmp}",
                tmp = out(reg) _,
                options(nostack)
            );
        }
    }

    pub fn tlb_flushes(&self) -> u64 {
        self.tlb_flushes
    }

    // ========================================================================
    // Byte access (the kernel's view of user memory)
    // ========================================================================

    /// Copy bytes out of mapped user memory. Fails with `Fault` on any
    /// unmapped or non-user page in the range.
    pub fn read_bytes(&self, pmem: &PhysMem, va: Vaddr, buf: &mut [u8]) -> Result<()> {
        let mut pos = 0;
        while pos < buf.len() {
            let (frame, off, n) = self.resolve(pmem, va + pos, buf.len() - pos, false)?;
            frame.read(off, &mut buf[pos..pos + n]);
            pos += n;
        }
        Ok(())
    }

    /// Copy bytes into mapped user memory. Requires write permission on
    /// every page in the range.
    pub fn write_bytes(&self, pmem: &PhysMem, va: Vaddr, buf: &[u8]) -> Result<()> {
        let mut pos = 0;
        while pos < buf.len() {
            let (frame, off, n) = self.resolve(pmem, va + pos, buf.len() - pos, true)?;
            frame.write(off, &buf[pos..pos + n]);
            pos += n;
        }
        Ok(())
    }

    fn resolve(
        &self,
        pmem: &PhysMem,
        addr: Vaddr,
        remaining: usize,
        need_write: bool,
    ) -> Result<(alloc::sync::Arc<crate::pmem::PageFrame>, usize, usize)> {
        let page = pg_round_down(addr);
        let entry = self.lookup(page).ok_or(Error::Fault)?;
        if !entry.perm.contains(MemPerm::USER)
            || (need_write && !entry.perm.contains(MemPerm::WRITE))
        {
            return Err(Error::Fault);
        }
        let frame = pmem.frame(entry.pfn).ok_or(Error::Fault)?;
        let off = addr - page;
        let n = (PAGE_SIZE - off).min(remaining);
        Ok((frame, off, n))
    }

    // ========================================================================
    // Duplication and teardown
    // ========================================================================

    /// Duplicate this address space for `fork`.
    ///
    /// Private regions share frames copy-on-write: every present page is
    /// downgraded to read-only in both parent and child and gains a
    /// reference. Shared regions copy only the region record; their pages
    /// re-fault from the backing store. Returns the child space plus the
    /// (name, start) pairs of shared regions the caller must re-register.
    pub fn duplicate_cow(&mut self, pmem: &PhysMem) -> Result<(AddrSpace, Vec<(String, Vaddr)>)> {
        let mut child = AddrSpace::new();
        child.mmap_cursor = self.mmap_cursor;
        let mut shared = Vec::new();

        for region in self.regions.clone() {
            let is_shared = matches!(&region.kind, RegionKind::Shared(_));
            let (start, end) = (region.start, region.end);
            if let RegionKind::Shared(name) = &region.kind {
                shared.push((name.clone(), start));
            }
            child.regions.push(region);
            if is_shared {
                continue;
            }
            let mut va = pg_round_down(start);
            while va < pg_round_up(end) {
                if let Some(entry) = self.pmap.get_mut(&va) {
                    let ro = entry.perm.difference(MemPerm::WRITE);
                    entry.perm = ro;
                    child.pmap.insert(
                        va,
                        PageMapEntry {
                            pfn: entry.pfn,
                            perm: ro,
                        },
                    );
                    pmem.inc_ref(entry.pfn);
                }
                va += PAGE_SIZE;
            }
        }
        self.flush_tlb();
        Ok((child, shared))
    }

    /// Drop every private mapping. Shared regions must already be gone;
    /// the caller routes those through the shared-memory table first.
    pub fn teardown(&mut self, pmem: &PhysMem) {
        debug_assert!(
            !self
                .regions
                .iter()
                .any(|r| matches!(r.kind, RegionKind::Shared(_))),
            "teardown with live shared regions"
        );
        for (_va, entry) in self.pmap.drain() {
            pmem.dec_ref(entry.pfn);
        }
        self.regions.clear();
        self.flush_tlb();
    }
}

impl Default for AddrSpace {
    fn default() -> Self {
        AddrSpace::new()
    }
}
