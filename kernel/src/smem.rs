//! Named shared-memory regions.
//!
//! A region is created by name, mapped into any number of address spaces,
//! and backed by a lazily-populated store of page frames. The store keeps
//! one reference per frame of its own, so pages survive while unmapped and
//! die with the region. Each region carries an advisory lock with a
//! condition-variable wait queue; locking requires the region to be mapped
//! by the caller.
//!
//! Lock discipline: the region table lock may be taken while holding the
//! process table lock, never the other way around.

use alloc::string::{String, ToString};
use alloc::sync::Arc;
use alloc::vec::Vec;

use bitflags::bitflags;
use hashbrown::HashMap;

use crate::error::{Error, Result};
use crate::pmem::{PhysMem, Pfn, PAGE_SIZE};
use crate::sched::{Scheduler, Tid};
use crate::sync::{CondVar, Mutex};
use crate::vm::{AddrSpace, AsId, MemPerm, RegionKind, Vaddr};

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct RegionFlags: u32 {
        /// Region survives its last unmapping; only a forced destroy
        /// removes it.
        const PERSIST = 1 << 8;
    }
}

struct RmapEntry {
    as_id: AsId,
    start: Vaddr,
    end: Vaddr,
}

/// One named region: its backing pages, who maps it, and the lock word.
struct SmemContext {
    pages: Vec<Option<Pfn>>,
    rmap: Vec<RmapEntry>,
    refcnt: usize,
    flags: RegionFlags,
    locked_by: Option<Tid>,
    lock_cv: Arc<CondVar>,
}

impl SmemContext {
    fn mapped_by(&self, as_id: AsId) -> bool {
        self.rmap.iter().any(|e| e.as_id == as_id)
    }
}

pub struct SmemTable {
    inner: Mutex<HashMap<String, SmemContext>>,
}

impl SmemTable {
    pub fn new() -> Self {
        SmemTable {
            inner: Mutex::new(HashMap::new()),
        }
    }

    // ========================================================================
    // Region lifecycle
    // ========================================================================

    pub fn create(&self, name: &str, pages: usize, flags: RegionFlags) -> Result<()> {
        if name.is_empty() || pages == 0 {
            return Err(Error::Invalid);
        }
        let mut table = self.inner.lock();
        if table.contains_key(name) {
            return Err(Error::Exists);
        }
        let mut backing = Vec::new();
        backing.resize(pages, None);
        table.insert(
            name.to_string(),
            SmemContext {
                pages: backing,
                rmap: Vec::new(),
                refcnt: 0,
                flags,
                locked_by: None,
                lock_cv: Arc::new(CondVar::new()),
            },
        );
        log::debug!("smem: created region '{}' ({} pages)", name, pages);
        Ok(())
    }

    /// Destroy a region by name. Fails with `Mapped` while any address
    /// space still maps it, and with `Persist` for persistent regions
    /// unless `force` is set.
    pub fn destroy(&self, name: &str, force: bool, pmem: &PhysMem) -> Result<()> {
        let mut table = self.inner.lock();
        let ctx = table.get(name).ok_or(Error::NotFound)?;
        if ctx.refcnt > 0 {
            return Err(Error::Mapped);
        }
        if ctx.flags.contains(RegionFlags::PERSIST) && !force {
            return Err(Error::Persist);
        }
        let ctx = table.remove(name).expect("checked above");
        drop(table);
        Self::release_store(&ctx, pmem);
        log::debug!("smem: destroyed region '{}'", name);
        Ok(())
    }

    fn release_store(ctx: &SmemContext, pmem: &PhysMem) {
        for pfn in ctx.pages.iter().flatten() {
            pmem.dec_ref(*pfn);
        }
    }

    // ========================================================================
    // Mappings
    // ========================================================================

    /// Map the named region into `aspace` at a kernel-chosen address.
    /// Pages are not populated here; they fault in from the store.
    pub fn map(&self, name: &str, aspace: &mut AddrSpace) -> Result<Vaddr> {
        let mut table = self.inner.lock();
        let ctx = table.get_mut(name).ok_or(Error::NotFound)?;
        let start = aspace.map_region(
            None,
            ctx.pages.len(),
            MemPerm::URW,
            RegionKind::Shared(name.to_string()),
        )?;
        ctx.rmap.push(RmapEntry {
            as_id: aspace.id,
            start,
            end: start + ctx.pages.len() * PAGE_SIZE,
        });
        ctx.refcnt += 1;
        Ok(start)
    }

    /// Register a mapping that already exists in `as_id` (the fork path
    /// copies the region record and calls here for the bookkeeping).
    pub(crate) fn register_existing(
        &self,
        name: &str,
        as_id: AsId,
        start: Vaddr,
    ) -> Result<()> {
        let mut table = self.inner.lock();
        let ctx = table.get_mut(name).ok_or(Error::NotFound)?;
        ctx.rmap.push(RmapEntry {
            as_id,
            start,
            end: start + ctx.pages.len() * PAGE_SIZE,
        });
        ctx.refcnt += 1;
        Ok(())
    }

    /// Remove the caller's mapping containing `va`. When the last mapping
    /// of a non-persistent region goes away the region is torn down too.
    pub fn unmap(
        &self,
        name: &str,
        va: Vaddr,
        aspace: &mut AddrSpace,
        pmem: &PhysMem,
    ) -> Result<()> {
        let mut table = self.inner.lock();
        let ctx = table.get_mut(name).ok_or(Error::NotFound)?;
        let idx = ctx
            .rmap
            .iter()
            .position(|e| e.as_id == aspace.id && va >= e.start && va < e.end)
            .ok_or(Error::NotFound)?;
        let entry = ctx.rmap.remove(idx);
        aspace.unmap_region(entry.start, pmem)?;
        ctx.refcnt -= 1;
        if ctx.refcnt == 0 && !ctx.flags.contains(RegionFlags::PERSIST) {
            let ctx = table.remove(name).expect("present");
            drop(table);
            Self::release_store(&ctx, pmem);
            log::debug!("smem: region '{}' torn down with last mapping", name);
        }
        Ok(())
    }

    /// Drop every mapping `aspace` holds, as part of address-space
    /// teardown.
    pub fn unmap_all(&self, aspace: &mut AddrSpace, pmem: &PhysMem) {
        let shared: Vec<(String, Vaddr)> = aspace
            .regions()
            .iter()
            .filter_map(|r| match &r.kind {
                RegionKind::Shared(name) => Some((name.clone(), r.start)),
                _ => None,
            })
            .collect();
        for (name, start) in shared {
            if let Err(e) = self.unmap(&name, start, aspace, pmem) {
                log::warn!("smem: unmap of '{}' during teardown failed: {}", name, e);
            }
        }
    }

    // ========================================================================
    // Region locks
    // ========================================================================

    /// Take the region's advisory lock, sleeping while another thread
    /// holds it. Re-locking by the current holder is a no-op.
    pub fn lock(&self, name: &str, as_id: AsId, sched: &Scheduler) -> Result<()> {
        let me = crate::cpu::current().ok_or(Error::Invalid)?;
        let mut table = self.inner.lock();
        loop {
            let ctx = table.get_mut(name).ok_or(Error::NotFound)?;
            if !ctx.mapped_by(as_id) {
                return Err(Error::NotFound);
            }
            match ctx.locked_by {
                None => {
                    ctx.locked_by = Some(me);
                    return Ok(());
                }
                Some(holder) if holder == me => return Ok(()),
                Some(_) => {
                    let cv = ctx.lock_cv.clone();
                    cv.wait_with(&mut table, sched);
                }
            }
        }
    }

    /// Release the region's lock. Only the holder may unlock.
    pub fn unlock(&self, name: &str, as_id: AsId, sched: &Scheduler) -> Result<()> {
        let me = crate::cpu::current().ok_or(Error::Invalid)?;
        let mut table = self.inner.lock();
        let ctx = table.get_mut(name).ok_or(Error::NotFound)?;
        if !ctx.mapped_by(as_id) {
            return Err(Error::NotFound);
        }
        if ctx.locked_by != Some(me) {
            return Err(Error::Invalid);
        }
        ctx.locked_by = None;
        ctx.lock_cv.signal(sched);
        Ok(())
    }

    // ========================================================================
    // Fault delegation
    // ========================================================================

    /// Resolve a fault inside a shared region: find or allocate the store
    /// page for the faulting offset and map it into `aspace`.
    pub fn handle_fault(
        &self,
        name: &str,
        aspace: &mut AddrSpace,
        region_start: Vaddr,
        fault_addr: Vaddr,
        pmem: &PhysMem,
    ) -> Result<()> {
        let mut table = self.inner.lock();
        let ctx = table.get_mut(name).ok_or(Error::Fault)?;
        let index = (fault_addr - region_start) / PAGE_SIZE;
        if index >= ctx.pages.len() {
            return Err(Error::Fault);
        }
        let pfn = match ctx.pages[index] {
            Some(pfn) => pfn,
            None => {
                // First touch anywhere: the store takes its own reference.
                let pfn = pmem.alloc()?;
                ctx.pages[index] = Some(pfn);
                pfn
            }
        };
        pmem.inc_ref(pfn);
        aspace.map_page(
            crate::pmem::pg_round_down(fault_addr),
            pfn,
            MemPerm::URW,
        );
        Ok(())
    }

    // ========================================================================
    // Introspection
    // ========================================================================

    pub fn region_count(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn mapping_count(&self, name: &str) -> Option<usize> {
        self.inner.lock().get(name).map(|c| c.refcnt)
    }

    pub fn lock_holder(&self, name: &str) -> Option<Tid> {
        self.inner.lock().get(name).and_then(|c| c.locked_by)
    }
}

impl Default for SmemTable {
    fn default() -> Self {
        SmemTable::new()
    }
}

/// Current-process entry points. These resolve the caller's address space
/// and hand off to the table.
impl crate::Kernel {
    pub fn shm_create(&self, name: &str, pages: usize, flags: RegionFlags) -> Result<()> {
        self.smem.create(name, pages, flags)
    }

    pub fn shm_destroy(&self, name: &str, force: bool) -> Result<()> {
        self.smem.destroy(name, force, &self.pmem)
    }

    pub fn shm_map(&self, name: &str) -> Result<Vaddr> {
        let pid = self.current_pid().ok_or(Error::Invalid)?;
        let mut table = self.ptable.lock();
        let p = table.get_mut(&pid).ok_or(Error::Invalid)?;
        self.smem.map(name, &mut p.aspace)
    }

    pub fn shm_unmap(&self, name: &str, va: Vaddr) -> Result<()> {
        let pid = self.current_pid().ok_or(Error::Invalid)?;
        let mut table = self.ptable.lock();
        let p = table.get_mut(&pid).ok_or(Error::Invalid)?;
        self.smem.unmap(name, va, &mut p.aspace, &self.pmem)
    }

    pub fn shm_lock(&self, name: &str) -> Result<()> {
        let as_id = self.current_as_id()?;
        self.smem.lock(name, as_id, &self.sched)
    }

    pub fn shm_unlock(&self, name: &str) -> Result<()> {
        let as_id = self.current_as_id()?;
        self.smem.unlock(name, as_id, &self.sched)
    }

    fn current_as_id(&self) -> Result<AsId> {
        let pid = self.current_pid().ok_or(Error::Invalid)?;
        let table = self.ptable.lock();
        let p = table.get(&pid).ok_or(Error::Invalid)?;
        Ok(p.aspace.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sched::DEFAULT_PRIORITY;
    use crate::sync;

    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    fn setup() -> (SmemTable, PhysMem, AddrSpace) {
        sync::init();
        (SmemTable::new(), PhysMem::new(), AddrSpace::new())
    }

    #[test]
    fn create_is_name_unique() {
        let (smem, _pmem, _aspace) = setup();
        smem.create("buf", 2, RegionFlags::empty()).unwrap();
        assert_eq!(smem.create("buf", 2, RegionFlags::empty()), Err(Error::Exists));
        assert_eq!(smem.create("", 2, RegionFlags::empty()), Err(Error::Invalid));
        assert_eq!(smem.create("x", 0, RegionFlags::empty()), Err(Error::Invalid));
    }

    #[test]
    fn destroy_refuses_while_mapped() {
        let (smem, pmem, mut aspace) = setup();
        smem.create("buf", 1, RegionFlags::empty()).unwrap();
        let va = smem.map("buf", &mut aspace).unwrap();
        assert_eq!(smem.destroy("buf", false, &pmem), Err(Error::Mapped));
        smem.unmap("buf", va, &mut aspace, &pmem).unwrap();
        // Last unmap of a non-persistent region already tore it down.
        assert_eq!(smem.destroy("buf", false, &pmem), Err(Error::NotFound));
    }

    #[test]
    fn persistent_region_survives_last_unmap() {
        let (smem, pmem, mut aspace) = setup();
        smem.create("cfg", 1, RegionFlags::PERSIST).unwrap();
        let va = smem.map("cfg", &mut aspace).unwrap();

        // Populate a page, then unmap: the store keeps it alive.
        smem.handle_fault("cfg", &mut aspace, va, va, &pmem).unwrap();
        aspace.write_bytes(&pmem, va, b"persist me").unwrap();
        smem.unmap("cfg", va, &mut aspace, &pmem).unwrap();
        assert_eq!(smem.region_count(), 1);
        assert_eq!(pmem.allocated(), 1);

        // A new mapping sees the old contents.
        let va2 = smem.map("cfg", &mut aspace).unwrap();
        smem.handle_fault("cfg", &mut aspace, va2, va2, &pmem).unwrap();
        let mut buf = [0u8; 10];
        aspace.read_bytes(&pmem, va2, &mut buf).unwrap();
        assert_eq!(&buf, b"persist me");

        smem.unmap("cfg", va2, &mut aspace, &pmem).unwrap();
        assert_eq!(smem.destroy("cfg", false, &pmem), Err(Error::Persist));
        smem.destroy("cfg", true, &pmem).unwrap();
        assert_eq!(pmem.allocated(), 0);
    }

    #[test]
    fn two_spaces_share_the_same_frames() {
        let (smem, pmem, mut a) = setup();
        let mut b = AddrSpace::new();
        smem.create("shm", 2, RegionFlags::empty()).unwrap();
        let va_a = smem.map("shm", &mut a).unwrap();
        let va_b = smem.map("shm", &mut b).unwrap();
        assert_eq!(smem.mapping_count("shm"), Some(2));

        smem.handle_fault("shm", &mut a, va_a, va_a, &pmem).unwrap();
        a.write_bytes(&pmem, va_a, b"hello").unwrap();

        smem.handle_fault("shm", &mut b, va_b, va_b, &pmem).unwrap();
        let mut buf = [0u8; 5];
        b.read_bytes(&pmem, va_b, &mut buf).unwrap();
        assert_eq!(&buf, b"hello");

        // store ref + two mappings
        let pfn = a.lookup(va_a).unwrap().pfn;
        assert_eq!(pmem.refcnt(pfn), Some(3));
    }

    #[test]
    fn region_lock_is_reentrant_and_holder_checked() {
        let (smem, _pmem, mut aspace) = setup();
        let sched = Scheduler::new();
        sched.start_cpu();
        let tid = sched.create_thread("locker", None, DEFAULT_PRIORITY);
        sched.adopt(tid);

        smem.create("lk", 1, RegionFlags::empty()).unwrap();
        smem.map("lk", &mut aspace).unwrap();

        assert_eq!(smem.lock("nope", aspace.id, &sched), Err(Error::NotFound));
        let unmapped = AddrSpace::new();
        assert_eq!(smem.lock("lk", unmapped.id, &sched), Err(Error::NotFound));

        smem.lock("lk", aspace.id, &sched).unwrap();
        smem.lock("lk", aspace.id, &sched).unwrap();
        assert_eq!(smem.lock_holder("lk"), Some(tid));
        smem.unlock("lk", aspace.id, &sched).unwrap();
        assert_eq!(smem.lock_holder("lk"), None);
        assert_eq!(smem.unlock("lk", aspace.id, &sched), Err(Error::Invalid));
    }

    #[test]
    fn region_lock_blocks_until_released() {
        let (smem, _pmem, mut aspace) = setup();
        let smem = Arc::new(smem);
        let sched = Arc::new(Scheduler::new());
        sched.start_cpu();
        let holder = sched.create_thread("holder", None, DEFAULT_PRIORITY);
        sched.adopt(holder);

        smem.create("lk", 1, RegionFlags::empty()).unwrap();
        smem.map("lk", &mut aspace).unwrap();
        let as_id = aspace.id;
        smem.lock("lk", as_id, &sched).unwrap();

        let contender = sched.create_thread("contender", None, DEFAULT_PRIORITY);
        let acquired = Arc::new(AtomicBool::new(false));
        let (s2, m2, a2) = (sched.clone(), smem.clone(), acquired.clone());
        let h = std::thread::spawn(move || {
            s2.adopt(contender);
            m2.lock("lk", as_id, &s2).unwrap();
            a2.store(true, Ordering::SeqCst);
            m2.unlock("lk", as_id, &s2).unwrap();
        });

        std::thread::sleep(Duration::from_millis(50));
        assert!(!acquired.load(Ordering::SeqCst));
        assert_eq!(smem.lock_holder("lk"), Some(holder));

        smem.unlock("lk", as_id, &sched).unwrap();
        h.join().unwrap();
        assert!(acquired.load(Ordering::SeqCst));
        assert_eq!(smem.lock_holder("lk"), None);
    }

    #[test]
    fn unmap_requires_a_matching_mapping() {
        let (smem, pmem, mut aspace) = setup();
        let mut other = AddrSpace::new();
        smem.create("shm", 1, RegionFlags::empty()).unwrap();
        let va = smem.map("shm", &mut aspace).unwrap();
        assert_eq!(
            smem.unmap("shm", va, &mut other, &pmem),
            Err(Error::NotFound)
        );
        smem.unmap("shm", va, &mut aspace, &pmem).unwrap();
    }
}
