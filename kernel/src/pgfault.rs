//! Page fault resolution.
//!
//! Faults arrive with three facts: was the page present (protection fault
//! versus missing page), was it a write, did it come from user mode. The
//! handler resolves copy-on-write upgrades, demand-zeroes stack and heap
//! pages, and delegates shared-region pages to the backing store. Anything
//! else is unresolvable: user processes are killed, kernel faults panic.

use core::sync::atomic::Ordering;

use alloc::string::String;
use alloc::vec::Vec;

use bitflags::bitflags;

use crate::error::{Error, Result};
use crate::pmem::{pg_round_down, pg_round_up, PAGE_SIZE};
use crate::vm::{MemPerm, RegionKind, Vaddr};
use crate::Kernel;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FaultFlags: u8 {
        /// The page was mapped; the access violated its permissions.
        const PRESENT = 1 << 0;
        /// The faulting access was a write.
        const WRITE = 1 << 1;
        /// The access came from user mode.
        const USER = 1 << 2;
    }
}

impl Kernel {
    /// Resolve a fault at `addr` for the current process. `Err` means the
    /// fault is unresolvable; the trap wrapper decides the consequence.
    pub fn handle_page_fault(&self, addr: Vaddr, flags: FaultFlags) -> Result<()> {
        if flags.contains(FaultFlags::USER) {
            self.user_faults.fetch_add(1, Ordering::Relaxed);
        }
        let cur_pid = self.current_pid().ok_or(Error::Fault)?;
        let mut table = self.ptable.lock();
        let p = table.get_mut(&cur_pid).ok_or(Error::Fault)?;
        let region = p.aspace.find_region(addr).ok_or(Error::Fault)?.clone();

        if flags.contains(FaultFlags::PRESENT) {
            // Protection fault. The only one we resolve is a write to a
            // private page whose region allows writing: copy-on-write.
            if !flags.contains(FaultFlags::WRITE)
                || !region.perm.contains(MemPerm::WRITE)
                || matches!(region.kind, RegionKind::Shared(_))
            {
                return Err(Error::Fault);
            }
            let entry = p.aspace.lookup(addr).ok_or(Error::Fault)?;
            if entry.perm.contains(MemPerm::WRITE) {
                // Already writable: stale fault, nothing to do.
                return Ok(());
            }
            let frame = self.pmem.frame(entry.pfn).ok_or(Error::Fault)?;
            frame.lock.acquire(&self.sched);
            let res = if frame.refcnt() == 1 {
                // Last reference: take the page back in place.
                p.aspace.set_perm(addr, region.perm);
                Ok(())
            } else {
                match self.pmem.alloc() {
                    Ok(new_pfn) => {
                        let new_frame = self.pmem.frame(new_pfn).expect("just allocated");
                        new_frame.copy_from(&frame);
                        p.aspace.remap_page(addr, new_pfn, region.perm);
                        self.pmem.dec_ref(entry.pfn);
                        log::trace!("cow copy at {:#x} for pid {}", addr, cur_pid);
                        Ok(())
                    }
                    Err(e) => Err(e),
                }
            };
            frame.lock.release(&self.sched);
            return res;
        }

        // Missing page: what it means depends on the region.
        match &region.kind {
            RegionKind::Shared(name) => {
                let name = name.clone();
                self.smem
                    .handle_fault(&name, &mut p.aspace, region.start, addr, &self.pmem)
            }
            RegionKind::Stack | RegionKind::Heap => {
                let pfn = self.pmem.alloc()?;
                p.aspace.map_page(pg_round_down(addr), pfn, region.perm);
                Ok(())
            }
            RegionKind::Fixed => Err(Error::Fault),
        }
    }

    /// Trap-level entry. Kernel-mode faults are fatal; user faults that
    /// cannot be resolved kill the process.
    pub fn page_fault_trap(&self, addr: Vaddr, flags: FaultFlags) {
        if !flags.contains(FaultFlags::USER) {
            panic!("kernel page fault at {addr:#x} ({flags:?})");
        }
        if let Err(e) = self.handle_page_fault(addr, flags) {
            log::warn!(
                "pid {:?}: unresolvable fault at {:#x} ({:?}): {}",
                self.current_pid(),
                addr,
                flags,
                e
            );
            self.exit(-1);
        }
    }

    /// Total user-mode page faults since boot.
    pub fn user_fault_count(&self) -> u64 {
        self.user_faults.load(Ordering::Relaxed)
    }

    // ========================================================================
    // Kernel access to user memory
    // ========================================================================

    /// Fault in every page backing `[va, va + len)`, with write intent if
    /// `write`. Mirrors what the hardware would do as the kernel touches
    /// the range on the process's behalf.
    fn user_access(&self, va: Vaddr, len: usize, write: bool) -> Result<()> {
        if len == 0 {
            return Ok(());
        }
        let cur_pid = self.current_pid().ok_or(Error::Fault)?;
        let end = va.checked_add(len).map(pg_round_up).ok_or(Error::Fault)?;
        let mut page = pg_round_down(va);
        while page < end {
            let need = {
                let table = self.ptable.lock();
                let p = table.get(&cur_pid).ok_or(Error::Fault)?;
                match p.aspace.lookup(page) {
                    None => {
                        let mut flags = FaultFlags::USER;
                        if write {
                            flags |= FaultFlags::WRITE;
                        }
                        Some(flags)
                    }
                    Some(e) if write && !e.perm.contains(MemPerm::WRITE) => {
                        Some(FaultFlags::PRESENT | FaultFlags::WRITE | FaultFlags::USER)
                    }
                    Some(_) => None,
                }
            };
            if let Some(flags) = need {
                self.handle_page_fault(page, flags)?;
            }
            page += PAGE_SIZE;
        }
        Ok(())
    }

    pub fn copy_from_user(&self, va: Vaddr, buf: &mut [u8]) -> Result<()> {
        self.user_access(va, buf.len(), false)?;
        let cur_pid = self.current_pid().ok_or(Error::Fault)?;
        let table = self.ptable.lock();
        let p = table.get(&cur_pid).ok_or(Error::Fault)?;
        p.aspace.read_bytes(&self.pmem, va, buf)
    }

    pub fn copy_to_user(&self, va: Vaddr, buf: &[u8]) -> Result<()> {
        self.user_access(va, buf.len(), true)?;
        let cur_pid = self.current_pid().ok_or(Error::Fault)?;
        let table = self.ptable.lock();
        let p = table.get(&cur_pid).ok_or(Error::Fault)?;
        p.aspace.write_bytes(&self.pmem, va, buf)
    }

    /// Read a NUL-terminated string of at most `max` bytes.
    pub fn read_user_cstr(&self, va: Vaddr, max: usize) -> Result<String> {
        let mut out = Vec::new();
        for i in 0..max {
            let mut byte = [0u8; 1];
            self.copy_from_user(va + i, &mut byte)?;
            if byte[0] == 0 {
                return String::from_utf8(out).map_err(|_| Error::Invalid);
            }
            out.push(byte[0]);
        }
        Err(Error::Invalid)
    }

    pub fn read_user_u64(&self, va: Vaddr) -> Result<u64> {
        let mut buf = [0u8; 8];
        self.copy_from_user(va, &mut buf)?;
        Ok(u64::from_ne_bytes(buf))
    }

    pub fn write_user_u64(&self, va: Vaddr, value: u64) -> Result<()> {
        self.copy_to_user(va, &value.to_ne_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stack::{USTACK_PAGES, USTACK_UPPERBOUND};
    use crate::test_util::test_kernel;

    fn spawned(kernel: &Kernel) -> crate::proc::Pid {
        let pid = kernel.spawn("init", &["init"]).unwrap();
        let tid = kernel.ptable.lock().get(&pid).unwrap().threads[0];
        kernel.sched.adopt(tid);
        pid
    }

    #[test]
    fn stack_reserve_demand_zeroes() {
        let kernel = test_kernel();
        let pid = spawned(&kernel);
        let deep = USTACK_UPPERBOUND - (USTACK_PAGES - 1) * crate::pmem::PAGE_SIZE;

        let before = kernel.user_fault_count();
        kernel
            .handle_page_fault(deep, FaultFlags::WRITE | FaultFlags::USER)
            .unwrap();
        assert_eq!(kernel.user_fault_count(), before + 1);

        let table = kernel.ptable.lock();
        let entry = table.get(&pid).unwrap().aspace.lookup(deep).unwrap();
        assert!(entry.perm.contains(MemPerm::WRITE));
        let frame = kernel.pmem.frame(entry.pfn).unwrap();
        let mut buf = [0xaau8; 8];
        frame.read(0, &mut buf);
        assert_eq!(buf, [0u8; 8]);
    }

    #[test]
    fn heap_faults_only_after_sbrk() {
        let kernel = test_kernel();
        let _pid = spawned(&kernel);
        let heap_base = kernel.sbrk(0).unwrap();

        // Below the break: outside every region, unresolvable.
        assert_eq!(
            kernel.handle_page_fault(heap_base + PAGE_SIZE, FaultFlags::USER),
            Err(Error::Fault)
        );

        kernel.sbrk(3 * PAGE_SIZE as isize).unwrap();
        kernel
            .handle_page_fault(heap_base + PAGE_SIZE, FaultFlags::USER)
            .unwrap();
        kernel
            .copy_to_user(heap_base, b"heap data spanning")
            .unwrap();
        let mut back = [0u8; 18];
        kernel.copy_from_user(heap_base, &mut back).unwrap();
        assert_eq!(&back, b"heap data spanning");
    }

    #[test]
    fn cow_write_copies_shared_page() {
        let kernel = test_kernel();
        let parent = spawned(&kernel);
        let child = kernel.fork().unwrap();
        let stack_page = USTACK_UPPERBOUND - PAGE_SIZE;

        let parent_pfn = {
            let table = kernel.ptable.lock();
            table.get(&parent).unwrap().aspace.lookup(stack_page).unwrap().pfn
        };
        assert_eq!(kernel.pmem.refcnt(parent_pfn), Some(2));

        // Parent writes its (now read-only) stack page.
        kernel.copy_to_user(stack_page, b"parent-private").unwrap();

        let table = kernel.ptable.lock();
        let parent_entry = table.get(&parent).unwrap().aspace.lookup(stack_page).unwrap();
        let child_entry = table.get(&child).unwrap().aspace.lookup(stack_page).unwrap();
        assert_ne!(parent_entry.pfn, child_entry.pfn);
        assert_eq!(child_entry.pfn, parent_pfn);
        assert_eq!(kernel.pmem.refcnt(parent_entry.pfn), Some(1));
        assert_eq!(kernel.pmem.refcnt(child_entry.pfn), Some(1));
        assert!(parent_entry.perm.contains(MemPerm::WRITE));
    }

    #[test]
    fn cow_last_reference_upgrades_in_place() {
        let kernel = std::sync::Arc::new(test_kernel());
        let parent = spawned(&kernel);
        let child = kernel.fork().unwrap();
        let child_tid = kernel.ptable.lock().get(&child).unwrap().threads[0];
        let stack_page = USTACK_UPPERBOUND - PAGE_SIZE;

        let k2 = kernel.clone();
        std::thread::spawn(move || {
            k2.sched.adopt(child_tid);
            k2.exit(0);
        })
        .join()
        .unwrap();

        let pfn_before = {
            let table = kernel.ptable.lock();
            table.get(&parent).unwrap().aspace.lookup(stack_page).unwrap().pfn
        };
        assert_eq!(kernel.pmem.refcnt(pfn_before), Some(1));
        let frames_before = kernel.pmem.allocated();

        kernel.copy_to_user(stack_page, b"still mine").unwrap();

        let table = kernel.ptable.lock();
        let entry = table.get(&parent).unwrap().aspace.lookup(stack_page).unwrap();
        // Same frame, no copy.
        assert_eq!(entry.pfn, pfn_before);
        assert_eq!(kernel.pmem.allocated(), frames_before);
        assert!(entry.perm.contains(MemPerm::WRITE));
    }

    #[test]
    fn unresolvable_user_fault_kills_the_process() {
        let kernel = test_kernel();
        let pid = spawned(&kernel);
        kernel.page_fault_trap(0xdead_0000, FaultFlags::USER);
        let table = kernel.ptable.lock();
        assert_eq!(table.get(&pid).unwrap().exit_status, Some(-1));
    }

    #[test]
    #[should_panic(expected = "kernel page fault")]
    fn kernel_mode_fault_panics() {
        let kernel = test_kernel();
        let _pid = spawned(&kernel);
        kernel.page_fault_trap(0xdead_0000, FaultFlags::empty());
    }

    #[test]
    fn cow_preserves_page_contents() {
        let kernel = test_kernel();
        let _parent = spawned(&kernel);
        let heap_base = kernel.sbrk(PAGE_SIZE as isize).unwrap();
        kernel.copy_to_user(heap_base, b"before fork").unwrap();

        let _child = kernel.fork().unwrap();
        kernel.copy_to_user(heap_base + 100, b"after").unwrap();

        let mut buf = [0u8; 11];
        kernel.copy_from_user(heap_base, &mut buf).unwrap();
        assert_eq!(&buf, b"before fork");
    }
}
