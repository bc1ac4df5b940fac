//! Process lifecycle: spawn, fork, wait, exit.
//!
//! The process table maps pid to [`Proc`] and is guarded by one mutex;
//! `wait` sleeps on the parent's condition variable with that same lock,
//! and `exit` signals it while holding the lock. A process that has exited
//! keeps its table entry, with `exit_status` set, until the parent reaps
//! it; `wait` is where the record finally leaves the table.
//!
//! Lock order: process table, then shared-memory table, then scheduler.

use core::mem;
use core::sync::atomic::Ordering;

use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;

use hashbrown::HashMap;

use crate::arch::TrapFrame;
use crate::cpu;
use crate::error::{Error, Result};
use crate::file::{Dir, File};
use crate::pmem::PAGE_SIZE;
use crate::sched::{Tid, DEFAULT_PRIORITY};
use crate::stack::{build_initial_stack, USTACK_PAGES, USTACK_UPPERBOUND};
use crate::sync::{CondVar, Mutex, MutexGuard};
use crate::vm::{AddrSpace, MemPerm, RegionKind, Vaddr};
use crate::Kernel;

pub type Pid = usize;

/// The first process; orphans are reparented to it.
pub const ROOT_PID: Pid = 0;

/// Descriptor table size.
pub const PROC_MAX_FILE: usize = 16;

pub struct Proc {
    pub pid: Pid,
    pub name: String,
    pub aspace: AddrSpace,
    pub files: [Option<Arc<File>>; PROC_MAX_FILE],
    pub parent: Option<Pid>,
    pub children: Vec<Pid>,
    pub exit_status: Option<i32>,
    pub threads: Vec<Tid>,
    pub wait_cv: Arc<CondVar>,
    /// Working directory; `None` only after exit released it.
    pub cwd: Option<Arc<Dir>>,
}

impl Proc {
    fn new(pid: Pid, name: &str) -> Self {
        let mut files: [Option<Arc<File>>; PROC_MAX_FILE] = Default::default();
        files[0] = Some(Arc::new(File::Stdin));
        files[1] = Some(Arc::new(File::Stdout));
        Proc {
            pid,
            name: String::from(name),
            aspace: AddrSpace::new(),
            files,
            parent: None,
            children: Vec::new(),
            exit_status: None,
            threads: Vec::new(),
            wait_cv: Arc::new(CondVar::new()),
            cwd: Some(Dir::root()),
        }
    }
}

pub struct ProcTable {
    procs: Mutex<HashMap<Pid, Proc>>,
    next_pid: Mutex<Pid>,
}

impl ProcTable {
    pub fn new() -> Self {
        ProcTable {
            procs: Mutex::new(HashMap::new()),
            next_pid: Mutex::new(ROOT_PID),
        }
    }

    /// Pids are monotonic and never reused.
    pub fn alloc_pid(&self) -> Pid {
        let mut next = self.next_pid.lock();
        let pid = *next;
        *next += 1;
        pid
    }

    pub fn lock(&self) -> MutexGuard<'_, HashMap<Pid, Proc>> {
        self.procs.lock()
    }

    pub fn count(&self) -> usize {
        self.procs.lock().len()
    }
}

impl Default for ProcTable {
    fn default() -> Self {
        ProcTable::new()
    }
}

impl Kernel {
    // ========================================================================
    // Identity
    // ========================================================================

    pub fn current_pid(&self) -> Option<Pid> {
        cpu::current().and_then(|tid| self.sched.thread_pid(tid))
    }

    pub fn getpid(&self) -> Result<Pid> {
        self.current_pid().ok_or(Error::Invalid)
    }

    /// Create the root process. Called once from [`Kernel::new`].
    pub(crate) fn install_root(&self) {
        let pid = self.ptable.alloc_pid();
        debug_assert_eq!(pid, ROOT_PID);
        self.ptable.lock().insert(pid, Proc::new(pid, "root"));
    }

    // ========================================================================
    // spawn
    // ========================================================================

    /// Load `name`, build its initial stack from `argv`, and hand the new
    /// process to the scheduler. The caller (if any) becomes the parent.
    pub fn spawn(&self, name: &str, argv: &[&str]) -> Result<Pid> {
        let parent_pid = self.current_pid();
        let mut proc = Proc::new(self.ptable.alloc_pid(), name);
        proc.parent = parent_pid;

        let entry = match self.spawn_image(&mut proc, name, argv) {
            Ok(v) => v,
            Err(e) => {
                // Unwind the partial address space before dropping the proc.
                self.smem.unmap_all(&mut proc.aspace, &self.pmem);
                proc.aspace.teardown(&self.pmem);
                return Err(e);
            }
        };

        let tid = self
            .sched
            .create_thread(name, Some(proc.pid), DEFAULT_PRIORITY);
        self.sched.with_thread_mut(tid, |t| {
            t.tf = TrapFrame::user(entry.0 as u64, entry.1 as u64);
        });
        proc.threads.push(tid);

        let pid = proc.pid;
        {
            let mut table = self.ptable.lock();
            if let Some(pp) = parent_pid {
                if let Some(parent) = table.get_mut(&pp) {
                    parent.children.push(pid);
                    proc.cwd = parent.cwd.clone();
                }
            }
            table.insert(pid, proc);
        }
        self.sched.ready(tid);
        log::info!("spawned '{}' as pid {}", name, pid);
        Ok(pid)
    }

    /// Image, heap, and stack setup. Returns (entry, initial stack ptr).
    fn spawn_image(&self, proc: &mut Proc, name: &str, argv: &[&str]) -> Result<(Vaddr, Vaddr)> {
        let image = self.loader.load(name, &mut proc.aspace, &self.pmem)?;

        // Heap starts empty and grows with sbrk.
        proc.aspace
            .map_region(None, 0, MemPerm::URW, RegionKind::Heap)?;

        // Top stack page is mapped eagerly and filled with the argument
        // layout; the rest of the reserve faults in on demand.
        let top_page = USTACK_UPPERBOUND - PAGE_SIZE;
        proc.aspace
            .map_region(Some(top_page), 1, MemPerm::URW, RegionKind::Stack)?;
        let pfn = self.pmem.alloc()?;
        // The frame belongs to the address space from here on; teardown
        // covers it if the layout build fails.
        proc.aspace.map_page(top_page, pfn, MemPerm::URW);
        let frame = self.pmem.frame(pfn).expect("just allocated");
        let sp = build_initial_stack(&frame, argv)?;
        proc.aspace
            .extend_region_down(top_page, USTACK_UPPERBOUND - USTACK_PAGES * PAGE_SIZE)?;

        Ok((image.entry, sp))
    }

    // ========================================================================
    // fork
    // ========================================================================

    /// Duplicate the calling process. The child's address space shares
    /// private pages copy-on-write and re-registers shared regions; the
    /// trap frames split on `rax`: 0 in the child, the child's pid in the
    /// parent.
    pub fn fork(&self) -> Result<Pid> {
        let cur_tid = cpu::current().ok_or(Error::Invalid)?;
        let parent_pid = self.sched.thread_pid(cur_tid).ok_or(Error::Invalid)?;
        let child_pid = self.ptable.alloc_pid();

        let mut table = self.ptable.lock();
        let parent = table.get_mut(&parent_pid).ok_or(Error::Invalid)?;

        let (child_as, shared) = parent.aspace.duplicate_cow(&self.pmem)?;

        let mut files: [Option<Arc<File>>; PROC_MAX_FILE] = Default::default();
        for (slot, f) in files.iter_mut().zip(parent.files.iter()) {
            if let Some(f) = f {
                f.on_dup();
                *slot = Some(f.clone());
            }
        }

        let name = parent.name.clone();
        let cwd = parent.cwd.clone();
        parent.children.push(child_pid);

        let mut child = Proc::new(child_pid, &name);
        child.aspace = child_as;
        child.files = files;
        child.parent = Some(parent_pid);
        child.cwd = cwd;

        for (region, start) in &shared {
            // The parent still maps the region; it cannot have vanished.
            self.smem
                .register_existing(region, child.aspace.id, *start)
                .expect("shared region gone while mapped");
        }

        let parent_tf = self
            .sched
            .with_thread_mut(cur_tid, |t| t.tf)
            .ok_or(Error::Invalid)?;
        let child_tid = self
            .sched
            .create_thread(&name, Some(child_pid), DEFAULT_PRIORITY);
        self.sched.with_thread_mut(child_tid, |t| {
            t.tf = parent_tf;
            t.tf.rax = 0;
        });
        self.sched
            .with_thread_mut(cur_tid, |t| t.tf.rax = child_pid as u64);
        child.threads.push(child_tid);

        table.insert(child_pid, child);
        drop(table);

        self.sched.ready(child_tid);
        log::debug!("fork: pid {} -> child {}", parent_pid, child_pid);
        Ok(child_pid)
    }

    // ========================================================================
    // wait
    // ========================================================================

    /// Block until a child exits and reap it. `target` of `None` means any
    /// child; when several have already exited the last-positioned one in
    /// the children list wins. Returns the child's pid and exit status.
    pub fn wait(&self, target: Option<Pid>) -> Result<(Pid, i32)> {
        let cur_pid = self.current_pid().ok_or(Error::Invalid)?;
        let mut table = self.ptable.lock();
        loop {
            let me = table.get(&cur_pid).ok_or(Error::Invalid)?;
            let matching: Vec<Pid> = match target {
                Some(p) => me.children.iter().copied().filter(|c| *c == p).collect(),
                None => me.children.clone(),
            };
            if matching.is_empty() {
                return Err(Error::NoChild);
            }
            let exited = matching
                .iter()
                .copied()
                .filter(|c| table.get(c).and_then(|p| p.exit_status).is_some())
                .last();
            match exited {
                Some(child_pid) => {
                    let child = table.remove(&child_pid).expect("checked above");
                    let status = child.exit_status.expect("checked above");
                    let me = table.get_mut(&cur_pid).expect("still present");
                    me.children.retain(|c| *c != child_pid);
                    return Ok((child_pid, status));
                }
                None => {
                    let cv = me.wait_cv.clone();
                    cv.wait_with(&mut table, &self.sched);
                }
            }
        }
    }

    // ========================================================================
    // exit
    // ========================================================================

    /// Terminate the calling process. Releases memory and files, hands
    /// live children to the root process, frees already-exited children,
    /// records the status for `wait`, and finally parks the thread as a
    /// zombie. On hosted builds this returns so the carrying OS thread can
    /// unwind; the process is dead either way.
    pub fn exit(&self, status: i32) {
        let cur_tid = cpu::current().expect("exit: no current thread");
        let cur_pid = self
            .sched
            .thread_pid(cur_tid)
            .expect("exit: thread has no process");

        // Memory and files are torn down outside the table lock; a pipe
        // close can wake peers that immediately need other locks.
        let (mut aspace, files, cwd) = {
            let mut table = self.ptable.lock();
            let p = table.get_mut(&cur_pid).expect("exit: process missing");
            (
                mem::take(&mut p.aspace),
                mem::take(&mut p.files),
                p.cwd.take(),
            )
        };
        self.smem.unmap_all(&mut aspace, &self.pmem);
        aspace.teardown(&self.pmem);
        for f in files.into_iter().flatten() {
            f.on_close(&self.sched);
        }
        drop(cwd);

        {
            let mut table = self.ptable.lock();

            let children = mem::take(&mut table.get_mut(&cur_pid).expect("present").children);
            for c in children {
                let already_dead = match table.get_mut(&c) {
                    Some(child) => {
                        child.parent = Some(ROOT_PID);
                        child.exit_status.is_some()
                    }
                    None => true,
                };
                if already_dead {
                    table.remove(&c);
                } else {
                    table
                        .get_mut(&ROOT_PID)
                        .expect("root process missing")
                        .children
                        .push(c);
                }
            }

            let p = table.get_mut(&cur_pid).expect("present");
            p.exit_status = Some(status);
            p.threads.retain(|t| *t != cur_tid);
            let parent = p.parent;

            if let Some(pp) = parent {
                if let Some(parent_proc) = table.get(&pp) {
                    // Signaled with the table lock held, matching wait().
                    let cv = parent_proc.wait_cv.clone();
                    cv.signal(&self.sched);
                }
            }
            log::debug!("pid {} exited with status {}", cur_pid, status);
        }

        self.sched.with_thread_mut(cur_tid, |t| t.pid = None);
        self.sched.exit_thread();
    }

    // ========================================================================
    // Heap
    // ========================================================================

    /// Move the heap break by `delta` bytes; returns the old break.
    pub fn sbrk(&self, delta: isize) -> Result<Vaddr> {
        let cur_pid = self.current_pid().ok_or(Error::Invalid)?;
        let mut table = self.ptable.lock();
        let p = table.get_mut(&cur_pid).ok_or(Error::Invalid)?;
        p.aspace.sbrk(delta, &self.pmem)
    }

    // ========================================================================
    // Descriptors
    // ========================================================================

    /// Put `file` in the lowest free descriptor slot.
    pub fn fd_install(&self, file: Arc<File>) -> Result<usize> {
        let cur_pid = self.current_pid().ok_or(Error::Invalid)?;
        let mut table = self.ptable.lock();
        let p = table.get_mut(&cur_pid).ok_or(Error::Invalid)?;
        let slot = p
            .files
            .iter()
            .position(|f| f.is_none())
            .ok_or(Error::OutOfMemory)?;
        p.files[slot] = Some(file);
        Ok(slot)
    }

    pub fn fd_get(&self, fd: usize) -> Result<Arc<File>> {
        let cur_pid = self.current_pid().ok_or(Error::Invalid)?;
        let table = self.ptable.lock();
        let p = table.get(&cur_pid).ok_or(Error::Invalid)?;
        p.files
            .get(fd)
            .and_then(|f| f.clone())
            .ok_or(Error::Invalid)
    }

    pub fn fd_close(&self, fd: usize) -> Result<()> {
        let cur_pid = self.current_pid().ok_or(Error::Invalid)?;
        let file = {
            let mut table = self.ptable.lock();
            let p = table.get_mut(&cur_pid).ok_or(Error::Invalid)?;
            p.files
                .get_mut(fd)
                .and_then(|f| f.take())
                .ok_or(Error::Invalid)?
        };
        file.on_close(&self.sched);
        Ok(())
    }

    pub fn fd_dup(&self, fd: usize) -> Result<usize> {
        let file = self.fd_get(fd)?;
        file.on_dup();
        self.fd_install(file)
    }

    /// Create a pipe; returns (read fd, write fd).
    pub fn make_pipe(&self) -> Result<(usize, usize)> {
        let (r, w) = crate::file::pipe_pair();
        let rfd = self.fd_install(r)?;
        let wfd = match self.fd_install(w) {
            Ok(fd) => fd,
            Err(e) => {
                self.fd_close(rfd).ok();
                return Err(e);
            }
        };
        Ok((rfd, wfd))
    }
}
