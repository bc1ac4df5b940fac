//! Cooperative scheduler.
//!
//! One FIFO ready queue, no preemption: a thread runs until it yields,
//! sleeps, or exits. Zombie reclamation is two-phase. A thread that exits
//! parks its id on the graveyard; the storage is freed only by a later pass
//! through [`Scheduler::reschedule`] on some other thread's stack, so no
//! thread ever frees the stack it is running on.
//!
//! On hosted builds each kernel thread is carried by an OS thread and a
//! "context switch" degenerates to parking the caller until it is made
//! ready again.

use alloc::collections::VecDeque;
use alloc::string::String;

use hashbrown::HashMap;

use crate::arch::{Context, TrapFrame};
use crate::cpu;
use crate::proc::Pid;
use crate::sync::{Mutex, SpinLock};

pub type Tid = usize;

pub const DEFAULT_PRIORITY: u8 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadState {
    Ready,
    Running,
    Sleeping,
    Zombie,
}

/// Kernel thread record. The trap frame holds the user-visible registers;
/// `fork` copies it into the child and patches `rax`.
pub struct Thread {
    pub tid: Tid,
    pub name: String,
    pub state: ThreadState,
    pub priority: u8,
    pub pid: Option<Pid>,
    pub ctx: Context,
    pub tf: TrapFrame,
}

struct SchedInner {
    threads: HashMap<Tid, Thread>,
    ready: VecDeque<Tid>,
    graveyard: VecDeque<Tid>,
    next_tid: Tid,
}

pub struct Scheduler {
    inner: Mutex<SchedInner>,
}

impl Scheduler {
    pub fn new() -> Self {
        Scheduler {
            inner: Mutex::new(SchedInner {
                threads: HashMap::new(),
                ready: VecDeque::new(),
                graveyard: VecDeque::new(),
                next_tid: 0,
            }),
        }
    }

    /// Register the calling context as this CPU's idle thread and make it
    /// current. Each CPU (each participating host thread, when hosted)
    /// calls this once before touching any blocking primitive.
    pub fn start_cpu(&self) -> Tid {
        let tid = {
            let mut guard = self.inner.lock();
            let inner = &mut *guard;
            let tid = inner.next_tid;
            inner.next_tid += 1;
            inner.threads.insert(
                tid,
                Thread {
                    tid,
                    name: String::from("idle"),
                    state: ThreadState::Running,
                    priority: 0,
                    pid: None,
                    ctx: Context::new(),
                    tf: TrapFrame::new(),
                },
            );
            tid
        };
        // cpu slots are written outside the table lock so the lock's
        // holder bookkeeping stays consistent.
        cpu::set_idle(Some(tid));
        cpu::set_current(Some(tid));
        log::debug!("cpu online, idle thread {}", tid);
        tid
    }

    /// Create a thread record. The thread does not run until someone calls
    /// [`Scheduler::ready`] on it.
    pub fn create_thread(&self, name: &str, pid: Option<Pid>, priority: u8) -> Tid {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let tid = inner.next_tid;
        inner.next_tid += 1;
        inner.threads.insert(
            tid,
            Thread {
                tid,
                name: String::from(name),
                state: ThreadState::Ready,
                priority,
                pid,
                ctx: Context::new(),
                tf: TrapFrame::new(),
            },
        );
        tid
    }

    /// Mark `tid` runnable and append it to the ready queue.
    pub fn ready(&self, tid: Tid) {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let t = inner.threads.get_mut(&tid).expect("ready: unknown thread");
        t.state = ThreadState::Ready;
        inner.ready.push_back(tid);
    }

    /// Give up the CPU but stay runnable. Returns immediately when nothing
    /// else is ready.
    pub fn yield_now(&self) {
        if let Some(dead) = self.reschedule(ThreadState::Ready, None) {
            self.dispose(dead);
        }
    }

    /// Park the current thread until [`Scheduler::ready`] wakes it.
    /// `held` is released inside the scheduler critical section, after the
    /// thread is already marked sleeping.
    pub(crate) fn sleep(&self, held: &SpinLock) {
        if let Some(dead) = self.reschedule(ThreadState::Sleeping, Some(held)) {
            self.dispose(dead);
        }
    }

    /// Terminate the current thread. On baremetal this never returns; on
    /// hosted builds it returns so the carrying OS thread can unwind.
    pub fn exit_thread(&self) {
        if let Some(dead) = self.reschedule(ThreadState::Zombie, None) {
            self.dispose(dead);
        }
    }

    /// Core state transition. Moves the current thread into `next_state`,
    /// releases `held` once the transition is visible, and hands back at
    /// most one previously-exited thread for the caller to dispose of
    /// outside the critical section.
    pub(crate) fn reschedule(
        &self,
        next_state: ThreadState,
        held: Option<&SpinLock>,
    ) -> Option<Tid> {
        let cur = cpu::current().expect("reschedule: no current thread");
        let mut guard = self.inner.lock();
        let inner = &mut *guard;

        // A voluntary yield with an empty queue skips the queue churn.
        if next_state == ThreadState::Ready && inner.ready.is_empty() {
            return None;
        }

        if next_state == ThreadState::Ready && cpu::idle() != Some(cur) {
            inner.ready.push_back(cur);
        }
        if let Some(t) = inner.threads.get_mut(&cur) {
            t.state = next_state;
        }
        if let Some(lock) = held {
            lock.release();
        }

        let reap = inner.graveyard.pop_front();
        if next_state == ThreadState::Zombie {
            inner.graveyard.push_back(cur);
        }

        #[cfg(not(feature = "hosted"))]
        {
            let next = inner
                .ready
                .pop_front()
                .or_else(cpu::idle)
                .expect("reschedule: no idle thread");
            let old_ctx: *mut Context = &mut inner.threads.get_mut(&cur).unwrap().ctx;
            let new_ctx: *const Context = &inner.threads.get(&next).unwrap().ctx;
            inner.threads.get_mut(&next).unwrap().state = ThreadState::Running;
            cpu::set_current(Some(next));
            // Uniprocessor port: interrupts are off here, so the table
            // cannot move under the raw context pointers.
            drop(guard);
            unsafe { crate::arch::context_switch(old_ctx, new_ctx) };
        }

        #[cfg(feature = "hosted")]
        {
            drop(guard);
            self.resume_hosted(cur, next_state);
        }

        reap
    }

    /// Hosted stand-in for the context switch: the carrying OS thread waits
    /// out its own Sleeping state, then takes itself back off the ready
    /// queue and resumes.
    #[cfg(feature = "hosted")]
    fn resume_hosted(&self, cur: Tid, parked_as: ThreadState) {
        match parked_as {
            ThreadState::Ready => {}
            ThreadState::Sleeping => {
                while self.state_of(cur) == Some(ThreadState::Sleeping) {
                    std::thread::yield_now();
                }
            }
            ThreadState::Zombie => {
                cpu::set_current(None);
                return;
            }
            ThreadState::Running => unreachable!("reschedule to Running"),
        }
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        inner.ready.retain(|t| *t != cur);
        if let Some(t) = inner.threads.get_mut(&cur) {
            t.state = ThreadState::Running;
        }
    }

    /// Free a reaped thread's record.
    pub(crate) fn dispose(&self, tid: Tid) {
        let removed = self.inner.lock().threads.remove(&tid);
        if let Some(t) = removed {
            log::trace!("reaped thread {} ({})", t.tid, t.name);
        }
    }

    /// Bind the calling host thread to an existing kernel thread. Test and
    /// simulation harnesses use this to "run" a thread they created.
    #[cfg(feature = "hosted")]
    pub fn adopt(&self, tid: Tid) {
        {
            let mut guard = self.inner.lock();
            let inner = &mut *guard;
            let t = inner.threads.get_mut(&tid).expect("adopt: unknown thread");
            t.state = ThreadState::Running;
            inner.ready.retain(|q| *q != tid);
        }
        cpu::set_current(Some(tid));
    }

    pub fn state_of(&self, tid: Tid) -> Option<ThreadState> {
        self.inner.lock().threads.get(&tid).map(|t| t.state)
    }

    pub fn thread_pid(&self, tid: Tid) -> Option<Pid> {
        self.inner.lock().threads.get(&tid).and_then(|t| t.pid)
    }

    /// Run `f` against the thread record, if it still exists.
    pub fn with_thread_mut<R>(&self, tid: Tid, f: impl FnOnce(&mut Thread) -> R) -> Option<R> {
        self.inner.lock().threads.get_mut(&tid).map(f)
    }

    pub fn ready_len(&self) -> usize {
        self.inner.lock().ready.len()
    }

    pub fn graveyard_len(&self) -> usize {
        self.inner.lock().graveyard.len()
    }

    pub fn thread_count(&self) -> usize {
        self.inner.lock().threads.len()
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Scheduler::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync;

    fn fresh() -> Scheduler {
        sync::init();
        let sched = Scheduler::new();
        sched.start_cpu();
        sched
    }

    #[test]
    fn yield_on_empty_queue_is_noop() {
        let sched = fresh();
        assert_eq!(sched.ready_len(), 0);
        sched.yield_now();
        let cur = cpu::current().unwrap();
        assert_eq!(sched.state_of(cur), Some(ThreadState::Running));
    }

    #[test]
    fn ready_queue_is_fifo() {
        let sched = fresh();
        let a = sched.create_thread("a", None, DEFAULT_PRIORITY);
        let b = sched.create_thread("b", None, DEFAULT_PRIORITY);
        sched.ready(a);
        sched.ready(b);
        let guard = sched.inner.lock();
        assert_eq!(guard.ready.front(), Some(&a));
        assert_eq!(guard.ready.back(), Some(&b));
    }

    #[test]
    fn zombie_reclamation_is_deferred() {
        let sched = fresh();
        let idle = cpu::current().unwrap();

        let t = sched.create_thread("worker", None, DEFAULT_PRIORITY);
        sched.adopt(t);
        let before = sched.thread_count();
        sched.exit_thread();
        // The exiting pass must not free its own record.
        assert_eq!(sched.thread_count(), before);
        assert_eq!(sched.state_of(t), Some(ThreadState::Zombie));
        assert_eq!(sched.graveyard_len(), 1);

        // A later pass through the scheduler reaps it.
        sched.adopt(idle);
        let peer = sched.create_thread("peer", None, DEFAULT_PRIORITY);
        sched.ready(peer);
        sched.yield_now();
        assert_eq!(sched.graveyard_len(), 0);
        assert_eq!(sched.state_of(t), None);
    }

    #[test]
    fn sleep_blocks_until_ready() {
        let sched = std::sync::Arc::new(fresh());
        let t = sched.create_thread("sleeper", None, DEFAULT_PRIORITY);
        let flag = std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false));

        let s2 = sched.clone();
        let f2 = flag.clone();
        let h = std::thread::spawn(move || {
            s2.adopt(t);
            let lock = SpinLock::new_no_irq();
            lock.acquire();
            s2.sleep(&lock);
            f2.store(true, std::sync::atomic::Ordering::SeqCst);
        });

        while sched.state_of(t) != Some(ThreadState::Sleeping) {
            std::thread::yield_now();
        }
        assert!(!flag.load(std::sync::atomic::Ordering::SeqCst));
        sched.ready(t);
        h.join().unwrap();
        assert!(flag.load(std::sync::atomic::Ordering::SeqCst));
        assert_eq!(sched.state_of(t), Some(ThreadState::Running));
    }
}
