//! Synchronization primitives.
//!
//! Three layers, each built on the one below:
//!
//! - [`SpinLock`]: busy-wait lock, optionally interrupt-safe. The only
//!   primitive that may be taken from interrupt context.
//! - [`Mutex`]: RAII guard over a `SpinLock` protecting a value.
//! - [`CondVar`] / [`SleepLock`]: blocking primitives that park the calling
//!   thread through the scheduler instead of spinning.
//!
//! All primitives are no-ops until [`init`] runs, so single-threaded boot
//! code can call through lock-taking paths before the scheduler exists.

use core::cell::UnsafeCell;
use core::fmt;
use core::hint::spin_loop;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use alloc::collections::VecDeque;

use crate::arch;
use crate::cpu;
use crate::error::Error;
use crate::sched::{Scheduler, Tid};

// ============================================================================
// Global enable latch
// ============================================================================

static SYNC_ENABLED: AtomicBool = AtomicBool::new(false);

/// Arms every primitive in this module. Called once the scheduler is able
/// to run more than one thread.
pub fn init() {
    SYNC_ENABLED.store(true, Ordering::Release);
}

#[inline]
pub fn enabled() -> bool {
    SYNC_ENABLED.load(Ordering::Acquire)
}

// Holder slots encode "no holder" as 0, a thread as tid + 1, and an
// anonymous context (no current thread yet) as usize::MAX.
const NO_HOLDER: usize = 0;
const ANON_HOLDER: usize = usize::MAX;

fn encode_holder(tid: Option<Tid>) -> usize {
    match tid {
        Some(t) => t + 1,
        None => ANON_HOLDER,
    }
}

// ============================================================================
// SpinLock
// ============================================================================

/// Busy-wait lock.
///
/// Interrupt-safe locks bracket the critical section with a push/pop of the
/// interrupt-off level, so they are safe to take from interrupt handlers.
/// Re-acquiring a lock already held by the current thread is a kernel bug
/// and panics rather than deadlocking silently.
pub struct SpinLock {
    locked: AtomicBool,
    holder: AtomicUsize,
    irq_safe: bool,
    saved_intr: AtomicBool,
}

impl SpinLock {
    pub const fn new() -> Self {
        SpinLock {
            locked: AtomicBool::new(false),
            holder: AtomicUsize::new(NO_HOLDER),
            irq_safe: true,
            saved_intr: AtomicBool::new(false),
        }
    }

    /// Lock that never runs in interrupt context; skips the interrupt
    /// push/pop on both sides.
    pub const fn new_no_irq() -> Self {
        SpinLock {
            locked: AtomicBool::new(false),
            holder: AtomicUsize::new(NO_HOLDER),
            irq_safe: false,
            saved_intr: AtomicBool::new(false),
        }
    }

    pub fn acquire(&self) {
        if !enabled() {
            return;
        }
        let was_on = if self.irq_safe {
            arch::push_off()
        } else {
            false
        };
        let me = encode_holder(cpu::current());
        if me != ANON_HOLDER && self.holder.load(Ordering::Relaxed) == me {
            panic!("spinlock: recursive acquire");
        }
        while self.locked.swap(true, Ordering::Acquire) {
            spin_loop();
        }
        self.holder.store(me, Ordering::Relaxed);
        if self.irq_safe {
            self.saved_intr.store(was_on, Ordering::Relaxed);
        }
    }

    /// Single attempt, never spins.
    pub fn try_acquire(&self) -> Result<(), Error> {
        if !enabled() {
            return Ok(());
        }
        let was_on = if self.irq_safe {
            arch::push_off()
        } else {
            false
        };
        if self
            .locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            self.holder
                .store(encode_holder(cpu::current()), Ordering::Relaxed);
            if self.irq_safe {
                self.saved_intr.store(was_on, Ordering::Relaxed);
            }
            Ok(())
        } else {
            if self.irq_safe {
                arch::pop_off(was_on);
            }
            Err(Error::LockBusy)
        }
    }

    pub fn release(&self) {
        if !enabled() {
            return;
        }
        let me = encode_holder(cpu::current());
        let holder = self.holder.swap(NO_HOLDER, Ordering::Relaxed);
        assert!(holder != NO_HOLDER, "spinlock: releasing an unheld lock");
        assert!(holder == me, "spinlock: released by a non-holder");
        let was_on = self.saved_intr.load(Ordering::Relaxed);
        self.locked.store(false, Ordering::Release);
        if self.irq_safe {
            arch::pop_off(was_on);
        }
    }

    pub fn held_by_current(&self) -> bool {
        let h = self.holder.load(Ordering::Relaxed);
        h != NO_HOLDER && h == encode_holder(cpu::current())
    }

    pub fn is_locked(&self) -> bool {
        self.locked.load(Ordering::Relaxed)
    }
}

impl Default for SpinLock {
    fn default() -> Self {
        SpinLock::new()
    }
}

impl fmt::Debug for SpinLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SpinLock")
            .field("locked", &self.is_locked())
            .finish()
    }
}

// ============================================================================
// Mutex
// ============================================================================

/// Spin-lock protected value with an RAII guard.
pub struct Mutex<T> {
    lock: SpinLock,
    data: UnsafeCell<T>,
}

unsafe impl<T: Send> Send for Mutex<T> {}
unsafe impl<T: Send> Sync for Mutex<T> {}

impl<T> Mutex<T> {
    pub const fn new(data: T) -> Self {
        Mutex {
            lock: SpinLock::new(),
            data: UnsafeCell::new(data),
        }
    }

    /// See [`SpinLock::new_no_irq`].
    pub const fn new_no_irq(data: T) -> Self {
        Mutex {
            lock: SpinLock::new_no_irq(),
            data: UnsafeCell::new(data),
        }
    }

    pub fn lock(&self) -> MutexGuard<'_, T> {
        self.lock.acquire();
        MutexGuard { mutex: self }
    }

    pub fn try_lock(&self) -> Result<MutexGuard<'_, T>, Error> {
        self.lock.try_acquire()?;
        Ok(MutexGuard { mutex: self })
    }

    pub(crate) fn raw(&self) -> &SpinLock {
        &self.lock
    }

    pub fn into_inner(self) -> T {
        self.data.into_inner()
    }
}

pub struct MutexGuard<'a, T> {
    mutex: &'a Mutex<T>,
}

impl<'a, T> MutexGuard<'a, T> {
    pub(crate) fn mutex(&self) -> &'a Mutex<T> {
        self.mutex
    }
}

impl<T> Deref for MutexGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        unsafe { &*self.mutex.data.get() }
    }
}

impl<T> DerefMut for MutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.mutex.data.get() }
    }
}

impl<T> Drop for MutexGuard<'_, T> {
    fn drop(&mut self) {
        self.mutex.lock.release();
    }
}

// ============================================================================
// CondVar
// ============================================================================

/// Condition variable with FIFO wakeup.
///
/// Waiters enqueue themselves and then sleep through the scheduler; the
/// associated lock is released only inside the scheduler's critical section,
/// after the thread is already marked sleeping. A signaler that holds the
/// associated lock therefore cannot observe the waiter on the queue before
/// the waiter is actually asleep, which closes the lost-wakeup window.
///
/// Both `signal` and `broadcast` require the caller to hold the lock the
/// waiters passed to `wait`.
pub struct CondVar {
    waiters: Mutex<VecDeque<Tid>>,
}

impl CondVar {
    pub fn new() -> Self {
        CondVar {
            waiters: Mutex::new_no_irq(VecDeque::new()),
        }
    }

    /// Atomically release `lock`, sleep until signaled, then re-acquire
    /// `lock` before returning. The caller must hold `lock`.
    pub fn wait(&self, lock: &SpinLock, sched: &Scheduler) {
        if !enabled() {
            return;
        }
        let tid = cpu::current().expect("condvar: wait outside a thread");
        debug_assert!(lock.held_by_current());
        self.waiters.lock().push_back(tid);
        sched.sleep(lock);
        lock.acquire();
    }

    /// `wait` for callers holding a [`MutexGuard`]. The guarded value may be
    /// mutated by other threads while this thread is asleep.
    pub fn wait_with<T>(&self, guard: &mut MutexGuard<'_, T>, sched: &Scheduler) {
        let raw = guard.mutex().raw();
        self.wait(raw, sched);
    }

    /// Wake the longest-waiting thread, if any.
    pub fn signal(&self, sched: &Scheduler) {
        if !enabled() {
            return;
        }
        let next = self.waiters.lock().pop_front();
        if let Some(tid) = next {
            sched.ready(tid);
        }
    }

    /// Wake every waiter, oldest first.
    pub fn broadcast(&self, sched: &Scheduler) {
        if !enabled() {
            return;
        }
        let drained: VecDeque<Tid> = core::mem::take(&mut *self.waiters.lock());
        for tid in drained {
            sched.ready(tid);
        }
    }

    pub fn has_waiters(&self) -> bool {
        !self.waiters.lock().is_empty()
    }
}

impl Default for CondVar {
    fn default() -> Self {
        CondVar::new()
    }
}

// ============================================================================
// SleepLock
// ============================================================================

/// Lock for long-held critical sections; contenders sleep rather than spin.
/// Used for per-page-frame locks where the hold spans a page copy.
pub struct SleepLock {
    lk: SpinLock,
    cv: CondVar,
    holder: AtomicUsize,
}

impl SleepLock {
    pub fn new() -> Self {
        SleepLock {
            lk: SpinLock::new_no_irq(),
            cv: CondVar::new(),
            holder: AtomicUsize::new(NO_HOLDER),
        }
    }

    pub fn acquire(&self, sched: &Scheduler) {
        if !enabled() {
            return;
        }
        self.lk.acquire();
        while self.holder.load(Ordering::Relaxed) != NO_HOLDER {
            self.cv.wait(&self.lk, sched);
        }
        self.holder
            .store(encode_holder(cpu::current()), Ordering::Relaxed);
        self.lk.release();
    }

    pub fn release(&self, sched: &Scheduler) {
        if !enabled() {
            return;
        }
        self.lk.acquire();
        let holder = self.holder.swap(NO_HOLDER, Ordering::Relaxed);
        assert!(holder != NO_HOLDER, "sleeplock: releasing an unheld lock");
        assert!(
            holder == encode_holder(cpu::current()),
            "sleeplock: released by a non-holder"
        );
        self.cv.signal(sched);
        self.lk.release();
    }

    pub fn held_by_current(&self) -> bool {
        let h = self.holder.load(Ordering::Relaxed);
        h != NO_HOLDER && h == encode_holder(cpu::current())
    }
}

impl Default for SleepLock {
    fn default() -> Self {
        SleepLock::new()
    }
}

impl fmt::Debug for SleepLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SleepLock")
            .field("held", &(self.holder.load(Ordering::Relaxed) != NO_HOLDER))
            .finish()
    }
}

#[cfg(test)]
mod tests;
