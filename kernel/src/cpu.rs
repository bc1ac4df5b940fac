//! Per-CPU bookkeeping: which kernel thread is running here, and which
//! thread serves as this CPU's idle fallback.
//!
//! Hosted builds map "CPU" onto the calling OS thread, so every test thread
//! gets its own current/idle slot for free.

use crate::sched::Tid;

pub const MAX_CPUS: usize = 8;

#[cfg(feature = "hosted")]
mod slots {
    use super::Tid;
    use std::cell::Cell;

    std::thread_local! {
        static CURRENT: Cell<Option<Tid>> = const { Cell::new(None) };
        static IDLE: Cell<Option<Tid>> = const { Cell::new(None) };
    }

    pub fn current() -> Option<Tid> {
        CURRENT.with(|c| c.get())
    }

    pub fn set_current(tid: Option<Tid>) {
        CURRENT.with(|c| c.set(tid));
    }

    pub fn idle() -> Option<Tid> {
        IDLE.with(|c| c.get())
    }

    pub fn set_idle(tid: Option<Tid>) {
        IDLE.with(|c| c.set(tid));
    }
}

#[cfg(not(feature = "hosted"))]
mod slots {
    use super::{Tid, MAX_CPUS};
    use core::sync::atomic::{AtomicUsize, Ordering};

    // Slot encoding: 0 = none, tid + 1 otherwise. Each CPU only writes its
    // own slot with interrupts off, so relaxed ordering suffices.
    const EMPTY: AtomicUsize = AtomicUsize::new(0);
    static CURRENT: [AtomicUsize; MAX_CPUS] = [EMPTY; MAX_CPUS];
    static IDLE: [AtomicUsize; MAX_CPUS] = [EMPTY; MAX_CPUS];

    // Boot CPU until the platform layer wires this to the local APIC id.
    fn cpu_id() -> usize {
        0
    }

    fn get(slot: &AtomicUsize) -> Option<Tid> {
        match slot.load(Ordering::Relaxed) {
            0 => None,
            n => Some(n - 1),
        }
    }

    fn set(slot: &AtomicUsize, tid: Option<Tid>) {
        slot.store(tid.map_or(0, |t| t + 1), Ordering::Relaxed);
    }

    pub fn current() -> Option<Tid> {
        get(&CURRENT[cpu_id()])
    }

    pub fn set_current(tid: Option<Tid>) {
        set(&CURRENT[cpu_id()], tid);
    }

    pub fn idle() -> Option<Tid> {
        get(&IDLE[cpu_id()])
    }

    pub fn set_idle(tid: Option<Tid>) {
        set(&IDLE[cpu_id()], tid);
    }
}

pub use slots::{current, idle, set_current, set_idle};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slots_start_empty_and_round_trip() {
        assert_eq!(current(), None);
        set_current(Some(7));
        assert_eq!(current(), Some(7));
        set_idle(Some(1));
        assert_eq!(idle(), Some(1));
        set_current(None);
        assert_eq!(current(), None);
        set_idle(None);
    }

    #[cfg(feature = "hosted")]
    #[test]
    fn slots_are_per_thread() {
        set_current(Some(3));
        let other = std::thread::spawn(|| current());
        assert_eq!(other.join().unwrap(), None);
        assert_eq!(current(), Some(3));
        set_current(None);
    }
}
