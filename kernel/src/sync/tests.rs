//! Synchronization primitive tests.
//!
//! These run hosted: kernel threads are carried by std threads, so real
//! contention exercises the lock paths.

use super::*;
use crate::sched::{Scheduler, ThreadState, DEFAULT_PRIORITY};
use crate::sync;

use std::sync::Arc;
use std::vec::Vec;

fn harness() -> Arc<Scheduler> {
    sync::init();
    let sched = Arc::new(Scheduler::new());
    sched.start_cpu();
    sched
}

fn spawn_adopted(
    sched: &Arc<Scheduler>,
    name: &str,
    body: impl FnOnce(Arc<Scheduler>) + Send + 'static,
) -> (Tid, std::thread::JoinHandle<()>) {
    let tid = sched.create_thread(name, None, DEFAULT_PRIORITY);
    let s = sched.clone();
    let handle = std::thread::spawn(move || {
        s.adopt(tid);
        body(s);
    });
    (tid, handle)
}

#[test]
fn mutex_mutual_exclusion() {
    sync::init();
    let counter = Arc::new(Mutex::new(0u64));
    let mut handles = Vec::new();
    for _ in 0..4 {
        let c = counter.clone();
        handles.push(std::thread::spawn(move || {
            for _ in 0..10_000 {
                *c.lock() += 1;
            }
        }));
    }
    for h in handles {
        h.join().unwrap();
    }
    assert_eq!(*counter.lock(), 40_000);
}

#[test]
fn try_lock_reports_busy_while_held() {
    sync::init();
    let m = Mutex::new(());
    let g = m.lock();
    assert!(matches!(m.try_lock(), Err(Error::LockBusy)));
    drop(g);
    assert!(m.try_lock().is_ok());
}

#[test]
fn signal_at_enqueue_time_is_not_lost() {
    let sched = harness();
    let flag = Arc::new(Mutex::new(false));
    let cv = Arc::new(CondVar::new());

    let (f2, c2) = (flag.clone(), cv.clone());
    let (_tid, h) = spawn_adopted(&sched, "waiter", move |s| {
        let mut g = f2.lock();
        while !*g {
            c2.wait_with(&mut g, &s);
        }
    });

    // Fire the moment the waiter is enqueued, without giving it time to
    // be descheduled first.
    while !cv.has_waiters() {
        std::hint::spin_loop();
    }
    let mut g = flag.lock();
    *g = true;
    cv.signal(&sched);
    drop(g);

    h.join().unwrap();
}

#[test]
#[should_panic(expected = "recursive")]
fn recursive_acquire_is_fatal() {
    let sched = harness();
    let tid = sched.create_thread("offender", None, DEFAULT_PRIORITY);
    sched.adopt(tid);
    let lock = SpinLock::new_no_irq();
    lock.acquire();
    lock.acquire();
}

#[test]
fn condvar_wakes_in_fifo_order() {
    let sched = harness();
    let slot: Arc<Mutex<Option<u32>>> = Arc::new(Mutex::new(None));
    let cv = Arc::new(CondVar::new());
    let order = Arc::new(std::sync::Mutex::new(Vec::new()));

    let mut handles = Vec::new();
    for i in 0..3u32 {
        let slot2 = slot.clone();
        let cv2 = cv.clone();
        let order2 = order.clone();
        let (tid, h) = spawn_adopted(&sched, "waiter", move |s| {
            let mut guard = slot2.lock();
            while guard.is_none() {
                cv2.wait_with(&mut guard, &s);
            }
            order2.lock().unwrap().push(i);
        });
        handles.push(h);
        // Serialize enqueue order so FIFO wakeup is observable.
        while sched.state_of(tid) != Some(ThreadState::Sleeping) {
            std::thread::yield_now();
        }
    }

    for _ in 0..3 {
        let before = order.lock().unwrap().len();
        {
            let mut guard = slot.lock();
            *guard = Some(1);
            cv.signal(&sched);
        }
        while order.lock().unwrap().len() == before {
            std::thread::yield_now();
        }
    }
    for h in handles {
        h.join().unwrap();
    }
    assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);
}

#[test]
fn broadcast_wakes_everyone() {
    let sched = harness();
    let gate = Arc::new(Mutex::new(false));
    let cv = Arc::new(CondVar::new());
    let woke = Arc::new(AtomicUsize::new(0));

    let mut handles = Vec::new();
    for _ in 0..4 {
        let gate2 = gate.clone();
        let cv2 = cv.clone();
        let woke2 = woke.clone();
        let (tid, h) = spawn_adopted(&sched, "waiter", move |s| {
            let mut guard = gate2.lock();
            while !*guard {
                cv2.wait_with(&mut guard, &s);
            }
            drop(guard);
            woke2.fetch_add(1, Ordering::SeqCst);
        });
        handles.push(h);
        while sched.state_of(tid) != Some(ThreadState::Sleeping) {
            std::thread::yield_now();
        }
    }

    {
        let mut guard = gate.lock();
        *guard = true;
        cv.broadcast(&sched);
    }
    for h in handles {
        h.join().unwrap();
    }
    assert_eq!(woke.load(Ordering::SeqCst), 4);
}

#[test]
fn sleeplock_contender_sleeps_instead_of_spinning() {
    let sched = harness();
    let lock = Arc::new(SleepLock::new());
    let holder_tid = sched.create_thread("holder", None, DEFAULT_PRIORITY);
    sched.adopt(holder_tid);
    lock.acquire(&sched);
    assert!(lock.held_by_current());

    let lock2 = lock.clone();
    let (tid, h) = spawn_adopted(&sched, "contender", move |s| {
        lock2.acquire(&s);
        lock2.release(&s);
    });
    while sched.state_of(tid) != Some(ThreadState::Sleeping) {
        std::thread::yield_now();
    }

    lock.release(&sched);
    h.join().unwrap();
    assert!(!lock.held_by_current());
}
