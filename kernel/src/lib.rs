//! A teaching kernel core: cooperative scheduling, sleeping locks,
//! copy-on-write fork with demand paging, named shared-memory regions, and
//! a small pipe-backed file layer, behind a stable syscall ABI.
//!
//! The `hosted` feature (default) carries kernel threads on OS threads so
//! everything is testable as an ordinary crate; without it the crate is
//! `no_std` and expects platform glue for context switching and console
//! output.

#![cfg_attr(not(feature = "hosted"), no_std)]
#![allow(clippy::new_without_default)]

extern crate alloc;

pub mod arch;
pub mod cpu;
pub mod error;
pub mod file;
pub mod klog;
pub mod loader;
pub mod pgfault;
pub mod pipe;
pub mod pmem;
pub mod proc;
pub mod sched;
pub mod smem;
pub mod stack;
pub mod sync;
pub mod syscall;
pub mod vm;

use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use alloc::boxed::Box;

use crate::loader::ImageLoader;
use crate::pmem::PhysMem;
use crate::proc::ProcTable;
use crate::sched::Scheduler;
use crate::smem::SmemTable;

/// The kernel's global state. One instance per machine (or per test).
pub struct Kernel {
    pub sched: Scheduler,
    pub pmem: PhysMem,
    pub ptable: ProcTable,
    pub smem: SmemTable,
    pub loader: Box<dyn ImageLoader>,
    user_faults: AtomicU64,
    halted: AtomicBool,
}

impl Kernel {
    pub fn new(loader: Box<dyn ImageLoader>) -> Self {
        Kernel::with_capacity(loader, PhysMem::DEFAULT_FRAMES)
    }

    /// Build a kernel with a bounded frame pool. Synchronization comes up
    /// first; the root process exists before the first spawn.
    pub fn with_capacity(loader: Box<dyn ImageLoader>, frames: usize) -> Self {
        sync::init();
        let kernel = Kernel {
            sched: Scheduler::new(),
            pmem: PhysMem::with_capacity(frames),
            ptable: ProcTable::new(),
            smem: SmemTable::new(),
            loader,
            user_faults: AtomicU64::new(0),
            halted: AtomicBool::new(false),
        };
        kernel.sched.start_cpu();
        kernel.install_root();
        kernel
    }

    /// Request shutdown. The platform main loop polls [`Kernel::halted`].
    pub fn halt(&self) {
        log::info!("halt requested");
        self.halted.store(true, Ordering::Release);
    }

    pub fn halted(&self) -> bool {
        self.halted.load(Ordering::Acquire)
    }
}

// Kernel is shared across the OS threads that carry its kernel threads.
static_assertions::assert_impl_all!(Kernel: Send, Sync);

#[cfg(test)]
pub(crate) mod test_util {
    use alloc::boxed::Box;

    use crate::loader::FixtureLoader;
    use crate::Kernel;

    /// A kernel with a small frame pool and one registered image. The
    /// image body is arbitrary bytes; nothing executes it.
    pub fn test_kernel() -> Kernel {
        crate::klog::init(log::LevelFilter::Warn);
        let loader = FixtureLoader::new();
        loader.register("init", &[0x90u8; 64]);
        Kernel::with_capacity(Box::new(loader), 512)
    }
}
