//! Physical page frames.
//!
//! Frames are handed out by number ([`Pfn`]) and shared by reference count:
//! copy-on-write aliases and shared-memory mappings each hold one reference,
//! and the frame's storage is reclaimed when the count drops to zero. Every
//! frame carries a [`SleepLock`] so long operations (page copies, fills)
//! block contenders instead of spinning.

use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicUsize, Ordering};

use alloc::sync::Arc;

use hashbrown::HashMap;

use crate::error::{Error, Result};
use crate::sync::{Mutex, SleepLock};

pub type Pfn = usize;

pub const PAGE_SIZE: usize = 4096;

static_assertions::const_assert!(PAGE_SIZE.is_power_of_two());

/// Round `addr` down to its page base.
#[inline]
pub const fn pg_round_down(addr: usize) -> usize {
    addr & !(PAGE_SIZE - 1)
}

/// Round `addr` up to the next page boundary.
#[inline]
pub const fn pg_round_up(addr: usize) -> usize {
    (addr + PAGE_SIZE - 1) & !(PAGE_SIZE - 1)
}

#[inline]
pub const fn pg_offset(addr: usize) -> usize {
    addr & (PAGE_SIZE - 1)
}

/// One physical page.
pub struct PageFrame {
    refcnt: AtomicUsize,
    pub lock: SleepLock,
    data: UnsafeCell<[u8; PAGE_SIZE]>,
}

// The byte array is only touched through the accessors below, under the
// frame lock when the frame is shared.
unsafe impl Sync for PageFrame {}
unsafe impl Send for PageFrame {}

impl PageFrame {
    fn new_zeroed() -> Self {
        PageFrame {
            refcnt: AtomicUsize::new(1),
            lock: SleepLock::new(),
            data: UnsafeCell::new([0u8; PAGE_SIZE]),
        }
    }

    pub fn refcnt(&self) -> usize {
        self.refcnt.load(Ordering::Acquire)
    }

    /// Copy out of the frame starting at `offset`.
    pub fn read(&self, offset: usize, buf: &mut [u8]) {
        assert!(offset + buf.len() <= PAGE_SIZE);
        let data = unsafe { &*self.data.get() };
        buf.copy_from_slice(&data[offset..offset + buf.len()]);
    }

    /// Copy into the frame starting at `offset`.
    pub fn write(&self, offset: usize, buf: &[u8]) {
        assert!(offset + buf.len() <= PAGE_SIZE);
        let data = unsafe { &mut *self.data.get() };
        data[offset..offset + buf.len()].copy_from_slice(buf);
    }

    pub fn zero(&self) {
        let data = unsafe { &mut *self.data.get() };
        data.fill(0);
    }

    /// Byte-for-byte copy from `src`. Callers hold `src.lock` when the
    /// source frame is shared.
    pub fn copy_from(&self, src: &PageFrame) {
        let from = unsafe { &*src.data.get() };
        let to = unsafe { &mut *self.data.get() };
        to.copy_from_slice(from);
    }
}

struct PmemInner {
    frames: HashMap<Pfn, Arc<PageFrame>>,
    next_pfn: Pfn,
}

/// Frame allocator and refcount authority.
pub struct PhysMem {
    inner: Mutex<PmemInner>,
    capacity: usize,
}

impl PhysMem {
    pub const DEFAULT_FRAMES: usize = 4096;

    pub fn new() -> Self {
        Self::with_capacity(Self::DEFAULT_FRAMES)
    }

    /// Allocator that refuses allocations past `capacity` live frames.
    /// Small capacities let tests drive the out-of-memory paths.
    pub fn with_capacity(capacity: usize) -> Self {
        PhysMem {
            inner: Mutex::new(PmemInner {
                frames: HashMap::new(),
                next_pfn: 1,
            }),
            capacity,
        }
    }

    /// Allocate a zeroed frame with reference count 1.
    pub fn alloc(&self) -> Result<Pfn> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        if inner.frames.len() >= self.capacity {
            log::warn!("pmem: out of frames ({} allocated)", inner.frames.len());
            return Err(Error::OutOfMemory);
        }
        let pfn = inner.next_pfn;
        inner.next_pfn += 1;
        inner.frames.insert(pfn, Arc::new(PageFrame::new_zeroed()));
        Ok(pfn)
    }

    pub fn frame(&self, pfn: Pfn) -> Option<Arc<PageFrame>> {
        self.inner.lock().frames.get(&pfn).cloned()
    }

    /// Add a reference for a new mapping of `pfn`.
    pub fn inc_ref(&self, pfn: Pfn) {
        let guard = self.inner.lock();
        let frame = guard.frames.get(&pfn).expect("inc_ref: unknown frame");
        frame.refcnt.fetch_add(1, Ordering::AcqRel);
    }

    /// Drop a reference; the frame is freed when the last one goes.
    pub fn dec_ref(&self, pfn: Pfn) {
        let mut guard = self.inner.lock();
        let frame = guard.frames.get(&pfn).expect("dec_ref: unknown frame");
        let prev = frame.refcnt.fetch_sub(1, Ordering::AcqRel);
        assert!(prev > 0, "dec_ref: refcount underflow");
        if prev == 1 {
            guard.frames.remove(&pfn);
        }
    }

    pub fn refcnt(&self, pfn: Pfn) -> Option<usize> {
        self.inner.lock().frames.get(&pfn).map(|f| f.refcnt())
    }

    /// Number of live frames.
    pub fn allocated(&self) -> usize {
        self.inner.lock().frames.len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Default for PhysMem {
    fn default() -> Self {
        PhysMem::new()
    }
}
