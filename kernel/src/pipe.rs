//! In-kernel pipe: a fixed 512-byte ring with blocking reads and writes.
//!
//! Offsets count bytes ever read/written and are reduced modulo the ring
//! size only on access, so `write_ofs - read_ofs` is always the number of
//! buffered bytes. End-of-stream rules: a read on an empty pipe returns 0
//! once no writers remain; a write fails with `BrokenPipe` once no readers
//! remain.

use crate::error::{Error, Result};
use crate::sched::Scheduler;
use crate::sync::{CondVar, Mutex};

use static_assertions::const_assert;

pub const PIPE_SIZE: usize = 512;

// The un-wrapped offset arithmetic relies on this.
const_assert!(PIPE_SIZE.is_power_of_two());

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipeEnd {
    Read,
    Write,
}

struct PipeState {
    buf: [u8; PIPE_SIZE],
    /// Total bytes ever read.
    read_ofs: usize,
    /// Total bytes ever written.
    write_ofs: usize,
    readers: usize,
    writers: usize,
}

impl PipeState {
    fn buffered(&self) -> usize {
        self.write_ofs - self.read_ofs
    }
}

pub struct Pipe {
    state: Mutex<PipeState>,
    not_empty: CondVar,
    not_full: CondVar,
}

impl Pipe {
    /// Fresh pipe with one reader and one writer reference.
    pub fn new() -> Self {
        Pipe {
            state: Mutex::new(PipeState {
                buf: [0u8; PIPE_SIZE],
                read_ofs: 0,
                write_ofs: 0,
                readers: 1,
                writers: 1,
            }),
            not_empty: CondVar::new(),
            not_full: CondVar::new(),
        }
    }

    /// Read up to `buf.len()` bytes. Blocks while the pipe is empty and
    /// writers remain; returns 0 at end of stream.
    pub fn read(&self, buf: &mut [u8], sched: &Scheduler) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let mut state = self.state.lock();
        while state.buffered() == 0 {
            if state.writers == 0 {
                return Ok(0);
            }
            self.not_empty.wait_with(&mut state, sched);
        }
        let n = state.buffered().min(buf.len());
        for slot in buf[..n].iter_mut() {
            *slot = state.buf[state.read_ofs % PIPE_SIZE];
            state.read_ofs += 1;
        }
        self.not_full.signal(sched);
        Ok(n)
    }

    /// Write up to `buf.len()` bytes, as much as fits. Blocks while the
    /// pipe is full and readers remain. A short count means the ring
    /// filled; callers loop if they need the rest delivered.
    pub fn write(&self, buf: &[u8], sched: &Scheduler) -> Result<usize> {
        let mut state = self.state.lock();
        loop {
            if state.readers == 0 {
                return Err(Error::BrokenPipe);
            }
            if state.buffered() < PIPE_SIZE {
                break;
            }
            self.not_full.wait_with(&mut state, sched);
        }
        let n = (PIPE_SIZE - state.buffered()).min(buf.len());
        for &byte in &buf[..n] {
            let at = state.write_ofs % PIPE_SIZE;
            state.buf[at] = byte;
            state.write_ofs += 1;
        }
        if n > 0 {
            self.not_empty.signal(sched);
        }
        Ok(n)
    }

    pub fn add_reader(&self) {
        self.state.lock().readers += 1;
    }

    pub fn add_writer(&self) {
        self.state.lock().writers += 1;
    }

    /// Drop a reader reference. The last reader wakes blocked writers so
    /// they can observe the broken pipe.
    pub fn drop_reader(&self, sched: &Scheduler) {
        let mut state = self.state.lock();
        assert!(state.readers > 0, "pipe: reader count underflow");
        state.readers -= 1;
        if state.readers == 0 {
            self.not_full.broadcast(sched);
        }
    }

    /// Drop a writer reference. The last writer wakes blocked readers so
    /// they can observe end of stream.
    pub fn drop_writer(&self, sched: &Scheduler) {
        let mut state = self.state.lock();
        assert!(state.writers > 0, "pipe: writer count underflow");
        state.writers -= 1;
        if state.writers == 0 {
            self.not_empty.broadcast(sched);
        }
    }

    pub fn buffered(&self) -> usize {
        self.state.lock().buffered()
    }
}

impl Default for Pipe {
    fn default() -> Self {
        Pipe::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sched::{ThreadState, DEFAULT_PRIORITY};
    use crate::sync;
    use std::sync::Arc;

    fn harness() -> Arc<Scheduler> {
        sync::init();
        let sched = Arc::new(Scheduler::new());
        sched.start_cpu();
        sched
    }

    #[test]
    fn bytes_come_out_in_order() {
        let sched = harness();
        let pipe = Pipe::new();
        assert_eq!(pipe.write(b"abcde", &sched).unwrap(), 5);
        let mut buf = [0u8; 3];
        assert_eq!(pipe.read(&mut buf, &sched).unwrap(), 3);
        assert_eq!(&buf, b"abc");
        let mut rest = [0u8; 8];
        assert_eq!(pipe.read(&mut rest, &sched).unwrap(), 2);
        assert_eq!(&rest[..2], b"de");
    }

    #[test]
    fn write_is_short_when_the_ring_fills() {
        let sched = harness();
        let pipe = Pipe::new();
        let big = [7u8; PIPE_SIZE + 100];
        assert_eq!(pipe.write(&big, &sched).unwrap(), PIPE_SIZE);
        assert_eq!(pipe.buffered(), PIPE_SIZE);
    }

    #[test]
    fn read_after_last_writer_drains_then_eofs() {
        let sched = harness();
        let pipe = Pipe::new();
        pipe.write(b"tail", &sched).unwrap();
        pipe.drop_writer(&sched);
        let mut buf = [0u8; 16];
        assert_eq!(pipe.read(&mut buf, &sched).unwrap(), 4);
        assert_eq!(pipe.read(&mut buf, &sched).unwrap(), 0);
    }

    #[test]
    fn write_without_readers_breaks() {
        let sched = harness();
        let pipe = Pipe::new();
        pipe.drop_reader(&sched);
        assert_eq!(pipe.write(b"x", &sched), Err(Error::BrokenPipe));
    }

    #[test]
    fn empty_read_blocks_until_data_arrives() {
        let sched = harness();
        let pipe = Arc::new(Pipe::new());
        let tid = sched.create_thread("reader", None, DEFAULT_PRIORITY);
        let got = Arc::new(std::sync::Mutex::new(None));

        let s2 = sched.clone();
        let p2 = pipe.clone();
        let g2 = got.clone();
        let h = std::thread::spawn(move || {
            s2.adopt(tid);
            let mut buf = [0u8; 4];
            let n = p2.read(&mut buf, &s2).unwrap();
            *g2.lock().unwrap() = Some((n, buf));
        });
        while sched.state_of(tid) != Some(ThreadState::Sleeping) {
            std::thread::yield_now();
        }
        assert!(got.lock().unwrap().is_none());

        pipe.write(b"ping", &sched).unwrap();
        h.join().unwrap();
        assert_eq!(*got.lock().unwrap(), Some((4, *b"ping")));
    }

    #[test]
    fn blocked_writer_resumes_after_drain() {
        let sched = harness();
        let pipe = Arc::new(Pipe::new());
        let filler = [1u8; PIPE_SIZE];
        assert_eq!(pipe.write(&filler, &sched).unwrap(), PIPE_SIZE);

        let tid = sched.create_thread("writer", None, DEFAULT_PRIORITY);
        let s2 = sched.clone();
        let p2 = pipe.clone();
        let h = std::thread::spawn(move || {
            s2.adopt(tid);
            p2.write(b"xx", &s2).unwrap()
        });
        while sched.state_of(tid) != Some(ThreadState::Sleeping) {
            std::thread::yield_now();
        }

        let mut buf = [0u8; PIPE_SIZE];
        assert_eq!(pipe.read(&mut buf, &sched).unwrap(), PIPE_SIZE);
        assert_eq!(h.join().unwrap(), 2);
        assert_eq!(pipe.buffered(), 2);
    }

    #[test]
    fn blocked_writer_sees_readers_vanish() {
        let sched = harness();
        let pipe = Arc::new(Pipe::new());
        let filler = [1u8; PIPE_SIZE];
        pipe.write(&filler, &sched).unwrap();

        let tid = sched.create_thread("writer", None, DEFAULT_PRIORITY);
        let s2 = sched.clone();
        let p2 = pipe.clone();
        let h = std::thread::spawn(move || {
            s2.adopt(tid);
            p2.write(b"xx", &s2)
        });
        while sched.state_of(tid) != Some(ThreadState::Sleeping) {
            std::thread::yield_now();
        }

        pipe.drop_reader(&sched);
        assert_eq!(h.join().unwrap(), Err(Error::BrokenPipe));
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            // Any interleaving of writes and partial drains preserves order.
            #[test]
            fn ring_preserves_fifo(chunks in proptest::collection::vec(
                proptest::collection::vec(any::<u8>(), 1..200), 1..20
            )) {
                let sched = harness();
                let pipe = Pipe::new();
                let mut sent = std::vec::Vec::new();
                let mut received = std::vec::Vec::new();
                for chunk in &chunks {
                    let mut offset = 0;
                    while offset < chunk.len() {
                        let n = pipe.write(&chunk[offset..], &sched).unwrap();
                        sent.extend_from_slice(&chunk[offset..offset + n]);
                        offset += n;
                        if pipe.buffered() == PIPE_SIZE {
                            // Drain a little so the next write makes progress.
                            let mut buf = [0u8; 64];
                            let got = pipe.read(&mut buf, &sched).unwrap();
                            received.extend_from_slice(&buf[..got]);
                        }
                    }
                }
                let mut buf = [0u8; PIPE_SIZE];
                while pipe.buffered() > 0 {
                    let got = pipe.read(&mut buf, &sched).unwrap();
                    received.extend_from_slice(&buf[..got]);
                }
                prop_assert_eq!(received, sent);
            }
        }
    }
}
