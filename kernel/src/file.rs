//! Open file objects.
//!
//! A descriptor slot holds an `Arc<File>`; `dup` and `fork` clone the Arc
//! and bump the underlying endpoint counts, so pipe end-of-stream tracking
//! follows descriptor lifetime exactly.

use alloc::string::String;
use alloc::sync::Arc;

use crate::error::Result;
use crate::pipe::{Pipe, PipeEnd};
use crate::sched::Scheduler;

/// Working-directory handle. The filesystem itself is external; the
/// handle pins the directory open for as long as a process refers to it.
#[derive(Debug)]
pub struct Dir {
    pub path: String,
}

impl Dir {
    pub fn root() -> Arc<Dir> {
        Arc::new(Dir {
            path: String::from("/"),
        })
    }
}

/// What a descriptor points at.
pub enum File {
    /// Console input (reads return 0 here; the UART route is a platform
    /// concern).
    Stdin,
    /// Console output.
    Stdout,
    /// One end of a pipe.
    Pipe { pipe: Arc<Pipe>, end: PipeEnd },
}

impl File {
    pub fn read(&self, buf: &mut [u8], sched: &Scheduler) -> Result<usize> {
        match self {
            File::Stdin => Ok(0),
            File::Stdout => Ok(0),
            File::Pipe { pipe, end } => match end {
                PipeEnd::Read => pipe.read(buf, sched),
                PipeEnd::Write => Err(crate::error::Error::Invalid),
            },
        }
    }

    pub fn write(&self, buf: &[u8], sched: &Scheduler) -> Result<usize> {
        match self {
            File::Stdin => Ok(0),
            File::Stdout => {
                #[cfg(feature = "hosted")]
                if let Ok(text) = core::str::from_utf8(buf) {
                    log::info!(target: "console", "{}", text);
                }
                Ok(buf.len())
            }
            File::Pipe { pipe, end } => match end {
                PipeEnd::Write => pipe.write(buf, sched),
                PipeEnd::Read => Err(crate::error::Error::Invalid),
            },
        }
    }

    /// Bookkeeping for a new descriptor reference (`dup`, `fork`).
    pub fn on_dup(&self) {
        if let File::Pipe { pipe, end } = self {
            match end {
                PipeEnd::Read => pipe.add_reader(),
                PipeEnd::Write => pipe.add_writer(),
            }
        }
    }

    /// Bookkeeping for a dropped descriptor reference (`close`, exit).
    pub fn on_close(&self, sched: &Scheduler) {
        if let File::Pipe { pipe, end } = self {
            match end {
                PipeEnd::Read => pipe.drop_reader(sched),
                PipeEnd::Write => pipe.drop_writer(sched),
            }
        }
    }
}

/// Build a connected pipe and return its (read, write) files.
pub fn pipe_pair() -> (Arc<File>, Arc<File>) {
    let pipe = Arc::new(Pipe::new());
    let read = Arc::new(File::Pipe {
        pipe: pipe.clone(),
        end: PipeEnd::Read,
    });
    let write = Arc::new(File::Pipe {
        pipe,
        end: PipeEnd::Write,
    });
    (read, write)
}
