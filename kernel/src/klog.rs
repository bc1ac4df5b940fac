//! Kernel logging through the `log` facade.
//!
//! Hosted builds print to stderr. Bare-metal builds format into a stack
//! buffer and hand the line to a registered console sink; until a sink is
//! registered records are dropped. The level filter is runtime-adjustable.

use core::sync::atomic::{AtomicUsize, Ordering};

use log::{LevelFilter, Log, Metadata, Record};
use spin::Once;

static LOGGER: KernelLogger = KernelLogger;
static INIT: Once<()> = Once::new();
static MAX_LEVEL: AtomicUsize = AtomicUsize::new(LevelFilter::Info as usize);

#[cfg(not(feature = "hosted"))]
static SINK: Once<fn(&str)> = Once::new();

/// Install the logger. Safe to call more than once; later calls only
/// adjust the level.
pub fn init(level: LevelFilter) {
    INIT.call_once(|| {
        let _ = log::set_logger(&LOGGER);
    });
    set_level(level);
}

pub fn set_level(level: LevelFilter) {
    MAX_LEVEL.store(level as usize, Ordering::Relaxed);
    log::set_max_level(level);
}

/// Route bare-metal log lines to the platform console.
#[cfg(not(feature = "hosted"))]
pub fn set_sink(sink: fn(&str)) {
    SINK.call_once(|| sink);
}

struct KernelLogger;

impl Log for KernelLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() as usize <= MAX_LEVEL.load(Ordering::Relaxed)
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        #[cfg(feature = "hosted")]
        {
            std::eprintln!(
                "[{:5}] {}: {}",
                record.level(),
                record.target(),
                record.args()
            );
        }
        #[cfg(not(feature = "hosted"))]
        {
            if let Some(sink) = SINK.get() {
                let mut buf = LineBuffer::new();
                let _ = core::fmt::Write::write_fmt(
                    &mut buf,
                    format_args!(
                        "[{:5}] {}: {}",
                        record.level(),
                        record.target(),
                        record.args()
                    ),
                );
                sink(buf.as_str());
            }
        }
    }

    fn flush(&self) {}
}

/// Fixed-size formatting buffer; overlong lines are truncated.
#[cfg(not(feature = "hosted"))]
struct LineBuffer {
    data: [u8; 256],
    len: usize,
}

#[cfg(not(feature = "hosted"))]
impl LineBuffer {
    const fn new() -> Self {
        LineBuffer {
            data: [0; 256],
            len: 0,
        }
    }

    fn as_str(&self) -> &str {
        core::str::from_utf8(&self.data[..self.len]).unwrap_or("<invalid utf8>")
    }
}

#[cfg(not(feature = "hosted"))]
impl core::fmt::Write for LineBuffer {
    fn write_str(&mut self, s: &str) -> core::fmt::Result {
        let bytes = s.as_bytes();
        let room = self.data.len() - self.len;
        let n = bytes.len().min(room);
        self.data[self.len..self.len + n].copy_from_slice(&bytes[..n]);
        self.len += n;
        Ok(())
    }
}
