// Global logging sink for the host disk layer
//
// The crate itself only talks to the `log` facade. Installers that have no
// logger of their own (and the test-suite) can install `RingLogger`, which
// keeps the last `MAX_LOG_ENTRIES` records in memory like morpheus-core's
// boot log does.

use std::collections::VecDeque;
use std::sync::{Mutex, OnceLock};

use log::{Level, LevelFilter, Log, Metadata, Record};

const MAX_LOG_ENTRIES: usize = 256;

static LOGGER: OnceLock<RingLogger> = OnceLock::new();

/// One captured log record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    pub level: Level,
    pub target: String,
    pub message: String,
}

impl core::fmt::Display for LogEntry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{:<5} {}: {}", self.level, self.target, self.message)
    }
}

/// `log::Log` implementation backed by a bounded queue
pub struct RingLogger {
    entries: Mutex<VecDeque<LogEntry>>,
}

impl RingLogger {
    const fn new() -> Self {
        Self {
            entries: Mutex::new(VecDeque::new()),
        }
    }

    fn with_entries<R>(&self, f: impl FnOnce(&mut VecDeque<LogEntry>) -> R) -> R {
        let mut guard = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut guard)
    }

    /// Snapshot of the buffered records, oldest first
    pub fn entries(&self) -> Vec<LogEntry> {
        self.with_entries(|q| q.iter().cloned().collect())
    }

    pub fn count(&self) -> usize {
        self.with_entries(|q| q.len())
    }

    pub fn clear(&self) {
        self.with_entries(|q| q.clear());
    }

    /// True if any buffered message contains `needle`
    pub fn contains(&self, needle: &str) -> bool {
        self.with_entries(|q| q.iter().any(|e| e.message.contains(needle)))
    }
}

impl Log for RingLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let entry = LogEntry {
            level: record.level(),
            target: record.target().to_string(),
            message: record.args().to_string(),
        };
        self.with_entries(|q| {
            if q.len() == MAX_LOG_ENTRIES {
                q.pop_front();
            }
            q.push_back(entry);
        });
    }

    fn flush(&self) {}
}

/// Install the ring logger as the process logger.
///
/// Safe to call more than once; if another logger is already installed the
/// ring logger is still returned but will not receive records.
pub fn init(level: LevelFilter) -> &'static RingLogger {
    let logger = LOGGER.get_or_init(RingLogger::new);
    if log::set_logger(logger).is_ok() || log::max_level() < level {
        log::set_max_level(level);
    }
    logger
}

/// Buffered records of the installed ring logger (empty if never installed)
pub fn get_logs() -> Vec<LogEntry> {
    LOGGER.get().map(RingLogger::entries).unwrap_or_default()
}

pub fn log_count() -> usize {
    LOGGER.get().map(RingLogger::count).unwrap_or(0)
}
