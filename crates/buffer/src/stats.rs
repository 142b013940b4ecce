//! Process-wide counters plus an optional background reporter thread
//! (`StatisticsReporterPeriod`).

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::info;

/// Atomic counters updated by the pool, file and page layers as they
/// operate. Cheap enough to bump on every fix/unfix.
#[derive(Default)]
pub struct Statistics {
    pub fix_count: AtomicU64,
    pub unfix_count: AtomicU64,
    pub read_count: AtomicU64,
    pub write_count: AtomicU64,
    pub evict_count: AtomicU64,
    pub replace_count: AtomicU64,
    pub flush_count: AtomicU64,
    pub memory_exhausted_retry_count: AtomicU64,
    pub descriptor_close_count: AtomicU64,
}

/// A point-in-time copy of [`Statistics`], suitable for logging or
/// exposing to a monitoring endpoint.
#[derive(Clone, Debug, Default)]
pub struct Snapshot {
    pub fix_count: u64,
    pub unfix_count: u64,
    pub read_count: u64,
    pub write_count: u64,
    pub evict_count: u64,
    pub replace_count: u64,
    pub flush_count: u64,
    pub memory_exhausted_retry_count: u64,
    pub descriptor_close_count: u64,
}

impl Statistics {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn record_fix(&self) {
        self.fix_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_unfix(&self) {
        self.unfix_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_read(&self) {
        self.read_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_write(&self) {
        self.write_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_evict(&self) {
        self.evict_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_replace(&self) {
        self.replace_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_flush(&self) {
        self.flush_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_memory_exhausted_retry(&self) {
        self.memory_exhausted_retry_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_descriptor_close(&self) {
        self.descriptor_close_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            fix_count: self.fix_count.load(Ordering::Relaxed),
            unfix_count: self.unfix_count.load(Ordering::Relaxed),
            read_count: self.read_count.load(Ordering::Relaxed),
            write_count: self.write_count.load(Ordering::Relaxed),
            evict_count: self.evict_count.load(Ordering::Relaxed),
            replace_count: self.replace_count.load(Ordering::Relaxed),
            flush_count: self.flush_count.load(Ordering::Relaxed),
            memory_exhausted_retry_count: self.memory_exhausted_retry_count.load(Ordering::Relaxed),
            descriptor_close_count: self.descriptor_close_count.load(Ordering::Relaxed),
        }
    }
}

/// Spawn the statistics daemon if `period_ms` is non-zero. The thread
/// checks `stop` between sleeps and exits promptly once it is set.
pub fn spawn_reporter(
    stats: Arc<Statistics>,
    period_ms: u64,
    stop: Arc<AtomicBool>,
) -> Option<JoinHandle<()>> {
    if period_ms == 0 {
        return None;
    }
    Some(std::thread::spawn(move || {
        while !stop.load(Ordering::Relaxed) {
            std::thread::sleep(Duration::from_millis(period_ms));
            if stop.load(Ordering::Relaxed) {
                break;
            }
            let snapshot = stats.snapshot();
            info!(?snapshot, "buffer pool statistics");
        }
    }))
}
