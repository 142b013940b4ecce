//! Top-level orchestration: wires [`crate::config::Configuration`],
//! [`crate::stats::Statistics`], the file table, and one [`Pool`] per
//! [`Class`] into a single handle, and owns the background dirty-page
//! flusher and statistics-reporter threads.

use crate::config::{self, Configuration};
use crate::file::{BufferFile, DescriptorBudget};
use crate::page::{FixMode, UnfixMode};
use crate::pool::{Memory, Pool};
use crate::stats::{self, Statistics};
use crate::Class;
use common::{DbResult, FileId};
use dashmap::DashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::warn;

/// Owns every file and pool the process has open and runs the
/// background maintenance threads described in the external interface
/// (`DirtyPageFlusherPeriod`, `StatisticsReporterPeriod`).
pub struct BufferManager {
    config: Configuration,
    stats: Arc<Statistics>,
    budget: Arc<DescriptorBudget>,
    files: DashMap<PathBuf, Arc<BufferFile>>,
    next_file_id: AtomicU64,
    pools: [Arc<Pool>; 4],
    stop: Arc<AtomicBool>,
    flusher: Mutex<Option<JoinHandle<()>>>,
    reporter: Mutex<Option<JoinHandle<()>>>,
}

fn class_index(class: Class) -> usize {
    match class {
        Class::Normal => 0,
        Class::Temporary => 1,
        Class::ReadOnly => 2,
        Class::LogicalLog => 3,
    }
}

impl BufferManager {
    /// Build a manager from the process's cached [`Configuration`].
    pub fn new() -> DbResult<Arc<Self>> {
        Self::with_config(config::get()?)
    }

    pub fn with_config(config: Configuration) -> DbResult<Arc<Self>> {
        let stats = Statistics::new();
        let budget = Arc::new(DescriptorBudget::new(config.open_file_count_max, stats.clone()));
        let pools = [Class::Normal, Class::Temporary, Class::ReadOnly, Class::LogicalLog]
            .map(|class| {
                Pool::new(
                    class,
                    storage::round_page_size(4096, config.page_size_max),
                    config.pool_size_limit(class),
                    budget.clone(),
                    stats.clone(),
                    config.calculate_checksum,
                    config.skip_dirty_candidate_count_max,
                    config.flushing_body_count_max,
                    config.read_ahead_block_size,
                    config.retry_allocation_count_max,
                    config.page_table_size,
                )
            });
        let stop = Arc::new(AtomicBool::new(false));

        let manager = Arc::new(Self {
            config: config.clone(),
            stats: stats.clone(),
            budget,
            files: DashMap::with_capacity(config.file_table_size),
            next_file_id: AtomicU64::new(1),
            pools,
            stop: stop.clone(),
            flusher: Mutex::new(None),
            reporter: Mutex::new(None),
        });

        let flusher_handle = {
            let weak = Arc::downgrade(&manager);
            let stop = stop.clone();
            let period = config.dirty_page_flusher_period_ms;
            let flush_page_coefficient = config.flush_page_coefficient;
            if period == 0 {
                None
            } else {
                Some(std::thread::spawn(move || {
                    while !stop.load(Ordering::Relaxed) {
                        std::thread::sleep(Duration::from_millis(period));
                        if stop.load(Ordering::Relaxed) {
                            break;
                        }
                        let Some(manager) = weak.upgrade() else { break };
                        for pool in &manager.pools {
                            if pool.dirty_percent() < flush_page_coefficient {
                                continue;
                            }
                            if let Err(e) = pool.swap_dirty_list() {
                                warn!(error = %e, class = ?pool.class(), "dirty page flush failed");
                            }
                        }
                    }
                }))
            }
        };
        *manager.flusher.lock().unwrap() = flusher_handle;

        let reporter_handle = stats::spawn_reporter(stats, config.statistics_reporter_period_ms, stop);
        *manager.reporter.lock().unwrap() = reporter_handle;

        Ok(manager)
    }

    pub fn config(&self) -> &Configuration {
        &self.config
    }

    pub fn stats(&self) -> Arc<Statistics> {
        self.stats.clone()
    }

    fn pool(&self, class: Class) -> &Arc<Pool> {
        &self.pools[class_index(class)]
    }

    /// Register a new or existing file with the manager's file table.
    /// `path` is canonicalized as given; two registrations of the same
    /// path return the same [`BufferFile`].
    pub fn attach_file(
        self: &Arc<Self>,
        path: impl Into<PathBuf>,
        class: Class,
        create: bool,
    ) -> DbResult<Arc<BufferFile>> {
        let path = path.into();
        if let Some(existing) = self.files.get(&path) {
            existing.incref();
            return Ok(existing.clone());
        }
        let id = FileId(self.next_file_id.fetch_add(1, Ordering::AcqRel));
        let page_size = storage::round_page_size(4096, self.config.page_size_max);
        let read_only = class == Class::ReadOnly;
        let file = BufferFile::new(
            id,
            class,
            path.clone(),
            page_size,
            read_only,
            false,
            self.config.delay_temporary_creation,
            self.config.file_permission,
        );
        if create {
            file.create(false, &self.budget)?;
        } else {
            file.mount(true)?;
        }
        file.incref();
        self.files.insert(path, file.clone());
        Ok(file)
    }

    /// Drop a reference to `file`; once the refcount reaches zero its
    /// pages are discarded from their pool and the descriptor is closed.
    pub fn detach_file(&self, file: &Arc<BufferFile>) -> DbResult<()> {
        if file.decref() == 0 {
            self.pool(file.class()).discard_file(file);
            file.close(&self.budget)?;
            self.files.remove(&file.path());
        }
        Ok(())
    }

    pub fn destroy_file(&self, file: &Arc<BufferFile>) -> DbResult<()> {
        self.pool(file.class()).discard_file(file);
        file.destroy(&self.budget)?;
        self.files.remove(&file.path());
        Ok(())
    }

    pub fn fix(self: &Arc<Self>, file: &Arc<BufferFile>, offset: u64, mode: FixMode) -> DbResult<Memory> {
        self.pool(file.class()).fix(file, offset, mode)
    }

    pub fn flush_all(&self, class: Class) -> DbResult<usize> {
        self.pool(class).flush_dirty(false)
    }

    /// Two-phase checkpoint: mark every pool's currently dirty pages,
    /// then flush only those marked, so pages dirtied mid-checkpoint are
    /// deferred to the next one.
    pub fn checkpoint(&self) -> DbResult<usize> {
        for pool in &self.pools {
            pool.mark_dirty();
        }
        let mut total = 0;
        for pool in &self.pools {
            total += pool.flush_dirty(true)?;
        }
        Ok(total)
    }

    pub fn shrink_idle(&self) -> usize {
        self.pools.iter().map(|pool| pool.shrink(0)).sum()
    }

    /// Stop the background threads. Idempotent; subsequent fixes and
    /// flushes still work, they simply aren't driven automatically.
    pub fn shutdown(&self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.flusher.lock().unwrap().take() {
            let _ = handle.join();
        }
        if let Some(handle) = self.reporter.lock().unwrap().take() {
            let _ = handle.join();
        }
    }
}

impl Drop for BufferManager {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
    }
}
