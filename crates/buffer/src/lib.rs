//! Buffer pool: the concurrent page cache that mediates between on-disk
//! buffer files and engine code holding fixed pages in memory.
//!
//! Four pieces cooperate, in the dependency order they are built in:
//!
//! - [`config`] — named parameters (`Buffer_*`), cached process-wide.
//! - [`stats`] — atomic counters plus an optional reporter thread.
//! - [`file`] — OS file lifecycle, descriptor-budget enforcement, CRC I/O.
//! - [`pool`] — memory accounting, LRU/dirty lists, replacement, flush.
//! - [`page`] — fix-mode and state-machine vocabulary shared by the above.
//! - [`manager`] — [`manager::BufferManager`], the process-wide handle that
//!   owns one [`pool::Pool`] per [`Class`] and the global file table.
//!
//! ```no_run
//! use buffer::{manager::BufferManager, page::{FixMode, UnfixMode}, Class};
//!
//! let manager = BufferManager::new().unwrap();
//! let file = manager.attach_file("/tmp/db/heap.dat", Class::Normal, true).unwrap();
//! let mut page = manager.fix(&file, 0, FixMode::allocate()).unwrap();
//! page.content_mut()[0] = 42;
//! page.unfix(UnfixMode::Flush).unwrap();
//! manager.detach_file(&file).unwrap();
//! ```

pub mod config;
pub mod file;
pub mod manager;
pub mod page;
pub mod pool;
pub mod stats;

/// Which workload a pool serves. Exactly one [`pool::Pool`] instance per
/// class exists process-wide, each with its own size budget from
/// [`config::Configuration`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Class {
    /// General table/index data.
    Normal,
    /// Scratch pages for sorts, hash spills, and other transient work.
    Temporary,
    /// Immutable pages (e.g. a read-only snapshot or archive).
    ReadOnly,
    /// Write-ahead log pages.
    LogicalLog,
}
