//! Identifiers and the canonical error type shared by the buffer-pool
//! crates (`storage`, `buffer`).
//!
//! The transaction manager, SQL front end, schema/catalog, and WAL are
//! external collaborators of the buffer pool (see the design's scope
//! notes) and are not implemented in this workspace; `DbError` still
//! carries a couple of generic string variants for them so that a caller
//! embedding the buffer pool inside a larger engine has somewhere to
//! plug in its own failure modes without introducing a second error type.

use std::{io, path::PathBuf};
use thiserror::Error;

/// Identifier for a buffer file registered with the buffer pool's file
/// table. Distinct identifiers are handed out per mounted path; a heap
/// file, its indexes, and the write-ahead log each get their own `FileId`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FileId(pub u64);

/// Canonical error type shared across database subsystems.
#[derive(Error, Debug)]
pub enum DbError {
    #[error(transparent)]
    Io(#[from] io::Error),

    /// Generic failure surfaced by an external collaborator (transaction
    /// manager, catalog, WAL) that this workspace treats as opaque.
    #[error("external: {0}")]
    External(String),

    // --- Buffer pool error kinds ---
    /// The pool's memory budget is exhausted. Retryable: callers should
    /// force a dirty-page flush and try again, up to
    /// `RetryAllocationCountMax` times.
    #[error("memory exhausted")]
    MemoryExhausted,
    /// A page failed CRC verification, or a read returned fewer bytes than
    /// the page size.
    #[error("bad data page at offset {offset} in {path}")]
    BadDataPage { offset: u64, path: PathBuf },
    /// `unfix(Flush)` was attempted on a page whose file has an active
    /// deterrent and whose state is `Deterrentable`.
    #[error("flush prevented by deterrent on {0}")]
    FlushPrevented(PathBuf),
    /// The OS file-descriptor budget is exhausted even after closing LRU
    /// victims; retried internally before ever reaching a caller.
    #[error("too many open files")]
    TooManyOpenFiles,
    /// Expected during `mount(existing = false)`; callers swallow this.
    #[error("file not found: {0}")]
    FileNotFound(PathBuf),
    /// An internal invariant was violated (e.g. a rename collision with
    /// the file's own path).
    #[error("unexpected: {0}")]
    Unexpected(String),
    /// The caller passed an invalid argument (e.g. a zero page size).
    #[error("bad argument: {0}")]
    BadArgument(String),
}

/// Result alias that carries a `DbError`.
pub type DbResult<T> = Result<T, DbError>;

/// Convenient re-exports for downstream crates.
pub mod prelude {
    pub use crate::{DbError, DbResult, FileId};
}
