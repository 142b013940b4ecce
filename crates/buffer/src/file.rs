//! OS file lifecycle: mount/create/truncate, CRC-validated read/write,
//! and a process-wide budget on concurrently open descriptors.

use crate::stats::Statistics;
use crate::Class;
use common::{DbError, DbResult, FileId};
use lru::LruCache;
use parking_lot::Mutex;
use std::fs::OpenOptions;
use std::io::{Read, Seek, SeekFrom, Write};
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::warn;

/// `EMFILE` / `ENFILE` on Linux and macOS. `std::io::ErrorKind` has no
/// stable variant for "too many open files", so we recognize the errno
/// directly; any other OS error propagates as-is.
fn is_too_many_open_files(err: &std::io::Error) -> bool {
    matches!(err.raw_os_error(), Some(24) | Some(23))
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Accessibility {
    None,
    /// Created logically but not yet backed by an OS file
    /// (`DelayTemporaryCreation`).
    Volatile,
    Persisted,
}

/// Process-wide LRU of currently-open buffer files, bounded by
/// `OpenFileCountMax`. Non-buffer code accounts for its own descriptor
/// usage through [`DescriptorBudget::reserve_descriptor`] /
/// [`DescriptorBudget::return_descriptor`].
pub struct DescriptorBudget {
    limit: AtomicUsize,
    reserved_other: AtomicUsize,
    open: Mutex<LruCache<FileId, Weak<BufferFile>>>,
    stats: Arc<Statistics>,
}

impl DescriptorBudget {
    pub fn new(limit: usize, stats: Arc<Statistics>) -> Self {
        let limit = limit.max(1);
        Self {
            limit: AtomicUsize::new(limit),
            reserved_other: AtomicUsize::new(0),
            open: Mutex::new(LruCache::new(NonZeroUsize::new(limit).unwrap())),
            stats,
        }
    }

    /// Account for a descriptor opened outside the buffer pool. Returns
    /// `false` if the budget is already exhausted.
    pub fn reserve_descriptor(&self) -> bool {
        let open_count = self.open.lock().len();
        let limit = self.limit.load(Ordering::Relaxed);
        let reserved = self.reserved_other.fetch_add(1, Ordering::AcqRel);
        if open_count + reserved + 1 > limit {
            self.reserved_other.fetch_sub(1, Ordering::AcqRel);
            false
        } else {
            true
        }
    }

    pub fn return_descriptor(&self) {
        self.reserved_other.fetch_sub(1, Ordering::AcqRel);
    }

    /// Close LRU-most open buffer files (skipping any whose handle is
    /// currently latched) until there is room for one more.
    fn make_room(&self, incoming: FileId) {
        let limit = self.limit.load(Ordering::Relaxed);
        let reserved = self.reserved_other.load(Ordering::Relaxed);
        if self.open.lock().len() + reserved < limit {
            return;
        }
        let candidates: Vec<(FileId, Weak<BufferFile>)> = self
            .open
            .lock()
            .iter()
            .rev() // `iter()` is MRU-first; reverse to close the LRU-most entries first.
            .filter(|(id, _)| **id != incoming)
            .map(|(id, w)| (*id, w.clone()))
            .collect();
        for (id, weak) in candidates {
            let reserved = self.reserved_other.load(Ordering::Relaxed);
            if self.open.lock().len() + reserved < limit {
                break;
            }
            match weak.upgrade() {
                Some(file) => {
                    if let Some(mut handle) = file.handle.try_lock() {
                        if handle.is_some() {
                            *handle = None;
                            self.open.lock().pop(&id);
                            self.stats.record_descriptor_close();
                        }
                    }
                }
                None => {
                    self.open.lock().pop(&id);
                }
            }
        }
    }

    fn note_open(&self, id: FileId, file: &Arc<BufferFile>) {
        self.open.lock().put(id, Arc::downgrade(file));
    }

    fn note_close(&self, id: FileId) {
        self.open.lock().pop(&id);
    }
}

/// A single backing OS file registered with the buffer pool's file table.
pub struct BufferFile {
    id: FileId,
    path: Mutex<PathBuf>,
    page_size: usize,
    class: Class,
    refcount: AtomicUsize,
    mounted: AtomicBool,
    accessibility: Mutex<Accessibility>,
    read_only: bool,
    no_crc: bool,
    delay_temporary_creation: bool,
    file_permission: u32,
    cached_size: AtomicU64,
    deterrent_count: AtomicI64,
    dirty_since_close: AtomicBool,
    written_since_open: AtomicBool,
    handle: Mutex<Option<std::fs::File>>,
}

impl BufferFile {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: FileId,
        class: Class,
        path: PathBuf,
        page_size: usize,
        read_only: bool,
        no_crc: bool,
        delay_temporary_creation: bool,
        file_permission: u32,
    ) -> Arc<Self> {
        Arc::new(Self {
            id,
            path: Mutex::new(path),
            page_size,
            class,
            refcount: AtomicUsize::new(0),
            mounted: AtomicBool::new(false),
            accessibility: Mutex::new(Accessibility::None),
            read_only,
            no_crc,
            delay_temporary_creation,
            file_permission,
            cached_size: AtomicU64::new(0),
            deterrent_count: AtomicI64::new(0),
            dirty_since_close: AtomicBool::new(false),
            written_since_open: AtomicBool::new(false),
            handle: Mutex::new(None),
        })
    }

    pub fn id(&self) -> FileId {
        self.id
    }

    pub fn path(&self) -> PathBuf {
        self.path.lock().clone()
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn class(&self) -> Class {
        self.class
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    /// Whether the footer's 32-bit CRC should be checked for this file
    /// under `CalculateCheckSum = Specified` (the file's own opt-out).
    pub fn checks_footer(&self) -> bool {
        !self.no_crc
    }

    pub fn incref(&self) -> usize {
        self.refcount.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub fn decref(&self) -> usize {
        self.refcount.fetch_sub(1, Ordering::AcqRel) - 1
    }

    pub fn is_mounted(&self) -> bool {
        self.mounted.load(Ordering::Acquire)
    }

    pub fn is_accessible(&self) -> bool {
        !matches!(*self.accessibility.lock(), Accessibility::None)
    }

    pub fn get_size(&self) -> u64 {
        self.cached_size.load(Ordering::Acquire)
    }

    pub fn get_page_count(&self) -> u64 {
        self.get_size() / self.page_size as u64
    }

    pub fn start_deterrent(&self) {
        self.deterrent_count.fetch_add(1, Ordering::AcqRel);
    }

    pub fn end_deterrent(&self) {
        self.deterrent_count.fetch_sub(1, Ordering::AcqRel);
    }

    pub fn is_deterred(&self) -> bool {
        self.deterrent_count.load(Ordering::Acquire) > 0
    }

    /// Whether a write has landed since the file was last closed (or
    /// first opened). Distinct from `written_since_open`'s "needs an
    /// fsync before the next close" bookkeeping: this one simply reports
    /// state to callers that want to know without consuming the flag.
    pub fn is_dirty_since_close(&self) -> bool {
        self.dirty_since_close.load(Ordering::Acquire)
    }

    fn read_options() -> OpenOptions {
        let mut opts = OpenOptions::new();
        opts.read(true);
        opts
    }

    fn write_options(&self) -> OpenOptions {
        let mut opts = OpenOptions::new();
        opts.read(true).write(!self.read_only);
        if !self.read_only {
            // Lets a `Volatile` temporary file materialize on disk on its
            // first write without a separate `create()` call.
            opts.create(true);
        }
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            opts.mode(self.file_permission);
        }
        opts
    }

    fn ensure_open(self: &Arc<Self>, budget: &DescriptorBudget, opts: OpenOptions) -> DbResult<()> {
        if self.handle.lock().is_some() {
            return Ok(());
        }
        let path = self.path();
        let mut attempt = 0;
        loop {
            budget.make_room(self.id);
            match opts.open(&path) {
                Ok(f) => {
                    *self.handle.lock() = Some(f);
                    budget.note_open(self.id, self);
                    return Ok(());
                }
                Err(e) if is_too_many_open_files(&e) && attempt < 3 => {
                    attempt += 1;
                    warn!(attempt, path = %path.display(), "too many open files, retrying");
                    std::thread::sleep(Duration::from_millis(10));
                }
                Err(e) if is_too_many_open_files(&e) => return Err(DbError::TooManyOpenFiles),
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Create the file. For `Temporary` files with `DelayTemporaryCreation`
    /// set, no filesystem activity happens until the first write.
    pub fn create(self: &Arc<Self>, overwrite: bool, budget: &DescriptorBudget) -> DbResult<()> {
        if self.class == Class::Temporary && self.delay_temporary_creation {
            *self.accessibility.lock() = Accessibility::Volatile;
            self.cached_size.store(0, Ordering::Release);
            return Ok(());
        }
        let path = self.path();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut opts = OpenOptions::new();
        opts.read(true).write(true);
        if overwrite {
            opts.create(true).truncate(true);
        } else {
            opts.create_new(true);
        }
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            opts.mode(self.file_permission);
        }
        self.ensure_open(budget, opts)?;
        *self.accessibility.lock() = Accessibility::Persisted;
        self.cached_size.store(0, Ordering::Release);
        Ok(())
    }

    pub fn destroy(self: &Arc<Self>, budget: &DescriptorBudget) -> DbResult<()> {
        self.close(budget)?;
        if matches!(*self.accessibility.lock(), Accessibility::Persisted) {
            let path = self.path();
            match std::fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        *self.accessibility.lock() = Accessibility::None;
        self.mounted.store(false, Ordering::Release);
        Ok(())
    }

    pub fn mount(self: &Arc<Self>, existing: bool) -> DbResult<()> {
        let path = self.path();
        if existing && !path.exists() {
            return Err(DbError::FileNotFound(path));
        }
        *self.accessibility.lock() = Accessibility::Persisted;
        self.mounted.store(true, Ordering::Release);
        if existing {
            let len = std::fs::metadata(&path)?.len();
            self.cached_size.store(len, Ordering::Release);
        }
        Ok(())
    }

    pub fn unmount(&self) {
        self.mounted.store(false, Ordering::Release);
    }

    pub fn open(self: &Arc<Self>, budget: &DescriptorBudget) -> DbResult<()> {
        self.ensure_open(budget, self.write_options())
    }

    pub fn close(&self, budget: &DescriptorBudget) -> DbResult<()> {
        if self.written_since_open.swap(false, Ordering::AcqRel) {
            if let Some(handle) = self.handle.lock().as_ref() {
                handle.sync_all()?;
            }
        }
        self.dirty_since_close.store(false, Ordering::Release);
        *self.handle.lock() = None;
        budget.note_close(self.id);
        Ok(())
    }

    pub fn read(self: &Arc<Self>, budget: &DescriptorBudget, offset: u64, len: usize) -> DbResult<Vec<u8>> {
        self.ensure_open(budget, Self::read_options())?;
        let mut buf = vec![0u8; len];
        let result = {
            let mut handle = self.handle.lock();
            let file = handle.as_mut().expect("ensure_open just populated the handle");
            file.seek(SeekFrom::Start(offset))
                .and_then(|_| file.read_exact(&mut buf))
        };
        match result {
            Ok(()) => Ok(buf),
            Err(e) => {
                *self.handle.lock() = None;
                budget.note_close(self.id);
                if e.kind() == std::io::ErrorKind::UnexpectedEof {
                    Err(DbError::BadDataPage {
                        offset,
                        path: self.path(),
                    })
                } else {
                    Err(e.into())
                }
            }
        }
    }

    pub fn write(self: &Arc<Self>, budget: &DescriptorBudget, offset: u64, data: &[u8]) -> DbResult<()> {
        if self.read_only {
            return Err(DbError::BadArgument("file is read-only".into()));
        }
        if matches!(*self.accessibility.lock(), Accessibility::Volatile) {
            let path = self.path();
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            *self.accessibility.lock() = Accessibility::Persisted;
        }
        self.ensure_open(budget, self.write_options())?;
        let result = {
            let mut handle = self.handle.lock();
            let file = handle.as_mut().expect("ensure_open just populated the handle");
            file.seek(SeekFrom::Start(offset))
                .and_then(|_| file.write_all(data))
        };
        match result {
            Ok(()) => {
                self.written_since_open.store(true, Ordering::Release);
                self.dirty_since_close.store(true, Ordering::Release);
                let end = offset + data.len() as u64;
                self.cached_size.fetch_max(end, Ordering::AcqRel);
                Ok(())
            }
            Err(e) => {
                *self.handle.lock() = None;
                budget.note_close(self.id);
                Err(e.into())
            }
        }
    }

    pub fn sync(&self) -> DbResult<()> {
        if self.written_since_open.swap(false, Ordering::AcqRel) {
            if let Some(handle) = self.handle.lock().as_ref() {
                handle.sync_all()?;
            }
        }
        Ok(())
    }

    pub fn truncate(self: &Arc<Self>, budget: &DescriptorBudget, offset: u64) -> DbResult<()> {
        let aligned = (offset / self.page_size as u64) * self.page_size as u64;
        if matches!(*self.accessibility.lock(), Accessibility::Persisted) {
            self.ensure_open(budget, self.write_options())?;
            let handle = self.handle.lock();
            handle
                .as_ref()
                .expect("ensure_open just populated the handle")
                .set_len(aligned)?;
        }
        self.cached_size.store(aligned, Ordering::Release);
        Ok(())
    }

    pub fn extend(self: &Arc<Self>, budget: &DescriptorBudget, offset: u64) -> DbResult<()> {
        let page_size = self.page_size as u64;
        let aligned = offset.div_ceil(page_size) * page_size;
        let current = self.get_size();
        if aligned <= current {
            return Ok(());
        }
        if matches!(*self.accessibility.lock(), Accessibility::Volatile) {
            self.cached_size.store(aligned, Ordering::Release);
            return Ok(());
        }
        let new_pages = ((aligned - current) / page_size) as usize;
        let mut fill = Vec::with_capacity(new_pages * self.page_size);
        for _ in 0..new_pages {
            fill.extend_from_slice(storage::Page::new(self.page_size)?.as_bytes());
        }
        self.write(budget, current, &fill)?;
        self.cached_size.store(aligned, Ordering::Release);
        Ok(())
    }

    pub fn rename(self: &Arc<Self>, budget: &DescriptorBudget, new_path: PathBuf) -> DbResult<()> {
        let current = self.path();
        if current == new_path {
            return Ok(());
        }
        self.close(budget)?;
        if matches!(*self.accessibility.lock(), Accessibility::Persisted) {
            if let Some(parent) = new_path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::rename(&current, &new_path)?;
        }
        *self.path.lock() = new_path;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn make(dir: &Path, id: u64, delay_temp: bool, class: Class) -> Arc<BufferFile> {
        let path = dir.join(format!("f{id}.dat"));
        BufferFile::new(FileId(id), class, path, 4096, false, false, delay_temp, 0o600)
    }

    #[test]
    fn create_then_write_then_read_round_trips() {
        let dir = tempdir().unwrap();
        let budget = DescriptorBudget::new(64, Statistics::new());
        let file = make(dir.path(), 1, false, Class::Normal);
        file.create(true, &budget).unwrap();
        file.extend(&budget, 4096).unwrap();
        file.write(&budget, 0, &[7u8; 4096]).unwrap();
        let bytes = file.read(&budget, 0, 4096).unwrap();
        assert_eq!(bytes, vec![7u8; 4096]);
    }

    #[test]
    fn extend_rounds_up_to_a_page_boundary_and_writes_valid_empty_pages() {
        let dir = tempdir().unwrap();
        let budget = DescriptorBudget::new(64, Statistics::new());
        let file = make(dir.path(), 2, false, Class::Normal);
        file.create(true, &budget).unwrap();
        file.extend(&budget, 100).unwrap();
        assert_eq!(file.get_size(), 4096);
        let bytes = file.read(&budget, 0, 4096).unwrap();
        let page = storage::Page::from_raw(bytes).unwrap();
        assert!(page.verify_header());
        assert!(!page.is_calculated());
        assert!(page.content().iter().all(|b| *b == 0));
    }

    #[test]
    fn truncate_rounds_down_and_shrinks_cached_size() {
        let dir = tempdir().unwrap();
        let budget = DescriptorBudget::new(64, Statistics::new());
        let file = make(dir.path(), 3, false, Class::Normal);
        file.create(true, &budget).unwrap();
        file.extend(&budget, 3 * 4096).unwrap();
        file.truncate(&budget, 4096 + 1).unwrap();
        assert_eq!(file.get_size(), 4096);
    }

    #[test]
    fn rename_to_the_same_path_is_a_no_op() {
        let dir = tempdir().unwrap();
        let budget = DescriptorBudget::new(64, Statistics::new());
        let file = make(dir.path(), 4, false, Class::Normal);
        file.create(true, &budget).unwrap();
        let path = file.path();
        file.rename(&budget, path.clone()).unwrap();
        assert_eq!(file.path(), path);
    }

    #[test]
    fn rename_moves_the_file_on_disk() {
        let dir = tempdir().unwrap();
        let budget = DescriptorBudget::new(64, Statistics::new());
        let file = make(dir.path(), 5, false, Class::Normal);
        file.create(true, &budget).unwrap();
        file.extend(&budget, 4096).unwrap();
        let new_path = dir.path().join("renamed.dat");
        file.rename(&budget, new_path.clone()).unwrap();
        assert_eq!(file.path(), new_path);
        assert!(new_path.exists());
    }

    #[test]
    fn delayed_temporary_creation_defers_filesystem_activity() {
        let dir = tempdir().unwrap();
        let budget = DescriptorBudget::new(64, Statistics::new());
        let file = make(dir.path(), 6, true, Class::Temporary);
        file.create(false, &budget).unwrap();
        assert!(!file.path().exists());
        assert_eq!(file.get_size(), 0);

        // First write creates the OS file lazily and promotes it to
        // `Persisted`.
        file.extend(&budget, 4096).unwrap();
        file.write(&budget, 0, &[1u8; 4096]).unwrap();
        assert!(file.path().exists());
    }

    #[test]
    fn mount_of_a_missing_file_is_file_not_found() {
        let dir = tempdir().unwrap();
        let file = make(dir.path(), 7, false, Class::Normal);
        let err = file.mount(true);
        assert!(matches!(err, Err(DbError::FileNotFound(_))));
    }

    #[test]
    fn descriptor_budget_closes_the_lru_most_file_to_make_room() {
        let dir = tempdir().unwrap();
        let stats = Statistics::new();
        let budget = DescriptorBudget::new(2, stats.clone());
        let files: Vec<_> = (0..4).map(|i| make(dir.path(), 100 + i, false, Class::Normal)).collect();
        for file in &files {
            file.create(true, &budget).unwrap();
            file.extend(&budget, 4096).unwrap();
            file.write(&budget, 0, &[1u8; 4096]).unwrap();
        }
        assert!(stats.snapshot().descriptor_close_count >= 2);
        // Opening the 3rd and 4th files should have closed the two
        // earliest, never surfacing `TooManyOpenFiles` to the caller.
        assert!(files[0].handle.lock().is_none());
        assert!(files[1].handle.lock().is_none());
        assert!(files[3].handle.lock().is_some());
    }

    #[test]
    fn reserve_descriptor_accounts_for_non_buffer_file_handles() {
        let budget = DescriptorBudget::new(1, Statistics::new());
        assert!(budget.reserve_descriptor());
        assert!(!budget.reserve_descriptor());
        budget.return_descriptor();
        assert!(budget.reserve_descriptor());
    }
}
