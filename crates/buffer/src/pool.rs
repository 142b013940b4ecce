//! A single size-budgeted pool of page frames for one [`crate::Class`].
//!
//! Pages are looked up through a [`DashMap`] keyed by `(FileId, offset)` —
//! this plays the role of the hash-bucket latches in the external
//! interface, letting independent keys proceed without contending on a
//! single pool-wide lock. Everything that touches the shared arena (the
//! free list, the LRU order, and the dirty list) goes through one
//! `Mutex<PoolInner>` instead; those operations are all O(1) pointer
//! fixups so the critical section stays short.
//!
//! A descriptor's content lives in `PageDescriptor::memory`, an
//! `UnsafeCell<Option<storage::Page>>` gated by `PageDescriptor::rwlock`:
//! a [`FixCategory::ReadOnly`] fix takes it shared, letting any number of
//! concurrent readers of the same resident page proceed at once; a
//! `Write`/`Allocate` fix takes it exclusive. The lock is acquired in
//! [`Pool::fix`] before the page is even loaded and released in
//! [`Memory::unfix`] (or its `Drop`), so it is held for the whole span a
//! caller holds the page, not just around individual reads — matching
//! the hold-across-I/O requirement in the external interface. It is a
//! hand-rolled `Mutex`+`Condvar` pair rather than `parking_lot::RwLock`
//! itself: a `RwLock<T>`'s guards borrow from the lock, and storing one
//! inside `Memory` alongside the `Arc<PageDescriptor>` it borrows from
//! is the kind of self-referential struct Rust can't express without
//! unsafe lifetime erasure anyway, so there is nothing to gain over
//! owning the lock state as a plain value and releasing it explicitly.

use crate::config::ChecksumMode;
use crate::file::{BufferFile, DescriptorBudget};
use crate::page::{state, FixCategory, FixMode, UnfixMode};
use crate::stats::Statistics;
use crate::Class;
use common::{DbError, DbResult, FileId};
use dashmap::mapref::entry::Entry as DashEntry;
use dashmap::DashMap;
use parking_lot::{Condvar, Mutex};
use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

pub mod arc_policy;

type FrameIndex = usize;
type PageKey = (FileId, u64);

/// Long-held reader/writer exclusion over one page's memory. Unlike
/// `parking_lot::RwLock<T>`, "holding" this lock is just a [`LockKind`]
/// value a caller keeps around, not a borrowed guard, so it can live
/// inside a struct (`Memory`) that also owns the `Arc` the lock is
/// embedded in.
struct PageRwLock {
    state: Mutex<i64>,
    cond: Condvar,
}

impl PageRwLock {
    fn new() -> Self {
        Self {
            state: Mutex::new(0),
            cond: Condvar::new(),
        }
    }

    fn lock_shared(&self) {
        let mut state = self.state.lock();
        while *state < 0 {
            self.cond.wait(&mut state);
        }
        *state += 1;
    }

    fn lock_exclusive(&self) {
        let mut state = self.state.lock();
        while *state != 0 {
            self.cond.wait(&mut state);
        }
        *state = -1;
    }

    fn try_lock_shared(&self) -> bool {
        let mut state = self.state.lock();
        if *state >= 0 {
            *state += 1;
            true
        } else {
            false
        }
    }

    fn try_lock_exclusive(&self) -> bool {
        let mut state = self.state.lock();
        if *state == 0 {
            *state = -1;
            true
        } else {
            false
        }
    }

    fn unlock_shared(&self) {
        let mut state = self.state.lock();
        *state -= 1;
        if *state == 0 {
            self.cond.notify_all();
        }
    }

    fn unlock_exclusive(&self) {
        let mut state = self.state.lock();
        *state = 0;
        self.cond.notify_all();
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum LockKind {
    None,
    Shared,
    Exclusive,
}

fn release_lock(desc: &PageDescriptor, kind: LockKind) {
    match kind {
        LockKind::Shared => desc.rwlock.unlock_shared(),
        LockKind::Exclusive => desc.rwlock.unlock_exclusive(),
        LockKind::None => {}
    }
}

struct PageDescriptor {
    file: Arc<BufferFile>,
    offset: u64,
    state: AtomicU8,
    refcount: AtomicUsize,
    latch: Mutex<()>,
    rwlock: PageRwLock,
    memory: UnsafeCell<Option<storage::Page>>,
}

// SAFETY: every read or write of `memory` happens either (a) under
// `latch`, which serializes the one-time Empty -> Normal load (see
// `Pool::load_into_frame`), or (b) while holding `rwlock` in the mode
// that matches the access (shared for reads, exclusive for writes), per
// the locking protocol `Pool::fix`/`Memory` implement. `FixMode::no_lock`
// is the one documented exception: its contract is that the caller
// already holds an equivalent external lock.
unsafe impl Sync for PageDescriptor {}

struct Frame {
    desc: Option<Arc<PageDescriptor>>,
    lru_prev: Option<FrameIndex>,
    lru_next: Option<FrameIndex>,
    dirty_prev: Option<FrameIndex>,
    dirty_next: Option<FrameIndex>,
    dirty_linked: bool,
}

impl Frame {
    fn empty() -> Self {
        Self {
            desc: None,
            lru_prev: None,
            lru_next: None,
            dirty_prev: None,
            dirty_next: None,
            dirty_linked: false,
        }
    }
}

struct PoolInner {
    arena: Vec<Frame>,
    free: Vec<FrameIndex>,
    lru_head: Option<FrameIndex>,
    lru_tail: Option<FrameIndex>,
    dirty_head: Option<FrameIndex>,
    dirty_tail: Option<FrameIndex>,
    bytes_used: usize,
}

/// One class's worth of frames (Normal, Temporary, ReadOnly, or
/// LogicalLog), each with its own size budget from [`crate::config`].
pub struct Pool {
    class: Class,
    page_size: usize,
    limit_bytes: usize,
    budget: Arc<DescriptorBudget>,
    stats: Arc<Statistics>,
    checksum_mode: ChecksumMode,
    skip_dirty_candidate_count_max: usize,
    flushing_body_count_max: usize,
    read_ahead_block_size: usize,
    retry_allocation_count_max: u32,
    index: DashMap<PageKey, FrameIndex>,
    inner: Mutex<PoolInner>,
    refcount: AtomicUsize,
}

impl Pool {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        class: Class,
        page_size: usize,
        limit_bytes: usize,
        budget: Arc<DescriptorBudget>,
        stats: Arc<Statistics>,
        checksum_mode: ChecksumMode,
        skip_dirty_candidate_count_max: usize,
        flushing_body_count_max: usize,
        read_ahead_block_size: usize,
        retry_allocation_count_max: u32,
        page_table_size: usize,
    ) -> Arc<Self> {
        Arc::new(Self {
            class,
            page_size,
            limit_bytes,
            budget,
            stats,
            checksum_mode,
            skip_dirty_candidate_count_max,
            flushing_body_count_max,
            read_ahead_block_size,
            retry_allocation_count_max,
            index: DashMap::with_capacity(page_table_size),
            inner: Mutex::new(PoolInner {
                arena: Vec::new(),
                free: Vec::new(),
                lru_head: None,
                lru_tail: None,
                dirty_head: None,
                dirty_tail: None,
                bytes_used: 0,
            }),
            refcount: AtomicUsize::new(0),
        })
    }

    pub fn class(&self) -> Class {
        self.class
    }

    pub fn attach(&self) -> usize {
        self.refcount.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub fn detach(&self) -> usize {
        self.refcount.fetch_sub(1, Ordering::AcqRel) - 1
    }

    pub fn resident_bytes(&self) -> usize {
        self.inner.lock().bytes_used
    }

    /// Percentage (0-100) of resident frames currently on the dirty list.
    /// The background flusher consults this against `FlushPageCoefficient`
    /// so a pass that would only write back a handful of pages is skipped
    /// in favor of batching more dirty pages into the next one.
    pub fn dirty_percent(&self) -> u8 {
        let inner = self.inner.lock();
        let occupied = inner.arena.iter().filter(|f| f.desc.is_some()).count();
        if occupied == 0 {
            return 0;
        }
        let mut dirty = 0usize;
        let mut cursor = inner.dirty_head;
        while let Some(idx) = cursor {
            dirty += 1;
            cursor = inner.arena[idx].dirty_next;
        }
        ((dirty * 100) / occupied) as u8
    }

    fn capacity_frames(&self) -> usize {
        (self.limit_bytes / self.page_size).max(1)
    }

    fn checks_footer(&self, file: &BufferFile) -> bool {
        match self.checksum_mode {
            ChecksumMode::None => false,
            ChecksumMode::All => true,
            ChecksumMode::Specified => file.checks_footer(),
        }
    }

    fn descriptor(&self, idx: FrameIndex) -> Arc<PageDescriptor> {
        self.inner.lock().arena[idx]
            .desc
            .clone()
            .expect("frame index refers to an occupied frame")
    }

    /// Pin `(file, offset)` into memory and return a handle to its content.
    ///
    /// Acquires the page's RW lock (shared for `ReadOnly`, exclusive for
    /// `Write`/`Allocate`, skipped entirely when `mode.no_lock`) before the
    /// page is loaded, and holds it until the returned [`Memory`] is
    /// unfixed or dropped.
    pub fn fix(self: &Arc<Self>, file: &Arc<BufferFile>, offset: u64, mode: FixMode) -> DbResult<Memory> {
        self.stats.record_fix();
        let key = (file.id(), offset);
        let frame_idx = self.frame_for(file, offset, key)?;
        let desc = self.descriptor(frame_idx);

        let lock_kind = if mode.no_lock {
            LockKind::None
        } else if matches!(mode.category, FixCategory::ReadOnly) {
            LockKind::Shared
        } else {
            LockKind::Exclusive
        };
        match lock_kind {
            LockKind::Shared => desc.rwlock.lock_shared(),
            LockKind::Exclusive => desc.rwlock.lock_exclusive(),
            LockKind::None => {}
        }

        if let Err(e) = self.load_into_frame(frame_idx, file, offset, &mode) {
            release_lock(&desc, lock_kind);
            return Err(e);
        }

        desc.refcount.fetch_add(1, Ordering::AcqRel);
        self.touch_lru(frame_idx);

        let from_working = mode.discardable && file.class() != Class::ReadOnly;
        let was_reset = matches!(mode.category, FixCategory::Allocate);
        let working = if from_working {
            // SAFETY: the frame was just loaded (or already resident) and
            // we hold `rwlock` in the mode matching `mode.category`, so no
            // concurrent writer can be mutating `memory` right now.
            let snapshot = unsafe { (*desc.memory.get()).as_ref().expect("frame just loaded").clone() };
            Some(snapshot)
        } else {
            None
        };

        Ok(Memory {
            pool: Arc::downgrade(self),
            frame: frame_idx,
            desc,
            working,
            lock_kind,
            mode,
            was_reset,
            consumed: false,
        })
    }

    fn frame_for(&self, file: &Arc<BufferFile>, offset: u64, key: PageKey) -> DbResult<FrameIndex> {
        if let Some(existing) = self.index.get(&key) {
            return Ok(*existing);
        }
        let candidate = self.allocate_frame(file, offset)?;
        match self.index.entry(key) {
            DashEntry::Occupied(occ) => {
                // Lost the race to another fixer; give the frame back.
                self.discard_frame(candidate);
                Ok(*occ.get())
            }
            DashEntry::Vacant(vac) => {
                vac.insert(candidate);
                Ok(candidate)
            }
        }
    }

    fn allocate_frame(&self, file: &Arc<BufferFile>, offset: u64) -> DbResult<FrameIndex> {
        let mut retries = 0u32;
        loop {
            let mut inner = self.inner.lock();
            let capacity = self.capacity_frames();
            let idx = if let Some(idx) = inner.free.pop() {
                Some(idx)
            } else if inner.arena.len() < capacity {
                inner.arena.push(Frame::empty());
                Some(inner.arena.len() - 1)
            } else {
                None
            };
            let idx = match idx {
                Some(idx) => idx,
                None => {
                    drop(inner);
                    self.stats.record_replace();
                    match self.evict_one() {
                        Ok(idx) => idx,
                        Err(_) if retries < self.retry_allocation_count_max => {
                            retries += 1;
                            self.stats.record_memory_exhausted_retry();
                            // Best-effort: write back some dirty candidates
                            // so the next eviction scan has something to
                            // reclaim that `evict_one` wouldn't otherwise
                            // skip.
                            let _ = self.flush_dirty(false);
                            continue;
                        }
                        Err(e) => return Err(e),
                    }
                }
            };
            let desc = Arc::new(PageDescriptor {
                file: file.clone(),
                offset,
                state: AtomicU8::new(state::EMPTY),
                refcount: AtomicUsize::new(0),
                latch: Mutex::new(()),
                rwlock: PageRwLock::new(),
                memory: UnsafeCell::new(None),
            });
            inner.arena[idx].desc = Some(desc);
            inner.bytes_used += self.page_size;
            return Ok(idx);
        }
    }

    /// Scan from the LRU tail for an evictable frame: refcount zero, its
    /// latch and RW lock both free (a try-lock, so an in-flight loader or
    /// fixer is skipped rather than raced with), and not dirty. Dirty
    /// candidates are skipped, not flushed inline — up to
    /// `SkipDirtyCandidateCountMax` of them; once that budget is
    /// exhausted the scan gives up rather than force a synchronous write
    /// under the pool lock. [`Pool::allocate_frame`]'s retry loop calls
    /// [`Pool::flush_dirty`] between attempts to make room for a
    /// subsequent scan instead.
    fn evict_one(&self) -> DbResult<FrameIndex> {
        let mut inner = self.inner.lock();
        let mut cursor = inner.lru_tail;
        let mut skipped = 0usize;
        while let Some(idx) = cursor {
            let prev = inner.arena[idx].lru_prev;
            let desc = inner.arena[idx].desc.clone();
            if let Some(desc) = desc {
                if desc.refcount.load(Ordering::Acquire) == 0 {
                    let Some(_latch) = desc.latch.try_lock() else {
                        cursor = prev;
                        continue;
                    };
                    if !desc.rwlock.try_lock_exclusive() {
                        cursor = prev;
                        continue;
                    }
                    let is_dirty = desc.state.load(Ordering::Acquire) & state::DIRTY != 0;
                    if is_dirty {
                        desc.rwlock.unlock_exclusive();
                        if skipped >= self.skip_dirty_candidate_count_max {
                            break;
                        }
                        skipped += 1;
                        cursor = prev;
                        continue;
                    }
                    self.unlink_lru_locked(&mut inner, idx);
                    let key = (desc.file.id(), desc.offset);
                    self.index.remove(&key);
                    inner.arena[idx].desc = None;
                    inner.bytes_used = inner.bytes_used.saturating_sub(self.page_size);
                    self.stats.record_evict();
                    return Ok(idx);
                }
            }
            cursor = prev;
        }
        Err(DbError::MemoryExhausted)
    }

    fn discard_frame(&self, idx: FrameIndex) {
        let mut inner = self.inner.lock();
        self.unlink_lru_locked(&mut inner, idx);
        inner.arena[idx].desc = None;
        inner.bytes_used = inner.bytes_used.saturating_sub(self.page_size);
        inner.free.push(idx);
    }

    fn load_into_frame(
        &self,
        frame_idx: FrameIndex,
        file: &Arc<BufferFile>,
        offset: u64,
        mode: &FixMode,
    ) -> DbResult<()> {
        let desc = self.descriptor(frame_idx);
        if desc.state.load(Ordering::Acquire) & state::MASK != state::EMPTY {
            return Ok(());
        }
        let latch = desc.latch.lock();
        if desc.state.load(Ordering::Acquire) & state::MASK != state::EMPTY {
            return Ok(());
        }
        desc.state.store(state::NO_READ, Ordering::Release);
        let loaded = if matches!(mode.category, FixCategory::Allocate) {
            storage::Page::new(file.page_size()).map(|mut p| {
                p.zero_content();
                p
            })
        } else {
            // Read-ahead pulls in the whole containing block with one OS
            // read and opportunistically fills neighboring frames; if that
            // fails (I/O error, corrupt neighbor), fall back to reading
            // just the page this fix actually needs.
            let bytes = match self.read_ahead(file, offset, self.read_ahead_block_size) {
                Ok(bytes) => Ok(bytes),
                Err(_) => {
                    let result = file.read(&self.budget, offset, file.page_size());
                    if result.is_ok() {
                        self.stats.record_read();
                    }
                    result
                }
            };
            bytes
                .and_then(storage::Page::from_raw)
                .and_then(|p| p.verify(self.checks_footer(file), offset, &file.path()).map(|()| p))
        };
        // A failed read or CRC verification must not leave a zombie
        // descriptor behind: it is still indexed under (file, offset) but
        // would never be loaded again (the `state != Empty` short-circuit
        // above skips straight past it), so every later fix of the same
        // page would spin forever waiting for memory that will never
        // arrive. Discard the frame entirely and let the caller retry
        // through a fresh `frame_for`.
        let page = match loaded {
            Ok(page) => page,
            Err(e) => {
                drop(latch);
                let key = (file.id(), offset);
                self.index.remove(&key);
                self.discard_frame(frame_idx);
                return Err(e);
            }
        };
        // SAFETY: `latch` is held, and no fixer can yet observe this frame
        // through anything but the latch-guarded state check above (the
        // caller already holds `rwlock` in the proper mode, but that only
        // governs post-load access; the one-time load itself is
        // serialized by `latch`).
        unsafe {
            *desc.memory.get() = Some(page);
        }
        let flags = if mode.deterrentable { state::DETERRENTABLE } else { 0 };
        desc.state.store(state::NORMAL | flags, Ordering::Release);
        Ok(())
    }

    fn unlink_lru_locked(&self, inner: &mut PoolInner, idx: FrameIndex) {
        let prev = inner.arena[idx].lru_prev;
        let next = inner.arena[idx].lru_next;
        match prev {
            Some(p) => inner.arena[p].lru_next = next,
            None => inner.lru_head = next,
        }
        match next {
            Some(n) => inner.arena[n].lru_prev = prev,
            None => inner.lru_tail = prev,
        }
        inner.arena[idx].lru_prev = None;
        inner.arena[idx].lru_next = None;
    }

    fn touch_lru(&self, idx: FrameIndex) {
        let mut inner = self.inner.lock();
        self.unlink_lru_locked(&mut inner, idx);
        let old_head = inner.lru_head;
        inner.arena[idx].lru_next = old_head;
        inner.arena[idx].lru_prev = None;
        if let Some(h) = old_head {
            inner.arena[h].lru_prev = Some(idx);
        }
        inner.lru_head = Some(idx);
        if inner.lru_tail.is_none() {
            inner.lru_tail = Some(idx);
        }
    }

    /// Link `idx` onto the dirty list and set `Flushable` on its
    /// descriptor, idempotently — a page already linked is left alone.
    fn link_dirty(&self, idx: FrameIndex) {
        let mut inner = self.inner.lock();
        if inner.arena[idx].dirty_linked {
            return;
        }
        let old_tail = inner.dirty_tail;
        inner.arena[idx].dirty_prev = old_tail;
        inner.arena[idx].dirty_next = None;
        if let Some(t) = old_tail {
            inner.arena[t].dirty_next = Some(idx);
        }
        inner.dirty_tail = Some(idx);
        if inner.dirty_head.is_none() {
            inner.dirty_head = Some(idx);
        }
        inner.arena[idx].dirty_linked = true;
        if let Some(desc) = &inner.arena[idx].desc {
            desc.state.fetch_or(state::FLUSHABLE, Ordering::AcqRel);
        }
    }

    /// Unlink `idx` from the dirty list and clear `Flushable`, keeping the
    /// invariant that `Flushable` holds iff the frame is on the dirty
    /// list (§8).
    fn unlink_dirty(&self, idx: FrameIndex) {
        let mut inner = self.inner.lock();
        if !inner.arena[idx].dirty_linked {
            return;
        }
        let prev = inner.arena[idx].dirty_prev;
        let next = inner.arena[idx].dirty_next;
        match prev {
            Some(p) => inner.arena[p].dirty_next = next,
            None => inner.dirty_head = next,
        }
        match next {
            Some(n) => inner.arena[n].dirty_prev = prev,
            None => inner.dirty_tail = prev,
        }
        inner.arena[idx].dirty_prev = None;
        inner.arena[idx].dirty_next = None;
        inner.arena[idx].dirty_linked = false;
        if let Some(desc) = &inner.arena[idx].desc {
            desc.state.fetch_and(!state::FLUSHABLE, Ordering::AcqRel);
        }
    }

    fn commit_working(&self, desc: &PageDescriptor, page: &storage::Page) {
        // SAFETY: only called while the caller holds `rwlock` exclusive
        // (every path that reaches here is a Write/Allocate-category fix
        // promoting its working copy, or a Dirty/Flush unfix on the same
        // fix), so no concurrent reader or writer observes `memory`.
        unsafe {
            *desc.memory.get() = Some(page.clone());
        }
    }

    /// Seal a clone of `content` and write it to `desc`'s file. Does not
    /// touch the descriptor's state bits, the dirty list, or `memory`
    /// itself — callers own that bookkeeping, since the right sequencing
    /// differs between a fixer's own `unfix(Flush)` (which already holds
    /// the RW lock) and the background flusher (which must acquire it).
    fn write_back(&self, desc: &PageDescriptor, content: &storage::Page) -> DbResult<()> {
        let mut sealed = content.clone();
        sealed.seal();
        let bytes = sealed.as_bytes().to_vec();
        desc.file.write(&self.budget, desc.offset, &bytes)?;
        self.stats.record_write();
        self.stats.record_flush();
        Ok(())
    }

    /// Write back one dirty frame with no `Memory` handle involved (the
    /// background dirty-page flusher, explicit `flush_dirty`). Acquires
    /// the frame's latch and RW lock with a try-lock each — a page
    /// currently being loaded or fixed is left on the dirty list for a
    /// later pass rather than blocked on. Returns `Ok(true)` if the page
    /// was actually written, `Ok(false)` if it was left dirty (no longer
    /// dirty, or contended).
    fn flush_frame(&self, idx: FrameIndex) -> DbResult<bool> {
        let desc = {
            let inner = self.inner.lock();
            inner.arena[idx].desc.clone()
        };
        let Some(desc) = desc else { return Ok(false) };
        if desc.state.load(Ordering::Acquire) & state::DIRTY == 0 {
            self.unlink_dirty(idx);
            return Ok(false);
        }
        if desc.state.load(Ordering::Acquire) & state::DETERRENTABLE != 0 && desc.file.is_deterred() {
            return Err(DbError::FlushPrevented(desc.file.path()));
        }
        let Some(_latch) = desc.latch.try_lock() else {
            return Ok(false);
        };
        if !desc.rwlock.try_lock_shared() {
            return Ok(false);
        }
        // SAFETY: shared rwlock held; no concurrent exclusive fixer can be
        // mutating `memory` right now.
        let snapshot = unsafe { (*desc.memory.get()).as_ref().expect("dirty page has backing memory").clone() };
        let result = self.write_back(&desc, &snapshot);
        desc.rwlock.unlock_shared();
        result?;
        desc.state.fetch_and(!(state::DIRTY | state::MARKED), Ordering::AcqRel);
        self.unlink_dirty(idx);
        Ok(true)
    }

    /// Set `Marked` on every currently dirty page, fencing a checkpoint:
    /// only pages dirtied before this call are included in the following
    /// [`Pool::flush_dirty(true)`] pass.
    pub fn mark_dirty(&self) {
        let inner = self.inner.lock();
        let mut cursor = inner.dirty_head;
        while let Some(idx) = cursor {
            if let Some(desc) = &inner.arena[idx].desc {
                desc.state.fetch_or(state::MARKED, Ordering::AcqRel);
            }
            cursor = inner.arena[idx].dirty_next;
        }
    }

    /// Write back dirty pages (optionally only those marked by
    /// [`Pool::mark_dirty`]), up to `FlushingBodyCountMax` per call.
    /// Returns the number of pages actually flushed.
    pub fn flush_dirty(&self, marked_only: bool) -> DbResult<usize> {
        let candidates: Vec<FrameIndex> = {
            let inner = self.inner.lock();
            let mut v = Vec::new();
            let mut cursor = inner.dirty_head;
            while let Some(idx) = cursor {
                if let Some(desc) = &inner.arena[idx].desc {
                    let bits = desc.state.load(Ordering::Acquire);
                    if !marked_only || bits & state::MARKED != 0 {
                        v.push(idx);
                    }
                }
                cursor = inner.arena[idx].dirty_next;
                if v.len() >= self.flushing_body_count_max {
                    break;
                }
            }
            v
        };
        let mut flushed = 0;
        for idx in candidates {
            match self.flush_frame(idx) {
                Ok(true) => flushed += 1,
                Ok(false) => {}
                Err(DbError::FlushPrevented(_)) => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(flushed)
    }

    /// Atomically detach the whole dirty list and flush it, used by the
    /// background dirty-page flusher so newly dirtied pages during the
    /// drain join a future pass instead of extending this one.
    pub fn swap_dirty_list(&self) -> DbResult<usize> {
        let candidates: Vec<FrameIndex> = {
            let mut inner = self.inner.lock();
            let mut v = Vec::new();
            let mut cursor = inner.dirty_head.take();
            inner.dirty_tail = None;
            while let Some(idx) = cursor {
                let next = inner.arena[idx].dirty_next;
                inner.arena[idx].dirty_prev = None;
                inner.arena[idx].dirty_next = None;
                inner.arena[idx].dirty_linked = false;
                if let Some(desc) = &inner.arena[idx].desc {
                    desc.state.fetch_and(!state::FLUSHABLE, Ordering::AcqRel);
                }
                v.push(idx);
                cursor = next;
            }
            v
        };
        let mut flushed = 0;
        for idx in candidates {
            match self.flush_frame(idx) {
                Ok(true) => flushed += 1,
                Ok(false) => {
                    // Contended, or raced with someone else already
                    // clearing Dirty; re-link only if it is genuinely
                    // still dirty so a later pass retries it.
                    let desc = {
                        let inner = self.inner.lock();
                        inner.arena[idx].desc.clone()
                    };
                    if let Some(desc) = desc {
                        if desc.state.load(Ordering::Acquire) & state::DIRTY != 0 {
                            self.link_dirty(idx);
                        }
                    }
                }
                Err(DbError::FlushPrevented(_)) => {
                    // Re-link: the deterrent may clear before the next pass.
                    self.link_dirty(idx);
                }
                Err(e) => return Err(e),
            }
        }
        Ok(flushed)
    }

    /// Drop `(file, offset)` from the pool, provided no one currently
    /// holds it fixed. Used when content is known stale (truncation,
    /// file destruction).
    pub fn discard(&self, file: &Arc<BufferFile>, offset: u64) {
        let key = (file.id(), offset);
        if let Some((_, idx)) = self.index.remove(&key) {
            let refcount = {
                let inner = self.inner.lock();
                inner.arena[idx]
                    .desc
                    .as_ref()
                    .map(|d| d.refcount.load(Ordering::Acquire))
                    .unwrap_or(0)
            };
            if refcount == 0 {
                self.unlink_dirty(idx);
                self.discard_frame(idx);
            } else {
                self.index.insert(key, idx);
            }
        }
    }

    /// Discard every resident page belonging to `file` (file destruction
    /// or unmount).
    pub fn discard_file(&self, file: &Arc<BufferFile>) {
        let keys: Vec<PageKey> = self
            .index
            .iter()
            .filter(|e| e.key().0 == file.id())
            .map(|e| *e.key())
            .collect();
        for (_, offset) in keys {
            self.discard(file, offset);
        }
    }

    /// Read the `ReadAheadBlockSize`-aligned block containing `target_offset`
    /// with a single OS read, populate frames for any neighboring pages in
    /// that block that are not already resident, and return the target
    /// page's own bytes sliced out of the same read. Neighbor population is
    /// best-effort: a neighbor that fails verification or loses the
    /// allocation race is simply dropped, the rest of the block still gets
    /// pulled in, and the target is still returned. The target's own frame
    /// is assumed already present in `self.index` (inserted by the caller's
    /// `frame_for`) and is left for the caller to populate.
    fn read_ahead(&self, file: &Arc<BufferFile>, target_offset: u64, block_size: usize) -> DbResult<Vec<u8>> {
        let page_size = file.page_size();
        let block_size = block_size.max(page_size);
        let block_start = (target_offset / block_size as u64) * block_size as u64;
        let file_size = file.get_size();
        if target_offset + page_size as u64 > file_size {
            return Err(DbError::BadDataPage {
                offset: target_offset,
                path: file.path(),
            });
        }
        let span_end = (block_start + block_size as u64).min(file_size);
        let span_len = (span_end - block_start) as usize;
        let bytes = file.read(&self.budget, block_start, span_len)?;
        self.stats.record_read();

        let mut target_bytes = None;
        for (i, chunk) in bytes.chunks(page_size).enumerate() {
            if chunk.len() != page_size {
                break;
            }
            let offset = block_start + (i * page_size) as u64;
            if offset == target_offset {
                target_bytes = Some(chunk.to_vec());
                continue;
            }
            let key = (file.id(), offset);
            if self.index.contains_key(&key) {
                continue;
            }
            let frame_idx = match self.frame_for(file, offset, key) {
                Ok(idx) => idx,
                Err(_) => continue,
            };
            let desc = self.descriptor(frame_idx);
            if desc.state.load(Ordering::Acquire) & state::MASK == state::EMPTY {
                match storage::Page::from_raw(chunk.to_vec())
                    .and_then(|p| p.verify(self.checks_footer(file), offset, &file.path()).map(|()| p))
                {
                    Ok(page) => {
                        // SAFETY: state is still Empty and no fixer holds
                        // this frame's rwlock yet (it was just allocated
                        // by `frame_for` above), so nothing else observes
                        // `memory` concurrently.
                        unsafe {
                            *desc.memory.get() = Some(page);
                        }
                        desc.state.store(state::NORMAL, Ordering::Release);
                        self.touch_lru(frame_idx);
                    }
                    Err(_) => {
                        self.index.remove(&key);
                        self.discard_frame(frame_idx);
                    }
                }
            }
        }
        target_bytes.ok_or(DbError::BadDataPage {
            offset: target_offset,
            path: file.path(),
        })
    }

    /// Evict resident pages with no outstanding fixes until at most
    /// `target_bytes` remain, used for idle trimming
    /// (`KeepingUsedMemoryTimeMax`).
    pub fn shrink(&self, target_bytes: usize) -> usize {
        let mut evicted = 0;
        loop {
            if self.resident_bytes() <= target_bytes {
                break;
            }
            match self.evict_one() {
                Ok(idx) => {
                    self.inner.lock().free.push(idx);
                    evicted += 1;
                }
                Err(_) => break,
            }
        }
        evicted
    }
}

/// A fixed page's content, on loan from its [`Pool`] until dropped or
/// explicitly released with [`Memory::unfix`].
pub struct Memory {
    pool: Weak<Pool>,
    frame: FrameIndex,
    desc: Arc<PageDescriptor>,
    /// Private copy for a `discardable` fix; mutations land here until
    /// `touch`/`unfix(Dirty)` commits them into the canonical buffer.
    working: Option<storage::Page>,
    lock_kind: LockKind,
    mode: FixMode,
    was_reset: bool,
    consumed: bool,
}

impl Memory {
    /// A read-only view of this fix's current content: the working copy
    /// for a discardable fix, otherwise the canonical buffer directly.
    fn snapshot(&self) -> storage::Page {
        if let Some(working) = &self.working {
            working.clone()
        } else {
            // SAFETY: `self.lock_kind` is held (shared or exclusive) for
            // the whole lifetime of this `Memory`, so no concurrent
            // exclusive fixer can be mutating `memory` underneath us.
            unsafe { (*self.desc.memory.get()).as_ref().expect("loaded before fix returns").clone() }
        }
    }

    pub fn content(&self) -> &[u8] {
        if let Some(working) = &self.working {
            return working.content();
        }
        // SAFETY: see `snapshot`.
        unsafe { (*self.desc.memory.get()).as_ref().expect("loaded before fix returns").content() }
    }

    pub fn content_mut(&mut self) -> &mut [u8] {
        assert!(
            !matches!(self.mode.category, FixCategory::ReadOnly),
            "content_mut called on a page fixed ReadOnly"
        );
        if let Some(working) = &mut self.working {
            return working.content_mut();
        }
        // SAFETY: `mode.category` is Write or Allocate, so `lock_kind` is
        // `Exclusive` (unless `no_lock`, whose contract hands that
        // guarantee to the caller instead) — no concurrent reader or
        // writer observes `memory` while we hold `&mut self`.
        unsafe { (*self.desc.memory.get()).as_mut().expect("loaded before fix returns").content_mut() }
    }

    pub fn size(&self) -> usize {
        if let Some(working) = &self.working {
            return working.content_size();
        }
        // SAFETY: see `snapshot`.
        unsafe { (*self.desc.memory.get()).as_ref().expect("loaded before fix returns").content_size() }
    }

    pub fn category(&self) -> FixCategory {
        self.mode.category
    }

    /// Whether this fix allocated fresh, zeroed content rather than
    /// reading it from disk.
    pub fn was_reset(&self) -> bool {
        self.was_reset
    }

    /// Promote the current content (working copy or not) into the
    /// canonical buffer and mark the page dirty, without releasing the
    /// fix. Equivalent to `unfix(Dirty)` followed by an immediate re-fix.
    pub fn touch(&mut self) {
        let Some(pool) = self.pool.upgrade() else { return };
        let page = self.snapshot();
        pool.commit_working(&self.desc, &page);
        self.desc.state.fetch_or(state::DIRTY, Ordering::AcqRel);
        pool.link_dirty(self.frame);
    }

    pub fn unfix(mut self, mode: UnfixMode) -> DbResult<()> {
        self.unfix_inner(mode)
    }

    fn unfix_inner(&mut self, mode: UnfixMode) -> DbResult<()> {
        if self.consumed {
            return Ok(());
        }
        self.consumed = true;
        let Some(pool) = self.pool.upgrade() else { return Ok(()) };
        let result = match mode {
            UnfixMode::None => Ok(()),
            UnfixMode::Dirty => {
                let page = self.snapshot();
                pool.commit_working(&self.desc, &page);
                self.desc.state.fetch_or(state::DIRTY, Ordering::AcqRel);
                pool.link_dirty(self.frame);
                Ok(())
            }
            UnfixMode::Flush => {
                if self.desc.state.load(Ordering::Acquire) & state::DETERRENTABLE != 0 && self.desc.file.is_deterred() {
                    Err(DbError::FlushPrevented(self.desc.file.path()))
                } else {
                    let page = self.snapshot();
                    pool.commit_working(&self.desc, &page);
                    match pool.write_back(&self.desc, &page) {
                        Ok(()) => {
                            self.desc
                                .state
                                .fetch_and(!(state::DIRTY | state::MARKED), Ordering::AcqRel);
                            pool.unlink_dirty(self.frame);
                            Ok(())
                        }
                        Err(e) => {
                            self.desc.state.fetch_or(state::DIRTY, Ordering::AcqRel);
                            pool.link_dirty(self.frame);
                            Err(e)
                        }
                    }
                }
            }
        };
        release_lock(&self.desc, self.lock_kind);
        pool.stats.record_unfix();
        self.desc.refcount.fetch_sub(1, Ordering::AcqRel);
        result
    }
}

impl Drop for Memory {
    fn drop(&mut self) {
        if !self.consumed {
            let _ = self.unfix_inner(UnfixMode::None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn make_pool(limit_bytes: usize) -> (Arc<Pool>, Arc<DescriptorBudget>, Arc<Statistics>) {
        let stats = Statistics::new();
        let budget = Arc::new(DescriptorBudget::new(64, stats.clone()));
        let pool = Pool::new(
            Class::Normal,
            4096,
            limit_bytes,
            budget.clone(),
            stats.clone(),
            ChecksumMode::All,
            500,
            8000,
            64 * 1024,
            3,
            64,
        );
        (pool, budget, stats)
    }

    fn make_file(budget: &Arc<DescriptorBudget>, dir: &tempfile::TempDir, id: u64) -> Arc<BufferFile> {
        let path = dir.path().join(format!("f{id}.dat"));
        let file = BufferFile::new(FileId(id), Class::Normal, path, 4096, false, false, false, 0o600);
        file.create(true, budget).unwrap();
        file
    }

    #[test]
    fn fix_allocate_then_unfix_dirty_then_refix_sees_content() {
        let dir = tempdir().unwrap();
        let (pool, budget, _stats) = make_pool(64 * 4096);
        let file = make_file(&budget, &dir, 1);
        file.extend(&budget, 4096).unwrap();

        let mut mem = pool.fix(&file, 0, FixMode::allocate()).unwrap();
        assert!(mem.was_reset());
        mem.content_mut()[0] = 42;
        mem.unfix(UnfixMode::Dirty).unwrap();

        let mem2 = pool.fix(&file, 0, FixMode::read_only()).unwrap();
        assert_eq!(mem2.content()[0], 42);
        mem2.unfix(UnfixMode::None).unwrap();
    }

    #[test]
    fn flush_dirty_writes_back_and_clears_dirty_state() {
        let dir = tempdir().unwrap();
        let (pool, budget, stats) = make_pool(64 * 4096);
        let file = make_file(&budget, &dir, 2);
        file.extend(&budget, 4096).unwrap();

        let mut mem = pool.fix(&file, 0, FixMode::allocate()).unwrap();
        mem.content_mut()[0] = 7;
        mem.unfix(UnfixMode::Dirty).unwrap();

        let flushed = pool.flush_dirty(false).unwrap();
        assert_eq!(flushed, 1);
        assert!(stats.snapshot().write_count >= 1);

        let bytes = file.read(&budget, 0, 4096).unwrap();
        let page = storage::Page::from_raw(bytes).unwrap();
        assert!(page.is_calculated());
        assert_eq!(page.content()[0], 7);
    }

    #[test]
    fn discardable_fix_does_not_mutate_canonical_until_touch() {
        let dir = tempdir().unwrap();
        let (pool, budget, _stats) = make_pool(64 * 4096);
        let file = make_file(&budget, &dir, 3);
        file.extend(&budget, 4096).unwrap();

        pool.fix(&file, 0, FixMode::allocate()).unwrap().unfix(UnfixMode::Dirty).unwrap();
        pool.flush_dirty(false).unwrap();

        let mut working = pool.fix(&file, 0, FixMode::write().discardable()).unwrap();
        working.content_mut()[0] = 99;
        working.unfix(UnfixMode::None).unwrap();

        let check = pool.fix(&file, 0, FixMode::read_only()).unwrap();
        assert_eq!(check.content()[0], 0);
        check.unfix(UnfixMode::None).unwrap();
    }

    #[test]
    fn eviction_skips_pinned_frames_and_reclaims_unpinned_ones() {
        let dir = tempdir().unwrap();
        let (pool, budget, _stats) = make_pool(2 * 4096);
        let file = make_file(&budget, &dir, 4);
        file.extend(&budget, 3 * 4096).unwrap();

        let held = pool.fix(&file, 0, FixMode::allocate()).unwrap();
        pool.fix(&file, 4096, FixMode::allocate()).unwrap().unfix(UnfixMode::None).unwrap();
        // A third distinct page forces eviction of the unpinned one.
        let third = pool.fix(&file, 2 * 4096, FixMode::allocate()).unwrap();
        third.unfix(UnfixMode::None).unwrap();
        held.unfix(UnfixMode::None).unwrap();
    }

    #[test]
    fn memory_exhausted_when_every_frame_is_pinned() {
        let dir = tempdir().unwrap();
        let (pool, budget, _stats) = make_pool(1 * 4096);
        let file = make_file(&budget, &dir, 5);
        file.extend(&budget, 2 * 4096).unwrap();

        let _held = pool.fix(&file, 0, FixMode::allocate()).unwrap();
        let err = pool.fix(&file, 4096, FixMode::allocate());
        assert!(matches!(err, Err(DbError::MemoryExhausted)));
    }

    #[test]
    fn checkpoint_flushes_only_pages_dirty_before_the_mark() {
        let dir = tempdir().unwrap();
        let (pool, budget, _stats) = make_pool(64 * 4096);
        let file = make_file(&budget, &dir, 11);
        file.extend(&budget, 5 * 4096).unwrap();

        for i in 0..4u64 {
            let mut mem = pool.fix(&file, i * 4096, FixMode::allocate()).unwrap();
            mem.content_mut()[0] = i as u8 + 1;
            mem.unfix(UnfixMode::Dirty).unwrap();
        }

        pool.mark_dirty();

        let mut mem = pool.fix(&file, 4 * 4096, FixMode::allocate()).unwrap();
        mem.content_mut()[0] = 99;
        mem.unfix(UnfixMode::Dirty).unwrap();

        let flushed = pool.flush_dirty(true).unwrap();
        assert_eq!(flushed, 4);

        for i in 0..4u64 {
            let bytes = file.read(&budget, i * 4096, 4096).unwrap();
            let page = storage::Page::from_raw(bytes).unwrap();
            assert_eq!(page.content()[0], i as u8 + 1);
        }

        // Page 4 was dirtied after the mark; it is still Dirty in memory
        // and must not have been written back by the marked-only pass.
        let frame_idx = *pool.index.get(&(file.id(), 4 * 4096)).unwrap();
        let pinned = pool.descriptor(frame_idx);
        assert!(pinned.state.load(Ordering::Acquire) & state::DIRTY != 0);
        let on_disk = file.read(&budget, 4 * 4096, 4096).unwrap();
        assert!(on_disk.iter().all(|b| *b == 0));
    }

    #[test]
    fn dirty_list_membership_tracks_the_flushable_bit() {
        let dir = tempdir().unwrap();
        let (pool, budget, _stats) = make_pool(64 * 4096);
        let file = make_file(&budget, &dir, 12);
        file.extend(&budget, 4096).unwrap();

        let mut mem = pool.fix(&file, 0, FixMode::allocate()).unwrap();
        mem.content_mut()[0] = 1;
        mem.unfix(UnfixMode::Dirty).unwrap();

        let frame_idx = *pool.index.get(&(file.id(), 0)).unwrap();
        let desc = pool.descriptor(frame_idx);
        assert!(desc.state.load(Ordering::Acquire) & state::FLUSHABLE != 0);

        pool.flush_dirty(false).unwrap();
        assert!(desc.state.load(Ordering::Acquire) & state::FLUSHABLE == 0);
    }

    #[test]
    fn two_readonly_fixes_of_the_same_page_coexist() {
        let dir = tempdir().unwrap();
        let (pool, budget, _stats) = make_pool(64 * 4096);
        let file = make_file(&budget, &dir, 20);
        file.extend(&budget, 4096).unwrap();
        pool.fix(&file, 0, FixMode::allocate()).unwrap().unfix(UnfixMode::Flush).unwrap();
        pool.discard_file(&file);

        let first = pool.fix(&file, 0, FixMode::read_only()).unwrap();
        // Previously the second concurrent ReadOnly fix of the same
        // resident page would spin forever behind the first one's hold.
        let second = pool.fix(&file, 0, FixMode::read_only()).unwrap();
        assert_eq!(first.content(), second.content());
        first.unfix(UnfixMode::None).unwrap();
        second.unfix(UnfixMode::None).unwrap();
    }

    #[test]
    fn write_fix_waits_for_read_fix_to_release() {
        use std::sync::atomic::AtomicBool;

        let dir = tempdir().unwrap();
        let (pool, budget, _stats) = make_pool(64 * 4096);
        let file = make_file(&budget, &dir, 21);
        file.extend(&budget, 4096).unwrap();
        pool.fix(&file, 0, FixMode::allocate()).unwrap().unfix(UnfixMode::Flush).unwrap();
        pool.discard_file(&file);

        let reader = pool.fix(&file, 0, FixMode::read_only()).unwrap();
        let writer_started = Arc::new(AtomicBool::new(false));
        let writer_finished = Arc::new(AtomicBool::new(false));

        let pool2 = pool.clone();
        let file2 = file.clone();
        let started = writer_started.clone();
        let finished = writer_finished.clone();
        let handle = std::thread::spawn(move || {
            started.store(true, Ordering::SeqCst);
            let mut mem = pool2.fix(&file2, 0, FixMode::write()).unwrap();
            mem.content_mut()[0] = 1;
            mem.unfix(UnfixMode::Dirty).unwrap();
            finished.store(true, Ordering::SeqCst);
        });

        while !writer_started.load(Ordering::SeqCst) {
            std::thread::yield_now();
        }
        std::thread::sleep(std::time::Duration::from_millis(100));
        assert!(!writer_finished.load(Ordering::SeqCst), "writer must block while the reader still holds the page");

        reader.unfix(UnfixMode::None).unwrap();
        handle.join().unwrap();
        assert!(writer_finished.load(Ordering::SeqCst));
    }

    #[test]
    fn deterrent_prevents_flush_until_ended() {
        let dir = tempdir().unwrap();
        let (pool, budget, _stats) = make_pool(64 * 4096);
        let file = make_file(&budget, &dir, 6);
        file.extend(&budget, 4096).unwrap();

        file.start_deterrent();
        let mut mem = pool.fix(&file, 0, FixMode::allocate().deterrentable()).unwrap();
        mem.content_mut()[0] = 1;
        mem.unfix(UnfixMode::Dirty).unwrap();

        let flushed = pool.flush_dirty(false).unwrap();
        assert_eq!(flushed, 0);

        file.end_deterrent();
        let flushed = pool.flush_dirty(false).unwrap();
        assert_eq!(flushed, 1);
    }

    #[test]
    fn discard_removes_unpinned_page_from_index() {
        let dir = tempdir().unwrap();
        let (pool, budget, _stats) = make_pool(64 * 4096);
        let file = make_file(&budget, &dir, 7);
        file.extend(&budget, 4096).unwrap();

        pool.fix(&file, 0, FixMode::allocate()).unwrap().unfix(UnfixMode::None).unwrap();
        pool.discard(&file, 0);
        assert!(!pool.index.contains_key(&(file.id(), 0)));
    }

    #[test]
    fn read_ahead_pulls_in_the_whole_block_with_one_os_read() {
        let dir = tempdir().unwrap();
        let (pool, budget, stats) = make_pool(64 * 4096);
        let file = make_file(&budget, &dir, 8);
        const PAGES: u64 = 16;
        file.extend(&budget, PAGES * 4096).unwrap();

        // Write distinct content into every page and flush, then discard
        // the whole file from the pool so the next fixes take the Read
        // path instead of finding already-resident frames.
        for i in 0..PAGES {
            let mut mem = pool.fix(&file, i * 4096, FixMode::allocate()).unwrap();
            mem.content_mut()[0] = i as u8;
            mem.unfix(UnfixMode::Flush).unwrap();
        }
        pool.discard_file(&file);

        let reads_before = stats.snapshot().read_count;
        for i in 0..PAGES {
            let mem = pool.fix(&file, i * 4096, FixMode::read_only()).unwrap();
            assert_eq!(mem.content()[0], i as u8);
            mem.unfix(UnfixMode::None).unwrap();
        }
        let reads_after = stats.snapshot().read_count;
        // 16 pages * 4096 bytes = 1 read-ahead block (64 KiB default), so
        // the first fix should pull every neighbor in with it.
        assert_eq!(reads_after - reads_before, 1);
    }

    #[test]
    fn corrupted_footer_fails_with_bad_data_page() {
        use std::io::{Seek, SeekFrom, Write};

        let dir = tempdir().unwrap();
        let (pool, budget, _stats) = make_pool(64 * 4096);
        let file = make_file(&budget, &dir, 10);
        file.extend(&budget, 4096).unwrap();

        pool.fix(&file, 0, FixMode::allocate())
            .unwrap()
            .unfix(UnfixMode::Flush)
            .unwrap();
        pool.discard_file(&file);

        // Flip one content byte on disk without going through the pool.
        let mut raw = std::fs::OpenOptions::new().write(true).open(file.path()).unwrap();
        raw.seek(SeekFrom::Start(20)).unwrap();
        raw.write_all(&[0xFF]).unwrap();
        drop(raw);

        let err = pool.fix(&file, 0, FixMode::read_only());
        assert!(matches!(err, Err(DbError::BadDataPage { offset: 0, .. })));
    }

    #[test]
    fn read_ahead_handles_a_file_shorter_than_one_block() {
        let dir = tempdir().unwrap();
        let (pool, budget, _stats) = make_pool(64 * 4096);
        let file = make_file(&budget, &dir, 9);
        file.extend(&budget, 4096).unwrap();

        pool.fix(&file, 0, FixMode::allocate())
            .unwrap()
            .unfix(UnfixMode::Flush)
            .unwrap();
        pool.discard_file(&file);

        let mem = pool.fix(&file, 0, FixMode::read_only()).unwrap();
        assert_eq!(mem.content().len(), 4096 - storage::OVERHEAD);
        mem.unfix(UnfixMode::None).unwrap();
    }

    use proptest::prelude::*;

    proptest! {
        // Invariant 2 (§8): the pool's resident byte count always equals
        // the number of occupied frames times the page size, and never
        // exceeds the configured limit, no matter what order a random
        // sequence of fixes and unfixes touches a small shared set of
        // pages in.
        #[test]
        fn resident_bytes_always_matches_occupied_frames(
            ops in prop::collection::vec((0u64..6, any::<bool>()), 1..60)
        ) {
            let dir = tempdir().unwrap();
            let (pool, budget, _stats) = make_pool(4 * 4096);
            let file = make_file(&budget, &dir, 1000);
            file.extend(&budget, 6 * 4096).unwrap();

            for (page, allocate) in ops {
                let offset = page * 4096;
                let mode = if allocate { FixMode::allocate() } else { FixMode::read_only() };
                if let Ok(mem) = pool.fix(&file, offset, mode) {
                    let unfix_mode = if allocate { UnfixMode::Dirty } else { UnfixMode::None };
                    let _ = mem.unfix(unfix_mode);
                }
            }

            let inner = pool.inner.lock();
            let occupied = inner.arena.iter().filter(|f| f.desc.is_some()).count();
            prop_assert_eq!(occupied * pool.page_size, inner.bytes_used);
            prop_assert!(inner.bytes_used <= pool.limit_bytes);
        }
    }
}
