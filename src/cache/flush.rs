// # Dirty & Flush Engine
//
// Mark/unmark dirty, single-view write-back, the bulk flush loop the lazy
// writer and trim both drive, and range flush. Write-back callouts never
// run under the global list mutex: the loop takes a hold, drops the lock,
// calls out, reacquires, drops the hold, and restarts traversal because
// the list may have changed underneath.

use crate::cache::filemap::FileMap;
use crate::cache::root::{touch_lru, unlink_view, view_align_down, CacheRoot};
use crate::cache::view::View;
use crate::error::{CacheError, Result};
use crate::mem::{PAGES_PER_VIEW, VIEW_SIZE};
use crossbeam::channel::{bounded, RecvTimeoutError, Sender};
use std::collections::HashSet;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::{debug, warn};

/// Expected references on an idle dirty view under a flush hold: map
/// membership + dirty list + the hold itself. Anything above means the
/// view is in active use and the flush loop skips it.
const FLUSH_IDLE_REFS: u32 = 3;

impl CacheRoot {
    /// Dirty a view: dirty-list membership (with its reference), both
    /// dirty-page counters, LRU touch. The transition is check-and-set
    /// under the list mutex, so a release racing another release is a
    /// benign no-op. Wakes the lazy writer.
    pub(crate) fn mark_dirty(&self, map: &Arc<FileMap>, view: &Arc<View>) {
        {
            let mut lists = self.lists.lock();
            if view.swap_dirty(true) {
                return; // already dirty
            }
            view.add_ref(); // the dirty list's reference
            lists.dirty.push(view.clone());
            touch_lru(&mut lists.lru, view);
            self.dirty_pages
                .fetch_add(PAGES_PER_VIEW as u64, Ordering::AcqRel);
            map.add_dirty_pages(PAGES_PER_VIEW as u64);
        }
        self.kick_lazy_writer();
    }

    /// Undo `mark_dirty`. Tolerates a concurrent flush having gotten
    /// there first (the loser returns without touching the reference).
    pub(crate) fn unmark_dirty(&self, map: &Arc<FileMap>, view: &Arc<View>) {
        {
            let mut lists = self.lists.lock();
            if !view.swap_dirty(false) {
                return;
            }
            let present = unlink_view(&mut lists.dirty, view);
            debug_assert!(present, "dirty view missing from the dirty list");
            self.dirty_pages
                .fetch_sub(PAGES_PER_VIEW as u64, Ordering::AcqRel);
            map.sub_dirty_pages(PAGES_PER_VIEW as u64);
        }
        view.release_ref();
    }

    /// Write one view back through the filesystem callback. Success
    /// unmarks it; failure leaves it dirty and reports the error.
    pub(crate) fn flush_one(&self, map: &Arc<FileMap>, view: &Arc<View>) -> Result<()> {
        // SAFETY: flush callers serialize against writers (lazy-write lock
        // or exclusive use), so the mapping is stable for the callout.
        let bytes = unsafe { view.bytes() };
        match map.backing().write_back(view.file_offset(), bytes) {
            Ok(()) => {
                self.unmark_dirty(map, view);
                self.pages_flushed
                    .fetch_add(PAGES_PER_VIEW as u64, Ordering::Relaxed);
                Ok(())
            }
            Err(e) => {
                self.flush_failures.fetch_add(1, Ordering::Relaxed);
                Err(e)
            }
        }
    }

    /// Write dirty views head-first until `target_pages` are written or
    /// the list is exhausted. Returns the pages considered written
    /// (successes plus end-of-file / write-protected failures).
    ///
    /// Per-candidate: take the flush hold while the view is still on the
    /// dirty list; skip temporary files when `from_lazy`; skip when the
    /// lazy-write acquisition would block and `wait` is false; skip views
    /// in active use; call out with no global lock held; restart the
    /// traversal afterwards (bounded by the attempted set).
    pub fn flush_dirty(&self, target_pages: u64, wait: bool, from_lazy: bool) -> u64 {
        if from_lazy {
            self.lazy_scan_active.store(true, Ordering::Release);
        }

        let mut written = 0u64;
        let mut attempted: HashSet<usize> = HashSet::new();
        while written < target_pages {
            // Pick the first not-yet-attempted candidate and take the
            // flush hold under the lock, while the dirty list still
            // guarantees the view is live.
            let candidate = {
                let lists = self.lists.lock();
                lists
                    .dirty
                    .iter()
                    .find(|v| !attempted.contains(&(Arc::as_ptr(v) as usize)))
                    .map(|v| {
                        v.add_ref();
                        v.clone()
                    })
            };
            let Some(view) = candidate else { break };
            attempted.insert(Arc::as_ptr(&view) as usize);

            let Some(map) = view.owner() else {
                view.release_ref();
                continue;
            };
            if from_lazy && map.backing().is_temporary() {
                view.release_ref();
                continue;
            }
            if !map.backing().acquire_for_lazy_write(wait) {
                // WouldBlock in non-wait mode: skip, never abort.
                view.release_ref();
                continue;
            }
            if view.ref_count() > FLUSH_IDLE_REFS || !view.is_dirty() {
                map.backing().release_from_lazy_write();
                view.release_ref();
                continue;
            }

            let result = self.flush_one(&map, &view);
            map.backing().release_from_lazy_write();
            view.release_ref();

            match result {
                Ok(()) => written += PAGES_PER_VIEW as u64,
                Err(e) if e.is_terminal_write() => {
                    // Non-retriable but non-fatal: counts toward the
                    // target so the loop terminates, view stays dirty.
                    debug!(offset = view.file_offset(), error = %e, "write-back hit file end");
                    written += PAGES_PER_VIEW as u64;
                }
                Err(e) => {
                    warn!(offset = view.file_offset(), error = %e, "write-back failed; view stays dirty");
                }
            }
        }

        if from_lazy {
            self.lazy_scan_active.store(false, Ordering::Release);
        }
        written
    }

    /// Flush every dirty view overlapping `[off, off + len)`. The first
    /// error is reported; later ones are logged and dropped.
    pub(crate) fn flush_range(&self, map: &Arc<FileMap>, off: u64, len: u64) -> Result<()> {
        let mut first_err: Option<CacheError> = None;
        let end = off.saturating_add(len);
        let mut bucket = view_align_down(off);
        while bucket < end {
            if let Some(view) = map.lookup(bucket) {
                if view.is_dirty() {
                    if let Err(e) = self.flush_one(map, &view) {
                        warn!(file = map.file(), bucket, error = %e, "range flush bucket failed");
                        if first_err.is_none() {
                            first_err = Some(e);
                        }
                    }
                }
                let valid = view.is_valid();
                self.release_view(map, &view, valid, false, false);
            }
            bucket += VIEW_SIZE as u64;
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

// ============================================================================
// Lazy writer
// ============================================================================

/// Spawn the lazy writer: a worker that flushes an eighth of the dirty
/// pages per pass, woken by mark-dirty and by its interval tick. Dropping
/// the sender shuts it down.
pub(crate) fn spawn_lazy_writer(root: &Arc<CacheRoot>) -> (Sender<()>, JoinHandle<()>) {
    let (tx, rx) = bounded::<()>(1);
    let weak = Arc::downgrade(root);
    let interval = root.config.lazy_write_interval;
    let handle = std::thread::Builder::new()
        .name("viewcache-lazy".into())
        .spawn(move || loop {
            match rx.recv_timeout(interval) {
                Ok(()) | Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }
            let Some(root) = weak.upgrade() else { break };
            let dirty = root.dirty_pages();
            if dirty == 0 {
                continue;
            }
            let target = (dirty / 8).max(PAGES_PER_VIEW as u64);
            let written = root.flush_dirty(target, false, true);
            debug!(dirty, target, written, "lazy writer pass");
        })
        .expect("failed to spawn the lazy writer");
    (tx, handle)
}
