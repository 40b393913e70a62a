// # Cache Root - Global Registry and View State Machine
//
// The explicit root value every operation threads through: the file-map
// registry, the global LRU and dirty lists, the dirty-page counter and
// threshold, and the lazy-writer plumbing. Subsystem init builds it,
// shutdown consumes it.
//
// Lock order, strict: registry mutex -> global list mutex -> per-map view
// list -> per-view atomics. No filesystem or provider callout runs under
// the first two; the protocol is take hold, drop mutex, call out,
// reacquire, drop hold.

use crate::cache::filemap::{FileBacking, FileId, FileMap, ReadAheadState};
use crate::cache::view::{View, ViewGuard};
use crate::error::{CacheError, Result};
use crate::mem::{PageProvider, ReclaimHook, TrimPriority, VIEW_SIZE};
use crossbeam::channel::Sender;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, trace, warn};

/// Round an offset down to its view boundary.
#[inline(always)]
pub(crate) fn view_align_down(off: u64) -> u64 {
    off & !(VIEW_SIZE as u64 - 1)
}

// ============================================================================
// Configuration
// ============================================================================

/// Cache-wide configuration.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Dirty-page count above which producers should throttle. The cache
    /// only exposes it; throttling is the producer's job.
    pub dirty_page_threshold: u64,

    /// Run the lazy writer thread.
    pub enable_lazy_writer: bool,

    /// Lazy writer pass interval (it is also woken on demand by
    /// mark-dirty).
    pub lazy_write_interval: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            dirty_page_threshold: 4096,
            enable_lazy_writer: true,
            lazy_write_interval: Duration::from_secs(1),
        }
    }
}

// ============================================================================
// Statistics
// ============================================================================

/// Point-in-time cache statistics.
#[derive(Debug, Clone, Default)]
pub struct CacheStats {
    pub maps: usize,
    pub views: usize,
    pub lru_entries: usize,
    pub dirty_entries: usize,
    pub dirty_pages: u64,
    pub resident_pages: u64,
    pub lookups: u64,
    pub hits: u64,
    pub misses: u64,
    pub views_created: u64,
    pub views_recycled: u64,
    pub pages_flushed: u64,
    pub flush_failures: u64,
    pub trim_runs: u64,
    pub pages_reclaimed: u64,
}

// ============================================================================
// Global lists
// ============================================================================

/// LRU (MRU at tail) and FIFO dirty list, guarded together.
#[derive(Default)]
pub(crate) struct GlobalLists {
    pub(crate) lru: Vec<Arc<View>>,
    pub(crate) dirty: Vec<Arc<View>>,
}

/// Unlink by identity. Returns whether the view was present.
pub(crate) fn unlink_view(list: &mut Vec<Arc<View>>, view: &Arc<View>) -> bool {
    match list.iter().position(|v| Arc::ptr_eq(v, view)) {
        Some(pos) => {
            list.remove(pos);
            true
        }
        None => false,
    }
}

/// Move to the MRU end, appending if absent.
pub(crate) fn touch_lru(lru: &mut Vec<Arc<View>>, view: &Arc<View>) {
    unlink_view(lru, view);
    lru.push(view.clone());
}

// ============================================================================
// Cache root
// ============================================================================

pub struct CacheRoot {
    pub(crate) provider: Arc<dyn PageProvider>,
    pub(crate) config: CacheConfig,

    /// File-map registry.
    maps: Mutex<HashMap<FileId, Arc<FileMap>>>,

    /// Global LRU + dirty list.
    pub(crate) lists: Mutex<GlobalLists>,

    /// Dirty pages across all maps.
    pub(crate) dirty_pages: AtomicU64,

    /// Runtime-mutable producer throttle input.
    dirty_threshold: AtomicU64,

    /// Set while a lazy pass runs, so mark-dirty does not re-kick it.
    pub(crate) lazy_scan_active: AtomicBool,

    lazy_tx: Mutex<Option<Sender<()>>>,
    lazy_handle: Mutex<Option<JoinHandle<()>>>,

    // Statistics
    pub(crate) lookups: AtomicU64,
    pub(crate) hits: AtomicU64,
    pub(crate) misses: AtomicU64,
    pub(crate) views_created: AtomicU64,
    pub(crate) views_recycled: AtomicU64,
    pub(crate) pages_flushed: AtomicU64,
    pub(crate) flush_failures: AtomicU64,
    pub(crate) trim_runs: AtomicU64,
    pub(crate) pages_reclaimed: AtomicU64,
}

impl CacheRoot {
    /// Build the subsystem around a page provider. Spawns the lazy writer
    /// when configured.
    pub fn new(provider: Arc<dyn PageProvider>, config: CacheConfig) -> Arc<Self> {
        let dirty_threshold = config.dirty_page_threshold;
        let enable_lazy = config.enable_lazy_writer;
        let root = Arc::new(Self {
            provider,
            config,
            maps: Mutex::new(HashMap::new()),
            lists: Mutex::new(GlobalLists::default()),
            dirty_pages: AtomicU64::new(0),
            dirty_threshold: AtomicU64::new(dirty_threshold),
            lazy_scan_active: AtomicBool::new(false),
            lazy_tx: Mutex::new(None),
            lazy_handle: Mutex::new(None),
            lookups: AtomicU64::new(0),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            views_created: AtomicU64::new(0),
            views_recycled: AtomicU64::new(0),
            pages_flushed: AtomicU64::new(0),
            flush_failures: AtomicU64::new(0),
            trim_runs: AtomicU64::new(0),
            pages_reclaimed: AtomicU64::new(0),
        });
        if enable_lazy {
            let (tx, handle) = crate::cache::flush::spawn_lazy_writer(&root);
            *root.lazy_tx.lock() = Some(tx);
            *root.lazy_handle.lock() = Some(handle);
        }
        root
    }

    /// Stop and join the lazy writer. Safe to call more than once; `Drop`
    /// is the safety net.
    pub fn shutdown(&self) {
        self.lazy_tx.lock().take();
        let handle = self.lazy_handle.lock().take();
        if let Some(handle) = handle {
            if handle.thread().id() != std::thread::current().id() {
                let _ = handle.join();
            }
        }
    }

    /// Wake the lazy writer unless it is already scanning.
    pub(crate) fn kick_lazy_writer(&self) {
        if self.lazy_scan_active.load(Ordering::Acquire) {
            return;
        }
        if let Some(tx) = self.lazy_tx.lock().as_ref() {
            let _ = tx.try_send(());
        }
    }

    // ------------------------------------------------------------------
    // Per-file map lifecycle
    // ------------------------------------------------------------------

    /// Attach a handle to `file`'s shared map, creating and registering
    /// the map on first open. The returned handle owns a private
    /// read-ahead block and one unit of the map's open count.
    pub fn init_file_cache(
        self: &Arc<Self>,
        file: FileId,
        file_size: u64,
        section_size: u64,
        pin_access: bool,
        backing: Arc<dyn FileBacking>,
    ) -> Result<CacheHandle> {
        if section_size == 0 {
            return Err(CacheError::InvalidParameter("zero section size"));
        }
        if file_size > section_size {
            return Err(CacheError::InvalidParameter("file size beyond section size"));
        }

        let map = {
            let mut maps = self.maps.lock();
            let map = maps
                .entry(file)
                .or_insert_with(|| FileMap::new(file, file_size, section_size, pin_access, backing))
                .clone();
            map.increment_open();
            map
        };
        let private = map.attach_private();
        debug!(file, opens = map.open_count(), "file cache initialized");
        Ok(CacheHandle {
            root: self.clone(),
            map,
            private,
            closed: false,
        })
    }

    /// Bump a file's open count directly (the cache-root primitive under
    /// handle attach).
    pub fn reference_cache(&self, file: FileId) -> Result<()> {
        let maps = self.maps.lock();
        let map = maps.get(&file).ok_or(CacheError::NotFound(file))?;
        map.increment_open();
        Ok(())
    }

    /// Drop one unit of a file's open count; the last one tears the map
    /// down.
    pub fn dereference_cache(self: &Arc<Self>, file: FileId) -> Result<()> {
        let map = {
            let maps = self.maps.lock();
            maps.get(&file).ok_or(CacheError::NotFound(file))?.clone()
        };
        if map.decrement_open() == 0 {
            self.teardown_map(map);
        }
        Ok(())
    }

    /// Tear down `file`'s map iff it exists with no open handles. Races
    /// against concurrent opens are resolved by the registry mutex.
    /// Returns whether a teardown ran.
    pub fn remove_if_closed(self: &Arc<Self>, file: FileId) -> bool {
        let map = {
            let maps = self.maps.lock();
            match maps.get(&file) {
                Some(map) if map.open_count() == 0 => map.clone(),
                _ => return false,
            }
        };
        self.teardown_map(map)
    }

    /// Per-file teardown. Precondition: the caller observed
    /// `open_count == 0`. Returns false if a concurrent open revived the
    /// map.
    pub(crate) fn teardown_map(self: &Arc<Self>, map: Arc<FileMap>) -> bool {
        // Hold an artificial open around the flush so concurrent
        // references cannot free the map under us.
        map.increment_open();
        if let Err(e) = self.flush_range(&map, 0, map.file_size()) {
            warn!(file = map.file(), error = %e, "teardown flush failed; dirty views will be discarded");
        }
        if map.decrement_open() != 0 {
            return false; // revived by a concurrent open
        }

        // Detach from the file so no new open can find the map. The check
        // and the removal are atomic under the registry mutex.
        {
            let mut maps = self.maps.lock();
            if map.open_count() != 0 {
                return false;
            }
            maps.remove(&map.file());
        }

        // Drain the view list into a local free list. Flag and list
        // manipulation under the locks; reference drops outside them.
        let drained: Vec<(Arc<View>, u32)> = {
            let mut lists = self.lists.lock();
            let mut views = map.views.lock();
            let mut out = Vec::with_capacity(views.len());
            for view in views.drain(..) {
                unlink_view(&mut lists.lru, &view);
                let mut drops = 1; // map-membership reference
                if view.swap_dirty(false) {
                    // The flush above failed for this one; its contents
                    // are discarded.
                    warn!(
                        file = map.file(),
                        offset = view.file_offset(),
                        "discarding dirty view at teardown"
                    );
                    unlink_view(&mut lists.dirty, &view);
                    self.dirty_pages
                        .fetch_sub(crate::mem::PAGES_PER_VIEW as u64, Ordering::AcqRel);
                    map.sub_dirty_pages(crate::mem::PAGES_PER_VIEW as u64);
                    drops += 1;
                }
                if view.clear_mappings() {
                    drops += 1;
                }
                out.push((view, drops));
            }
            out
        };

        for (view, drops) in drained {
            for _ in 1..drops {
                view.release_ref();
            }
            let refs = view.ref_count();
            if refs > 1 {
                // Leak diagnostic, not fatal: someone still holds the view.
                warn!(
                    file = map.file(),
                    offset = view.file_offset(),
                    refs,
                    "view still referenced at map teardown"
                );
            }
            view.release_ref();
        }

        debug!(file = map.file(), "file cache torn down");
        true
    }

    // ------------------------------------------------------------------
    // View lookup / create / release
    // ------------------------------------------------------------------

    /// Resolve `(map, off)` to a view, creating and publishing one on
    /// miss. A hit moves the view to the LRU tail.
    pub(crate) fn get_view(self: &Arc<Self>, map: &Arc<FileMap>, off: u64) -> Result<ViewGuard> {
        if off >= map.section_size() {
            return Err(CacheError::InvalidParameter("offset beyond section size"));
        }
        self.lookups.fetch_add(1, Ordering::Relaxed);

        if let Some(view) = map.lookup(off) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            touch_lru(&mut self.lists.lock().lru, &view);
            if map.trace() {
                trace!(file = map.file(), off, base = ?view.base(), "view hit");
            }
            return Ok(ViewGuard::new(self.clone(), map.clone(), view));
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        self.create_view(map, off)
    }

    /// Miss path: map a fresh view outside the locks, then re-scan and
    /// either publish it or discard it in favor of a concurrent winner.
    #[cold]
    fn create_view(self: &Arc<Self>, map: &Arc<FileMap>, off: u64) -> Result<ViewGuard> {
        let fresh = View::new(
            Arc::downgrade(map),
            self.provider.clone(),
            view_align_down(off),
        )?;

        let winner = {
            let mut lists = self.lists.lock();
            let mut views = map.views.lock();
            match FileMap::lookup_locked(&views, off) {
                Some(existing) => {
                    // Lost the race; the existing view already carries our
                    // caller reference from the re-scan.
                    Some(existing)
                }
                None => {
                    fresh.add_ref(); // caller hold on top of the membership ref
                    FileMap::insert_locked(&mut views, fresh.clone());
                    lists.lru.push(fresh.clone());
                    None
                }
            }
        };

        let view = match winner {
            Some(existing) => {
                self.views_recycled.fetch_add(1, Ordering::Relaxed);
                fresh.release_ref(); // drops to zero; unmaps and frees
                existing
            }
            None => {
                self.views_created.fetch_add(1, Ordering::Relaxed);
                fresh
            }
        };
        if map.trace() {
            trace!(file = map.file(), off, base = ?view.base(), "view created");
        }
        Ok(ViewGuard::new(self.clone(), map.clone(), view))
    }

    /// `get_view` for callers that guarantee view alignment; handing in a
    /// misaligned offset is a programming error.
    pub(crate) fn request_view(self: &Arc<Self>, map: &Arc<FileMap>, off: u64) -> Result<ViewGuard> {
        assert_eq!(
            off % VIEW_SIZE as u64,
            0,
            "request_view requires a view-aligned offset"
        );
        self.get_view(map, off)
    }

    /// Return a caller hold with updated flags. The reference being
    /// dropped is the one `lookup`/`create` took for the caller, so the
    /// count stays at least at the membership reference.
    pub(crate) fn release_view(
        &self,
        map: &Arc<FileMap>,
        view: &Arc<View>,
        valid: bool,
        now_dirty: bool,
        mapped_inc: bool,
    ) {
        view.set_valid(valid);
        if now_dirty {
            self.mark_dirty(map, view);
        }
        if mapped_inc {
            view.map_reference();
        }
        // The reference being dropped is the caller's hold; with the view
        // still published, the membership reference keeps the count >= 1.
        view.release_ref();
    }

    /// Undo one external mapping of the view at `off`, then release.
    pub(crate) fn unmap_view(&self, map: &Arc<FileMap>, off: u64, now_dirty: bool) -> Result<()> {
        let view = map.lookup(off).ok_or(CacheError::NotFound(off))?;
        view.unmap_reference();
        let valid = view.is_valid();
        self.release_view(map, &view, valid, now_dirty, false);
        Ok(())
    }

    /// Dirty the view at `off`. The caller promised it exists; a miss is
    /// an invariant violation.
    pub(crate) fn mark_dirty_by_offset(&self, map: &Arc<FileMap>, off: u64) {
        let view = map
            .lookup(off)
            .expect("mark_dirty_by_offset on an unmapped offset");
        let valid = view.is_valid();
        self.release_view(map, &view, valid, true, false);
    }

    // ------------------------------------------------------------------
    // Public flush entry
    // ------------------------------------------------------------------

    /// Synchronous flush of a file's cached range; `None` flushes the
    /// whole file. A file with no map has nothing dirty, which is success.
    pub fn flush_cache(&self, file: FileId, range: Option<(u64, u64)>) -> Result<()> {
        let map = {
            let maps = self.maps.lock();
            match maps.get(&file) {
                Some(map) => map.clone(),
                None => return Ok(()),
            }
        };
        let (off, len) = range.unwrap_or((0, map.file_size()));
        self.flush_range(&map, off, len)
    }

    // ------------------------------------------------------------------
    // Counters & stats
    // ------------------------------------------------------------------

    /// Dirty pages across all maps. Advisory outside the locks.
    pub fn dirty_pages(&self) -> u64 {
        self.dirty_pages.load(Ordering::Acquire)
    }

    pub fn dirty_page_threshold(&self) -> u64 {
        self.dirty_threshold.load(Ordering::Acquire)
    }

    pub fn set_dirty_page_threshold(&self, pages: u64) {
        self.dirty_threshold.store(pages, Ordering::Release);
    }

    /// Whether producers should start throttling dirtying writes.
    pub fn over_dirty_threshold(&self) -> bool {
        self.dirty_pages() >= self.dirty_page_threshold()
    }

    pub fn stats(&self) -> CacheStats {
        let (lru_entries, dirty_entries) = {
            let lists = self.lists.lock();
            (lists.lru.len(), lists.dirty.len())
        };
        let (maps, views) = {
            let maps = self.maps.lock();
            let views = maps.values().map(|m| m.view_count()).sum();
            (maps.len(), views)
        };
        CacheStats {
            maps,
            views,
            lru_entries,
            dirty_entries,
            dirty_pages: self.dirty_pages(),
            resident_pages: self.provider.resident_pages(),
            lookups: self.lookups.load(Ordering::Relaxed),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            views_created: self.views_created.load(Ordering::Relaxed),
            views_recycled: self.views_recycled.load(Ordering::Relaxed),
            pages_flushed: self.pages_flushed.load(Ordering::Relaxed),
            flush_failures: self.flush_failures.load(Ordering::Relaxed),
            trim_runs: self.trim_runs.load(Ordering::Relaxed),
            pages_reclaimed: self.pages_reclaimed.load(Ordering::Relaxed),
        }
    }
}

impl Drop for CacheRoot {
    fn drop(&mut self) {
        self.lazy_tx.get_mut().take();
        if let Some(handle) = self.lazy_handle.get_mut().take() {
            if handle.thread().id() != std::thread::current().id() {
                let _ = handle.join();
            }
        }
    }
}

impl ReclaimHook for CacheRoot {
    fn trim(&self, target_pages: u64, priority: TrimPriority) -> Result<u64> {
        debug!(target_pages, ?priority, "reclaim requested");
        Ok(self.trim_views(target_pages))
    }
}

// ============================================================================
// Per-file handle
// ============================================================================

/// One filesystem handle's attachment to a cached file. Owns a private
/// read-ahead block and one unit of the map's open count; the last close
/// tears the map down.
pub struct CacheHandle {
    root: Arc<CacheRoot>,
    map: Arc<FileMap>,
    private: Arc<ReadAheadState>,
    closed: bool,
}

impl CacheHandle {
    pub fn file(&self) -> FileId {
        self.map.file()
    }

    pub fn file_size(&self) -> u64 {
        self.map.file_size()
    }

    pub fn section_size(&self) -> u64 {
        self.map.section_size()
    }

    /// Dirty pages attributed to this file.
    pub fn dirty_pages(&self) -> u64 {
        self.map.dirty_pages()
    }

    /// The private read-ahead block bound to this handle. Opaque to the
    /// core; the read-ahead collaborator interprets it.
    pub fn read_ahead_state(&self) -> &Arc<ReadAheadState> {
        &self.private
    }

    pub fn set_trace(&self, on: bool) {
        self.map.set_trace(on);
    }

    /// Counter snapshot of the view covering `off`, if any.
    pub fn view_stats(&self, off: u64) -> Option<crate::cache::view::ViewStats> {
        self.map.view_stats(off)
    }

    /// Number of views indexed for this file.
    pub fn view_count(&self) -> usize {
        self.map.view_count()
    }

    /// Get (or create) the view covering `off`.
    pub fn get_view(&self, off: u64) -> Result<ViewGuard> {
        self.root.get_view(&self.map, off)
    }

    /// As `get_view`, restricted to view-aligned offsets.
    pub fn request_view(&self, off: u64) -> Result<ViewGuard> {
        self.root.request_view(&self.map, off)
    }

    /// Record the teardown of one external mapping of the view at `off`.
    pub fn unmap_view(&self, off: u64, now_dirty: bool) -> Result<()> {
        self.root.unmap_view(&self.map, off, now_dirty)
    }

    /// Dirty the view covering `off`; it must exist.
    pub fn mark_dirty_by_offset(&self, off: u64) {
        self.root.mark_dirty_by_offset(&self.map, off);
    }

    /// Synchronously flush `[off, off + len)` of this file.
    pub fn flush(&self, off: u64, len: u64) -> Result<()> {
        self.root.flush_range(&self.map, off, len)
    }

    /// Detach this handle. Equivalent to dropping it, but explicit.
    pub fn close(mut self) {
        self.detach();
    }

    fn detach(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.map.detach_private(&self.private);
        if self.map.decrement_open() == 0 {
            self.root.teardown_map(self.map.clone());
        }
    }
}

impl Drop for CacheHandle {
    fn drop(&mut self) {
        self.detach();
    }
}
