// # Per-File Map
//
// Bookkeeping that ties a file to its set of views: the ordered view
// index under its own lock, the open count, the filesystem callback
// table, and the per-handle private read-ahead blocks (opaque to the
// core; only their lifecycle is managed here).

use crate::cache::view::{View, ViewStats};
use crate::error::Result;
use crate::mem::VIEW_SIZE;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

/// Opaque file identifier. The cache never interprets it; it is the
/// registry key and the tag handed back to the filesystem callbacks.
pub type FileId = u64;

/// Filesystem callback table consumed by the cache. Any writer context
/// the filesystem needs lives in the implementing object.
pub trait FileBacking: Send + Sync {
    /// Acquire the file for write-back. Returns false iff `!wait` and the
    /// acquisition would block.
    fn acquire_for_lazy_write(&self, wait: bool) -> bool;

    fn release_from_lazy_write(&self);

    /// Persist one view's bytes at `offset`.
    fn write_back(&self, offset: u64, data: &[u8]) -> Result<()>;

    /// Temporary files are skipped by the lazy writer.
    fn is_temporary(&self) -> bool {
        false
    }
}

/// Per-handle read-ahead block. The read-ahead collaborator owns the
/// interpretation; the core only binds its lifecycle to the handle.
#[derive(Default)]
pub struct ReadAheadState {
    pub last_offset: AtomicU64,
    pub window: AtomicU64,
}

/// Per-file map: one per cached file, shared by all handles to it.
pub struct FileMap {
    file: FileId,
    file_size: AtomicU64,
    section_size: u64,
    pin_access: bool,
    backing: Arc<dyn FileBacking>,

    /// Views sorted by `file_offset`, strictly increasing.
    pub(crate) views: Mutex<Vec<Arc<View>>>,

    /// Dirty pages attributed to this file.
    dirty_pages: AtomicU64,

    /// Handles attached to this map. Zero is the teardown precondition.
    open_count: AtomicU32,

    /// Per-map diagnostic tracing.
    trace: AtomicBool,

    /// Private read-ahead blocks, one per handle.
    private: Mutex<Vec<Arc<ReadAheadState>>>,
}

impl FileMap {
    pub(crate) fn new(
        file: FileId,
        file_size: u64,
        section_size: u64,
        pin_access: bool,
        backing: Arc<dyn FileBacking>,
    ) -> Arc<Self> {
        Arc::new(Self {
            file,
            file_size: AtomicU64::new(file_size),
            section_size,
            pin_access,
            backing,
            views: Mutex::new(Vec::new()),
            dirty_pages: AtomicU64::new(0),
            open_count: AtomicU32::new(0),
            trace: AtomicBool::new(false),
            private: Mutex::new(Vec::new()),
        })
    }

    #[inline(always)]
    pub fn file(&self) -> FileId {
        self.file
    }

    #[inline]
    pub fn file_size(&self) -> u64 {
        self.file_size.load(Ordering::Acquire)
    }

    #[inline(always)]
    pub fn section_size(&self) -> u64 {
        self.section_size
    }

    #[inline(always)]
    pub fn pin_access(&self) -> bool {
        self.pin_access
    }

    pub(crate) fn backing(&self) -> &Arc<dyn FileBacking> {
        &self.backing
    }

    pub fn dirty_pages(&self) -> u64 {
        self.dirty_pages.load(Ordering::Acquire)
    }

    pub(crate) fn add_dirty_pages(&self, pages: u64) {
        self.dirty_pages.fetch_add(pages, Ordering::AcqRel);
    }

    pub(crate) fn sub_dirty_pages(&self, pages: u64) {
        let prev = self.dirty_pages.fetch_sub(pages, Ordering::AcqRel);
        debug_assert!(prev >= pages, "per-map dirty page counter underflow");
    }

    pub fn open_count(&self) -> u32 {
        self.open_count.load(Ordering::Acquire)
    }

    /// Returns the new count.
    pub(crate) fn increment_open(&self) -> u32 {
        self.open_count.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Returns the new count.
    pub(crate) fn decrement_open(&self) -> u32 {
        let prev = self.open_count.fetch_sub(1, Ordering::AcqRel);
        assert!(prev > 0, "file map open count underflow");
        prev - 1
    }

    /// Teardown holds an artificial open around its flush.
    pub(crate) fn set_open(&self, count: u32) {
        self.open_count.store(count, Ordering::Release);
    }

    pub fn trace(&self) -> bool {
        self.trace.load(Ordering::Relaxed)
    }

    /// Toggle per-map diagnostic tracing.
    pub fn set_trace(&self, on: bool) {
        self.trace.store(on, Ordering::Relaxed);
    }

    /// Walk the sorted list for a view covering `off`. The list is sorted
    /// by offset, so the walk stops at the first view starting past `off`.
    fn find_locked(views: &[Arc<View>], off: u64) -> Option<Arc<View>> {
        for view in views {
            if view.file_offset() > off {
                break;
            }
            if off - view.file_offset() < VIEW_SIZE as u64 {
                return Some(view.clone());
            }
        }
        None
    }

    /// Resolve `off` to a view, taking a reference on hit.
    pub(crate) fn lookup(&self, off: u64) -> Option<Arc<View>> {
        let views = self.views.lock();
        let view = Self::find_locked(&views, off)?;
        view.add_ref();
        Some(view)
    }

    /// As `lookup`, against an already-held list guard (the create path
    /// re-scans while holding global and per-map locks).
    pub(crate) fn lookup_locked(views: &[Arc<View>], off: u64) -> Option<Arc<View>> {
        let view = Self::find_locked(views, off)?;
        view.add_ref();
        Some(view)
    }

    /// Insert into sorted position. The caller re-scanned under this lock,
    /// so a duplicate offset is an invariant violation.
    pub(crate) fn insert_locked(views: &mut Vec<Arc<View>>, view: Arc<View>) {
        match views.binary_search_by_key(&view.file_offset(), |v| v.file_offset()) {
            Ok(_) => panic!("duplicate view offset published"),
            Err(pos) => views.insert(pos, view),
        }
    }

    /// Unlink a view from the index by identity. Returns whether it was
    /// present.
    pub(crate) fn unlink_locked(views: &mut Vec<Arc<View>>, view: &Arc<View>) -> bool {
        match views.iter().position(|v| Arc::ptr_eq(v, view)) {
            Some(pos) => {
                views.remove(pos);
                true
            }
            None => false,
        }
    }

    /// Snapshot one view's counters without taking a reference; the list
    /// lock keeps the view alive for the duration.
    pub fn view_stats(&self, off: u64) -> Option<ViewStats> {
        let views = self.views.lock();
        Self::find_locked(&views, off).map(|v| v.snapshot())
    }

    /// Number of views currently indexed.
    pub fn view_count(&self) -> usize {
        self.views.lock().len()
    }

    pub(crate) fn attach_private(&self) -> Arc<ReadAheadState> {
        let block = Arc::new(ReadAheadState::default());
        self.private.lock().push(block.clone());
        block
    }

    pub(crate) fn detach_private(&self, block: &Arc<ReadAheadState>) {
        let mut private = self.private.lock();
        if let Some(pos) = private.iter().position(|b| Arc::ptr_eq(b, block)) {
            private.remove(pos);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mem::{HeapPages, PageProvider};

    struct NullBacking;

    impl FileBacking for NullBacking {
        fn acquire_for_lazy_write(&self, _wait: bool) -> bool {
            true
        }
        fn release_from_lazy_write(&self) {}
        fn write_back(&self, _offset: u64, _data: &[u8]) -> Result<()> {
            Ok(())
        }
    }

    fn test_map() -> (Arc<HeapPages>, Arc<FileMap>) {
        let provider = Arc::new(HeapPages::new());
        let map = FileMap::new(7, VIEW_SIZE as u64 * 8, VIEW_SIZE as u64 * 8, false, Arc::new(NullBacking));
        (provider, map)
    }

    fn add_view(map: &Arc<FileMap>, provider: &Arc<HeapPages>, off: u64) -> Arc<View> {
        let dyn_provider: Arc<dyn PageProvider> = provider.clone();
        let view = View::new(Arc::downgrade(map), dyn_provider, off).unwrap();
        FileMap::insert_locked(&mut map.views.lock(), view.clone());
        view
    }

    fn drain(map: &Arc<FileMap>) {
        for view in map.views.lock().drain(..) {
            view.release_ref();
        }
    }

    #[test]
    fn test_sorted_insert_and_lookup() {
        let (provider, map) = test_map();
        let g = VIEW_SIZE as u64;
        add_view(&map, &provider, 2 * g);
        add_view(&map, &provider, 0);
        add_view(&map, &provider, g);

        {
            let views = map.views.lock();
            let offsets: Vec<u64> = views.iter().map(|v| v.file_offset()).collect();
            assert_eq!(offsets, vec![0, g, 2 * g]);
        }

        // Any offset inside a bucket resolves to its view.
        let hit = map.lookup(g + 0x123).expect("covered offset");
        assert_eq!(hit.file_offset(), g);
        hit.release_ref();

        assert!(map.lookup(3 * g).is_none());
        drain(&map);
    }

    #[test]
    fn test_lookup_takes_reference() {
        let (provider, map) = test_map();
        let view = add_view(&map, &provider, 0);
        assert_eq!(view.ref_count(), 1);

        let hit = map.lookup(0).unwrap();
        assert_eq!(hit.ref_count(), 2);
        hit.release_ref();
        assert_eq!(view.ref_count(), 1);
        drain(&map);
    }

    #[test]
    #[should_panic(expected = "duplicate view offset")]
    fn test_duplicate_offset_panics() {
        let (provider, map) = test_map();
        add_view(&map, &provider, 0);
        add_view(&map, &provider, 0);
    }

    #[test]
    fn test_open_count_transitions() {
        let (_provider, map) = test_map();
        assert_eq!(map.open_count(), 0);
        assert_eq!(map.increment_open(), 1);
        assert_eq!(map.increment_open(), 2);
        assert_eq!(map.decrement_open(), 1);
        assert_eq!(map.decrement_open(), 0);
    }

    #[test]
    fn test_private_block_lifecycle() {
        let (_provider, map) = test_map();
        let a = map.attach_private();
        let b = map.attach_private();
        assert_eq!(map.private.lock().len(), 2);
        map.detach_private(&a);
        assert_eq!(map.private.lock().len(), 1);
        map.detach_private(&b);
        assert!(map.private.lock().is_empty());
    }
}
