// # View - One Mapped File Region
//
// A view is a VIEW_SIZE chunk of a file backed by committed pages at a
// stable base address. The atomic counters here are the whole state
// machine: every create/hand-out/flush/unmap/free transition goes through
// them, and the last reference drop is the commit point of destruction.

use crate::cache::filemap::FileMap;
use crate::cache::root::CacheRoot;
use crate::error::Result;
use crate::mem::{PageProvider, PAGES_PER_VIEW, VIEW_SIZE};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use tracing::warn;

/// One mapped view of a file region.
///
/// Reference-count ownership rules:
/// - membership in the owning map's list holds one reference
/// - membership in the global dirty list holds one reference
/// - every outstanding caller hold ([`ViewGuard`]) holds one reference
/// - the first external mapping (`mapped_count` 0→1) holds one reference
///
/// The count reaching zero frees the mapping and poisons the base pointer;
/// the structure itself is released when the last `Arc` goes away.
pub struct View {
    /// Start of the region this view maps; always `VIEW_SIZE`-aligned.
    file_offset: u64,

    /// Base of the mapping. Null once freed; never republished.
    base: AtomicPtr<u8>,

    /// Contents reflect committed file data for the whole range.
    valid: AtomicBool,

    /// Contents differ from backing store.
    dirty: AtomicBool,

    /// Outstanding external mappings of this view.
    mapped_count: AtomicU32,

    /// Outstanding pinned references (external pin layer). Liveness
    /// indicator only; the core never pins.
    pin_count: AtomicU32,

    /// Every outstanding hold on this view.
    ref_count: AtomicU32,

    /// Owning per-file map.
    owner: Weak<FileMap>,

    provider: Arc<dyn PageProvider>,
}

impl View {
    /// Allocate and map a fresh view. Not yet published: the single
    /// reference belongs to the creating thread.
    ///
    /// Region reservation failure is reportable; the per-page commits are
    /// infallible by provider contract.
    pub(crate) fn new(
        owner: Weak<FileMap>,
        provider: Arc<dyn PageProvider>,
        file_offset: u64,
    ) -> Result<Arc<View>> {
        debug_assert_eq!(file_offset % VIEW_SIZE as u64, 0);
        let base = provider.reserve_region()?;
        for index in 0..PAGES_PER_VIEW {
            provider.commit_page(base, index);
        }
        Ok(Arc::new(View {
            file_offset,
            base: AtomicPtr::new(base.as_ptr()),
            valid: AtomicBool::new(false),
            dirty: AtomicBool::new(false),
            mapped_count: AtomicU32::new(0),
            pin_count: AtomicU32::new(0),
            ref_count: AtomicU32::new(1),
            owner,
            provider,
        }))
    }

    #[inline(always)]
    pub fn file_offset(&self) -> u64 {
        self.file_offset
    }

    /// Base address of the mapping. Stable from creation until free.
    #[inline]
    pub fn base(&self) -> NonNull<u8> {
        NonNull::new(self.base.load(Ordering::Acquire)).expect("view mapping already freed")
    }

    #[inline(always)]
    pub fn is_valid(&self) -> bool {
        self.valid.load(Ordering::Acquire)
    }

    #[inline]
    pub(crate) fn set_valid(&self, valid: bool) {
        self.valid.store(valid, Ordering::Release);
    }

    #[inline(always)]
    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    /// Swap the dirty flag, returning the previous value. Only the dirty
    /// engine calls this, under the global list mutex.
    #[inline]
    pub(crate) fn swap_dirty(&self, dirty: bool) -> bool {
        self.dirty.swap(dirty, Ordering::AcqRel)
    }

    #[inline(always)]
    pub fn mapped_count(&self) -> u32 {
        self.mapped_count.load(Ordering::Acquire)
    }

    #[inline(always)]
    pub fn pin_count(&self) -> u32 {
        self.pin_count.load(Ordering::Acquire)
    }

    #[inline(always)]
    pub fn ref_count(&self) -> u32 {
        self.ref_count.load(Ordering::Acquire)
    }

    pub(crate) fn owner(&self) -> Option<Arc<FileMap>> {
        self.owner.upgrade()
    }

    /// Take one reference. Returns the previous count.
    #[inline(always)]
    pub(crate) fn add_ref(&self) -> u32 {
        self.ref_count.fetch_add(1, Ordering::AcqRel)
    }

    /// Drop one reference. The transition to zero runs the free path.
    /// Returns the previous count.
    #[inline]
    pub(crate) fn release_ref(&self) -> u32 {
        let prev = self.ref_count.fetch_sub(1, Ordering::AcqRel);
        assert!(prev > 0, "view reference count underflow");
        if prev == 1 {
            self.free();
        }
        prev
    }

    /// Record one external mapping. The 0→1 transition takes the coupled
    /// reference.
    pub(crate) fn map_reference(&self) {
        if self.mapped_count.fetch_add(1, Ordering::AcqRel) == 0 {
            self.add_ref();
        }
    }

    /// Undo one external mapping. The 1→0 transition drops the coupled
    /// reference.
    pub(crate) fn unmap_reference(&self) {
        let prev = self.mapped_count.fetch_sub(1, Ordering::AcqRel);
        assert!(prev > 0, "view mapped count underflow");
        if prev == 1 {
            self.release_ref();
        }
    }

    /// Force `mapped_count` to zero (teardown only). Returns whether the
    /// coupled reference must be dropped by the caller.
    pub(crate) fn clear_mappings(&self) -> bool {
        self.mapped_count.swap(0, Ordering::AcqRel) > 0
    }

    #[inline]
    pub(crate) fn pin(&self) {
        self.pin_count.fetch_add(1, Ordering::AcqRel);
    }

    #[inline]
    pub(crate) fn unpin(&self) {
        let prev = self.pin_count.fetch_sub(1, Ordering::AcqRel);
        assert!(prev > 0, "view pin count underflow");
    }

    /// Copy bytes into the view at `at`.
    ///
    /// Concurrent writers to overlapping ranges are a caller contract
    /// violation, exactly as for any shared file mapping.
    pub fn copy_in(&self, at: usize, src: &[u8]) {
        assert!(at + src.len() <= VIEW_SIZE, "copy beyond view bounds");
        // SAFETY: the mapping is live for VIEW_SIZE bytes and the bounds
        // were just checked; `src` cannot overlap a freshly reserved region.
        unsafe {
            std::ptr::copy_nonoverlapping(src.as_ptr(), self.base().as_ptr().add(at), src.len());
        }
    }

    /// Copy bytes out of the view from `at`.
    pub fn copy_out(&self, at: usize, dst: &mut [u8]) {
        assert!(at + dst.len() <= VIEW_SIZE, "copy beyond view bounds");
        // SAFETY: as in `copy_in`.
        unsafe {
            std::ptr::copy_nonoverlapping(self.base().as_ptr().add(at), dst.as_mut_ptr(), dst.len());
        }
    }

    /// The whole mapping as a byte slice, for write-back.
    ///
    /// # Safety
    ///
    /// The caller must ensure no one mutates the view for the slice's
    /// lifetime (flush callers hold the file's lazy-write lock or have the
    /// view exclusively).
    pub(crate) unsafe fn bytes(&self) -> &[u8] {
        std::slice::from_raw_parts(self.base().as_ptr(), VIEW_SIZE)
    }

    /// Tear down the mapping: free every page and release the region.
    /// Idempotent; returns whether this call did the work.
    fn destroy_mapping(&self) -> bool {
        let base = self.base.swap(std::ptr::null_mut(), Ordering::AcqRel);
        let Some(base) = NonNull::new(base) else {
            return false;
        };
        for index in 0..PAGES_PER_VIEW {
            self.provider.free_page(base, index);
        }
        self.provider.release_region(base);
        true
    }

    /// Final free. Ran by the reference drop that hits zero.
    fn free(&self) {
        assert!(!self.is_dirty(), "freeing a dirty view");
        assert_eq!(self.mapped_count(), 0, "freeing a mapped view");
        assert_eq!(self.pin_count(), 0, "freeing a pinned view");
        assert!(self.destroy_mapping(), "view freed twice");
    }

    pub(crate) fn snapshot(&self) -> ViewStats {
        ViewStats {
            file_offset: self.file_offset,
            valid: self.is_valid(),
            dirty: self.is_dirty(),
            mapped_count: self.mapped_count(),
            pin_count: self.pin_count(),
            ref_count: self.ref_count(),
        }
    }
}

impl Drop for View {
    fn drop(&mut self) {
        // Views leaked past teardown (refs never returned) still own their
        // mapping when the last Arc goes away; reclaim it here.
        if self.destroy_mapping() {
            warn!(
                file_offset = self.file_offset,
                refs = self.ref_count(),
                "view dropped with live mapping"
            );
        }
    }
}

impl std::fmt::Debug for View {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("View")
            .field("file_offset", &self.file_offset)
            .field("valid", &self.is_valid())
            .field("dirty", &self.is_dirty())
            .field("mapped_count", &self.mapped_count())
            .field("pin_count", &self.pin_count())
            .field("ref_count", &self.ref_count())
            .finish()
    }
}

// ============================================================================
// Diagnostics
// ============================================================================

/// Point-in-time snapshot of one view's counters.
#[derive(Debug, Clone)]
pub struct ViewStats {
    pub file_offset: u64,
    pub valid: bool,
    pub dirty: bool,
    pub mapped_count: u32,
    pub pin_count: u32,
    pub ref_count: u32,
}

// ============================================================================
// Caller hold
// ============================================================================

/// Scoped hold on a view, handed out by `get_view`/`request_view`.
///
/// [`release`](ViewGuard::release) returns the hold with updated flags;
/// plain `Drop` returns it without touching them. Either way the reference
/// taken on the caller's behalf is given back exactly once.
pub struct ViewGuard {
    root: Arc<CacheRoot>,
    map: Arc<FileMap>,
    view: Option<Arc<View>>,
}

impl ViewGuard {
    pub(crate) fn new(root: Arc<CacheRoot>, map: Arc<FileMap>, view: Arc<View>) -> Self {
        Self {
            root,
            map,
            view: Some(view),
        }
    }

    fn view(&self) -> &Arc<View> {
        self.view.as_ref().expect("guard already released")
    }

    /// Aligned start of the region this view covers.
    pub fn file_offset(&self) -> u64 {
        self.view().file_offset()
    }

    /// Stable base address of the mapping.
    pub fn base(&self) -> NonNull<u8> {
        self.view().base()
    }

    /// Whether the contents reflect committed file data.
    pub fn valid(&self) -> bool {
        self.view().is_valid()
    }

    pub fn copy_in(&self, at: usize, src: &[u8]) {
        self.view().copy_in(at, src);
    }

    pub fn copy_out(&self, at: usize, dst: &mut [u8]) {
        self.view().copy_out(at, dst);
    }

    /// Counter snapshot, for diagnostics and tests.
    pub fn stats(&self) -> ViewStats {
        self.view().snapshot()
    }

    /// Pin on behalf of the external pin layer.
    pub fn pin(&self) {
        self.view().pin();
    }

    pub fn unpin(&self) {
        self.view().unpin();
    }

    /// Return the hold. `valid` is the caller's knowledge OR'd with the
    /// current flag; `now_dirty` marks the view dirty if it was not.
    pub fn release(mut self, valid: bool, now_dirty: bool) {
        let view = self.view.take().expect("guard already released");
        self.root.release_view(&self.map, &view, valid, now_dirty, false);
    }

    /// As [`release`](ViewGuard::release), additionally recording one new
    /// external mapping of the view.
    pub fn release_mapped(mut self, valid: bool, now_dirty: bool) {
        let view = self.view.take().expect("guard already released");
        self.root.release_view(&self.map, &view, valid, now_dirty, true);
    }
}

impl Drop for ViewGuard {
    fn drop(&mut self) {
        if let Some(view) = self.view.take() {
            view.release_ref();
        }
    }
}
