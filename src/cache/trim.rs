// # Trim / Reclaim Engine
//
// Two-phase reclaim driven by the memory manager: phase A walks the LRU
// and both pages out clean mapped views (the structure lives on) and
// evicts views nobody references beyond their map membership; phase B
// flushes toward the remaining target and retries phase A once, capped at
// what flushing produced.

use crate::cache::filemap::FileMap;
use crate::cache::root::{unlink_view, CacheRoot};
use crate::cache::view::View;
use crate::mem::PAGES_PER_VIEW;
use std::collections::HashSet;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tracing::debug;

impl CacheRoot {
    /// Reclaim up to `target_pages` pages. Returns the pages freed
    /// (evicted views plus pages paged out of surviving mapped views).
    pub fn trim_views(&self, target_pages: u64) -> u64 {
        self.trim_runs.fetch_add(1, Ordering::Relaxed);

        let mut freed = self.trim_pass(target_pages);
        if freed < target_pages {
            // One flush, one retry: newly cleaned views become evictable.
            let flushed = self.flush_dirty(target_pages - freed, false, false);
            if flushed > 0 {
                let cap = (target_pages - freed).min(flushed);
                freed += self.trim_pass(cap);
            }
        }

        self.pages_reclaimed.fetch_add(freed, Ordering::Relaxed);
        debug!(target_pages, freed, "trim finished");
        freed
    }

    /// One LRU sweep, head to tail, bounded by the visited set (the list
    /// mutates while locks are dropped for page-out).
    fn trim_pass(&self, target_pages: u64) -> u64 {
        let mut freed = 0u64;
        let mut visited: HashSet<usize> = HashSet::new();
        let mut free_list: Vec<Arc<View>> = Vec::new();

        while freed < target_pages {
            // Take the trim hold under the lock, while LRU membership
            // still guarantees the view is live.
            let candidate = {
                let lists = self.lists.lock();
                lists
                    .lru
                    .iter()
                    .find(|v| !visited.contains(&(Arc::as_ptr(v) as usize)))
                    .map(|v| {
                        v.add_ref();
                        v.clone()
                    })
            };
            let Some(view) = candidate else { break };
            visited.insert(Arc::as_ptr(&view) as usize);

            // Clean mapped views cannot be unlinked, but their RAM can go:
            // page out with no locks held.
            if view.mapped_count() > 0 && !view.is_dirty() {
                let base = view.base();
                for index in 0..PAGES_PER_VIEW {
                    if self.provider.page_out(base, index) {
                        freed += 1;
                    }
                }
            }

            let Some(map) = view.owner() else {
                // Torn down while we held it; the drain path owns cleanup.
                view.release_ref();
                continue;
            };

            // Drop the hold and judge evictability atomically with any
            // new-reference path (all of which take these locks).
            let mut lists = self.lists.lock();
            let mut views = map.views.lock();
            let remaining = view.release_ref() - 1;
            if remaining < 2 && FileMap::unlink_locked(&mut views, &view) {
                unlink_view(&mut lists.lru, &view);
                freed += PAGES_PER_VIEW as u64;
                free_list.push(view.clone());
            }
        }

        // Finalize outside the locks: the membership reference is the last
        // one; dropping it frees the mapping.
        for view in free_list {
            let prev = view.release_ref();
            debug_assert_eq!(prev, 1, "trimmed view grew references after unlink");
        }
        freed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::filemap::FileBacking;
    use crate::cache::root::{CacheConfig, CacheHandle, CacheRoot};
    use crate::error::Result;
    use crate::mem::{HeapPages, PageProvider, VIEW_SIZE};
    use parking_lot::Mutex;

    struct MemFile {
        data: Mutex<Vec<u8>>,
    }

    impl MemFile {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                data: Mutex::new(Vec::new()),
            })
        }
    }

    impl FileBacking for MemFile {
        fn acquire_for_lazy_write(&self, _wait: bool) -> bool {
            true
        }
        fn release_from_lazy_write(&self) {}
        fn write_back(&self, offset: u64, data: &[u8]) -> Result<()> {
            let mut file = self.data.lock();
            let off = offset as usize;
            if file.len() < off + data.len() {
                file.resize(off + data.len(), 0);
            }
            file[off..off + data.len()].copy_from_slice(data);
            Ok(())
        }
    }

    fn setup() -> (Arc<HeapPages>, Arc<CacheRoot>, CacheHandle) {
        let provider = Arc::new(HeapPages::new());
        let root = CacheRoot::new(
            provider.clone(),
            CacheConfig {
                enable_lazy_writer: false,
                ..CacheConfig::default()
            },
        );
        let size = VIEW_SIZE as u64 * 16;
        let handle = root
            .init_file_cache(1, size, size, false, MemFile::new())
            .unwrap();
        (provider, root, handle)
    }

    #[test]
    fn test_trim_evicts_clean_unreferenced_views() {
        let (provider, root, h) = setup();
        for i in 0..4u64 {
            let g = h.get_view(i * VIEW_SIZE as u64).unwrap();
            g.release(true, false);
        }
        assert_eq!(provider.resident_pages(), 4 * PAGES_PER_VIEW as u64);

        let freed = root.trim_views(u64::MAX);
        assert_eq!(freed, 4 * PAGES_PER_VIEW as u64);
        assert_eq!(provider.resident_pages(), 0);
        assert_eq!(h.view_count(), 0);
        assert_eq!(root.stats().lru_entries, 0);
    }

    #[test]
    fn test_trim_stops_at_target() {
        let (provider, root, h) = setup();
        for i in 0..4u64 {
            let g = h.get_view(i * VIEW_SIZE as u64).unwrap();
            g.release(true, false);
        }

        let freed = root.trim_views(PAGES_PER_VIEW as u64);
        assert_eq!(freed, PAGES_PER_VIEW as u64);
        assert_eq!(h.view_count(), 3);
        assert_eq!(provider.resident_pages(), 3 * PAGES_PER_VIEW as u64);
    }

    #[test]
    fn test_trim_evicts_in_lru_order() {
        let (_provider, root, h) = setup();
        let g0 = h.get_view(0).unwrap();
        g0.release(true, false);
        let g1 = h.get_view(VIEW_SIZE as u64).unwrap();
        g1.release(true, false);

        // Touch bucket 0 so bucket 1 is the LRU head.
        let g0 = h.get_view(0).unwrap();
        g0.release(true, false);

        root.trim_views(PAGES_PER_VIEW as u64);
        assert!(h.view_stats(0).is_some(), "recently used view survives");
        assert!(h.view_stats(VIEW_SIZE as u64).is_none());
    }

    #[test]
    fn test_trim_skips_views_in_use() {
        let (provider, root, h) = setup();
        let busy = h.get_view(0).unwrap();

        let freed = root.trim_views(u64::MAX);
        assert_eq!(freed, 0);
        assert_eq!(h.view_count(), 1);
        assert_eq!(provider.resident_pages(), PAGES_PER_VIEW as u64);

        busy.release(true, false);
        assert_eq!(root.trim_views(u64::MAX), PAGES_PER_VIEW as u64);
    }

    #[test]
    fn test_trim_pages_out_mapped_views_without_unlinking() {
        let (provider, root, h) = setup();
        let g = h.get_view(0).unwrap();
        g.release_mapped(true, false);

        let freed = root.trim_views(u64::MAX);
        assert_eq!(freed, PAGES_PER_VIEW as u64, "pages went out");
        assert_eq!(provider.resident_pages(), 0);

        let stats = h.view_stats(0).unwrap();
        assert_eq!(stats.mapped_count, 1);
        assert!(stats.ref_count >= 2, "structure survived with its mapping reference");
        assert_eq!(h.view_count(), 1);

        // A second trim finds nothing resident to page out.
        assert_eq!(root.trim_views(u64::MAX), 0);

        // Put the mapping away so teardown finds a free-able view.
        h.unmap_view(0, false).unwrap();
    }

    #[test]
    fn test_trim_leaves_dirty_mapped_views_resident() {
        let (provider, root, h) = setup();
        let g = h.get_view(0).unwrap();
        g.copy_in(0, &[9; 16]);
        g.release_mapped(true, true);

        // Phase A must not page out dirty contents, and the mapping holds
        // an extra reference, which also keeps the bulk flusher away.
        let freed = root.trim_views(u64::MAX);
        assert_eq!(freed, 0);
        assert!(h.view_stats(0).unwrap().dirty);
        assert_eq!(provider.resident_pages(), PAGES_PER_VIEW as u64);

        // An explicit range flush cleans it; trim can then page it out.
        h.flush(0, VIEW_SIZE as u64).unwrap();
        let freed = root.trim_views(u64::MAX);
        assert_eq!(freed, PAGES_PER_VIEW as u64);
        assert_eq!(provider.resident_pages(), 0);
        let stats = h.view_stats(0).unwrap();
        assert_eq!(stats.mapped_count, 1);
        assert!(stats.ref_count >= 2, "structure survived with its mapping reference");

        h.unmap_view(0, false).unwrap();
    }

    #[test]
    fn test_trim_flush_retry_reclaims_dirty_views() {
        let (provider, root, h) = setup();
        for i in 0..3u64 {
            let g = h.get_view(i * VIEW_SIZE as u64).unwrap();
            g.copy_in(0, &[i as u8; 8]);
            g.release(true, true);
        }
        assert_eq!(root.dirty_pages(), 3 * PAGES_PER_VIEW as u64);

        let freed = root.trim_views(u64::MAX);
        assert!(freed >= 3 * PAGES_PER_VIEW as u64);
        assert_eq!(root.dirty_pages(), 0);
        assert_eq!(h.view_count(), 0);
        assert_eq!(provider.resident_pages(), 0);
    }
}
