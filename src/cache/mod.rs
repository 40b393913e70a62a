//! # View Cache Manager
//!
//! Maps ranges of regular files into fixed-size *views* at stable
//! addresses, lets callers read and mutate them in place, tracks which
//! views are dirty, writes them back through a filesystem callback, and
//! evicts clean views under memory pressure.
//!
//! Three interlocking pieces:
//!
//! - a per-file index resolving `(file, offset)` to at most one view per
//!   aligned offset, even under concurrent creation ([`FileMap`])
//! - a reference/state machine on each view whose transitions are the
//!   only way a view is created, handed out, flushed, unmapped, or freed
//!   ([`view::View`], [`ViewGuard`])
//! - a global dirty list + LRU + trim/flush engine providing synchronous
//!   and lazy write-back plus two-phase reclaim ([`CacheRoot`])
//!
//! ## Usage
//!
//! ```rust
//! use std::sync::Arc;
//! use viewcache::{create_cache_root, CacheConfig, FileBacking, Result};
//!
//! struct Discard;
//!
//! impl FileBacking for Discard {
//!     fn acquire_for_lazy_write(&self, _wait: bool) -> bool { true }
//!     fn release_from_lazy_write(&self) {}
//!     fn write_back(&self, _offset: u64, _data: &[u8]) -> Result<()> { Ok(()) }
//! }
//!
//! # fn main() -> Result<()> {
//! let root = create_cache_root(CacheConfig::default(), None);
//! let handle = root.init_file_cache(1, 1 << 20, 1 << 20, false, Arc::new(Discard))?;
//!
//! let view = handle.get_view(0)?;
//! view.copy_in(0, b"hello");
//! view.release(true, true); // valid, and now dirty
//!
//! root.flush_cache(1, None)?;
//! handle.close();
//! root.shutdown();
//! # Ok(())
//! # }
//! ```

pub mod filemap;
mod flush;
pub mod root;
mod trim;
pub mod view;

pub use filemap::{FileBacking, FileId, FileMap, ReadAheadState};
pub use root::{CacheConfig, CacheHandle, CacheRoot, CacheStats};
pub use view::{ViewGuard, ViewStats};

use crate::mem::{HeapPages, ReclaimHook};
use std::sync::{Arc, Weak};

/// Build a cache root over the in-process page provider and register it
/// as the provider's reclaim hook. `max_pages` bounds resident pages;
/// exceeding it makes the provider trim the cache before reservations
/// fail.
pub fn create_cache_root(config: CacheConfig, max_pages: Option<u64>) -> Arc<CacheRoot> {
    let provider = Arc::new(match max_pages {
        Some(max) => HeapPages::with_page_budget(max),
        None => HeapPages::new(),
    });
    let root = CacheRoot::new(provider.clone(), config);
    let hook: Weak<dyn ReclaimHook> = Arc::downgrade(&(root.clone() as Arc<dyn ReclaimHook>));
    provider.register_reclaim_hook(hook);
    root
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Result;
    use crate::mem::{PAGES_PER_VIEW, VIEW_SIZE};

    struct Discard;

    impl FileBacking for Discard {
        fn acquire_for_lazy_write(&self, _wait: bool) -> bool {
            true
        }
        fn release_from_lazy_write(&self) {}
        fn write_back(&self, _offset: u64, _data: &[u8]) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_create_cache_root_defaults() {
        let root = create_cache_root(
            CacheConfig {
                enable_lazy_writer: false,
                ..CacheConfig::default()
            },
            None,
        );
        assert_eq!(root.stats().maps, 0);
        assert_eq!(
            root.dirty_page_threshold(),
            CacheConfig::default().dirty_page_threshold
        );
        root.shutdown();
    }

    #[test]
    fn test_page_budget_trims_cache_under_pressure() {
        // Room for exactly two views: reserving a third forces the
        // provider to call back into trim.
        let root = create_cache_root(
            CacheConfig {
                enable_lazy_writer: false,
                ..CacheConfig::default()
            },
            Some(2 * PAGES_PER_VIEW as u64),
        );
        let size = VIEW_SIZE as u64 * 8;
        let h = root
            .init_file_cache(1, size, size, false, Arc::new(Discard))
            .unwrap();

        for i in 0..2u64 {
            let g = h.get_view(i * VIEW_SIZE as u64).unwrap();
            g.release(true, false);
        }
        assert_eq!(h.view_count(), 2);

        // The budget is full; this only succeeds because reclaim evicted
        // one of the clean views.
        let g = h.get_view(2 * VIEW_SIZE as u64).unwrap();
        g.release(true, false);
        assert!(h.view_count() <= 2);
        assert!(root.stats().pages_reclaimed >= PAGES_PER_VIEW as u64);
    }
}
