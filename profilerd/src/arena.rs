//! Fixed-size page-backed buffer arena (§4.B). Allocates anonymous
//! read/write pages on demand; no pooling, since a fresh page guarantees no
//! stale bytes leak into the trace if an encode aborts mid-write.

use memmap2::MmapMut;

/// One fixed-capacity page handed to a `LogBuffer`. Freed (munmapped) when
/// dropped; the arena itself holds no state beyond the configured page size.
pub struct Page {
    map: MmapMut,
}

impl Page {
    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.map
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.map
    }
}

/// Allocates fixed-size anonymous pages. Thread-safe by construction: every
/// allocation is an independent `mmap` call, so there is no shared
/// allocator state to synchronize (§5 "Arena: thread-safe page allocator
/// (backed by OS); no user-level locking").
#[derive(Debug, Clone, Copy)]
pub struct Arena {
    page_size: usize,
}

impl Arena {
    pub fn new(page_size: usize) -> Self {
        Arena { page_size }
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Maps a fresh zeroed page. Returns `None` on allocation failure; the
    /// caller (an encoder via `ensure_capacity`) treats this as a dropped
    /// event (`DropReason::AllocFailed`), never an error.
    pub fn alloc_page(&self) -> Option<Page> {
        let map = MmapMut::map_anon(self.page_size).ok()?;
        advise_hugepage_if_possible(&map);
        Some(Page { map })
    }
}

impl Default for Arena {
    fn default() -> Self {
        // 64 KiB, per §2/§4.B.
        Arena::new(64 * 1024)
    }
}

#[cfg(target_os = "linux")]
fn advise_hugepage_if_possible(map: &MmapMut) {
    // Best-effort: a larger backing page reduces TLB pressure for the
    // hottest per-thread buffers. Failure is silently ignored.
    unsafe {
        libc::madvise(
            map.as_ptr() as *mut libc::c_void,
            map.len(),
            libc::MADV_HUGEPAGE,
        );
    }
}

#[cfg(not(target_os = "linux"))]
fn advise_hugepage_if_possible(_map: &MmapMut) {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_page_returns_a_zeroed_page_of_the_configured_size() {
        let arena = Arena::new(4096);
        let page = arena.alloc_page().expect("mmap should succeed in tests");
        assert_eq!(page.len(), 4096);
        assert!(page.as_slice().iter().all(|&b| b == 0));
    }

    #[test]
    fn default_arena_uses_64_kib_pages() {
        let arena = Arena::default();
        assert_eq!(arena.page_size(), 64 * 1024);
    }
}
