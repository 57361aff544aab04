//! Shadow memory: per-byte access history for application memory.
//!
//! Every aligned 8-byte application cell maps to [`SHADOW_CNT`] shadow
//! words. Words are plain `AtomicU64`s: the hot path reads and installs
//! them with single relaxed operations and never takes a lock. Lost updates
//! under concurrent installs into the same cell are tolerated; the vector
//! clock check is what decides races, so a lost update can at worst miss a
//! race, never invent one.
//!
//! The store is paged: a page directory (sharded, read-mostly) maps page
//! indices to demand-allocated pages of atomic words. This keeps the dense
//! address → cell mapping of the original scheme while allocating only for
//! memory the application actually touches.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};

use tracing::warn;

use crate::defs::{Addr, SHADOW_CELL, SHADOW_CNT};

/// Cells per page. A page covers `PAGE_CELLS * 8` bytes of application
/// memory and holds `PAGE_CELLS * SHADOW_CNT` shadow words.
const PAGE_CELLS: usize = 512;
const PAGE_WORDS: usize = PAGE_CELLS * SHADOW_CNT;
const PAGE_BYTES: usize = PAGE_WORDS * 8;
const DIR_SHARDS: usize = 64;

pub struct ShadowPage {
    words: Box<[AtomicU64; PAGE_WORDS]>,
}

impl ShadowPage {
    fn new() -> Arc<Self> {
        // Zero-initialized: every word starts as "no access recorded".
        let words: Box<[AtomicU64]> = (0..PAGE_WORDS).map(|_| AtomicU64::new(0)).collect();
        let words = words.try_into().unwrap_or_else(|_| unreachable!());
        Arc::new(Self { words })
    }
}

/// Handle to the [`SHADOW_CNT`] words of one cell.
pub struct CellRef {
    page: Arc<ShadowPage>,
    base: usize,
}

impl CellRef {
    pub fn word(&self, i: usize) -> &AtomicU64 {
        debug_assert!(i < SHADOW_CNT);
        &self.page.words[self.base + i]
    }

    /// True when no access is recorded in any slot.
    pub fn is_untouched(&self) -> bool {
        (0..SHADOW_CNT).all(|i| self.word(i).load(Ordering::Relaxed) == 0)
    }
}

pub struct ShadowMemory {
    shards: Vec<RwLock<HashMap<u64, Arc<ShadowPage>>>>,
    bytes_allocated: AtomicUsize,
    /// Soft cap in bytes; 0 disables.
    max_bytes: usize,
    evicting: AtomicBool,
}

impl ShadowMemory {
    pub fn new(max_mem_in_mb: usize) -> Self {
        Self {
            shards: (0..DIR_SHARDS).map(|_| RwLock::new(HashMap::new())).collect(),
            bytes_allocated: AtomicUsize::new(0),
            max_bytes: max_mem_in_mb * 1024 * 1024,
            evicting: AtomicBool::new(false),
        }
    }

    /// Shadow cell for the application cell containing `addr`, allocating
    /// its page on first touch.
    pub fn cell(&self, addr: Addr) -> CellRef {
        let cell_idx = addr / SHADOW_CELL as u64;
        let page_idx = cell_idx / PAGE_CELLS as u64;
        let base = (cell_idx % PAGE_CELLS as u64) as usize * SHADOW_CNT;
        let page = self.page(page_idx);
        CellRef { page, base }
    }

    /// Zero every shadow word of cells overlapping `[addr, addr + size)`.
    /// Never allocates: untouched ranges have nothing to clear.
    pub fn reset_range(&self, addr: Addr, size: u64) {
        if size == 0 {
            return;
        }
        let first_cell = addr / SHADOW_CELL as u64;
        let last_cell = (addr + size - 1) / SHADOW_CELL as u64;
        for cell_idx in first_cell..=last_cell {
            let page_idx = cell_idx / PAGE_CELLS as u64;
            let shard = &self.shards[(page_idx as usize) % DIR_SHARDS];
            let dir = shard.read().unwrap_or_else(|e| e.into_inner());
            if let Some(page) = dir.get(&page_idx) {
                let base = (cell_idx % PAGE_CELLS as u64) as usize * SHADOW_CNT;
                for w in &page.words[base..base + SHADOW_CNT] {
                    w.store(0, Ordering::Relaxed);
                }
            }
        }
    }

    pub fn allocated_bytes(&self) -> usize {
        self.bytes_allocated.load(Ordering::Relaxed)
    }

    fn page(&self, page_idx: u64) -> Arc<ShadowPage> {
        let shard = &self.shards[(page_idx as usize) % DIR_SHARDS];
        {
            let dir = shard.read().unwrap_or_else(|e| e.into_inner());
            if let Some(page) = dir.get(&page_idx) {
                return Arc::clone(page);
            }
        }
        if self.max_bytes != 0
            && self.bytes_allocated.load(Ordering::Relaxed) + PAGE_BYTES > self.max_bytes
        {
            self.evict_all();
        }
        let mut dir = shard.write().unwrap_or_else(|e| e.into_inner());
        // Another writer may have inserted while we upgraded.
        if let Some(page) = dir.get(&page_idx) {
            return Arc::clone(page);
        }
        let page = ShadowPage::new();
        self.bytes_allocated.fetch_add(PAGE_BYTES, Ordering::Relaxed);
        dir.insert(page_idx, Arc::clone(&page));
        page
    }

    /// Aggressive eviction when the soft cap is exceeded: drop every page.
    /// Discarded history can miss races, never invent them.
    fn evict_all(&self) {
        if self.evicting.swap(true, Ordering::AcqRel) {
            return;
        }
        let mut freed = 0usize;
        for shard in &self.shards {
            let mut dir = shard.write().unwrap_or_else(|e| e.into_inner());
            freed += dir.len() * PAGE_BYTES;
            dir.clear();
        }
        self.bytes_allocated.fetch_sub(freed, Ordering::Relaxed);
        warn!(
            freed_bytes = freed,
            cap_bytes = self.max_bytes,
            "shadow memory exceeded soft cap, evicted all access history"
        );
        self.evicting.store(false, Ordering::Release);
    }
}
