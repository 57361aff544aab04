//! Synchronization variables and the address-keyed table holding them.
//!
//! Every mutex, rw-lock, atomic, semaphore, condvar or barrier the
//! application synchronizes through is tracked by its address. The sync
//! variable carries the vector clock that transfers happens-before between
//! threads, plus mutex bookkeeping (owner, recursion depth).
//!
//! The table is sharded: shard index is `(addr >> 3) % SYNC_TAB_PARTS`, each
//! shard with its own read/write lock over its bucket. Lookup walks the
//! bucket under the shard read lock; a miss upgrades to the shard write
//! lock and re-checks before inserting (another writer may have won the
//! upgrade race). The per-variable lock is taken only after the shard lock
//! is dropped, preserving the shard > variable lock order.

use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::clock::VectorClock;
use crate::defs::{Addr, Tid, INVALID_TID, SYNC_TAB_PARTS};
use crate::stack_trace::StackTrace;

/// Mutable state of one sync variable, behind its own read/write lock.
#[derive(Debug)]
pub struct SyncState {
    pub clock: VectorClock,
    pub owner_tid: Tid,
    pub recursion: u32,
    pub is_rw: bool,
    pub name: Option<String>,
}

impl Default for SyncState {
    fn default() -> Self {
        Self {
            clock: VectorClock::new(),
            owner_tid: INVALID_TID,
            recursion: 0,
            is_rw: false,
            name: None,
        }
    }
}

#[derive(Debug)]
pub struct SyncVar {
    pub addr: Addr,
    pub creation_stack: StackTrace,
    state: RwLock<SyncState>,
}

impl SyncVar {
    fn new(addr: Addr, creation_stack: StackTrace) -> Arc<Self> {
        Arc::new(Self {
            addr,
            creation_stack,
            state: RwLock::new(SyncState::default()),
        })
    }

    pub fn read(&self) -> RwLockReadGuard<'_, SyncState> {
        self.state.read().unwrap_or_else(|e| e.into_inner())
    }

    pub fn write(&self) -> RwLockWriteGuard<'_, SyncState> {
        self.state.write().unwrap_or_else(|e| e.into_inner())
    }
}

type Shard = RwLock<HashMap<Addr, Arc<SyncVar>>>;

pub struct SyncTab {
    shards: Vec<Shard>,
}

impl Default for SyncTab {
    fn default() -> Self {
        Self::new()
    }
}

impl SyncTab {
    pub fn new() -> Self {
        Self {
            shards: (0..SYNC_TAB_PARTS).map(|_| RwLock::new(HashMap::new())).collect(),
        }
    }

    /// The variable at `addr`, created on first use with `creation_stack`.
    /// The caller locks the returned variable in the mode it needs.
    pub fn get_or_create(
        &self,
        addr: Addr,
        creation_stack: impl FnOnce() -> StackTrace,
    ) -> Arc<SyncVar> {
        let shard = self.shard(addr);
        {
            let bucket = shard.read().unwrap_or_else(|e| e.into_inner());
            if let Some(var) = bucket.get(&addr) {
                return Arc::clone(var);
            }
        }
        let mut bucket = shard.write().unwrap_or_else(|e| e.into_inner());
        if let Some(var) = bucket.get(&addr) {
            return Arc::clone(var);
        }
        let var = SyncVar::new(addr, creation_stack());
        bucket.insert(addr, Arc::clone(&var));
        var
    }

    /// Look up without creating.
    pub fn get(&self, addr: Addr) -> Option<Arc<SyncVar>> {
        let bucket = self.shard(addr).read().unwrap_or_else(|e| e.into_inner());
        bucket.get(&addr).cloned()
    }

    /// Unlink the variable at `addr`, then briefly write-lock it so
    /// in-flight holders drain before the caller reuses the address.
    pub fn get_and_remove(&self, addr: Addr) -> Option<Arc<SyncVar>> {
        let var = {
            let mut bucket = self.shard(addr).write().unwrap_or_else(|e| e.into_inner());
            bucket.remove(&addr)
        }?;
        drop(var.write());
        Some(var)
    }

    /// Number of live variables, across all shards.
    pub fn len(&self) -> usize {
        self.shards
            .iter()
            .map(|s| s.read().unwrap_or_else(|e| e.into_inner()).len())
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn shard(&self, addr: Addr) -> &Shard {
        &self.shards[((addr >> 3) as usize) % SYNC_TAB_PARTS]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_single_instance_per_address() {
        let tab = SyncTab::new();
        let a = tab.get_or_create(0x1000, StackTrace::new);
        let b = tab.get_or_create(0x1000, StackTrace::new);
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(tab.len(), 1);
    }

    #[test]
    fn test_distinct_addresses_distinct_vars() {
        let tab = SyncTab::new();
        let a = tab.get_or_create(0x1000, StackTrace::new);
        let b = tab.get_or_create(0x1008, StackTrace::new);
        assert!(!Arc::ptr_eq(&a, &b));
        assert_eq!(tab.len(), 2);
    }

    #[test]
    fn test_creation_stack_captured_once() {
        let tab = SyncTab::new();
        let calls = AtomicUsize::new(0);
        let mk = || {
            calls.fetch_add(1, Ordering::Relaxed);
            StackTrace::from_pcs(vec![0x42])
        };
        tab.get_or_create(0x2000, mk);
        let mk2 = || {
            calls.fetch_add(1, Ordering::Relaxed);
            StackTrace::new()
        };
        let var = tab.get_or_create(0x2000, mk2);
        assert_eq!(calls.load(Ordering::Relaxed), 1);
        assert_eq!(var.creation_stack.pcs(), &[0x42]);
    }

    #[test]
    fn test_remove_unlinks() {
        let tab = SyncTab::new();
        tab.get_or_create(0x3000, StackTrace::new);
        let removed = tab.get_and_remove(0x3000);
        assert!(removed.is_some());
        assert!(tab.get(0x3000).is_none());
        assert!(tab.is_empty());
        // Removing again is a no-op.
        assert!(tab.get_and_remove(0x3000).is_none());
    }

    #[test]
    fn test_state_roundtrip() {
        let tab = SyncTab::new();
        let var = tab.get_or_create(0x4000, StackTrace::new);
        {
            let mut st = var.write();
            st.owner_tid = 3;
            st.recursion = 2;
            st.clock.set(3, 55);
        }
        let st = var.read();
        assert_eq!(st.owner_tid, 3);
        assert_eq!(st.recursion, 2);
        assert_eq!(st.clock.get(3), 55);
    }

    #[test]
    fn test_concurrent_get_or_create_single_winner() {
        let tab = Arc::new(SyncTab::new());
        let vars: Vec<_> = std::thread::scope(|s| {
            (0..8)
                .map(|_| {
                    let tab = Arc::clone(&tab);
                    s.spawn(move || tab.get_or_create(0x5000, StackTrace::new))
                })
                .collect::<Vec<_>>()
                .into_iter()
                .map(|h| h.join().unwrap())
                .collect()
        });
        assert_eq!(tab.len(), 1);
        for v in &vars[1..] {
            assert!(Arc::ptr_eq(&vars[0], v));
        }
    }
}
