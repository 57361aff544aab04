//! The process-wide detection context and the event-handler entry surface.
//!
//! One [`Context`] exists per observed process. Application threads drive it
//! concurrently: each holds its own [`ThreadState`] (touched only by that
//! thread, never locked) and calls one entry point per event. All heavy
//! work (epoch bookkeeping, shadow-cell scans, vector-clock transfer,
//! report assembly) happens between the `in_rtl` brackets every entry
//! point maintains.
//!
//! Lock order: sync-table shard, then sync variable, then the thread
//! registry, then the reporter. A holder of a later lock never takes an
//! earlier one. Shadow words are not locked at all: they are read and
//! installed with single aligned atomic operations, and the vector-clock
//! check supplies the semantic guarantee (a lost shadow update can miss a
//! race but never invent one).

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use anyhow::Result;
use tracing::warn;

use crate::clock::VectorClock;
use crate::defs::{Addr, Epoch, Pc, Tid, Uid, SHADOW_CELL, SHADOW_CNT};
use crate::flags::Options;
use crate::report::{
    symbolize_stack, ReportDesc, ReportKind, ReportLocation, ReportMop, ReportSink, ReportThread,
    Reporter, Symbolizer,
};
use crate::shadow::{FastState, Shadow};
use crate::shadow_mem::{CellRef, ShadowMemory};
use crate::stack_trace::StackTrace;
use crate::stats::Stats;
use crate::suppressions::Suppressions;
use crate::sync_tab::SyncTab;
use crate::thread_registry::{FatalError, ThreadRegistry, ThreadStatus};
use crate::trace_ring::{Trace, TraceEventKind};

/// Live heap allocation, for report locations.
#[derive(Debug, Clone)]
pub struct HeapBlock {
    pub addr: Addr,
    pub size: u64,
    pub tid: Tid,
    pub alloc_stack: StackTrace,
}

/// Hot per-thread state. Exists only while the thread is Running and is
/// owned by the thread it describes.
#[derive(Debug)]
pub struct ThreadState {
    pub(crate) fast_state: FastState,
    /// Epoch of this thread's last synchronization; used by `fast_mode` to
    /// skip redundant same-range updates.
    pub(crate) fast_synch_epoch: Epoch,
    pub(crate) clock: VectorClock,
    pub(crate) shadow_stack: Vec<Pc>,
    pub(crate) trace: Arc<Trace>,
    pub(crate) stats: Stats,
    ignore_reads_and_writes: u32,
    ignore_reads: u32,
    ignore_writes: u32,
    ignore_sync: u32,
    in_rtl: u32,
    stk_addr: Addr,
    stk_size: u64,
}

impl ThreadState {
    fn new(tid: Tid, epoch0: Epoch, trace: Arc<Trace>, stk_addr: Addr, stk_size: u64) -> Self {
        Self {
            fast_state: FastState::new(tid, epoch0),
            fast_synch_epoch: epoch0,
            clock: VectorClock::new(),
            shadow_stack: Vec::with_capacity(64),
            trace,
            stats: Stats::default(),
            ignore_reads_and_writes: 0,
            ignore_reads: 0,
            ignore_writes: 0,
            ignore_sync: 0,
            in_rtl: 0,
            stk_addr,
            stk_size,
        }
    }

    pub fn tid(&self) -> Tid {
        self.fast_state.tid()
    }

    pub fn epoch(&self) -> Epoch {
        self.fast_state.epoch()
    }

    /// Bump the epoch and append the matching trace event. Every epoch
    /// increment is paired with exactly one appended event; the trace
    /// ring's epoch→slot bijection depends on it.
    fn trace_tick(&mut self, kind: TraceEventKind, pc: Pc) {
        self.fast_state.increment_epoch();
        self.stats.events += 1;
        self.trace
            .add_event(self.fast_state.epoch(), kind, pc, &self.shadow_stack);
    }

    /// Epoch bump + own-component update preceding a release.
    fn release_tick(&mut self, pc: Pc) -> Epoch {
        self.trace_tick(TraceEventKind::Mop, pc);
        let epoch = self.fast_state.epoch();
        self.clock.set(self.fast_state.tid(), epoch);
        self.fast_synch_epoch = epoch;
        epoch
    }

    fn rtl_enter(&mut self) {
        self.in_rtl += 1;
        debug_assert_eq!(self.in_rtl, 1, "re-entrant event handler");
    }

    fn rtl_exit(&mut self) {
        debug_assert!(self.in_rtl > 0);
        self.in_rtl -= 1;
    }
}

pub struct Context {
    options: Options,
    shadow: ShadowMemory,
    sync_tab: SyncTab,
    threads: RwLock<ThreadRegistry>,
    reporter: Mutex<Reporter>,
    symbolizer: Arc<dyn Symbolizer>,
    heap: Mutex<BTreeMap<Addr, HeapBlock>>,
    stats: Mutex<Stats>,
    finalized: AtomicBool,
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("options", &self.options)
            .field("finalized", &self.finalized)
            .finish_non_exhaustive()
    }
}

impl Context {
    /// Build the context and the main thread's state. Loads suppression
    /// files; a parse failure aborts initialization.
    pub fn new(
        options: Options,
        symbolizer: Arc<dyn Symbolizer>,
        sink: Box<dyn ReportSink>,
    ) -> Result<(Self, ThreadState)> {
        let options = options.sanitize();
        let suppressions = Suppressions::load(&options.suppressions)?;
        let reporter = Reporter::new(
            suppressions,
            sink,
            options.report_format,
            options.num_callers,
            options.generate_suppressions,
        );
        let shadow = ShadowMemory::new(options.max_mem_in_mb);
        let mut registry = ThreadRegistry::new();
        let tid0 = registry
            .create(0, false)
            .expect("fresh registry has room for the main thread");
        let main_thr = {
            let tctx = registry.get_mut(tid0).expect("main context");
            tctx.status = ThreadStatus::Running;
            tctx.epoch0 = tctx.epoch1 + 1;
            let trace = Arc::new(Trace::new());
            tctx.trace = Some(Arc::clone(&trace));
            let mut thr = ThreadState::new(tid0, tctx.epoch0, trace, 0, 0);
            thr.clock.set(tid0, tctx.epoch0);
            thr
        };
        let ctx = Self {
            options,
            shadow,
            sync_tab: SyncTab::new(),
            threads: RwLock::new(registry),
            reporter: Mutex::new(reporter),
            symbolizer,
            heap: Mutex::new(BTreeMap::new()),
            stats: Mutex::new(Stats::default()),
            finalized: AtomicBool::new(false),
        };
        Ok((ctx, main_thr))
    }

    pub fn options(&self) -> &Options {
        &self.options
    }

    /// Non-suppressed reports emitted so far.
    pub fn reported(&self) -> u64 {
        self.lock_reporter().reported()
    }

    pub fn suppressed(&self) -> u64 {
        self.lock_reporter().suppressed()
    }

    pub fn generated_patterns(&self) -> Vec<String> {
        self.lock_reporter().generated_patterns().to_vec()
    }

    /// Exit code the host process should use: `error_exitcode` once a
    /// non-suppressed race was reported, the application's own code
    /// (zero here) otherwise.
    pub fn exit_code(&self) -> i32 {
        if self.options.error_exitcode != 0 && self.lock_reporter().races() > 0 {
            self.options.error_exitcode
        } else {
            0
        }
    }

    // ---------------------------------------------------------------
    // Memory accesses
    // ---------------------------------------------------------------

    /// Sized access, size = `1 << size_log` with size_log in 0..=3.
    pub fn memory_access(
        &self,
        thr: &mut ThreadState,
        pc: Pc,
        addr: Addr,
        size_log: u32,
        is_write: bool,
    ) {
        thr.rtl_enter();
        self.memory_access_impl(thr, pc, addr, size_log, is_write);
        thr.rtl_exit();
    }

    pub fn memory_read(&self, thr: &mut ThreadState, pc: Pc, addr: Addr, size_log: u32) {
        self.memory_access(thr, pc, addr, size_log, false);
    }

    pub fn memory_write(&self, thr: &mut ThreadState, pc: Pc, addr: Addr, size_log: u32) {
        self.memory_access(thr, pc, addr, size_log, true);
    }

    fn memory_access_impl(
        &self,
        thr: &mut ThreadState,
        pc: Pc,
        addr: Addr,
        size_log: u32,
        is_write: bool,
    ) {
        debug_assert!(size_log <= 3);
        // A sized access never straddles a cell boundary.
        debug_assert!((addr & (SHADOW_CELL as u64 - 1)) + (1u64 << size_log) <= SHADOW_CELL as u64);
        thr.stats.mop += 1;
        if is_write {
            thr.stats.mop_write += 1;
        } else {
            thr.stats.mop_read += 1;
        }
        thr.stats.mop_size[size_log as usize] += 1;
        if thr.fast_state.ignore_bit() {
            return;
        }
        if (is_write && thr.ignore_writes > 0) || (!is_write && thr.ignore_reads > 0) {
            return;
        }
        let cell = self.shadow.cell(addr);
        if self.options.literace_sampling > 0
            && cell.is_untouched()
            && !sampled_in(addr, self.options.literace_sampling)
        {
            return;
        }
        thr.trace_tick(TraceEventKind::Mop, pc);
        let mut cur = Shadow::from_fast_state(thr.fast_state);
        cur.set_addr0_and_size_log(addr & (SHADOW_CELL as u64 - 1), size_log);
        cur.set_write(is_write);
        self.update_cell(thr, pc, addr, cur, &cell);
    }

    /// The per-cell race rule: scan the existing words, detect a racing
    /// overlap, then install the candidate.
    fn update_cell(&self, thr: &mut ThreadState, pc: Pc, addr: Addr, cur: Shadow, cell: &CellRef) {
        let mut free_slot = None;
        for i in 0..SHADOW_CNT {
            thr.stats.shadow_processed += 1;
            let old = Shadow::from_raw(cell.word(i).load(Ordering::Relaxed));
            if old.is_zero() {
                thr.stats.shadow_zero += 1;
                if free_slot.is_none() {
                    free_slot = Some(i);
                }
                continue;
            }
            if Shadow::same_access(old, cur) {
                thr.stats.shadow_same_size += 1;
                thr.stats.shadow_same_thread += 1;
                if self.options.fast_mode
                    && old.epoch() >= thr.fast_synch_epoch
                    && old.is_write() == cur.is_write()
                {
                    // Redundant update: nothing changed since the last
                    // synchronization of this thread.
                    thr.stats.mop_same += 1;
                    return;
                }
                cell.word(i).store(cur.raw(), Ordering::Relaxed);
                return;
            }
            if !Shadow::ranges_overlap(old, cur) {
                thr.stats.shadow_not_intersect += 1;
                continue;
            }
            thr.stats.shadow_intersect += 1;
            if old.tid() == cur.tid() {
                thr.stats.shadow_same_thread += 1;
                if Shadow::subsumes(cur, old) {
                    thr.stats.shadow_replace += 1;
                    cell.word(i).store(cur.raw(), Ordering::Relaxed);
                    return;
                }
                continue;
            }
            thr.stats.shadow_another_thread += 1;
            // Happens-before: the current thread already observed the old
            // access's epoch through some synchronization chain.
            if thr.clock.get(old.tid()) >= old.epoch() {
                continue;
            }
            if !old.is_write() && !cur.is_write() {
                continue;
            }
            self.report_race(thr, pc, addr, cur, old);
            break;
        }
        let slot = free_slot
            .unwrap_or_else(|| (cur.epoch() % SHADOW_CNT as u64) as usize);
        if free_slot.is_none() {
            thr.stats.shadow_replace += 1;
        }
        cell.word(slot).store(cur.raw(), Ordering::Relaxed);
    }

    /// Range access, decomposed into an unaligned byte prefix, aligned
    /// 8-byte cells, and an unaligned byte suffix.
    pub fn memory_access_range(
        &self,
        thr: &mut ThreadState,
        pc: Pc,
        addr: Addr,
        size: u64,
        is_write: bool,
    ) {
        thr.rtl_enter();
        self.memory_access_range_impl(thr, pc, addr, size, is_write);
        thr.rtl_exit();
    }

    fn memory_access_range_impl(
        &self,
        thr: &mut ThreadState,
        pc: Pc,
        addr: Addr,
        size: u64,
        is_write: bool,
    ) {
        if size == 0 {
            return;
        }
        thr.stats.mop_range += 1;
        if thr.fast_state.ignore_bit() {
            return;
        }
        thr.trace_tick(TraceEventKind::Mop, pc);
        let fs = thr.fast_state;
        let mut addr = addr;
        let mut size = size;
        let cell_mask = SHADOW_CELL as u64 - 1;
        while addr & cell_mask != 0 && size > 0 {
            self.range_piece(thr, pc, addr, 0, is_write, fs);
            addr += 1;
            size -= 1;
        }
        while size >= SHADOW_CELL as u64 {
            self.range_piece(thr, pc, addr, 3, is_write, fs);
            addr += SHADOW_CELL as u64;
            size -= SHADOW_CELL as u64;
        }
        while size > 0 {
            self.range_piece(thr, pc, addr, 0, is_write, fs);
            addr += 1;
            size -= 1;
        }
    }

    fn range_piece(
        &self,
        thr: &mut ThreadState,
        pc: Pc,
        addr: Addr,
        size_log: u32,
        is_write: bool,
        fs: FastState,
    ) {
        let mut cur = Shadow::from_fast_state(fs);
        cur.set_addr0_and_size_log(addr & (SHADOW_CELL as u64 - 1), size_log);
        cur.set_write(is_write);
        let cell = self.shadow.cell(addr);
        self.update_cell(thr, pc, addr, cur, &cell);
    }

    // ---------------------------------------------------------------
    // Function shadow stack
    // ---------------------------------------------------------------

    pub fn func_enter(&self, thr: &mut ThreadState, pc: Pc) {
        thr.rtl_enter();
        thr.stats.func_enter += 1;
        // Trace first: the part header must snapshot the pre-event stack.
        thr.trace_tick(TraceEventKind::FuncEnter, pc);
        thr.shadow_stack.push(pc);
        thr.rtl_exit();
    }

    pub fn func_exit(&self, thr: &mut ThreadState) {
        thr.rtl_enter();
        thr.stats.func_exit += 1;
        if thr.shadow_stack.is_empty() {
            debug_assert!(false, "func exit with empty shadow stack");
            warn!(tid = thr.tid(), "func exit with empty shadow stack, skipped");
            thr.rtl_exit();
            return;
        }
        thr.trace_tick(TraceEventKind::FuncExit, 0);
        thr.shadow_stack.pop();
        thr.rtl_exit();
    }

    // ---------------------------------------------------------------
    // Synchronization
    // ---------------------------------------------------------------

    pub fn mutex_create(&self, thr: &mut ThreadState, pc: Pc, addr: Addr, is_rw: bool) {
        thr.rtl_enter();
        let var = self
            .sync_tab
            .get_or_create(addr, || StackTrace::capture(&thr.shadow_stack, pc));
        var.write().is_rw = is_rw;
        thr.rtl_exit();
    }

    pub fn mutex_destroy(&self, thr: &mut ThreadState, _pc: Pc, addr: Addr) {
        thr.rtl_enter();
        self.sync_tab.get_and_remove(addr);
        thr.rtl_exit();
    }

    /// Lock acquisition; `write_lock = false` is an rw read-lock.
    pub fn mutex_lock(&self, thr: &mut ThreadState, pc: Pc, addr: Addr, write_lock: bool) {
        thr.rtl_enter();
        if thr.ignore_sync == 0 {
            let var = self
                .sync_tab
                .get_or_create(addr, || StackTrace::capture(&thr.shadow_stack, pc));
            let mut st = var.write();
            thr.clock.acquire(&st.clock);
            if write_lock {
                if st.owner_tid == thr.tid() {
                    st.recursion += 1;
                } else {
                    debug_assert_eq!(st.recursion, 0, "locking a mutex owned by another thread");
                    st.owner_tid = thr.tid();
                    st.recursion = 1;
                }
            }
        }
        thr.rtl_exit();
    }

    /// Lock release. Read-unlock of an rw lock transfers nothing: ordering
    /// flows only from writers.
    pub fn mutex_unlock(&self, thr: &mut ThreadState, pc: Pc, addr: Addr, write_lock: bool) {
        thr.rtl_enter();
        if thr.ignore_sync == 0 && write_lock {
            thr.release_tick(pc);
            let var = self
                .sync_tab
                .get_or_create(addr, || StackTrace::capture(&thr.shadow_stack, pc));
            let mut st = var.write();
            if st.owner_tid != thr.tid() {
                debug_assert!(false, "unlock of a mutex not owned by this thread");
                warn!(tid = thr.tid(), addr, "unlock of unowned mutex");
            } else {
                st.recursion -= 1;
                if st.recursion == 0 {
                    st.owner_tid = crate::defs::INVALID_TID;
                }
            }
            thr.clock.release(&mut st.clock);
        }
        thr.rtl_exit();
    }

    /// Acquire-side events: atomic load, condvar wait (after wakeup),
    /// semaphore wait, barrier wait (after release).
    pub fn acquire(&self, thr: &mut ThreadState, pc: Pc, addr: Addr) {
        thr.rtl_enter();
        self.acquire_impl(thr, pc, addr);
        thr.rtl_exit();
    }

    /// Release-side events: atomic store, condvar signal, semaphore post,
    /// barrier arrival.
    pub fn release(&self, thr: &mut ThreadState, pc: Pc, addr: Addr) {
        thr.rtl_enter();
        self.release_impl(thr, pc, addr);
        thr.rtl_exit();
    }

    fn acquire_impl(&self, thr: &mut ThreadState, pc: Pc, addr: Addr) {
        if thr.ignore_sync > 0 {
            return;
        }
        let var = self
            .sync_tab
            .get_or_create(addr, || StackTrace::capture(&thr.shadow_stack, pc));
        let st = var.read();
        thr.clock.acquire(&st.clock);
    }

    fn release_impl(&self, thr: &mut ThreadState, pc: Pc, addr: Addr) {
        if thr.ignore_sync > 0 {
            return;
        }
        thr.release_tick(pc);
        let var = self
            .sync_tab
            .get_or_create(addr, || StackTrace::capture(&thr.shadow_stack, pc));
        let mut st = var.write();
        thr.clock.release(&mut st.clock);
    }

    pub fn atomic_load(&self, thr: &mut ThreadState, pc: Pc, addr: Addr) {
        self.acquire(thr, pc, addr);
    }

    pub fn atomic_store(&self, thr: &mut ThreadState, pc: Pc, addr: Addr) {
        self.release(thr, pc, addr);
    }

    pub fn sem_wait(&self, thr: &mut ThreadState, pc: Pc, addr: Addr) {
        self.acquire(thr, pc, addr);
    }

    pub fn sem_post(&self, thr: &mut ThreadState, pc: Pc, addr: Addr) {
        self.release(thr, pc, addr);
    }

    pub fn cond_signal(&self, thr: &mut ThreadState, pc: Pc, cv_addr: Addr) {
        self.release(thr, pc, cv_addr);
    }

    /// The mutex handoff around the wait arrives as separate lock events,
    /// so the wait itself transfers nothing on entry.
    pub fn cond_wait_before(&self, thr: &mut ThreadState, _pc: Pc, _cv: Addr, _mutex: Option<Addr>) {
        thr.rtl_enter();
        thr.rtl_exit();
    }

    pub fn cond_wait_after(&self, thr: &mut ThreadState, pc: Pc, cv_addr: Addr) {
        self.acquire(thr, pc, cv_addr);
    }

    pub fn barrier_init(&self, thr: &mut ThreadState, pc: Pc, addr: Addr, _count: u32) {
        thr.rtl_enter();
        self.sync_tab
            .get_or_create(addr, || StackTrace::capture(&thr.shadow_stack, pc));
        thr.rtl_exit();
    }

    pub fn barrier_wait_before(&self, thr: &mut ThreadState, pc: Pc, addr: Addr) {
        self.release(thr, pc, addr);
    }

    pub fn barrier_wait_after(&self, thr: &mut ThreadState, pc: Pc, addr: Addr) {
        self.acquire(thr, pc, addr);
    }

    pub fn set_sync_name(&self, thr: &mut ThreadState, pc: Pc, addr: Addr, name: &str) {
        thr.rtl_enter();
        let var = self
            .sync_tab
            .get_or_create(addr, || StackTrace::capture(&thr.shadow_stack, pc));
        var.write().name = Some(name.to_string());
        thr.rtl_exit();
    }

    // ---------------------------------------------------------------
    // Ignores and publication
    // ---------------------------------------------------------------

    pub fn ignore_access_begin(&self, thr: &mut ThreadState) {
        thr.rtl_enter();
        thr.ignore_reads_and_writes += 1;
        thr.fast_state.set_ignore_bit(true);
        thr.rtl_exit();
    }

    pub fn ignore_access_end(&self, thr: &mut ThreadState) {
        thr.rtl_enter();
        thr.ignore_reads_and_writes = thr.ignore_reads_and_writes.saturating_sub(1);
        if thr.ignore_reads_and_writes == 0 {
            thr.fast_state.set_ignore_bit(false);
        }
        thr.rtl_exit();
    }

    pub fn ignore_reads_begin(&self, thr: &mut ThreadState) {
        thr.rtl_enter();
        thr.ignore_reads += 1;
        thr.rtl_exit();
    }

    pub fn ignore_reads_end(&self, thr: &mut ThreadState) {
        thr.rtl_enter();
        thr.ignore_reads = thr.ignore_reads.saturating_sub(1);
        thr.rtl_exit();
    }

    pub fn ignore_writes_begin(&self, thr: &mut ThreadState) {
        thr.rtl_enter();
        thr.ignore_writes += 1;
        thr.rtl_exit();
    }

    pub fn ignore_writes_end(&self, thr: &mut ThreadState) {
        thr.rtl_enter();
        thr.ignore_writes = thr.ignore_writes.saturating_sub(1);
        thr.rtl_exit();
    }

    pub fn ignore_sync_begin(&self, thr: &mut ThreadState) {
        thr.rtl_enter();
        thr.ignore_sync += 1;
        thr.rtl_exit();
    }

    pub fn ignore_sync_end(&self, thr: &mut ThreadState) {
        thr.rtl_enter();
        thr.ignore_sync = thr.ignore_sync.saturating_sub(1);
        thr.rtl_exit();
    }

    /// Hand a range to other threads: release through a sync variable
    /// keyed by the base address and forget the range's access history.
    pub fn publish_range(&self, thr: &mut ThreadState, pc: Pc, addr: Addr, size: u64) {
        thr.rtl_enter();
        self.release_impl(thr, pc, addr);
        self.shadow.reset_range(addr, size);
        thr.rtl_exit();
    }

    pub fn unpublish_range(&self, thr: &mut ThreadState, _pc: Pc, addr: Addr, size: u64) {
        thr.rtl_enter();
        self.sync_tab.get_and_remove(addr);
        self.shadow.reset_range(addr, size);
        thr.rtl_exit();
    }

    // ---------------------------------------------------------------
    // Allocator events
    // ---------------------------------------------------------------

    /// A fresh allocation wipes whatever history the address range had.
    pub fn malloc(&self, thr: &mut ThreadState, pc: Pc, addr: Addr, size: u64) {
        thr.rtl_enter();
        self.shadow.reset_range(addr, size);
        let block = HeapBlock {
            addr,
            size,
            tid: thr.tid(),
            alloc_stack: StackTrace::capture(&thr.shadow_stack, pc),
        };
        self.heap
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(addr, block);
        thr.rtl_exit();
    }

    /// Freeing is a write of the whole range by the freeing thread, then
    /// the history is wiped.
    pub fn free(&self, thr: &mut ThreadState, pc: Pc, addr: Addr, size: u64) {
        thr.rtl_enter();
        let size = {
            let heap = self.heap.lock().unwrap_or_else(|e| e.into_inner());
            heap.get(&addr).map(|b| b.size).unwrap_or(size)
        };
        self.memory_access_range_impl(thr, pc, addr, size, true);
        self.heap
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&addr);
        self.shadow.reset_range(addr, size);
        thr.rtl_exit();
    }

    // ---------------------------------------------------------------
    // Thread lifecycle
    // ---------------------------------------------------------------

    /// Register a child thread and publish the parent's clock to it.
    pub fn thread_create(&self, thr: &mut ThreadState, pc: Pc, uid: Uid, detached: bool) -> Tid {
        thr.rtl_enter();
        let mut threads = self.lock_threads_write();
        let tid = match threads.create(uid, detached) {
            Ok(tid) => tid,
            Err(err) => self.die(err),
        };
        thr.release_tick(0);
        let tctx = threads.get_mut(tid).expect("just created");
        thr.clock.release(&mut tctx.sync);
        tctx.creation_stack = StackTrace::capture(&thr.shadow_stack, pc);
        drop(threads);
        thr.rtl_exit();
        tid
    }

    /// Start a created thread: build its hot state and acquire the clock
    /// its parent released at create.
    pub fn thread_start(&self, tid: Tid, stk_addr: Addr, stk_size: u64) -> ThreadState {
        if stk_addr != 0 && stk_size != 0 {
            self.shadow.reset_range(stk_addr, stk_size);
        }
        let mut threads = self.lock_threads_write();
        let tctx = threads.get_mut(tid).expect("start of unknown tid");
        if tctx.status != ThreadStatus::Created {
            debug_assert!(false, "thread start from status {:?}", tctx.status);
            warn!(tid, status = ?tctx.status, "thread start from unexpected status");
        }
        tctx.status = ThreadStatus::Running;
        tctx.epoch0 = tctx.epoch1 + 1;
        let trace = Arc::new(Trace::new());
        tctx.trace = Some(Arc::clone(&trace));
        let mut thr = ThreadState::new(tid, tctx.epoch0, trace, stk_addr, stk_size);
        thr.clock.set(tid, tctx.epoch0);
        thr.clock.acquire(&tctx.sync);
        thr
    }

    /// The thread is done running. Joinable threads publish their clock for
    /// the joiner and wait in Finished; detached threads die immediately.
    pub fn thread_finish(&self, mut thr: ThreadState) {
        thr.rtl_enter();
        if thr.stk_addr != 0 && thr.stk_size != 0 {
            self.shadow.reset_range(thr.stk_addr, thr.stk_size);
        }
        let tid = thr.tid();
        let mut threads = self.lock_threads_write();
        let tctx = threads.get_mut(tid).expect("finish of unknown tid");
        if tctx.status != ThreadStatus::Running {
            debug_assert!(false, "thread finish from status {:?}", tctx.status);
            warn!(tid, status = ?tctx.status, "thread finish from unexpected status");
        }
        if tctx.detached {
            tctx.epoch1 = thr.fast_state.epoch();
            threads.make_dead(tid);
        } else {
            thr.release_tick(0);
            thr.clock.release(&mut tctx.sync);
            tctx.epoch1 = thr.fast_state.epoch();
            tctx.status = ThreadStatus::Finished;
        }
        drop(threads);
        self.stats
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .merge(&thr.stats);
        thr.rtl_exit();
        // The trace ring stays alive through the registry's Arc, so races
        // against this thread can still be symbolized.
    }

    /// Join: acquire everything the target released at finish, then recycle
    /// its TID through the quarantine.
    pub fn thread_join(&self, thr: &mut ThreadState, _pc: Pc, uid: Uid) {
        thr.rtl_enter();
        let mut threads = self.lock_threads_write();
        let Some(tid) = threads.find_by_uid(uid) else {
            warn!(uid, "join of non-existent thread");
            thr.rtl_exit();
            return;
        };
        let tctx = threads.get_mut(tid).expect("uid resolved");
        if tctx.detached || tctx.status != ThreadStatus::Finished {
            debug_assert!(false, "join of thread in status {:?}", tctx.status);
            warn!(tid, uid, status = ?tctx.status, "join of unjoinable thread, skipped");
            thr.rtl_exit();
            return;
        }
        thr.clock.acquire(&tctx.sync);
        threads.make_dead(tid);
        thr.rtl_exit();
    }

    pub fn thread_detach(&self, thr: &mut ThreadState, _pc: Pc, uid: Uid) {
        thr.rtl_enter();
        let mut threads = self.lock_threads_write();
        let Some(tid) = threads.find_by_uid(uid) else {
            warn!(uid, "detach of non-existent thread");
            thr.rtl_exit();
            return;
        };
        let tctx = threads.get_mut(tid).expect("uid resolved");
        if tctx.status == ThreadStatus::Finished {
            threads.make_dead(tid);
        } else {
            tctx.detached = true;
        }
        thr.rtl_exit();
    }

    pub fn set_thread_name(&self, thr: &mut ThreadState, name: &str) {
        thr.rtl_enter();
        let tid = thr.tid();
        let mut threads = self.lock_threads_write();
        if let Some(tctx) = threads.get_mut(tid) {
            tctx.name = Some(name.to_string());
        }
        thr.rtl_exit();
    }

    /// End of the observed program: report joinable threads that are still
    /// around as leaks, flush statistics. The engine is inert afterwards.
    pub fn finalize(&self, thr: &mut ThreadState) {
        thr.rtl_enter();
        if self.finalized.swap(true, Ordering::SeqCst) {
            thr.rtl_exit();
            return;
        }
        let threads = self.lock_threads_read();
        for tctx in threads.iter() {
            if tctx.tid == thr.tid() || tctx.detached {
                continue;
            }
            if !matches!(
                tctx.status,
                ThreadStatus::Created | ThreadStatus::Running | ThreadStatus::Finished
            ) {
                continue;
            }
            let report = ReportDesc {
                kind: ReportKind::ThreadLeak,
                mops: Vec::new(),
                location: None,
                threads: vec![ReportThread {
                    tid: tctx.tid,
                    running: tctx.status != ThreadStatus::Finished,
                    name: tctx.name.clone(),
                    stack: symbolize_stack(self.symbolizer.as_ref(), &tctx.creation_stack),
                }],
            };
            self.lock_reporter().handle(report);
        }
        drop(threads);
        if self.options.collect_stats {
            let mut stats = self.stats.lock().unwrap_or_else(|e| e.into_inner());
            stats.merge(&thr.stats);
            thr.stats = Stats::default();
            eprintln!("{}", stats.render());
        }
        thr.rtl_exit();
    }

    // ---------------------------------------------------------------
    // Race reporting
    // ---------------------------------------------------------------

    fn report_race(&self, thr: &mut ThreadState, pc: Pc, addr: Addr, cur: Shadow, old: Shadow) {
        let cell_base = addr & !(SHADOW_CELL as u64 - 1);
        let cur_stack = StackTrace::capture(&thr.shadow_stack, pc);
        // Registry before reporter, per the lock order.
        let threads = self.lock_threads_read();
        let prev_stack = threads
            .get(old.tid())
            .and_then(|t| t.trace.as_ref())
            .and_then(|trace| trace.restore_stack(old.epoch()))
            .unwrap_or_default();
        let mut report_threads = Vec::new();
        for tid in [thr.tid(), old.tid()] {
            if let Some(tctx) = threads.get(tid) {
                if tctx.creation_stack.is_empty() {
                    continue;
                }
                report_threads.push(ReportThread {
                    tid,
                    running: tctx.status == ThreadStatus::Running,
                    name: tctx.name.clone(),
                    stack: symbolize_stack(self.symbolizer.as_ref(), &tctx.creation_stack),
                });
            }
        }
        let report = ReportDesc {
            kind: ReportKind::DataRace,
            mops: vec![
                ReportMop {
                    tid: thr.tid(),
                    pc,
                    addr: cell_base + cur.addr0(),
                    size: cur.size(),
                    write: cur.is_write(),
                    stack: symbolize_stack(self.symbolizer.as_ref(), &cur_stack),
                },
                ReportMop {
                    tid: old.tid(),
                    pc: prev_stack.top().unwrap_or(0),
                    addr: cell_base + old.addr0(),
                    size: old.size(),
                    write: old.is_write(),
                    stack: symbolize_stack(self.symbolizer.as_ref(), &prev_stack),
                },
            ],
            location: self.locate(thr, addr),
            threads: report_threads,
        };
        drop(threads);
        self.lock_reporter().handle(report);
    }

    fn locate(&self, thr: &ThreadState, addr: Addr) -> Option<ReportLocation> {
        {
            let heap = self.heap.lock().unwrap_or_else(|e| e.into_inner());
            if let Some((_, block)) = heap.range(..=addr).next_back() {
                if addr < block.addr + block.size {
                    return Some(ReportLocation::Heap {
                        addr: block.addr,
                        size: block.size,
                        tid: block.tid,
                        alloc_stack: symbolize_stack(self.symbolizer.as_ref(), &block.alloc_stack),
                    });
                }
            }
        }
        if let Some((name, size, base)) = self.symbolizer.global_at(addr) {
            return Some(ReportLocation::Global {
                name,
                size,
                addr: base,
            });
        }
        if thr.stk_size != 0 && addr >= thr.stk_addr && addr < thr.stk_addr + thr.stk_size {
            return Some(ReportLocation::Stack { tid: thr.tid() });
        }
        None
    }

    // ---------------------------------------------------------------
    // Internals
    // ---------------------------------------------------------------

    fn lock_threads_read(&self) -> std::sync::RwLockReadGuard<'_, ThreadRegistry> {
        self.threads.read().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_threads_write(&self) -> std::sync::RwLockWriteGuard<'_, ThreadRegistry> {
        self.threads.write().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_reporter(&self) -> std::sync::MutexGuard<'_, Reporter> {
        self.reporter.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn die(&self, err: FatalError) -> ! {
        tracing::error!(%err, "fatal error, aborting");
        eprintln!("carrera: {err}");
        std::process::abort();
    }
}

/// Deterministic address sampling: an untouched cell participates only
/// when the mixed cell index clears the low `k` bits.
fn sampled_in(addr: Addr, k: u32) -> bool {
    let h = (addr >> 3).wrapping_mul(0x9E37_79B9_7F4A_7C15);
    (h >> 32) & ((1 << k) - 1) == 0
}
