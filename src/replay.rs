//! Replay front-end: drives the engine from a recorded event log.
//!
//! The log identifies threads by front-end uids; the replayer owns the
//! uid → [`ThreadState`] mapping and the pending created-but-not-started
//! set, mirroring what an in-process instrumentation front-end keeps in
//! thread-local storage.
//!
//! The record for uid 0 is the main thread, which exists from the start.
//! Its finish event marks the end of the observed program: the replayer
//! finalizes there when `exit_after_main` is set, and otherwise at end of
//! stream. Events naming unknown uids are protocol violations; they are
//! logged and skipped, matching the engine's release-build policy.

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::sync::Arc;

use anyhow::{Context as _, Result};
use tracing::{debug, info, warn};

use crate::defs::{Tid, Uid};
use crate::engine::{Context, ThreadState};
use crate::event::{size_log, Event, TraceInput};
use crate::flags::Options;
use crate::report::{ReportSink, StderrSink, Symbolizer};

/// Outcome of a replay run.
#[derive(Debug, Clone)]
pub struct ReplaySummary {
    pub events: u64,
    pub reported: u64,
    pub suppressed: u64,
    pub exit_code: i32,
    pub patterns: Vec<String>,
}

pub struct Replayer {
    ctx: Context,
    main: Option<ThreadState>,
    states: HashMap<Uid, ThreadState>,
    pending: HashMap<Uid, Tid>,
    events: u64,
    done: bool,
}

impl Replayer {
    pub fn new(
        options: Options,
        symbolizer: Arc<dyn Symbolizer>,
        sink: Box<dyn ReportSink>,
    ) -> Result<Self> {
        let (ctx, main) = Context::new(options, symbolizer, sink)?;
        Ok(Self {
            ctx,
            main: Some(main),
            states: HashMap::new(),
            pending: HashMap::new(),
            events: 0,
            done: false,
        })
    }

    /// Feed the whole stream, then finalize.
    pub fn run(mut self, reader: impl BufRead) -> Result<ReplaySummary> {
        for (lineno, line) in reader.lines().enumerate() {
            let line = line.context("failed to read trace input")?;
            if line.trim().is_empty() {
                continue;
            }
            let event: Event = serde_json::from_str(&line)
                .with_context(|| format!("malformed trace record on line {}", lineno + 1))?;
            self.apply(event);
            if self.done {
                debug!(line = lineno + 1, "main finished, remaining trace ignored");
                break;
            }
        }
        Ok(self.finish())
    }

    /// Apply one event. Unknown actors are skipped with a warning.
    pub fn apply(&mut self, event: Event) {
        self.events += 1;
        let uid = event.actor();
        match event {
            Event::ThreadStart {
                tid: _,
                stack_addr,
                stack_size,
            } => {
                let Some(tid) = self.pending.remove(&uid) else {
                    warn!(uid, "thread start without a preceding create, skipped");
                    return;
                };
                let thr = self.ctx.thread_start(tid, stack_addr, stack_size);
                self.states.insert(uid, thr);
            }
            Event::ThreadFinish { .. } if uid == 0 => {
                // End of the observed program; the engine-side finish of
                // the main thread happens at finalize.
                if self.ctx.options().exit_after_main {
                    self.done = true;
                }
            }
            Event::ThreadFinish { .. } => {
                let Some(thr) = self.states.remove(&uid) else {
                    warn!(uid, "finish of unknown thread, skipped");
                    return;
                };
                self.ctx.thread_finish(thr);
            }
            event => {
                let thr = if uid == 0 {
                    self.main.as_mut()
                } else {
                    self.states.get_mut(&uid)
                };
                let Some(thr) = thr else {
                    warn!(uid, ?event, "event for unknown thread, skipped");
                    return;
                };
                dispatch(&self.ctx, &mut self.pending, thr, event);
            }
        }
    }

    fn finish(mut self) -> ReplaySummary {
        if let Some(mut main) = self.main.take() {
            self.ctx.finalize(&mut main);
        }
        ReplaySummary {
            events: self.events,
            reported: self.ctx.reported(),
            suppressed: self.ctx.suppressed(),
            exit_code: self.ctx.exit_code(),
            patterns: self.ctx.generated_patterns(),
        }
    }
}

fn dispatch(ctx: &Context, pending: &mut HashMap<Uid, Tid>, thr: &mut ThreadState, event: Event) {
    match event {
        Event::Read {
            pc, addr, size, ..
        } => match size_log(size) {
            Some(sl) => ctx.memory_read(thr, pc, addr, sl),
            None => ctx.memory_access_range(thr, pc, addr, size, false),
        },
        Event::Write {
            pc, addr, size, ..
        } => match size_log(size) {
            Some(sl) => ctx.memory_write(thr, pc, addr, sl),
            None => ctx.memory_access_range(thr, pc, addr, size, true),
        },
        Event::ReadRange {
            pc, addr, size, ..
        } => ctx.memory_access_range(thr, pc, addr, size, false),
        Event::WriteRange {
            pc, addr, size, ..
        } => ctx.memory_access_range(thr, pc, addr, size, true),
        Event::FuncEnter { pc, .. } => ctx.func_enter(thr, pc),
        Event::FuncExit { .. } => ctx.func_exit(thr),
        Event::ThreadCreate {
            pc,
            child,
            detached,
            ..
        } => {
            let tid = ctx.thread_create(thr, pc, child, detached);
            pending.insert(child, tid);
        }
        Event::ThreadJoin { pc, target, .. } => ctx.thread_join(thr, pc, target),
        Event::ThreadDetach { pc, target, .. } => ctx.thread_detach(thr, pc, target),
        Event::MutexCreate { pc, addr, rw, .. } => ctx.mutex_create(thr, pc, addr, rw),
        Event::MutexDestroy { pc, addr, .. } => ctx.mutex_destroy(thr, pc, addr),
        Event::MutexLock {
            pc, addr, write, ..
        } => ctx.mutex_lock(thr, pc, addr, write),
        Event::MutexUnlock {
            pc, addr, write, ..
        } => ctx.mutex_unlock(thr, pc, addr, write),
        Event::AtomicLoad { pc, addr, .. } => ctx.atomic_load(thr, pc, addr),
        Event::AtomicStore { pc, addr, .. } => ctx.atomic_store(thr, pc, addr),
        Event::SemWait { pc, addr, .. } => ctx.sem_wait(thr, pc, addr),
        Event::SemPost { pc, addr, .. } => ctx.sem_post(thr, pc, addr),
        Event::CondSignal { pc, cv, .. } => ctx.cond_signal(thr, pc, cv),
        Event::CondWaitBefore { pc, cv, mutex, .. } => ctx.cond_wait_before(thr, pc, cv, mutex),
        Event::CondWaitAfter { pc, cv, .. } => ctx.cond_wait_after(thr, pc, cv),
        Event::BarrierInit {
            pc, addr, count, ..
        } => ctx.barrier_init(thr, pc, addr, count),
        Event::BarrierWaitBefore { pc, addr, .. } => ctx.barrier_wait_before(thr, pc, addr),
        Event::BarrierWaitAfter { pc, addr, .. } => ctx.barrier_wait_after(thr, pc, addr),
        Event::Malloc {
            pc, addr, size, ..
        } => ctx.malloc(thr, pc, addr, size),
        Event::Free {
            pc, addr, size, ..
        } => ctx.free(thr, pc, addr, size),
        Event::IgnoreBegin { .. } => ctx.ignore_access_begin(thr),
        Event::IgnoreEnd { .. } => ctx.ignore_access_end(thr),
        Event::IgnoreReadsBegin { .. } => ctx.ignore_reads_begin(thr),
        Event::IgnoreReadsEnd { .. } => ctx.ignore_reads_end(thr),
        Event::IgnoreWritesBegin { .. } => ctx.ignore_writes_begin(thr),
        Event::IgnoreWritesEnd { .. } => ctx.ignore_writes_end(thr),
        Event::IgnoreSyncBegin { .. } => ctx.ignore_sync_begin(thr),
        Event::IgnoreSyncEnd { .. } => ctx.ignore_sync_end(thr),
        Event::Publish {
            pc, addr, size, ..
        } => ctx.publish_range(thr, pc, addr, size),
        Event::Unpublish {
            pc, addr, size, ..
        } => ctx.unpublish_range(thr, pc, addr, size),
        Event::ThreadName { name, .. } => ctx.set_thread_name(thr, &name),
        Event::LockName { addr, name, .. } => ctx.set_sync_name(thr, 0, addr, &name),
        Event::ThreadStart { .. } | Event::ThreadFinish { .. } => {
            unreachable!("handled by the replayer")
        }
    }
}

/// Replay a recorded trace with the default stderr sink.
pub fn replay(input: &TraceInput, options: Options, symbolizer: Arc<dyn Symbolizer>) -> Result<ReplaySummary> {
    let replayer = Replayer::new(options, symbolizer, Box::new(StderrSink))?;
    let summary = match input {
        TraceInput::Stdin => replayer.run(std::io::stdin().lock())?,
        TraceInput::File(path) => {
            let file = File::open(path)
                .with_context(|| format!("failed to open trace {}", path.display()))?;
            replayer.run(BufReader::new(file))?
        }
    };
    info!(
        events = summary.events,
        reported = summary.reported,
        suppressed = summary.suppressed,
        "replay complete"
    );
    Ok(summary)
}
