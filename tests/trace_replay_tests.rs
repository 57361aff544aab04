//! Determinism laws of the engine, driven through the replay front-end.

use std::io::Cursor;
use std::sync::Arc;

use carrera::defs::{Addr, Uid, TRACE_SIZE};
use carrera::engine::{Context, ThreadState};
use carrera::flags::Options;
use carrera::replay::Replayer;
use carrera::report::{CollectingSink, NoopSymbolizer, ReportDesc};

fn replay_trace(trace: &str, options: Options) -> Vec<ReportDesc> {
    let sink = CollectingSink::new();
    let replayer = Replayer::new(options, Arc::new(NoopSymbolizer), Box::new(sink.clone())).unwrap();
    replayer.run(Cursor::new(trace.to_string())).unwrap();
    sink.reports()
}

fn report_shape(reports: &[ReportDesc]) -> Vec<(u32, u64, u64, bool)> {
    reports
        .iter()
        .flat_map(|r| r.mops.iter().map(|m| (m.tid, m.addr, m.size, m.write)))
        .collect()
}

const RACY_TRACE: &str = r#"
{"ev":"thread_create","tid":0,"pc":1,"child":1}
{"ev":"thread_start","tid":1}
{"ev":"thread_create","tid":0,"pc":2,"child":2}
{"ev":"thread_start","tid":2}
{"ev":"func_enter","tid":1,"pc":4096}
{"ev":"write","tid":1,"pc":4112,"addr":32768,"size":4}
{"ev":"func_exit","tid":1}
{"ev":"func_enter","tid":2,"pc":8192}
{"ev":"write","tid":2,"pc":8208,"addr":32768,"size":4}
{"ev":"func_exit","tid":2}
{"ev":"thread_finish","tid":1}
{"ev":"thread_finish","tid":2}
{"ev":"thread_join","tid":0,"pc":3,"target":1}
{"ev":"thread_join","tid":0,"pc":4,"target":2}
"#;

#[test]
fn test_replay_is_idempotent() {
    // Replaying the same event trace with fresh state yields the same
    // set of reports.
    let first = replay_trace(RACY_TRACE, Options::default());
    let second = replay_trace(RACY_TRACE, Options::default());
    assert_eq!(first.len(), 1);
    assert_eq!(report_shape(&first), report_shape(&second));
    let kinds: Vec<_> = first.iter().map(|r| r.kind).collect();
    let kinds2: Vec<_> = second.iter().map(|r| r.kind).collect();
    assert_eq!(kinds, kinds2);
}

#[test]
fn test_unordered_disjoint_events_commute() {
    // An unrelated write to a disjoint address may move across the racy
    // pair without changing the outcome.
    let with_early_noise = r#"
{"ev":"thread_create","tid":0,"pc":1,"child":1}
{"ev":"thread_start","tid":1}
{"ev":"thread_create","tid":0,"pc":2,"child":2}
{"ev":"thread_start","tid":2}
{"ev":"write","tid":0,"pc":99,"addr":65536,"size":8}
{"ev":"write","tid":1,"pc":256,"addr":32768,"size":4}
{"ev":"write","tid":2,"pc":512,"addr":32768,"size":4}
"#;
    let with_late_noise = r#"
{"ev":"thread_create","tid":0,"pc":1,"child":1}
{"ev":"thread_start","tid":1}
{"ev":"thread_create","tid":0,"pc":2,"child":2}
{"ev":"thread_start","tid":2}
{"ev":"write","tid":1,"pc":256,"addr":32768,"size":4}
{"ev":"write","tid":2,"pc":512,"addr":32768,"size":4}
{"ev":"write","tid":0,"pc":99,"addr":65536,"size":8}
"#;
    let early = replay_trace(with_early_noise, Options::default());
    let late = replay_trace(with_late_noise, Options::default());
    assert_eq!(report_shape(&early), report_shape(&late));
}

#[test]
fn test_fast_mode_does_not_change_reports() {
    let strict = replay_trace(RACY_TRACE, Options::default());
    let fast = replay_trace(
        RACY_TRACE,
        Options {
            fast_mode: true,
            ..Options::default()
        },
    );
    assert_eq!(report_shape(&strict), report_shape(&fast));
}

#[test]
fn test_sampling_never_invents_reports() {
    let baseline = replay_trace(RACY_TRACE, Options::default());
    let sampled = replay_trace(
        RACY_TRACE,
        Options {
            literace_sampling: 31,
            ..Options::default()
        },
    );
    // Sampling may drop the race but must not add anything new.
    let base_shape = report_shape(&baseline);
    for mop in report_shape(&sampled) {
        assert!(base_shape.contains(&mop));
    }
}

fn new_ctx() -> (Context, ThreadState, CollectingSink) {
    let sink = CollectingSink::new();
    let (ctx, main) = Context::new(
        Options::default(),
        Arc::new(NoopSymbolizer),
        Box::new(sink.clone()),
    )
    .unwrap();
    (ctx, main, sink)
}

fn spawn(ctx: &Context, parent: &mut ThreadState, uid: Uid) -> ThreadState {
    let tid = ctx.thread_create(parent, 0x1, uid, false);
    ctx.thread_start(tid, 0, 0)
}

#[test]
fn test_previous_stack_within_ring() {
    let (ctx, mut main, sink) = new_ctx();
    let mut t1 = spawn(&ctx, &mut main, 1);
    let mut t2 = spawn(&ctx, &mut main, 2);
    ctx.func_enter(&mut t1, 0x1000);
    ctx.memory_write(&mut t1, 0x1004, 0x8000, 2);
    ctx.func_exit(&mut t1);
    // A modest amount of later activity keeps the epoch inside the ring.
    for i in 0..1024u64 {
        ctx.memory_write(&mut t1, 0x1100, 0x20000 + (i % 16) * 8, 3);
    }
    ctx.memory_write(&mut t2, 0x2000, 0x8000, 2);
    let reports = sink.reports();
    assert_eq!(reports.len(), 1);
    let prev: Vec<_> = reports[0].mops[1].stack.iter().map(|f| f.pc).collect();
    assert_eq!(prev, vec![0x1004, 0x1000]);
}

#[test]
fn test_previous_stack_ages_out_of_ring() {
    let (ctx, mut main, sink) = new_ctx();
    let mut t1 = spawn(&ctx, &mut main, 1);
    let mut t2 = spawn(&ctx, &mut main, 2);
    ctx.func_enter(&mut t1, 0x1000);
    ctx.memory_write(&mut t1, 0x1004, 0x8000, 2);
    ctx.func_exit(&mut t1);
    // Enough later events that the racing epoch leaves the ring.
    let noise: Addr = 0x20000;
    for i in 0..(TRACE_SIZE as u64 + 4096) {
        ctx.memory_write(&mut t1, 0x1100, noise + (i % 16) * 8, 3);
    }
    ctx.memory_write(&mut t2, 0x2000, 0x8000, 2);
    let reports = sink.reports();
    assert_eq!(reports.len(), 1);
    // The race is still detected, but the historical stack is gone.
    assert!(reports[0].mops[1].stack.is_empty());
    assert_eq!(reports[0].mops[1].tid, t1.tid());
}
