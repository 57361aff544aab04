//! Suppression files end to end: matching, generation, parse failures.

use std::io::Write as _;
use std::sync::Arc;

use carrera::engine::{Context, ThreadState};
use carrera::flags::Options;
use carrera::report::{CollectingSink, Symbolizer, TableSymbolizer};

fn symbolizer() -> Arc<dyn Symbolizer> {
    let table: TableSymbolizer = serde_json::from_str(
        r#"{"functions":[
            {"pc":4096,"func":"writer_func","file":"writer.c","line":10,"obj":"app"},
            {"pc":4112,"func":"writer_func","file":"writer.c","line":12,"obj":"app"},
            {"pc":8192,"func":"racer_func","file":"racer.c","line":20,"obj":"app"},
            {"pc":8208,"func":"racer_func","file":"racer.c","line":22,"obj":"app"}
        ]}"#,
    )
    .unwrap();
    Arc::new(table)
}

fn ctx_with_suppressions(text: &str, generate: bool) -> (Context, ThreadState, CollectingSink) {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(text.as_bytes()).unwrap();
    let options = Options {
        suppressions: vec![file.path().to_path_buf()],
        generate_suppressions: generate,
        ..Options::default()
    };
    let sink = CollectingSink::new();
    // Suppressions are loaded eagerly, so the temp file may go away after.
    let (ctx, main) = Context::new(options, symbolizer(), Box::new(sink.clone())).unwrap();
    (ctx, main, sink)
}

fn race(ctx: &Context, main: &mut ThreadState) {
    let tid1 = ctx.thread_create(main, 0x1, 1, false);
    let mut t1 = ctx.thread_start(tid1, 0, 0);
    let tid2 = ctx.thread_create(main, 0x2, 2, false);
    let mut t2 = ctx.thread_start(tid2, 0, 0);
    ctx.func_enter(&mut t1, 0x1000);
    ctx.memory_write(&mut t1, 0x1010, 0x8000, 2);
    ctx.func_exit(&mut t1);
    ctx.func_enter(&mut t2, 0x2000);
    ctx.memory_write(&mut t2, 0x2010, 0x8000, 2);
    ctx.func_exit(&mut t2);
}

#[test]
fn test_fun_suppression_elides_report() {
    let (ctx, mut main, sink) = ctx_with_suppressions("fun:writer_func\n", false);
    race(&ctx, &mut main);
    assert!(sink.reports().is_empty());
    assert_eq!(ctx.suppressed(), 1);
    assert_eq!(ctx.reported(), 0);
    assert_eq!(ctx.exit_code(), 0);
}

#[test]
fn test_unrelated_suppression_does_not_match() {
    let (ctx, mut main, sink) = ctx_with_suppressions("fun:some_other_func\n", false);
    race(&ctx, &mut main);
    assert_eq!(sink.reports().len(), 1);
    assert_eq!(ctx.suppressed(), 0);
}

#[test]
fn test_glob_suppression_matches() {
    let (ctx, mut main, sink) = ctx_with_suppressions("fun:writer_*\n", false);
    race(&ctx, &mut main);
    assert!(sink.reports().is_empty());
    assert_eq!(ctx.suppressed(), 1);
}

#[test]
fn test_src_suppression_matches_file() {
    let (ctx, mut main, sink) = ctx_with_suppressions("src:writer.c\n", false);
    race(&ctx, &mut main);
    assert!(sink.reports().is_empty());
}

#[test]
fn test_obj_suppression_matches_image() {
    let (ctx, mut main, sink) = ctx_with_suppressions("obj:app\n", false);
    race(&ctx, &mut main);
    assert!(sink.reports().is_empty());
}

#[test]
fn test_generate_suppressions_on_suppressed_race() {
    let (ctx, mut main, sink) = ctx_with_suppressions("fun:writer_func\n", true);
    race(&ctx, &mut main);
    assert!(sink.reports().is_empty());
    // A matchable pattern is still produced for the suppressed report,
    // derived from the current access's innermost frame.
    assert_eq!(ctx.generated_patterns(), vec!["fun:racer_func".to_string()]);
}

#[test]
fn test_generate_suppressions_on_emitted_race() {
    let (ctx, mut main, sink) = ctx_with_suppressions("# nothing suppressed\n", true);
    race(&ctx, &mut main);
    assert_eq!(sink.reports().len(), 1);
    assert_eq!(ctx.generated_patterns(), vec!["fun:racer_func".to_string()]);
}

#[test]
fn test_parse_failure_is_fatal_at_init() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(b"noSuchPrefix:whatever\n").unwrap();
    let options = Options {
        suppressions: vec![file.path().to_path_buf()],
        ..Options::default()
    };
    let err = Context::new(options, symbolizer(), Box::new(CollectingSink::new())).unwrap_err();
    let chain = format!("{err:#}");
    assert!(chain.contains("unknown suppression directive"));
}

#[test]
fn test_missing_file_is_fatal_at_init() {
    let options = Options {
        suppressions: vec!["/nonexistent/file.supp".into()],
        ..Options::default()
    };
    let err = Context::new(options, symbolizer(), Box::new(CollectingSink::new())).unwrap_err();
    assert!(format!("{err:#}").contains("failed to read suppression file"));
}
