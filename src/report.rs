//! Race and thread-leak reports: assembly, deduplication, suppression and
//! emission.
//!
//! The engine hands the reporter a fully populated [`ReportDesc`]; the
//! reporter symbolizes nothing by itself (stacks arrive symbolized through
//! the [`Symbolizer`] the embedder supplied), deduplicates by a fingerprint
//! of the top frames, applies suppressions, and forwards survivors to the
//! configured [`ReportSink`].

use std::collections::HashSet;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};

use crate::defs::{Addr, Pc, Tid};
use crate::flags::ReportFormat;
use crate::stack_trace::StackTrace;
use crate::suppressions::{FrameInfo, Suppressions};

/// One symbolized stack frame. Reports list frames innermost first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportFrame {
    pub pc: Pc,
    pub func: String,
    pub file: String,
    pub line: u32,
    pub obj: String,
}

/// One memory operation participating in a race; current access first in
/// the report's mop list, previous second.
#[derive(Debug, Clone, Serialize)]
pub struct ReportMop {
    pub tid: Tid,
    pub pc: Pc,
    pub addr: Addr,
    pub size: u64,
    pub write: bool,
    pub stack: Vec<ReportFrame>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ReportLocation {
    Global {
        name: String,
        size: u64,
        addr: Addr,
    },
    Heap {
        addr: Addr,
        size: u64,
        tid: Tid,
        alloc_stack: Vec<ReportFrame>,
    },
    Stack {
        tid: Tid,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct ReportThread {
    pub tid: Tid,
    pub running: bool,
    pub name: Option<String>,
    pub stack: Vec<ReportFrame>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportKind {
    DataRace,
    ThreadLeak,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReportDesc {
    pub kind: ReportKind,
    pub mops: Vec<ReportMop>,
    pub location: Option<ReportLocation>,
    pub threads: Vec<ReportThread>,
}

/// Resolves pcs to frames and addresses to globals. Provided by the
/// front-end; the engine only consumes the seam.
pub trait Symbolizer: Send + Sync {
    fn frame(&self, pc: Pc) -> ReportFrame;
    /// Global variable covering `addr`, as (name, size, base address).
    fn global_at(&self, _addr: Addr) -> Option<(String, u64, Addr)> {
        None
    }
}

/// Fallback symbolizer: frames carry the pc only.
pub struct NoopSymbolizer;

impl Symbolizer for NoopSymbolizer {
    fn frame(&self, pc: Pc) -> ReportFrame {
        ReportFrame {
            pc,
            func: format!("{pc:#x}"),
            file: String::new(),
            line: 0,
            obj: String::new(),
        }
    }
}

/// Symbol table loaded from a serde map, for the replay front-end.
#[derive(Debug, Default, Deserialize)]
pub struct TableSymbolizer {
    #[serde(default)]
    functions: Vec<SymbolEntry>,
    #[serde(default)]
    globals: Vec<GlobalEntry>,
}

#[derive(Debug, Deserialize)]
struct SymbolEntry {
    pc: Pc,
    func: String,
    #[serde(default)]
    file: String,
    #[serde(default)]
    line: u32,
    #[serde(default)]
    obj: String,
}

#[derive(Debug, Deserialize)]
struct GlobalEntry {
    addr: Addr,
    size: u64,
    name: String,
}

impl Symbolizer for TableSymbolizer {
    fn frame(&self, pc: Pc) -> ReportFrame {
        match self.functions.iter().find(|e| e.pc == pc) {
            Some(e) => ReportFrame {
                pc,
                func: e.func.clone(),
                file: e.file.clone(),
                line: e.line,
                obj: e.obj.clone(),
            },
            None => NoopSymbolizer.frame(pc),
        }
    }

    fn global_at(&self, addr: Addr) -> Option<(String, u64, Addr)> {
        self.globals
            .iter()
            .find(|g| addr >= g.addr && addr < g.addr + g.size)
            .map(|g| (g.name.clone(), g.size, g.addr))
    }
}

/// Where finished reports go. Emission may block; it runs under the
/// report lock.
pub trait ReportSink: Send {
    fn emit(&mut self, rendered: &str, report: &ReportDesc);
}

/// Default sink: rendered report to stderr.
pub struct StderrSink;

impl ReportSink for StderrSink {
    fn emit(&mut self, rendered: &str, _report: &ReportDesc) {
        eprintln!("{rendered}");
    }
}

/// Test/embedding sink collecting structured reports.
#[derive(Default, Clone)]
pub struct CollectingSink {
    reports: Arc<Mutex<Vec<ReportDesc>>>,
}

impl CollectingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reports(&self) -> Vec<ReportDesc> {
        self.reports.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

impl ReportSink for CollectingSink {
    fn emit(&mut self, _rendered: &str, report: &ReportDesc) {
        self.reports
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(report.clone());
    }
}

pub struct Reporter {
    suppressions: Suppressions,
    sink: Box<dyn ReportSink>,
    format: ReportFormat,
    num_callers: usize,
    generate_suppressions: bool,
    seen: HashSet<u64>,
    nreported: u64,
    nraces: u64,
    nsuppressed: u64,
    patterns: Vec<String>,
}

impl Reporter {
    pub fn new(
        suppressions: Suppressions,
        sink: Box<dyn ReportSink>,
        format: ReportFormat,
        num_callers: usize,
        generate_suppressions: bool,
    ) -> Self {
        Self {
            suppressions,
            sink,
            format,
            num_callers,
            generate_suppressions,
            seen: HashSet::new(),
            nreported: 0,
            nraces: 0,
            nsuppressed: 0,
            patterns: Vec::new(),
        }
    }

    /// Deduplicate, filter and emit. Returns true when the report reached
    /// the sink.
    pub fn handle(&mut self, mut report: ReportDesc) -> bool {
        for mop in &mut report.mops {
            truncate_stack(&mut mop.stack, self.num_callers);
        }
        if !self.seen.insert(fingerprint(&report)) {
            return false;
        }
        let pattern = suppression_pattern(&report);
        if let Some(rule) = self.matched_suppression(&report) {
            tracing::debug!(rule = %rule, "report suppressed");
            if self.generate_suppressions {
                if let Some(p) = pattern {
                    self.patterns.push(p);
                }
            }
            self.nsuppressed += 1;
            return false;
        }
        let mut rendered = match self.format {
            ReportFormat::Text => render_text(&report),
            ReportFormat::Json => serde_json::to_string(&report).unwrap_or_default(),
        };
        if self.generate_suppressions {
            if let Some(p) = pattern {
                if self.format == ReportFormat::Text {
                    rendered.push_str(&format!("  Suppression: {p}\n"));
                }
                self.patterns.push(p);
            }
        }
        self.sink.emit(&rendered, &report);
        self.nreported += 1;
        if report.kind == ReportKind::DataRace {
            self.nraces += 1;
        }
        true
    }

    pub fn reported(&self) -> u64 {
        self.nreported
    }

    /// Non-suppressed data races only; thread leaks do not affect the
    /// error exit code.
    pub fn races(&self) -> u64 {
        self.nraces
    }

    pub fn suppressed(&self) -> u64 {
        self.nsuppressed
    }

    /// Patterns accumulated under `generate_suppressions`.
    pub fn generated_patterns(&self) -> &[String] {
        &self.patterns
    }

    /// Source line of the first matching suppression rule, if any.
    /// Suppression matching expects capture order (innermost last);
    /// report stacks are innermost first, hence the reversal.
    fn matched_suppression(&self, report: &ReportDesc) -> Option<String> {
        if self.suppressions.is_empty() {
            return None;
        }
        let (current, previous) = match report.kind {
            ReportKind::DataRace => (
                report.mops.first().map(|m| frame_infos(&m.stack)).unwrap_or_default(),
                report.mops.get(1).map(|m| frame_infos(&m.stack)).unwrap_or_default(),
            ),
            ReportKind::ThreadLeak => (
                report
                    .threads
                    .first()
                    .map(|t| frame_infos(&t.stack))
                    .unwrap_or_default(),
                Vec::new(),
            ),
        };
        self.suppressions
            .find_match(&current, &previous)
            .map(|rule| rule.source_line.clone())
    }
}

fn truncate_stack(stack: &mut Vec<ReportFrame>, depth: usize) {
    stack.truncate(depth);
}

/// Borrowed frame views in capture order (innermost last).
fn frame_infos(stack: &[ReportFrame]) -> Vec<FrameInfo<'_>> {
    stack
        .iter()
        .rev()
        .map(|f| FrameInfo {
            func: &f.func,
            obj: &f.obj,
            file: &f.file,
        })
        .collect()
}

/// Fingerprint over the kind and the top frames of every involved stack.
fn fingerprint(report: &ReportDesc) -> u64 {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    (report.kind as u8).hash(&mut hasher);
    for mop in &report.mops {
        mop.write.hash(&mut hasher);
        for frame in mop.stack.iter().take(2) {
            frame.pc.hash(&mut hasher);
        }
    }
    for thread in &report.threads {
        // Distinct leaked threads stay distinct even when created from the
        // same call site.
        if report.kind == ReportKind::ThreadLeak {
            thread.tid.hash(&mut hasher);
        }
        for frame in thread.stack.iter().take(2) {
            frame.pc.hash(&mut hasher);
        }
    }
    hasher.finish()
}

/// `fun:` pattern for the innermost named frame of the current access.
fn suppression_pattern(report: &ReportDesc) -> Option<String> {
    let stack = match report.kind {
        ReportKind::DataRace => &report.mops.first()?.stack,
        ReportKind::ThreadLeak => &report.threads.first()?.stack,
    };
    let frame = stack.iter().find(|f| !f.func.is_empty())?;
    Some(format!("fun:{}", frame.func))
}

fn render_frames(out: &mut String, stack: &[ReportFrame]) {
    for (i, f) in stack.iter().enumerate() {
        if f.file.is_empty() {
            out.push_str(&format!("    #{i} {:#x}: {}\n", f.pc, f.func));
        } else {
            out.push_str(&format!(
                "    #{i} {:#x}: {} {}:{}\n",
                f.pc, f.func, f.file, f.line
            ));
        }
    }
}

/// Human-readable rendering, one fenced block per report.
pub fn render_text(report: &ReportDesc) -> String {
    let mut out = String::new();
    out.push_str("==================\n");
    match report.kind {
        ReportKind::DataRace => {
            out.push_str("WARNING: carrera: data race\n");
            for (i, mop) in report.mops.iter().enumerate() {
                out.push_str(&format!(
                    "  {}{} of size {} at {:#x} by thread {}:\n",
                    if i == 0 { "" } else { "Previous " },
                    if mop.write { "Write" } else { "Read" },
                    mop.size,
                    mop.addr,
                    mop.tid
                ));
                render_frames(&mut out, &mop.stack);
            }
        }
        ReportKind::ThreadLeak => {
            out.push_str("WARNING: carrera: thread leak\n");
        }
    }
    if let Some(loc) = &report.location {
        match loc {
            ReportLocation::Global { name, size, addr } => {
                out.push_str(&format!(
                    "  Location is global {name} of size {size} at {addr:#x}\n"
                ));
            }
            ReportLocation::Heap {
                addr,
                size,
                tid,
                alloc_stack,
            } => {
                out.push_str(&format!(
                    "  Location is heap of size {size} at {addr:#x} allocated by thread {tid}:\n"
                ));
                render_frames(&mut out, alloc_stack);
            }
            ReportLocation::Stack { tid } => {
                out.push_str(&format!("  Location is stack of thread {tid}\n"));
            }
        }
    }
    for thread in &report.threads {
        out.push_str(&format!(
            "  Thread {} ({}){} created at:\n",
            thread.tid,
            if thread.running { "running" } else { "finished" },
            thread
                .name
                .as_deref()
                .map(|n| format!(" '{n}'"))
                .unwrap_or_default()
        ));
        render_frames(&mut out, &thread.stack);
    }
    out.push_str("==================\n");
    out
}

/// Symbolize a raw pc stack into report frames, innermost first.
pub fn symbolize_stack(symbolizer: &dyn Symbolizer, stack: &StackTrace) -> Vec<ReportFrame> {
    stack.pcs().iter().rev().map(|&pc| symbolizer.frame(pc)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn race_report(pc_top: Pc) -> ReportDesc {
        let sym = NoopSymbolizer;
        let stack = symbolize_stack(&sym, &StackTrace::from_pcs(vec![0x100, pc_top]));
        ReportDesc {
            kind: ReportKind::DataRace,
            mops: vec![
                ReportMop {
                    tid: 2,
                    pc: pc_top,
                    addr: 0x8000,
                    size: 4,
                    write: true,
                    stack: stack.clone(),
                },
                ReportMop {
                    tid: 1,
                    pc: 0x300,
                    addr: 0x8000,
                    size: 4,
                    write: true,
                    stack,
                },
            ],
            location: None,
            threads: Vec::new(),
        }
    }

    fn reporter(sink: CollectingSink) -> Reporter {
        Reporter::new(
            Suppressions::new(),
            Box::new(sink),
            ReportFormat::Text,
            12,
            false,
        )
    }

    #[test]
    fn test_emits_and_counts() {
        let sink = CollectingSink::new();
        let mut rep = reporter(sink.clone());
        assert!(rep.handle(race_report(0x200)));
        assert_eq!(rep.reported(), 1);
        assert_eq!(sink.reports().len(), 1);
    }

    #[test]
    fn test_duplicate_fingerprint_dropped() {
        let sink = CollectingSink::new();
        let mut rep = reporter(sink.clone());
        assert!(rep.handle(race_report(0x200)));
        assert!(!rep.handle(race_report(0x200)));
        assert_eq!(sink.reports().len(), 1);
        // A different top frame is a different race.
        assert!(rep.handle(race_report(0x999)));
        assert_eq!(sink.reports().len(), 2);
    }

    #[test]
    fn test_suppressed_report_not_emitted() {
        let sup = Suppressions::parse("fun:0x200").unwrap();
        let sink = CollectingSink::new();
        let mut rep = Reporter::new(sup, Box::new(sink.clone()), ReportFormat::Text, 12, false);
        assert!(!rep.handle(race_report(0x200)));
        assert_eq!(rep.suppressed(), 1);
        assert_eq!(rep.reported(), 0);
        assert!(sink.reports().is_empty());
    }

    #[test]
    fn test_generate_suppressions_records_pattern() {
        let sink = CollectingSink::new();
        let mut rep = Reporter::new(
            Suppressions::new(),
            Box::new(sink),
            ReportFormat::Text,
            12,
            true,
        );
        rep.handle(race_report(0x200));
        assert_eq!(rep.generated_patterns(), ["fun:0x200"]);
    }

    #[test]
    fn test_num_callers_truncates() {
        let sink = CollectingSink::new();
        let mut rep = Reporter::new(
            Suppressions::new(),
            Box::new(sink.clone()),
            ReportFormat::Text,
            1,
            false,
        );
        rep.handle(race_report(0x200));
        assert_eq!(sink.reports()[0].mops[0].stack.len(), 1);
        // The innermost frame is the one kept.
        assert_eq!(sink.reports()[0].mops[0].stack[0].pc, 0x200);
    }

    #[test]
    fn test_render_text_layout() {
        let out = render_text(&race_report(0x200));
        assert!(out.starts_with("==================\n"));
        assert!(out.contains("WARNING: carrera: data race"));
        assert!(out.contains("Write of size 4 at 0x8000 by thread 2:"));
        assert!(out.contains("Previous Write of size 4 at 0x8000 by thread 1:"));
        assert!(out.ends_with("==================\n"));
    }

    #[test]
    fn test_table_symbolizer() {
        let sym: TableSymbolizer = serde_json::from_str(
            r#"{"functions":[{"pc":256,"func":"writer","file":"w.c","line":10}],
                "globals":[{"addr":4096,"size":8,"name":"g_counter"}]}"#,
        )
        .unwrap();
        let f = sym.frame(256);
        assert_eq!(f.func, "writer");
        assert_eq!(f.line, 10);
        // Unknown pcs degrade to hex names.
        assert_eq!(sym.frame(1).func, "0x1");
        assert_eq!(
            sym.global_at(4100),
            Some(("g_counter".to_string(), 8, 4096))
        );
        assert_eq!(sym.global_at(5000), None);
    }

    #[test]
    fn test_json_rendering_is_valid() {
        let report = race_report(0x200);
        let json = serde_json::to_string(&report).unwrap();
        let v: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(v["kind"], "data_race");
        assert_eq!(v["mops"][0]["write"], true);
    }
}
