//! Runtime options for the detection engine.
//!
//! Mirrors the knobs an embedder or the replay CLI can set. The struct is
//! plain data; the CLI layer builds one from arguments and hands it to
//! [`crate::engine::Context::new`].

use std::path::PathBuf;

/// Output format for emitted reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReportFormat {
    /// Human-readable text, one fenced block per report.
    #[default]
    Text,
    /// One JSON object per report.
    Json,
}

/// Engine configuration.
#[derive(Debug, Clone)]
pub struct Options {
    /// Strict happens-before only. The engine implements no hybrid
    /// heuristics, so this is informational; it is recorded and exposed.
    pub pure_happens_before: bool,
    /// Skip redundant same-thread same-range shadow updates that are newer
    /// than the thread's last synchronization epoch.
    pub fast_mode: bool,
    /// Front-ends wrap destructors in ignore begin/end when this is set.
    pub ignore_in_dtor: bool,
    /// Depth of reported stacks.
    pub num_callers: usize,
    /// 0..=31. Nonzero skips race detection on untouched cells for a
    /// deterministic subset of addresses, trading recall for throughput.
    pub literace_sampling: u32,
    /// Suppression files, parsed at init. A parse failure is fatal.
    pub suppressions: Vec<PathBuf>,
    /// Print a matchable suppression pattern alongside each report.
    pub generate_suppressions: bool,
    /// Process exit code when at least one race was reported. 0 disables.
    pub error_exitcode: i32,
    /// Soft cap on shadow memory. Beyond it the shadow store evicts
    /// aggressively and warns. 0 disables.
    pub max_mem_in_mb: usize,
    /// Finalize as soon as the main thread finishes.
    pub exit_after_main: bool,
    /// Collect and print event/shadow statistics at finalize.
    pub collect_stats: bool,
    /// Report output format.
    pub report_format: ReportFormat,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            pure_happens_before: true,
            fast_mode: false,
            ignore_in_dtor: false,
            num_callers: 12,
            literace_sampling: 0,
            suppressions: Vec::new(),
            generate_suppressions: false,
            error_exitcode: 66,
            max_mem_in_mb: 0,
            exit_after_main: false,
            collect_stats: false,
            report_format: ReportFormat::Text,
        }
    }
}

impl Options {
    /// Clamp out-of-range values instead of failing.
    pub fn sanitize(mut self) -> Self {
        self.literace_sampling = self.literace_sampling.min(31);
        if self.num_callers == 0 {
            self.num_callers = 1;
        }
        self
    }
}
