//! CLI argument parsing for carrera.

use std::path::PathBuf;

use clap::{Parser, ValueEnum};

use crate::event::TraceInput;
use crate::flags::{Options, ReportFormat};

/// Output format for race reports
#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum FormatArg {
    /// Human-readable text format (default)
    Text,
    /// One JSON object per report
    Json,
}

#[derive(Parser, Debug)]
#[command(name = "carrera")]
#[command(version)]
#[command(about = "Happens-before data-race detector with trace replay", long_about = None)]
pub struct Cli {
    /// Event trace to replay (JSON lines); '-' reads stdin
    #[arg(value_name = "TRACE")]
    pub input: PathBuf,

    /// Symbol map for stack symbolization (JSON)
    #[arg(long = "symbols", value_name = "FILE")]
    pub symbols: Option<PathBuf>,

    /// Suppression file; may be given multiple times
    #[arg(long = "suppressions", value_name = "FILE")]
    pub suppressions: Vec<PathBuf>,

    /// Print a matchable suppression pattern alongside each report
    #[arg(long = "generate-suppressions")]
    pub generate_suppressions: bool,

    /// Depth of reported stacks
    #[arg(long = "num-callers", value_name = "N", default_value = "12")]
    pub num_callers: usize,

    /// Sampling strength 0..=31; nonzero trades recall for throughput
    #[arg(long = "literace-sampling", value_name = "K", default_value = "0")]
    pub literace_sampling: u32,

    /// Skip redundant same-thread shadow updates
    #[arg(long = "fast-mode")]
    pub fast_mode: bool,

    /// Front-ends wrap destructors in ignore scopes
    #[arg(long = "ignore-in-dtor")]
    pub ignore_in_dtor: bool,

    /// Process exit code when at least one race was reported; 0 disables
    #[arg(long = "error-exitcode", value_name = "CODE", default_value = "66")]
    pub error_exitcode: i32,

    /// Soft cap on shadow memory in MiB; 0 disables
    #[arg(long = "max-mem-in-mb", value_name = "MB", default_value = "0")]
    pub max_mem_in_mb: usize,

    /// Stop replaying when the main thread finishes
    #[arg(long = "exit-after-main")]
    pub exit_after_main: bool,

    /// Print event and shadow statistics at the end of the run
    #[arg(long = "stats")]
    pub collect_stats: bool,

    /// Report output format
    #[arg(long = "format", value_enum, default_value = "text")]
    pub format: FormatArg,
}

impl Cli {
    pub fn trace_input(&self) -> TraceInput {
        if self.input.as_os_str() == "-" {
            TraceInput::Stdin
        } else {
            TraceInput::File(self.input.clone())
        }
    }

    pub fn to_options(&self) -> Options {
        Options {
            pure_happens_before: true,
            fast_mode: self.fast_mode,
            ignore_in_dtor: self.ignore_in_dtor,
            num_callers: self.num_callers,
            literace_sampling: self.literace_sampling,
            suppressions: self.suppressions.clone(),
            generate_suppressions: self.generate_suppressions,
            error_exitcode: self.error_exitcode,
            max_mem_in_mb: self.max_mem_in_mb,
            exit_after_main: self.exit_after_main,
            collect_stats: self.collect_stats,
            report_format: match self.format {
                FormatArg::Text => ReportFormat::Text,
                FormatArg::Json => ReportFormat::Json,
            },
        }
    }
}
