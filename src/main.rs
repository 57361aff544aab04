use std::sync::Arc;

use anyhow::{Context as _, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use carrera::cli::Cli;
use carrera::replay;
use carrera::report::{NoopSymbolizer, Symbolizer, TableSymbolizer};

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match run(&cli) {
        Ok(exit_code) => std::process::exit(exit_code),
        Err(err) => {
            eprintln!("carrera: {err:#}");
            std::process::exit(1);
        }
    }
}

fn run(cli: &Cli) -> Result<i32> {
    let symbolizer: Arc<dyn Symbolizer> = match &cli.symbols {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read symbol map {}", path.display()))?;
            let table: TableSymbolizer = serde_json::from_str(&text)
                .with_context(|| format!("malformed symbol map {}", path.display()))?;
            Arc::new(table)
        }
        None => Arc::new(NoopSymbolizer),
    };
    let summary = replay::replay(&cli.trace_input(), cli.to_options(), symbolizer)?;
    Ok(summary.exit_code)
}
