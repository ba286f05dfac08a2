//! fractionate-setup CLI entrypoint

use std::fs::OpenOptions;
use std::path::Path;
use std::process::ExitCode;
use std::sync::Mutex;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use fractionate_setup::cli::{report_failure, Cli};
use fractionate_setup::config::ResolvedConfig;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match ResolvedConfig::load() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            return ExitCode::FAILURE;
        }
    };

    let log_path = config.setup_log();
    if let Err(e) = init_tracing(&log_path) {
        eprintln!("Warning: run log disabled: {:#}", e);
    }

    match cli.execute(config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            report_failure(&e, &log_path);
            ExitCode::FAILURE
        }
    }
}

/// Terminal layer (silent unless RUST_LOG is set) plus the run log,
/// appended without ANSI codes
fn init_tracing(log_path: &Path) -> Result<()> {
    let terminal = fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr)
        .with_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("off")));

    let file = match open_run_log(log_path) {
        Ok(file) => file,
        Err(e) => {
            tracing_subscriber::registry().with(terminal).init();
            return Err(e);
        }
    };
    let run_log = fmt::layer()
        .with_ansi(false)
        .with_writer(Mutex::new(file))
        .with_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")));

    tracing_subscriber::registry()
        .with(terminal)
        .with(run_log)
        .init();
    Ok(())
}

fn open_run_log(path: &Path) -> Result<std::fs::File> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("Failed to open {}", path.display()))
}
