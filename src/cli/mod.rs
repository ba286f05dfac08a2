//! Command-line interface for fractionate-setup.
//!
//! `install` runs the full provisioning pipeline and is the default when no
//! subcommand is given. `status` and `config` are read-only.

use std::path::{Path, PathBuf};

use anyhow::Result;
use clap::{Parser, Subcommand};
use colored::Colorize;
use tracing::error;

use crate::config::{ResolvedConfig, LLAMA_PORT};
use crate::core::pipeline::{backend_service, provision, proxy_service, InstallOptions, ProvisionSummary};
use crate::core::progress::{format_elapsed, ProgressReporter};
use crate::core::services::{HealthMonitor, HttpHealthProbe, ServiceLauncher, HEALTH_ATTEMPTS};
use crate::domain::{HealthReport, OverallStatus, ProvisionError};

/// fractionate-setup - provision a workstation for Fractionate Edge
#[derive(Parser, Debug)]
#[command(name = "fractionate-setup")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Install or repair everything (default)
    Install {
        /// Backend source directory to deploy
        #[arg(short, long)]
        source: Option<PathBuf>,

        /// Register autostart entries but do not start the services
        #[arg(long)]
        skip_services: bool,
    },

    /// Show service processes and poll backend health
    Status {
        /// Health probes before giving up
        #[arg(short, long, default_value_t = HEALTH_ATTEMPTS)]
        attempts: u32,
    },

    /// Show resolved configuration
    Config,
}

impl Cli {
    /// Execute the CLI command
    pub async fn execute(self, config: ResolvedConfig) -> Result<()> {
        match self.command.unwrap_or(Commands::Install {
            source: None,
            skip_services: false,
        }) {
            Commands::Install {
                source,
                skip_services,
            } => {
                install(
                    config,
                    InstallOptions {
                        source,
                        skip_services,
                    },
                )
                .await
            }
            Commands::Status { attempts } => show_status(&config, attempts).await,
            Commands::Config => {
                show_config(&config);
                Ok(())
            }
        }
    }
}

async fn install(config: ResolvedConfig, options: InstallOptions) -> Result<()> {
    let reporter = ProgressReporter::new();
    reporter.println(format!(
        "{} {}",
        "Fractionate Edge setup".bold(),
        format!("({})", config.home.display()).bright_black()
    ));

    let summary = provision(config, reporter, options).await?;
    print_summary(&summary);
    Ok(())
}

fn print_summary(summary: &ProvisionSummary) {
    println!();
    println!(
        "{} Setup finished in {}",
        "✓".green(),
        format_elapsed(summary.elapsed)
    );
    println!("  Proxy:   {}", summary.proxy_url);
    println!("  Backend: {}", summary.backend_url);

    let downloaded: u64 = summary
        .transfers
        .iter()
        .filter(|t| !t.was_skipped())
        .map(|t| t.megabytes())
        .sum();
    if downloaded > 0 {
        println!("  Downloaded: {} MB", downloaded);
    }

    match &summary.health {
        Some(report) => print_health(report),
        None => println!("  Health:  {}", "services not started".yellow()),
    }
    println!("  Run id:  {}", summary.run_id);
}

fn print_health(report: &HealthReport) {
    let status = match report.overall_status {
        OverallStatus::Ok => "ok".green(),
        OverallStatus::Degraded => "still starting".yellow(),
    };
    println!("  Health:  {} ({} attempt(s))", status, report.attempts);

    if let Some(connected) = report.database_connected {
        println!("    database: connected={}", connected);
    }
    for (name, component) in &report.components {
        println!(
            "    {}: installed={} running={}",
            name, component.installed, component.running
        );
    }
}

async fn show_status(config: &ResolvedConfig, attempts: u32) -> Result<()> {
    let reporter = ProgressReporter::new();
    let launcher = ServiceLauncher::new(config.run_dir(), reporter.clone());

    println!("Services:");
    for spec in [proxy_service(config), backend_service(config)] {
        match launcher.find_running(&spec).await {
            Some(handle) => println!(
                "  {} {:<8} pid {} on {}",
                "●".green(),
                spec.endpoint.name,
                handle.pid,
                spec.endpoint.authority()
            ),
            None => println!("  {} {:<8} not running", "○".red(), spec.endpoint.name),
        }
    }
    println!();

    let url = config
        .proxy_endpoint()
        .health_url()
        .unwrap_or_else(|| format!("{}/api/health", config.proxy_endpoint().base_url()));
    let probe = HttpHealthProbe::new(url)?;
    let monitor = HealthMonitor {
        attempts: attempts.max(1),
        ..HealthMonitor::default()
    };
    let report = reporter
        .await_process(probe.url(), async { Ok(monitor.poll(&probe).await) })
        .await?;

    print_health(&report);
    Ok(())
}

fn show_config(config: &ResolvedConfig) {
    println!("Fractionate Edge setup configuration");
    println!();
    println!(
        "Config file: {}",
        config
            .config_file
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "(none - using defaults)".to_string())
    );
    println!("Platform:    {:?}", config.platform);
    println!();
    println!("Paths:");
    println!("  Home:        {}", config.home.display());
    println!("  Engine:      {}", config.bitnet_dir().display());
    println!("  Falcon3:     {}", config.falcon_model().display());
    println!("  Florence-2:  {}", config.florence_dir().display());
    println!("  Backend:     {}", config.server_dir().display());
    println!("  Venv:        {}", config.venv_dir().display());
    println!("  Run log:     {}", config.setup_log().display());
    println!();
    println!("Network:");
    println!("  Proxy:       {}", config.proxy_endpoint().base_url());
    println!("  Backend:     {}", config.backend_endpoint().base_url());
    println!("  llama-server port: {}", LLAMA_PORT);
    println!("  Allowed origin:    {}", config.allowed_origin);
    println!();
    println!("Sources:");
    println!("  BitNet:      {}", config.bitnet_repo);
    println!("  Model repo:  {} ({})", config.model_repo, config.quantization);
    println!("  Falcon3 URL: {}", config.falcon_url);
    println!("  Florence-2:  {}", config.florence_base_url);
    println!("  Caddy:       {}", config.caddy_url);
    println!(
        "  Backend src: {}",
        config
            .backend_source
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "(auto)".to_string())
    );
    println!();
    println!("Build output candidates:");
    for candidate in &config.expected_outputs {
        println!("  {}", candidate.display());
    }
}

/// Top-level failure report: failing step, error chain, log location
pub fn report_failure(err: &anyhow::Error, log_path: &Path) {
    error!(error = %format!("{:#}", err), "Provisioning aborted");
    print_failure(&ProgressReporter::new(), err, log_path);
}

fn print_failure(reporter: &ProgressReporter, err: &anyhow::Error, log_path: &Path) {
    reporter.println("");
    let causes: Vec<String> = match err.downcast_ref::<ProvisionError>() {
        Some(ProvisionError::StepFailed { index, total, name }) => {
            reporter.error(format!("Step {}/{} '{}' failed", index, total, name));
            err.chain().skip(1).map(|c| c.to_string()).collect()
        }
        _ => {
            reporter.error("Setup failed");
            err.chain().map(|c| c.to_string()).collect()
        }
    };
    for cause in causes {
        reporter.println(format!("    {}", cause));
    }
    reporter.println("");
    reporter.println(format!("Full log: {}", log_path.display()));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_names_step_and_causes() {
        let err = anyhow::anyhow!("llama-server not found under bitnet/build")
            .context(ProvisionError::StepFailed {
                index: 6,
                total: 10,
                name: "Building inference engine".to_string(),
            });
        let reporter = ProgressReporter::recording();

        print_failure(&reporter, &err, Path::new("/srv/fractionate/logs/setup.log"));

        let lines = reporter.lines();
        assert!(lines[1].contains("✗"));
        assert!(lines[1].contains("Step 6/10 'Building inference engine' failed"));
        assert_eq!(lines[2], "    llama-server not found under bitnet/build");
        assert_eq!(lines.last().unwrap(), "Full log: /srv/fractionate/logs/setup.log");
    }

    #[test]
    fn test_install_is_the_default() {
        let cli = Cli::parse_from(["fractionate-setup"]);
        assert!(cli.command.is_none());

        let cli = Cli::parse_from(["fractionate-setup", "install", "--skip-services"]);
        assert!(matches!(
            cli.command,
            Some(Commands::Install {
                skip_services: true,
                source: None
            })
        ));
    }

    #[test]
    fn test_status_attempts_default() {
        let cli = Cli::parse_from(["fractionate-setup", "status"]);
        match cli.command {
            Some(Commands::Status { attempts }) => assert_eq!(attempts, HEALTH_ATTEMPTS),
            other => panic!("unexpected {:?}", other),
        }
    }
}
