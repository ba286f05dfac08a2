//! Provisioning state machine.
//!
//! Ten steps run in declared order against an explicit `PipelineContext`.
//! A step either completes (possibly by finding its work already done) or
//! aborts the run; there is no retry between steps. Re-running the program
//! is the retry.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use fs2::FileExt;
use tokio::time::Instant;
use tracing::{debug, info, instrument};
use uuid::Uuid;

use crate::adapters::autostart::{self, AutostartEntry, AutostartRegistry, Registration};
use crate::adapters::package::{self, PackageManager};
use crate::adapters::process::{CommandRunner, Invocation, OutputMode, SystemRunner};
use crate::adapters::transport::{self, Transport};
use crate::config::{ResolvedConfig, HOME_ENV, LOOPBACK};
use crate::domain::{
    BuildTarget, DownloadTransfer, HealthReport, InstalledTool, LaunchOutcome,
    Located, Platform, ProvisionError, ProvisioningStep, ServiceSpec, StepKind,
};

use super::build::BuildOrchestrator;
use super::deploy::{
    deploy_tree, file_sha256, install_proxy_binary, render_caddyfile, text_sha256,
    write_app_config_once, write_if_changed,
};
use super::fetcher::ArtifactFetcher;
use super::installer::DependencyInstaller;
use super::progress::{format_elapsed, ProgressReporter};
use super::scheduler::{BackgroundTask, Scheduler};
use super::services::{
    service_log_path, HealthMonitor, HealthProbe, HttpHealthProbe, ServiceControl, ServiceLauncher,
};

/// Autostart entry names
pub const PROXY_ENTRY: &str = "FractionateProxy";
pub const BACKEND_ENTRY: &str = "FractionateBackend";

/// Marker written next to the venv with the hash of the installed package list
const REQUIREMENTS_MARKER: &str = ".requirements.sha256";

/// State threaded through every step
pub struct PipelineContext {
    /// 1-based index of the step being run (0 before the first)
    pub index: usize,
    pub total: usize,
    pub started_at: Instant,
    pub run_id: Uuid,
    pub reporter: ProgressReporter,
    pub runner: Arc<dyn CommandRunner>,
    pub config: ResolvedConfig,
}

impl PipelineContext {
    pub fn new(
        config: ResolvedConfig,
        reporter: ProgressReporter,
        runner: Arc<dyn CommandRunner>,
    ) -> Self {
        Self {
            index: 0,
            total: StepKind::ALL.len(),
            started_at: Instant::now(),
            run_id: Uuid::new_v4(),
            reporter,
            runner,
            config,
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }
}

/// Runs the body of each step
#[async_trait]
pub trait StepExecutor: Send {
    async fn execute(&mut self, ctx: &PipelineContext, kind: StepKind) -> Result<()>;
}

/// Run every step in order, stopping at the first failure.
///
/// Errors leave with `ProvisionError::StepFailed` attached as context so
/// the caller can name the step.
pub async fn run_pipeline(ctx: &mut PipelineContext, executor: &mut dyn StepExecutor) -> Result<()> {
    info!(run_id = %ctx.run_id, "Provisioning started");

    for step in ProvisioningStep::sequence() {
        ctx.index = step.index;
        ctx.total = step.total_steps;
        ctx.reporter.step(&step);

        let started = Instant::now();
        executor
            .execute(ctx, step.kind)
            .await
            .context(ProvisionError::StepFailed {
                index: step.index,
                total: step.total_steps,
                name: step.description().to_string(),
            })?;
        debug!(step = step.index, elapsed_ms = started.elapsed().as_millis() as u64, "Step done");
    }

    info!(run_id = %ctx.run_id, elapsed = %format_elapsed(ctx.elapsed()), "Provisioning complete");
    Ok(())
}

/// Exclusive lock on `setup.lock`, held for a whole run
#[derive(Debug)]
pub struct RunLock {
    _file: File,
}

impl RunLock {
    /// Take the lock or fail with `ProvisionError::Locked`
    pub fn acquire(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(path)
            .with_context(|| format!("Failed to open lock file {}", path.display()))?;

        if file.try_lock_exclusive().is_err() {
            return Err(ProvisionError::Locked {
                path: path.to_path_buf(),
            }
            .into());
        }

        // Owner pid, for whoever finds a stuck lock
        file.set_len(0)?;
        writeln!(file, "{}", std::process::id())?;

        debug!(path = %path.display(), "Run lock acquired");
        // Lock is released when file is dropped
        Ok(Self { _file: file })
    }
}

/// Caller-selected behavior of an install run
#[derive(Debug, Clone, Default)]
pub struct InstallOptions {
    /// Backend sources to deploy (overrides `backend_source` in setup.yaml)
    pub source: Option<PathBuf>,

    /// Stop after autostart registration
    pub skip_services: bool,
}

/// What a completed run reports
#[derive(Debug, Clone)]
pub struct ProvisionSummary {
    pub run_id: Uuid,
    pub elapsed: Duration,

    /// `None` when services were not launched
    pub health: Option<HealthReport>,
    pub proxy_url: String,
    pub backend_url: String,
    pub transfers: Vec<DownloadTransfer>,
}

/// Proxy launch spec: `caddy run --config <Caddyfile>`
pub fn proxy_service(config: &ResolvedConfig) -> ServiceSpec {
    let caddyfile = config.caddyfile().to_string_lossy().to_string();
    ServiceSpec {
        endpoint: config.proxy_endpoint(),
        process_name: "caddy".to_string(),
        cmdline_marker: Some(caddyfile.clone()),
        program: config.caddy_binary(),
        args: vec![
            "run".to_string(),
            "--config".to_string(),
            caddyfile,
            "--adapter".to_string(),
            "caddyfile".to_string(),
        ],
        working_dir: config.home.clone(),
        env: Vec::new(),
        log_path: service_log_path(&config.logs_dir(), "proxy"),
    }
}

/// Backend launch spec: uvicorn from the venv, serving the deployed sources
pub fn backend_service(config: &ResolvedConfig) -> ServiceSpec {
    ServiceSpec {
        endpoint: config.backend_endpoint(),
        process_name: "python".to_string(),
        cmdline_marker: Some("main:app".to_string()),
        program: config.venv_python(),
        args: vec![
            "-m".to_string(),
            "uvicorn".to_string(),
            "main:app".to_string(),
            "--host".to_string(),
            LOOPBACK.to_string(),
            "--port".to_string(),
            config.backend_port.to_string(),
        ],
        working_dir: config.server_dir(),
        env: vec![(
            HOME_ENV.to_string(),
            config.home.to_string_lossy().to_string(),
        )],
        log_path: service_log_path(&config.logs_dir(), "backend"),
    }
}

/// Why this session cannot provision, if it cannot.
///
/// Home directory and autostart entries belong to whoever runs setup, so
/// only Windows wants an elevated run. A sudo session on Linux would
/// install everything into root's home.
pub fn privilege_problem(
    platform: Platform,
    elevated: bool,
    sudo_user: Option<&str>,
) -> Option<ProvisionError> {
    match platform {
        _ if platform.requires_elevation() && !elevated => Some(ProvisionError::precondition(
            "Administrator privileges are required",
            "Re-run from a terminal started with 'Run as administrator'",
        )),
        Platform::MacOs if elevated => Some(ProvisionError::precondition(
            "Running as root is not supported on macOS",
            "Homebrew refuses to run as root; re-run as your normal user",
        )),
        Platform::Linux if elevated => match sudo_user.filter(|u| !u.is_empty() && *u != "root") {
            Some(user) => Some(ProvisionError::precondition(
                "Setup is running under sudo, so it would install into root's home",
                format!(
                    "Re-run as {} without sudo; package installs ask for sudo themselves",
                    user
                ),
            )),
            None => None,
        },
        _ => None,
    }
}

fn autostart_entry(name: &str, description: &str, spec: &ServiceSpec) -> AutostartEntry {
    AutostartEntry {
        name: name.to_string(),
        program: spec.program.clone(),
        args: spec.args.clone(),
        working_dir: spec.working_dir.clone(),
        description: description.to_string(),
    }
}

/// Whether this process runs with administrator / root rights
pub async fn is_elevated(runner: &dyn CommandRunner, platform: Platform) -> bool {
    let check = match platform {
        // `net session` is refused for non-admin tokens
        Platform::Windows => Invocation::new("net").arg("session"),
        Platform::Linux | Platform::MacOs => Invocation::new("id").arg("-u"),
    }
    .mode(OutputMode::Suppressed);

    match runner.run(&check).await {
        Ok(output) if platform == Platform::Windows => output.success(),
        Ok(output) => output.success() && output.combined.trim() == "0",
        Err(e) => {
            debug!(error = %e, "Elevation check failed to run");
            false
        }
    }
}

/// The external systems a `Provisioner` drives
pub struct ProvisionerAdapters {
    pub packages: Arc<dyn PackageManager>,

    /// Tried in order for every download
    pub transports: Vec<Arc<dyn Transport>>,
    pub autostart: Arc<dyn AutostartRegistry>,
    pub services: Arc<dyn ServiceControl>,
    pub health_probe: Arc<dyn HealthProbe>,
}

impl ProvisionerAdapters {
    /// The platform's package manager, transports and autostart registry
    pub fn for_platform(ctx: &PipelineContext) -> Result<Self> {
        let config = &ctx.config;
        let health_url = config
            .proxy_endpoint()
            .health_url()
            .context("Proxy endpoint has no health path")?;

        Ok(Self {
            packages: package::for_platform(config.platform, ctx.runner.clone(), ctx.reporter.clone()),
            transports: transport::for_platform(
                config.platform,
                ctx.runner.clone(),
                ctx.reporter.clone(),
            ),
            autostart: autostart::for_platform(config.platform, ctx.runner.clone())?,
            services: Arc::new(ServiceLauncher::new(config.run_dir(), ctx.reporter.clone())),
            health_probe: Arc::new(HttpHealthProbe::new(health_url)?),
        })
    }
}

/// Step bodies, holding state between steps
pub struct Provisioner {
    options: InstallOptions,
    scheduler: Scheduler,
    fetcher: ArtifactFetcher,
    installer: DependencyInstaller,
    autostart: Arc<dyn AutostartRegistry>,
    services: Arc<dyn ServiceControl>,
    health_probe: Arc<dyn HealthProbe>,

    /// Interpreter found by the Prerequisites step
    python: Option<PathBuf>,

    /// Downloads running between their kickoff and the AwaitDownloads step
    pending: Vec<BackgroundTask<Vec<DownloadTransfer>>>,
    transfers: Vec<DownloadTransfer>,
    health: Option<HealthReport>,
}

impl Provisioner {
    pub fn new(ctx: &PipelineContext, options: InstallOptions, adapters: ProvisionerAdapters) -> Self {
        Self {
            options,
            scheduler: Scheduler::new(ctx.reporter.clone()),
            fetcher: ArtifactFetcher::new(adapters.transports),
            installer: DependencyInstaller::new(
                ctx.runner.clone(),
                adapters.packages,
                ctx.reporter.clone(),
            ),
            autostart: adapters.autostart,
            services: adapters.services,
            health_probe: adapters.health_probe,
            python: None,
            pending: Vec::new(),
            transfers: Vec::new(),
            health: None,
        }
    }

    /// Wired with this machine's adapters
    pub fn for_platform(ctx: &PipelineContext, options: InstallOptions) -> Result<Self> {
        let adapters = ProvisionerAdapters::for_platform(ctx)?;
        Ok(Self::new(ctx, options, adapters))
    }

    /// Result of a run that reached the end of the pipeline
    pub fn summary(&self, ctx: &PipelineContext) -> ProvisionSummary {
        ProvisionSummary {
            run_id: ctx.run_id,
            elapsed: ctx.elapsed(),
            health: self.health.clone(),
            proxy_url: ctx.config.proxy_endpoint().base_url(),
            backend_url: ctx.config.backend_endpoint().base_url(),
            transfers: self.transfers.clone(),
        }
    }

    async fn check_privileges(&self, ctx: &PipelineContext) -> Result<()> {
        let platform = ctx.config.platform;
        let elevated = is_elevated(ctx.runner.as_ref(), platform).await;
        let sudo_user = std::env::var("SUDO_USER").ok();

        if let Some(problem) = privilege_problem(platform, elevated, sudo_user.as_deref()) {
            return Err(problem.into());
        }
        ctx.reporter.ok("Privileges OK");
        Ok(())
    }

    async fn install_prerequisites(&mut self, ctx: &PipelineContext) -> Result<()> {
        let tools = InstalledTool::catalog(ctx.config.platform);
        let outcomes = self.installer.ensure_all(&tools).await?;

        self.python = tools
            .iter()
            .zip(&outcomes)
            .find(|(tool, _)| tool.name == "Python")
            .map(|(_, outcome)| outcome.path().to_path_buf());
        Ok(())
    }

    fn create_directories(&self, ctx: &PipelineContext) -> Result<()> {
        for dir in ctx.config.directories() {
            std::fs::create_dir_all(&dir)
                .with_context(|| format!("Failed to create {}", dir.display()))?;
        }
        ctx.reporter
            .ok(format!("Home directory ready: {}", ctx.config.home.display()));
        Ok(())
    }

    async fn prepare_venv(&self, ctx: &PipelineContext) -> Result<()> {
        let config = &ctx.config;
        let venv_python = config.venv_python();

        if venv_python.is_file() {
            ctx.reporter.ok("Virtual environment exists");
        } else {
            let python = self
                .python
                .clone()
                .context("No Python interpreter was resolved")?;
            let create = Invocation::path(&python)
                .args(["-m", "venv"])
                .arg(config.venv_dir().to_string_lossy())
                .last_line();
            let output = ctx
                .reporter
                .await_process("Creating virtual environment", ctx.runner.run(&create))
                .await?;
            if !output.success() || !venv_python.is_file() {
                return Err(ProvisionError::install(
                    "Python virtual environment",
                    output.last_line().unwrap_or("venv did not create an interpreter"),
                )
                .into());
            }
        }

        let marker = config.venv_dir().join(REQUIREMENTS_MARKER);
        let wanted = text_sha256(&config.python_packages.join("\n"));
        let installed = std::fs::read_to_string(&marker).unwrap_or_default();
        if installed.trim() == wanted {
            ctx.reporter.ok("Backend packages up to date");
            return Ok(());
        }

        let pip = Invocation::path(&venv_python)
            .args(["-m", "pip", "install", "--upgrade"])
            .args(config.python_packages.iter().cloned())
            .last_line();
        let output = ctx
            .reporter
            .await_process("Installing backend packages", ctx.runner.run(&pip))
            .await?;
        if !output.success() {
            return Err(ProvisionError::install(
                "backend packages",
                output.last_line().unwrap_or("pip failed"),
            )
            .into());
        }

        write_if_changed(&marker, &wanted)?;
        ctx.reporter.ok(format!(
            "Installed {} backend packages",
            config.python_packages.len()
        ));
        Ok(())
    }

    fn start_florence_download(&mut self, ctx: &PipelineContext) {
        let config = &ctx.config;
        let missing: Vec<(String, PathBuf)> = config
            .florence_files
            .iter()
            .map(|file| {
                (
                    format!("{}/{}", config.florence_base_url.trim_end_matches('/'), file),
                    config.florence_dir().join(file),
                )
            })
            .filter(|(_, dest)| !dest.is_file())
            .collect();

        if missing.is_empty() {
            ctx.reporter.ok("Florence-2 already present");
            return;
        }

        let fetcher = self.fetcher.clone();
        let task = self.scheduler.spawn("Florence-2 download", async move {
            let mut transfers = Vec::with_capacity(missing.len());
            for (uri, dest) in missing {
                let label = dest
                    .file_name()
                    .map(|n| n.to_string_lossy().to_string())
                    .unwrap_or_else(|| "Florence-2".to_string());
                transfers.push(fetcher.download_if_missing(&uri, &dest, &label).await?);
            }
            Ok(transfers)
        });
        self.pending.push(task);
    }

    async fn build_engine(&mut self, ctx: &PipelineContext) -> Result<()> {
        let config = &ctx.config;
        let target = config.build_target();
        let orchestrator = BuildOrchestrator::new(
            ctx.runner.clone(),
            ctx.reporter.clone(),
            target.clone(),
            config.venv_python(),
            config.build_log(),
        );

        let task = self
            .scheduler
            .spawn("BitNet build", async move { orchestrator.run().await });
        let outcome = self.scheduler.join(task).await?;
        place_output(&target, outcome.located())?;

        let model = config.falcon_model();
        if model.is_file() {
            ctx.reporter.ok("Falcon3 model present");
        } else {
            ctx.reporter
                .warn("Setup script did not leave a Falcon3 model; downloading prebuilt GGUF");
            let fetcher = self.fetcher.clone();
            let uri = config.falcon_url.clone();
            let task = self.scheduler.spawn("Falcon3 download", async move {
                let transfer = fetcher.download_if_missing(&uri, &model, "Falcon3 7B").await?;
                Ok(vec![transfer])
            });
            self.pending.push(task);
        }
        Ok(())
    }

    async fn install_proxy_and_files(&self, ctx: &PipelineContext) -> Result<()> {
        let config = &ctx.config;

        let (binary, fresh) = install_proxy_binary(
            &self.fetcher,
            &config.caddy_url,
            &config.bin_dir(),
            &config.platform.exe_name("caddy"),
        )
        .await?;
        if fresh {
            ctx.reporter.ok(format!("Installed Caddy at {}", binary.display()));
        } else {
            ctx.reporter.ok("Caddy already installed");
        }

        if write_if_changed(&config.caddyfile(), &render_caddyfile(&config.proxy_settings()))? {
            ctx.reporter.ok("Caddyfile written");
        } else {
            ctx.reporter.ok("Caddyfile unchanged");
        }

        match self.backend_source(config) {
            Some(source) => {
                let stats = deploy_tree(&source, &config.server_dir())?;
                ctx.reporter.ok(format!(
                    "Backend deployed from {} ({} copied, {} unchanged)",
                    source.display(),
                    stats.copied,
                    stats.unchanged
                ));
            }
            None if config.server_dir().join("main.py").is_file() => {
                ctx.reporter
                    .warn("No backend source found; keeping the deployed copy");
            }
            None => {
                return Err(ProvisionError::precondition(
                    "Backend sources not found",
                    "Pass --source <dir> or set backend_source in setup.yaml",
                )
                .into());
            }
        }
        Ok(())
    }

    /// `--source`, then setup.yaml, then `server/` beside the executable,
    /// then `server/` in the working directory
    fn backend_source(&self, config: &ResolvedConfig) -> Option<PathBuf> {
        if let Some(explicit) = self.options.source.clone().or_else(|| config.backend_source.clone()) {
            return Some(explicit);
        }
        let beside_exe = std::env::current_exe()
            .ok()
            .and_then(|exe| exe.parent().map(|dir| dir.join("server")));
        beside_exe
            .into_iter()
            .chain(std::iter::once(PathBuf::from("server")))
            .find(|dir| dir.join("main.py").is_file())
    }

    async fn await_downloads(&mut self, ctx: &PipelineContext) -> Result<()> {
        if self.pending.is_empty() {
            ctx.reporter.ok("No downloads outstanding");
            return Ok(());
        }
        for task in std::mem::take(&mut self.pending) {
            let transfers = self.scheduler.join(task).await?;
            for transfer in &transfers {
                if !transfer.was_skipped() {
                    ctx.reporter.ok(format!(
                        "{}: {} MB via {}",
                        transfer.label,
                        transfer.megabytes(),
                        transfer.transport
                    ));
                }
            }
            self.transfers.extend(transfers);
        }
        Ok(())
    }

    async fn configure(&self, ctx: &PipelineContext) -> Result<()> {
        let config = &ctx.config;
        let path = config.app_config_path();
        if write_app_config_once(&path, &config.app_config())? {
            ctx.reporter.ok(format!("Wrote {}", path.display()));
        } else {
            ctx.reporter
                .ok(format!("{} exists, left unchanged", path.display()));
        }

        let entries = [
            autostart_entry(
                PROXY_ENTRY,
                "Fractionate Edge reverse proxy",
                &proxy_service(config),
            ),
            autostart_entry(
                BACKEND_ENTRY,
                "Fractionate Edge backend",
                &backend_service(config),
            ),
        ];
        for entry in &entries {
            match self.autostart.ensure_registered(entry).await? {
                Registration::AlreadyRegistered => ctx
                    .reporter
                    .ok(format!("Autostart '{}' already registered", entry.name)),
                Registration::Registered => ctx
                    .reporter
                    .ok(format!("Registered autostart '{}'", entry.name)),
            }
        }
        Ok(())
    }

    async fn launch_services(&mut self, ctx: &PipelineContext) -> Result<()> {
        if self.options.skip_services {
            ctx.reporter.info("Service launch skipped");
            return Ok(());
        }

        for spec in [proxy_service(&ctx.config), backend_service(&ctx.config)] {
            let outcome = self.services.ensure_running(&spec).await?;
            debug!(
                service = %spec.endpoint.name,
                pid = outcome.handle().pid,
                started = matches!(outcome, LaunchOutcome::Started(_)),
                "Service up"
            );
        }

        let report = HealthMonitor::default().poll(self.health_probe.as_ref()).await;
        if report.is_ok() {
            ctx.reporter.ok(format!(
                "Backend healthy after {} attempt(s)",
                report.attempts
            ));
        } else {
            ctx.reporter.warn(format!(
                "Backend still starting after {} attempts (see {})",
                report.attempts,
                service_log_path(&ctx.config.logs_dir(), "backend").display()
            ));
        }
        for (name, component) in &report.components {
            ctx.reporter.info(format!(
                "{}: installed={} running={}",
                name, component.installed, component.running
            ));
        }
        self.health = Some(report);
        Ok(())
    }
}

#[async_trait]
impl StepExecutor for Provisioner {
    #[instrument(skip_all, fields(step = ?kind))]
    async fn execute(&mut self, ctx: &PipelineContext, kind: StepKind) -> Result<()> {
        match kind {
            StepKind::AdminCheck => self.check_privileges(ctx).await,
            StepKind::Prerequisites => self.install_prerequisites(ctx).await,
            StepKind::Directories => self.create_directories(ctx),
            StepKind::VirtualEnv => self.prepare_venv(ctx).await,
            StepKind::SecondaryModelKickoff => {
                self.start_florence_download(ctx);
                Ok(())
            }
            StepKind::PrimaryBuild => self.build_engine(ctx).await,
            StepKind::ProxyAndFiles => self.install_proxy_and_files(ctx).await,
            StepKind::AwaitDownloads => self.await_downloads(ctx).await,
            StepKind::ConfigureAutostart => self.configure(ctx).await,
            StepKind::LaunchServices => self.launch_services(ctx).await,
        }
    }
}

/// Copy the build output to the path the backend runs it from
fn place_output(target: &BuildTarget, located: &Located) -> Result<()> {
    let installed = &target.installed_output;
    if located.path() == installed.as_path() {
        return Ok(());
    }
    if installed.is_file() && file_sha256(installed)? == file_sha256(located.path())? {
        debug!(path = %installed.display(), "Build output already placed");
        return Ok(());
    }
    if let Some(parent) = installed.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    std::fs::copy(located.path(), installed).with_context(|| {
        format!(
            "Failed to copy {} to {}",
            located.path().display(),
            installed.display()
        )
    })?;
    info!(from = %located.path().display(), to = %installed.display(), "Build output placed");
    Ok(())
}

/// Lock, wire, and run the full pipeline on this machine
pub async fn provision(
    config: ResolvedConfig,
    reporter: ProgressReporter,
    options: InstallOptions,
) -> Result<ProvisionSummary> {
    let _lock = RunLock::acquire(&config.lock_path())?;

    let runner: Arc<dyn CommandRunner> = Arc::new(SystemRunner::new(reporter.clone()));
    let mut ctx = PipelineContext::new(config, reporter, runner);
    let mut provisioner = Provisioner::for_platform(&ctx, options)?;

    run_pipeline(&mut ctx, &mut provisioner).await?;
    Ok(provisioner.summary(&ctx))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::process::ProcessOutput;
    use tempfile::TempDir;

    struct Recording {
        ran: Vec<StepKind>,
        fail_at: Option<StepKind>,
    }

    #[async_trait]
    impl StepExecutor for Recording {
        async fn execute(&mut self, ctx: &PipelineContext, kind: StepKind) -> Result<()> {
            assert_eq!(ctx.total, 10);
            assert_eq!(StepKind::ALL[ctx.index - 1], kind);
            self.ran.push(kind);
            if self.fail_at == Some(kind) {
                anyhow::bail!("no llama-server");
            }
            Ok(())
        }
    }

    struct Scripted {
        output: ProcessOutput,
    }

    #[async_trait]
    impl CommandRunner for Scripted {
        async fn run(&self, _invocation: &Invocation) -> Result<ProcessOutput> {
            Ok(self.output.clone())
        }
    }

    fn context(home: &Path) -> PipelineContext {
        let config = ResolvedConfig::resolve(home.to_path_buf(), None, None, Platform::Linux);
        let runner = Arc::new(Scripted {
            output: ProcessOutput::new("", 0),
        });
        PipelineContext::new(config, ProgressReporter::hidden(), runner)
    }

    #[tokio::test]
    async fn test_steps_run_in_declared_order() {
        let temp = TempDir::new().unwrap();
        let mut ctx = context(temp.path());
        let mut exec = Recording {
            ran: Vec::new(),
            fail_at: None,
        };

        run_pipeline(&mut ctx, &mut exec).await.unwrap();

        assert_eq!(exec.ran, StepKind::ALL.to_vec());
        assert_eq!(ctx.index, 10);
    }

    #[tokio::test]
    async fn test_failed_build_aborts_before_service_launch() {
        let temp = TempDir::new().unwrap();
        let mut ctx = context(temp.path());
        let mut exec = Recording {
            ran: Vec::new(),
            fail_at: Some(StepKind::PrimaryBuild),
        };

        let err = run_pipeline(&mut ctx, &mut exec).await.unwrap_err();

        assert_eq!(exec.ran.len(), 6);
        assert!(!exec.ran.contains(&StepKind::LaunchServices));
        match err.downcast_ref::<ProvisionError>() {
            Some(ProvisionError::StepFailed { index, total, name }) => {
                assert_eq!((*index, *total), (6, 10));
                assert_eq!(name, StepKind::PrimaryBuild.description());
            }
            other => panic!("expected StepFailed, got {:?}", other),
        }
        assert!(format!("{:#}", err).contains("no llama-server"));
    }

    #[test]
    fn test_second_run_is_locked_out() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("setup.lock");

        let first = RunLock::acquire(&path).unwrap();
        let err = RunLock::acquire(&path).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ProvisionError>(),
            Some(ProvisionError::Locked { .. })
        ));

        drop(first);
        assert!(RunLock::acquire(&path).is_ok());
    }

    #[tokio::test]
    async fn test_root_detected_from_id() {
        let root = Scripted {
            output: ProcessOutput::new("0\n", 0),
        };
        let user = Scripted {
            output: ProcessOutput::new("1000\n", 0),
        };
        assert!(is_elevated(&root, Platform::Linux).await);
        assert!(!is_elevated(&user, Platform::Linux).await);
    }

    #[tokio::test]
    async fn test_net_session_exit_code_decides_on_windows() {
        let denied = Scripted {
            output: ProcessOutput::new("System error 5 has occurred.", 2),
        };
        assert!(!is_elevated(&denied, Platform::Windows).await);
    }

    #[test]
    fn test_backend_service_points_at_venv_and_home() {
        let config = ResolvedConfig::resolve(
            PathBuf::from("/srv/fractionate"),
            None,
            None,
            Platform::Linux,
        );
        let spec = backend_service(&config);

        assert_eq!(spec.program, PathBuf::from("/srv/fractionate/venv/bin/python"));
        assert_eq!(spec.working_dir, PathBuf::from("/srv/fractionate/server"));
        assert!(spec.args.contains(&"main:app".to_string()));
        assert!(spec.args.contains(&"8000".to_string()));
        assert_eq!(
            spec.env,
            vec![(HOME_ENV.to_string(), "/srv/fractionate".to_string())]
        );

        let proxy = proxy_service(&config);
        assert_eq!(proxy.cmdline_marker.as_deref(), Some("/srv/fractionate/Caddyfile"));
        assert_eq!(proxy.log_path, PathBuf::from("/srv/fractionate/logs/proxy.log"));
    }

    #[test]
    fn test_build_output_copied_to_backend_path() {
        let temp = TempDir::new().unwrap();
        let config = ResolvedConfig::resolve(temp.path().to_path_buf(), None, None, Platform::Linux);
        let target = config.build_target();

        let nested = target
            .checkout_path
            .join("build/3rdparty/llama.cpp/bin/llama-server");
        std::fs::create_dir_all(nested.parent().unwrap()).unwrap();
        std::fs::write(&nested, "elf").unwrap();

        let located = target.locate().unwrap();
        place_output(&target, &located).unwrap();

        let installed = target.checkout_path.join("build/bin/llama-server");
        assert_eq!(std::fs::read_to_string(installed).unwrap(), "elf");
    }

    #[test]
    fn test_reordered_candidates_still_place_at_backend_path() {
        let temp = TempDir::new().unwrap();
        let config = ResolvedConfig::resolve(temp.path().to_path_buf(), None, None, Platform::Linux);
        let mut target = config.build_target();
        target.expected_outputs = vec![
            PathBuf::from("out/llama-server"),
            PathBuf::from("build/3rdparty/llama.cpp/bin/llama-server"),
        ];

        let produced = target
            .checkout_path
            .join("build/3rdparty/llama.cpp/bin/llama-server");
        std::fs::create_dir_all(produced.parent().unwrap()).unwrap();
        std::fs::write(&produced, "elf").unwrap();

        let located = target.locate().unwrap();
        place_output(&target, &located).unwrap();

        assert_eq!(target.installed_output, config.engine_binary());
        assert_eq!(std::fs::read_to_string(config.engine_binary()).unwrap(), "elf");
        assert!(!target.checkout_path.join("out/llama-server").exists());
    }

    #[test]
    fn test_session_policy_per_platform() {
        assert!(privilege_problem(Platform::Windows, false, None).is_some());
        assert!(privilege_problem(Platform::Windows, true, None).is_none());
        assert!(privilege_problem(Platform::MacOs, true, None).is_some());
        assert!(privilege_problem(Platform::MacOs, false, None).is_none());

        // Plain user: apt calls sudo per command
        assert!(privilege_problem(Platform::Linux, false, Some("alice")).is_none());
        // Root login (containers): its own home is the right one
        assert!(privilege_problem(Platform::Linux, true, None).is_none());

        let problem = privilege_problem(Platform::Linux, true, Some("alice")).unwrap();
        assert!(matches!(problem, ProvisionError::Precondition { .. }));
        assert!(problem.to_string().contains("Re-run as alice without sudo"));
    }
}
