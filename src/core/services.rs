//! Service launcher and health monitor.
//!
//! Services are started detached and identified afterwards by a retained
//! handle (pid + start time) persisted under `run/`. The health monitor
//! polls the backend through the proxy with a fixed delay and never fails
//! the run: exhausting its attempts yields a degraded report.

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, System, UpdateKind};
use tracing::{debug, info, instrument, warn};

use crate::domain::{
    HealthReport, HealthResponse, LaunchOutcome, OverallStatus, ProcessHandle, ServiceSpec,
};

use super::progress::ProgressReporter;

/// Pause after a detached start before the process is inspected
pub const SETTLE_TIME: Duration = Duration::from_secs(3);

/// Default number of health probes
pub const HEALTH_ATTEMPTS: u32 = 10;

/// Fixed delay between health probes
pub const HEALTH_DELAY: Duration = Duration::from_secs(2);

/// Per-request timeout of the HTTP probe
pub const HEALTH_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Starts services once and remembers them
pub struct ServiceLauncher {
    run_dir: PathBuf,
    settle: Duration,
    reporter: ProgressReporter,
}

impl ServiceLauncher {
    pub fn new(run_dir: impl Into<PathBuf>, reporter: ProgressReporter) -> Self {
        Self {
            run_dir: run_dir.into(),
            settle: SETTLE_TIME,
            reporter,
        }
    }

    pub fn with_settle(mut self, settle: Duration) -> Self {
        self.settle = settle;
        self
    }

    fn handle_path(&self, name: &str) -> PathBuf {
        self.run_dir.join(format!("{}.json", name))
    }

    /// Previously recorded handle, if any
    pub fn load_handle(&self, name: &str) -> Option<ProcessHandle> {
        let path = self.handle_path(name);
        let content = std::fs::read_to_string(&path).ok()?;
        match serde_json::from_str(&content) {
            Ok(handle) => Some(handle),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Ignoring unreadable process handle");
                None
            }
        }
    }

    fn save_handle(&self, name: &str, handle: &ProcessHandle) -> Result<()> {
        std::fs::create_dir_all(&self.run_dir)
            .with_context(|| format!("Failed to create {}", self.run_dir.display()))?;
        let path = self.handle_path(name);
        let json = serde_json::to_string_pretty(handle)?;
        std::fs::write(&path, json)
            .with_context(|| format!("Failed to write process handle {}", path.display()))
    }

    /// A live process for `spec`: the retained handle if it still matches,
    /// else any process with the expected name and command line
    pub async fn find_running(&self, spec: &ServiceSpec) -> Option<ProcessHandle> {
        let retained = self.load_handle(&spec.endpoint.name);
        let spec = spec.clone();
        tokio::task::spawn_blocking(move || {
            let mut system = System::new();
            // Command lines are not loaded by a plain refresh
            system.refresh_processes_specifics(
                ProcessesToUpdate::All,
                true,
                ProcessRefreshKind::new().with_cmd(UpdateKind::Always),
            );
            find_in_table(&system, &spec, retained.as_ref())
        })
        .await
        .unwrap_or_default()
    }
}

/// Starts a service unless an instance is already up
#[async_trait]
pub trait ServiceControl: Send + Sync {
    async fn ensure_running(&self, spec: &ServiceSpec) -> Result<LaunchOutcome>;
}

#[async_trait]
impl ServiceControl for ServiceLauncher {
    #[instrument(skip(self, spec), fields(service = %spec.endpoint.name))]
    async fn ensure_running(&self, spec: &ServiceSpec) -> Result<LaunchOutcome> {
        let name = &spec.endpoint.name;

        if let Some(handle) = self.find_running(spec).await {
            self.save_handle(name, &handle)?;
            self.reporter
                .ok(format!("{} already running (pid {})", name, handle.pid));
            return Ok(LaunchOutcome::AlreadyRunning(handle));
        }

        let pid = spawn_detached(spec)?;
        info!(pid, "Started detached");
        self.reporter
            .info(format!("Starting {} on {}", name, spec.endpoint.authority()));
        tokio::time::sleep(self.settle).await;

        let start_time = tokio::task::spawn_blocking(move || process_start_time(pid))
            .await
            .unwrap_or_default()
            .with_context(|| {
                format!(
                    "{} exited during startup (see {})",
                    name,
                    spec.log_path.display()
                )
            })?;

        let handle = ProcessHandle::new(pid, start_time);
        self.save_handle(name, &handle)?;
        self.reporter.ok(format!("{} started (pid {})", name, pid));
        Ok(LaunchOutcome::Started(handle))
    }
}

fn process_start_time(pid: u32) -> Option<u64> {
    let mut system = System::new();
    let pid = Pid::from_u32(pid);
    system.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
    system.process(pid).map(|p| p.start_time())
}

fn find_in_table(
    system: &System,
    spec: &ServiceSpec,
    retained: Option<&ProcessHandle>,
) -> Option<ProcessHandle> {
    if let Some(handle) = retained {
        if let Some(process) = system.process(Pid::from_u32(handle.pid)) {
            if process.start_time() == handle.start_time {
                debug!(pid = handle.pid, "Retained handle is live");
                return Some(handle.clone());
            }
        }
    }

    system.processes().iter().find_map(|(pid, process)| {
        let name = process.name().to_string_lossy();
        let cmdline = process
            .cmd()
            .iter()
            .map(|a| a.to_string_lossy())
            .collect::<Vec<_>>()
            .join(" ");
        process_matches(&name, &cmdline, spec)
            .then(|| ProcessHandle::new(pid.as_u32(), process.start_time()))
    })
}

/// Whether a process-table entry is an instance of `spec`.
///
/// Names match by prefix so `python3.11` counts as `python`.
pub fn process_matches(process_name: &str, cmdline: &str, spec: &ServiceSpec) -> bool {
    let name = process_name.to_ascii_lowercase();
    if !name.starts_with(&spec.process_name.to_ascii_lowercase()) {
        return false;
    }
    spec.cmdline_marker
        .as_deref()
        .map_or(true, |marker| cmdline.contains(marker))
}

/// Start `spec` in its own session, output appended to its log
fn spawn_detached(spec: &ServiceSpec) -> Result<u32> {
    if let Some(parent) = spec.log_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    let log = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&spec.log_path)
        .with_context(|| format!("Failed to open {}", spec.log_path.display()))?;
    let log_err = log.try_clone().context("Failed to duplicate log handle")?;

    let mut cmd = std::process::Command::new(&spec.program);
    cmd.args(&spec.args)
        .current_dir(&spec.working_dir)
        .stdin(Stdio::null())
        .stdout(Stdio::from(log))
        .stderr(Stdio::from(log_err));
    for (key, value) in &spec.env {
        cmd.env(key, value);
    }
    detach(&mut cmd);

    let child = cmd
        .spawn()
        .with_context(|| format!("Failed to start {}", spec.program.display()))?;
    Ok(child.id())
}

#[cfg(unix)]
fn detach(cmd: &mut std::process::Command) {
    use std::os::unix::process::CommandExt;
    cmd.process_group(0);
}

#[cfg(windows)]
fn detach(cmd: &mut std::process::Command) {
    use std::os::windows::process::CommandExt;
    const DETACHED_PROCESS: u32 = 0x0000_0008;
    const CREATE_NEW_PROCESS_GROUP: u32 = 0x0000_0200;
    const CREATE_NO_WINDOW: u32 = 0x0800_0000;
    cmd.creation_flags(DETACHED_PROCESS | CREATE_NEW_PROCESS_GROUP | CREATE_NO_WINDOW);
}

/// One read of the composite health endpoint
#[async_trait]
pub trait HealthProbe: Send + Sync {
    async fn probe(&self) -> Result<HealthResponse>;
}

/// `GET <url>` decoded as `HealthResponse`
pub struct HttpHealthProbe {
    client: reqwest::Client,
    url: String,
}

impl HttpHealthProbe {
    pub fn new(url: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(HEALTH_REQUEST_TIMEOUT)
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl HealthProbe for HttpHealthProbe {
    async fn probe(&self) -> Result<HealthResponse> {
        let response = self
            .client
            .get(&self.url)
            .send()
            .await
            .with_context(|| format!("GET {} failed", self.url))?;
        response
            .json::<HealthResponse>()
            .await
            .with_context(|| format!("Unexpected body from {}", self.url))
    }
}

/// Bounded fixed-delay health polling
#[derive(Debug, Clone, Copy)]
pub struct HealthMonitor {
    pub attempts: u32,
    pub delay: Duration,
}

impl Default for HealthMonitor {
    fn default() -> Self {
        Self {
            attempts: HEALTH_ATTEMPTS,
            delay: HEALTH_DELAY,
        }
    }
}

impl HealthMonitor {
    /// Poll until `status == "ok"` or attempts run out.
    ///
    /// Stops at the first ok response with no trailing delay. Exhaustion is
    /// not an error; the report is `Degraded`.
    pub async fn poll(&self, probe: &dyn HealthProbe) -> HealthReport {
        let mut last: Option<HealthResponse> = None;

        for attempt in 1..=self.attempts {
            match probe.probe().await {
                Ok(response) if response.is_ok() => {
                    info!(attempt, "Backend healthy");
                    return HealthReport::from_response(OverallStatus::Ok, attempt, Some(&response));
                }
                Ok(response) => {
                    debug!(attempt, status = %response.status, "Backend not ready");
                    last = Some(response);
                }
                Err(e) => debug!(attempt, error = %format!("{:#}", e), "Health probe failed"),
            }

            if attempt < self.attempts {
                tokio::time::sleep(self.delay).await;
            }
        }

        warn!(attempts = self.attempts, "Backend did not report healthy");
        HealthReport::from_response(OverallStatus::Degraded, self.attempts, last.as_ref())
    }
}

/// Log file for a service under `logs/`
pub fn service_log_path(logs_dir: &Path, name: &str) -> PathBuf {
    logs_dir.join(format!("{}.log", name))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ServiceEndpoint;

    fn backend_spec() -> ServiceSpec {
        ServiceSpec {
            endpoint: ServiceEndpoint::new("backend", "127.0.0.1", 8000),
            process_name: "python".to_string(),
            cmdline_marker: Some("uvicorn".to_string()),
            program: PathBuf::from("python"),
            args: vec![],
            working_dir: PathBuf::from("."),
            env: vec![],
            log_path: PathBuf::from("backend.log"),
        }
    }

    #[test]
    fn test_process_matches_name_and_marker() {
        let spec = backend_spec();
        assert!(process_matches(
            "python.exe",
            "python -m uvicorn main:app --port 8000",
            &spec
        ));
        assert!(process_matches("Python", "python -m uvicorn main:app", &spec));
        assert!(process_matches("python3.11", "/h/venv/bin/python -m uvicorn main:app", &spec));
        assert!(!process_matches("python", "python manage.py", &spec));
        assert!(!process_matches("caddy", "caddy run", &spec));
    }

    #[test]
    fn test_marker_optional() {
        let mut spec = backend_spec();
        spec.process_name = "caddy".to_string();
        spec.cmdline_marker = None;
        assert!(process_matches("caddy.exe", "", &spec));
    }

    #[test]
    fn test_handle_persisted_per_service() {
        let temp = tempfile::TempDir::new().unwrap();
        let launcher = ServiceLauncher::new(temp.path().join("run"), ProgressReporter::hidden());

        assert!(launcher.load_handle("proxy").is_none());
        let handle = ProcessHandle::new(77, 1_700_000_000);
        launcher.save_handle("proxy", &handle).unwrap();
        assert_eq!(launcher.load_handle("proxy"), Some(handle));
        assert!(launcher.load_handle("backend").is_none());
    }

    #[tokio::test]
    async fn test_own_process_found_by_retained_handle() {
        let temp = tempfile::TempDir::new().unwrap();
        let launcher = ServiceLauncher::new(temp.path(), ProgressReporter::hidden());

        let pid = std::process::id();
        let start_time = process_start_time(pid).unwrap();
        launcher
            .save_handle("backend", &ProcessHandle::new(pid, start_time))
            .unwrap();

        let mut spec = backend_spec();
        spec.process_name = "no-such-process-name".to_string();
        let found = launcher.find_running(&spec).await.unwrap();
        assert_eq!(found.pid, pid);
    }

    #[tokio::test]
    async fn test_stale_handle_ignored() {
        let temp = tempfile::TempDir::new().unwrap();
        let launcher = ServiceLauncher::new(temp.path(), ProgressReporter::hidden());

        // Same pid, different start time: a recycled pid, not our service
        let pid = std::process::id();
        launcher
            .save_handle("backend", &ProcessHandle::new(pid, 1))
            .unwrap();

        let mut spec = backend_spec();
        spec.process_name = "no-such-process-name".to_string();
        assert!(launcher.find_running(&spec).await.is_none());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_external_process_found_by_cmdline_marker() {
        let temp = tempfile::TempDir::new().unwrap();
        let launcher = ServiceLauncher::new(temp.path(), ProgressReporter::hidden());
        let mut child = std::process::Command::new("sleep")
            .arg("37.123")
            .spawn()
            .unwrap();

        let mut spec = backend_spec();
        spec.process_name = "sleep".to_string();
        spec.cmdline_marker = Some("37.123".to_string());
        let found = launcher.find_running(&spec).await;

        spec.cmdline_marker = Some("37.987".to_string());
        let other = launcher.find_running(&spec).await;

        child.kill().unwrap();
        child.wait().unwrap();

        assert_eq!(found.map(|h| h.pid), Some(child.id()));
        assert!(other.is_none());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_started_service_is_not_started_twice() {
        let temp = tempfile::TempDir::new().unwrap();
        let launcher = ServiceLauncher::new(temp.path().join("run"), ProgressReporter::hidden())
            .with_settle(Duration::from_millis(200));
        let spec = ServiceSpec {
            endpoint: ServiceEndpoint::new("sleeper", "127.0.0.1", 0),
            process_name: "sleep".to_string(),
            cmdline_marker: Some("41.75".to_string()),
            program: PathBuf::from("sleep"),
            args: vec!["41.75".to_string()],
            working_dir: temp.path().to_path_buf(),
            env: vec![],
            log_path: temp.path().join("logs").join("sleeper.log"),
        };

        let first = launcher.ensure_running(&spec).await.unwrap();
        let second = launcher.ensure_running(&spec).await.unwrap();
        let pid = first.handle().pid;
        let _ = std::process::Command::new("kill").arg(pid.to_string()).status();

        assert!(matches!(first, LaunchOutcome::Started(_)));
        assert!(matches!(second, LaunchOutcome::AlreadyRunning(_)));
        assert_eq!(second.handle().pid, pid);
        assert!(spec.log_path.is_file());
    }
}
