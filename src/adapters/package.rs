//! Platform package managers.
//!
//! winget on Windows, apt on Debian-family Linux, Homebrew on macOS. Each is
//! driven through the `CommandRunner` in last-line mode, since only the
//! final status line of a package install is worth showing.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tracing::debug;

use crate::core::progress::ProgressReporter;
use crate::domain::Platform;

use super::process::{CommandRunner, Invocation, OutputMode};

/// Installs packages by identifier
#[async_trait]
pub trait PackageManager: Send + Sync {
    fn name(&self) -> &str;

    /// Whether the package manager itself can be invoked
    async fn available(&self) -> bool;

    /// Install one package silently
    async fn install(&self, package: &str, extra_args: &[String]) -> Result<()>;

    /// What to tell the operator when the manager is missing
    fn manual_install_hint(&self) -> String;
}

/// Pick the package manager for `platform`
pub fn for_platform(
    platform: Platform,
    runner: Arc<dyn CommandRunner>,
    reporter: ProgressReporter,
) -> Arc<dyn PackageManager> {
    match platform {
        Platform::Windows => Arc::new(Winget::new(runner, reporter)),
        Platform::Linux => Arc::new(Apt::new(runner, reporter)),
        Platform::MacOs => Arc::new(Homebrew::new(runner, reporter)),
    }
}

async fn probe(runner: &dyn CommandRunner, program: &str, args: &[&str]) -> bool {
    if runner.resolve(program).is_none() {
        return false;
    }
    let inv = Invocation::new(program)
        .args(args.iter().copied())
        .mode(OutputMode::Suppressed);
    matches!(runner.run(&inv).await, Ok(output) if output.success())
}

async fn run_install(
    runner: &dyn CommandRunner,
    reporter: &ProgressReporter,
    manager: &str,
    package: &str,
    inv: Invocation,
    accepted_exit_codes: &[i32],
) -> Result<()> {
    let label = format!("{} install {}", manager, package);
    let output = reporter.await_process(&label, runner.run(&inv)).await?;

    if output.success() || accepted_exit_codes.contains(&output.exit_code) {
        debug!(package, exit_code = output.exit_code, "Package installed");
        return Ok(());
    }

    anyhow::bail!(
        "{} exited with code {}: {}",
        inv.display(),
        output.exit_code,
        output.last_line().unwrap_or("no output")
    )
}

/// Windows Package Manager
pub struct Winget {
    runner: Arc<dyn CommandRunner>,
    reporter: ProgressReporter,
}

/// winget: "no applicable upgrade" / "package already installed"
const WINGET_ALREADY_INSTALLED: [i32; 2] = [-1978335189, -1978335135];

impl Winget {
    pub fn new(runner: Arc<dyn CommandRunner>, reporter: ProgressReporter) -> Self {
        Self { runner, reporter }
    }
}

#[async_trait]
impl PackageManager for Winget {
    fn name(&self) -> &str {
        "winget"
    }

    async fn available(&self) -> bool {
        probe(self.runner.as_ref(), "winget", &["--version"]).await
    }

    async fn install(&self, package: &str, extra_args: &[String]) -> Result<()> {
        let inv = Invocation::new("winget")
            .args([
                "install",
                "--id",
                package,
                "--exact",
                "--silent",
                "--accept-package-agreements",
                "--accept-source-agreements",
                "--disable-interactivity",
            ])
            .args(extra_args.iter().cloned())
            .last_line();

        run_install(
            self.runner.as_ref(),
            &self.reporter,
            self.name(),
            package,
            inv,
            &WINGET_ALREADY_INSTALLED,
        )
        .await
    }

    fn manual_install_hint(&self) -> String {
        "Install \"App Installer\" from the Microsoft Store (provides winget), \
         or install the missing tool manually, then re-run setup"
            .to_string()
    }
}

/// Debian/Ubuntu apt, through sudo when it is installed
pub struct Apt {
    runner: Arc<dyn CommandRunner>,
    reporter: ProgressReporter,
    sudo: bool,
    index_refreshed: AtomicBool,
}

impl Apt {
    pub fn new(runner: Arc<dyn CommandRunner>, reporter: ProgressReporter) -> Self {
        let sudo = runner.resolve("sudo").is_some();
        Self {
            runner,
            reporter,
            sudo,
            index_refreshed: AtomicBool::new(false),
        }
    }

    /// sudo resets the environment, so the frontend is passed as an assignment
    fn apt_get(&self, args: &[&str]) -> Invocation {
        let inv = if self.sudo {
            Invocation::new("sudo").args(["DEBIAN_FRONTEND=noninteractive", "apt-get"])
        } else {
            Invocation::new("apt-get").env("DEBIAN_FRONTEND", "noninteractive")
        };
        inv.args(args.iter().copied()).last_line()
    }

    async fn refresh_index(&self) -> Result<()> {
        if self.index_refreshed.load(Ordering::SeqCst) {
            return Ok(());
        }
        let update = self.apt_get(&["update"]);
        let output = self
            .reporter
            .await_process("apt-get update", self.runner.run(&update))
            .await?;
        if !output.success() {
            anyhow::bail!(
                "apt-get update exited with code {}: {}",
                output.exit_code,
                output.last_line().unwrap_or("no output")
            );
        }
        self.index_refreshed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

#[async_trait]
impl PackageManager for Apt {
    fn name(&self) -> &str {
        "apt-get"
    }

    async fn available(&self) -> bool {
        probe(self.runner.as_ref(), "apt-get", &["--version"]).await
    }

    async fn install(&self, package: &str, extra_args: &[String]) -> Result<()> {
        self.refresh_index().await?;

        let inv = self
            .apt_get(&["install", "-y", "--no-install-recommends"])
            .args(extra_args.iter().cloned())
            .arg(package);

        run_install(
            self.runner.as_ref(),
            &self.reporter,
            self.name(),
            package,
            inv,
            &[],
        )
        .await
    }

    fn manual_install_hint(&self) -> String {
        "apt-get was not found; install the missing tool with your distribution's \
         package manager, then re-run setup"
            .to_string()
    }
}

/// Homebrew
pub struct Homebrew {
    runner: Arc<dyn CommandRunner>,
    reporter: ProgressReporter,
}

impl Homebrew {
    pub fn new(runner: Arc<dyn CommandRunner>, reporter: ProgressReporter) -> Self {
        Self { runner, reporter }
    }
}

#[async_trait]
impl PackageManager for Homebrew {
    fn name(&self) -> &str {
        "brew"
    }

    async fn available(&self) -> bool {
        probe(self.runner.as_ref(), "brew", &["--version"]).await
    }

    async fn install(&self, package: &str, extra_args: &[String]) -> Result<()> {
        let inv = Invocation::new("brew")
            .arg("install")
            .args(extra_args.iter().cloned())
            .arg(package)
            .env("HOMEBREW_NO_AUTO_UPDATE", "1")
            .last_line();

        run_install(
            self.runner.as_ref(),
            &self.reporter,
            self.name(),
            package,
            inv,
            &[],
        )
        .await
    }

    fn manual_install_hint(&self) -> String {
        "Install Homebrew from https://brew.sh, then re-run setup".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::ProcessOutput;
    use std::path::PathBuf;
    use std::sync::Mutex;

    /// `apt-get update` fails once, everything else succeeds
    struct FlakyMirror {
        calls: Mutex<Vec<String>>,
        update_failures: Mutex<u32>,
    }

    #[async_trait]
    impl CommandRunner for FlakyMirror {
        async fn run(&self, inv: &Invocation) -> Result<ProcessOutput> {
            self.calls.lock().unwrap().push(inv.display());
            if inv.args.iter().any(|a| a == "update") {
                let mut failures = self.update_failures.lock().unwrap();
                if *failures > 0 {
                    *failures -= 1;
                    return Ok(ProcessOutput::new("E: Failed to fetch mirror index", 100));
                }
            }
            Ok(ProcessOutput::new("", 0))
        }

        fn resolve(&self, program: &str) -> Option<PathBuf> {
            (program == "sudo").then(|| PathBuf::from("/usr/bin/sudo"))
        }
    }

    #[tokio::test]
    async fn test_failed_index_refresh_is_retried() {
        let runner = Arc::new(FlakyMirror {
            calls: Mutex::new(Vec::new()),
            update_failures: Mutex::new(1),
        });
        let apt = Apt::new(runner.clone(), ProgressReporter::hidden());

        let err = apt.install("cmake", &[]).await.unwrap_err();
        assert!(err.to_string().contains("apt-get update exited with code 100"));

        apt.install("cmake", &[]).await.unwrap();
        apt.install("git", &[]).await.unwrap();

        assert_eq!(
            *runner.calls.lock().unwrap(),
            vec![
                "sudo DEBIAN_FRONTEND=noninteractive apt-get update",
                "sudo DEBIAN_FRONTEND=noninteractive apt-get update",
                "sudo DEBIAN_FRONTEND=noninteractive apt-get install -y --no-install-recommends cmake",
                "sudo DEBIAN_FRONTEND=noninteractive apt-get install -y --no-install-recommends git",
            ]
        );
    }
}
