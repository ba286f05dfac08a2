//! Check-then-install for external tools.
//!
//! Presence checks never have side effects: resolve the command, reject
//! known stub locations, run the version query and check its output shape.
//! Installs go through the platform package manager at most once per tool
//! per run.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::Result;
use tracing::{debug, info, instrument};

use crate::adapters::package::PackageManager;
use crate::adapters::process::{program_in, CommandRunner, Invocation};
use crate::domain::{InstalledTool, Presence, ProvisionError, ToolVersion};

use super::progress::ProgressReporter;

/// What `ensure` did for a tool
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnsureOutcome {
    /// Usable before we touched anything
    AlreadyPresent {
        path: PathBuf,
        version: Option<ToolVersion>,
    },

    /// Installed during this run and verified afterwards
    Installed {
        path: PathBuf,
        version: Option<ToolVersion>,
    },
}

impl EnsureOutcome {
    pub fn path(&self) -> &Path {
        match self {
            Self::AlreadyPresent { path, .. } | Self::Installed { path, .. } => path,
        }
    }
}

/// Installs missing tools through a package manager
pub struct DependencyInstaller {
    runner: Arc<dyn CommandRunner>,
    packages: Arc<dyn PackageManager>,
    reporter: ProgressReporter,
    attempted: Mutex<HashSet<String>>,
}

impl DependencyInstaller {
    pub fn new(
        runner: Arc<dyn CommandRunner>,
        packages: Arc<dyn PackageManager>,
        reporter: ProgressReporter,
    ) -> Self {
        Self {
            runner,
            packages,
            reporter,
            attempted: Mutex::new(HashSet::new()),
        }
    }

    /// Side-effect-free presence and version check.
    ///
    /// Candidates are every resolvable command on the search path, then the
    /// tool's well-known install directories. The first usable candidate
    /// wins; otherwise the most informative failure is returned.
    pub async fn presence(&self, tool: &InstalledTool) -> Presence {
        let mut fallback: Option<Presence> = None;

        for candidate in self.candidates(tool) {
            let presence = self.check_candidate(tool, &candidate).await;
            debug!(tool = %tool.name, path = %candidate.display(), ?presence, "Presence check");

            match presence {
                Presence::Usable { .. } => return presence,
                Presence::TooOld { .. } => {
                    if !matches!(fallback, Some(Presence::TooOld { .. })) {
                        fallback = Some(presence);
                    }
                }
                _ => {
                    if fallback.is_none() {
                        fallback = Some(presence);
                    }
                }
            }
        }

        fallback.unwrap_or(Presence::Missing)
    }

    fn candidates(&self, tool: &InstalledTool) -> Vec<PathBuf> {
        let mut seen = Vec::new();
        let on_path = tool.commands.iter().filter_map(|c| self.runner.resolve(c));
        let in_extra_dirs = tool.extra_search_paths.iter().flat_map(|dir| {
            tool.commands
                .iter()
                .filter_map(move |c| program_in(dir, c))
        });

        for path in on_path.chain(in_extra_dirs) {
            if !seen.contains(&path) {
                seen.push(path);
            }
        }
        seen
    }

    async fn check_candidate(&self, tool: &InstalledTool, path: &Path) -> Presence {
        if tool.is_rejected(path) {
            return Presence::Unusable {
                path: path.to_path_buf(),
                reason: "resolves to a placeholder, not a real installation".to_string(),
            };
        }

        let query = Invocation::path(path).args(tool.version_args.iter().cloned());
        let output = match self.runner.run(&query).await {
            Ok(output) => output,
            Err(e) => {
                return Presence::Unusable {
                    path: path.to_path_buf(),
                    reason: format!("version query could not run: {:#}", e),
                }
            }
        };

        if !output.success() {
            return Presence::Unusable {
                path: path.to_path_buf(),
                reason: format!("version query exited with code {}", output.exit_code),
            };
        }

        let Some(pattern) = &tool.version_pattern else {
            return if output.combined.trim().is_empty() {
                Presence::Unusable {
                    path: path.to_path_buf(),
                    reason: "version query printed nothing".to_string(),
                }
            } else {
                Presence::Usable {
                    path: path.to_path_buf(),
                    version: None,
                }
            };
        };

        let Some(found) = ToolVersion::parse(&output.combined, pattern) else {
            return Presence::Unusable {
                path: path.to_path_buf(),
                reason: format!(
                    "unexpected version output: {}",
                    output.last_line().unwrap_or("(empty)")
                ),
            };
        };

        match tool.minimum_version {
            Some(required) if found < required => Presence::TooOld {
                path: path.to_path_buf(),
                found,
                required,
            },
            _ => Presence::Usable {
                path: path.to_path_buf(),
                version: Some(found),
            },
        }
    }

    /// Make `tool` usable, installing it if needed.
    ///
    /// A tool that is already usable is never installed. A tool below its
    /// version floor is fatal.
    #[instrument(skip(self, tool), fields(tool = %tool.name))]
    pub async fn ensure(&self, tool: &InstalledTool) -> Result<EnsureOutcome> {
        match self.presence(tool).await {
            Presence::Usable { path, version } => {
                self.expose(&path);
                self.reporter
                    .ok(format!("{} found at {}", describe(tool, version), path.display()));
                return Ok(EnsureOutcome::AlreadyPresent { path, version });
            }
            Presence::TooOld {
                path,
                found,
                required,
            } => {
                return Err(ProvisionError::install(
                    &tool.name,
                    format!(
                        "{} at {} is version {}, {} or newer is required",
                        tool.name,
                        path.display(),
                        found,
                        required
                    ),
                )
                .into());
            }
            Presence::Unusable { path, reason } => {
                self.reporter.warn(format!(
                    "{} at {} is not usable ({})",
                    tool.name,
                    path.display(),
                    reason
                ));
            }
            Presence::Missing => {
                self.reporter.info(format!("{} not found", tool.name));
            }
        }

        if tool.packages.is_empty() {
            return Err(ProvisionError::precondition(
                format!("{} is not installed", tool.name),
                tool.manual_hint.clone(),
            )
            .into());
        }

        let first_attempt = self
            .attempted
            .lock()
            .map(|mut set| set.insert(tool.name.clone()))
            .unwrap_or(false);
        if !first_attempt {
            return Err(ProvisionError::install(
                &tool.name,
                "install was already attempted in this run",
            )
            .into());
        }

        if !self.packages.available().await {
            return Err(ProvisionError::precondition(
                format!("{} is not available to install {}", self.packages.name(), tool.name),
                self.packages.manual_install_hint(),
            )
            .into());
        }

        for package in &tool.packages {
            self.packages
                .install(package, &tool.install_args)
                .await
                .map_err(|e| ProvisionError::install(&tool.name, format!("{:#}", e)))?;
        }

        for dir in &tool.extra_search_paths {
            if dir.is_dir() {
                self.runner.append_search_path(dir);
            }
        }

        match self.presence(tool).await {
            Presence::Usable { path, version } => {
                self.expose(&path);
                self.reporter
                    .ok(format!("{} installed", describe(tool, version)));
                info!(path = %path.display(), "Installed");
                Ok(EnsureOutcome::Installed { path, version })
            }
            other => Err(ProvisionError::install(
                &tool.name,
                format!("still not usable after install: {}", describe_presence(&other)),
            )
            .into()),
        }
    }

    /// Ensure every tool in order, stopping at the first failure
    pub async fn ensure_all(&self, tools: &[InstalledTool]) -> Result<Vec<EnsureOutcome>> {
        let mut outcomes = Vec::with_capacity(tools.len());
        for tool in tools {
            outcomes.push(self.ensure(tool).await?);
        }
        Ok(outcomes)
    }

    /// Tools found in a well-known directory must be visible to later steps
    fn expose(&self, path: &Path) {
        let Some(dir) = path.parent() else {
            return;
        };
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        if self.runner.resolve(&name).as_deref() != Some(path) {
            self.runner.append_search_path(dir);
        }
    }
}

fn describe(tool: &InstalledTool, version: Option<ToolVersion>) -> String {
    match version {
        Some(v) => format!("{} {}", tool.name, v),
        None => tool.name.clone(),
    }
}

fn describe_presence(presence: &Presence) -> String {
    match presence {
        Presence::Usable { path, .. } => format!("usable at {}", path.display()),
        Presence::Unusable { path, reason } => format!("{} ({})", reason, path.display()),
        Presence::TooOld {
            found, required, ..
        } => format!("version {} is below {}", found, required),
        Presence::Missing => "not found on the search path".to_string(),
    }
}
