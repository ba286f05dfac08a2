//! Inference engine build orchestration.
//!
//! Linear state machine with one fork:
//! probe -> acquire source -> python deps (best effort) -> vendor setup
//! script or manual CMake build -> verify. Success is decided by finding
//! the output on disk, never by a command's exit status.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use tokio::io::AsyncWriteExt;
use tracing::{debug, instrument, warn};

use crate::adapters::process::{CommandRunner, Invocation, LineFilter, ProcessOutput};
use crate::domain::{BuildOutcome, BuildTarget, ProvisionError};

use super::progress::ProgressReporter;

/// Drives one `BuildTarget` to a terminal state
pub struct BuildOrchestrator {
    runner: Arc<dyn CommandRunner>,
    reporter: ProgressReporter,
    target: BuildTarget,

    /// Interpreter used for pip and the setup script (the venv's python)
    python: PathBuf,

    /// Transcript of every build command
    log_path: PathBuf,
}

impl BuildOrchestrator {
    pub fn new(
        runner: Arc<dyn CommandRunner>,
        reporter: ProgressReporter,
        target: BuildTarget,
        python: PathBuf,
        log_path: PathBuf,
    ) -> Self {
        Self {
            runner,
            reporter,
            target,
            python,
            log_path,
        }
    }

    /// Run to `Satisfied`, `Built`, or a `ProvisionError::Build`
    #[instrument(skip(self), fields(checkout = %self.target.checkout_path.display()))]
    pub async fn run(&self) -> Result<BuildOutcome> {
        if let Some(found) = self.target.probe() {
            self.reporter
                .ok(format!("Build output already present: {}", found.path().display()));
            return Ok(BuildOutcome::Satisfied(found));
        }

        self.acquire_source().await?;
        self.install_python_deps().await;

        if self.target.entry_point_path().is_file() {
            self.run_setup_script().await?;
            self.relocate_models().await?;
        } else {
            self.reporter.warn(format!(
                "{} not found, building with CMake directly",
                self.target.primary_entry_point
            ));
            self.run_cmake_build().await?;
        }

        match self.target.locate() {
            Some(found) => {
                self.reporter
                    .ok(format!("Built {}", found.path().display()));
                Ok(BuildOutcome::Built(found))
            }
            None => Err(ProvisionError::Build {
                output: self.target.output_file_name.clone(),
                log: self.log_path.clone(),
            }
            .into()),
        }
    }

    async fn acquire_source(&self) -> Result<()> {
        let checkout = &self.target.checkout_path;

        if checkout.join(".git").exists() {
            let pull = Invocation::new("git")
                .arg("-C")
                .arg(checkout.to_string_lossy())
                .arg("pull")
                .last_line();
            let output = self.run_logged("git pull", &pull).await?;
            if !output.success() {
                // A stale checkout still builds; don't abort on an offline pull
                self.reporter
                    .warn(format!("git pull failed (exit {}), using existing checkout", output.exit_code));
            }

            let submodules = Invocation::new("git")
                .arg("-C")
                .arg(checkout.to_string_lossy())
                .args(["submodule", "update", "--init", "--recursive"])
                .last_line();
            let output = self.run_logged("git submodule update", &submodules).await?;
            if !output.success() {
                anyhow::bail!(
                    "git submodule update failed with exit code {} (see {})",
                    output.exit_code,
                    self.log_path.display()
                );
            }
            return Ok(());
        }

        if let Some(parent) = checkout.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }

        let clone = Invocation::new("git")
            .args(["clone", "--recursive", self.target.repo_url.as_str()])
            .arg(checkout.to_string_lossy())
            .last_line();
        let output = self
            .run_logged(&format!("Cloning {}", self.target.repo_url), &clone)
            .await?;
        if !output.success() {
            anyhow::bail!(
                "git clone of {} failed with exit code {} (see {})",
                self.target.repo_url,
                output.exit_code,
                self.log_path.display()
            );
        }
        Ok(())
    }

    /// Failures here are logged only; the setup script may still succeed
    async fn install_python_deps(&self) {
        let checkout = &self.target.checkout_path;
        let gguf_py = checkout.join("3rdparty").join("llama.cpp").join("gguf-py");
        let requirements = checkout.join("requirements.txt");

        let mut installs = Vec::new();
        if gguf_py.is_dir() {
            installs.push((
                "pip install gguf-py",
                vec!["-e".to_string(), gguf_py.to_string_lossy().to_string()],
            ));
        }
        if requirements.is_file() {
            installs.push((
                "pip install -r requirements.txt",
                vec!["-r".to_string(), requirements.to_string_lossy().to_string()],
            ));
        }

        for (label, args) in installs {
            let inv = Invocation::path(&self.python)
                .args(["-m", "pip", "install", "--disable-pip-version-check"])
                .args(args)
                .cwd(checkout)
                .last_line();

            match self.run_logged(label, &inv).await {
                Ok(output) if output.success() => debug!(label, "Python dependency installed"),
                Ok(output) => self
                    .reporter
                    .warn(format!("{} failed (exit {}), continuing", label, output.exit_code)),
                Err(e) => self
                    .reporter
                    .warn(format!("{} could not run: {:#}", label, e)),
            }
        }
    }

    async fn run_setup_script(&self) -> Result<()> {
        let inv = Invocation::path(&self.python)
            .arg(&self.target.primary_entry_point)
            .args(["--hf-repo", self.target.model_repo.as_str()])
            .args(["-q", self.target.quantization.as_str()])
            .cwd(&self.target.checkout_path)
            .streamed(Some(LineFilter::build_progress()));

        let output = self
            .run_logged("Running BitNet setup (downloads and compiles)", &inv)
            .await?;
        if !output.success() {
            // Verification decides; the script exits non-zero on harmless warnings too
            warn!(exit_code = output.exit_code, "Setup script exited non-zero");
            self.reporter.warn(format!(
                "Setup script exited with code {}; checking for build output",
                output.exit_code
            ));
        }
        Ok(())
    }

    /// Copy a generated model into the canonical model path, once
    async fn relocate_models(&self) -> Result<Option<PathBuf>> {
        let destination = &self.target.model_destination;
        if destination.is_file() {
            debug!(dest = %destination.display(), "Model already in place");
            return Ok(None);
        }

        let models_dir = self.target.checkout_path.join("models");
        let Some(source) = find_model_file(&models_dir, &self.target.quantization) else {
            self.reporter
                .warn("Setup script produced no model file; it will be downloaded instead");
            return Ok(None);
        };

        if let Some(parent) = destination.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        tokio::fs::copy(&source, destination)
            .await
            .with_context(|| {
                format!(
                    "Failed to copy {} to {}",
                    source.display(),
                    destination.display()
                )
            })?;

        self.reporter
            .ok(format!("Model copied to {}", destination.display()));
        Ok(Some(destination.clone()))
    }

    async fn run_cmake_build(&self) -> Result<()> {
        let checkout = &self.target.checkout_path;
        let build_dir = self.target.build_dir();

        if build_dir.exists() {
            tokio::fs::remove_dir_all(&build_dir)
                .await
                .with_context(|| format!("Failed to remove {}", build_dir.display()))?;
        }

        let configure = Invocation::new("cmake")
            .args(["-B", "build"])
            .args(self.target.fallback_compiler.cmake_args())
            .arg("-DCMAKE_BUILD_TYPE=Release")
            .cwd(checkout)
            .streamed(Some(LineFilter::build_progress()));
        let output = self.run_logged("Configuring with CMake", &configure).await?;
        if !output.success() {
            warn!(exit_code = output.exit_code, "CMake configure exited non-zero");
        }

        let jobs = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        let compile = Invocation::new("cmake")
            .args(["--build", "build", "--config", "Release", "-j"])
            .arg(jobs.to_string())
            .cwd(checkout)
            .streamed(Some(LineFilter::build_progress()));
        let output = self
            .run_logged(&format!("Compiling ({} jobs)", jobs), &compile)
            .await?;
        if !output.success() {
            warn!(exit_code = output.exit_code, "CMake build exited non-zero");
        }
        Ok(())
    }

    /// Run under a spinner and append the transcript to the build log
    async fn run_logged(&self, label: &str, inv: &Invocation) -> Result<ProcessOutput> {
        let output = self
            .reporter
            .await_process(label, self.runner.run(inv))
            .await?;
        if let Err(e) = append_transcript(&self.log_path, inv, &output).await {
            warn!(error = %e, log = %self.log_path.display(), "Could not write build log");
        }
        Ok(output)
    }
}

async fn append_transcript(log: &Path, inv: &Invocation, output: &ProcessOutput) -> Result<()> {
    if let Some(parent) = log.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(log)
        .await?;

    let header = format!(
        "==> [{}] {} (exit {})\n",
        Utc::now().to_rfc3339(),
        inv.display(),
        output.exit_code
    );
    file.write_all(header.as_bytes()).await?;
    file.write_all(output.combined.as_bytes()).await?;
    file.write_all(b"\n").await?;
    Ok(())
}

/// Pick the generated model: prefer one named after the quantization
fn find_model_file(models_dir: &Path, quantization: &str) -> Option<PathBuf> {
    if !models_dir.is_dir() {
        return None;
    }
    let pattern = format!(
        "{}/**/*.gguf",
        glob::Pattern::escape(&models_dir.to_string_lossy())
    );
    let found: Vec<PathBuf> = glob::glob(&pattern)
        .ok()?
        .filter_map(Result::ok)
        .filter(|p| p.is_file())
        .collect();

    let quant = quantization.to_lowercase();
    found
        .iter()
        .find(|p| {
            p.file_name()
                .map(|n| n.to_string_lossy().to_lowercase().contains(&quant))
                .unwrap_or(false)
        })
        .or_else(|| found.first())
        .cloned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_find_model_prefers_quantization_match() {
        let temp = TempDir::new().unwrap();
        let dir = temp.path().join("models").join("Falcon3-7B-Instruct-1.58bit");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("ggml-model-f32.gguf"), b"f32").unwrap();
        std::fs::write(dir.join("ggml-model-i2_s.gguf"), b"i2s").unwrap();

        let found = find_model_file(&temp.path().join("models"), "i2_s").unwrap();
        assert_eq!(found.file_name().unwrap(), "ggml-model-i2_s.gguf");
    }

    #[test]
    fn test_find_model_without_models_dir() {
        let temp = TempDir::new().unwrap();
        assert!(find_model_file(&temp.path().join("models"), "i2_s").is_none());
    }
}
