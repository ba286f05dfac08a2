//! Transfer mechanisms for remote artifacts.
//!
//! The platform's managed transfer tool (BITS on Windows, curl elsewhere)
//! is tried first; a direct streaming HTTP client is the fallback. The
//! ordering lives in `core::fetcher`; each transport only knows how to
//! write one URI to one path. Nothing appears at the final path until the
//! transfer has finished.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::StreamExt;
use tokio::io::AsyncWriteExt;
use tracing::debug;

use crate::core::progress::ProgressReporter;
use crate::domain::Platform;

use super::process::{CommandRunner, Invocation};

/// Writes the resource at `uri` to `dest`
#[async_trait]
pub trait Transport: Send + Sync {
    fn name(&self) -> &str;

    async fn fetch(&self, uri: &str, dest: &Path) -> Result<()>;
}

/// Ordered transports for `platform`: managed first, direct HTTP last
pub fn for_platform(
    platform: Platform,
    runner: Arc<dyn CommandRunner>,
    reporter: ProgressReporter,
) -> Vec<Arc<dyn Transport>> {
    let managed: Arc<dyn Transport> = match platform {
        Platform::Windows => Arc::new(BitsTransport::new(runner, reporter.clone())),
        Platform::Linux | Platform::MacOs => Arc::new(CurlTransport::new(runner, reporter.clone())),
    };
    vec![managed, Arc::new(HttpTransport::new(reporter))]
}

fn label_for(dest: &Path) -> String {
    dest.file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| dest.display().to_string())
}

/// Sibling file a managed tool writes into before the rename
pub fn partial_path(dest: &Path) -> PathBuf {
    let mut name = dest.file_name().map(OsString::from).unwrap_or_default();
    name.push(".part");
    dest.with_file_name(name)
}

/// Run a transfer tool that writes to `partial_path(dest)`, then move the
/// finished file into place
async fn run_managed(
    runner: &dyn CommandRunner,
    reporter: &ProgressReporter,
    inv: Invocation,
    dest: &Path,
) -> Result<()> {
    if let Some(parent) = dest.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    let partial = partial_path(dest);
    // Left over from an interrupted run
    let _ = tokio::fs::remove_file(&partial).await;

    let label = format!("Downloading {}", label_for(dest));
    let output = reporter.await_process(&label, runner.run(&inv)).await?;
    if !output.success() {
        let _ = tokio::fs::remove_file(&partial).await;
        anyhow::bail!(
            "{} exited with code {}: {}",
            inv.program,
            output.exit_code,
            output.last_line().unwrap_or("no output")
        );
    }

    tokio::fs::rename(&partial, dest)
        .await
        .with_context(|| format!("Failed to move download into {}", dest.display()))?;
    Ok(())
}

/// Background Intelligent Transfer Service, via PowerShell
pub struct BitsTransport {
    runner: Arc<dyn CommandRunner>,
    reporter: ProgressReporter,
}

impl BitsTransport {
    pub fn new(runner: Arc<dyn CommandRunner>, reporter: ProgressReporter) -> Self {
        Self { runner, reporter }
    }
}

fn powershell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

#[async_trait]
impl Transport for BitsTransport {
    fn name(&self) -> &str {
        "bits"
    }

    async fn fetch(&self, uri: &str, dest: &Path) -> Result<()> {
        let script = format!(
            "$ErrorActionPreference = 'Stop'; Start-BitsTransfer -Source {} -Destination {} -Priority Foreground",
            powershell_quote(uri),
            powershell_quote(&partial_path(dest).to_string_lossy())
        );
        let inv = Invocation::new("powershell").args([
            "-NoProfile",
            "-NonInteractive",
            "-ExecutionPolicy",
            "Bypass",
            "-Command",
            script.as_str(),
        ]);
        run_managed(self.runner.as_ref(), &self.reporter, inv, dest).await
    }
}

/// curl with redirects and retries
pub struct CurlTransport {
    runner: Arc<dyn CommandRunner>,
    reporter: ProgressReporter,
}

impl CurlTransport {
    pub fn new(runner: Arc<dyn CommandRunner>, reporter: ProgressReporter) -> Self {
        Self { runner, reporter }
    }
}

#[async_trait]
impl Transport for CurlTransport {
    fn name(&self) -> &str {
        "curl"
    }

    async fn fetch(&self, uri: &str, dest: &Path) -> Result<()> {
        if self.runner.resolve("curl").is_none() {
            anyhow::bail!("curl is not installed");
        }
        let inv = Invocation::new("curl")
            .args([
                "--fail",
                "--location",
                "--silent",
                "--show-error",
                "--retry",
                "3",
                "--output",
            ])
            .arg(partial_path(dest).to_string_lossy())
            .arg(uri);
        run_managed(self.runner.as_ref(), &self.reporter, inv, dest).await
    }
}

/// Direct streaming HTTP download.
///
/// Streams into a temp file beside the destination and renames it into
/// place, so an interrupted transfer never leaves a partial artifact at
/// the final path.
pub struct HttpTransport {
    client: reqwest::Client,
    reporter: ProgressReporter,
}

impl HttpTransport {
    pub fn new(reporter: ProgressReporter) -> Self {
        let client = reqwest::Client::builder()
            .user_agent(concat!("fractionate-setup/", env!("CARGO_PKG_VERSION")))
            .build()
            .unwrap_or_default();
        Self { client, reporter }
    }
}

#[async_trait]
impl Transport for HttpTransport {
    fn name(&self) -> &str {
        "http"
    }

    async fn fetch(&self, uri: &str, dest: &Path) -> Result<()> {
        let parent = dest
            .parent()
            .with_context(|| format!("Destination has no parent: {}", dest.display()))?;
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("Failed to create {}", parent.display()))?;

        let response = self
            .client
            .get(uri)
            .send()
            .await
            .with_context(|| format!("Request to {} failed", uri))?
            .error_for_status()
            .with_context(|| format!("Server rejected download of {}", uri))?;

        let total = response.content_length();
        debug!(uri, ?total, "Streaming download");

        let temp = tempfile::NamedTempFile::new_in(parent)
            .with_context(|| format!("Failed to create temp file in {}", parent.display()))?;
        let (std_file, temp_path) = temp.into_parts();
        let mut file = tokio::fs::File::from_std(std_file);

        let bar = self.reporter.transfer_bar(&label_for(dest), total);
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.with_context(|| format!("Download of {} interrupted", uri))?;
            file.write_all(&chunk)
                .await
                .context("Failed to write download chunk")?;
            bar.inc(chunk.len() as u64);
        }
        bar.finish_and_clear();

        file.flush().await.context("Failed to flush download")?;
        file.sync_all().await.context("Failed to sync download")?;
        drop(file);

        temp_path
            .persist(dest)
            .with_context(|| format!("Failed to move download into {}", dest.display()))?;
        Ok(())
    }
}
