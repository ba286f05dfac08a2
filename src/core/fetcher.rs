//! Artifact fetcher with ordered transport fallback.
//!
//! Transports are tried in declared order; the first success wins and
//! earlier failures are only logged. The finished artifact is sized from
//! the filesystem, not from transport accounting.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{debug, info, instrument, warn};

use crate::adapters::transport::Transport;
use crate::domain::{DownloadTransfer, ProvisionError};

/// Downloads remote artifacts through a primary and fallback transport
#[derive(Clone)]
pub struct ArtifactFetcher {
    transports: Vec<Arc<dyn Transport>>,
}

impl ArtifactFetcher {
    pub fn new(transports: Vec<Arc<dyn Transport>>) -> Self {
        Self { transports }
    }

    /// Fetch `uri` into `dest`, falling back through the transport list.
    #[instrument(skip(self), fields(label = %label))]
    pub async fn download(&self, uri: &str, dest: &Path, label: &str) -> Result<DownloadTransfer> {
        let mut failures = Vec::new();

        for transport in &self.transports {
            debug!(transport = transport.name(), "Trying transport");

            let attempt = match transport.fetch(uri, dest).await {
                Ok(()) => verify_artifact(dest).await,
                Err(e) => Err(e),
            };

            match attempt {
                Ok(bytes) => {
                    let transfer = DownloadTransfer {
                        source_uri: uri.to_string(),
                        destination_path: dest.to_path_buf(),
                        label: label.to_string(),
                        bytes_transferred: bytes,
                        transport: transport.name().to_string(),
                    };
                    info!(
                        transport = transport.name(),
                        megabytes = transfer.megabytes(),
                        "Download complete"
                    );
                    return Ok(transfer);
                }
                Err(e) => {
                    warn!(transport = transport.name(), error = %format!("{:#}", e), "Transport failed");
                    failures.push(format!("{}: {:#}", transport.name(), e));
                }
            }
        }

        Err(ProvisionError::Download {
            uri: uri.to_string(),
            failures: if failures.is_empty() {
                "no transports configured".to_string()
            } else {
                failures.join("; ")
            },
        }
        .into())
    }

    /// Download unless `dest` already holds a non-empty file
    pub async fn download_if_missing(
        &self,
        uri: &str,
        dest: &Path,
        label: &str,
    ) -> Result<DownloadTransfer> {
        if let Ok(meta) = tokio::fs::metadata(dest).await {
            if meta.is_file() && meta.len() > 0 {
                debug!(dest = %dest.display(), "Artifact already present");
                return Ok(DownloadTransfer {
                    source_uri: uri.to_string(),
                    destination_path: dest.to_path_buf(),
                    label: label.to_string(),
                    bytes_transferred: meta.len(),
                    transport: String::new(),
                });
            }
        }
        self.download(uri, dest, label).await
    }
}

/// Size of a freshly written artifact; missing or empty is a failure
async fn verify_artifact(dest: &Path) -> Result<u64> {
    let meta = tokio::fs::metadata(dest)
        .await
        .with_context(|| format!("Transport reported success but {} is missing", dest.display()))?;
    if meta.len() == 0 {
        let _ = tokio::fs::remove_file(dest).await;
        anyhow::bail!("Downloaded file {} is empty", dest.display());
    }
    Ok(meta.len())
}

/// Unpack a `.zip` or `.tar.gz` archive into `dest_dir`
pub fn extract_archive(archive: &Path, dest_dir: &Path) -> Result<()> {
    let name = archive
        .file_name()
        .map(|n| n.to_string_lossy().to_lowercase())
        .unwrap_or_default();

    std::fs::create_dir_all(dest_dir)
        .with_context(|| format!("Failed to create {}", dest_dir.display()))?;
    let file = File::open(archive)
        .with_context(|| format!("Failed to open archive {}", archive.display()))?;

    if name.ends_with(".zip") {
        extract_zip(file, dest_dir)
    } else if name.ends_with(".tar.gz") || name.ends_with(".tgz") {
        let mut tarball = tar::Archive::new(flate2::read::GzDecoder::new(file));
        tarball
            .unpack(dest_dir)
            .with_context(|| format!("Failed to extract {}", archive.display()))
    } else {
        anyhow::bail!("Unsupported archive format: {}", archive.display())
    }
}

fn extract_zip(file: File, dest_dir: &Path) -> Result<()> {
    let mut archive = zip::ZipArchive::new(file).context("Failed to read zip archive")?;

    for i in 0..archive.len() {
        let mut entry = archive
            .by_index(i)
            .with_context(|| format!("Failed to read zip entry {}", i))?;

        let outpath: PathBuf = match entry.enclosed_name() {
            Some(path) => dest_dir.join(path),
            None => continue,
        };

        if entry.is_dir() {
            std::fs::create_dir_all(&outpath)
                .with_context(|| format!("Failed to create {}", outpath.display()))?;
            continue;
        }

        if let Some(parent) = outpath.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let mut outfile = File::create(&outpath)
            .with_context(|| format!("Failed to create {}", outpath.display()))?;
        std::io::copy(&mut entry, &mut outfile)
            .with_context(|| format!("Failed to write {}", outpath.display()))?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    #[test]
    fn test_extract_tar_gz() {
        let temp = TempDir::new().unwrap();
        let archive_path = temp.path().join("caddy_2.8.4_linux_amd64.tar.gz");

        {
            let file = File::create(&archive_path).unwrap();
            let encoder = flate2::write::GzEncoder::new(file, flate2::Compression::default());
            let mut builder = tar::Builder::new(encoder);
            let body = b"#!/bin/sh\necho caddy\n";
            let mut header = tar::Header::new_gnu();
            header.set_size(body.len() as u64);
            header.set_mode(0o755);
            header.set_cksum();
            builder.append_data(&mut header, "caddy", &body[..]).unwrap();
            builder.into_inner().unwrap().finish().unwrap();
        }

        let out = temp.path().join("out");
        extract_archive(&archive_path, &out).unwrap();
        assert!(out.join("caddy").is_file());
    }

    #[test]
    fn test_extract_zip() {
        let temp = TempDir::new().unwrap();
        let archive_path = temp.path().join("caddy_2.8.4_windows_amd64.zip");

        {
            let file = File::create(&archive_path).unwrap();
            let mut writer = zip::ZipWriter::new(file);
            writer
                .start_file("caddy.exe", zip::write::SimpleFileOptions::default())
                .unwrap();
            writer.write_all(b"MZ").unwrap();
            writer.finish().unwrap();
        }

        let out = temp.path().join("out");
        extract_archive(&archive_path, &out).unwrap();
        assert_eq!(std::fs::read(out.join("caddy.exe")).unwrap(), b"MZ");
    }

    #[test]
    fn test_unknown_archive_rejected() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("caddy.rar");
        std::fs::write(&path, b"x").unwrap();
        assert!(extract_archive(&path, temp.path()).is_err());
    }
}
