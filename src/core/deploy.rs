//! Files the provisioner lays down for the services.
//!
//! Everything here is idempotent: generated files are rewritten only when
//! their content differs, the backend config is written once and then left
//! to the operator, and deployed sources are copied only when their hash
//! changed.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use crate::domain::{AppConfig, ProxySettings};

use super::fetcher::{extract_archive, ArtifactFetcher};

/// Caddy v2 configuration for the loopback reverse proxy.
///
/// `/health*` and `/api/*` go to the backend with CORS headers for the one
/// allowed origin; preflights get an empty 204; anything else is a 404.
pub fn render_caddyfile(settings: &ProxySettings) -> String {
    let backend = format!("{}:{}", settings.backend_address, settings.backend_port);
    let origin = &settings.allowed_origin;

    format!(
        r#"# Generated by fractionate-setup. Local changes are overwritten.
{{
	admin off
	auto_https off
}}

http://{listen_address}:{listen_port} {{
	bind {listen_address}

	@preflight method OPTIONS
	handle @preflight {{
		header Access-Control-Allow-Origin "{origin}"
		header Access-Control-Allow-Methods "GET, POST, PUT, DELETE, OPTIONS"
		header Access-Control-Allow-Headers "Content-Type, Authorization"
		header Access-Control-Max-Age "86400"
		respond "" 204
	}}

	@backend path /health* /api/*
	handle @backend {{
		header Access-Control-Allow-Origin "{origin}"
		header Access-Control-Allow-Methods "GET, POST, PUT, DELETE, OPTIONS"
		header Access-Control-Allow-Headers "Content-Type, Authorization"
		reverse_proxy {backend} {{
			flush_interval -1
		}}
	}}

	handle {{
		respond "Not Found" 404
	}}
}}
"#,
        listen_address = settings.listen_address,
        listen_port = settings.listen_port,
        origin = origin,
        backend = backend,
    )
}

/// Atomically replace `path` with `content` unless it already matches.
/// Returns whether the file was written.
pub fn write_if_changed(path: &Path, content: &str) -> Result<bool> {
    if let Ok(existing) = std::fs::read_to_string(path) {
        if existing == content {
            debug!(path = %path.display(), "Unchanged");
            return Ok(false);
        }
    }

    let parent = path
        .parent()
        .with_context(|| format!("No parent directory for {}", path.display()))?;
    std::fs::create_dir_all(parent)
        .with_context(|| format!("Failed to create {}", parent.display()))?;

    let mut temp = tempfile::NamedTempFile::new_in(parent)
        .with_context(|| format!("Failed to create temp file in {}", parent.display()))?;
    std::io::Write::write_all(&mut temp, content.as_bytes())
        .with_context(|| format!("Failed to write {}", path.display()))?;
    temp.persist(path)
        .with_context(|| format!("Failed to replace {}", path.display()))?;

    info!(path = %path.display(), "Written");
    Ok(true)
}

/// Write the backend config if none exists. Never overwrites.
pub fn write_app_config_once(path: &Path, config: &AppConfig) -> Result<bool> {
    if path.exists() {
        debug!(path = %path.display(), "Config exists, leaving it alone");
        return Ok(false);
    }
    let yaml = serde_yaml::to_string(config).context("Failed to serialize backend config")?;
    write_if_changed(path, &yaml)
}

/// Outcome of a source tree deployment
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeployStats {
    pub copied: usize,
    pub unchanged: usize,
}

/// Directories never deployed
const SKIPPED_DIRS: &[&str] = &["__pycache__", ".git", ".venv", "venv", "node_modules"];

/// Copy `source` into `dest` recursively, skipping files whose SHA-256
/// already matches.
pub fn deploy_tree(source: &Path, dest: &Path) -> Result<DeployStats> {
    if !source.is_dir() {
        anyhow::bail!("Backend source directory not found: {}", source.display());
    }

    let mut stats = DeployStats::default();
    copy_dir(source, dest, &mut stats)?;
    info!(
        copied = stats.copied,
        unchanged = stats.unchanged,
        dest = %dest.display(),
        "Deployed"
    );
    Ok(stats)
}

fn copy_dir(source: &Path, dest: &Path, stats: &mut DeployStats) -> Result<()> {
    std::fs::create_dir_all(dest).with_context(|| format!("Failed to create {}", dest.display()))?;

    let entries = std::fs::read_dir(source)
        .with_context(|| format!("Failed to read {}", source.display()))?;
    for entry in entries {
        let entry = entry.context("Failed to read directory entry")?;
        let name = entry.file_name();
        let from = entry.path();
        let to = dest.join(&name);

        if from.is_dir() {
            if SKIPPED_DIRS.iter().any(|s| name == *s) {
                continue;
            }
            copy_dir(&from, &to, stats)?;
            continue;
        }

        if to.is_file() && file_sha256(&from)? == file_sha256(&to)? {
            stats.unchanged += 1;
            continue;
        }
        std::fs::copy(&from, &to)
            .with_context(|| format!("Failed to copy {} to {}", from.display(), to.display()))?;
        stats.copied += 1;
    }
    Ok(())
}

/// Hex SHA-256 of a file's content
pub fn file_sha256(path: &Path) -> Result<String> {
    let mut file =
        std::fs::File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
    let mut hasher = Sha256::new();
    std::io::copy(&mut file, &mut hasher)
        .with_context(|| format!("Failed to hash {}", path.display()))?;
    Ok(hex::encode(hasher.finalize()))
}

/// Hex SHA-256 of a string (requirement lists, generated content)
pub fn text_sha256(content: &str) -> String {
    hex::encode(Sha256::digest(content.as_bytes()))
}

/// Download and unpack the proxy release archive, leaving only the binary
/// in `bin_dir`. Skips everything if the binary already exists.
pub async fn install_proxy_binary(
    fetcher: &ArtifactFetcher,
    uri: &str,
    bin_dir: &Path,
    binary_name: &str,
) -> Result<(PathBuf, bool)> {
    let binary = bin_dir.join(binary_name);
    if binary.is_file() {
        return Ok((binary, false));
    }

    let archive_name = uri.rsplit('/').next().unwrap_or("proxy-archive");
    let archive = bin_dir.join(archive_name);
    fetcher
        .download_if_missing(uri, &archive, "Caddy")
        .await?;

    let staging = bin_dir.join(".extract");
    let extracted = {
        let archive = archive.clone();
        let staging = staging.clone();
        let name = binary_name.to_string();
        tokio::task::spawn_blocking(move || -> Result<PathBuf> {
            extract_archive(&archive, &staging)?;
            let found = staging.join(&name);
            if !found.is_file() {
                anyhow::bail!("{} not found in {}", name, archive.display());
            }
            Ok(found)
        })
        .await
        .context("Archive extraction panicked")
        .and_then(|result| result)
    };
    let extracted = match extracted {
        Ok(path) => path,
        Err(e) => {
            // A bad archive must not satisfy the next run's presence check
            let _ = std::fs::remove_dir_all(&staging);
            let _ = std::fs::remove_file(&archive);
            return Err(e);
        }
    };

    std::fs::rename(&extracted, &binary)
        .with_context(|| format!("Failed to move {} into place", binary.display()))?;
    make_executable(&binary)?;

    let _ = std::fs::remove_dir_all(&staging);
    let _ = std::fs::remove_file(&archive);
    Ok((binary, true))
}

#[cfg(unix)]
fn make_executable(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    let mut perms = std::fs::metadata(path)?.permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(path, perms)
        .with_context(|| format!("Failed to mark {} executable", path.display()))
}

#[cfg(not(unix))]
fn make_executable(_path: &Path) -> Result<()> {
    Ok(())
}
