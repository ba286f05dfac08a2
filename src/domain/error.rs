//! Error taxonomy for a provisioning run.
//!
//! Fatal failures are raised as `ProvisionError` and carried through
//! `anyhow` so callers can attach context; the top-level handler downcasts
//! to recover the failing step.

use std::path::PathBuf;

use thiserror::Error;

/// Fatal provisioning errors
#[derive(Debug, Error)]
pub enum ProvisionError {
    /// Missing privilege, package manager, or other precondition
    #[error("{message}\n  -> {remediation}")]
    Precondition {
        message: String,
        remediation: String,
    },

    /// Package manager failure or post-install verification failure
    #[error("Failed to install {tool}: {reason}")]
    DependencyInstall { tool: String, reason: String },

    /// No build output found after the primary or fallback path
    #[error("Build did not produce {output} (build log: {})", log.display())]
    Build { output: String, log: PathBuf },

    /// Every transport failed for a required artifact
    #[error("Download of {uri} failed on every transport: {failures}")]
    Download { uri: String, failures: String },

    /// Another provisioning run holds the lock
    #[error("Another provisioning run is in progress (lock: {})", path.display())]
    Locked { path: PathBuf },

    /// Context attached to any error escaping a pipeline step
    #[error("Step {index}/{total} '{name}' failed")]
    StepFailed {
        index: usize,
        total: usize,
        name: String,
    },
}

impl ProvisionError {
    /// Shorthand for a precondition failure
    pub fn precondition(message: impl Into<String>, remediation: impl Into<String>) -> Self {
        Self::Precondition {
            message: message.into(),
            remediation: remediation.into(),
        }
    }

    /// Shorthand for a dependency install failure
    pub fn install(tool: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::DependencyInstall {
            tool: tool.into(),
            reason: reason.into(),
        }
    }
}
