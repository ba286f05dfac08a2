//! Core provisioning logic.
//!
//! This module contains:
//! - Pipeline: the ordered provisioning steps and the run lock
//! - Installer: check-then-install for external tools
//! - Build: the inference engine build state machine
//! - Fetcher: downloads with transport fallback
//! - Scheduler: background tasks joined later by the pipeline
//! - Services: detached launch and health polling
//! - Deploy: generated files and backend deployment
//! - Progress: terminal status lines and spinners

pub mod build;
pub mod deploy;
pub mod fetcher;
pub mod installer;
pub mod pipeline;
pub mod progress;
pub mod scheduler;
pub mod services;

// Re-export commonly used types
pub use build::BuildOrchestrator;
pub use deploy::{deploy_tree, render_caddyfile, write_app_config_once, write_if_changed, DeployStats};
pub use fetcher::{extract_archive, ArtifactFetcher};
pub use installer::{DependencyInstaller, EnsureOutcome};
pub use pipeline::{
    provision, run_pipeline, InstallOptions, PipelineContext, ProvisionSummary, Provisioner,
    ProvisionerAdapters, RunLock, StepExecutor,
};
pub use progress::{format_elapsed, ProgressReporter};
pub use scheduler::{BackgroundTask, Scheduler};
pub use services::{HealthMonitor, HealthProbe, HttpHealthProbe, ServiceControl, ServiceLauncher};
