//! Domain types for the provisioner.
//!
//! This module contains the core data structures:
//! - Steps: the ordered provisioning pipeline
//! - Tools: external dependencies and presence results
//! - Build: inference engine target and output verification
//! - Services: endpoints, launch specs, process handles
//! - Health: backend health contract and reports

pub mod build;
pub mod error;
pub mod health;
pub mod platform;
pub mod service;
pub mod settings;
pub mod step;
pub mod task;
pub mod tool;
pub mod transfer;

// Re-export commonly used types
pub use build::{locate_output, probe_candidates, BuildOutcome, BuildTarget, CompilerSelection, Located};
pub use error::ProvisionError;
pub use health::{ComponentStatus, HealthReport, HealthResponse, OverallStatus};
pub use platform::Platform;
pub use service::{LaunchOutcome, ProcessHandle, ServiceEndpoint, ServiceSpec};
pub use settings::{AppConfig, ProxySettings};
pub use step::{ProvisioningStep, StepKind};
pub use task::TaskState;
pub use tool::{InstalledTool, Presence, ToolVersion};
pub use transfer::DownloadTransfer;
