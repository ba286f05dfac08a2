//! Provisioning pipeline steps.

use std::fmt;

use serde::{Deserialize, Serialize};

/// The ten provisioning steps, in execution order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    AdminCheck,
    Prerequisites,
    Directories,
    VirtualEnv,
    SecondaryModelKickoff,
    PrimaryBuild,
    ProxyAndFiles,
    AwaitDownloads,
    ConfigureAutostart,
    LaunchServices,
}

impl StepKind {
    /// Declared order; the pipeline never reorders or skips entries
    pub const ALL: [StepKind; 10] = [
        StepKind::AdminCheck,
        StepKind::Prerequisites,
        StepKind::Directories,
        StepKind::VirtualEnv,
        StepKind::SecondaryModelKickoff,
        StepKind::PrimaryBuild,
        StepKind::ProxyAndFiles,
        StepKind::AwaitDownloads,
        StepKind::ConfigureAutostart,
        StepKind::LaunchServices,
    ];

    pub fn description(self) -> &'static str {
        match self {
            Self::AdminCheck => "Checking privileges",
            Self::Prerequisites => "Installing prerequisites",
            Self::Directories => "Creating directories",
            Self::VirtualEnv => "Preparing Python environment",
            Self::SecondaryModelKickoff => "Starting Florence-2 download",
            Self::PrimaryBuild => "Building BitNet and Falcon3 model",
            Self::ProxyAndFiles => "Installing proxy and backend files",
            Self::AwaitDownloads => "Waiting for downloads",
            Self::ConfigureAutostart => "Writing configuration and autostart entries",
            Self::LaunchServices => "Starting services",
        }
    }
}

/// One numbered step of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProvisioningStep {
    /// 1-based position
    pub index: usize,
    pub total_steps: usize,
    pub kind: StepKind,
}

impl ProvisioningStep {
    /// All steps with their ordinal positions
    pub fn sequence() -> Vec<ProvisioningStep> {
        let total_steps = StepKind::ALL.len();
        StepKind::ALL
            .iter()
            .enumerate()
            .map(|(i, &kind)| ProvisioningStep {
                index: i + 1,
                total_steps,
                kind,
            })
            .collect()
    }

    pub fn description(&self) -> &'static str {
        self.kind.description()
    }
}

impl fmt::Display for ProvisioningStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}/{}] {}",
            self.index,
            self.total_steps,
            self.description()
        )
    }
}
