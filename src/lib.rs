//! fractionate-setup - workstation provisioner for Fractionate Edge
//!
//! Installs the toolchain, builds the BitNet inference engine, fetches the
//! models, deploys the backend behind a Caddy reverse proxy, registers
//! autostart entries and starts the services.
//!
//! # Architecture
//!
//! A single control flow runs ten ordered steps:
//! - Every step is idempotent, so a re-run repairs a partial install
//! - Long downloads run as background tasks joined before configuration
//! - External programs sit behind adapter traits for testing
//!
//! # Modules
//!
//! - `adapters`: External programs (process runner, package managers,
//!   transfer tools, autostart registries)
//! - `core`: Provisioning logic (pipeline, installer, build, services)
//! - `domain`: Data structures (steps, tools, build targets, health)
//! - `config`: Layered configuration and the home directory layout
//! - `cli`: Command-line interface
//!
//! # Usage
//!
//! ```bash
//! # Install or repair everything
//! fractionate-setup
//!
//! # Check the services
//! fractionate-setup status
//!
//! # Show resolved paths and sources
//! fractionate-setup config
//! ```

pub mod adapters;
pub mod cli;
pub mod config;
pub mod core;
pub mod domain;

// Re-export main types at crate root for convenience
pub use config::ResolvedConfig;
pub use core::{provision, InstallOptions, ProvisionSummary};
pub use domain::{HealthReport, ProvisionError, StepKind};
