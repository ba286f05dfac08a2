//! Documents the provisioner writes for the services it installs.
//!
//! `AppConfig` mirrors the YAML the backend reads at startup; field names
//! must stay in sync with it.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Backend configuration (`config.yaml`)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    /// Operating mode (`local` binds everything to loopback)
    pub mode: String,

    /// The one origin allowed through the proxy
    pub allowed_origin: String,

    pub models: ModelsConfig,
    pub database: DatabaseConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelsConfig {
    pub falcon3_7b: TextModelConfig,
    pub florence2: VisionModelConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextModelConfig {
    pub path: PathBuf,

    /// `auto` or a fixed thread count
    pub threads: String,

    pub context_size: u32,
    pub auto_start: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VisionModelConfig {
    pub path: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub path: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub path: PathBuf,
    pub level: String,
}

/// Inputs for the generated reverse-proxy configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxySettings {
    pub listen_address: String,
    pub listen_port: u16,
    pub backend_address: String,
    pub backend_port: u16,
    pub allowed_origin: String,
}
