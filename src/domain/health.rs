//! Backend health contract and the report derived from polling it.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Decoded body of `GET /api/health`.
///
/// Only the fields the provisioner needs are modelled; unknown fields
/// (system info, counters) are ignored.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct HealthResponse {
    pub status: String,

    #[serde(default)]
    pub database: DatabaseStatus,

    #[serde(default)]
    pub models: BTreeMap<String, ModelStatus>,
}

impl HealthResponse {
    pub fn is_ok(&self) -> bool {
        self.status == "ok"
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct DatabaseStatus {
    #[serde(default)]
    pub connected: bool,
}

/// Per-model flags. In-process models report `loaded` instead of `running`.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ModelStatus {
    #[serde(default)]
    pub installed: bool,

    #[serde(default, alias = "loaded")]
    pub running: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverallStatus {
    Ok,
    Degraded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComponentStatus {
    pub installed: bool,
    pub running: bool,
}

/// Outcome of a health polling cycle
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthReport {
    pub overall_status: OverallStatus,

    /// Number of probes performed
    pub attempts: u32,

    /// `None` when no response was ever decoded
    pub database_connected: Option<bool>,

    pub components: BTreeMap<String, ComponentStatus>,
}

impl HealthReport {
    /// Build a report from the last decoded response (if any)
    pub fn from_response(
        overall_status: OverallStatus,
        attempts: u32,
        response: Option<&HealthResponse>,
    ) -> Self {
        let components = response
            .map(|r| {
                r.models
                    .iter()
                    .map(|(name, m)| {
                        (
                            name.clone(),
                            ComponentStatus {
                                installed: m.installed,
                                running: m.running,
                            },
                        )
                    })
                    .collect()
            })
            .unwrap_or_default();

        Self {
            overall_status,
            attempts,
            database_connected: response.map(|r| r.database.connected),
            components,
        }
    }

    pub fn is_ok(&self) -> bool {
        self.overall_status == OverallStatus::Ok
    }
}
