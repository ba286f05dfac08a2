//! Long-running local services and their retained process handles.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A network endpoint exposed by a local service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceEndpoint {
    pub name: String,
    pub bind_address: String,
    pub port: u16,
    #[serde(default)]
    pub health_path: Option<String>,
}

impl ServiceEndpoint {
    pub fn new(name: impl Into<String>, bind_address: impl Into<String>, port: u16) -> Self {
        Self {
            name: name.into(),
            bind_address: bind_address.into(),
            port,
            health_path: None,
        }
    }

    pub fn with_health_path(mut self, path: impl Into<String>) -> Self {
        self.health_path = Some(path.into());
        self
    }

    /// `host:port`
    pub fn authority(&self) -> String {
        format!("{}:{}", self.bind_address, self.port)
    }

    /// `http://host:port`
    pub fn base_url(&self) -> String {
        format!("http://{}", self.authority())
    }

    /// Full health URL, if this endpoint has one
    pub fn health_url(&self) -> Option<String> {
        self.health_path
            .as_ref()
            .map(|path| format!("{}{}", self.base_url(), path))
    }
}

/// How to launch and recognise a service process
#[derive(Debug, Clone)]
pub struct ServiceSpec {
    pub endpoint: ServiceEndpoint,

    /// Executable name to look for in the process table (without `.exe`)
    pub process_name: String,

    /// Required substring of the command line, to tell apart e.g. two pythons
    pub cmdline_marker: Option<String>,

    pub program: PathBuf,
    pub args: Vec<String>,
    pub working_dir: PathBuf,
    pub env: Vec<(String, String)>,

    /// stdout/stderr are appended here
    pub log_path: PathBuf,
}

/// Identity of a launched process: pid plus start time, so a recycled pid
/// is never mistaken for our service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessHandle {
    pub pid: u32,

    /// Process start time in seconds since the epoch, as the OS reports it
    pub start_time: u64,

    pub recorded_at: DateTime<Utc>,
}

impl ProcessHandle {
    pub fn new(pid: u32, start_time: u64) -> Self {
        Self {
            pid,
            start_time,
            recorded_at: Utc::now(),
        }
    }
}

/// Result of `ensure_running`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LaunchOutcome {
    AlreadyRunning(ProcessHandle),
    Started(ProcessHandle),
}

impl LaunchOutcome {
    pub fn handle(&self) -> &ProcessHandle {
        match self {
            Self::AlreadyRunning(h) | Self::Started(h) => h,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_health_url() {
        let endpoint = ServiceEndpoint::new("proxy", "127.0.0.1", 8080).with_health_path("/api/health");
        assert_eq!(endpoint.base_url(), "http://127.0.0.1:8080");
        assert_eq!(
            endpoint.health_url().as_deref(),
            Some("http://127.0.0.1:8080/api/health")
        );

        let backend = ServiceEndpoint::new("backend", "127.0.0.1", 8000);
        assert!(backend.health_url().is_none());
    }

    #[test]
    fn test_handle_roundtrips_through_json() {
        let handle = ProcessHandle::new(4242, 1_700_000_000);
        let json = serde_json::to_string(&handle).unwrap();
        let parsed: ProcessHandle = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, handle);
    }
}
