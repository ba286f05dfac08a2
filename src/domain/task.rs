//! Background task lifecycle.

use serde::{Deserialize, Serialize};

/// State of a background task, observed for display only
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "state")]
pub enum TaskState {
    /// Spawned but not yet polled by the runtime
    Pending,

    /// Work in progress
    Running,

    /// Finished successfully; the value is handed over at join
    Completed,

    /// Finished with an error
    Failed { error: String },
}

impl Default for TaskState {
    fn default() -> Self {
        Self::Pending
    }
}
