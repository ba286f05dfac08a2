//! Background task scheduler.
//!
//! Long operations (model downloads, the engine build) run as tokio tasks
//! alongside the pipeline and are joined at a later step. State is tracked
//! for display only; `join` awaits the task handle itself.

use std::future::Future;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::domain::TaskState;

use super::progress::ProgressReporter;

/// Handle to spawned work. Consumed by `Scheduler::join`.
pub struct BackgroundTask<T> {
    label: String,
    started_at: Instant,
    state: Arc<Mutex<TaskState>>,
    handle: JoinHandle<Result<T>>,
}

impl<T> std::fmt::Debug for BackgroundTask<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackgroundTask")
            .field("label", &self.label)
            .field("state", &self.state())
            .finish()
    }
}

impl<T> BackgroundTask<T> {
    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn started_at(&self) -> Instant {
        self.started_at
    }

    /// Snapshot of the display state
    pub fn state(&self) -> TaskState {
        self.state
            .lock()
            .map(|s| s.clone())
            .unwrap_or(TaskState::Running)
    }

    /// Whether the work has returned (or panicked)
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Await the task. A panic is reported as an error, like any failure.
    pub(crate) async fn wait(self) -> Result<T> {
        match self.handle.await {
            Ok(result) => result,
            Err(join_error) if join_error.is_panic() => {
                set_state(
                    &self.state,
                    TaskState::Failed {
                        error: "task panicked".to_string(),
                    },
                );
                anyhow::bail!("Background task '{}' panicked", self.label)
            }
            Err(join_error) => {
                anyhow::bail!("Background task '{}' was cancelled: {}", self.label, join_error)
            }
        }
    }
}

fn set_state(state: &Mutex<TaskState>, next: TaskState) {
    if let Ok(mut guard) = state.lock() {
        *guard = next;
    }
}

/// Spawns and joins background tasks. There is no cap on concurrent tasks.
#[derive(Clone)]
pub struct Scheduler {
    reporter: ProgressReporter,
}

impl Scheduler {
    pub fn new(reporter: ProgressReporter) -> Self {
        Self { reporter }
    }

    /// Start `work` on the runtime. The task is `Pending` until first polled.
    pub fn spawn<F, T>(&self, label: impl Into<String>, work: F) -> BackgroundTask<T>
    where
        F: Future<Output = Result<T>> + Send + 'static,
        T: Send + 'static,
    {
        let label = label.into();
        let state = Arc::new(Mutex::new(TaskState::Pending));

        let task_state = Arc::clone(&state);
        let task_label = label.clone();
        let handle = tokio::spawn(async move {
            set_state(&task_state, TaskState::Running);
            debug!(task = %task_label, "Background task running");

            let result = work.await;
            match &result {
                Ok(_) => set_state(&task_state, TaskState::Completed),
                Err(e) => {
                    warn!(task = %task_label, error = %format!("{:#}", e), "Background task failed");
                    set_state(
                        &task_state,
                        TaskState::Failed {
                            error: format!("{:#}", e),
                        },
                    );
                }
            }
            result
        });

        self.reporter.info(format!("Started in background: {}", label));
        BackgroundTask {
            label,
            started_at: Instant::now(),
            state,
            handle,
        }
    }

    /// Rendezvous with a task, taking ownership of its result.
    ///
    /// The task's own error is returned with the task label attached.
    pub async fn join<T: Send + 'static>(&self, task: BackgroundTask<T>) -> Result<T> {
        let label = task.label().to_string();
        self.reporter
            .await_task(task)
            .await
            .with_context(|| format!("Background task '{}' failed", label))
    }
}
