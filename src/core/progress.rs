//! Terminal progress reporting.
//!
//! Spinners for awaited processes and background tasks, plus the
//! info/ok/warn/error status lines every step prints. Everything printed
//! here is mirrored into the run log through `tracing`. The reporter only
//! observes: it hands back the awaited result untouched.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
#[cfg(test)]
use std::sync::Mutex;
use std::time::Duration;

use anyhow::Result;
use colored::Colorize;
use indicatif::{MultiProgress, ProgressBar, ProgressDrawTarget, ProgressStyle};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{error, info, warn};

use crate::domain::ProvisioningStep;

use super::scheduler::BackgroundTask;

/// Redraw interval while waiting on an external process
pub const PROCESS_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Redraw interval while waiting on a background task
pub const TASK_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Four rotating glyphs; indicatif shows the last entry once finished
const SPINNER_GLYPHS: &[&str] = &["|", "/", "-", "\\", " "];

/// `Ns` under a minute, `Mm Ss` from then on
pub fn format_elapsed(elapsed: Duration) -> String {
    let secs = elapsed.as_secs();
    if secs < 60 {
        format!("{}s", secs)
    } else {
        format!("{}m {}s", secs / 60, secs % 60)
    }
}

/// Spinner and status-line renderer shared by every component
#[derive(Clone)]
pub struct ProgressReporter {
    multi: MultiProgress,
    frames: Arc<AtomicU64>,
    quiet: bool,

    /// Every emitted line, kept for assertions
    #[cfg(test)]
    transcript: Option<Arc<Mutex<Vec<String>>>>,
}

impl Default for ProgressReporter {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressReporter {
    /// Reporter drawing to stderr
    pub fn new() -> Self {
        Self {
            multi: MultiProgress::with_draw_target(ProgressDrawTarget::stderr()),
            frames: Arc::new(AtomicU64::new(0)),
            quiet: false,
            #[cfg(test)]
            transcript: None,
        }
    }

    /// Reporter that draws nothing (tests, `--quiet`); frames are still counted
    pub fn hidden() -> Self {
        Self {
            multi: MultiProgress::with_draw_target(ProgressDrawTarget::hidden()),
            frames: Arc::new(AtomicU64::new(0)),
            quiet: true,
            #[cfg(test)]
            transcript: None,
        }
    }

    /// Hidden reporter that keeps what it would have printed
    #[cfg(test)]
    pub(crate) fn recording() -> Self {
        Self {
            transcript: Some(Arc::new(Mutex::new(Vec::new()))),
            ..Self::hidden()
        }
    }

    #[cfg(test)]
    pub(crate) fn lines(&self) -> Vec<String> {
        self.transcript
            .as_ref()
            .map(|t| t.lock().unwrap().clone())
            .unwrap_or_default()
    }

    /// Spinner frames drawn so far across all waits
    pub fn frames_drawn(&self) -> u64 {
        self.frames.load(Ordering::Relaxed)
    }

    /// Print a raw line above any active spinner
    pub fn println(&self, line: impl AsRef<str>) {
        self.emit(line.as_ref());
    }

    fn emit(&self, line: &str) {
        #[cfg(test)]
        {
            if let Some(transcript) = &self.transcript {
                transcript.lock().unwrap().push(line.to_string());
            }
        }
        if self.quiet {
            return;
        }
        // A hidden target (stderr not a tty) would swallow println
        if self.multi.is_hidden() {
            eprintln!("{}", line);
        } else {
            let _ = self.multi.println(line);
        }
    }

    /// Header line for a pipeline step
    pub fn step(&self, step: &ProvisioningStep) {
        self.emit("");
        self.emit(&step.to_string().bold().to_string());
        info!(
            step = step.index,
            total = step.total_steps,
            "{}",
            step.description()
        );
    }

    pub fn info(&self, message: impl AsRef<str>) {
        let message = message.as_ref();
        self.emit(&format!("  {} {}", "•".bright_black(), message));
        info!("{}", message);
    }

    pub fn ok(&self, message: impl AsRef<str>) {
        let message = message.as_ref();
        self.emit(&format!("  {} {}", "✓".green(), message));
        info!("{}", message);
    }

    pub fn warn(&self, message: impl AsRef<str>) {
        let message = message.as_ref();
        self.emit(&format!("  {} {}", "!".yellow(), message.yellow()));
        warn!("{}", message);
    }

    pub fn error(&self, message: impl AsRef<str>) {
        let message = message.as_ref();
        self.emit(&format!("  {} {}", "✗".red(), message.red()));
        error!("{}", message);
    }

    /// Wait for an external process with a 250ms spinner
    pub async fn await_process<F, T>(&self, label: &str, work: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        self.spin(label, Instant::now(), PROCESS_POLL_INTERVAL, work)
            .await
    }

    /// Wait for a background task with a 500ms spinner.
    ///
    /// A task that already finished is collected without entering the
    /// spinner loop, so no frame is drawn for it.
    pub async fn await_task<T>(&self, task: BackgroundTask<T>) -> Result<T>
    where
        T: Send + 'static,
    {
        let label = task.label().to_string();
        let started = task.started_at();

        if task.is_finished() {
            let result = task.wait().await;
            self.complete(&label, started.elapsed(), result.is_ok());
            return result;
        }

        self.spin(&label, started, TASK_POLL_INTERVAL, task.wait())
            .await
    }

    /// Byte-counting bar for HTTP transfers
    pub fn transfer_bar(&self, label: &str, total: Option<u64>) -> ProgressBar {
        let bar = match total {
            Some(len) => {
                let bar = ProgressBar::new(len);
                bar.set_style(
                    ProgressStyle::with_template(
                        "  {spinner:.cyan} {msg} [{bar:30.cyan/blue}] {bytes}/{total_bytes} ({eta})",
                    )
                    .unwrap_or_else(|_| ProgressStyle::default_bar())
                    .progress_chars("=>-"),
                );
                bar
            }
            None => {
                let bar = ProgressBar::new_spinner();
                bar.set_style(
                    ProgressStyle::with_template("  {spinner:.cyan} {msg} {bytes}")
                        .unwrap_or_else(|_| ProgressStyle::default_spinner())
                        .tick_strings(SPINNER_GLYPHS),
                );
                bar
            }
        };
        bar.set_message(label.to_string());
        self.multi.add(bar)
    }

    async fn spin<F, T>(
        &self,
        label: &str,
        started: Instant,
        interval: Duration,
        work: F,
    ) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        let bar = self.spinner(label);
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        tokio::pin!(work);

        let result = loop {
            tokio::select! {
                biased;
                result = &mut work => break result,
                _ = ticker.tick() => {
                    self.frames.fetch_add(1, Ordering::Relaxed);
                    bar.set_message(format!("{} ({})", label, format_elapsed(started.elapsed())));
                    bar.tick();
                }
            }
        };

        bar.finish_and_clear();
        self.complete(label, started.elapsed(), result.is_ok());
        result
    }

    fn spinner(&self, label: &str) -> ProgressBar {
        let bar = ProgressBar::new_spinner();
        bar.set_style(
            ProgressStyle::with_template("  {spinner:.cyan} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner())
                .tick_strings(SPINNER_GLYPHS),
        );
        bar.set_message(label.to_string());
        self.multi.add(bar)
    }

    fn complete(&self, label: &str, elapsed: Duration, succeeded: bool) {
        let glyph = if succeeded {
            "✓".green()
        } else {
            "✗".red()
        };
        self.emit(&format!("  {} {} ({})", glyph, label, format_elapsed(elapsed)));
        info!(label, elapsed_secs = elapsed.as_secs(), succeeded, "Wait finished");
    }
}
