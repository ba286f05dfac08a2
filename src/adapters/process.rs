//! External process execution.
//!
//! Every external program (package managers, git, cmake, python) runs
//! through a `CommandRunner`. stdout and stderr are merged into one stream
//! in the order lines arrive; what reaches the terminal depends on the
//! `OutputMode`. A non-zero exit code is reported, never raised: callers
//! decide what failure means. Text on stderr is never an error by itself.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::OnceLock;

use anyhow::{Context, Result};
use async_trait::async_trait;
use regex::Regex;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tracing::{debug, info};

use crate::core::progress::ProgressReporter;

/// What to show on the terminal while a process runs
#[derive(Debug, Clone)]
pub enum OutputMode {
    /// Show nothing
    Suppressed,

    /// Show every line, or only the lines the filter accepts
    Stream { filter: Option<LineFilter> },

    /// Show only the final non-empty line once the process exits
    LastLine,
}

/// Classifies build output lines worth showing.
///
/// Pure function over a fixed keyword set: progress counters, percentages,
/// and error/warning/download/compile keywords.
#[derive(Debug, Clone)]
pub struct LineFilter {
    pattern: Regex,
}

const BUILD_KEYWORDS: &str = r"(?i)\b(error|errors|warning|warnings|fail|failed|progress|download|downloading|downloaded|compiling|building|built|generating|linking|installing)\b|\d{1,3}%|\[\s*\d+\s*/\s*\d+\s*\]";

impl LineFilter {
    /// Filter with a custom pattern
    pub fn new(pattern: &str) -> Result<Self, regex::Error> {
        Ok(Self {
            pattern: Regex::new(pattern)?,
        })
    }

    /// Keyword filter for the engine's setup script and compiler output
    pub fn build_progress() -> Self {
        static PATTERN: OnceLock<Regex> = OnceLock::new();
        let pattern = PATTERN
            .get_or_init(|| Regex::new(BUILD_KEYWORDS).expect("build keyword pattern is valid"))
            .clone();
        Self { pattern }
    }

    /// Whether a line should reach the terminal
    pub fn show(&self, line: &str) -> bool {
        self.pattern.is_match(line)
    }
}

/// A command to run
#[derive(Debug, Clone)]
pub struct Invocation {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub env: Vec<(String, String)>,
    pub mode: OutputMode,
}

impl Invocation {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: None,
            env: Vec::new(),
            mode: OutputMode::Suppressed,
        }
    }

    /// Program given as a path
    pub fn path(program: &Path) -> Self {
        Self::new(program.to_string_lossy())
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn cwd(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn mode(mut self, mode: OutputMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn streamed(self, filter: Option<LineFilter>) -> Self {
        self.mode(OutputMode::Stream { filter })
    }

    pub fn last_line(self) -> Self {
        self.mode(OutputMode::LastLine)
    }

    /// Shell-like rendering for logs
    pub fn display(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .map(|part| {
                if part.contains(' ') {
                    format!("\"{}\"", part)
                } else {
                    part.to_string()
                }
            })
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Combined output and exit code of a finished process
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessOutput {
    /// stdout and stderr lines, interleaved as observed
    pub combined: String,

    /// `-1` when the process was terminated by a signal
    pub exit_code: i32,
}

impl ProcessOutput {
    pub fn new(combined: impl Into<String>, exit_code: i32) -> Self {
        Self {
            combined: combined.into(),
            exit_code,
        }
    }

    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Final non-empty line
    pub fn last_line(&self) -> Option<&str> {
        self.combined
            .lines()
            .rev()
            .map(str::trim)
            .find(|l| !l.is_empty())
    }
}

/// Runs external programs
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run to completion. Spawn failures are errors; non-zero exits are not.
    async fn run(&self, invocation: &Invocation) -> Result<ProcessOutput>;

    /// Resolve a program name on the search path
    fn resolve(&self, program: &str) -> Option<PathBuf> {
        which::which(program).ok()
    }

    /// Make `dir` visible to later lookups and child processes.
    /// Returns false if it was already on the path.
    fn append_search_path(&self, dir: &Path) -> bool {
        append_to_process_path(dir)
    }
}

/// Prepend `dir` to this process's `PATH` (inherited by every child)
pub fn append_to_process_path(dir: &Path) -> bool {
    let current = std::env::var_os("PATH").unwrap_or_default();
    let mut entries: Vec<PathBuf> = std::env::split_paths(&current).collect();
    if entries.iter().any(|e| e == dir) {
        return false;
    }
    entries.insert(0, dir.to_path_buf());

    match std::env::join_paths(entries) {
        Ok(joined) => {
            std::env::set_var("PATH", &joined);
            info!(dir = %dir.display(), "Added to search path");
            true
        }
        Err(e) => {
            debug!(dir = %dir.display(), error = %e, "Cannot add directory to PATH");
            false
        }
    }
}

/// Runner backed by real OS processes
pub struct SystemRunner {
    reporter: ProgressReporter,
}

impl SystemRunner {
    pub fn new(reporter: ProgressReporter) -> Self {
        Self { reporter }
    }

    fn emit(&self, mode: &OutputMode, line: &str) {
        if let OutputMode::Stream { filter } = mode {
            let shown = filter.as_ref().map_or(true, |f| f.show(line));
            if shown {
                self.reporter.println(format!("    {}", line));
            }
        }
    }
}

fn lossy_line(segment: Vec<u8>) -> String {
    let text = String::from_utf8_lossy(&segment);
    text.trim_end_matches('\r').to_string()
}

#[async_trait]
impl CommandRunner for SystemRunner {
    async fn run(&self, invocation: &Invocation) -> Result<ProcessOutput> {
        debug!(command = %invocation.display(), "Running");

        let mut cmd = Command::new(&invocation.program);
        cmd.args(&invocation.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(dir) = &invocation.cwd {
            cmd.current_dir(dir);
        }
        for (key, value) in &invocation.env {
            cmd.env(key, value);
        }

        let mut child = cmd
            .spawn()
            .with_context(|| format!("Failed to start '{}'", invocation.program))?;

        let stdout = child.stdout.take().context("stdout was not captured")?;
        let stderr = child.stderr.take().context("stderr was not captured")?;
        let mut out_lines = BufReader::new(stdout).split(b'\n');
        let mut err_lines = BufReader::new(stderr).split(b'\n');
        let (mut out_open, mut err_open) = (true, true);
        let mut combined = String::new();

        while out_open || err_open {
            let line = tokio::select! {
                segment = out_lines.next_segment(), if out_open => match segment? {
                    Some(bytes) => lossy_line(bytes),
                    None => { out_open = false; continue; }
                },
                segment = err_lines.next_segment(), if err_open => match segment? {
                    Some(bytes) => lossy_line(bytes),
                    None => { err_open = false; continue; }
                },
            };

            self.emit(&invocation.mode, &line);
            combined.push_str(&line);
            combined.push('\n');
        }

        let status = child
            .wait()
            .await
            .with_context(|| format!("Failed to wait for '{}'", invocation.program))?;
        let output = ProcessOutput::new(combined, status.code().unwrap_or(-1));

        if let OutputMode::LastLine = invocation.mode {
            if let Some(line) = output.last_line() {
                self.reporter.println(format!("    {}", line));
            }
        }

        debug!(
            command = %invocation.display(),
            exit_code = output.exit_code,
            "Finished"
        );
        Ok(output)
    }
}

/// Look up `program` inside `dir` using the platform's executable suffix
pub fn program_in(dir: &Path, program: &str) -> Option<PathBuf> {
    let candidates: [OsString; 2] = [
        OsString::from(format!("{}{}", program, std::env::consts::EXE_SUFFIX)),
        OsString::from(program),
    ];
    candidates
        .iter()
        .map(|name| dir.join(name))
        .find(|path| path.is_file())
}
