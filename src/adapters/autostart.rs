//! Logon-triggered autostart registrations.
//!
//! Windows uses a scheduled task with an ONLOGON trigger, Linux an XDG
//! autostart desktop entry, macOS a per-user LaunchAgent. Registration is
//! idempotent: an existing entry is left as it is.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tracing::{debug, info};

use crate::core::deploy::write_if_changed;
use crate::domain::Platform;

use super::process::{CommandRunner, Invocation};

/// One program to start at logon
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AutostartEntry {
    /// Registration name (task name, desktop file stem, agent label)
    pub name: String,
    pub program: PathBuf,
    pub args: Vec<String>,
    pub working_dir: PathBuf,
    pub description: String,
}

impl AutostartEntry {
    /// `program args...` with quoting for paths containing spaces
    pub fn command_line(&self) -> String {
        std::iter::once(self.program.to_string_lossy().to_string())
            .chain(self.args.iter().cloned())
            .map(|part| {
                if part.contains(' ') {
                    format!("\"{}\"", part)
                } else {
                    part
                }
            })
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Result of `ensure_registered`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Registration {
    AlreadyRegistered,
    Registered,
}

/// OS facility that starts programs at logon
#[async_trait]
pub trait AutostartRegistry: Send + Sync {
    fn name(&self) -> &str;

    async fn is_registered(&self, entry_name: &str) -> Result<bool>;

    async fn register(&self, entry: &AutostartEntry) -> Result<()>;

    /// Register unless an entry with the same name exists
    async fn ensure_registered(&self, entry: &AutostartEntry) -> Result<Registration> {
        if self.is_registered(&entry.name).await? {
            debug!(entry = %entry.name, "Autostart entry exists");
            return Ok(Registration::AlreadyRegistered);
        }
        self.register(entry).await?;
        info!(entry = %entry.name, registry = self.name(), "Autostart entry registered");
        Ok(Registration::Registered)
    }
}

/// Registry for `platform`
pub fn for_platform(
    platform: Platform,
    runner: Arc<dyn CommandRunner>,
) -> Result<Arc<dyn AutostartRegistry>> {
    Ok(match platform {
        Platform::Windows => Arc::new(SchtasksRegistry::new(runner)),
        Platform::Linux => {
            let config = dirs::config_dir().context("Failed to determine config directory")?;
            Arc::new(XdgAutostart::new(config.join("autostart")))
        }
        Platform::MacOs => {
            let home = dirs::home_dir().context("Failed to determine home directory")?;
            Arc::new(LaunchAgents::new(home.join("Library").join("LaunchAgents")))
        }
    })
}

/// Windows Task Scheduler via `schtasks.exe`
pub struct SchtasksRegistry {
    runner: Arc<dyn CommandRunner>,
}

impl SchtasksRegistry {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self { runner }
    }

    /// `/TR` value: change directory first, since tasks start in system32
    pub fn task_command(entry: &AutostartEntry) -> String {
        format!(
            "cmd /c cd /d \"{}\" && {}",
            entry.working_dir.display(),
            entry.command_line()
        )
    }
}

#[async_trait]
impl AutostartRegistry for SchtasksRegistry {
    fn name(&self) -> &str {
        "schtasks"
    }

    async fn is_registered(&self, entry_name: &str) -> Result<bool> {
        let query = Invocation::new("schtasks").args(["/Query", "/TN", entry_name]);
        let output = self.runner.run(&query).await?;
        Ok(output.success())
    }

    async fn register(&self, entry: &AutostartEntry) -> Result<()> {
        let create = Invocation::new("schtasks")
            .args(["/Create", "/TN", entry.name.as_str()])
            .arg("/TR")
            .arg(Self::task_command(entry))
            .args(["/SC", "ONLOGON", "/RL", "HIGHEST", "/F"]);
        let output = self.runner.run(&create).await?;
        if !output.success() {
            anyhow::bail!(
                "schtasks /Create {} failed (exit {}): {}",
                entry.name,
                output.exit_code,
                output.last_line().unwrap_or("no output")
            );
        }
        Ok(())
    }
}

/// `~/.config/autostart/<name>.desktop`
pub struct XdgAutostart {
    dir: PathBuf,
}

impl XdgAutostart {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn entry_path(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{}.desktop", name))
    }

    pub fn render(entry: &AutostartEntry) -> String {
        format!(
            "[Desktop Entry]\n\
             Type=Application\n\
             Name={}\n\
             Comment={}\n\
             Exec={}\n\
             Path={}\n\
             Terminal=false\n\
             X-GNOME-Autostart-enabled=true\n",
            entry.name,
            entry.description,
            entry.command_line(),
            entry.working_dir.display()
        )
    }
}

#[async_trait]
impl AutostartRegistry for XdgAutostart {
    fn name(&self) -> &str {
        "xdg-autostart"
    }

    async fn is_registered(&self, entry_name: &str) -> Result<bool> {
        Ok(self.entry_path(entry_name).is_file())
    }

    async fn register(&self, entry: &AutostartEntry) -> Result<()> {
        write_if_changed(&self.entry_path(&entry.name), &Self::render(entry))?;
        Ok(())
    }
}

/// `~/Library/LaunchAgents/<name>.plist` with `RunAtLoad`
pub struct LaunchAgents {
    dir: PathBuf,
}

impl LaunchAgents {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn entry_path(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{}.plist", name))
    }

    pub fn render(entry: &AutostartEntry) -> String {
        let arguments: String = std::iter::once(entry.program.to_string_lossy().to_string())
            .chain(entry.args.iter().cloned())
            .map(|a| format!("        <string>{}</string>\n", xml_escape(&a)))
            .collect();

        format!(
            r#"<?xml version="1.0" encoding="UTF-8"?>
<!DOCTYPE plist PUBLIC "-//Apple//DTD PLIST 1.0//EN" "http://www.apple.com/DTDs/PropertyList-1.0.dtd">
<plist version="1.0">
<dict>
    <key>Label</key>
    <string>{label}</string>
    <key>ProgramArguments</key>
    <array>
{arguments}    </array>
    <key>WorkingDirectory</key>
    <string>{working_dir}</string>
    <key>RunAtLoad</key>
    <true/>
</dict>
</plist>
"#,
            label = xml_escape(&entry.name),
            arguments = arguments,
            working_dir = xml_escape(&entry.working_dir.to_string_lossy()),
        )
    }
}

fn xml_escape(value: &str) -> String {
    value
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

#[async_trait]
impl AutostartRegistry for LaunchAgents {
    fn name(&self) -> &str {
        "launchd"
    }

    async fn is_registered(&self, entry_name: &str) -> Result<bool> {
        Ok(self.entry_path(entry_name).is_file())
    }

    async fn register(&self, entry: &AutostartEntry) -> Result<()> {
        write_if_changed(&self.entry_path(&entry.name), &Self::render(entry))?;
        Ok(())
    }
}
