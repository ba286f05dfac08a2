//! Host platform detection.

use serde::{Deserialize, Serialize};

/// Operating system family the provisioner targets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Platform {
    Windows,
    Linux,
    MacOs,
}

impl Platform {
    /// Platform of the running binary
    pub fn current() -> Self {
        if cfg!(windows) {
            Self::Windows
        } else if cfg!(target_os = "macos") {
            Self::MacOs
        } else {
            Self::Linux
        }
    }

    /// Executable file suffix
    pub fn exe_suffix(self) -> &'static str {
        match self {
            Self::Windows => ".exe",
            Self::Linux | Self::MacOs => "",
        }
    }

    /// Append the executable suffix to a bare program name
    pub fn exe_name(self, name: &str) -> String {
        format!("{}{}", name, self.exe_suffix())
    }

    /// Whether the whole run needs an elevated session.
    ///
    /// Only winget installs machine-wide from the run itself; apt goes
    /// through sudo per command and Homebrew refuses root.
    pub fn requires_elevation(self) -> bool {
        matches!(self, Self::Windows)
    }

    /// Name used in release asset file names (caddy_<ver>_<os>_<arch>)
    pub fn release_os(self) -> &'static str {
        match self {
            Self::Windows => "windows",
            Self::Linux => "linux",
            Self::MacOs => "mac",
        }
    }

    /// Release architecture label for the running binary
    pub fn release_arch() -> &'static str {
        match std::env::consts::ARCH {
            "aarch64" => "arm64",
            "arm" => "armv7",
            _ => "amd64",
        }
    }
}

impl std::fmt::Display for Platform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Windows => "windows",
            Self::Linux => "linux",
            Self::MacOs => "macos",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exe_name() {
        assert_eq!(Platform::Windows.exe_name("caddy"), "caddy.exe");
        assert_eq!(Platform::Linux.exe_name("caddy"), "caddy");
    }

    #[test]
    fn test_elevation_policy() {
        assert!(Platform::Windows.requires_elevation());
        assert!(!Platform::Linux.requires_elevation());
        assert!(!Platform::MacOs.requires_elevation());
    }
}
