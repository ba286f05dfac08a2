//! External tools the provisioner installs and verifies.
//!
//! Each `InstalledTool` is data: how to find it, how to ask for its version,
//! what floor to enforce, and which packages provide it. The per-platform
//! catalog lives here so the installer itself stays generic.

use std::fmt;
use std::path::PathBuf;

use regex::Regex;

use super::platform::Platform;

/// Pattern matching a `major.minor` pair anywhere in version output
pub const NUMERIC_PAIR: &str = r"(\d+)\.(\d+)";

/// A `major.minor` version
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct ToolVersion {
    pub major: u32,
    pub minor: u32,
}

impl ToolVersion {
    pub const fn new(major: u32, minor: u32) -> Self {
        Self { major, minor }
    }

    /// Extract the first match of `pattern` (two capture groups) from `output`
    pub fn parse(output: &str, pattern: &str) -> Option<Self> {
        let re = Regex::new(pattern).ok()?;
        let caps = re.captures(output)?;
        let major = caps.get(1)?.as_str().parse().ok()?;
        let minor = caps.get(2)?.as_str().parse().ok()?;
        Some(Self { major, minor })
    }
}

impl fmt::Display for ToolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

/// An external dependency and how to verify/install it
#[derive(Debug, Clone)]
pub struct InstalledTool {
    /// Display name
    pub name: String,

    /// Command names to resolve, in preference order
    pub commands: Vec<String>,

    /// Arguments for the side-effect-free version query
    pub version_args: Vec<String>,

    /// Regex with two capture groups; `None` means "non-empty output is enough"
    pub version_pattern: Option<String>,

    /// Version floor; failing it is fatal
    pub minimum_version: Option<ToolVersion>,

    /// Packages that provide the tool (empty = manual install only)
    pub packages: Vec<String>,

    /// Extra arguments passed to the package manager
    pub install_args: Vec<String>,

    /// Well-known install locations that may not be on PATH yet
    pub extra_search_paths: Vec<PathBuf>,

    /// Resolved paths containing any of these fragments are not usable
    pub reject_path_fragments: Vec<String>,

    /// Shown when the tool must be installed by hand
    pub manual_hint: String,
}

impl InstalledTool {
    fn new(name: &str, commands: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            commands: commands.iter().map(|c| c.to_string()).collect(),
            version_args: vec!["--version".to_string()],
            version_pattern: Some(NUMERIC_PAIR.to_string()),
            minimum_version: None,
            packages: Vec::new(),
            install_args: Vec::new(),
            extra_search_paths: Vec::new(),
            reject_path_fragments: Vec::new(),
            manual_hint: format!("Install {} manually and re-run setup", name),
        }
    }

    fn version_args(mut self, args: &[&str]) -> Self {
        self.version_args = args.iter().map(|a| a.to_string()).collect();
        self
    }

    fn version_pattern(mut self, pattern: Option<&str>) -> Self {
        self.version_pattern = pattern.map(str::to_string);
        self
    }

    fn minimum(mut self, major: u32, minor: u32) -> Self {
        self.minimum_version = Some(ToolVersion::new(major, minor));
        self
    }

    fn packages(mut self, packages: &[&str]) -> Self {
        self.packages = packages.iter().map(|p| p.to_string()).collect();
        self
    }

    fn install_args(mut self, args: &[&str]) -> Self {
        self.install_args = args.iter().map(|a| a.to_string()).collect();
        self
    }

    fn search_in(mut self, dirs: Vec<PathBuf>) -> Self {
        self.extra_search_paths = dirs;
        self
    }

    fn reject(mut self, fragments: &[&str]) -> Self {
        self.reject_path_fragments = fragments.iter().map(|f| f.to_string()).collect();
        self
    }

    fn hint(mut self, hint: &str) -> Self {
        self.manual_hint = hint.to_string();
        self
    }

    /// Whether a resolved path falls in a rejected location
    pub fn is_rejected(&self, path: &std::path::Path) -> bool {
        let text = path.to_string_lossy();
        self.reject_path_fragments
            .iter()
            .any(|fragment| text.contains(fragment.as_str()))
    }

    /// Required tools for `platform`, in install order:
    /// runtime, version control, build system, compiler, linker/SDK.
    pub fn catalog(platform: Platform) -> Vec<InstalledTool> {
        match platform {
            Platform::Windows => windows_catalog(),
            Platform::Linux => linux_catalog(),
            Platform::MacOs => macos_catalog(),
        }
    }
}

const VC_TOOLS_COMPONENT: &str = "Microsoft.VisualStudio.Component.VC.Tools.x86.x64";

fn windows_catalog() -> Vec<InstalledTool> {
    let program_files = PathBuf::from(
        std::env::var("ProgramFiles").unwrap_or_else(|_| r"C:\Program Files".to_string()),
    );
    let program_files_x86 = PathBuf::from(
        std::env::var("ProgramFiles(x86)")
            .unwrap_or_else(|_| r"C:\Program Files (x86)".to_string()),
    );
    let local_programs = dirs::data_local_dir()
        .map(|d| d.join("Programs").join("Python"))
        .unwrap_or_default();

    vec![
        InstalledTool::new("Python", &["python", "py"])
            .version_pattern(Some(r"Python (\d+)\.(\d+)"))
            .minimum(3, 10)
            .packages(&["Python.Python.3.11"])
            .search_in(vec![
                local_programs.join("Python311"),
                program_files.join("Python311"),
            ])
            // App execution alias stub that opens the Store instead of running
            .reject(&["WindowsApps"]),
        InstalledTool::new("Git", &["git"])
            .version_pattern(Some(r"git version (\d+)\.(\d+)"))
            .packages(&["Git.Git"])
            .search_in(vec![program_files.join("Git").join("cmd")]),
        InstalledTool::new("CMake", &["cmake"])
            .version_pattern(Some(r"cmake version (\d+)\.(\d+)"))
            .minimum(3, 22)
            .packages(&["Kitware.CMake"])
            .search_in(vec![program_files.join("CMake").join("bin")]),
        InstalledTool::new("Clang", &["clang"])
            .version_pattern(Some(r"clang version (\d+)\.(\d+)"))
            .minimum(18, 0)
            .packages(&["LLVM.LLVM"])
            .search_in(vec![program_files.join("LLVM").join("bin")]),
        InstalledTool::new("Visual Studio Build Tools", &["vswhere"])
            .version_args(&[
                "-latest",
                "-products",
                "*",
                "-requires",
                VC_TOOLS_COMPONENT,
                "-property",
                "catalog_productDisplayVersion",
            ])
            .packages(&["Microsoft.VisualStudio.2022.BuildTools"])
            .install_args(&[
                "--override",
                "--quiet --wait --norestart --nocache \
                 --add Microsoft.VisualStudio.Workload.VCTools \
                 --add Microsoft.VisualStudio.Component.VC.Tools.x86.x64 \
                 --add Microsoft.VisualStudio.Component.Windows11SDK.22621 \
                 --add Microsoft.VisualStudio.Component.VC.CMake.Project \
                 --add Microsoft.VisualStudio.Component.VC.Llvm.Clang \
                 --add Microsoft.VisualStudio.Component.VC.Llvm.ClangToolset",
            ])
            .search_in(vec![program_files_x86
                .join("Microsoft Visual Studio")
                .join("Installer")])
            .hint("Install Visual Studio 2022 Build Tools with the C++ workload and ClangCL toolset"),
    ]
}

fn linux_catalog() -> Vec<InstalledTool> {
    vec![
        InstalledTool::new("Python", &["python3"])
            .version_pattern(Some(r"Python (\d+)\.(\d+)"))
            .minimum(3, 10)
            .packages(&["python3", "python3-venv", "python3-pip"]),
        InstalledTool::new("Git", &["git"])
            .version_pattern(Some(r"git version (\d+)\.(\d+)"))
            .packages(&["git"]),
        InstalledTool::new("CMake", &["cmake"])
            .version_pattern(Some(r"cmake version (\d+)\.(\d+)"))
            .minimum(3, 22)
            .packages(&["cmake"]),
        InstalledTool::new("Clang", &["clang"])
            .version_pattern(Some(r"clang version (\d+)\.(\d+)"))
            .minimum(18, 0)
            .packages(&["clang"]),
        InstalledTool::new("Build essentials", &["ld"])
            .packages(&["build-essential"]),
    ]
}

fn macos_catalog() -> Vec<InstalledTool> {
    let brew_prefixes = [
        PathBuf::from("/opt/homebrew"),
        PathBuf::from("/usr/local"),
    ];

    vec![
        InstalledTool::new("Python", &["python3"])
            .version_pattern(Some(r"Python (\d+)\.(\d+)"))
            .minimum(3, 10)
            .packages(&["python@3.11"])
            .search_in(brew_prefixes.iter().map(|p| p.join("bin")).collect()),
        InstalledTool::new("Git", &["git"])
            .version_pattern(Some(r"git version (\d+)\.(\d+)"))
            .packages(&["git"]),
        InstalledTool::new("CMake", &["cmake"])
            .version_pattern(Some(r"cmake version (\d+)\.(\d+)"))
            .minimum(3, 22)
            .packages(&["cmake"]),
        InstalledTool::new("Clang", &["clang"])
            .version_pattern(Some(r"clang version (\d+)\.(\d+)"))
            .minimum(18, 0)
            .packages(&["llvm"])
            .search_in(
                brew_prefixes
                    .iter()
                    .map(|p| p.join("opt").join("llvm").join("bin"))
                    .collect(),
            )
            // Apple clang lags upstream LLVM
            .reject(&["/usr/bin/"]),
        InstalledTool::new("Xcode command line tools", &["xcode-select"])
            .version_args(&["-p"])
            .version_pattern(None)
            .hint("Run `xcode-select --install` and re-run setup"),
    ]
}

/// Result of a side-effect-free presence check
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Presence {
    /// Resolved and answered the version query in the expected shape
    Usable {
        path: PathBuf,
        version: Option<ToolVersion>,
    },

    /// Resolvable but not functional (store alias, bad output)
    Unusable { path: PathBuf, reason: String },

    /// Functional but below the version floor
    TooOld {
        path: PathBuf,
        found: ToolVersion,
        required: ToolVersion,
    },

    /// Not resolvable at all
    Missing,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_parse() {
        let v = ToolVersion::parse("Python 3.11.9", r"Python (\d+)\.(\d+)").unwrap();
        assert_eq!(v, ToolVersion::new(3, 11));

        let v = ToolVersion::parse("cmake version 3.29.2\n\nCMake suite", NUMERIC_PAIR).unwrap();
        assert_eq!(v, ToolVersion::new(3, 29));

        assert!(ToolVersion::parse("Python was not found; run without arguments", r"Python (\d+)\.(\d+)").is_none());
    }

    #[test]
    fn test_version_ordering() {
        assert!(ToolVersion::new(3, 9) < ToolVersion::new(3, 10));
        assert!(ToolVersion::new(18, 1) >= ToolVersion::new(18, 0));
        assert!(ToolVersion::new(17, 9) < ToolVersion::new(18, 0));
    }

    #[test]
    fn test_catalog_order_and_floors() {
        for platform in [Platform::Windows, Platform::Linux, Platform::MacOs] {
            let tools = InstalledTool::catalog(platform);
            assert_eq!(tools.len(), 5);
            assert_eq!(tools[0].name, "Python");
            assert_eq!(tools[0].minimum_version, Some(ToolVersion::new(3, 10)));
            assert_eq!(tools[3].name, "Clang");
        }
    }

    #[test]
    fn test_store_alias_rejected() {
        let python = &InstalledTool::catalog(Platform::Windows)[0];
        assert!(python.is_rejected(std::path::Path::new(
            r"C:\Users\me\AppData\Local\Microsoft\WindowsApps\python.exe"
        )));
        assert!(!python.is_rejected(std::path::Path::new(
            r"C:\Program Files\Python311\python.exe"
        )));
    }
}
