//! Configuration for a provisioning run.
//!
//! Configuration sources (highest priority first):
//! 1. Environment variables (FRACTIONATE_HOME, FRACTIONATE_ALLOWED_ORIGIN)
//! 2. Config file (<home>/setup.yaml)
//! 3. Defaults (~/.fractionate)
//!
//! The resolved value is built once in `main` and passed down; nothing
//! reads configuration from ambient state.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::domain::{
    AppConfig, BuildTarget, CompilerSelection, Platform, ProxySettings, ServiceEndpoint,
};
use crate::domain::settings::{
    DatabaseConfig, LoggingConfig, ModelsConfig, TextModelConfig, VisionModelConfig,
};

pub const HOME_ENV: &str = "FRACTIONATE_HOME";
pub const ORIGIN_ENV: &str = "FRACTIONATE_ALLOWED_ORIGIN";

const DEFAULT_ORIGIN: &str = "http://localhost:3000";
const DEFAULT_BITNET_REPO: &str = "https://github.com/microsoft/BitNet.git";
const DEFAULT_MODEL_REPO: &str = "tiiuae/Falcon3-7B-Instruct-1.58bit";
const DEFAULT_QUANTIZATION: &str = "i2_s";
const DEFAULT_FALCON_URL: &str =
    "https://huggingface.co/tiiuae/Falcon3-7B-Instruct-1.58bit-GGUF/resolve/main/ggml-model-i2_s.gguf";
const DEFAULT_FLORENCE_URL: &str = "https://huggingface.co/microsoft/Florence-2-base/resolve/main";
const DEFAULT_CADDY_VERSION: &str = "2.8.4";

const FLORENCE_FILES: &[&str] = &[
    "config.json",
    "configuration_florence2.py",
    "modeling_florence2.py",
    "processing_florence2.py",
    "preprocessor_config.json",
    "tokenizer.json",
    "tokenizer_config.json",
    "vocab.json",
    "pytorch_model.bin",
];

const BACKEND_PACKAGES: &[&str] = &[
    "fastapi",
    "uvicorn[standard]",
    "httpx",
    "pyyaml",
    "pydantic",
    "sse-starlette",
    "aiosqlite",
    "psutil",
    "python-multipart",
    "pymupdf",
    "pillow",
    "transformers",
    "torch",
    "einops",
    "timm",
];

/// Raw config file schema (matches YAML structure)
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ConfigFile {
    pub allowed_origin: Option<String>,
    pub proxy: ProxyConfig,
    pub build: BuildConfig,
    pub models: ModelSources,
    pub python_packages: Option<Vec<String>>,

    /// Directory holding the backend sources to deploy
    pub backend_source: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    pub listen_port: Option<u16>,
    pub backend_port: Option<u16>,
    pub caddy_version: Option<String>,

    /// Full archive URL, overriding the version-derived one
    pub caddy_url: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct BuildConfig {
    pub repo_url: Option<String>,
    pub model_repo: Option<String>,
    pub quantization: Option<String>,

    /// Candidate `llama-server` locations relative to the checkout, in
    /// priority order. The first entry is where the backend looks.
    pub expected_outputs: Option<Vec<PathBuf>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ModelSources {
    /// Direct download used when the setup script yields no model
    pub falcon_url: Option<String>,
    pub florence_base_url: Option<String>,
    pub florence_files: Option<Vec<String>>,
}

/// Resolved configuration with absolute paths
#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    /// Root of everything the provisioner writes
    pub home: PathBuf,
    /// Path to config file (if found)
    pub config_file: Option<PathBuf>,
    pub platform: Platform,
    pub allowed_origin: String,

    pub listen_port: u16,
    pub backend_port: u16,
    pub caddy_url: String,

    pub bitnet_repo: String,
    pub model_repo: String,
    pub quantization: String,
    pub expected_outputs: Vec<PathBuf>,

    pub falcon_url: String,
    pub florence_base_url: String,
    pub florence_files: Vec<String>,

    pub python_packages: Vec<String>,
    pub backend_source: Option<PathBuf>,
}

/// Loopback address every service binds to
pub const LOOPBACK: &str = "127.0.0.1";

/// Port the backend's llama-server child listens on
pub const LLAMA_PORT: u16 = 8082;

impl ResolvedConfig {
    /// Load configuration from all sources
    pub fn load() -> Result<Self> {
        let home = match std::env::var_os(HOME_ENV) {
            Some(home) if !home.is_empty() => PathBuf::from(home),
            _ => dirs::home_dir()
                .context("Failed to determine home directory")?
                .join(".fractionate"),
        };

        let config_path = home.join("setup.yaml");
        let file = if config_path.is_file() {
            Some(load_config_file(&config_path)?)
        } else {
            None
        };
        let origin = std::env::var(ORIGIN_ENV).ok().filter(|o| !o.is_empty());

        let mut resolved = Self::resolve(home, file, origin, Platform::current());
        if config_path.is_file() {
            resolved.config_file = Some(config_path);
        }
        Ok(resolved)
    }

    /// Merge a parsed config file and overrides over the defaults
    pub fn resolve(
        home: PathBuf,
        file: Option<ConfigFile>,
        origin_override: Option<String>,
        platform: Platform,
    ) -> Self {
        let file = file.unwrap_or_default();

        let caddy_version = file
            .proxy
            .caddy_version
            .unwrap_or_else(|| DEFAULT_CADDY_VERSION.to_string());
        let caddy_url = file
            .proxy
            .caddy_url
            .unwrap_or_else(|| caddy_release_url(&caddy_version, platform));

        let backend_source = file.backend_source.map(|p| {
            if p.is_absolute() {
                p
            } else {
                home.join(p)
            }
        });

        Self {
            config_file: None,
            platform,
            allowed_origin: origin_override
                .or(file.allowed_origin)
                .unwrap_or_else(|| DEFAULT_ORIGIN.to_string()),
            listen_port: file.proxy.listen_port.unwrap_or(8080),
            backend_port: file.proxy.backend_port.unwrap_or(8000),
            caddy_url,
            bitnet_repo: file
                .build
                .repo_url
                .unwrap_or_else(|| DEFAULT_BITNET_REPO.to_string()),
            model_repo: file
                .build
                .model_repo
                .unwrap_or_else(|| DEFAULT_MODEL_REPO.to_string()),
            quantization: file
                .build
                .quantization
                .unwrap_or_else(|| DEFAULT_QUANTIZATION.to_string()),
            expected_outputs: file
                .build
                .expected_outputs
                .filter(|v| !v.is_empty())
                .unwrap_or_else(|| default_expected_outputs(platform)),
            falcon_url: file
                .models
                .falcon_url
                .unwrap_or_else(|| DEFAULT_FALCON_URL.to_string()),
            florence_base_url: file
                .models
                .florence_base_url
                .unwrap_or_else(|| DEFAULT_FLORENCE_URL.to_string()),
            florence_files: file
                .models
                .florence_files
                .unwrap_or_else(|| FLORENCE_FILES.iter().map(|f| f.to_string()).collect()),
            python_packages: file
                .python_packages
                .unwrap_or_else(|| BACKEND_PACKAGES.iter().map(|p| p.to_string()).collect()),
            backend_source,
            home,
        }
    }

    pub fn bin_dir(&self) -> PathBuf {
        self.home.join("bin")
    }

    pub fn caddy_binary(&self) -> PathBuf {
        self.bin_dir().join(self.platform.exe_name("caddy"))
    }

    pub fn bitnet_dir(&self) -> PathBuf {
        self.home.join("bitnet")
    }

    pub fn models_dir(&self) -> PathBuf {
        self.home.join("models")
    }

    /// Where the backend starts llama-server from, whatever the build layout
    pub fn engine_binary(&self) -> PathBuf {
        let bin = self.bitnet_dir().join("build").join("bin");
        match self.platform {
            Platform::Windows => bin.join("Release").join("llama-server.exe"),
            Platform::Linux | Platform::MacOs => bin.join("llama-server"),
        }
    }

    pub fn falcon_model(&self) -> PathBuf {
        self.models_dir().join("falcon3-7b-1.58bit").join("model.gguf")
    }

    pub fn florence_dir(&self) -> PathBuf {
        self.models_dir().join("florence-2-base")
    }

    pub fn server_dir(&self) -> PathBuf {
        self.home.join("server")
    }

    pub fn venv_dir(&self) -> PathBuf {
        self.home.join("venv")
    }

    pub fn venv_python(&self) -> PathBuf {
        match self.platform {
            Platform::Windows => self.venv_dir().join("Scripts").join("python.exe"),
            Platform::Linux | Platform::MacOs => self.venv_dir().join("bin").join("python"),
        }
    }

    pub fn run_dir(&self) -> PathBuf {
        self.home.join("run")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.home.join("logs")
    }

    pub fn setup_log(&self) -> PathBuf {
        self.logs_dir().join("setup.log")
    }

    pub fn build_log(&self) -> PathBuf {
        self.logs_dir().join("build.log")
    }

    pub fn caddyfile(&self) -> PathBuf {
        self.home.join("Caddyfile")
    }

    pub fn app_config_path(&self) -> PathBuf {
        self.home.join("config.yaml")
    }

    pub fn lock_path(&self) -> PathBuf {
        self.home.join("setup.lock")
    }

    /// Directories created by the Directories step
    pub fn directories(&self) -> Vec<PathBuf> {
        vec![
            self.home.clone(),
            self.bin_dir(),
            self.models_dir(),
            self.falcon_model()
                .parent()
                .map(Path::to_path_buf)
                .unwrap_or_else(|| self.models_dir()),
            self.florence_dir(),
            self.server_dir(),
            self.run_dir(),
            self.logs_dir(),
        ]
    }

    pub fn proxy_endpoint(&self) -> ServiceEndpoint {
        ServiceEndpoint::new("proxy", LOOPBACK, self.listen_port).with_health_path("/api/health")
    }

    pub fn backend_endpoint(&self) -> ServiceEndpoint {
        ServiceEndpoint::new("backend", LOOPBACK, self.backend_port)
    }

    pub fn proxy_settings(&self) -> ProxySettings {
        ProxySettings {
            listen_address: LOOPBACK.to_string(),
            listen_port: self.listen_port,
            backend_address: LOOPBACK.to_string(),
            backend_port: self.backend_port,
            allowed_origin: self.allowed_origin.clone(),
        }
    }

    /// The engine build, rooted in this home
    pub fn build_target(&self) -> BuildTarget {
        BuildTarget {
            repo_url: self.bitnet_repo.clone(),
            checkout_path: self.bitnet_dir(),
            primary_entry_point: "setup_env.py".to_string(),
            model_repo: self.model_repo.clone(),
            quantization: self.quantization.clone(),
            fallback_compiler: CompilerSelection::host_default(),
            expected_outputs: self.expected_outputs.clone(),
            output_file_name: self.platform.exe_name("llama-server"),
            installed_output: self.engine_binary(),
            model_destination: self.falcon_model(),
        }
    }

    /// Backend `config.yaml` contents for a fresh install
    pub fn app_config(&self) -> AppConfig {
        AppConfig {
            mode: "local".to_string(),
            allowed_origin: self.allowed_origin.clone(),
            models: ModelsConfig {
                falcon3_7b: TextModelConfig {
                    path: self.falcon_model(),
                    threads: "auto".to_string(),
                    context_size: 4096,
                    auto_start: true,
                },
                florence2: VisionModelConfig {
                    path: self.florence_dir(),
                },
            },
            database: DatabaseConfig {
                path: self.home.join("data.db"),
            },
            logging: LoggingConfig {
                path: self.logs_dir().join("backend.log"),
                level: "info".to_string(),
            },
        }
    }
}

/// Candidate build outputs, most likely first
pub fn default_expected_outputs(platform: Platform) -> Vec<PathBuf> {
    let exe = platform.exe_name("llama-server");
    match platform {
        Platform::Windows => vec![
            PathBuf::from("build").join("bin").join("Release").join(&exe),
            PathBuf::from("build").join("bin").join(&exe),
            PathBuf::from("build").join("Release").join("bin").join(&exe),
            PathBuf::from("build")
                .join("3rdparty")
                .join("llama.cpp")
                .join("bin")
                .join("Release")
                .join(&exe),
        ],
        Platform::Linux | Platform::MacOs => vec![
            PathBuf::from("build").join("bin").join(&exe),
            PathBuf::from("build")
                .join("3rdparty")
                .join("llama.cpp")
                .join("bin")
                .join(&exe),
        ],
    }
}

/// Official release archive for this platform
pub fn caddy_release_url(version: &str, platform: Platform) -> String {
    let extension = match platform {
        Platform::Windows => "zip",
        Platform::Linux | Platform::MacOs => "tar.gz",
    };
    format!(
        "https://github.com/caddyserver/caddy/releases/download/v{v}/caddy_{v}_{os}_{arch}.{ext}",
        v = version,
        os = platform.release_os(),
        arch = Platform::release_arch(),
        ext = extension
    )
}

/// Load and parse config file
fn load_config_file(path: &Path) -> Result<ConfigFile> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    serde_yaml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ResolvedConfig::resolve(
            PathBuf::from("/home/me/.fractionate"),
            None,
            None,
            Platform::Linux,
        );

        assert_eq!(config.allowed_origin, "http://localhost:3000");
        assert_eq!(config.listen_port, 8080);
        assert_eq!(config.backend_port, 8000);
        assert_eq!(
            config.falcon_model(),
            PathBuf::from("/home/me/.fractionate/models/falcon3-7b-1.58bit/model.gguf")
        );
        assert_eq!(
            config.expected_outputs[0],
            PathBuf::from("build/bin/llama-server")
        );
        assert!(config.caddy_url.ends_with(".tar.gz"));
        assert!(config.caddy_url.contains("caddy_2.8.4_linux_"));
    }

    #[test]
    fn test_file_and_env_precedence() {
        let file: ConfigFile = serde_yaml::from_str(
            r#"
allowed_origin: "http://file.example"
proxy:
  listen_port: 9090
build:
  expected_outputs:
    - out/llama-server
"#,
        )
        .unwrap();

        let from_file = ResolvedConfig::resolve(
            PathBuf::from("/h"),
            Some(file.clone()),
            None,
            Platform::Linux,
        );
        assert_eq!(from_file.allowed_origin, "http://file.example");
        assert_eq!(from_file.listen_port, 9090);
        assert_eq!(from_file.backend_port, 8000);
        assert_eq!(from_file.expected_outputs, vec![PathBuf::from("out/llama-server")]);

        let from_env = ResolvedConfig::resolve(
            PathBuf::from("/h"),
            Some(file),
            Some("http://env.example".to_string()),
            Platform::Linux,
        );
        assert_eq!(from_env.allowed_origin, "http://env.example");
    }

    #[test]
    fn test_windows_layout() {
        let config = ResolvedConfig::resolve(PathBuf::from(r"C:\fe"), None, None, Platform::Windows);
        assert!(config.caddy_binary().ends_with("caddy.exe"));
        assert!(config.venv_python().ends_with("python.exe"));
        assert!(config.caddy_url.ends_with(".zip"));
        assert_eq!(
            config.expected_outputs[0],
            PathBuf::from("build").join("bin").join("Release").join("llama-server.exe")
        );
    }

    #[test]
    fn test_app_config_matches_backend_keys() {
        let config = ResolvedConfig::resolve(PathBuf::from("/h"), None, None, Platform::Linux);
        let yaml = serde_yaml::to_string(&config.app_config()).unwrap();
        for key in ["falcon3_7b:", "florence2:", "context_size: 4096", "threads: auto", "database:"] {
            assert!(yaml.contains(key), "missing {}", key);
        }
    }
}
