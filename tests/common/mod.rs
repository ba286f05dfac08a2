//! Fakes for the adapter seams shared by the integration tests.

#![allow(dead_code)]

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::Result;
use async_trait::async_trait;

use fractionate_setup::adapters::{CommandRunner, Invocation, PackageManager, ProcessOutput, Transport};
use fractionate_setup::core::{HealthProbe, ServiceControl};
use fractionate_setup::domain::{HealthResponse, LaunchOutcome, ProcessHandle, ServiceSpec};

type Handler = Box<dyn Fn(&Invocation) -> ProcessOutput + Send + Sync>;

/// Records invocations and answers them from a handler
pub struct FakeRunner {
    handler: Handler,
    resolvable: Mutex<HashMap<String, PathBuf>>,
    calls: Mutex<Vec<String>>,
    search_path: Mutex<Vec<PathBuf>>,
}

impl FakeRunner {
    /// Every invocation succeeds with empty output
    pub fn succeeding() -> Self {
        Self::with_handler(|_| ProcessOutput::new("", 0))
    }

    pub fn with_handler(handler: impl Fn(&Invocation) -> ProcessOutput + Send + Sync + 'static) -> Self {
        Self {
            handler: Box::new(handler),
            resolvable: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
            search_path: Mutex::new(Vec::new()),
        }
    }

    pub fn resolves(self, program: &str, path: impl Into<PathBuf>) -> Self {
        self.make_resolvable(program, path);
        self
    }

    pub fn make_resolvable(&self, program: &str, path: impl Into<PathBuf>) {
        self.resolvable
            .lock()
            .unwrap()
            .insert(program.to_string(), path.into());
    }

    /// Rendered invocations, in order
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn appended_paths(&self) -> Vec<PathBuf> {
        self.search_path.lock().unwrap().clone()
    }
}

#[async_trait]
impl CommandRunner for FakeRunner {
    async fn run(&self, invocation: &Invocation) -> Result<ProcessOutput> {
        self.calls.lock().unwrap().push(invocation.display());
        Ok((self.handler)(invocation))
    }

    fn resolve(&self, program: &str) -> Option<PathBuf> {
        self.resolvable.lock().unwrap().get(program).cloned()
    }

    fn append_search_path(&self, dir: &Path) -> bool {
        self.search_path.lock().unwrap().push(dir.to_path_buf());
        true
    }
}

/// Package manager whose installs make a command resolvable
pub struct FakePackageManager {
    available: bool,
    runner: Arc<FakeRunner>,
    provides: Option<(String, PathBuf)>,
    per_package: HashMap<String, (String, PathBuf)>,
    installs: Mutex<Vec<String>>,
}

impl FakePackageManager {
    pub fn new(runner: Arc<FakeRunner>) -> Self {
        Self {
            available: true,
            runner,
            provides: None,
            per_package: HashMap::new(),
            installs: Mutex::new(Vec::new()),
        }
    }

    pub fn unavailable(mut self) -> Self {
        self.available = false;
        self
    }

    /// After any install, `command` resolves to `path`
    pub fn provides(mut self, command: &str, path: impl Into<PathBuf>) -> Self {
        self.provides = Some((command.to_string(), path.into()));
        self
    }

    /// Installing `package` makes `command` resolve to `path`
    pub fn package_provides(mut self, package: &str, command: &str, path: impl Into<PathBuf>) -> Self {
        self.per_package
            .insert(package.to_string(), (command.to_string(), path.into()));
        self
    }

    pub fn installs(&self) -> Vec<String> {
        self.installs.lock().unwrap().clone()
    }
}

#[async_trait]
impl PackageManager for FakePackageManager {
    fn name(&self) -> &str {
        "fake-pm"
    }

    async fn available(&self) -> bool {
        self.available
    }

    async fn install(&self, package: &str, _extra_args: &[String]) -> Result<()> {
        self.installs.lock().unwrap().push(package.to_string());
        let provided = self.provides.iter().chain(self.per_package.get(package));
        for (command, path) in provided {
            self.runner.make_resolvable(command, path.clone());
        }
        Ok(())
    }

    fn manual_install_hint(&self) -> String {
        "install fake-pm".to_string()
    }
}

/// Transport that either writes a payload or fails, recording each call
pub struct FakeTransport {
    name: String,
    fails: bool,
    calls: Mutex<Vec<(String, PathBuf)>>,
}

impl FakeTransport {
    pub fn working(name: &str) -> Self {
        Self {
            name: name.to_string(),
            fails: false,
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn failing(name: &str) -> Self {
        Self {
            fails: true,
            ..Self::working(name)
        }
    }

    pub fn calls(&self) -> Vec<(String, PathBuf)> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl Transport for FakeTransport {
    fn name(&self) -> &str {
        &self.name
    }

    async fn fetch(&self, uri: &str, dest: &Path) -> Result<()> {
        self.calls
            .lock()
            .unwrap()
            .push((uri.to_string(), dest.to_path_buf()));
        if self.fails {
            anyhow::bail!("{} refused the transfer", self.name);
        }
        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(dest, b"gguf payload")?;
        Ok(())
    }
}

/// Transport serving a gzipped tarball holding `caddy` for `.tar.gz`
/// destinations and a model payload for anything else
pub struct ReleaseTransport {
    calls: Mutex<Vec<String>>,
}

impl ReleaseTransport {
    pub fn new() -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl Transport for ReleaseTransport {
    fn name(&self) -> &str {
        "release"
    }

    async fn fetch(&self, uri: &str, dest: &Path) -> Result<()> {
        self.calls.lock().unwrap().push(uri.to_string());
        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent)?;
        }
        if !dest.to_string_lossy().ends_with(".tar.gz") {
            std::fs::write(dest, b"gguf payload")?;
            return Ok(());
        }

        let file = std::fs::File::create(dest)?;
        let encoder = flate2::write::GzEncoder::new(file, flate2::Compression::default());
        let mut builder = tar::Builder::new(encoder);
        let body = b"#!/bin/sh\n";
        let mut header = tar::Header::new_gnu();
        header.set_size(body.len() as u64);
        header.set_mode(0o755);
        header.set_cksum();
        builder.append_data(&mut header, "caddy", &body[..])?;
        builder.into_inner()?.finish()?;
        Ok(())
    }
}

/// Starts each service once, then reports it as already running
pub struct FakeServices {
    running: Mutex<HashMap<String, u32>>,
    starts: AtomicU32,
}

impl FakeServices {
    pub fn new() -> Self {
        Self {
            running: Mutex::new(HashMap::new()),
            starts: AtomicU32::new(0),
        }
    }

    pub fn starts(&self) -> u32 {
        self.starts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ServiceControl for FakeServices {
    async fn ensure_running(&self, spec: &ServiceSpec) -> Result<LaunchOutcome> {
        let mut running = self.running.lock().unwrap();
        if let Some(pid) = running.get(&spec.endpoint.name) {
            return Ok(LaunchOutcome::AlreadyRunning(ProcessHandle::new(*pid, 0)));
        }
        let pid = 4000 + self.starts.fetch_add(1, Ordering::SeqCst);
        running.insert(spec.endpoint.name.clone(), pid);
        Ok(LaunchOutcome::Started(ProcessHandle::new(pid, 0)))
    }
}

/// Reports `starting` until the `ok_on`th probe and `ok` from then on
/// (never, if `None`)
pub struct ScriptedHealth {
    ok_on: Option<u32>,
    probes: AtomicU32,
}

impl ScriptedHealth {
    pub fn ok_on(attempt: u32) -> Self {
        Self {
            ok_on: Some(attempt),
            probes: AtomicU32::new(0),
        }
    }

    pub fn never_ok() -> Self {
        Self {
            ok_on: None,
            probes: AtomicU32::new(0),
        }
    }

    pub fn probes(&self) -> u32 {
        self.probes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl HealthProbe for ScriptedHealth {
    async fn probe(&self) -> Result<HealthResponse> {
        let n = self.probes.fetch_add(1, Ordering::SeqCst) + 1;
        let status = match self.ok_on {
            Some(ok_on) if n >= ok_on => "ok",
            _ => "starting",
        };
        let body = format!(
            r#"{{
                "status": "{}",
                "database": {{"connected": true}},
                "models": {{
                    "falcon3_7b": {{"installed": true, "running": true}},
                    "florence2": {{"installed": true, "loaded": true}}
                }}
            }}"#,
            status
        );
        Ok(serde_json::from_str(&body)?)
    }
}
