//! Idempotency Integration Tests
//!
//! Re-running a step over its own output must leave the same state behind.

mod common;

use std::sync::Arc;

use common::{FakeRunner, FakeTransport};
use fractionate_setup::adapters::autostart::XdgAutostart;
use fractionate_setup::adapters::{AutostartEntry, AutostartRegistry, Registration, Transport};
use fractionate_setup::config::ResolvedConfig;
use fractionate_setup::core::{
    deploy_tree, render_caddyfile, write_app_config_once, write_if_changed, ArtifactFetcher,
    BuildOrchestrator, DeployStats, ProgressReporter,
};
use fractionate_setup::domain::{BuildOutcome, Platform};
use tempfile::TempDir;
use tokio_test::assert_ok;

fn config(temp: &TempDir) -> ResolvedConfig {
    ResolvedConfig::resolve(temp.path().join("home"), None, None, Platform::Linux)
}

/// Every file under `dir` with its content, sorted
fn snapshot(dir: &std::path::Path) -> Vec<(String, Vec<u8>)> {
    let mut files = Vec::new();
    let mut stack = vec![dir.to_path_buf()];
    while let Some(current) = stack.pop() {
        for entry in std::fs::read_dir(&current).unwrap() {
            let path = entry.unwrap().path();
            if path.is_dir() {
                stack.push(path);
            } else {
                files.push((
                    path.strip_prefix(dir).unwrap().to_string_lossy().to_string(),
                    std::fs::read(&path).unwrap(),
                ));
            }
        }
    }
    files.sort();
    files
}

#[test]
fn test_generated_files_survive_a_second_run() {
    let temp = TempDir::new().unwrap();
    let config = config(&temp);
    let source = temp.path().join("server-src");
    std::fs::create_dir_all(source.join("routers")).unwrap();
    std::fs::write(source.join("main.py"), "app = None").unwrap();
    std::fs::write(source.join("routers").join("health.py"), "ok = True").unwrap();

    let run = || {
        write_if_changed(&config.caddyfile(), &render_caddyfile(&config.proxy_settings())).unwrap();
        write_app_config_once(&config.app_config_path(), &config.app_config()).unwrap();
        deploy_tree(&source, &config.server_dir()).unwrap()
    };

    let first = run();
    let after_first = snapshot(&config.home);
    let second = run();

    assert_eq!(first, DeployStats { copied: 2, unchanged: 0 });
    assert_eq!(second, DeployStats { copied: 0, unchanged: 2 });
    assert_eq!(snapshot(&config.home), after_first);
}

#[test]
fn test_operator_edits_to_app_config_are_kept() {
    let temp = TempDir::new().unwrap();
    let config = config(&temp);
    let path = config.app_config_path();

    assert!(write_app_config_once(&path, &config.app_config()).unwrap());
    std::fs::write(&path, "mode: tuned\n").unwrap();
    assert!(!write_app_config_once(&path, &config.app_config()).unwrap());

    assert_eq!(std::fs::read_to_string(&path).unwrap(), "mode: tuned\n");
}

#[tokio::test]
async fn test_autostart_registered_once() {
    let temp = TempDir::new().unwrap();
    let registry = XdgAutostart::new(temp.path().join("autostart"));
    let entry = AutostartEntry {
        name: "FractionateBackend".to_string(),
        program: temp.path().join("venv/bin/python"),
        args: vec!["-m".to_string(), "uvicorn".to_string(), "main:app".to_string()],
        working_dir: temp.path().join("server"),
        description: "Fractionate Edge backend".to_string(),
    };

    let first = registry.ensure_registered(&entry).await.unwrap();
    let snapshot_first = snapshot(&temp.path().join("autostart"));
    let second = registry.ensure_registered(&entry).await.unwrap();

    assert_eq!(first, Registration::Registered);
    assert_eq!(second, Registration::AlreadyRegistered);
    assert_eq!(snapshot(&temp.path().join("autostart")), snapshot_first);
    assert_eq!(snapshot_first.len(), 1);
}

#[tokio::test]
async fn test_downloaded_model_is_not_fetched_again() {
    let temp = TempDir::new().unwrap();
    let config = config(&temp);
    let transport = Arc::new(FakeTransport::working("http"));
    let transports: Vec<Arc<dyn Transport>> = vec![transport.clone()];
    let fetcher = ArtifactFetcher::new(transports);

    for _ in 0..2 {
        fetcher
            .download_if_missing(&config.falcon_url, &config.falcon_model(), "Falcon3")
            .await
            .unwrap();
    }

    assert_eq!(transport.calls().len(), 1);
}

#[tokio::test]
async fn test_built_engine_is_not_rebuilt_or_recloned() {
    let temp = TempDir::new().unwrap();
    let config = config(&temp);
    let target = config.build_target();
    let output = target.checkout_path.join("build/bin/llama-server");
    std::fs::create_dir_all(output.parent().unwrap()).unwrap();
    std::fs::write(&output, "binary").unwrap();

    let runner = Arc::new(FakeRunner::succeeding());
    let orchestrator = BuildOrchestrator::new(
        runner.clone(),
        ProgressReporter::hidden(),
        target,
        config.venv_python(),
        config.build_log(),
    );

    for _ in 0..2 {
        let outcome = assert_ok!(orchestrator.run().await);
        assert!(matches!(outcome, BuildOutcome::Satisfied(_)));
    }
    assert!(runner.calls().is_empty());
}
