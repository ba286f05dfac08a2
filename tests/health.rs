//! Health Monitor Integration Tests
//!
//! Bounded fixed-delay polling against a scripted backend, on a paused clock.

mod common;

use std::time::Duration;

use common::ScriptedHealth;
use fractionate_setup::core::HealthMonitor;
use fractionate_setup::domain::OverallStatus;
use tokio::time::Instant;

#[tokio::test(start_paused = true)]
async fn test_ok_on_tenth_probe_waits_nine_delays() {
    let probe = ScriptedHealth::ok_on(10);
    let started = Instant::now();

    let report = HealthMonitor::default().poll(&probe).await;

    assert_eq!(report.overall_status, OverallStatus::Ok);
    assert_eq!(report.attempts, 10);
    assert_eq!(probe.probes(), 10);

    let waited = started.elapsed();
    assert!(waited >= Duration::from_secs(18), "waited {:?}", waited);
    assert!(waited < Duration::from_secs(19), "waited {:?}", waited);
}

#[tokio::test(start_paused = true)]
async fn test_first_probe_ok_does_not_sleep() {
    let probe = ScriptedHealth::ok_on(1);
    let started = Instant::now();

    let report = HealthMonitor::default().poll(&probe).await;

    assert!(report.is_ok());
    assert_eq!(report.attempts, 1);
    assert_eq!(started.elapsed(), Duration::ZERO);
}

#[tokio::test(start_paused = true)]
async fn test_never_ok_is_degraded_not_an_error() {
    let probe = ScriptedHealth::never_ok();

    let report = HealthMonitor::default().poll(&probe).await;

    assert_eq!(report.overall_status, OverallStatus::Degraded);
    assert_eq!(report.attempts, 10);
    assert_eq!(probe.probes(), 10);
    // Last decoded response still surfaces component flags
    assert_eq!(report.database_connected, Some(true));
}

#[tokio::test(start_paused = true)]
async fn test_component_flags_surface_on_success() {
    let probe = ScriptedHealth::ok_on(2);

    let report = HealthMonitor::default().poll(&probe).await;

    let falcon = &report.components["falcon3_7b"];
    assert!(falcon.installed && falcon.running);
    // florence2 reports `loaded`
    let florence = &report.components["florence2"];
    assert!(florence.installed && florence.running);
}
