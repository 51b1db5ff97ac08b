//! Broker lifecycle guarantees: idempotent start/stop and fatal TLS errors
//! keeping the broker out of the started state.

use std::sync::Arc;
use std::time::Duration;

use hub_sentinel::broker::BrokerSettings;
use hub_sentinel::interceptor::InterceptorOptions;
use hub_sentinel::{Broker, CertRotationService, InProcessEngine, Registry, TlsPaths};

fn settings_with_missing_material(dir: &std::path::Path) -> BrokerSettings {
    BrokerSettings {
        bind_addr: "127.0.0.1:8884".to_string(),
        controller_id: "controller-01".to_string(),
        tls: TlsPaths {
            cert: dir.join("absent.crt"),
            key: dir.join("absent.key"),
            ca: dir.join("absent-ca.crt"),
            crl: None,
        },
        interceptor: InterceptorOptions {
            worker_pool_size: 1,
            ..InterceptorOptions::default()
        },
    }
}

#[test]
fn start_without_key_material_fails_and_stays_stopped() {
    let dir = tempfile::tempdir().unwrap();
    let registry = Arc::new(Registry::open_in_memory().unwrap());
    let broker = Broker::new(
        settings_with_missing_material(dir.path()),
        registry,
        Arc::new(InProcessEngine::new()),
    );

    assert!(broker.start().is_err());
    assert!(!broker.is_running());
    // A failed start leaves stop as a harmless no-op.
    broker.stop().unwrap();
    assert!(!broker.is_running());
}

#[test]
fn stop_is_idempotent_without_a_start() {
    let dir = tempfile::tempdir().unwrap();
    let registry = Arc::new(Registry::open_in_memory().unwrap());
    let broker = Broker::new(
        settings_with_missing_material(dir.path()),
        registry,
        Arc::new(InProcessEngine::new()),
    );
    broker.stop().unwrap();
    broker.stop().unwrap();
    assert!(!broker.is_running());
}

#[test]
fn rotation_service_rejects_inverted_window() {
    let dir = tempfile::tempdir().unwrap();
    let registry = Arc::new(Registry::open_in_memory().unwrap());
    let settings = settings_with_missing_material(dir.path());
    let paths = settings.tls.clone();
    let broker = Arc::new(Broker::new(settings, registry, Arc::new(InProcessEngine::new())));

    let result = CertRotationService::start(
        broker,
        paths,
        (Duration::from_secs(100), Duration::from_secs(50)),
        Duration::from_secs(300),
    );
    assert!(result.is_err());
}

#[test]
fn rotation_service_stops_within_shutdown_budget() {
    let dir = tempfile::tempdir().unwrap();
    let registry = Arc::new(Registry::open_in_memory().unwrap());
    let settings = settings_with_missing_material(dir.path());
    let paths = settings.tls.clone();
    let broker = Arc::new(Broker::new(settings, registry, Arc::new(InProcessEngine::new())));

    let service = CertRotationService::start(
        broker,
        paths,
        (Duration::from_secs(3600), Duration::from_secs(7200)),
        Duration::from_secs(300),
    )
    .unwrap();
    let started = std::time::Instant::now();
    service.stop();
    assert!(started.elapsed() < Duration::from_secs(5));
}
