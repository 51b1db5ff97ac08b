//! hubd - IoT hub security-core daemon
//!
//! This daemon:
//! 1. Opens the device registry
//! 2. Optionally seeds demo devices (idempotent)
//! 3. Starts the TLS-only broker through the configured engine
//! 4. Runs the health-check monitor and the certificate rotation service
//! 5. Shuts everything down on SIGINT/SIGTERM

use anyhow::Result;
use clap::Parser;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use hub_sentinel::broker::BrokerSettings;
use hub_sentinel::identity;
use hub_sentinel::interceptor::InterceptorOptions;
use hub_sentinel::registry::NewDevice;
use hub_sentinel::{
    Broker, CertRotationService, DeviceStatus, DeviceType, HealthMonitor, HubConfig,
    InProcessEngine, Registry, TlsPaths,
};

#[derive(Parser, Debug)]
#[command(author, version, about = "IoT hub security-core daemon")]
struct Args {
    /// Path to the hub config file (TOML or JSON).
    #[arg(long, env = "HUB_CONFIG")]
    config: Option<String>,

    /// Seed a pair of pre-approved demo devices at startup.
    #[arg(long, env = "HUB_SEED_DEMO")]
    seed_demo: bool,
}

/// Demo devices for bootstrap: pre-approved so the happy path works out of
/// the box. Insertion is idempotent across restarts.
fn seed_demo_devices(registry: &Registry) -> Result<()> {
    let seeds = [
        ("IOT-2025-0001", "AA:BB:CC:DD:EE:01", DeviceType::TempSensor, false),
        ("IOT-2025-0002", "AA:BB:CC:DD:EE:02", DeviceType::SmartPlug, true),
    ];
    for (serial, mac, device_type, critical) in seeds {
        let (device, inserted) = registry.upsert_device_if_absent(&NewDevice {
            device_type,
            serial_hash: identity::hash(serial),
            mac_hash: identity::hash(mac),
            composite_hash: identity::hash_composite(serial, mac),
            status: DeviceStatus::Approved,
            is_critical: critical,
            firmware_version: None,
            hardware_version: None,
        })?;
        if inserted {
            log::info!("seeded demo device {} (id {})", serial, device.id);
        }
    }
    Ok(())
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();
    if let Some(path) = &args.config {
        // HubConfig::load reads HUB_CONFIG; make the flag authoritative.
        std::env::set_var("HUB_CONFIG", path);
    }
    let cfg = HubConfig::load()?;

    let registry = Arc::new(Registry::open(&cfg.db_path)?);
    if args.seed_demo {
        seed_demo_devices(&registry)?;
    }

    let tls_paths = TlsPaths {
        cert: cfg.tls_cert_path.clone(),
        key: cfg.tls_key_path.clone(),
        ca: cfg.tls_ca_path.clone(),
        crl: cfg.tls_crl_path.clone(),
    };
    let engine = Arc::new(InProcessEngine::new());
    let broker = Arc::new(Broker::new(
        BrokerSettings {
            bind_addr: cfg.bind_addr(),
            controller_id: cfg.controller_id.clone(),
            tls: tls_paths.clone(),
            interceptor: InterceptorOptions {
                worker_pool_size: cfg.worker_pool_size,
                health_drift: cfg.health_drift,
                max_telemetry_payload: cfg.max_telemetry_payload,
            },
        },
        registry.clone(),
        engine,
    ));
    broker.start()?;

    let monitor = HealthMonitor::start(registry.clone(), cfg.monitor_period, cfg.offline_after)?;
    let rotation = CertRotationService::start(
        broker.clone(),
        tls_paths,
        (cfg.rotation_min, cfg.rotation_max),
        cfg.file_poll,
    )?;

    log::info!(
        "hubd running: broker on {}, db {}, controller id {}",
        cfg.bind_addr(),
        cfg.db_path,
        cfg.controller_id
    );

    let shutdown = Arc::new(AtomicBool::new(false));
    let flag = shutdown.clone();
    ctrlc::set_handler(move || {
        flag.store(true, Ordering::SeqCst);
    })?;

    while !shutdown.load(Ordering::SeqCst) {
        std::thread::sleep(Duration::from_millis(200));
    }

    log::info!("shutting down");
    rotation.stop();
    monitor.stop();
    broker.stop()?;
    Ok(())
}
