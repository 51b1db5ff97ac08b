//! Hub configuration: layered TOML/JSON file, environment overrides,
//! validation.

use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

const DEFAULT_DB_PATH: &str = "hub.db";
const DEFAULT_BIND_HOST: &str = "0.0.0.0";
const DEFAULT_TLS_PORT: u16 = 8884;
const DEFAULT_CONTROLLER_ID: &str = "controller-01";
const DEFAULT_WORKER_POOL_SIZE: usize = 10;
const DEFAULT_MONITOR_PERIOD_SECS: u64 = 2 * 60;
const DEFAULT_OFFLINE_AFTER_SECS: u64 = 3 * 60;
const DEFAULT_ROTATION_MIN_SECS: u64 = 7 * 24 * 60 * 60;
const DEFAULT_ROTATION_MAX_SECS: u64 = 30 * 24 * 60 * 60;
const DEFAULT_FILE_POLL_SECS: u64 = 5 * 60;
const DEFAULT_MAX_TELEMETRY_BYTES: usize = 512 * 1024;
const DEFAULT_HEALTH_DRIFT_SECS: u64 = 5 * 60;
const DEFAULT_PAIRING_TTL_SECS: u64 = 5 * 60;

fn config_u64(value: Option<u64>, default: u64) -> u64 {
    value.unwrap_or(default)
}

#[derive(Debug, Deserialize, Default)]
struct HubConfigFile {
    db_path: Option<String>,
    controller_id: Option<String>,
    broker: Option<BrokerConfigFile>,
    tls: Option<TlsConfigFile>,
    monitor: Option<MonitorConfigFile>,
    rotation: Option<RotationConfigFile>,
    telemetry: Option<TelemetryConfigFile>,
    pairing: Option<PairingConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct BrokerConfigFile {
    host: Option<String>,
    tls_port: Option<u16>,
    worker_pool_size: Option<usize>,
}

#[derive(Debug, Deserialize, Default)]
struct TlsConfigFile {
    cert_path: Option<PathBuf>,
    key_path: Option<PathBuf>,
    ca_path: Option<PathBuf>,
    crl_path: Option<PathBuf>,
}

#[derive(Debug, Deserialize, Default)]
struct MonitorConfigFile {
    period_seconds: Option<u64>,
    offline_after_seconds: Option<u64>,
    health_drift_seconds: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct RotationConfigFile {
    min_seconds: Option<u64>,
    max_seconds: Option<u64>,
    file_poll_seconds: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct TelemetryConfigFile {
    max_payload_bytes: Option<usize>,
}

#[derive(Debug, Deserialize, Default)]
struct PairingConfigFile {
    ttl_seconds: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct HubConfig {
    pub db_path: String,
    pub controller_id: String,
    pub bind_host: String,
    pub tls_port: u16,
    pub worker_pool_size: usize,
    pub tls_cert_path: PathBuf,
    pub tls_key_path: PathBuf,
    pub tls_ca_path: PathBuf,
    pub tls_crl_path: Option<PathBuf>,
    pub monitor_period: Duration,
    pub offline_after: Duration,
    pub health_drift: Duration,
    pub rotation_min: Duration,
    pub rotation_max: Duration,
    pub file_poll: Duration,
    pub max_telemetry_payload: usize,
    pub pairing_ttl: Duration,
}

impl HubConfig {
    /// Load from `HUB_CONFIG` (TOML or JSON) if set, then apply `HUB_*`
    /// environment overrides, then validate.
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("HUB_CONFIG").ok();
        let file_cfg = match config_path.as_deref() {
            Some(path) => Some(read_config_file(Path::new(path))?),
            None => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default())?;
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.bind_host, self.tls_port)
    }

    fn from_file(file: HubConfigFile) -> Result<Self> {
        let broker = file.broker.unwrap_or_default();
        let tls = file.tls.unwrap_or_default();
        let monitor = file.monitor.unwrap_or_default();
        let rotation = file.rotation.unwrap_or_default();
        let telemetry = file.telemetry.unwrap_or_default();
        let pairing = file.pairing.unwrap_or_default();

        Ok(Self {
            db_path: file.db_path.unwrap_or_else(|| DEFAULT_DB_PATH.to_string()),
            controller_id: file
                .controller_id
                .unwrap_or_else(|| DEFAULT_CONTROLLER_ID.to_string()),
            bind_host: broker.host.unwrap_or_else(|| DEFAULT_BIND_HOST.to_string()),
            tls_port: broker.tls_port.unwrap_or(DEFAULT_TLS_PORT),
            worker_pool_size: broker.worker_pool_size.unwrap_or(DEFAULT_WORKER_POOL_SIZE),
            tls_cert_path: tls.cert_path.unwrap_or_else(|| PathBuf::from("hub.crt")),
            tls_key_path: tls.key_path.unwrap_or_else(|| PathBuf::from("hub.key")),
            tls_ca_path: tls.ca_path.unwrap_or_else(|| PathBuf::from("ca.crt")),
            tls_crl_path: tls.crl_path,
            monitor_period: Duration::from_secs(config_u64(
                monitor.period_seconds,
                DEFAULT_MONITOR_PERIOD_SECS,
            )),
            offline_after: Duration::from_secs(config_u64(
                monitor.offline_after_seconds,
                DEFAULT_OFFLINE_AFTER_SECS,
            )),
            health_drift: Duration::from_secs(config_u64(
                monitor.health_drift_seconds,
                DEFAULT_HEALTH_DRIFT_SECS,
            )),
            rotation_min: Duration::from_secs(config_u64(
                rotation.min_seconds,
                DEFAULT_ROTATION_MIN_SECS,
            )),
            rotation_max: Duration::from_secs(config_u64(
                rotation.max_seconds,
                DEFAULT_ROTATION_MAX_SECS,
            )),
            file_poll: Duration::from_secs(config_u64(
                rotation.file_poll_seconds,
                DEFAULT_FILE_POLL_SECS,
            )),
            max_telemetry_payload: telemetry
                .max_payload_bytes
                .unwrap_or(DEFAULT_MAX_TELEMETRY_BYTES),
            pairing_ttl: Duration::from_secs(config_u64(
                pairing.ttl_seconds,
                DEFAULT_PAIRING_TTL_SECS,
            )),
        })
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(path) = std::env::var("HUB_DB_PATH") {
            if !path.trim().is_empty() {
                self.db_path = path;
            }
        }
        if let Ok(controller_id) = std::env::var("HUB_CONTROLLER_ID") {
            if !controller_id.trim().is_empty() {
                self.controller_id = controller_id;
            }
        }
        if let Ok(host) = std::env::var("HUB_BIND_HOST") {
            if !host.trim().is_empty() {
                self.bind_host = host;
            }
        }
        if let Ok(port) = std::env::var("HUB_TLS_PORT") {
            if !port.trim().is_empty() {
                self.tls_port = port
                    .parse()
                    .map_err(|_| anyhow!("HUB_TLS_PORT must be a port number"))?;
            }
        }
        if let Ok(size) = std::env::var("HUB_WORKER_POOL_SIZE") {
            if !size.trim().is_empty() {
                self.worker_pool_size = size
                    .parse()
                    .map_err(|_| anyhow!("HUB_WORKER_POOL_SIZE must be an integer"))?;
            }
        }
        if let Ok(path) = std::env::var("HUB_TLS_CERT_PATH") {
            if !path.trim().is_empty() {
                self.tls_cert_path = PathBuf::from(path);
            }
        }
        if let Ok(path) = std::env::var("HUB_TLS_KEY_PATH") {
            if !path.trim().is_empty() {
                self.tls_key_path = PathBuf::from(path);
            }
        }
        if let Ok(path) = std::env::var("HUB_TLS_CA_PATH") {
            if !path.trim().is_empty() {
                self.tls_ca_path = PathBuf::from(path);
            }
        }
        if let Ok(path) = std::env::var("HUB_TLS_CRL_PATH") {
            if !path.trim().is_empty() {
                self.tls_crl_path = Some(PathBuf::from(path));
            }
        }
        if let Ok(secs) = std::env::var("HUB_ROTATION_MIN_SECS") {
            if !secs.trim().is_empty() {
                self.rotation_min = Duration::from_secs(
                    secs.parse()
                        .map_err(|_| anyhow!("HUB_ROTATION_MIN_SECS must be an integer"))?,
                );
            }
        }
        if let Ok(secs) = std::env::var("HUB_ROTATION_MAX_SECS") {
            if !secs.trim().is_empty() {
                self.rotation_max = Duration::from_secs(
                    secs.parse()
                        .map_err(|_| anyhow!("HUB_ROTATION_MAX_SECS must be an integer"))?,
                );
            }
        }
        Ok(())
    }

    fn validate(&mut self) -> Result<()> {
        if self.controller_id.trim().is_empty() || self.controller_id.contains('/') {
            return Err(anyhow!(
                "controller_id must be non-empty and contain no '/'"
            ));
        }
        if self.worker_pool_size == 0 {
            return Err(anyhow!("broker.worker_pool_size must be at least 1"));
        }
        if self.rotation_min > self.rotation_max {
            return Err(anyhow!(
                "rotation.min_seconds must not exceed rotation.max_seconds"
            ));
        }
        if self.monitor_period.as_secs() == 0 {
            return Err(anyhow!("monitor.period_seconds must be greater than zero"));
        }
        if self.max_telemetry_payload == 0 {
            return Err(anyhow!("telemetry.max_payload_bytes must be greater than zero"));
        }
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ConfigFormat {
    Toml,
    Json,
}

/// Pick the on-disk format: the extension decides when it is recognized,
/// otherwise the leading character does (JSON documents open with `{`).
fn sniff_config_format(path: &Path, raw: &str) -> ConfigFormat {
    match path.extension().and_then(|ext| ext.to_str()) {
        Some("toml") => ConfigFormat::Toml,
        Some("json") => ConfigFormat::Json,
        _ => {
            if raw.trim_start().starts_with('{') {
                ConfigFormat::Json
            } else {
                ConfigFormat::Toml
            }
        }
    }
}

fn read_config_file<T>(path: &Path) -> Result<T>
where
    T: serde::de::DeserializeOwned,
{
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("cannot read config file {}", path.display()))?;

    match sniff_config_format(path, &raw) {
        ConfigFormat::Toml => toml::from_str(&raw)
            .with_context(|| format!("config file {} is not valid TOML", path.display())),
        ConfigFormat::Json => serde_json::from_str(&raw)
            .with_context(|| format!("config file {} is not valid JSON", path.display())),
    }
}
