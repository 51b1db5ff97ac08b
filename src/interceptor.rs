//! Broker event interception: CONNECT, DISCONNECT and message-published
//! handling.
//!
//! The broker library delivers events on its own IO workers and must never be
//! stalled by persistence latency, so everything that touches the database on
//! the publish path is dispatched to a bounded worker pool. CONNECT and
//! DISCONNECT handling stays on the caller thread; per-session ordering from
//! the library is preserved because nothing here reorders events for a given
//! client.
//!
//! Errors never propagate back to the broker library: handlers log, record an
//! alert where the taxonomy has one, and return.

use anyhow::Result;
use serde::Deserialize;
use std::sync::mpsc::{self, TrySendError};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use crate::authenticator::Authenticator;
use crate::authorizator::{parse_device_topic, TopicChannel};
use crate::identity::{self, ClientClass};
use crate::registry::{NewConnection, NewDevice, Registry};
use crate::telemetry::{parse_device_timestamp, TelemetryIngest, MAX_TELEMETRY_PAYLOAD};
use crate::{now_s, AlertType, DeviceStatus, DeviceType};

/// Default number of worker threads for publish handling.
pub const DEFAULT_WORKER_POOL_SIZE: usize = 10;

/// Default tolerated skew between a health timestamp and broker time.
pub const DEFAULT_HEALTH_DRIFT: Duration = Duration::from_secs(5 * 60);

// -------------------- Broker-facing surface --------------------

/// CONNECT event as delivered by the broker library.
#[derive(Clone, Debug)]
pub struct ConnectEvent<'a> {
    pub client_id: &'a str,
    pub peer_addr: &'a str,
    pub client_info: Option<&'a str>,
}

/// Admission decision returned to the broker library.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectDecision {
    Accept,
    Reject,
}

/// Narrow session-teardown interface implemented by the broker engine.
pub trait SessionControl: Send + Sync {
    fn close_session(&self, client_id: &str);
}

/// No-op session control for embeddings without a live engine.
pub struct NullSessionControl;

impl SessionControl for NullSessionControl {
    fn close_session(&self, _client_id: &str) {}
}

// -------------------- Options --------------------

#[derive(Clone, Debug)]
pub struct InterceptorOptions {
    pub worker_pool_size: usize,
    pub health_drift: Duration,
    pub max_telemetry_payload: usize,
}

impl Default for InterceptorOptions {
    fn default() -> Self {
        Self {
            worker_pool_size: DEFAULT_WORKER_POOL_SIZE,
            health_drift: DEFAULT_HEALTH_DRIFT,
            max_telemetry_payload: MAX_TELEMETRY_PAYLOAD,
        }
    }
}

// -------------------- Payload schemas --------------------

#[derive(Debug, Deserialize)]
struct RegisterPayload {
    serial: String,
    mac: String,
    device_type: String,
    #[serde(default)]
    firmware_version: Option<String>,
    #[serde(default)]
    hardware_version: Option<String>,
}

#[derive(Debug, Deserialize)]
struct HealthPayload {
    serial: String,
    mac: String,
    timestamp: String,
    #[serde(default)]
    battery_level: Option<f64>,
    #[serde(default)]
    uptime: Option<u64>,
}

// -------------------- Interceptor --------------------

pub struct Interceptor {
    core: Arc<InterceptorCore>,
    pool: Mutex<WorkerPool>,
}

struct InterceptorCore {
    registry: Arc<Registry>,
    authenticator: Arc<Authenticator>,
    sessions: Arc<dyn SessionControl>,
    telemetry: TelemetryIngest,
    health_drift: Duration,
}

impl Interceptor {
    pub fn new(
        registry: Arc<Registry>,
        authenticator: Arc<Authenticator>,
        sessions: Arc<dyn SessionControl>,
        options: InterceptorOptions,
    ) -> Result<Self> {
        let telemetry =
            TelemetryIngest::with_max_payload(registry.clone(), options.max_telemetry_payload);
        let core = Arc::new(InterceptorCore {
            registry,
            authenticator,
            sessions,
            telemetry,
            health_drift: options.health_drift,
        });
        let pool = WorkerPool::new(options.worker_pool_size)?;
        Ok(Self {
            core,
            pool: Mutex::new(pool),
        })
    }

    /// CONNECT admission. Fast path: registry lookups only.
    pub fn on_connect(&self, event: &ConnectEvent<'_>) -> ConnectDecision {
        match self.core.connect(event) {
            Ok(decision) => decision,
            Err(e) => {
                log::error!("connect handling failed for {}: {}", event.client_id, e);
                self.core.alert_best_effort(
                    AlertType::ConnectionError,
                    None,
                    serde_json::json!({
                        "client_id": event.client_id,
                        "peer_addr": event.peer_addr,
                        "error": e.to_string(),
                    }),
                );
                ConnectDecision::Accept
            }
        }
    }

    /// DISCONNECT: close the session's active connection row. A missing row
    /// is tolerated.
    pub fn on_disconnect(&self, client_id: &str) {
        if let Err(e) = self.core.disconnect(client_id) {
            log::error!("disconnect handling failed for {}: {}", client_id, e);
        }
    }

    /// Published message: enqueue to the worker pool and return immediately.
    /// A saturated queue drops the message with a warning.
    pub fn on_message_published(&self, client_id: &str, topic: &str, payload: &[u8]) {
        let channel = match parse_device_topic(topic) {
            Some(parsed) => parsed.channel,
            None => {
                log::debug!("publish on non-device topic {} ignored", topic);
                return;
            }
        };
        if !matches!(
            channel,
            TopicChannel::Register | TopicChannel::Health | TopicChannel::Telemetry
        ) {
            return;
        }

        let core = self.core.clone();
        let client_id = client_id.to_string();
        let topic = topic.to_string();
        let payload = payload.to_vec();
        let dispatched = {
            let pool = match self.pool.lock() {
                Ok(pool) => pool,
                Err(_) => {
                    log::error!("worker pool lock poisoned; dropping publish on {}", topic);
                    return;
                }
            };
            let topic_for_worker = topic.clone();
            pool.dispatch(Box::new(move || {
                core.publish(&client_id, &topic_for_worker, &payload);
            }))
        };
        if !dispatched {
            log::warn!("worker pool saturated; dropping publish on {}", topic);
        }
    }

    /// Synchronous publish processing; same recognizers the worker pool runs.
    pub fn process_publish(&self, client_id: &str, topic: &str, payload: &[u8]) {
        self.core.publish(client_id, topic, payload);
    }

    /// Drain the worker pool. Idempotent; used by broker stop.
    pub fn shutdown(&self) {
        if let Ok(mut pool) = self.pool.lock() {
            pool.shutdown();
        }
    }
}

impl InterceptorCore {
    fn connect(&self, event: &ConnectEvent<'_>) -> Result<ConnectDecision> {
        let device_client_id = match identity::classify_client_id(event.client_id) {
            ClientClass::Controller | ClientClass::Admin => {
                log::info!("{} connected from {}", event.client_id, event.peer_addr);
                return Ok(ConnectDecision::Accept);
            }
            ClientClass::Unauthenticated => {
                // Holds a trusted cert but no role; may connect, gets no ACL
                // rights.
                log::info!(
                    "unrecognized client {} connected from {}",
                    event.client_id,
                    event.peer_addr
                );
                return Ok(ConnectDecision::Accept);
            }
            ClientClass::MalformedDevice => {
                self.registry.insert_alert(
                    AlertType::MalformedClientId,
                    None,
                    &serde_json::json!({
                        "client_id": event.client_id,
                        "peer_addr": event.peer_addr,
                    }),
                )?;
                log::warn!(
                    "rejecting malformed device clientId {} from {}",
                    event.client_id,
                    event.peer_addr
                );
                return Ok(ConnectDecision::Reject);
            }
            ClientClass::Device(id) => id,
        };

        let serial = device_client_id.nominal_serial();
        let device = self
            .registry
            .find_by_serial_hash(&identity::hash(&serial))?;

        let Some(device) = device else {
            // Unknown device: admit, and pre-create the connection row so the
            // one-active-connection invariant holds from the first moment.
            // Registration will bind the device id once the MAC is confirmed.
            self.registry.create_connection(&NewConnection {
                device_id: None,
                client_id: event.client_id.to_string(),
                peer_addr: event.peer_addr.to_string(),
                client_info: event.client_info.map(|s| s.to_string()),
            })?;
            log::info!(
                "unknown device {} connected from {}; awaiting registration",
                event.client_id,
                event.peer_addr
            );
            return Ok(ConnectDecision::Accept);
        };

        if device.status == DeviceStatus::Blocked {
            log::warn!(
                "blocked device {} connected from {}; ACL will deny all actions",
                event.client_id,
                event.peer_addr
            );
            return Ok(ConnectDecision::Accept);
        }

        if let Some(existing) = self.registry.find_active_by_device_id(device.id)? {
            let resolution =
                self.authenticator
                    .handle_duplicate(&device, &existing, event.peer_addr)?;
            if let Some(close_id) = &resolution.close_client_id {
                self.sessions.close_session(close_id);
            }
            if !resolution.verdict.admit_new() {
                return Ok(ConnectDecision::Reject);
            }
        }

        self.registry.create_connection(&NewConnection {
            device_id: Some(device.id),
            client_id: event.client_id.to_string(),
            peer_addr: event.peer_addr.to_string(),
            client_info: event.client_info.map(|s| s.to_string()),
        })?;
        log::info!(
            "device {} ({}) connected from {}",
            device.id,
            event.client_id,
            event.peer_addr
        );
        Ok(ConnectDecision::Accept)
    }

    fn disconnect(&self, client_id: &str) -> Result<()> {
        match self.registry.find_active_by_client_id(client_id)? {
            Some(connection) => {
                self.registry.close_connection(connection.id)?;
                log::info!("client {} disconnected", client_id);
            }
            None => {
                log::info!("disconnect for {} with no active connection row", client_id);
            }
        }
        Ok(())
    }

    fn publish(&self, client_id: &str, topic: &str, payload: &[u8]) {
        let Some(parsed) = parse_device_topic(topic) else {
            return;
        };
        let serial = parsed.serial.to_string();
        let result = match parsed.channel {
            TopicChannel::Register => self.register(client_id, &serial, payload),
            TopicChannel::Health => self.health(&serial, payload),
            TopicChannel::Telemetry => self.telemetry.ingest(topic, payload).map(|_| ()),
            TopicChannel::Cmd | TopicChannel::Offline => Ok(()),
        };
        if let Err(e) = result {
            log::error!("publish handling failed on {}: {}", topic, e);
        }
    }

    // -------------------- Registration --------------------

    fn register(&self, client_id: &str, topic_serial: &str, payload: &[u8]) -> Result<()> {
        let parsed: RegisterPayload = match serde_json::from_slice(payload) {
            Ok(parsed) => parsed,
            Err(e) => {
                self.registry.insert_alert(
                    AlertType::RegistrationError,
                    Some(&identity::hash(topic_serial)),
                    &serde_json::json!({ "error": format!("invalid payload: {}", e) }),
                )?;
                return Ok(());
            }
        };

        let device_type = match DeviceType::parse(&parsed.device_type) {
            Ok(device_type) => device_type,
            Err(e) => {
                self.registry.insert_alert(
                    AlertType::RegistrationError,
                    Some(&identity::hash(&parsed.serial)),
                    &serde_json::json!({ "error": e.to_string() }),
                )?;
                return Ok(());
            }
        };

        let mac = match identity::normalize_mac(&parsed.mac) {
            Ok(mac) => mac,
            Err(_) => {
                self.registry.insert_alert(
                    AlertType::InvalidMacFormat,
                    Some(&identity::hash(&parsed.serial)),
                    &serde_json::json!({ "mac": parsed.mac }),
                )?;
                return Ok(());
            }
        };

        if parsed.serial != topic_serial {
            log::warn!(
                "registration payload serial differs from topic serial ({} vs {})",
                parsed.serial,
                topic_serial
            );
        }

        let serial_hash = identity::hash(&parsed.serial);
        let composite_hash = identity::hash_composite(&parsed.serial, &mac);

        let (device, inserted) = match self.registry.find_by_composite_hash(&composite_hash)? {
            Some(existing) => {
                // Known identity: refresh metadata, never touch status.
                self.registry.update_device_metadata(
                    existing.id,
                    device_type,
                    parsed.firmware_version.as_deref(),
                    parsed.hardware_version.as_deref(),
                )?;
                (existing, false)
            }
            None => {
                // A pre-seeded APPROVED row for the same serial auto-approves
                // the newcomer.
                let initial_status = match self.registry.find_by_serial_hash(&serial_hash)? {
                    Some(seed) if seed.status == DeviceStatus::Approved => DeviceStatus::Approved,
                    _ => DeviceStatus::Pending,
                };
                self.registry.upsert_device_if_absent(&NewDevice {
                    device_type,
                    serial_hash: serial_hash.clone(),
                    mac_hash: identity::hash(&mac),
                    composite_hash,
                    status: initial_status,
                    is_critical: false,
                    firmware_version: parsed.firmware_version.clone(),
                    hardware_version: parsed.hardware_version.clone(),
                })?
            }
        };

        self.bind_session(client_id, device.id, &parsed.serial, &mac)?;

        self.registry.insert_alert(
            AlertType::DeviceRegistration,
            Some(&device.serial_hash),
            &serde_json::json!({
                "device_type": device_type.as_str(),
                "status": device.status.as_str(),
                "new_device": inserted,
            }),
        )?;
        log::info!(
            "device {} registered (type={}, status={}, new={})",
            device.id,
            device_type,
            device.status,
            inserted
        );
        Ok(())
    }

    /// Bind the session's pre-created connection row to the registered device,
    /// after confirming the MAC against the clientId-encoded prefix.
    fn bind_session(&self, client_id: &str, device_id: i64, serial: &str, mac: &str) -> Result<()> {
        let Some(connection) = self.registry.find_active_by_client_id(client_id)? else {
            return Ok(());
        };
        if connection.device_id == Some(device_id) {
            return Ok(());
        }

        if let ClientClass::Device(encoded) = identity::classify_client_id(client_id) {
            let claimed_prefix = identity::mac_client_prefix(mac)?;
            if encoded.mac_prefix != claimed_prefix {
                self.registry.detach_connection_device(connection.id)?;
                self.registry.insert_alert(
                    AlertType::MacMismatch,
                    Some(&identity::hash(serial)),
                    &serde_json::json!({
                        "client_id": client_id,
                        "expected_prefix": encoded.mac_prefix,
                        "registered_prefix": claimed_prefix,
                    }),
                )?;
                log::warn!(
                    "registration MAC does not match clientId {}; connection detached",
                    client_id
                );
                return Ok(());
            }
        }

        self.registry.bind_connection_device(connection.id, device_id)?;
        Ok(())
    }

    // -------------------- Health --------------------

    fn health(&self, topic_serial: &str, payload: &[u8]) -> Result<()> {
        let parsed: HealthPayload = match serde_json::from_slice(payload) {
            Ok(parsed) => parsed,
            Err(e) => {
                self.registry.insert_alert(
                    AlertType::HealthCheckError,
                    Some(&identity::hash(topic_serial)),
                    &serde_json::json!({ "error": format!("invalid payload: {}", e) }),
                )?;
                return Ok(());
            }
        };

        let mac = match identity::normalize_mac(&parsed.mac) {
            Ok(mac) => mac,
            Err(_) => {
                self.registry.insert_alert(
                    AlertType::InvalidMacFormat,
                    Some(&identity::hash(&parsed.serial)),
                    &serde_json::json!({ "mac": parsed.mac }),
                )?;
                return Ok(());
            }
        };

        let serial_hash = identity::hash(&parsed.serial);
        let Some(device) = self.registry.find_by_serial_hash(&serial_hash)? else {
            self.registry.insert_alert(
                AlertType::DeviceNotFound,
                Some(&serial_hash),
                &serde_json::json!({ "context": "health" }),
            )?;
            return Ok(());
        };

        if identity::hash(&mac) != device.mac_hash {
            self.registry.insert_alert(
                AlertType::MacMismatch,
                Some(&serial_hash),
                &serde_json::json!({ "context": "health" }),
            )?;
            return Ok(());
        }

        match parse_device_timestamp(&parsed.timestamp) {
            Some(reported) => {
                let now = now_s()? as i64;
                let skew = (now - reported.unix_timestamp()).unsigned_abs();
                if skew > self.health_drift.as_secs() {
                    self.registry.insert_alert(
                        AlertType::TimeDrift,
                        Some(&serial_hash),
                        &serde_json::json!({
                            "reported": parsed.timestamp,
                            "skew_seconds": skew,
                        }),
                    )?;
                }
            }
            None => {
                self.registry.insert_alert(
                    AlertType::InvalidTimestamp,
                    Some(&serial_hash),
                    &serde_json::json!({ "timestamp": parsed.timestamp }),
                )?;
            }
        }

        if device.status == DeviceStatus::Blocked {
            self.registry.insert_alert(
                AlertType::HealthCheckRejectedBlocked,
                Some(&serial_hash),
                &serde_json::json!({}),
            )?;
            return Ok(());
        }

        if self.registry.find_active_by_device_id(device.id)?.is_none() {
            self.registry.insert_alert(
                AlertType::HealthCheckRejectedNoConnection,
                Some(&serial_hash),
                &serde_json::json!({}),
            )?;
            return Ok(());
        }

        if device.status == DeviceStatus::Approved {
            self.registry.update_last_health_check(device.id)?;
            log::debug!(
                "health recorded for device {} (battery={:?}, uptime={:?})",
                device.id,
                parsed.battery_level,
                parsed.uptime
            );
        } else {
            log::debug!(
                "health from device {} in status {} ignored",
                device.id,
                device.status
            );
        }
        Ok(())
    }

    fn alert_best_effort(
        &self,
        alert: AlertType,
        serial_hash: Option<&str>,
        details: serde_json::Value,
    ) {
        if let Err(e) = self.registry.insert_alert(alert, serial_hash, &details) {
            log::error!("failed to record {} alert: {}", alert, e);
        }
    }
}

// -------------------- Worker pool --------------------

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Fixed-size thread pool over a bounded queue. `dispatch` never blocks; a
/// full queue is reported to the caller.
struct WorkerPool {
    tx: Option<mpsc::SyncSender<Job>>,
    handles: Vec<thread::JoinHandle<()>>,
}

impl WorkerPool {
    fn new(workers: usize) -> Result<Self> {
        let workers = workers.max(1);
        let (tx, rx) = mpsc::sync_channel::<Job>(workers * 8);
        let rx = Arc::new(Mutex::new(rx));
        let mut handles = Vec::with_capacity(workers);
        for i in 0..workers {
            let rx = rx.clone();
            let handle = thread::Builder::new()
                .name(format!("hub-publish-{}", i))
                .spawn(move || loop {
                    let job = {
                        let Ok(rx) = rx.lock() else { break };
                        rx.recv()
                    };
                    match job {
                        Ok(job) => job(),
                        Err(_) => break,
                    }
                })?;
            handles.push(handle);
        }
        Ok(Self {
            tx: Some(tx),
            handles,
        })
    }

    fn dispatch(&self, job: Job) -> bool {
        let Some(tx) = &self.tx else { return false };
        match tx.try_send(job) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => false,
        }
    }

    fn shutdown(&mut self) {
        self.tx = None;
        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn worker_pool_runs_jobs_and_drains_on_shutdown() {
        let mut pool = WorkerPool::new(2).unwrap();
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..20 {
            loop {
                let counter = counter.clone();
                let dispatched = pool.dispatch(Box::new(move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                }));
                if dispatched {
                    break;
                }
                thread::yield_now();
            }
        }
        pool.shutdown();
        assert_eq!(counter.load(Ordering::SeqCst), 20);
    }

    #[test]
    fn worker_pool_reports_saturation_instead_of_blocking() {
        let mut pool = WorkerPool::new(1).unwrap();
        let gate = Arc::new(Mutex::new(()));
        let held = gate.lock().unwrap();
        // First job parks the only worker on the gate.
        let blocker = gate.clone();
        assert!(pool.dispatch(Box::new(move || {
            drop(blocker.lock());
        })));

        // Fill the queue; eventually dispatch must refuse rather than block.
        let mut refused = false;
        for _ in 0..1000 {
            if !pool.dispatch(Box::new(|| {})) {
                refused = true;
                break;
            }
        }
        assert!(refused);
        drop(held);
        pool.shutdown();
    }
}
