//! Device-side MQTT client SDK.
//!
//! What an IoT endpoint does: open a mutually-authenticated TLS session with
//! a last-will on its offline topic, register itself, run a periodic health
//! loop, publish telemetry at a QoS matched to its class, and listen for
//! commands on its own command topic.
//!
//! The controller-side command publisher lives here too; it is the only
//! client allowed to write the `/cmd` channel.

use anyhow::{anyhow, Context, Result};
use rumqttc::{Client, Connection, Event, LastWill, MqttOptions, Packet, QoS, Transport};
use serde::Serialize;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

use crate::authorizator::{device_topic, TopicChannel};
use crate::identity;
use crate::DeviceType;

pub const DEFAULT_HEALTH_INTERVAL: Duration = Duration::from_secs(60);
const DEFAULT_KEEP_ALIVE: Duration = Duration::from_secs(30);

/// PEM key material for the device's mTLS session.
#[derive(Clone)]
pub struct DeviceTlsMaterials {
    pub ca: Vec<u8>,
    pub client_cert: Vec<u8>,
    pub client_key: Vec<u8>,
}

impl DeviceTlsMaterials {
    pub fn load(ca: &Path, client_cert: &Path, client_key: &Path) -> Result<Self> {
        Ok(Self {
            ca: std::fs::read(ca)
                .with_context(|| format!("failed to read CA file {}", ca.display()))?,
            client_cert: std::fs::read(client_cert)
                .with_context(|| format!("failed to read client cert {}", client_cert.display()))?,
            client_key: std::fs::read(client_key)
                .with_context(|| format!("failed to read client key {}", client_key.display()))?,
        })
    }
}

#[derive(Clone)]
pub struct DeviceClientConfig {
    pub broker_host: String,
    pub broker_port: u16,
    pub controller_id: String,
    pub serial: String,
    pub mac: String,
    pub device_type: DeviceType,
    pub firmware_version: Option<String>,
    pub hardware_version: Option<String>,
    pub health_interval: Duration,
    pub tls: DeviceTlsMaterials,
}

impl DeviceClientConfig {
    pub fn client_id(&self) -> Result<String> {
        identity::derive_client_id(&self.serial, &self.mac)
    }
}

#[derive(Serialize)]
struct RegisterMessage<'a> {
    serial: &'a str,
    mac: &'a str,
    device_type: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    firmware_version: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    hardware_version: Option<&'a str>,
}

#[derive(Serialize)]
struct HealthMessage<'a> {
    serial: &'a str,
    mac: &'a str,
    timestamp: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    battery_level: Option<f64>,
    uptime: u64,
}

#[derive(Serialize)]
struct WillMessage<'a> {
    serial: &'a str,
    reason: &'a str,
}

fn rfc3339_now() -> Result<String> {
    OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .map_err(|e| anyhow!("failed to format timestamp: {}", e))
}

struct HealthLoop {
    shutdown_tx: mpsc::Sender<()>,
    handle: thread::JoinHandle<()>,
}

/// A connected device session. Dropping without `close()` leaves the broker
/// to fire the last-will.
pub struct DeviceClient {
    config: DeviceClientConfig,
    client: Client,
    stop: Arc<AtomicBool>,
    event_loop: Option<thread::JoinHandle<()>>,
    health: Option<HealthLoop>,
    started_at: Instant,
    telemetry_topic: String,
}

impl DeviceClient {
    /// Open the session and subscribe to the command topic. `on_command` is
    /// invoked from the connection thread for every command payload.
    pub fn connect(
        config: DeviceClientConfig,
        on_command: impl Fn(&[u8]) + Send + 'static,
    ) -> Result<Self> {
        let client_id = config.client_id()?;
        let offline_topic =
            device_topic(&config.controller_id, &config.serial, TopicChannel::Offline);
        let cmd_topic = device_topic(&config.controller_id, &config.serial, TopicChannel::Cmd);
        let telemetry_topic =
            device_topic(&config.controller_id, &config.serial, TopicChannel::Telemetry);

        let will_payload = serde_json::to_vec(&WillMessage {
            serial: &config.serial,
            reason: "connection_lost",
        })?;

        let mut options = MqttOptions::new(&client_id, &config.broker_host, config.broker_port);
        options.set_keep_alive(DEFAULT_KEEP_ALIVE);
        options.set_clean_session(true);
        options.set_last_will(LastWill::new(
            &offline_topic,
            will_payload,
            QoS::AtLeastOnce,
            false,
        ));
        options.set_transport(Transport::tls(
            config.tls.ca.clone(),
            Some((config.tls.client_cert.clone(), config.tls.client_key.clone())),
            None,
        ));

        let (client, connection) = Client::new(options, 10);
        let stop = Arc::new(AtomicBool::new(false));
        let event_loop = Some(spawn_event_loop(
            connection,
            client_id.clone(),
            cmd_topic.clone(),
            stop.clone(),
            on_command,
        ));

        client.subscribe(&cmd_topic, QoS::ExactlyOnce)?;
        log::info!(
            "device {} connected to {}:{} as {}",
            config.serial,
            config.broker_host,
            config.broker_port,
            client_id
        );

        Ok(Self {
            config,
            client,
            stop,
            event_loop,
            health: None,
            started_at: Instant::now(),
            telemetry_topic,
        })
    }

    /// Publish the registration message (QoS 1).
    pub fn register(&self) -> Result<()> {
        let topic = device_topic(
            &self.config.controller_id,
            &self.config.serial,
            TopicChannel::Register,
        );
        let payload = serde_json::to_vec(&RegisterMessage {
            serial: &self.config.serial,
            mac: &self.config.mac,
            device_type: self.config.device_type.as_str(),
            firmware_version: self.config.firmware_version.as_deref(),
            hardware_version: self.config.hardware_version.as_deref(),
        })?;
        self.client
            .publish(&topic, QoS::AtLeastOnce, false, payload)?;
        Ok(())
    }

    /// Start the periodic health loop (QoS 1). Idempotent.
    pub fn start_health_loop(&mut self) -> Result<()> {
        if self.health.is_some() {
            return Ok(());
        }
        let (shutdown_tx, shutdown_rx) = mpsc::channel();
        let client = self.client.clone();
        let topic = device_topic(
            &self.config.controller_id,
            &self.config.serial,
            TopicChannel::Health,
        );
        let serial = self.config.serial.clone();
        let mac = self.config.mac.clone();
        let interval = self.config.health_interval;
        let started_at = self.started_at;

        let handle = thread::Builder::new()
            .name(format!("health-{}", serial))
            .spawn(move || loop {
                match shutdown_rx.recv_timeout(interval) {
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    Err(RecvTimeoutError::Timeout) => {}
                }
                let message = match rfc3339_now() {
                    Ok(timestamp) => HealthMessage {
                        serial: &serial,
                        mac: &mac,
                        timestamp,
                        battery_level: None,
                        uptime: started_at.elapsed().as_secs(),
                    },
                    Err(e) => {
                        log::warn!("health timestamp unavailable: {}", e);
                        continue;
                    }
                };
                let payload = match serde_json::to_vec(&message) {
                    Ok(payload) => payload,
                    Err(e) => {
                        log::warn!("health serialization failed: {}", e);
                        continue;
                    }
                };
                if let Err(e) = client.publish(&topic, QoS::AtLeastOnce, false, payload) {
                    log::warn!("health publish failed: {}", e);
                }
            })?;
        self.health = Some(HealthLoop {
            shutdown_tx,
            handle,
        });
        Ok(())
    }

    /// Publish telemetry: QoS 0 for sensors, QoS 1 for actuators.
    pub fn publish_telemetry(&self, payload: &[u8]) -> Result<()> {
        let qos = if self.config.device_type.is_actuator() {
            QoS::AtLeastOnce
        } else {
            QoS::AtMostOnce
        };
        self.client
            .publish(&self.telemetry_topic, qos, false, payload.to_vec())?;
        Ok(())
    }

    /// Release the health timer and disconnect cleanly.
    pub fn close(mut self) -> Result<()> {
        if let Some(health) = self.health.take() {
            let _ = health.shutdown_tx.send(());
            let _ = health.handle.join();
        }
        self.stop.store(true, Ordering::SeqCst);
        self.client.disconnect()?;
        if let Some(handle) = self.event_loop.take() {
            let _ = handle.join();
        }
        log::info!("device {} disconnected", self.config.serial);
        Ok(())
    }
}

fn spawn_event_loop(
    mut connection: Connection,
    client_id: String,
    cmd_topic: String,
    stop: Arc<AtomicBool>,
    on_command: impl Fn(&[u8]) + Send + 'static,
) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        // Iterating the connection drives keep-alive and reconnects; errors
        // surface here and the next poll re-dials.
        for event in connection.iter() {
            if stop.load(Ordering::SeqCst) {
                break;
            }
            match event {
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    if publish.topic == cmd_topic {
                        on_command(&publish.payload);
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    if stop.load(Ordering::SeqCst) {
                        break;
                    }
                    log::warn!("mqtt connection error for {}: {}", client_id, e);
                    thread::sleep(Duration::from_secs(1));
                }
            }
        }
    })
}

// -------------------- Controller side --------------------

/// The single command publisher, clientId `controller-cmd`. Commands go out
/// at QoS 2.
pub struct ControllerClient {
    controller_id: String,
    client: Client,
    stop: Arc<AtomicBool>,
    event_loop: Option<thread::JoinHandle<()>>,
}

impl ControllerClient {
    pub fn connect(
        broker_host: &str,
        broker_port: u16,
        controller_id: &str,
        tls: DeviceTlsMaterials,
    ) -> Result<Self> {
        let mut options = MqttOptions::new(identity::CONTROLLER_CLIENT_ID, broker_host, broker_port);
        options.set_keep_alive(DEFAULT_KEEP_ALIVE);
        options.set_clean_session(true);
        options.set_transport(Transport::tls(
            tls.ca,
            Some((tls.client_cert, tls.client_key)),
            None,
        ));

        let (client, mut connection) = Client::new(options, 10);
        let stop = Arc::new(AtomicBool::new(false));
        let thread_stop = stop.clone();
        let event_loop = Some(thread::spawn(move || {
            for event in connection.iter() {
                if thread_stop.load(Ordering::SeqCst) {
                    break;
                }
                if let Err(e) = event {
                    if thread_stop.load(Ordering::SeqCst) {
                        break;
                    }
                    log::warn!("controller mqtt connection error: {}", e);
                    thread::sleep(Duration::from_secs(1));
                }
            }
        }));

        Ok(Self {
            controller_id: controller_id.to_string(),
            client,
            stop,
            event_loop,
        })
    }

    pub fn publish_command(&self, serial: &str, payload: &[u8]) -> Result<()> {
        let topic = device_topic(&self.controller_id, serial, TopicChannel::Cmd);
        self.client
            .publish(&topic, QoS::ExactlyOnce, false, payload.to_vec())?;
        Ok(())
    }

    pub fn close(mut self) -> Result<()> {
        self.stop.store(true, Ordering::SeqCst);
        self.client.disconnect()?;
        if let Some(handle) = self.event_loop.take() {
            let _ = handle.join();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_message_matches_wire_schema() {
        let message = RegisterMessage {
            serial: "IOT-2025-0001",
            mac: "AA:BB:CC:DD:EE:FF",
            device_type: "TEMP_SENSOR",
            firmware_version: Some("1.2.0"),
            hardware_version: None,
        };
        let json: serde_json::Value =
            serde_json::from_slice(&serde_json::to_vec(&message).unwrap()).unwrap();
        assert_eq!(json["serial"], "IOT-2025-0001");
        assert_eq!(json["mac"], "AA:BB:CC:DD:EE:FF");
        assert_eq!(json["device_type"], "TEMP_SENSOR");
        assert_eq!(json["firmware_version"], "1.2.0");
        assert!(json.get("hardware_version").is_none());
    }

    #[test]
    fn health_message_carries_timestamp_and_uptime() {
        let message = HealthMessage {
            serial: "IOT-2025-0001",
            mac: "AA:BB:CC:DD:EE:FF",
            timestamp: "2025-01-01T00:00:00Z".to_string(),
            battery_level: Some(87.0),
            uptime: 12345,
        };
        let json: serde_json::Value =
            serde_json::from_slice(&serde_json::to_vec(&message).unwrap()).unwrap();
        assert_eq!(json["timestamp"], "2025-01-01T00:00:00Z");
        assert_eq!(json["battery_level"], 87.0);
        assert_eq!(json["uptime"], 12345);
    }

    #[test]
    fn will_message_names_the_lost_connection() {
        let payload = serde_json::to_vec(&WillMessage {
            serial: "IOT-2025-0001",
            reason: "connection_lost",
        })
        .unwrap();
        let json: serde_json::Value = serde_json::from_slice(&payload).unwrap();
        assert_eq!(json["serial"], "IOT-2025-0001");
        assert_eq!(json["reason"], "connection_lost");
    }

    #[test]
    fn client_id_derivation_uses_serial_and_mac() {
        let config = DeviceClientConfig {
            broker_host: "hub.local".to_string(),
            broker_port: 8884,
            controller_id: "controller-01".to_string(),
            serial: "IOT-2025-0001".to_string(),
            mac: "AA:BB:CC:DD:EE:FF".to_string(),
            device_type: DeviceType::TempSensor,
            firmware_version: None,
            hardware_version: None,
            health_interval: DEFAULT_HEALTH_INTERVAL,
            tls: DeviceTlsMaterials {
                ca: Vec::new(),
                client_cert: Vec::new(),
                client_key: Vec::new(),
            },
        };
        assert_eq!(config.client_id().unwrap(), "IOT0001AABBCC");
    }

    #[test]
    fn timestamp_parses_back_as_rfc3339() {
        let raw = rfc3339_now().unwrap();
        assert!(OffsetDateTime::parse(&raw, &Rfc3339).is_ok());
    }
}
