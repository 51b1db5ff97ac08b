//! hub-sentinel
//!
//! Security-enforcement core for a small IoT home-automation hub.
//!
//! # Architecture
//!
//! Every device connection and message is mediated by this crate:
//!
//! 1. **mTLS gate**: the broker's only listener requires a client certificate
//!    anchored in the hub trust material (`tls`).
//! 2. **Identity registry**: devices are keyed by a SHA-256 composite of
//!    serial and MAC; plaintext identifiers are never stored (`registry`).
//! 3. **Topic ACL**: devices may only touch their own topics; the command
//!    channel is writable by the controller alone (`authorizator`).
//! 4. **Clone detection**: duplicate connections are resolved per device
//!    criticality (`authenticator`).
//! 5. **Durable capture**: telemetry, health and every security decision land
//!    in the store as immutable rows (`telemetry`, alerts).
//!
//! # Module Structure
//!
//! - `identity`: hashing and clientId grammar
//! - `registry`: SQLite store for devices, connections, alerts, telemetry
//! - `authenticator`: validation outcomes, status transitions, clone policy
//! - `authorizator`: per-publish/per-subscribe topic ACL
//! - `interceptor`: broker event handlers and the bounded worker pool
//! - `monitor`: periodic offline detection
//! - `broker`: lifecycle and certificate-material rotation
//! - `device`: device-side MQTT client SDK

use anyhow::{anyhow, Result};
use rand::RngCore;
use rusqlite::{Connection, OpenFlags};
use std::time::{SystemTime, UNIX_EPOCH};

pub mod authenticator;
pub mod authorizator;
pub mod broker;
pub mod config;
pub mod device;
pub mod identity;
pub mod interceptor;
pub mod monitor;
pub mod pairing;
pub mod registry;
pub mod telemetry;
pub mod tls;

pub use authenticator::{Authenticator, CloneVerdict, ValidationOutcome};
pub use authorizator::{parse_device_topic, Authorizator, DeviceTopic, TopicChannel};
pub use broker::{Broker, BrokerEngine, CertRotationService, InProcessEngine};
pub use config::HubConfig;
pub use device::{ControllerClient, DeviceClient, DeviceClientConfig};
pub use identity::{classify_client_id, derive_client_id, ClientClass, DeviceClientId};
pub use interceptor::{ConnectDecision, ConnectEvent, Interceptor, SessionControl};
pub use monitor::HealthMonitor;
pub use registry::{Device, DeviceConnection, Registry, SecurityAlert, TelemetryRecord};
pub use telemetry::TelemetryIngest;
pub use tls::{build_server_context, ServerTlsContext, TlsPaths};

pub fn shared_memory_uri() -> String {
    let mut bytes = [0u8; 8];
    rand::thread_rng().fill_bytes(&mut bytes);
    format!(
        "file:hub_sentinel_{:x}?mode=memory&cache=shared",
        u64::from_le_bytes(bytes)
    )
}

pub(crate) fn open_db_connection(db_path: &str) -> Result<Connection> {
    let conn = if db_path.starts_with("file:") {
        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_URI;
        Connection::open_with_flags(db_path, flags)?
    } else {
        Connection::open(db_path)?
    };
    Ok(conn)
}

pub(crate) fn now_s() -> Result<u64> {
    Ok(SystemTime::now().duration_since(UNIX_EPOCH)?.as_secs())
}

// -------------------- Device Status --------------------

/// Lifecycle state of a registered device.
///
/// Transitions are exactly the edges checked by [`DeviceStatus::can_transition`];
/// the store refuses anything else. `Blocked` is reached automatically only by
/// clone detection; leaving it requires an admin unblock.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DeviceStatus {
    Pending,
    Approved,
    Rejected,
    Blocked,
}

impl DeviceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Approved => "APPROVED",
            Self::Rejected => "REJECTED",
            Self::Blocked => "BLOCKED",
        }
    }

    pub fn parse(raw: &str) -> Result<Self> {
        match raw {
            "PENDING" => Ok(Self::Pending),
            "APPROVED" => Ok(Self::Approved),
            "REJECTED" => Ok(Self::Rejected),
            "BLOCKED" => Ok(Self::Blocked),
            other => Err(anyhow!("unknown device status '{}'", other)),
        }
    }

    /// Legal edges of the device state machine.
    pub fn can_transition(from: Self, to: Self) -> bool {
        matches!(
            (from, to),
            (Self::Pending, Self::Approved)
                | (Self::Pending, Self::Rejected)
                | (Self::Approved, Self::Rejected)
                | (Self::Approved, Self::Blocked)
                | (Self::Blocked, Self::Approved)
        )
    }
}

impl std::fmt::Display for DeviceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// -------------------- Device Type --------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DeviceType {
    TempSensor,
    SmartPlug,
    EnergySensor,
    SmartSwitch,
}

impl DeviceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TempSensor => "TEMP_SENSOR",
            Self::SmartPlug => "SMART_PLUG",
            Self::EnergySensor => "ENERGY_SENSOR",
            Self::SmartSwitch => "SMART_SWITCH",
        }
    }

    pub fn parse(raw: &str) -> Result<Self> {
        match raw {
            "TEMP_SENSOR" => Ok(Self::TempSensor),
            "SMART_PLUG" => Ok(Self::SmartPlug),
            "ENERGY_SENSOR" => Ok(Self::EnergySensor),
            "SMART_SWITCH" => Ok(Self::SmartSwitch),
            other => Err(anyhow!("unknown device type '{}'", other)),
        }
    }

    /// Actuators get QoS 1 telemetry; plain sensors QoS 0.
    pub fn is_actuator(&self) -> bool {
        matches!(self, Self::SmartPlug | Self::SmartSwitch)
    }
}

impl std::fmt::Display for DeviceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// -------------------- Alert Types --------------------

/// Tags for append-only security alert rows.
///
/// Variants are used internally; the store persists the stable string tag.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum AlertType {
    DeviceRegistration,
    RegistrationError,
    HealthCheckError,
    InvalidMacFormat,
    DeviceNotFound,
    MacMismatch,
    TimeDrift,
    InvalidTimestamp,
    HealthCheckRejectedBlocked,
    HealthCheckRejectedNoConnection,
    ConnectionError,
    MalformedClientId,
    DeviceReconnection,
    CriticalDeviceCloneAttempt,
    DeviceCloneDetected,
    DeviceOffline,
    DeviceApproved,
    DeviceRejected,
    DeviceUnblocked,
    MarkedCritical,
    AclDeviceCmdPublish,
    AclWildcardSubscribe,
    AclSerialMismatch,
    AclUnapprovedPublish,
}

impl AlertType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::DeviceRegistration => "DEVICE_REGISTRATION",
            Self::RegistrationError => "REGISTRATION_ERROR",
            Self::HealthCheckError => "HEALTH_CHECK_ERROR",
            Self::InvalidMacFormat => "INVALID_MAC_FORMAT",
            Self::DeviceNotFound => "DEVICE_NOT_FOUND",
            Self::MacMismatch => "MAC_MISMATCH",
            Self::TimeDrift => "TIME_DRIFT",
            Self::InvalidTimestamp => "INVALID_TIMESTAMP",
            Self::HealthCheckRejectedBlocked => "HEALTH_CHECK_REJECTED_BLOCKED",
            Self::HealthCheckRejectedNoConnection => "HEALTH_CHECK_REJECTED_NO_CONNECTION",
            Self::ConnectionError => "CONNECTION_ERROR",
            Self::MalformedClientId => "MALFORMED_CLIENT_ID",
            Self::DeviceReconnection => "DEVICE_RECONNECTION",
            Self::CriticalDeviceCloneAttempt => "CRITICAL_DEVICE_CLONE_ATTEMPT",
            Self::DeviceCloneDetected => "DEVICE_CLONE_DETECTED",
            Self::DeviceOffline => "DEVICE_OFFLINE",
            Self::DeviceApproved => "DEVICE_APPROVED",
            Self::DeviceRejected => "DEVICE_REJECTED",
            Self::DeviceUnblocked => "DEVICE_UNBLOCKED",
            Self::MarkedCritical => "MARKED_CRITICAL",
            Self::AclDeviceCmdPublish => "ACL_DEVICE_CMD_PUBLISH",
            Self::AclWildcardSubscribe => "ACL_WILDCARD_SUBSCRIBE",
            Self::AclSerialMismatch => "ACL_SERIAL_MISMATCH",
            Self::AclUnapprovedPublish => "ACL_UNAPPROVED_PUBLISH",
        }
    }
}

impl std::fmt::Display for AlertType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trips_through_strings() {
        for status in [
            DeviceStatus::Pending,
            DeviceStatus::Approved,
            DeviceStatus::Rejected,
            DeviceStatus::Blocked,
        ] {
            assert_eq!(DeviceStatus::parse(status.as_str()).unwrap(), status);
        }
        assert!(DeviceStatus::parse("OFFLINE").is_err());
    }

    #[test]
    fn fsm_accepts_only_specified_edges() {
        use DeviceStatus::*;
        assert!(DeviceStatus::can_transition(Pending, Approved));
        assert!(DeviceStatus::can_transition(Pending, Rejected));
        assert!(DeviceStatus::can_transition(Approved, Rejected));
        assert!(DeviceStatus::can_transition(Approved, Blocked));
        assert!(DeviceStatus::can_transition(Blocked, Approved));

        assert!(!DeviceStatus::can_transition(Rejected, Approved));
        assert!(!DeviceStatus::can_transition(Rejected, Pending));
        assert!(!DeviceStatus::can_transition(Blocked, Pending));
        assert!(!DeviceStatus::can_transition(Pending, Blocked));
        assert!(!DeviceStatus::can_transition(Approved, Approved));
    }

    #[test]
    fn device_type_parse_rejects_unknown() {
        assert_eq!(
            DeviceType::parse("TEMP_SENSOR").unwrap(),
            DeviceType::TempSensor
        );
        assert!(DeviceType::parse("temp_sensor").is_err());
        assert!(DeviceType::parse("CAMERA").is_err());
    }

    #[test]
    fn actuators_are_plugs_and_switches() {
        assert!(DeviceType::SmartPlug.is_actuator());
        assert!(DeviceType::SmartSwitch.is_actuator());
        assert!(!DeviceType::TempSensor.is_actuator());
        assert!(!DeviceType::EnergySensor.is_actuator());
    }
}
