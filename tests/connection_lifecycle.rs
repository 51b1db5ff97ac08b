//! End-to-end connection and registration flow: CONNECT admission, the
//! pre-created connection row, registration binding, and disconnect.

use std::sync::{Arc, Mutex};

use hub_sentinel::identity;
use hub_sentinel::interceptor::{ConnectDecision, ConnectEvent, InterceptorOptions, SessionControl};
use hub_sentinel::registry::NewDevice;
use hub_sentinel::{AlertType, Authenticator, Authorizator, DeviceStatus, DeviceType, Interceptor, Registry};

struct RecordingSessions(Mutex<Vec<String>>);

impl SessionControl for RecordingSessions {
    fn close_session(&self, client_id: &str) {
        self.0.lock().unwrap().push(client_id.to_string());
    }
}

struct Harness {
    registry: Arc<Registry>,
    interceptor: Interceptor,
    authorizator: Authorizator,
}

fn harness() -> Harness {
    let registry = Arc::new(Registry::open_in_memory().expect("open registry"));
    let authenticator = Arc::new(Authenticator::new(registry.clone()));
    let interceptor = Interceptor::new(
        registry.clone(),
        authenticator,
        Arc::new(RecordingSessions(Mutex::new(Vec::new()))),
        InterceptorOptions {
            worker_pool_size: 1,
            ..InterceptorOptions::default()
        },
    )
    .expect("interceptor");
    let authorizator = Authorizator::new(registry.clone(), "controller-01");
    Harness {
        registry,
        interceptor,
        authorizator,
    }
}

impl Harness {
    /// Broker-shaped publish: ACL first, then the interceptor's publish path.
    fn publish(&self, client_id: &str, topic: &str, payload: &[u8]) -> bool {
        if !self.authorizator.can_write(Some(client_id), Some(topic)) {
            return false;
        }
        self.interceptor.process_publish(client_id, topic, payload);
        true
    }

    fn connect(&self, client_id: &str, peer_addr: &str) -> ConnectDecision {
        self.interceptor.on_connect(&ConnectEvent {
            client_id,
            peer_addr,
            client_info: None,
        })
    }

    fn seed(&self, serial: &str, mac: &str, status: DeviceStatus) -> i64 {
        let (device, _) = self
            .registry
            .upsert_device_if_absent(&NewDevice {
                device_type: DeviceType::TempSensor,
                serial_hash: identity::hash(serial),
                mac_hash: identity::hash(mac),
                composite_hash: identity::hash_composite(serial, mac),
                status,
                is_critical: false,
                firmware_version: None,
                hardware_version: None,
            })
            .unwrap();
        device.id
    }
}

#[test]
fn registration_happy_path_creates_pending_device() {
    let h = harness();

    assert_eq!(h.connect("IOT0001AABBCC", "10.0.0.5:50000"), ConnectDecision::Accept);

    let accepted = h.publish(
        "IOT0001AABBCC",
        "home/controller-01/devices/IOT-2025-0001/register",
        br#"{"serial":"IOT-2025-0001","mac":"AA:BB:CC:DD:EE:FF","device_type":"TEMP_SENSOR"}"#,
    );
    assert!(accepted);

    let device = h
        .registry
        .find_by_serial_hash(&identity::hash("IOT-2025-0001"))
        .unwrap()
        .expect("device registered");
    assert_eq!(device.status, DeviceStatus::Pending);

    let alerts = h
        .registry
        .find_alerts_by_type(AlertType::DeviceRegistration)
        .unwrap();
    assert_eq!(alerts.len(), 1);

    // The pre-created connection row is now bound to the device.
    let active = h
        .registry
        .find_active_by_device_id(device.id)
        .unwrap()
        .expect("active connection");
    assert_eq!(active.client_id, "IOT0001AABBCC");
    assert_eq!(h.registry.find_active_connections().unwrap().len(), 1);
}

#[test]
fn connect_then_disconnect_round_trips_the_connection_row() {
    let h = harness();
    let device_id = h.seed("IOT-2025-0001", "AA:BB:CC:DD:EE:FF", DeviceStatus::Approved);

    assert_eq!(h.connect("IOT0001AABBCC", "10.0.0.5:50000"), ConnectDecision::Accept);
    assert!(h.registry.find_active_by_device_id(device_id).unwrap().is_some());

    h.interceptor.on_disconnect("IOT0001AABBCC");
    assert!(h.registry.find_active_by_device_id(device_id).unwrap().is_none());
}

#[test]
fn disconnect_without_connection_row_is_tolerated() {
    let h = harness();
    // Must not panic or error; the handler logs and moves on.
    h.interceptor.on_disconnect("IOT0001AABBCC");
}

#[test]
fn at_most_one_active_connection_per_device() {
    let h = harness();
    let device_id = h.seed("IOT-2025-0001", "AA:BB:CC:DD:EE:FF", DeviceStatus::Approved);

    // Same peer host: reconnect path closes the incumbent before admitting.
    assert_eq!(h.connect("IOT0001AABBCC", "10.0.0.5:50000"), ConnectDecision::Accept);
    assert_eq!(h.connect("IOT0001AABBCC", "10.0.0.5:50001"), ConnectDecision::Accept);

    let active: Vec<_> = h
        .registry
        .find_active_connections()
        .unwrap()
        .into_iter()
        .filter(|conn| conn.device_id == Some(device_id))
        .collect();
    assert_eq!(active.len(), 1);
    assert_eq!(active[0].peer_addr, "10.0.0.5:50001");
}

#[test]
fn malformed_device_client_id_is_rejected_with_alert() {
    let h = harness();
    assert_eq!(h.connect("IOT01", "10.0.0.5:50000"), ConnectDecision::Reject);
    assert_eq!(
        h.registry
            .find_alerts_by_type(AlertType::MalformedClientId)
            .unwrap()
            .len(),
        1
    );
    assert!(h.registry.find_active_connections().unwrap().is_empty());
}

#[test]
fn blocked_device_is_admitted_but_gets_no_connection_row() {
    let h = harness();
    let device_id = h.seed("IOT-2025-0001", "AA:BB:CC:DD:EE:FF", DeviceStatus::Blocked);

    assert_eq!(h.connect("IOT0001AABBCC", "10.0.0.5:50000"), ConnectDecision::Accept);
    assert!(h.registry.find_active_by_device_id(device_id).unwrap().is_none());
}

#[test]
fn registration_mac_mismatch_detaches_the_connection() {
    let h = harness();

    // clientId encodes MAC prefix AABBCC; the registration claims a MAC
    // starting 99AABB. The session is detached and alerted, but the device
    // row itself is still created for later inspection.
    assert_eq!(h.connect("IOT0001AABBCC", "10.0.0.5:50000"), ConnectDecision::Accept);
    let accepted = h.publish(
        "IOT0001AABBCC",
        "home/controller-01/devices/IOT-2025-0001/register",
        br#"{"serial":"IOT-2025-0001","mac":"99:AA:BB:CC:DD:EE","device_type":"TEMP_SENSOR"}"#,
    );
    assert!(accepted);

    let device = h
        .registry
        .find_by_serial_hash(&identity::hash("IOT-2025-0001"))
        .unwrap()
        .expect("device row exists");
    assert!(h.registry.find_active_by_device_id(device.id).unwrap().is_none());
    assert_eq!(
        h.registry
            .find_alerts_by_type(AlertType::MacMismatch)
            .unwrap()
            .len(),
        1
    );
}

#[test]
fn re_registration_updates_metadata_but_not_status() {
    let h = harness();
    let device_id = h.seed("IOT-2025-0001", "AA:BB:CC:DD:EE:FF", DeviceStatus::Approved);

    assert_eq!(h.connect("IOT0001AABBCC", "10.0.0.5:50000"), ConnectDecision::Accept);
    let accepted = h.publish(
        "IOT0001AABBCC",
        "home/controller-01/devices/IOT-2025-0001/register",
        br#"{"serial":"IOT-2025-0001","mac":"AA:BB:CC:DD:EE:FF","device_type":"TEMP_SENSOR","firmware_version":"2.0.1"}"#,
    );
    assert!(accepted);

    let device = h.registry.find_by_id(device_id).unwrap().unwrap();
    assert_eq!(device.status, DeviceStatus::Approved);
    assert_eq!(device.firmware_version.as_deref(), Some("2.0.1"));
}

#[test]
fn registration_with_preseeded_approved_serial_is_auto_approved() {
    let h = harness();
    // Pre-seeded row for the same serial, different MAC, already APPROVED.
    h.seed("IOT-2025-0001", "00:00:00:00:00:01", DeviceStatus::Approved);

    assert_eq!(h.connect("IOT0001AABBCC", "10.0.0.5:50000"), ConnectDecision::Accept);
    let accepted = h.publish(
        "IOT0001AABBCC",
        "home/controller-01/devices/IOT-2025-0001/register",
        br#"{"serial":"IOT-2025-0001","mac":"AA:BB:CC:DD:EE:FF","device_type":"TEMP_SENSOR"}"#,
    );
    assert!(accepted);

    let newcomer = h
        .registry
        .find_by_composite_hash(&identity::hash_composite(
            "IOT-2025-0001",
            "AA:BB:CC:DD:EE:FF",
        ))
        .unwrap()
        .expect("newcomer registered");
    assert_eq!(newcomer.status, DeviceStatus::Approved);
}

#[test]
fn invalid_registration_payloads_emit_typed_alerts() {
    let h = harness();
    assert_eq!(h.connect("IOT0001AABBCC", "10.0.0.5:50000"), ConnectDecision::Accept);

    // Not JSON.
    h.publish(
        "IOT0001AABBCC",
        "home/controller-01/devices/IOT-2025-0001/register",
        b"not json at all",
    );
    // Unknown device type.
    h.publish(
        "IOT0001AABBCC",
        "home/controller-01/devices/IOT-2025-0001/register",
        br#"{"serial":"IOT-2025-0001","mac":"AA:BB:CC:DD:EE:FF","device_type":"TOASTER"}"#,
    );
    // Bad MAC.
    h.publish(
        "IOT0001AABBCC",
        "home/controller-01/devices/IOT-2025-0001/register",
        br#"{"serial":"IOT-2025-0001","mac":"AABBCCDDEEFF","device_type":"TEMP_SENSOR"}"#,
    );

    assert_eq!(
        h.registry
            .find_alerts_by_type(AlertType::RegistrationError)
            .unwrap()
            .len(),
        2
    );
    assert_eq!(
        h.registry
            .find_alerts_by_type(AlertType::InvalidMacFormat)
            .unwrap()
            .len(),
        1
    );
    assert!(h
        .registry
        .find_by_serial_hash(&identity::hash("IOT-2025-0001"))
        .unwrap()
        .is_none());
}
