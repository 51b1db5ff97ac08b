//! Duplicate-connection handling: reconnects, critical clone attempts and
//! the automatic block of cloned non-critical devices.

use std::sync::{Arc, Mutex};

use hub_sentinel::identity;
use hub_sentinel::interceptor::{ConnectDecision, ConnectEvent, InterceptorOptions, SessionControl};
use hub_sentinel::registry::NewDevice;
use hub_sentinel::{AlertType, Authenticator, DeviceStatus, DeviceType, Interceptor, Registry};

#[derive(Default)]
struct RecordingSessions(Mutex<Vec<String>>);

impl SessionControl for RecordingSessions {
    fn close_session(&self, client_id: &str) {
        self.0.lock().unwrap().push(client_id.to_string());
    }
}

struct Harness {
    registry: Arc<Registry>,
    sessions: Arc<RecordingSessions>,
    interceptor: Interceptor,
}

fn harness_with_device(critical: bool) -> (Harness, i64) {
    let registry = Arc::new(Registry::open_in_memory().expect("open registry"));
    let (device, _) = registry
        .upsert_device_if_absent(&NewDevice {
            device_type: DeviceType::SmartPlug,
            serial_hash: identity::hash("IOT-2025-0001"),
            mac_hash: identity::hash("AA:BB:CC:DD:EE:FF"),
            composite_hash: identity::hash_composite("IOT-2025-0001", "AA:BB:CC:DD:EE:FF"),
            status: DeviceStatus::Approved,
            is_critical: critical,
            firmware_version: None,
            hardware_version: None,
        })
        .unwrap();
    let sessions = Arc::new(RecordingSessions::default());
    let interceptor = Interceptor::new(
        registry.clone(),
        Arc::new(Authenticator::new(registry.clone())),
        sessions.clone(),
        InterceptorOptions {
            worker_pool_size: 1,
            ..InterceptorOptions::default()
        },
    )
    .expect("interceptor");
    (
        Harness {
            registry,
            sessions,
            interceptor,
        },
        device.id,
    )
}

impl Harness {
    fn connect(&self, client_id: &str, peer_addr: &str) -> ConnectDecision {
        self.interceptor.on_connect(&ConnectEvent {
            client_id,
            peer_addr,
            client_info: None,
        })
    }

    fn closed_sessions(&self) -> Vec<String> {
        self.sessions.0.lock().unwrap().clone()
    }
}

#[test]
fn clone_on_noncritical_device_blocks_and_rejects() {
    let (h, device_id) = harness_with_device(false);

    assert_eq!(h.connect("IOT0001AABBCC", "10.0.0.5:50000"), ConnectDecision::Accept);
    // Second session from a different peer address.
    assert_eq!(h.connect("IOT0001AABBCC", "10.9.9.9:40000"), ConnectDecision::Reject);

    // First session closed, device blocked, both connections gone.
    assert_eq!(h.closed_sessions(), vec!["IOT0001AABBCC".to_string()]);
    assert!(h.registry.find_active_by_device_id(device_id).unwrap().is_none());
    assert_eq!(
        h.registry.find_by_id(device_id).unwrap().unwrap().status,
        DeviceStatus::Blocked
    );

    let alerts = h
        .registry
        .find_alerts_by_type(AlertType::DeviceCloneDetected)
        .unwrap();
    assert_eq!(alerts.len(), 1);
    assert_eq!(alerts[0].details["action_taken"], "BLOCKED_DEVICE_DISCONNECTED_BOTH");
    assert_eq!(alerts[0].details["old_addr"], "10.0.0.5:50000");
    assert_eq!(alerts[0].details["new_addr"], "10.9.9.9:40000");
    assert_eq!(alerts[0].details["critical"], false);
}

#[test]
fn clone_on_critical_device_keeps_incumbent() {
    let (h, device_id) = harness_with_device(true);

    assert_eq!(h.connect("IOT0001AABBCC", "10.0.0.5:50000"), ConnectDecision::Accept);
    assert_eq!(h.connect("IOT0001AABBCC", "10.9.9.9:40000"), ConnectDecision::Reject);

    // No session torn down, incumbent still active, status unchanged.
    assert!(h.closed_sessions().is_empty());
    let active = h
        .registry
        .find_active_by_device_id(device_id)
        .unwrap()
        .expect("incumbent still active");
    assert_eq!(active.peer_addr, "10.0.0.5:50000");
    assert_eq!(
        h.registry.find_by_id(device_id).unwrap().unwrap().status,
        DeviceStatus::Approved
    );

    let alerts = h
        .registry
        .find_alerts_by_type(AlertType::CriticalDeviceCloneAttempt)
        .unwrap();
    assert_eq!(alerts.len(), 1);
    assert_eq!(alerts[0].details["action_taken"], "NEW_REJECTED_EXISTING_KEPT");
}

#[test]
fn same_address_reconnect_replaces_the_session() {
    let (h, device_id) = harness_with_device(true);

    assert_eq!(h.connect("IOT0001AABBCC", "10.0.0.5:50000"), ConnectDecision::Accept);
    assert_eq!(h.connect("IOT0001AABBCC", "10.0.0.5:51111"), ConnectDecision::Accept);

    assert_eq!(h.closed_sessions(), vec!["IOT0001AABBCC".to_string()]);
    let active = h
        .registry
        .find_active_by_device_id(device_id)
        .unwrap()
        .expect("new session active");
    assert_eq!(active.peer_addr, "10.0.0.5:51111");
    // Criticality does not matter for a same-address reconnect.
    assert_eq!(
        h.registry.find_by_id(device_id).unwrap().unwrap().status,
        DeviceStatus::Approved
    );
    assert_eq!(
        h.registry
            .find_alerts_by_type(AlertType::DeviceReconnection)
            .unwrap()
            .len(),
        1
    );
}

#[test]
fn each_duplicate_event_emits_exactly_one_alert() {
    let (h, _device_id) = harness_with_device(false);

    assert_eq!(h.connect("IOT0001AABBCC", "10.0.0.5:50000"), ConnectDecision::Accept);
    assert_eq!(h.connect("IOT0001AABBCC", "10.9.9.9:40000"), ConnectDecision::Reject);

    let all = h.registry.find_all_alerts().unwrap();
    let clone_alerts: Vec<_> = all
        .iter()
        .filter(|a| {
            a.alert_type == "DEVICE_CLONE_DETECTED"
                || a.alert_type == "CRITICAL_DEVICE_CLONE_ATTEMPT"
                || a.alert_type == "DEVICE_RECONNECTION"
        })
        .collect();
    assert_eq!(clone_alerts.len(), 1);
}

#[test]
fn blocked_clone_stays_blocked_on_further_attempts() {
    let (h, device_id) = harness_with_device(false);

    assert_eq!(h.connect("IOT0001AABBCC", "10.0.0.5:50000"), ConnectDecision::Accept);
    assert_eq!(h.connect("IOT0001AABBCC", "10.9.9.9:40000"), ConnectDecision::Reject);

    // The device is now BLOCKED; a third attempt is admitted at the TLS/MQTT
    // layer but receives no connection row and no rights.
    assert_eq!(h.connect("IOT0001AABBCC", "10.9.9.9:40001"), ConnectDecision::Accept);
    assert!(h.registry.find_active_by_device_id(device_id).unwrap().is_none());
    assert_eq!(
        h.registry.find_by_id(device_id).unwrap().unwrap().status,
        DeviceStatus::Blocked
    );
}
