//! ACL properties across the publish and subscribe surface, driven the way
//! the broker engine drives them: authorizator first, interceptor second.

use std::sync::Arc;

use hub_sentinel::identity;
use hub_sentinel::interceptor::{InterceptorOptions, NullSessionControl};
use hub_sentinel::registry::NewDevice;
use hub_sentinel::{
    AlertType, Authenticator, Authorizator, DeviceStatus, DeviceType, Interceptor, Registry,
};

struct Harness {
    registry: Arc<Registry>,
    authorizator: Authorizator,
    interceptor: Interceptor,
}

fn harness() -> Harness {
    let registry = Arc::new(Registry::open_in_memory().expect("open registry"));
    let authorizator = Authorizator::new(registry.clone(), "controller-01");
    let interceptor = Interceptor::new(
        registry.clone(),
        Arc::new(Authenticator::new(registry.clone())),
        Arc::new(NullSessionControl),
        InterceptorOptions {
            worker_pool_size: 1,
            ..InterceptorOptions::default()
        },
    )
    .expect("interceptor");
    Harness {
        registry,
        authorizator,
        interceptor,
    }
}

impl Harness {
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

    fn publish(&self, client_id: &str, topic: &str, payload: &[u8]) -> bool {
        if !self.authorizator.can_write(Some(client_id), Some(topic)) {
            return false;
        }
        self.interceptor.process_publish(client_id, topic, payload);
        true
    }
}

#[test]
fn non_approved_device_cannot_insert_telemetry() {
    for status in [
        DeviceStatus::Pending,
        DeviceStatus::Blocked,
        DeviceStatus::Rejected,
    ] {
        let h = harness();
        let device_id = h.seed("IOT-2025-0001", "AA:BB:CC:DD:EE:FF", status);

        let delivered = h.publish(
            "IOT0001AABBCC",
            "home/controller-01/devices/IOT-2025-0001/telemetry",
            br#"{"temperature":22.5}"#,
        );
        assert!(!delivered, "status {:?} must not deliver", status);
        assert_eq!(h.registry.count_telemetry_for_device(device_id).unwrap(), 0);
    }
}

#[test]
fn approved_device_inserts_telemetry_byte_for_byte() {
    let h = harness();
    let device_id = h.seed("IOT-2025-0001", "AA:BB:CC:DD:EE:FF", DeviceStatus::Approved);

    let body = br#"{"temperature":22.5,"timestamp":"2025-01-01T00:00:00"}"#;
    let delivered = h.publish(
        "IOT0001AABBCC",
        "home/controller-01/devices/IOT-2025-0001/telemetry",
        body,
    );
    assert!(delivered);

    let rows = h.registry.find_telemetry_for_device(device_id).unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].payload_raw, body.to_vec());
    assert_eq!(rows[0].ts.as_deref(), Some("2025-01-01T00:00:00"));
    assert!(rows[0].measurement.is_none());
    assert!(rows[0].metric_value.is_none());
}

#[test]
fn device_cannot_publish_to_any_cmd_topic() {
    let h = harness();
    h.seed("IOT-2025-0001", "AA:BB:CC:DD:EE:FF", DeviceStatus::Approved);

    // Its own command topic.
    assert!(!h.publish(
        "IOT0001AABBCC",
        "home/controller-01/devices/IOT-2025-0001/cmd",
        b"{}"
    ));
    // Someone else's command topic. The cmd rule fires before the serial
    // check, so this is tagged as a cmd-publish attempt too.
    assert!(!h.publish(
        "IOT0001AABBCC",
        "home/controller-01/devices/IOT-2025-0002/cmd",
        b"{}"
    ));

    assert_eq!(
        h.registry
            .find_alerts_by_type(AlertType::AclDeviceCmdPublish)
            .unwrap()
            .len(),
        2
    );
}

#[test]
fn wildcard_subscribe_is_denied_for_devices_and_allowed_for_admins() {
    let h = harness();
    h.seed("IOT-2025-0001", "AA:BB:CC:DD:EE:FF", DeviceStatus::Approved);

    assert!(!h.authorizator.can_read(Some("IOT0001AABBCC"), Some("#")));
    assert!(h.authorizator.can_read(Some("ADMIN_console"), Some("#")));

    let alerts = h
        .registry
        .find_alerts_by_type(AlertType::AclWildcardSubscribe)
        .unwrap();
    assert_eq!(alerts.len(), 1);
    assert_eq!(alerts[0].details["client_id"], "IOT0001AABBCC");
}

#[test]
fn controller_commands_pass_the_acl() {
    let h = harness();
    assert!(h.publish(
        "controller-cmd",
        "home/controller-01/devices/IOT-2025-0001/cmd",
        br#"{"action":"on"}"#
    ));
}

#[test]
fn serial_mismatch_publish_is_denied_even_when_approved() {
    let h = harness();
    let device_id = h.seed("IOT-2025-0001", "AA:BB:CC:DD:EE:FF", DeviceStatus::Approved);

    // clientId tail 0002 against topic serial ...0001.
    let delivered = h.publish(
        "IOT0002AABBCC",
        "home/controller-01/devices/IOT-2025-0001/telemetry",
        b"{}",
    );
    assert!(!delivered);
    assert_eq!(h.registry.count_telemetry_for_device(device_id).unwrap(), 0);
    assert_eq!(
        h.registry
            .find_alerts_by_type(AlertType::AclSerialMismatch)
            .unwrap()
            .len(),
        1
    );
}

#[test]
fn oversize_telemetry_is_dropped_after_the_acl() {
    let registry = Arc::new(Registry::open_in_memory().expect("open registry"));
    let authorizator = Authorizator::new(registry.clone(), "controller-01");
    let interceptor = Interceptor::new(
        registry.clone(),
        Arc::new(Authenticator::new(registry.clone())),
        Arc::new(NullSessionControl),
        InterceptorOptions {
            worker_pool_size: 1,
            max_telemetry_payload: 64,
            ..InterceptorOptions::default()
        },
    )
    .expect("interceptor");

    let (device, _) = registry
        .upsert_device_if_absent(&NewDevice {
            device_type: DeviceType::TempSensor,
            serial_hash: identity::hash("IOT-2025-0001"),
            mac_hash: identity::hash("AA:BB:CC:DD:EE:FF"),
            composite_hash: identity::hash_composite("IOT-2025-0001", "AA:BB:CC:DD:EE:FF"),
            status: DeviceStatus::Approved,
            is_critical: false,
            firmware_version: None,
            hardware_version: None,
        })
        .unwrap();

    let topic = "home/controller-01/devices/IOT-2025-0001/telemetry";
    assert!(authorizator.can_write(Some("IOT0001AABBCC"), Some(topic)));
    interceptor.process_publish("IOT0001AABBCC", topic, &vec![b'x'; 65]);
    assert_eq!(registry.count_telemetry_for_device(device.id).unwrap(), 0);
}
