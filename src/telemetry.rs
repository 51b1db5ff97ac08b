//! Telemetry ingest: topic parsing, payload validation, device resolution and
//! the durable insert.
//!
//! Parsing is best-effort: a payload that is not JSON is still stored raw.
//! Only size, UTF-8 and device resolution are hard gates.

use anyhow::Result;
use std::sync::Arc;
use std::sync::OnceLock;
use time::format_description::well_known::Rfc3339;
use time::format_description::FormatItem;
use time::{OffsetDateTime, PrimitiveDateTime};

use crate::authorizator::{parse_device_topic, TopicChannel};
use crate::identity;
use crate::registry::{NewTelemetry, Registry};

/// Payloads above this size are dropped with a warning.
pub const MAX_TELEMETRY_PAYLOAD: usize = 512 * 1024;

pub struct TelemetryIngest {
    registry: Arc<Registry>,
    max_payload: usize,
}

impl TelemetryIngest {
    pub fn new(registry: Arc<Registry>) -> Self {
        Self {
            registry,
            max_payload: MAX_TELEMETRY_PAYLOAD,
        }
    }

    pub fn with_max_payload(registry: Arc<Registry>, max_payload: usize) -> Self {
        Self {
            registry,
            max_payload,
        }
    }

    /// Ingest one published message. Returns the inserted row id, or `None`
    /// when the message was dropped (wrong topic, oversize, unknown device,
    /// non-UTF-8 payload).
    pub fn ingest(&self, topic: &str, payload: &[u8]) -> Result<Option<i64>> {
        let Some(parsed) = parse_device_topic(topic) else {
            log::warn!("telemetry on unrecognized topic {}", topic);
            return Ok(None);
        };
        if parsed.channel != TopicChannel::Telemetry {
            log::warn!("telemetry ingest called for non-telemetry topic {}", topic);
            return Ok(None);
        }

        if payload.len() > self.max_payload {
            log::warn!(
                "telemetry payload on {} exceeds {} bytes ({}); dropped",
                topic,
                self.max_payload,
                payload.len()
            );
            return Ok(None);
        }

        let Ok(text) = std::str::from_utf8(payload) else {
            log::warn!("telemetry payload on {} is not UTF-8; dropped", topic);
            return Ok(None);
        };

        // The topic's device segment accepts the serial itself.
        let Some(device) = self
            .registry
            .find_by_serial_hash(&identity::hash(parsed.serial))?
        else {
            log::warn!("telemetry from unknown device on {}; dropped", topic);
            return Ok(None);
        };

        let fields = extract_fields(text);
        let row_id = self.registry.insert_telemetry(&NewTelemetry {
            device_id: device.id,
            topic: topic.to_string(),
            ts: fields.timestamp,
            measurement: fields.measurement,
            metric_value: fields.value,
            payload_raw: payload.to_vec(),
        })?;
        log::debug!("telemetry row {} stored for device {}", row_id, device.id);
        Ok(Some(row_id))
    }
}

#[derive(Debug, Default)]
struct TelemetryFields {
    timestamp: Option<String>,
    measurement: Option<String>,
    value: Option<f64>,
}

/// Best-effort JSON field extraction. A parse failure leaves every field
/// empty; the raw payload is stored regardless.
fn extract_fields(text: &str) -> TelemetryFields {
    let Ok(value) = serde_json::from_str::<serde_json::Value>(text) else {
        return TelemetryFields::default();
    };

    let timestamp = value
        .get("timestamp")
        .and_then(|v| v.as_str())
        .filter(|raw| parse_device_timestamp(raw).is_some())
        .map(|raw| raw.to_string());
    let measurement = value
        .get("measurement")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string());
    let metric_value = value.get("value").and_then(|v| v.as_f64());

    TelemetryFields {
        timestamp,
        measurement,
        value: metric_value,
    }
}

fn local_formats() -> &'static [Vec<FormatItem<'static>>; 2] {
    static FORMATS: OnceLock<[Vec<FormatItem<'static>>; 2]> = OnceLock::new();
    FORMATS.get_or_init(|| {
        [
            time::format_description::parse(
                "[year]-[month]-[day]T[hour]:[minute]:[second].[subsecond]",
            )
            .unwrap(),
            time::format_description::parse("[year]-[month]-[day]T[hour]:[minute]:[second]")
                .unwrap(),
        ]
    })
}

/// Accepts RFC 3339 with zone, or a zone-less ISO local datetime which is
/// read as UTC.
pub(crate) fn parse_device_timestamp(raw: &str) -> Option<OffsetDateTime> {
    if let Ok(dt) = OffsetDateTime::parse(raw, &Rfc3339) {
        return Some(dt);
    }
    for format in local_formats() {
        if let Ok(dt) = PrimitiveDateTime::parse(raw, format) {
            return Some(dt.assume_utc());
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::NewDevice;
    use crate::{DeviceStatus, DeviceType};

    const TOPIC: &str = "home/controller-01/devices/IOT-2025-0001/telemetry";

    fn setup() -> (Arc<Registry>, TelemetryIngest, i64) {
        let registry = Arc::new(Registry::open_in_memory().expect("open registry"));
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
        let ingest = TelemetryIngest::new(registry.clone());
        (registry, ingest, device.id)
    }

    #[test]
    fn stores_raw_payload_with_parsed_timestamp() {
        let (registry, ingest, device_id) = setup();
        let body = br#"{"temperature":22.5,"timestamp":"2025-01-01T00:00:00"}"#;

        let row_id = ingest.ingest(TOPIC, body).unwrap();
        assert!(row_id.is_some());

        let rows = registry.find_telemetry_for_device(device_id).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].payload_raw, body.to_vec());
        assert_eq!(rows[0].ts.as_deref(), Some("2025-01-01T00:00:00"));
        // "temperature" is not a recognized field name.
        assert!(rows[0].measurement.is_none());
        assert!(rows[0].metric_value.is_none());
    }

    #[test]
    fn recognized_fields_are_extracted() {
        let (registry, ingest, device_id) = setup();
        let body = br#"{"measurement":"power","value":42.5,"timestamp":"2025-06-01T10:00:00+02:00"}"#;

        ingest.ingest(TOPIC, body).unwrap().unwrap();
        let rows = registry.find_telemetry_for_device(device_id).unwrap();
        assert_eq!(rows[0].measurement.as_deref(), Some("power"));
        assert_eq!(rows[0].metric_value, Some(42.5));
        assert_eq!(rows[0].ts.as_deref(), Some("2025-06-01T10:00:00+02:00"));
    }

    #[test]
    fn unparseable_json_is_stored_raw_with_null_fields() {
        let (registry, ingest, device_id) = setup();
        let body = b"raw bytes, not json";

        let row_id = ingest.ingest(TOPIC, body).unwrap();
        assert!(row_id.is_some());
        let rows = registry.find_telemetry_for_device(device_id).unwrap();
        assert_eq!(rows[0].payload_raw, body.to_vec());
        assert!(rows[0].ts.is_none());
        assert!(rows[0].measurement.is_none());
        assert!(rows[0].metric_value.is_none());
    }

    #[test]
    fn oversize_payload_is_dropped() {
        let registry = Arc::new(Registry::open_in_memory().expect("open registry"));
        registry
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
        let ingest = TelemetryIngest::with_max_payload(registry.clone(), 64);

        let body = vec![b'x'; 65];
        assert!(ingest.ingest(TOPIC, &body).unwrap().is_none());
        assert!(registry.find_telemetry_for_device(1).unwrap().is_empty());
    }

    #[test]
    fn unknown_device_is_dropped() {
        let registry = Arc::new(Registry::open_in_memory().expect("open registry"));
        let ingest = TelemetryIngest::new(registry);
        let row = ingest.ingest(TOPIC, b"{}").unwrap();
        assert!(row.is_none());
    }

    #[test]
    fn non_utf8_payload_is_dropped() {
        let (_registry, ingest, _device_id) = setup();
        assert!(ingest.ingest(TOPIC, &[0xff, 0xfe, 0x00]).unwrap().is_none());
    }

    #[test]
    fn wrong_topic_shape_is_dropped() {
        let (_registry, ingest, _device_id) = setup();
        assert!(ingest
            .ingest("home/controller-01/devices/IOT-2025-0001/health", b"{}")
            .unwrap()
            .is_none());
        assert!(ingest.ingest("stray/topic", b"{}").unwrap().is_none());
    }

    #[test]
    fn timestamp_parser_accepts_both_shapes() {
        assert!(parse_device_timestamp("2025-01-01T00:00:00").is_some());
        assert!(parse_device_timestamp("2025-01-01T00:00:00.250").is_some());
        assert!(parse_device_timestamp("2025-01-01T00:00:00Z").is_some());
        assert!(parse_device_timestamp("2025-01-01T00:00:00+01:00").is_some());
        assert!(parse_device_timestamp("yesterday").is_none());
        assert!(parse_device_timestamp("2025-01-01").is_none());
    }
}
