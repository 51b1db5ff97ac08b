//! Per-publish and per-subscribe topic ACL.
//!
//! Called synchronously by the broker library for every subscribe and publish
//! attempt. Decisions are boolean; denials that indicate attack surface log
//! at WARN and record a stable-tag alert so an operator can audit them later.

use std::sync::Arc;

use crate::identity::{self, ClientClass};
use crate::registry::Registry;
use crate::{AlertType, DeviceStatus};

/// Topic channel under `home/<controllerId>/devices/<serial>/`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TopicChannel {
    Register,
    Health,
    Telemetry,
    Cmd,
    Offline,
}

impl TopicChannel {
    fn parse(segment: &str) -> Option<Self> {
        match segment {
            "register" => Some(Self::Register),
            "health" => Some(Self::Health),
            "telemetry" => Some(Self::Telemetry),
            "cmd" => Some(Self::Cmd),
            "offline" => Some(Self::Offline),
            _ => None,
        }
    }
}

/// Parsed device topic: `home/<controllerId>/devices/<serial>/<channel>`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeviceTopic<'a> {
    pub controller_id: &'a str,
    pub serial: &'a str,
    pub channel: TopicChannel,
}

/// Parse a topic against the device-topic grammar. Returns `None` for
/// anything outside `home/<x>/devices/<serial>/<channel>`.
pub fn parse_device_topic(topic: &str) -> Option<DeviceTopic<'_>> {
    let mut parts = topic.split('/');
    let home = parts.next()?;
    let controller_id = parts.next()?;
    let devices = parts.next()?;
    let serial = parts.next()?;
    let channel = parts.next()?;
    if parts.next().is_some() {
        return None;
    }
    if home != "home" || devices != "devices" || serial.is_empty() || controller_id.is_empty() {
        return None;
    }
    Some(DeviceTopic {
        controller_id,
        serial,
        channel: TopicChannel::parse(channel)?,
    })
}

/// Build a device topic string for one channel.
pub fn device_topic(controller_id: &str, serial: &str, channel: TopicChannel) -> String {
    let tail = match channel {
        TopicChannel::Register => "register",
        TopicChannel::Health => "health",
        TopicChannel::Telemetry => "telemetry",
        TopicChannel::Cmd => "cmd",
        TopicChannel::Offline => "offline",
    };
    format!("home/{}/devices/{}/{}", controller_id, serial, tail)
}

pub struct Authorizator {
    registry: Arc<Registry>,
    controller_id: String,
}

impl Authorizator {
    pub fn new(registry: Arc<Registry>, controller_id: &str) -> Self {
        Self {
            registry,
            controller_id: controller_id.to_string(),
        }
    }

    /// Publish admission. Rules evaluated top-down; first match wins.
    pub fn can_write(&self, client_id: Option<&str>, topic: Option<&str>) -> bool {
        let (Some(client_id), Some(topic)) = (client_id, topic) else {
            return false;
        };

        match identity::classify_client_id(client_id) {
            ClientClass::Controller | ClientClass::Admin => true,
            ClientClass::Device(device_id) => {
                if topic.contains('#') {
                    return false;
                }
                self.device_can_write(client_id, &device_id, topic)
            }
            ClientClass::MalformedDevice | ClientClass::Unauthenticated => false,
        }
    }

    /// Subscribe admission. Only a device's own `/cmd` topic is reachable by
    /// a device; `#` is admin-only.
    pub fn can_read(&self, client_id: Option<&str>, topic: Option<&str>) -> bool {
        let (Some(client_id), Some(topic)) = (client_id, topic) else {
            return false;
        };

        let class = identity::classify_client_id(client_id);
        if topic.contains('#') {
            return match class {
                ClientClass::Admin => true,
                ClientClass::Controller => true,
                _ => {
                    self.deny(
                        AlertType::AclWildcardSubscribe,
                        client_id,
                        topic,
                        "wildcard subscribe by non-admin",
                    );
                    false
                }
            };
        }

        match class {
            ClientClass::Controller | ClientClass::Admin => true,
            ClientClass::Device(device_id) => self.device_can_read(client_id, &device_id, topic),
            ClientClass::MalformedDevice | ClientClass::Unauthenticated => false,
        }
    }

    fn device_can_write(
        &self,
        client_id: &str,
        device_id: &identity::DeviceClientId,
        topic: &str,
    ) -> bool {
        let Some(parsed) = parse_device_topic(topic) else {
            log::warn!("device {} publish to unrecognized topic {}", client_id, topic);
            return false;
        };
        if parsed.controller_id != self.controller_id {
            log::warn!(
                "device {} publish to foreign controller topic {}",
                client_id,
                topic
            );
            return false;
        }

        match parsed.channel {
            TopicChannel::Cmd => {
                self.deny(
                    AlertType::AclDeviceCmdPublish,
                    client_id,
                    topic,
                    "device publish to command channel",
                );
                return false;
            }
            TopicChannel::Register | TopicChannel::Health | TopicChannel::Telemetry => {}
            TopicChannel::Offline => {
                // The offline channel carries the broker-set will message only.
                log::warn!("device {} direct publish to offline topic {}", client_id, topic);
                return false;
            }
        }

        if !self.client_matches_serial(device_id, parsed.serial) {
            self.deny(
                AlertType::AclSerialMismatch,
                client_id,
                topic,
                "clientId tail does not match topic serial",
            );
            return false;
        }

        let status = match self
            .registry
            .find_by_serial_hash(&identity::hash(parsed.serial))
        {
            Ok(Some(device)) => Some(device.status),
            Ok(None) => None,
            Err(e) => {
                log::error!("ACL registry lookup failed for {}: {}", topic, e);
                return false;
            }
        };

        match parsed.channel {
            // Registration must be reachable for devices the registry has not
            // seen yet; the interceptor applies the finer state rules.
            TopicChannel::Register => match status {
                None | Some(DeviceStatus::Pending) | Some(DeviceStatus::Approved) => true,
                Some(DeviceStatus::Blocked) | Some(DeviceStatus::Rejected) => {
                    self.deny(
                        AlertType::AclUnapprovedPublish,
                        client_id,
                        topic,
                        "registration publish from blocked or rejected device",
                    );
                    false
                }
            },
            // Health reaches the interceptor for any known non-blocked device
            // so rejections carry their typed alert.
            TopicChannel::Health => match status {
                Some(DeviceStatus::Pending) | Some(DeviceStatus::Approved) | None => true,
                Some(DeviceStatus::Blocked) | Some(DeviceStatus::Rejected) => {
                    self.deny(
                        AlertType::AclUnapprovedPublish,
                        client_id,
                        topic,
                        "health publish from blocked or rejected device",
                    );
                    false
                }
            },
            TopicChannel::Telemetry => match status {
                Some(DeviceStatus::Approved) => true,
                _ => {
                    self.deny(
                        AlertType::AclUnapprovedPublish,
                        client_id,
                        topic,
                        "telemetry publish without APPROVED status",
                    );
                    false
                }
            },
            TopicChannel::Cmd | TopicChannel::Offline => false,
        }
    }

    fn device_can_read(
        &self,
        client_id: &str,
        device_id: &identity::DeviceClientId,
        topic: &str,
    ) -> bool {
        let Some(parsed) = parse_device_topic(topic) else {
            log::warn!("device {} subscribe to unrecognized topic {}", client_id, topic);
            return false;
        };
        if parsed.channel != TopicChannel::Cmd
            || parsed.controller_id != self.controller_id
            || !self.client_matches_serial(device_id, parsed.serial)
        {
            log::warn!("device {} subscribe denied for {}", client_id, topic);
            return false;
        }

        match self
            .registry
            .find_by_serial_hash(&identity::hash(parsed.serial))
        {
            Ok(Some(device)) => device.status == DeviceStatus::Approved,
            Ok(None) => false,
            Err(e) => {
                log::error!("ACL registry lookup failed for {}: {}", topic, e);
                false
            }
        }
    }

    /// Best-effort identity check: the 4-digit tail of the clientId must
    /// match the 4-digit tail of the topic serial. Byte-wise, so hostile
    /// non-ASCII serials cannot panic the broker callback.
    fn client_matches_serial(&self, device_id: &identity::DeviceClientId, serial: &str) -> bool {
        let serial = serial.as_bytes();
        serial.len() >= 4 && &serial[serial.len() - 4..] == device_id.serial_tail.as_bytes()
    }

    fn deny(&self, alert: AlertType, client_id: &str, topic: &str, reason: &str) {
        log::warn!("ACL deny {}: client={} topic={}", reason, client_id, topic);
        let details = serde_json::json!({
            "client_id": client_id,
            "topic": topic,
            "reason": reason,
        });
        if let Err(e) = self.registry.insert_alert(alert, None, &details) {
            log::error!("failed to record ACL alert: {}", e);
        }
    }
}
