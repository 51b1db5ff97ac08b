//! Device authentication: validation outcomes, admin status transitions and
//! the duplicate-connection (clone) policy.
//!
//! The authenticator owns the narrow status-mutation operations on top of the
//! registry's guarded `update_status`, and encapsulates the clone-decision
//! table. It never touches broker sessions itself; the interceptor applies
//! the session-level part of a verdict.

use anyhow::Result;
use std::sync::Arc;

use crate::identity;
use crate::registry::{Device, DeviceConnection, Registry, StatusUpdate};
use crate::{AlertType, DeviceStatus};

/// Outcome of resolving a claimed `{serial, mac}` identity against the
/// registry through the composite hash.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ValidationOutcome {
    /// Known and APPROVED.
    Valid,
    /// Known, awaiting admin approval.
    Pending,
    /// Known and blocked.
    Blocked,
    /// Known but in a status with no rights (REJECTED).
    InvalidStatus,
    /// No row for the composite hash.
    NotFound,
}

impl ValidationOutcome {
    pub fn from_status(status: DeviceStatus) -> Self {
        match status {
            DeviceStatus::Approved => Self::Valid,
            DeviceStatus::Pending => Self::Pending,
            DeviceStatus::Blocked => Self::Blocked,
            DeviceStatus::Rejected => Self::InvalidStatus,
        }
    }
}

// -------------------- Clone policy --------------------

/// Decision for a CONNECT arriving while the device already has an active
/// connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CloneVerdict {
    /// Same peer address: treat as a reconnect. Close the existing session,
    /// accept the new one.
    ReconnectSameAddr,
    /// Different address on a critical device: keep the incumbent, reject the
    /// newcomer.
    CriticalCloneRejected,
    /// Different address on a non-critical device: close the incumbent, block
    /// the device, reject the newcomer.
    CloneBlocked,
}

impl CloneVerdict {
    /// The decision table. Address equality wins over criticality.
    pub fn decide(critical: bool, same_addr: bool) -> Self {
        if same_addr {
            Self::ReconnectSameAddr
        } else if critical {
            Self::CriticalCloneRejected
        } else {
            Self::CloneBlocked
        }
    }

    pub fn alert_type(&self) -> AlertType {
        match self {
            Self::ReconnectSameAddr => AlertType::DeviceReconnection,
            Self::CriticalCloneRejected => AlertType::CriticalDeviceCloneAttempt,
            Self::CloneBlocked => AlertType::DeviceCloneDetected,
        }
    }

    pub fn action_taken(&self) -> &'static str {
        match self {
            Self::ReconnectSameAddr => "EXISTING_DISCONNECTED_NEW_ACCEPTED",
            Self::CriticalCloneRejected => "NEW_REJECTED_EXISTING_KEPT",
            Self::CloneBlocked => "BLOCKED_DEVICE_DISCONNECTED_BOTH",
        }
    }

    /// Whether the new session is admitted.
    pub fn admit_new(&self) -> bool {
        matches!(self, Self::ReconnectSameAddr)
    }

    /// Whether the incumbent session must be torn down.
    pub fn close_existing(&self) -> bool {
        matches!(self, Self::ReconnectSameAddr | Self::CloneBlocked)
    }
}

/// Store-side effects of a duplicate CONNECT, ready for the interceptor to
/// finish at the session layer.
#[derive(Clone, Debug)]
pub struct DuplicateResolution {
    pub verdict: CloneVerdict,
    /// Client id of the incumbent session, when it must be closed.
    pub close_client_id: Option<String>,
}

// -------------------- Service --------------------

pub struct Authenticator {
    registry: Arc<Registry>,
}

impl Authenticator {
    pub fn new(registry: Arc<Registry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Resolve a claimed identity through the composite hash.
    pub fn validate_identity(
        &self,
        serial: &str,
        mac: &str,
    ) -> Result<(ValidationOutcome, Option<Device>)> {
        let composite = identity::hash_composite(serial, mac);
        match self.registry.find_by_composite_hash(&composite)? {
            Some(device) => Ok((ValidationOutcome::from_status(device.status), Some(device))),
            None => Ok((ValidationOutcome::NotFound, None)),
        }
    }

    /// Apply the clone policy to a duplicate CONNECT: mutate the store (close
    /// the incumbent row, block the device if called for) and emit exactly
    /// one alert carrying the decision details.
    pub fn handle_duplicate(
        &self,
        device: &Device,
        existing: &DeviceConnection,
        new_addr: &str,
    ) -> Result<DuplicateResolution> {
        let same_addr = peer_host(&existing.peer_addr) == peer_host(new_addr);
        let verdict = CloneVerdict::decide(device.is_critical, same_addr);

        if verdict.close_existing() {
            self.registry.close_connection(existing.id)?;
        }
        if verdict == CloneVerdict::CloneBlocked {
            match self
                .registry
                .update_status(device.id, DeviceStatus::Blocked, None)?
            {
                StatusUpdate::Applied { .. } => {}
                other => log::warn!(
                    "clone-detected block for device {} not applied: {:?}",
                    device.id,
                    other
                ),
            }
        }

        let details = serde_json::json!({
            "old_addr": existing.peer_addr,
            "new_addr": new_addr,
            "critical": device.is_critical,
            "action_taken": verdict.action_taken(),
            "old_connection_time": existing.connected_at,
        });
        self.registry
            .insert_alert(verdict.alert_type(), Some(&device.serial_hash), &details)?;

        log::warn!(
            "duplicate connection for device {}: {:?} (old={}, new={})",
            device.id,
            verdict,
            existing.peer_addr,
            new_addr
        );

        Ok(DuplicateResolution {
            verdict,
            close_client_id: if verdict.close_existing() {
                Some(existing.client_id.clone())
            } else {
                None
            },
        })
    }

    // -------------------- Admin operations --------------------
    //
    // Boolean success plus a single-line audit entry; the audit alert is
    // emitted here, atomically after the status commit.

    pub fn approve(&self, device_id: i64, actor: &str) -> Result<bool> {
        self.transition(device_id, DeviceStatus::Approved, actor, AlertType::DeviceApproved)
    }

    pub fn reject(&self, device_id: i64, actor: &str) -> Result<bool> {
        self.transition(device_id, DeviceStatus::Rejected, actor, AlertType::DeviceRejected)
    }

    pub fn unblock(&self, device_id: i64, actor: &str) -> Result<bool> {
        self.transition(device_id, DeviceStatus::Approved, actor, AlertType::DeviceUnblocked)
    }

    pub fn mark_critical(&self, device_id: i64, actor: &str) -> Result<bool> {
        let Some(device) = self.registry.find_by_id(device_id)? else {
            log::warn!("mark-critical: device {} not found", device_id);
            return Ok(false);
        };
        if !self.registry.mark_critical(device_id)? {
            return Ok(false);
        }
        self.registry.insert_alert(
            AlertType::MarkedCritical,
            Some(&device.serial_hash),
            &serde_json::json!({ "actor": actor }),
        )?;
        self.registry.insert_audit(
            "MARKED_CRITICAL",
            &device.serial_hash,
            Some(&format!("actor={}", actor)),
        )?;
        log::info!("device {} marked critical by {}", device_id, actor);
        Ok(true)
    }

    fn transition(
        &self,
        device_id: i64,
        new_status: DeviceStatus,
        actor: &str,
        alert: AlertType,
    ) -> Result<bool> {
        let Some(device) = self.registry.find_by_id(device_id)? else {
            log::warn!("status change to {}: device {} not found", new_status, device_id);
            return Ok(false);
        };
        match self
            .registry
            .update_status(device_id, new_status, Some(actor))?
        {
            StatusUpdate::Applied { previous } => {
                self.registry.insert_alert(
                    alert,
                    Some(&device.serial_hash),
                    &serde_json::json!({
                        "actor": actor,
                        "previous_status": previous.as_str(),
                        "new_status": new_status.as_str(),
                    }),
                )?;
                self.registry.insert_audit(
                    alert.as_str(),
                    &device.serial_hash,
                    Some(&format!("actor={} {}->{}", actor, previous, new_status)),
                )?;
                log::info!(
                    "device {} {} -> {} by {}",
                    device_id,
                    previous,
                    new_status,
                    actor
                );
                Ok(true)
            }
            StatusUpdate::IllegalTransition { from } => {
                log::warn!(
                    "illegal status change for device {}: {} -> {}",
                    device_id,
                    from,
                    new_status
                );
                Ok(false)
            }
            StatusUpdate::NotFound => Ok(false),
        }
    }
}

/// Peer equality for clone decisions compares hosts, not ephemeral ports.
fn peer_host(addr: &str) -> &str {
    addr.rsplit_once(':').map(|(host, _)| host).unwrap_or(addr)
}
