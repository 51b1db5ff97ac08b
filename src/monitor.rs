//! Periodic health-check monitor: flags silent devices and tears down their
//! stale connection rows.

use anyhow::Result;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crate::registry::Registry;
use crate::{now_s, AlertType};

/// Scan period.
pub const DEFAULT_MONITOR_PERIOD: Duration = Duration::from_secs(2 * 60);

/// A device with no health signal for this long and no active connection is
/// offline.
pub const DEFAULT_OFFLINE_AFTER: Duration = Duration::from_secs(3 * 60);

/// Counters from one scan pass.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ScanStats {
    pub devices_seen: usize,
    pub offline_alerts: usize,
    pub connections_closed: usize,
}

/// One pass over all devices.
///
/// - never-seen device (no health, no connection): offline alert
/// - stale device (health older than the threshold, no connection): offline
///   alert plus connection sweep
/// - device with an active connection: skipped, its next health may be
///   in flight
pub fn scan_once(registry: &Registry, offline_after: Duration) -> Result<ScanStats> {
    let now = now_s()?;
    let mut stats = ScanStats::default();

    for device in registry.find_all()? {
        stats.devices_seen += 1;

        if registry.find_active_by_device_id(device.id)?.is_some() {
            continue;
        }

        match device.last_health_check {
            None => {
                registry.insert_alert(
                    AlertType::DeviceOffline,
                    Some(&device.serial_hash),
                    &serde_json::json!({ "reason": "never_reported" }),
                )?;
                stats.offline_alerts += 1;
                log::warn!("device {} offline: no health check ever received", device.id);
            }
            Some(last) if now.saturating_sub(last) > offline_after.as_secs() => {
                registry.insert_alert(
                    AlertType::DeviceOffline,
                    Some(&device.serial_hash),
                    &serde_json::json!({
                        "reason": "health_stale",
                        "last_health_check": last,
                    }),
                )?;
                stats.offline_alerts += 1;
                stats.connections_closed += registry.close_all_for_device(device.id)?;
                log::warn!(
                    "device {} offline: last health {}s ago",
                    device.id,
                    now.saturating_sub(last)
                );
            }
            Some(_) => {}
        }
    }
    Ok(stats)
}

/// Single-threaded periodic monitor. Responds to the shutdown signal within
/// one receive timeout.
pub struct HealthMonitor {
    shutdown_tx: mpsc::Sender<()>,
    handle: Option<thread::JoinHandle<()>>,
}

impl HealthMonitor {
    pub fn start(registry: Arc<Registry>, period: Duration, offline_after: Duration) -> Result<Self> {
        let (shutdown_tx, shutdown_rx) = mpsc::channel();
        let handle = thread::Builder::new()
            .name("hub-health-monitor".to_string())
            .spawn(move || loop {
                match shutdown_rx.recv_timeout(period) {
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    Err(RecvTimeoutError::Timeout) => {}
                }
                match scan_once(&registry, offline_after) {
                    Ok(stats) => log::debug!(
                        "health scan: {} devices, {} offline alerts, {} connections closed",
                        stats.devices_seen,
                        stats.offline_alerts,
                        stats.connections_closed
                    ),
                    Err(e) => log::error!("health scan failed: {}", e),
                }
            })?;
        Ok(Self {
            shutdown_tx,
            handle: Some(handle),
        })
    }

    pub fn stop(mut self) {
        let _ = self.shutdown_tx.send(());
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for HealthMonitor {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(());
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}
