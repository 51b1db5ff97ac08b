//! Durable device registry: SQLite persistence for devices, connections,
//! security alerts, telemetry, audit records and client bindings.
//!
//! The store exclusively owns row writes. Status transitions run inside an
//! immediate transaction so that two concurrent admin actions on one device
//! are applied in lock-acquisition order, never interleaved. Every operation
//! holds the connection only for its own duration; there are no long-held
//! transactions across operations.

use anyhow::{anyhow, Result};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use std::sync::Mutex;

use crate::{now_s, open_db_connection, AlertType, DeviceStatus, DeviceType};

// -------------------- Entities --------------------

/// One physical unit. Identified by the composite hash; plaintext serial and
/// MAC are never stored.
#[derive(Clone, Debug)]
pub struct Device {
    pub id: i64,
    pub device_type: DeviceType,
    pub serial_hash: String,
    pub mac_hash: String,
    pub composite_hash: String,
    pub status: DeviceStatus,
    pub is_critical: bool,
    pub registered_at: u64,
    pub approved_at: Option<u64>,
    pub approved_by: Option<String>,
    pub last_health_check: Option<u64>,
    pub firmware_version: Option<String>,
    pub hardware_version: Option<String>,
}

/// Insertion payload for a device row.
#[derive(Clone, Debug)]
pub struct NewDevice {
    pub device_type: DeviceType,
    pub serial_hash: String,
    pub mac_hash: String,
    pub composite_hash: String,
    pub status: DeviceStatus,
    pub is_critical: bool,
    pub firmware_version: Option<String>,
    pub hardware_version: Option<String>,
}

/// A single live broker session. `disconnected_at = None` means active.
///
/// `device_id` is nullable: a connection row is created on CONNECT even for a
/// device the registry has not seen yet, and bound once registration confirms
/// the identity.
#[derive(Clone, Debug)]
pub struct DeviceConnection {
    pub id: i64,
    pub device_id: Option<i64>,
    pub client_id: String,
    pub peer_addr: String,
    pub client_info: Option<String>,
    pub connected_at: u64,
    pub disconnected_at: Option<u64>,
}

/// Insertion payload for a connection row.
#[derive(Clone, Debug)]
pub struct NewConnection {
    pub device_id: Option<i64>,
    pub client_id: String,
    pub peer_addr: String,
    pub client_info: Option<String>,
}

/// Append-only security event. Never updated, never deleted by the core.
#[derive(Clone, Debug)]
pub struct SecurityAlert {
    pub id: i64,
    pub alert_type: String,
    pub device_serial_hash: Option<String>,
    pub details: serde_json::Value,
    pub created_at: u64,
}

/// Immutable telemetry row. `payload_raw` is stored byte-for-byte.
#[derive(Clone, Debug)]
pub struct TelemetryRecord {
    pub id: i64,
    pub device_id: i64,
    pub received_at: u64,
    pub topic: String,
    pub ts: Option<String>,
    pub measurement: Option<String>,
    pub metric_value: Option<f64>,
    pub payload_raw: Vec<u8>,
}

/// Insertion payload for a telemetry row.
#[derive(Clone, Debug)]
pub struct NewTelemetry {
    pub device_id: i64,
    pub topic: String,
    pub ts: Option<String>,
    pub measurement: Option<String>,
    pub metric_value: Option<f64>,
    pub payload_raw: Vec<u8>,
}

/// Append-only admin audit record.
#[derive(Clone, Debug)]
pub struct AuditLog {
    pub id: i64,
    pub event_type: String,
    pub subject: String,
    pub details: Option<String>,
    pub created_at: u64,
}

/// Maps an external client UUID to a certificate fingerprint and role.
/// Persistence target for the pairing surface.
#[derive(Clone, Debug)]
pub struct ClientBinding {
    pub id: i64,
    pub uuid: String,
    pub fingerprint: String,
    pub role: String,
    pub created_at: u64,
    pub last_seen_at: Option<u64>,
}

/// Result of a guarded status transition.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StatusUpdate {
    /// The edge was legal and committed; carries the previous status.
    Applied { previous: DeviceStatus },
    /// The requested edge is not part of the state machine.
    IllegalTransition { from: DeviceStatus },
    /// No device row with that id.
    NotFound,
}

// -------------------- Store --------------------

pub struct Registry {
    conn: Mutex<Connection>,
}

impl Registry {
    pub fn open(db_path: &str) -> Result<Self> {
        let conn = open_db_connection(db_path)?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.ensure_schema()?;
        Ok(store)
    }

    /// Private in-memory store for tests and embedding.
    pub fn open_in_memory() -> Result<Self> {
        Self::open(&crate::shared_memory_uri())
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow!("registry connection poisoned"))
    }

    fn ensure_schema(&self) -> Result<()> {
        let conn = self.lock()?;
        conn.execute_batch(
            r#"
            PRAGMA journal_mode=WAL;
            PRAGMA foreign_keys=ON;

            CREATE TABLE IF NOT EXISTS devices (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              device_type TEXT NOT NULL,
              serial_hash TEXT NOT NULL,
              mac_hash TEXT NOT NULL,
              composite_hash TEXT NOT NULL UNIQUE,
              status TEXT NOT NULL,
              is_critical INTEGER NOT NULL DEFAULT 0,
              registered_at INTEGER NOT NULL,
              approved_at INTEGER,
              approved_by TEXT,
              last_health_check INTEGER,
              firmware_version TEXT,
              hardware_version TEXT
            );

            CREATE TABLE IF NOT EXISTS device_connections (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              device_id INTEGER REFERENCES devices(id),
              client_id TEXT NOT NULL,
              peer_addr TEXT NOT NULL,
              client_info TEXT,
              connected_at INTEGER NOT NULL,
              disconnected_at INTEGER
            );

            CREATE TABLE IF NOT EXISTS security_alerts (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              alert_type TEXT NOT NULL,
              device_serial_hash TEXT,
              details TEXT NOT NULL,
              created_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS telemetry (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              device_id INTEGER NOT NULL REFERENCES devices(id),
              received_at INTEGER NOT NULL,
              topic TEXT NOT NULL,
              ts TEXT,
              measurement TEXT,
              metric_value REAL,
              payload_raw BLOB NOT NULL
            );

            CREATE TABLE IF NOT EXISTS audit_logs (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              event_type TEXT NOT NULL,
              subject TEXT NOT NULL,
              details TEXT,
              created_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS client_bindings (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              uuid TEXT NOT NULL UNIQUE,
              fingerprint TEXT NOT NULL,
              role TEXT NOT NULL,
              created_at INTEGER NOT NULL,
              last_seen_at INTEGER
            );

            CREATE INDEX IF NOT EXISTS idx_devices_serial ON devices(serial_hash);
            CREATE INDEX IF NOT EXISTS idx_devices_status ON devices(status);
            CREATE INDEX IF NOT EXISTS idx_connections_active
              ON device_connections(device_id, disconnected_at);
            CREATE INDEX IF NOT EXISTS idx_connections_client
              ON device_connections(client_id, disconnected_at);
            CREATE INDEX IF NOT EXISTS idx_alerts_type ON security_alerts(alert_type);
            CREATE INDEX IF NOT EXISTS idx_alerts_serial ON security_alerts(device_serial_hash);
            CREATE INDEX IF NOT EXISTS idx_telemetry_device
              ON telemetry(device_id, received_at);
            "#,
        )?;
        Ok(())
    }

    // -------------------- Devices --------------------

    /// Insert-or-return-existing, keyed by `composite_hash`. Returns the row
    /// and whether it was inserted by this call.
    pub fn upsert_device_if_absent(&self, device: &NewDevice) -> Result<(Device, bool)> {
        let registered_at = now_s()? as i64;
        let inserted = {
            let conn = self.lock()?;
            let result = conn.execute(
                r#"
                INSERT INTO devices(device_type, serial_hash, mac_hash, composite_hash,
                                    status, is_critical, registered_at,
                                    firmware_version, hardware_version)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
                "#,
                params![
                    device.device_type.as_str(),
                    device.serial_hash,
                    device.mac_hash,
                    device.composite_hash,
                    device.status.as_str(),
                    device.is_critical as i64,
                    registered_at,
                    device.firmware_version,
                    device.hardware_version,
                ],
            );
            match result {
                Ok(_) => true,
                Err(e) if is_unique_violation(&e) => {
                    log::debug!(
                        "device insert for composite {} hit existing row",
                        device.composite_hash
                    );
                    false
                }
                Err(e) => return Err(e.into()),
            }
        };
        let row = self
            .find_by_composite_hash(&device.composite_hash)?
            .ok_or_else(|| anyhow!("device vanished after upsert"))?;
        Ok((row, inserted))
    }

    /// Transition a device's status under a row-exclusive lock.
    ///
    /// `actor` is recorded as `approved_by` when the new status is APPROVED.
    /// The matching audit alert is emitted by the calling service after this
    /// returns `Applied`, not by the store.
    pub fn update_status(
        &self,
        device_id: i64,
        new_status: DeviceStatus,
        actor: Option<&str>,
    ) -> Result<StatusUpdate> {
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let current: Option<String> = tx
            .query_row(
                "SELECT status FROM devices WHERE id = ?1",
                params![device_id],
                |row| row.get(0),
            )
            .optional()?;
        let Some(current) = current else {
            return Ok(StatusUpdate::NotFound);
        };
        let current = DeviceStatus::parse(&current)?;

        if !DeviceStatus::can_transition(current, new_status) {
            return Ok(StatusUpdate::IllegalTransition { from: current });
        }

        if new_status == DeviceStatus::Approved {
            let approved_at = now_s()? as i64;
            tx.execute(
                "UPDATE devices SET status = ?1, approved_at = ?2, approved_by = ?3 WHERE id = ?4",
                params![new_status.as_str(), approved_at, actor, device_id],
            )?;
        } else {
            tx.execute(
                "UPDATE devices SET status = ?1 WHERE id = ?2",
                params![new_status.as_str(), device_id],
            )?;
        }
        tx.commit()?;
        Ok(StatusUpdate::Applied { previous: current })
    }

    pub fn mark_critical(&self, device_id: i64) -> Result<bool> {
        let conn = self.lock()?;
        let changed = conn.execute(
            "UPDATE devices SET is_critical = 1 WHERE id = ?1",
            params![device_id],
        )?;
        Ok(changed > 0)
    }

    /// Idempotent wallclock write of the last seen health check.
    pub fn update_last_health_check(&self, device_id: i64) -> Result<()> {
        let now = now_s()? as i64;
        let conn = self.lock()?;
        conn.execute(
            "UPDATE devices SET last_health_check = ?1 WHERE id = ?2",
            params![now, device_id],
        )?;
        Ok(())
    }

    /// Update the mutable registration metadata without touching status.
    pub fn update_device_metadata(
        &self,
        device_id: i64,
        device_type: DeviceType,
        firmware_version: Option<&str>,
        hardware_version: Option<&str>,
    ) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            r#"
            UPDATE devices
            SET device_type = ?1,
                firmware_version = COALESCE(?2, firmware_version),
                hardware_version = COALESCE(?3, hardware_version)
            WHERE id = ?4
            "#,
            params![
                device_type.as_str(),
                firmware_version,
                hardware_version,
                device_id
            ],
        )?;
        Ok(())
    }

    pub fn find_by_id(&self, device_id: i64) -> Result<Option<Device>> {
        let conn = self.lock()?;
        Self::query_device(&conn, "WHERE id = ?1", params![device_id])
    }

    pub fn find_by_serial_hash(&self, serial_hash: &str) -> Result<Option<Device>> {
        let conn = self.lock()?;
        Self::query_device(&conn, "WHERE serial_hash = ?1", params![serial_hash])
    }

    pub fn find_by_composite_hash(&self, composite_hash: &str) -> Result<Option<Device>> {
        let conn = self.lock()?;
        Self::query_device(&conn, "WHERE composite_hash = ?1", params![composite_hash])
    }

    pub fn find_by_status(&self, status: DeviceStatus) -> Result<Vec<Device>> {
        let conn = self.lock()?;
        Self::query_devices(&conn, "WHERE status = ?1", params![status.as_str()])
    }

    pub fn find_all(&self) -> Result<Vec<Device>> {
        let conn = self.lock()?;
        Self::query_devices(&conn, "", params![])
    }

    fn query_device(
        conn: &Connection,
        filter: &str,
        args: impl rusqlite::Params,
    ) -> Result<Option<Device>> {
        let sql = format!("{} {} LIMIT 1", DEVICE_SELECT, filter);
        let mut stmt = conn.prepare(&sql)?;
        let device = stmt.query_row(args, row_to_device).optional()?;
        Ok(device)
    }

    fn query_devices(
        conn: &Connection,
        filter: &str,
        args: impl rusqlite::Params,
    ) -> Result<Vec<Device>> {
        let sql = format!("{} {} ORDER BY id ASC", DEVICE_SELECT, filter);
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(args, row_to_device)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    // -------------------- Connections --------------------

    pub fn create_connection(&self, connection: &NewConnection) -> Result<i64> {
        let connected_at = now_s()? as i64;
        let conn = self.lock()?;
        conn.execute(
            r#"
            INSERT INTO device_connections(device_id, client_id, peer_addr, client_info, connected_at)
            VALUES (?1, ?2, ?3, ?4, ?5)
            "#,
            params![
                connection.device_id,
                connection.client_id,
                connection.peer_addr,
                connection.client_info,
                connected_at
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn close_connection(&self, connection_id: i64) -> Result<bool> {
        let now = now_s()? as i64;
        let conn = self.lock()?;
        let changed = conn.execute(
            "UPDATE device_connections SET disconnected_at = ?1 WHERE id = ?2 AND disconnected_at IS NULL",
            params![now, connection_id],
        )?;
        Ok(changed > 0)
    }

    pub fn close_all_for_device(&self, device_id: i64) -> Result<usize> {
        let now = now_s()? as i64;
        let conn = self.lock()?;
        let changed = conn.execute(
            "UPDATE device_connections SET disconnected_at = ?1 WHERE device_id = ?2 AND disconnected_at IS NULL",
            params![now, device_id],
        )?;
        Ok(changed)
    }

    pub fn find_active_by_device_id(&self, device_id: i64) -> Result<Option<DeviceConnection>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!(
            "{} WHERE device_id = ?1 AND disconnected_at IS NULL ORDER BY id DESC LIMIT 1",
            CONNECTION_SELECT
        ))?;
        let row = stmt
            .query_row(params![device_id], row_to_connection)
            .optional()?;
        Ok(row)
    }

    pub fn find_active_by_client_id(&self, client_id: &str) -> Result<Option<DeviceConnection>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!(
            "{} WHERE client_id = ?1 AND disconnected_at IS NULL ORDER BY id DESC LIMIT 1",
            CONNECTION_SELECT
        ))?;
        let row = stmt
            .query_row(params![client_id], row_to_connection)
            .optional()?;
        Ok(row)
    }

    pub fn find_active_connections(&self) -> Result<Vec<DeviceConnection>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!(
            "{} WHERE disconnected_at IS NULL ORDER BY id ASC",
            CONNECTION_SELECT
        ))?;
        let rows = stmt.query_map([], row_to_connection)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Bind a pre-created connection row to a device once registration has
    /// confirmed the identity.
    pub fn bind_connection_device(&self, connection_id: i64, device_id: i64) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "UPDATE device_connections SET device_id = ?1 WHERE id = ?2",
            params![device_id, connection_id],
        )?;
        Ok(())
    }

    /// Detach a connection from its device after an identity mismatch.
    pub fn detach_connection_device(&self, connection_id: i64) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "UPDATE device_connections SET device_id = NULL WHERE id = ?1",
            params![connection_id],
        )?;
        Ok(())
    }

    // -------------------- Alerts --------------------

    pub fn insert_alert(
        &self,
        alert_type: AlertType,
        device_serial_hash: Option<&str>,
        details: &serde_json::Value,
    ) -> Result<i64> {
        let created_at = now_s()? as i64;
        let conn = self.lock()?;
        conn.execute(
            r#"
            INSERT INTO security_alerts(alert_type, device_serial_hash, details, created_at)
            VALUES (?1, ?2, ?3, ?4)
            "#,
            params![
                alert_type.as_str(),
                device_serial_hash,
                details.to_string(),
                created_at
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn find_alerts_by_type(&self, alert_type: AlertType) -> Result<Vec<SecurityAlert>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!(
            "{} WHERE alert_type = ?1 ORDER BY id ASC",
            ALERT_SELECT
        ))?;
        let rows = stmt.query_map(params![alert_type.as_str()], row_to_alert)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    pub fn find_alerts_by_serial_hash(&self, serial_hash: &str) -> Result<Vec<SecurityAlert>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!(
            "{} WHERE device_serial_hash = ?1 ORDER BY id ASC",
            ALERT_SELECT
        ))?;
        let rows = stmt.query_map(params![serial_hash], row_to_alert)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    pub fn find_all_alerts(&self) -> Result<Vec<SecurityAlert>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!("{} ORDER BY id ASC", ALERT_SELECT))?;
        let rows = stmt.query_map([], row_to_alert)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    // -------------------- Telemetry --------------------

    pub fn insert_telemetry(&self, record: &NewTelemetry) -> Result<i64> {
        let received_at = now_s()? as i64;
        let conn = self.lock()?;
        conn.execute(
            r#"
            INSERT INTO telemetry(device_id, received_at, topic, ts, measurement, metric_value, payload_raw)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            "#,
            params![
                record.device_id,
                received_at,
                record.topic,
                record.ts,
                record.measurement,
                record.metric_value,
                record.payload_raw
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn count_telemetry_for_device(&self, device_id: i64) -> Result<u64> {
        let conn = self.lock()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM telemetry WHERE device_id = ?1",
            params![device_id],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    pub fn find_telemetry_for_device(&self, device_id: i64) -> Result<Vec<TelemetryRecord>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT id, device_id, received_at, topic, ts, measurement, metric_value, payload_raw
            FROM telemetry WHERE device_id = ?1 ORDER BY id ASC
            "#,
        )?;
        let rows = stmt.query_map(params![device_id], |row| {
            Ok(TelemetryRecord {
                id: row.get(0)?,
                device_id: row.get(1)?,
                received_at: row.get::<_, i64>(2)? as u64,
                topic: row.get(3)?,
                ts: row.get(4)?,
                measurement: row.get(5)?,
                metric_value: row.get(6)?,
                payload_raw: row.get(7)?,
            })
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    // -------------------- Audit + bindings --------------------

    pub fn insert_audit(&self, event_type: &str, subject: &str, details: Option<&str>) -> Result<i64> {
        let created_at = now_s()? as i64;
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO audit_logs(event_type, subject, details, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![event_type, subject, details, created_at],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn find_audit_by_subject(&self, subject: &str) -> Result<Vec<AuditLog>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT id, event_type, subject, details, created_at FROM audit_logs WHERE subject = ?1 ORDER BY id ASC",
        )?;
        let rows = stmt.query_map(params![subject], |row| {
            Ok(AuditLog {
                id: row.get(0)?,
                event_type: row.get(1)?,
                subject: row.get(2)?,
                details: row.get(3)?,
                created_at: row.get::<_, i64>(4)? as u64,
            })
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Insert or refresh a binding keyed by the external client UUID.
    pub fn upsert_binding(&self, uuid: &str, fingerprint: &str, role: &str) -> Result<()> {
        let created_at = now_s()? as i64;
        let conn = self.lock()?;
        conn.execute(
            r#"
            INSERT INTO client_bindings(uuid, fingerprint, role, created_at)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT(uuid) DO UPDATE SET fingerprint = excluded.fingerprint, role = excluded.role
            "#,
            params![uuid, fingerprint, role, created_at],
        )?;
        Ok(())
    }

    pub fn find_binding_by_uuid(&self, uuid: &str) -> Result<Option<ClientBinding>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT id, uuid, fingerprint, role, created_at, last_seen_at FROM client_bindings WHERE uuid = ?1",
        )?;
        let row = stmt
            .query_row(params![uuid], |row| {
                Ok(ClientBinding {
                    id: row.get(0)?,
                    uuid: row.get(1)?,
                    fingerprint: row.get(2)?,
                    role: row.get(3)?,
                    created_at: row.get::<_, i64>(4)? as u64,
                    last_seen_at: row.get::<_, Option<i64>>(5)?.map(|v| v as u64),
                })
            })
            .optional()?;
        Ok(row)
    }

    pub fn touch_binding_last_seen(&self, uuid: &str) -> Result<()> {
        let now = now_s()? as i64;
        let conn = self.lock()?;
        conn.execute(
            "UPDATE client_bindings SET last_seen_at = ?1 WHERE uuid = ?2",
            params![now, uuid],
        )?;
        Ok(())
    }
}

const DEVICE_SELECT: &str = r#"
SELECT id, device_type, serial_hash, mac_hash, composite_hash, status, is_critical,
       registered_at, approved_at, approved_by, last_health_check,
       firmware_version, hardware_version
FROM devices
"#;

const CONNECTION_SELECT: &str = r#"
SELECT id, device_id, client_id, peer_addr, client_info, connected_at, disconnected_at
FROM device_connections
"#;

const ALERT_SELECT: &str = r#"
SELECT id, alert_type, device_serial_hash, details, created_at
FROM security_alerts
"#;

fn row_to_device(row: &rusqlite::Row<'_>) -> rusqlite::Result<Device> {
    let device_type: String = row.get(1)?;
    let status: String = row.get(5)?;
    Ok(Device {
        id: row.get(0)?,
        device_type: DeviceType::parse(&device_type).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(1, rusqlite::types::Type::Text, e.into())
        })?,
        serial_hash: row.get(2)?,
        mac_hash: row.get(3)?,
        composite_hash: row.get(4)?,
        status: DeviceStatus::parse(&status).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(5, rusqlite::types::Type::Text, e.into())
        })?,
        is_critical: row.get::<_, i64>(6)? != 0,
        registered_at: row.get::<_, i64>(7)? as u64,
        approved_at: row.get::<_, Option<i64>>(8)?.map(|v| v as u64),
        approved_by: row.get(9)?,
        last_health_check: row.get::<_, Option<i64>>(10)?.map(|v| v as u64),
        firmware_version: row.get(11)?,
        hardware_version: row.get(12)?,
    })
}

fn row_to_connection(row: &rusqlite::Row<'_>) -> rusqlite::Result<DeviceConnection> {
    Ok(DeviceConnection {
        id: row.get(0)?,
        device_id: row.get(1)?,
        client_id: row.get(2)?,
        peer_addr: row.get(3)?,
        client_info: row.get(4)?,
        connected_at: row.get::<_, i64>(5)? as u64,
        disconnected_at: row.get::<_, Option<i64>>(6)?.map(|v| v as u64),
    })
}

fn row_to_alert(row: &rusqlite::Row<'_>) -> rusqlite::Result<SecurityAlert> {
    let details: String = row.get(3)?;
    Ok(SecurityAlert {
        id: row.get(0)?,
        alert_type: row.get(1)?,
        device_serial_hash: row.get(2)?,
        details: serde_json::from_str(&details).unwrap_or(serde_json::Value::Null),
        created_at: row.get::<_, i64>(4)? as u64,
    })
}

/// Typed match on the driver error for the idempotent-insert suppress list.
pub(crate) fn is_unique_violation(err: &rusqlite::Error) -> bool {
    match err {
        rusqlite::Error::SqliteFailure(e, _) => {
            e.code == rusqlite::ErrorCode::ConstraintViolation
                && (e.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
                    || e.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_PRIMARYKEY)
        }
        _ => false,
    }
}
