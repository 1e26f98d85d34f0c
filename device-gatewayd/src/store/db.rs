use std::path::Path;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use shared::types::DeviceRecord;
use super::{StoreError, StoreResult};

const SELECT_COLUMNS: &str = "SELECT name, hardware_id, address, last_seen, online FROM devices";

/// Partial update of a device's mutable fields. `None` leaves a field as is.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceUpdate {
    pub address: Option<String>,
    pub last_seen: Option<DateTime<Utc>>,
    pub online: Option<bool>,
}

impl DeviceUpdate {
    /// A successful resolve: new address, seen now, online.
    pub fn seen(address: String, at: DateTime<Utc>) -> Self {
        Self {
            address: Some(address),
            last_seen: Some(at),
            online: Some(true),
        }
    }

    /// A failed resolve or a removal: only the online flag drops.
    pub fn offline() -> Self {
        Self {
            online: Some(false),
            ..Self::default()
        }
    }
}

pub struct DeviceDb {
    conn: Connection,
}

impl DeviceDb {
    /// Open or create the SQLite database with WAL mode enabled
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        // Create parent directory if it doesn't exist
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
            }
        }

        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open database: {}", path.display()))?;

        // Enable WAL mode
        conn.execute_batch("PRAGMA journal_mode=WAL;")
            .context("Failed to enable WAL mode")?;

        // Create tables if they don't exist
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS devices (
                name        TEXT PRIMARY KEY,
                hardware_id TEXT NOT NULL,
                address     TEXT NOT NULL,
                last_seen   TEXT NOT NULL,
                online      INTEGER NOT NULL DEFAULT 0
            );
            "#,
        )
        .context("Failed to create database schema")?;

        Ok(Self { conn })
    }

    /// Create the device if `name` is new, otherwise apply `fields` to the
    /// existing record. Returns the stored record and whether it was created.
    ///
    /// An existing record bound to another hardware id is left untouched.
    pub fn get_or_create(
        &self,
        name: &str,
        hardware_id: &str,
        fields: &DeviceUpdate,
    ) -> StoreResult<(DeviceRecord, bool)> {
        let tx = self.conn.unchecked_transaction()?;

        // Insert, or leave an existing row for the checks below
        let inserted = tx.execute(
            "INSERT INTO devices (name, hardware_id, address, last_seen, online)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(name) DO NOTHING",
            params![
                name,
                hardware_id,
                fields.address.as_deref().unwrap_or_default(),
                fields.last_seen.unwrap_or_else(Utc::now).to_rfc3339(),
                fields.online.unwrap_or(false) as i32,
            ],
        )?;

        if inserted == 0 {
            let existing = Self::select_one(&tx, name)?
                .ok_or_else(|| StoreError::NotFound(name.to_string()))?;
            if existing.hardware_id != hardware_id {
                return Err(StoreError::IdentityMismatch {
                    name: name.to_string(),
                    stored: existing.hardware_id,
                    advertised: hardware_id.to_string(),
                });
            }
            Self::apply_update(&tx, name, fields)?;
        }

        let record = Self::select_one(&tx, name)?
            .ok_or_else(|| StoreError::NotFound(name.to_string()))?;
        tx.commit()?;

        Ok((record, inserted == 1))
    }

    /// Apply a partial update to an existing device
    pub fn update(&self, name: &str, fields: &DeviceUpdate) -> StoreResult<DeviceRecord> {
        let tx = self.conn.unchecked_transaction()?;
        if Self::apply_update(&tx, name, fields)? == 0 {
            return Err(StoreError::NotFound(name.to_string()));
        }
        let record = Self::select_one(&tx, name)?
            .ok_or_else(|| StoreError::NotFound(name.to_string()))?;
        tx.commit()?;
        Ok(record)
    }

    /// Get a single device by name
    pub fn get(&self, name: &str) -> StoreResult<Option<DeviceRecord>> {
        Self::select_one(&self.conn, name)
    }

    /// Get all devices
    pub fn list(&self) -> StoreResult<Vec<DeviceRecord>> {
        let mut stmt = self.conn.prepare(SELECT_COLUMNS)?;
        let devices = stmt
            .query_map([], Self::row_to_record)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(devices)
    }

    fn select_one(conn: &Connection, name: &str) -> StoreResult<Option<DeviceRecord>> {
        let record = conn
            .query_row(
                &format!("{SELECT_COLUMNS} WHERE name = ?1"),
                params![name],
                Self::row_to_record,
            )
            .optional()?;
        Ok(record)
    }

    /// COALESCE keeps the stored value for every field the update leaves out.
    fn apply_update(conn: &Connection, name: &str, fields: &DeviceUpdate) -> StoreResult<usize> {
        let count = conn.execute(
            "UPDATE devices SET
                address   = COALESCE(?1, address),
                last_seen = COALESCE(?2, last_seen),
                online    = COALESCE(?3, online)
             WHERE name = ?4",
            params![
                fields.address,
                fields.last_seen.map(|t| t.to_rfc3339()),
                fields.online.map(i32::from),
                name,
            ],
        )?;
        Ok(count)
    }

    fn row_to_record(row: &rusqlite::Row) -> Result<DeviceRecord, rusqlite::Error> {
        let last_seen_str: String = row.get(3)?;
        let online_int: i32 = row.get(4)?;

        let last_seen = DateTime::parse_from_rfc3339(&last_seen_str)
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(
                3,
                rusqlite::types::Type::Text,
                Box::new(e),
            ))?
            .with_timezone(&Utc);

        Ok(DeviceRecord {
            name: row.get(0)?,
            hardware_id: row.get(1)?,
            address: row.get(2)?,
            last_seen,
            online: online_int != 0,
        })
    }
}
