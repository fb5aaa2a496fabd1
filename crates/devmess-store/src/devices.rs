//! Repository for [`Device`] records.

use rusqlite::{params, OptionalExtension};
use uuid::Uuid;

use crate::columns::{fmt_ts, ts_at, uuid_at};
use crate::database::Database;
use crate::error::{Result, StoreError};
use crate::models::Device;

impl Database {
    /// Look up the device a user signed in from with this exact
    /// `(ip, user_agent)` pair.
    pub fn find_device(&self, user_id: Uuid, ip: &str, user_agent: &str) -> Result<Option<Device>> {
        let device = self
            .conn()
            .query_row(
                "SELECT id, user_id, type, name, ip, user_agent, created_at
                 FROM devices
                 WHERE user_id = ?1 AND ip = ?2 AND user_agent = ?3",
                params![user_id.to_string(), ip, user_agent],
                row_to_device,
            )
            .optional()?;
        Ok(device)
    }

    pub fn insert_device(&self, device: &Device) -> Result<()> {
        self.conn()
            .execute(
                "INSERT INTO devices (id, user_id, type, name, ip, user_agent, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    device.id.to_string(),
                    device.user_id.to_string(),
                    device.device_type,
                    device.name,
                    device.ip,
                    device.user_agent,
                    fmt_ts(&device.created_at),
                ],
            )
            .map_err(StoreError::classify)?;
        Ok(())
    }
}

fn row_to_device(row: &rusqlite::Row<'_>) -> rusqlite::Result<Device> {
    Ok(Device {
        id: uuid_at(row, 0)?,
        user_id: uuid_at(row, 1)?,
        device_type: row.get(2)?,
        name: row.get(3)?,
        ip: row.get(4)?,
        user_agent: row.get(5)?,
        created_at: ts_at(row, 6)?,
    })
}
