//! Repository for [`Token`] records: one live credential pair per device.

use rusqlite::{params, OptionalExtension, TransactionBehavior};
use uuid::Uuid;

use crate::columns::{enum_at, fmt_ts, ts_at, uuid_at};
use crate::database::Database;
use crate::error::{Result, StoreError};
use crate::models::Token;

const TOKEN_COLUMNS: &str =
    "id, device_id, access_token, refresh_token, expires_at, token_type, created_at";

impl Database {
    /// Install `token` as the only token of its device, deleting whatever
    /// token the device held before. Both steps commit together.
    pub fn replace_device_token(&self, token: &Token) -> Result<()> {
        let mut conn = self.conn();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let removed = tx.execute(
            "DELETE FROM tokens WHERE device_id = ?1",
            params![token.device_id.to_string()],
        )?;
        tx.execute(
            "INSERT INTO tokens (id, device_id, access_token, refresh_token, expires_at,
                                 token_type, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                token.id.to_string(),
                token.device_id.to_string(),
                token.access_token,
                token.refresh_token,
                token.expires_at,
                token.token_type.as_str(),
                fmt_ts(&token.created_at),
            ],
        )
        .map_err(StoreError::classify)?;
        tx.commit()?;

        tracing::debug!(
            device_id = %token.device_id,
            replaced = removed,
            "device token replaced"
        );
        Ok(())
    }

    pub fn find_token_by_access(&self, access_token: &str) -> Result<Option<Token>> {
        let token = self
            .conn()
            .query_row(
                &format!("SELECT {TOKEN_COLUMNS} FROM tokens WHERE access_token = ?1"),
                params![access_token],
                |row| row_to_token(row, 0),
            )
            .optional()?;
        Ok(token)
    }

    pub fn find_token_by_refresh(&self, refresh_token: &str) -> Result<Option<Token>> {
        let token = self
            .conn()
            .query_row(
                &format!("SELECT {TOKEN_COLUMNS} FROM tokens WHERE refresh_token = ?1"),
                params![refresh_token],
                |row| row_to_token(row, 0),
            )
            .optional()?;
        Ok(token)
    }

    pub fn find_token_for_device(&self, device_id: Uuid) -> Result<Option<Token>> {
        let token = self
            .conn()
            .query_row(
                &format!("SELECT {TOKEN_COLUMNS} FROM tokens WHERE device_id = ?1"),
                params![device_id.to_string()],
                |row| row_to_token(row, 0),
            )
            .optional()?;
        Ok(token)
    }

    /// Rotate the credentials of an existing token row after a refresh.
    /// `refresh_token = None` keeps the stored refresh token.
    pub fn update_token_credentials(
        &self,
        id: Uuid,
        access_token: &str,
        refresh_token: Option<&str>,
        expires_at: i64,
    ) -> Result<()> {
        let affected = self
            .conn()
            .execute(
                "UPDATE tokens
                 SET access_token = ?2,
                     refresh_token = COALESCE(?3, refresh_token),
                     expires_at = ?4
                 WHERE id = ?1",
                params![id.to_string(), access_token, refresh_token, expires_at],
            )
            .map_err(StoreError::classify)?;
        if affected == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    /// Explicit logout. Returns whether a row was removed.
    pub fn delete_token_by_access(&self, access_token: &str) -> Result<bool> {
        let affected = self.conn().execute(
            "DELETE FROM tokens WHERE access_token = ?1",
            params![access_token],
        )?;
        Ok(affected > 0)
    }

    pub fn count_tokens_for_device(&self, device_id: Uuid) -> Result<u32> {
        let count = self.conn().query_row(
            "SELECT COUNT(*) FROM tokens WHERE device_id = ?1",
            params![device_id.to_string()],
            |row| row.get(0),
        )?;
        Ok(count)
    }
}

/// Decode the seven token columns starting at `offset`.
pub(crate) fn row_to_token(row: &rusqlite::Row<'_>, offset: usize) -> rusqlite::Result<Token> {
    Ok(Token {
        id: uuid_at(row, offset)?,
        device_id: uuid_at(row, offset + 1)?,
        access_token: row.get(offset + 2)?,
        refresh_token: row.get(offset + 3)?,
        expires_at: row.get(offset + 4)?,
        token_type: enum_at(row, offset + 5)?,
        created_at: ts_at(row, offset + 6)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::columns::now_millis;
    use crate::models::{Device, User};
    use devmess_shared::types::Provider;

    fn setup() -> (Database, Device) {
        let db = Database::open_in_memory().unwrap();
        let user = User::new_local("A", "a@x", "h".into());
        db.insert_user(&user).unwrap();
        let device = Device {
            id: Uuid::new_v4(),
            user_id: user.id,
            device_type: "Web".into(),
            name: "Chrome".into(),
            ip: "127.0.0.1".into(),
            user_agent: "Chrome/124".into(),
            created_at: now_millis(),
        };
        db.insert_device(&device).unwrap();
        (db, device)
    }

    fn token(device_id: Uuid, access: &str, refresh: &str) -> Token {
        Token {
            id: Uuid::new_v4(),
            device_id,
            access_token: access.into(),
            refresh_token: Some(refresh.into()),
            expires_at: 4_102_444_800,
            token_type: Provider::Local,
            created_at: now_millis(),
        }
    }

    #[test]
    fn replacing_keeps_one_token_per_device() {
        let (db, device) = setup();

        let first = token(device.id, "access-1", "refresh-1");
        db.replace_device_token(&first).unwrap();
        let second = token(device.id, "access-2", "refresh-2");
        db.replace_device_token(&second).unwrap();

        assert_eq!(db.count_tokens_for_device(device.id).unwrap(), 1);
        assert_eq!(db.find_token_for_device(device.id).unwrap().unwrap().id, second.id);
        assert!(db.find_token_by_access("access-1").unwrap().is_none());
        assert!(db.find_token_by_refresh("refresh-2").unwrap().is_some());
    }

    #[test]
    fn user_lookup_by_access_token() {
        let (db, device) = setup();
        db.replace_device_token(&token(device.id, "access-1", "refresh-1"))
            .unwrap();

        let (user, token) = db.find_user_by_access_token("access-1").unwrap().unwrap();
        assert_eq!(user.id, device.user_id);
        assert_eq!(token.refresh_token.as_deref(), Some("refresh-1"));
        assert!(db.find_user_by_access_token("nope").unwrap().is_none());
    }

    #[test]
    fn update_credentials_keeps_refresh_when_absent() {
        let (db, device) = setup();
        let original = token(device.id, "access-1", "refresh-1");
        db.replace_device_token(&original).unwrap();

        db.update_token_credentials(original.id, "access-2", None, 42)
            .unwrap();
        let updated = db.find_token_by_access("access-2").unwrap().unwrap();
        assert_eq!(updated.refresh_token.as_deref(), Some("refresh-1"));
        assert_eq!(updated.expires_at, 42);
    }

    #[test]
    fn logout_deletes_token() {
        let (db, device) = setup();
        db.replace_device_token(&token(device.id, "access-1", "refresh-1"))
            .unwrap();

        assert!(db.delete_token_by_access("access-1").unwrap());
        assert!(!db.delete_token_by_access("access-1").unwrap());
        assert_eq!(db.count_tokens_for_device(device.id).unwrap(), 0);
    }
}
