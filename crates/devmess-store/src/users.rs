//! Repository for [`User`] records. Soft-deleted users are invisible to
//! every query here.

use rusqlite::{params, OptionalExtension, TransactionBehavior};
use uuid::Uuid;

use crate::columns::{enum_at, fmt_opt_ts, fmt_ts, now_millis, opt_ts_at, ts_at, uuid_at};
use crate::database::Database;
use crate::error::{Result, StoreError};
use crate::models::{Token, User};

/// Column list matching [`row_to_user`]; `u` must alias `users`.
pub(crate) const USER_COLUMNS: &str = "u.id, u.name, u.email, u.password_hash, u.avatar, \
     u.provider, u.status, u.last_seen, u.created_at, u.updated_at";

impl Database {
    // ------------------------------------------------------------------
    // Create
    // ------------------------------------------------------------------

    /// Insert a new user. A duplicate email yields [`StoreError::Conflict`].
    pub fn insert_user(&self, user: &User) -> Result<()> {
        self.conn()
            .execute(
                "INSERT INTO users (id, name, email, password_hash, avatar, provider, status,
                                    last_seen, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    user.id.to_string(),
                    user.name,
                    user.email.to_lowercase(),
                    user.password_hash,
                    user.avatar,
                    user.provider.as_str(),
                    user.status.as_str(),
                    fmt_opt_ts(&user.last_seen),
                    fmt_ts(&user.created_at),
                    fmt_ts(&user.updated_at),
                ],
            )
            .map_err(StoreError::classify)?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Read
    // ------------------------------------------------------------------

    pub fn get_user(&self, id: Uuid) -> Result<User> {
        self.conn()
            .query_row(
                &format!(
                    "SELECT {USER_COLUMNS} FROM users u
                     WHERE u.id = ?1 AND u.deleted_at IS NULL"
                ),
                params![id.to_string()],
                |row| row_to_user(row, 0),
            )
            .map_err(StoreError::classify)
    }

    pub fn find_user_by_email(&self, email: &str) -> Result<Option<User>> {
        let user = self
            .conn()
            .query_row(
                &format!(
                    "SELECT {USER_COLUMNS} FROM users u
                     WHERE u.email = ?1 AND u.deleted_at IS NULL"
                ),
                params![email.trim().to_lowercase()],
                |row| row_to_user(row, 0),
            )
            .optional()?;
        Ok(user)
    }

    /// Resolve the owner of an access token together with the token row,
    /// regardless of whether the token has expired.
    pub fn find_user_by_access_token(&self, access_token: &str) -> Result<Option<(User, Token)>> {
        let found = self
            .conn()
            .query_row(
                &format!(
                    "SELECT {USER_COLUMNS},
                            t.id, t.device_id, t.access_token, t.refresh_token,
                            t.expires_at, t.token_type, t.created_at
                     FROM tokens t
                     JOIN devices d ON d.id = t.device_id
                     JOIN users u ON u.id = d.user_id
                     WHERE t.access_token = ?1 AND u.deleted_at IS NULL"
                ),
                params![access_token],
                |row| {
                    let user = row_to_user(row, 0)?;
                    let token = crate::tokens::row_to_token(row, 10)?;
                    Ok((user, token))
                },
            )
            .optional()?;
        Ok(found)
    }

    // ------------------------------------------------------------------
    // Update
    // ------------------------------------------------------------------

    /// Redeem the reset token `jti`: set the new password hash and drop
    /// every session of the user, all in one transaction. Returns the access
    /// tokens that were revoked. A `jti` redeemed before yields
    /// [`StoreError::Conflict`].
    pub fn redeem_password_reset(
        &self,
        id: Uuid,
        jti: Uuid,
        password_hash: &str,
    ) -> Result<Vec<String>> {
        let mut conn = self.conn();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let now = fmt_ts(&now_millis());

        tx.execute(
            "INSERT INTO password_resets (jti, user_id, redeemed_at) VALUES (?1, ?2, ?3)",
            params![jti.to_string(), id.to_string(), now],
        )
        .map_err(StoreError::classify)?;

        let affected = tx.execute(
            "UPDATE users SET password_hash = ?2, updated_at = ?3
             WHERE id = ?1 AND provider = 'local' AND deleted_at IS NULL",
            params![id.to_string(), password_hash, now],
        )?;
        if affected == 0 {
            return Err(StoreError::NotFound);
        }

        let revoked = {
            let mut stmt = tx.prepare(
                "SELECT t.access_token FROM tokens t
                 JOIN devices d ON d.id = t.device_id
                 WHERE d.user_id = ?1",
            )?;
            let rows = stmt.query_map(params![id.to_string()], |row| row.get(0))?;
            rows.collect::<rusqlite::Result<Vec<String>>>()?
        };
        tx.execute(
            "DELETE FROM tokens
             WHERE device_id IN (SELECT id FROM devices WHERE user_id = ?1)",
            params![id.to_string()],
        )?;
        tx.commit()?;

        Ok(revoked)
    }
}

/// Decode the ten [`USER_COLUMNS`] starting at `offset`.
pub(crate) fn row_to_user(row: &rusqlite::Row<'_>, offset: usize) -> rusqlite::Result<User> {
    Ok(User {
        id: uuid_at(row, offset)?,
        name: row.get(offset + 1)?,
        email: row.get(offset + 2)?,
        password_hash: row.get(offset + 3)?,
        avatar: row.get(offset + 4)?,
        provider: enum_at(row, offset + 5)?,
        status: enum_at(row, offset + 6)?,
        last_seen: opt_ts_at(row, offset + 7)?,
        created_at: ts_at(row, offset + 8)?,
        updated_at: ts_at(row, offset + 9)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use devmess_shared::types::Provider;

    fn db() -> Database {
        Database::open_in_memory().unwrap()
    }

    #[test]
    fn insert_and_lookup() {
        let db = db();
        let user = User::new_local("Alice", "Alice@Example.com", "$argon2id$x".into());
        db.insert_user(&user).unwrap();

        let by_id = db.get_user(user.id).unwrap();
        assert_eq!(by_id.email, "alice@example.com");
        assert_eq!(by_id.password_hash.as_deref(), Some("$argon2id$x"));

        let by_email = db.find_user_by_email(" ALICE@example.com ").unwrap().unwrap();
        assert_eq!(by_email.id, user.id);
        assert!(db.find_user_by_email("bob@example.com").unwrap().is_none());
    }

    #[test]
    fn duplicate_email_conflicts() {
        let db = db();
        db.insert_user(&User::new_local("A", "a@x", "h1".into())).unwrap();
        let err = db
            .insert_user(&User::new_local("B", "A@X", "h2".into()))
            .unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
    }

    #[test]
    fn local_accounts_require_password_hash() {
        let db = db();
        let mut user = User::new_local("A", "a@x", "h".into());
        user.password_hash = None;
        assert!(db.insert_user(&user).is_err());

        let federated = User::new_federated("G", "g@x", Provider::Google);
        db.insert_user(&federated).unwrap();
        assert!(db
            .redeem_password_reset(federated.id, Uuid::new_v4(), "h")
            .is_err());
    }

    #[test]
    fn password_reset_is_single_use_and_revokes_sessions() {
        use crate::models::Device;

        let db = db();
        let user = User::new_local("A", "a@x", "old".into());
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
        db.replace_device_token(&Token {
            id: Uuid::new_v4(),
            device_id: device.id,
            access_token: "access-1".into(),
            refresh_token: Some("refresh-1".into()),
            expires_at: 4_102_444_800,
            token_type: Provider::Local,
            created_at: now_millis(),
        })
        .unwrap();

        let jti = Uuid::new_v4();
        let revoked = db.redeem_password_reset(user.id, jti, "new").unwrap();
        assert_eq!(revoked, vec!["access-1".to_string()]);
        assert!(db.find_token_by_access("access-1").unwrap().is_none());
        assert_eq!(db.get_user(user.id).unwrap().password_hash.as_deref(), Some("new"));

        assert!(matches!(
            db.redeem_password_reset(user.id, jti, "again"),
            Err(StoreError::Conflict(_))
        ));
        assert_eq!(db.get_user(user.id).unwrap().password_hash.as_deref(), Some("new"));
    }
}
