//! v002 -- Redeemed password-reset tokens.
//!
//! A reset token is identified by its `jti`; recording it on redemption
//! makes every reset link single-use.

use rusqlite::Connection;

const UP_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS password_resets (
    jti         TEXT PRIMARY KEY NOT NULL,     -- reset token id
    user_id     TEXT NOT NULL,
    redeemed_at TEXT NOT NULL,

    FOREIGN KEY (user_id) REFERENCES users(id) ON DELETE CASCADE
);
"#;

pub fn up(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(UP_SQL)
}
