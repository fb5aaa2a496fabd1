//! Schema migrations, applied in order when a [`crate::Database`] opens.
//!
//! The applied level lives in SQLite's `user_version` pragma. Each step runs
//! inside its own transaction together with the pragma bump, so a failed
//! step leaves the previous level intact.

pub mod v001_initial;
pub mod v002_password_resets;

use rusqlite::Connection;

use crate::error::{Result, StoreError};

type Step = fn(&Connection) -> rusqlite::Result<()>;

/// `(version, name, step)`, ascending.
const STEPS: &[(u32, &str, Step)] = &[
    (1, "v001_initial", v001_initial::up),
    (2, "v002_password_resets", v002_password_resets::up),
];

/// Schema level after every step has run.
pub const CURRENT_VERSION: u32 = 2;

pub fn run_migrations(conn: &Connection) -> Result<()> {
    let applied: u32 = conn.pragma_query_value(None, "user_version", |row| row.get(0))?;
    if applied > CURRENT_VERSION {
        return Err(StoreError::Migration(format!(
            "database is at schema {applied}, newer than supported {CURRENT_VERSION}"
        )));
    }

    for &(version, name, step) in STEPS.iter().filter(|(v, _, _)| *v > applied) {
        tracing::info!(version, name, "Applying migration");
        conn.execute_batch("BEGIN IMMEDIATE")?;
        let outcome = step(conn).and_then(|()| conn.pragma_update(None, "user_version", version));
        match outcome {
            Ok(()) => conn.execute_batch("COMMIT")?,
            Err(e) => {
                let _ = conn.execute_batch("ROLLBACK");
                return Err(StoreError::Migration(format!("{name}: {e}")));
            }
        }
    }

    Ok(())
}
