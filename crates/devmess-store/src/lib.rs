//! # devmess-store
//!
//! Durable storage for devmess, backed by SQLite.
//!
//! The crate exposes a synchronous [`Database`] handle that serialises access
//! to one `rusqlite::Connection` and provides typed repositories for every
//! entity: users, devices, tokens, friendships, conversations, participants
//! and messages. Multi-row invariants (one token per device, one direct
//! conversation per pair, the last-message pointer) are enforced inside a
//! single transaction.

pub mod columns;
pub mod conversations;
pub mod database;
pub mod devices;
pub mod friendships;
pub mod messages;
pub mod migrations;
pub mod models;
pub mod participants;
pub mod tokens;
pub mod users;

mod error;

pub use database::Database;
pub use error::{Result, StoreError};
pub use models::*;
