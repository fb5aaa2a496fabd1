//! Typed cache adapter.
//!
//! [`Cache`] owns the key layout and serialisation; the byte-level work is
//! delegated to a [`KeyValueStore`]: Redis in production, an in-process map
//! in tests or when Redis cannot be reached at startup. Every operation is
//! bounded by a deadline, and callers treat any [`CacheError`] as a miss.
//!
//! Key layout:
//! - `token:<access>` -> user JSON, TTL = remaining access-token lifetime
//! - `token-participants:<conversation_id>` -> participant list JSON
//! - `conversation:<min(u1,u2)>:<max(u1,u2)>` -> direct conversation JSON
//! - `online:<user_id>` -> `"1"`, TTL 300 s
//! - hash `user_last_seen` field `<user_id>` -> epoch seconds

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, info};
use uuid::Uuid;

use devmess_shared::constants::{CACHE_OP_TIMEOUT_SECS, PRESENCE_TTL_SECS};
use devmess_store::{Conversation, Participant, User};

const LAST_SEEN_HASH: &str = "user_last_seen";

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("Cache operation timed out")]
    Timeout,

    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Cache serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

// ---------------------------------------------------------------------------
// Key/value backends
// ---------------------------------------------------------------------------

/// The handful of commands the typed adapter needs.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError>;
    async fn set_ex(&self, key: &str, value: &str, ttl_secs: u64) -> Result<(), CacheError>;
    async fn del(&self, key: &str) -> Result<(), CacheError>;
    /// Remaining lifetime in seconds; `-2` when the key is missing and `-1`
    /// when it has no expiry (Redis `TTL` semantics).
    async fn ttl(&self, key: &str) -> Result<i64, CacheError>;
    async fn hset(&self, hash: &str, field: &str, value: &str) -> Result<(), CacheError>;
    async fn hget(&self, hash: &str, field: &str) -> Result<Option<String>, CacheError>;
    async fn ping(&self) -> Result<(), CacheError>;
}

/// Redis backend over one multiplexed connection.
#[derive(Clone)]
pub struct RedisStore {
    conn: MultiplexedConnection,
}

impl RedisStore {
    pub async fn connect(url: &str) -> Result<Self, CacheError> {
        let client = redis::Client::open(url)?;
        let conn = client.get_multiplexed_async_connection().await?;
        info!(url = %url, "Connected to Redis");
        Ok(Self { conn })
    }
}

#[async_trait]
impl KeyValueStore for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        let mut conn = self.conn.clone();
        let value: Option<String> = redis::cmd("GET").arg(key).query_async(&mut conn).await?;
        Ok(value)
    }

    async fn set_ex(&self, key: &str, value: &str, ttl_secs: u64) -> Result<(), CacheError> {
        let mut conn = self.conn.clone();
        redis::cmd("SETEX")
            .arg(key)
            .arg(ttl_secs)
            .arg(value)
            .query_async::<()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn del(&self, key: &str) -> Result<(), CacheError> {
        let mut conn = self.conn.clone();
        redis::cmd("DEL").arg(key).query_async::<i64>(&mut conn).await?;
        Ok(())
    }

    async fn ttl(&self, key: &str) -> Result<i64, CacheError> {
        let mut conn = self.conn.clone();
        let ttl: i64 = redis::cmd("TTL").arg(key).query_async(&mut conn).await?;
        Ok(ttl)
    }

    async fn hset(&self, hash: &str, field: &str, value: &str) -> Result<(), CacheError> {
        let mut conn = self.conn.clone();
        redis::cmd("HSET")
            .arg(hash)
            .arg(field)
            .arg(value)
            .query_async::<i64>(&mut conn)
            .await?;
        Ok(())
    }

    async fn hget(&self, hash: &str, field: &str) -> Result<Option<String>, CacheError> {
        let mut conn = self.conn.clone();
        let value: Option<String> = redis::cmd("HGET")
            .arg(hash)
            .arg(field)
            .query_async(&mut conn)
            .await?;
        Ok(value)
    }

    async fn ping(&self) -> Result<(), CacheError> {
        let mut conn = self.conn.clone();
        redis::cmd("PING").query_async::<String>(&mut conn).await?;
        Ok(())
    }
}

#[derive(Debug, Clone)]
struct MemoryEntry {
    value: String,
    expires_at: Option<Instant>,
}

impl MemoryEntry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |at| now < at)
    }
}

/// In-process backend with Redis-like expiry.
#[derive(Clone, Default)]
pub struct MemoryStore {
    entries: Arc<RwLock<HashMap<String, MemoryEntry>>>,
    hashes: Arc<RwLock<HashMap<String, HashMap<String, String>>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop expired keys. Reads already ignore them; this only bounds memory.
    pub async fn purge_expired(&self) {
        let now = Instant::now();
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|_, entry| entry.is_live(now));
        let removed = before - entries.len();
        if removed > 0 {
            debug!(removed, "Purged expired in-memory cache entries");
        }
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        let entries = self.entries.read().await;
        Ok(entries
            .get(key)
            .filter(|entry| entry.is_live(Instant::now()))
            .map(|entry| entry.value.clone()))
    }

    async fn set_ex(&self, key: &str, value: &str, ttl_secs: u64) -> Result<(), CacheError> {
        let mut entries = self.entries.write().await;
        entries.insert(
            key.to_string(),
            MemoryEntry {
                value: value.to_string(),
                expires_at: Some(Instant::now() + Duration::from_secs(ttl_secs)),
            },
        );
        Ok(())
    }

    async fn del(&self, key: &str) -> Result<(), CacheError> {
        self.entries.write().await.remove(key);
        Ok(())
    }

    async fn ttl(&self, key: &str) -> Result<i64, CacheError> {
        let entries = self.entries.read().await;
        let now = Instant::now();
        Ok(match entries.get(key) {
            Some(entry) if entry.is_live(now) => match entry.expires_at {
                Some(at) => at.saturating_duration_since(now).as_secs() as i64,
                None => -1,
            },
            _ => -2,
        })
    }

    async fn hset(&self, hash: &str, field: &str, value: &str) -> Result<(), CacheError> {
        let mut hashes = self.hashes.write().await;
        hashes
            .entry(hash.to_string())
            .or_default()
            .insert(field.to_string(), value.to_string());
        Ok(())
    }

    async fn hget(&self, hash: &str, field: &str) -> Result<Option<String>, CacheError> {
        let hashes = self.hashes.read().await;
        Ok(hashes.get(hash).and_then(|h| h.get(field)).cloned())
    }

    async fn ping(&self) -> Result<(), CacheError> {
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Typed adapter
// ---------------------------------------------------------------------------

/// Presence as reported to `is_online` queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Presence {
    pub is_online: bool,
    /// Epoch seconds of the last recorded activity.
    pub last_seen: Option<i64>,
}

impl Presence {
    /// Seconds elapsed since `last_seen`, or zero when unknown.
    pub fn seconds_since_seen(&self, now_epoch: i64) -> u64 {
        self.last_seen
            .map(|seen| now_epoch.saturating_sub(seen).max(0) as u64)
            .unwrap_or(0)
    }
}

#[derive(Clone)]
pub struct Cache {
    store: Arc<dyn KeyValueStore>,
    op_timeout: Duration,
}

impl Cache {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self {
            store,
            op_timeout: Duration::from_secs(CACHE_OP_TIMEOUT_SECS),
        }
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryStore::new()))
    }

    pub fn with_timeout(mut self, op_timeout: Duration) -> Self {
        self.op_timeout = op_timeout;
        self
    }

    async fn bounded<T, F>(&self, fut: F) -> Result<T, CacheError>
    where
        F: Future<Output = Result<T, CacheError>>,
    {
        tokio::time::timeout(self.op_timeout, fut)
            .await
            .map_err(|_| CacheError::Timeout)?
    }

    async fn get_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, CacheError> {
        match self.bounded(self.store.get(key)).await? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    async fn put_json<T: Serialize + ?Sized>(
        &self,
        key: &str,
        value: &T,
        ttl: Duration,
    ) -> Result<(), CacheError> {
        let secs = ttl.as_secs();
        if secs == 0 {
            return Ok(());
        }
        let raw = serde_json::to_string(value)?;
        self.bounded(self.store.set_ex(key, &raw, secs)).await
    }

    pub async fn ping(&self) -> Result<(), CacheError> {
        self.bounded(self.store.ping()).await
    }

    // -- Sessions --

    pub async fn get_session_user(&self, access_token: &str) -> Result<Option<User>, CacheError> {
        self.get_json(&session_key(access_token)).await
    }

    /// Cache the owner of `access_token`. A non-positive `ttl` writes nothing.
    pub async fn put_session_user(
        &self,
        access_token: &str,
        user: &User,
        ttl: Duration,
    ) -> Result<(), CacheError> {
        self.put_json(&session_key(access_token), user, ttl).await
    }

    pub async fn evict_session(&self, access_token: &str) -> Result<(), CacheError> {
        self.bounded(self.store.del(&session_key(access_token))).await
    }

    // -- Conversations --

    pub async fn get_participants(
        &self,
        conversation_id: Uuid,
    ) -> Result<Option<Vec<Participant>>, CacheError> {
        self.get_json(&participants_key(conversation_id)).await
    }

    pub async fn put_participants(
        &self,
        conversation_id: Uuid,
        participants: &[Participant],
        ttl: Duration,
    ) -> Result<(), CacheError> {
        self.put_json(&participants_key(conversation_id), participants, ttl)
            .await
    }

    pub async fn evict_participants(&self, conversation_id: Uuid) -> Result<(), CacheError> {
        self.bounded(self.store.del(&participants_key(conversation_id)))
            .await
    }

    pub async fn get_direct_conversation(
        &self,
        a: Uuid,
        b: Uuid,
    ) -> Result<Option<Conversation>, CacheError> {
        self.get_json(&conversation_key(a, b)).await
    }

    pub async fn put_direct_conversation(
        &self,
        a: Uuid,
        b: Uuid,
        conversation: &Conversation,
        ttl: Duration,
    ) -> Result<(), CacheError> {
        self.put_json(&conversation_key(a, b), conversation, ttl).await
    }

    // -- Presence --

    /// Refresh the presence key and record `now_epoch` as last seen.
    pub async fn mark_online(&self, user_id: Uuid, now_epoch: i64) -> Result<(), CacheError> {
        let field = user_id.to_string();
        self.bounded(self.store.set_ex(&online_key(user_id), "1", PRESENCE_TTL_SECS))
            .await?;
        self.bounded(
            self.store
                .hset(LAST_SEEN_HASH, &field, &now_epoch.to_string()),
        )
        .await
    }

    pub async fn presence(&self, user_id: Uuid) -> Result<Presence, CacheError> {
        let ttl = self.bounded(self.store.ttl(&online_key(user_id))).await?;
        let last_seen = self
            .bounded(self.store.hget(LAST_SEEN_HASH, &user_id.to_string()))
            .await?
            .and_then(|raw| raw.parse::<i64>().ok());
        Ok(Presence {
            is_online: ttl > 1,
            last_seen,
        })
    }
}

fn session_key(access_token: &str) -> String {
    format!("token:{access_token}")
}

fn participants_key(conversation_id: Uuid) -> String {
    format!("token-participants:{conversation_id}")
}

fn conversation_key(a: Uuid, b: Uuid) -> String {
    let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
    format!("conversation:{lo}:{hi}")
}

fn online_key(user_id: Uuid) -> String {
    format!("online:{user_id}")
}
