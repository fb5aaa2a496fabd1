//! # devmess-server
//!
//! Real-time one-to-one chat backend.
//!
//! This binary provides:
//! - **REST API** (axum) for accounts, sessions, friendships, conversations
//!   and file uploads
//! - **WebSocket endpoint** delivering chat, presence and friendship events
//!   to every connection of a user
//! - **Federated sign-in** with Google, when credentials are configured
//! - **Per-IP rate limiting** to protect against abuse

mod accounts;
mod api;
mod blob_store;
mod cache;
mod config;
mod conversation;
mod db;
mod error;
mod friendship;
mod hub;
mod mailer;
mod oauth;
mod rate_limit;
mod session;
mod ws;

use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use devmess_shared::constants::APP_NAME;
use devmess_shared::credentials::TokenSigner;
use devmess_store::Database;

use crate::accounts::AccountService;
use crate::api::AppState;
use crate::blob_store::{BlobStore, ObjectStorage};
use crate::cache::{Cache, KeyValueStore, MemoryStore, RedisStore};
use crate::config::ServerConfig;
use crate::conversation::ConversationService;
use crate::friendship::FriendshipService;
use crate::hub::Hub;
use crate::mailer::LogMailer;
use crate::oauth::{GoogleProvider, IdentityProvider};
use crate::rate_limit::{RateLimiter, IDLE_BUCKET_SECS};
use crate::session::SessionService;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // -----------------------------------------------------------------------
    // 1. Initialize tracing (respects RUST_LOG env var)
    // -----------------------------------------------------------------------
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,devmess_server=debug")),
        )
        .init();

    info!("Starting {} server v{}", APP_NAME, env!("CARGO_PKG_VERSION"));

    // -----------------------------------------------------------------------
    // 2. Load configuration
    // -----------------------------------------------------------------------
    let config = ServerConfig::from_env()?;
    info!(?config, "Loaded configuration");

    // -----------------------------------------------------------------------
    // 3. Initialize subsystems
    // -----------------------------------------------------------------------

    // Durable store; startup stops here if it cannot be opened.
    let db = Arc::new(Database::open_at(&config.database_path)?);

    let cache = connect_cache(&config).await;
    let hub = Hub::spawn(cache.clone());

    let storage: Arc<dyn ObjectStorage> = Arc::new(
        BlobStore::new(config.storage_path.clone(), config.max_upload_size).await?,
    );
    let mailer = Arc::new(LogMailer::new(&config.smtp));
    if !config.smtp.is_configured() {
        warn!("SMTP is not configured, outgoing mail is only logged");
    }

    let identity: Option<Arc<dyn IdentityProvider>> = if config.google_enabled() {
        Some(Arc::new(GoogleProvider::new(
            config.google_client_id.clone(),
            config.google_client_secret.clone(),
            config.google_redirect_url.clone(),
        )?))
    } else {
        info!("Google sign-in disabled (GOOGLE_CLIENT_ID not set)");
        None
    };

    let sessions = SessionService::new(
        db.clone(),
        cache.clone(),
        TokenSigner::new(config.jwt_secret.as_bytes()),
        identity,
        storage.clone(),
    );
    let accounts = AccountService::new(
        db.clone(),
        sessions.clone(),
        mailer,
        config.frontend_url.clone(),
    );
    let conversations = ConversationService::new(db.clone(), cache.clone(), hub.clone());
    let friendships = FriendshipService::new(db, hub.clone(), conversations.clone());

    let rate_limiter = RateLimiter::new(config.rate_limit_per_sec, config.rate_limit_burst);
    let http_addr = config.http_addr;

    let app_state = AppState {
        config: Arc::new(config),
        sessions,
        accounts,
        friendships,
        conversations,
        hub,
        cache,
        storage,
        rate_limiter: rate_limiter.clone(),
    };

    // -----------------------------------------------------------------------
    // 4. Spawn background tasks
    // -----------------------------------------------------------------------

    // Periodic rate limiter cleanup (every minute, evict idle buckets)
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(60));
        loop {
            interval.tick().await;
            rate_limiter
                .purge_idle(Duration::from_secs(IDLE_BUCKET_SECS))
                .await;
        }
    });

    // -----------------------------------------------------------------------
    // 5. Run the HTTP API server (blocks until shutdown)
    // -----------------------------------------------------------------------
    tokio::select! {
        result = api::serve(app_state, http_addr) => {
            if let Err(e) = result {
                error!(error = %e, "HTTP server failed");
                return Err(e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down");
        }
    }

    Ok(())
}

/// Redis when reachable, otherwise an in-process store so a single node can
/// still run.
async fn connect_cache(config: &ServerConfig) -> Cache {
    let url = config.redis_url();
    match RedisStore::connect(&url).await {
        Ok(store) => {
            info!(host = %config.redis_host, port = config.redis_port, "Connected to Redis");
            Cache::new(Arc::new(store))
        }
        Err(e) => {
            warn!(error = %e, "Redis unavailable, falling back to in-process cache");
            let store = MemoryStore::new();
            let sweeper = store.clone();
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(Duration::from_secs(60));
                loop {
                    interval.tick().await;
                    sweeper.purge_expired().await;
                }
            });
            Cache::new(Arc::new(store) as Arc<dyn KeyValueStore>)
        }
    }
}
