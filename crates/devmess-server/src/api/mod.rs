//! HTTP API.

mod auth;
mod conversations;
mod extract;
mod files;
mod friends;

use std::sync::Arc;

use axum::{
    extract::{DefaultBodyLimit, State},
    http::{header, Method},
    middleware,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::accounts::AccountService;
use crate::blob_store::ObjectStorage;
use crate::cache::Cache;
use crate::config::ServerConfig;
use crate::conversation::ConversationService;
use crate::error::ServerError;
use crate::friendship::FriendshipService;
use crate::hub::Hub;
use crate::rate_limit::{rate_limit_middleware, RateLimiter};
use crate::session::SessionService;
use crate::ws;

pub use extract::{BearerToken, ClientMeta, CurrentUser};

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ServerConfig>,
    pub sessions: SessionService,
    pub accounts: AccountService,
    pub friendships: FriendshipService,
    pub conversations: ConversationService,
    pub hub: Arc<Hub>,
    pub cache: Cache,
    pub storage: Arc<dyn ObjectStorage>,
    pub rate_limiter: RateLimiter,
}

/// Plain `{"message": ...}` body.
#[derive(Debug, Serialize, Deserialize)]
pub struct MessageResponse {
    pub message: String,
}

impl MessageResponse {
    pub fn new(message: impl Into<String>) -> Json<Self> {
        Json(Self {
            message: message.into(),
        })
    }
}

/// Parse a UUID from a request field, answering 400 when malformed.
fn parse_id(raw: &str, field: &str) -> Result<uuid::Uuid, ServerError> {
    raw.trim()
        .parse()
        .map_err(|_| ServerError::BadInput(format!("{field} must be a valid id")))
}

pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(cors_origin(&state.config.frontend_url))
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::AUTHORIZATION, header::CONTENT_TYPE])
        .allow_credentials(true);

    let v1 = Router::new()
        // -- Auth --
        .route("/auth/check-email", post(auth::check_email))
        .route("/auth/register", post(auth::register))
        .route("/auth/login", post(auth::login))
        .route("/auth/forgot-password", post(auth::forgot_password))
        .route("/auth/reset-password", post(auth::reset_password))
        .route("/auth/refresh-token", post(auth::refresh_token))
        .route("/auth/auth-me", get(auth::auth_me))
        .route("/auth/logout", post(auth::logout))
        .route("/users/search", get(auth::search_user))
        // -- Friendships --
        .route("/friendships/send-invite", post(friends::send_invite))
        .route("/friendships/cancel-invite", post(friends::cancel_invite))
        .route("/friendships/accept-invite", post(friends::accept_invite))
        .route("/friendships/reject-invite", post(friends::reject_invite))
        .route("/friendships/list-invite-friends", get(friends::list_invites))
        .route("/friendships/list-friends", get(friends::list_friends))
        .route("/friendships/remove-friends", post(friends::remove_friend))
        // -- Conversations & messages --
        .route("/conversations", get(conversations::list))
        .route("/conversations/", get(conversations::list))
        .route("/conversations/messages", get(conversations::messages))
        .route("/conversations/messages/", get(conversations::messages))
        .route("/conversations/find-conversation", post(conversations::find_by_user))
        .route("/conversations/mark-read", post(conversations::mark_read))
        .route("/messages", get(conversations::messages))
        .route("/messages/", get(conversations::messages))
        .route("/messages/send", post(conversations::send_message));

    Router::new()
        .route("/health", get(health_check))
        .nest("/api/v1", v1)
        .route("/api/upload", post(files::upload))
        .route("/api/files/:filename", get(files::get_file))
        .route("/api/images/:filename", get(files::get_image))
        .route("/api/auth/google", get(auth::google_login))
        .route("/api/auth/google/callback", get(auth::google_callback))
        .route("/ws", get(ws::ws_upgrade))
        // Multipart framing on top of the largest accepted file.
        .layer(DefaultBodyLimit::max(state.config.max_upload_size + 64 * 1024))
        .layer(middleware::from_fn_with_state(
            state.rate_limiter.clone(),
            rate_limit_middleware,
        ))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn cors_origin(frontend_url: &str) -> AllowOrigin {
    match frontend_url.parse() {
        Ok(origin) => AllowOrigin::exact(origin),
        Err(_) => {
            tracing::warn!(frontend_url, "FRONTEND_URL is not a valid origin, CORS disabled");
            AllowOrigin::list(Vec::new())
        }
    }
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    cache: &'static str,
    connected_users: usize,
}

async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    let cache = match state.cache.ping().await {
        Ok(()) => "ok",
        Err(e) => {
            tracing::warn!(error = %e, "Cache ping failed");
            "unavailable"
        }
    };
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        cache,
        connected_users: state.hub.connected_count(),
    })
}

pub async fn serve(state: AppState, addr: std::net::SocketAddr) -> anyhow::Result<()> {
    let app = build_router(state);

    info!(addr = %addr, "Starting HTTP API server");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<std::net::SocketAddr>(),
    )
    .await?;

    Ok(())
}

#[cfg(test)]
pub(crate) mod tests {
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use axum::response::Response;
    use tempfile::TempDir;
    use tower::ServiceExt;

    use super::*;
    use crate::blob_store::BlobStore;
    use crate::config::SmtpConfig;
    use crate::db::Db;
    use crate::mailer::LogMailer;
    use crate::oauth::IdentityProvider;
    use devmess_shared::credentials::TokenSigner;
    use devmess_store::Database;

    pub(crate) const TEST_UA: &str = "Mozilla/5.0 (X11; Linux x86_64) Firefox/128.0";

    pub(crate) struct TestApp {
        pub router: Router,
        pub state: AppState,
        pub db: Db,
        pub mailer: Arc<LogMailer>,
        _dir: TempDir,
    }

    impl TestApp {
        pub(crate) async fn new() -> Self {
            Self::with_identity(None).await
        }

        pub(crate) async fn with_identity(identity: Option<Arc<dyn IdentityProvider>>) -> Self {
            let dir = TempDir::new().unwrap();
            let db: Db = Arc::new(Database::open_in_memory().unwrap());
            let cache = Cache::in_memory();
            let storage: Arc<dyn ObjectStorage> =
                Arc::new(BlobStore::new(dir.path().to_path_buf(), 1 << 20).await.unwrap());
            let hub = Hub::spawn(cache.clone());
            let config = ServerConfig {
                jwt_secret: "api-test-secret".into(),
                max_upload_size: 1 << 20,
                rate_limit_per_sec: 1000.0,
                rate_limit_burst: 1000.0,
                ..ServerConfig::default()
            };

            let sessions = SessionService::new(
                db.clone(),
                cache.clone(),
                TokenSigner::new(config.jwt_secret.as_bytes()),
                identity,
                storage.clone(),
            );
            let mailer = Arc::new(LogMailer::new(&SmtpConfig::default()));
            let accounts = AccountService::new(
                db.clone(),
                sessions.clone(),
                mailer.clone(),
                config.frontend_url.clone(),
            );
            let conversations = ConversationService::new(db.clone(), cache.clone(), hub.clone());
            let friendships =
                FriendshipService::new(db.clone(), hub.clone(), conversations.clone());

            let state = AppState {
                rate_limiter: RateLimiter::new(config.rate_limit_per_sec, config.rate_limit_burst),
                config: Arc::new(config),
                sessions,
                accounts,
                friendships,
                conversations,
                hub,
                cache,
                storage,
            };

            Self {
                router: build_router(state.clone()),
                state,
                db,
                mailer,
                _dir: dir,
            }
        }

        pub(crate) async fn send(&self, request: Request<Body>) -> Response {
            self.router.clone().oneshot(request).await.unwrap()
        }

        pub(crate) async fn post_json(
            &self,
            uri: &str,
            bearer: Option<&str>,
            body: serde_json::Value,
        ) -> (StatusCode, serde_json::Value) {
            let mut builder = Request::builder()
                .method("POST")
                .uri(uri)
                .header("content-type", "application/json")
                .header("user-agent", TEST_UA)
                .header("x-real-ip", "10.9.9.9");
            if let Some(token) = bearer {
                builder = builder.header("authorization", format!("Bearer {token}"));
            }
            let response = self
                .send(builder.body(Body::from(body.to_string())).unwrap())
                .await;
            split(response).await
        }

        pub(crate) async fn get_json(&self, uri: &str, bearer: Option<&str>) -> (StatusCode, serde_json::Value) {
            let mut builder = Request::builder()
                .uri(uri)
                .header("user-agent", TEST_UA)
                .header("x-real-ip", "10.9.9.9");
            if let Some(token) = bearer {
                builder = builder.header("authorization", format!("Bearer {token}"));
            }
            split(self.send(builder.body(Body::empty()).unwrap()).await).await
        }

        /// Register an account and return `(user_id, access_token)`.
        pub(crate) async fn register(&self, name: &str, email: &str) -> (String, String) {
            let (status, body) = self
                .post_json(
                    "/api/v1/auth/register",
                    None,
                    serde_json::json!({"name": name, "email": email, "password": "hunter22"}),
                )
                .await;
            assert_eq!(status, StatusCode::CREATED, "{body}");
            (
                body["user"]["id"].as_str().unwrap().to_string(),
                body["token"].as_str().unwrap().to_string(),
            )
        }
    }

    pub(crate) async fn split(response: Response) -> (StatusCode, serde_json::Value) {
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body = if bytes.is_empty() {
            serde_json::Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null)
        };
        (status, body)
    }

    fn timestamp(value: &serde_json::Value) -> chrono::DateTime<chrono::Utc> {
        value.as_str().unwrap().parse().unwrap()
    }

    #[tokio::test]
    async fn test_health() {
        let app = TestApp::new().await;
        let (status, body) = app.get_json("/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
        assert_eq!(body["cache"], "ok");
        assert_eq!(body["connected_users"], 0);
    }

    #[tokio::test]
    async fn test_protected_routes_need_bearer() {
        let app = TestApp::new().await;
        for uri in [
            "/api/v1/auth/auth-me",
            "/api/v1/conversations/",
            "/api/v1/friendships/list-friends",
        ] {
            let (status, _) = app.get_json(uri, None).await;
            assert_eq!(status, StatusCode::UNAUTHORIZED, "{uri}");
        }
    }

    #[tokio::test]
    async fn test_invite_accept_then_message() {
        let app = TestApp::new().await;
        let (u1, t1) = app.register("One", "one@x").await;
        let (u2, t2) = app.register("Two", "two@x").await;

        let (status, body) = app
            .post_json(
                "/api/v1/friendships/send-invite",
                Some(&t1),
                serde_json::json!({"friend_id": u2}),
            )
            .await;
        assert_eq!(status, StatusCode::OK, "{body}");
        assert_eq!(body["friendship"]["status"], "pending");

        let (status, body) = app
            .post_json(
                "/api/v1/friendships/send-invite",
                Some(&t1),
                serde_json::json!({"friend_id": u2}),
            )
            .await;
        assert_eq!(status, StatusCode::CONFLICT, "{body}");

        let (status, invites) = app
            .get_json("/api/v1/friendships/list-invite-friends", Some(&t2))
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(invites[0]["id"], u1);

        let (status, body) = app
            .post_json(
                "/api/v1/friendships/accept-invite",
                Some(&t2),
                serde_json::json!({"friend_id": u1}),
            )
            .await;
        assert_eq!(status, StatusCode::OK, "{body}");
        let conversation_id = body["conversation"]["id"].as_str().unwrap().to_string();

        let mut before = None;
        for token in [&t1, &t2] {
            let (status, page) = app.get_json("/api/v1/conversations/", Some(token)).await;
            assert_eq!(status, StatusCode::OK);
            let page = page.as_array().unwrap();
            assert_eq!(page.len(), 1);
            assert_eq!(page[0]["type"], "direct");
            assert_eq!(page[0]["last_message"]["type"], "system");
            before = Some(timestamp(&page[0]["updated_at"]));
        }

        let (status, body) = app
            .post_json(
                "/api/v1/messages/send",
                Some(&t1),
                serde_json::json!({"conversation_id": conversation_id, "content": "hello"}),
            )
            .await;
        assert_eq!(status, StatusCode::CREATED, "{body}");

        let (_, page) = app.get_json("/api/v1/conversations/", Some(&t2)).await;
        assert_eq!(page[0]["id"], conversation_id);
        assert_eq!(page[0]["last_message"]["content"], "hello");
        assert!(Some(timestamp(&page[0]["updated_at"])) > before);

        let (status, messages) = app
            .get_json(
                &format!("/api/v1/messages/?conversation_id={conversation_id}&limit=10"),
                Some(&t2),
            )
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(messages.as_array().unwrap().len(), 2);
        assert_eq!(messages[0]["content"], "hello");

        let (status, found) = app
            .post_json(
                "/api/v1/conversations/find-conversation",
                Some(&t2),
                serde_json::json!({"user_id": u1}),
            )
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(found["id"], conversation_id);

        let (status, friends) = app.get_json("/api/v1/friendships/list-friends", Some(&t1)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(friends[0]["id"], u2);
    }

    #[tokio::test]
    async fn test_outsider_cannot_read_messages() {
        let app = TestApp::new().await;
        let (u1, t1) = app.register("One", "one@x").await;
        let (u2, t2) = app.register("Two", "two@x").await;
        let (_, t3) = app.register("Three", "three@x").await;

        app.post_json(
            "/api/v1/friendships/send-invite",
            Some(&t1),
            serde_json::json!({"friend_id": u2}),
        )
        .await;
        let (_, accepted) = app
            .post_json(
                "/api/v1/friendships/accept-invite",
                Some(&t2),
                serde_json::json!({"friend_id": u1}),
            )
            .await;
        let conversation_id = accepted["conversation"]["id"].as_str().unwrap();

        let (status, _) = app
            .get_json(
                &format!("/api/v1/conversations/messages/?conversation_id={conversation_id}"),
                Some(&t3),
            )
            .await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        let (status, _) = app
            .get_json("/api/v1/conversations/messages/?conversation_id=nope", Some(&t3))
            .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }
}
