use std::fmt;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

use devmess_shared::CredentialError;
use devmess_store::StoreError;

/// Step of a federated sign-in or refresh that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthStage {
    State,
    Exchange,
    UserInfo,
    Persist,
    Session,
    Refresh,
}

impl fmt::Display for AuthStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::State => "state check",
            Self::Exchange => "code exchange",
            Self::UserInfo => "user info",
            Self::Persist => "account update",
            Self::Session => "session creation",
            Self::Refresh => "token refresh",
        })
    }
}

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Invalid request: {0}")]
    BadInput(String),

    #[error("{0}")]
    Unauthenticated(String),

    /// The access token is unknown or expired. Carries the stored refresh
    /// token when one exists so the caller can attempt a refresh.
    #[error("Access token invalid or expired")]
    InvalidOrExpired { refresh_token: Option<String> },

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Already exists: {0}")]
    AlreadyExists(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Recipient queue is full")]
    Backpressure,

    #[error("Recipient is not connected")]
    NotConnected,

    #[error("Federated authentication failed at {stage}")]
    UpstreamAuthFailure { stage: AuthStage, detail: String },

    #[error("Too many requests")]
    RateLimited,

    #[error("Payload too large: {size} bytes (max {max})")]
    PayloadTooLarge { size: usize, max: usize },

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ServerError {
    pub fn upstream(stage: AuthStage, detail: impl fmt::Display) -> Self {
        ServerError::UpstreamAuthFailure {
            stage,
            detail: detail.to_string(),
        }
    }

    pub fn internal(detail: impl fmt::Display) -> Self {
        ServerError::Internal(detail.to_string())
    }
}

impl From<StoreError> for ServerError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound => ServerError::NotFound("record".to_string()),
            StoreError::Conflict(detail) => ServerError::Conflict(detail),
            other => ServerError::Internal(other.to_string()),
        }
    }
}

impl From<CredentialError> for ServerError {
    fn from(err: CredentialError) -> Self {
        match err {
            CredentialError::Signing(_) | CredentialError::Hashing(_) => {
                ServerError::Internal(err.to_string())
            }
            other => ServerError::Unauthenticated(other.to_string()),
        }
    }
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            ServerError::BadInput(_) => (StatusCode::BAD_REQUEST, self.to_string()),
            ServerError::Unauthenticated(_) => (StatusCode::UNAUTHORIZED, self.to_string()),
            ServerError::InvalidOrExpired { refresh_token } => {
                let body = serde_json::json!({
                    "error": self.to_string(),
                    "require_login": refresh_token.is_none(),
                });
                return (StatusCode::UNAUTHORIZED, axum::Json(body)).into_response();
            }
            ServerError::Forbidden(_) => (StatusCode::FORBIDDEN, self.to_string()),
            ServerError::NotFound(_) => (StatusCode::NOT_FOUND, self.to_string()),
            ServerError::AlreadyExists(_) | ServerError::Conflict(_) => {
                (StatusCode::CONFLICT, self.to_string())
            }
            ServerError::Backpressure => (StatusCode::SERVICE_UNAVAILABLE, self.to_string()),
            ServerError::NotConnected => (StatusCode::NOT_FOUND, self.to_string()),
            ServerError::UpstreamAuthFailure { stage, detail } => {
                tracing::warn!(%stage, %detail, "Federated authentication failed");
                let body = serde_json::json!({
                    "error": self.to_string(),
                    "require_login": true,
                });
                return (StatusCode::UNAUTHORIZED, axum::Json(body)).into_response();
            }
            ServerError::RateLimited => (StatusCode::TOO_MANY_REQUESTS, self.to_string()),
            ServerError::PayloadTooLarge { .. } => {
                (StatusCode::PAYLOAD_TOO_LARGE, self.to_string())
            }
            ServerError::Storage(detail) => {
                tracing::error!(%detail, "Storage error");
                (StatusCode::INTERNAL_SERVER_ERROR, "Storage error".to_string())
            }
            ServerError::Internal(detail) => {
                tracing::error!(%detail, "Internal error");
                (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error".to_string())
            }
        };

        let body = serde_json::json!({
            "error": message,
        });

        (status, axum::Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_expired_with_refresh_does_not_require_login() {
        let response = ServerError::InvalidOrExpired {
            refresh_token: Some("r".into()),
        }
        .into_response();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let body = body_json(response).await;
        assert_eq!(body["require_login"], false);
        assert!(!body.to_string().contains("\"r\""));
    }

    #[tokio::test]
    async fn test_internal_details_hidden() {
        let response = ServerError::Internal("db exploded at /var/lib".into()).into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = body_json(response).await;
        assert_eq!(body["error"], "Internal server error");
    }

    #[test]
    fn test_status_mapping() {
        let cases = [
            (ServerError::BadInput("x".into()), StatusCode::BAD_REQUEST),
            (ServerError::Forbidden("x".into()), StatusCode::FORBIDDEN),
            (ServerError::NotFound("x".into()), StatusCode::NOT_FOUND),
            (ServerError::AlreadyExists("x".into()), StatusCode::CONFLICT),
            (ServerError::RateLimited, StatusCode::TOO_MANY_REQUESTS),
            (
                ServerError::upstream(AuthStage::Exchange, "boom"),
                StatusCode::UNAUTHORIZED,
            ),
        ];
        for (err, status) in cases {
            assert_eq!(err.into_response().status(), status);
        }
    }

    #[test]
    fn test_store_errors_map() {
        assert!(matches!(
            ServerError::from(StoreError::NotFound),
            ServerError::NotFound(_)
        ));
        assert!(matches!(
            ServerError::from(StoreError::Conflict("dup".into())),
            ServerError::Conflict(_)
        ));
    }
}
