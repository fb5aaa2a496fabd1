//! Request extractors shared by the handlers.

use axum::{
    extract::FromRequestParts,
    http::{header, request::Parts},
};

use devmess_store::User;

use super::AppState;
use crate::error::ServerError;
use crate::rate_limit::client_ip;
use crate::session::ClientInfo;

/// The raw `Authorization: Bearer` token, valid or not.
#[derive(Debug, Clone)]
pub struct BearerToken(pub String);

#[axum::async_trait]
impl<S: Send + Sync> FromRequestParts<S> for BearerToken {
    type Rejection = ServerError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let value = parts
            .headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| ServerError::Unauthenticated("Authorization header missing".into()))?;

        let token = value
            .strip_prefix("Bearer ")
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .ok_or_else(|| ServerError::Unauthenticated("Invalid token format".into()))?;

        Ok(BearerToken(token.to_string()))
    }
}

/// The authenticated caller of a protected route.
#[derive(Debug, Clone)]
pub struct CurrentUser {
    pub user: User,
    pub access_token: String,
}

#[axum::async_trait]
impl FromRequestParts<AppState> for CurrentUser {
    type Rejection = ServerError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let BearerToken(access_token) = BearerToken::from_request_parts(parts, state).await?;
        let user = state.sessions.verify_access(&access_token).await?;
        Ok(CurrentUser { user, access_token })
    }
}

/// Client address and user agent, used to key devices.
#[derive(Debug, Clone)]
pub struct ClientMeta(pub ClientInfo);

#[axum::async_trait]
impl<S: Send + Sync> FromRequestParts<S> for ClientMeta {
    type Rejection = std::convert::Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let ip = client_ip(&parts.headers, &parts.extensions)
            .map(|ip| ip.to_string())
            .unwrap_or_else(|| "unknown".to_string());
        let user_agent = parts
            .headers
            .get(header::USER_AGENT)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();
        Ok(ClientMeta(ClientInfo { ip, user_agent }))
    }
}
