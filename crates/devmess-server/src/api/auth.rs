//! Account, session and federated sign-in handlers.

use axum::{
    extract::{Query, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use chrono::Utc;
use reqwest::Url;
use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;
use tracing::{debug, info, warn};

use devmess_store::{Device, User};

use super::{AppState, BearerToken, ClientMeta, CurrentUser, MessageResponse};
use crate::accounts::UserSearchResult;
use crate::error::{AuthStage, ServerError};
use crate::oauth::FederatedUserInfo;
use crate::session::RefreshOutcome;

const STATE_COOKIE: &str = "oauth_state";
const STATE_COOKIE_MAX_AGE: i64 = 600;
const SESSION_COOKIE: &str = "access_token";

#[derive(Debug, Deserialize)]
pub struct EmailRequest {
    pub email: String,
}

#[derive(Debug, Deserialize)]
pub struct RegisterRequest {
    pub name: String,
    pub email: String,
    pub password: String,
}

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
}

#[derive(Debug, Deserialize)]
pub struct ResetPasswordRequest {
    pub token: String,
    pub password: String,
}

#[derive(Serialize)]
pub struct CheckEmailResponse {
    exists: bool,
}

#[derive(Serialize)]
pub struct RegisterResponse {
    message: &'static str,
    user: User,
    token: String,
    refresh_token: Option<String>,
}

#[derive(Serialize)]
pub struct LoginResponse {
    access_token: String,
    refresh_token: Option<String>,
}

#[derive(Serialize)]
pub struct RefreshResponse {
    message: &'static str,
    access_token: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    expires_at: Option<i64>,
}

pub async fn check_email(
    State(state): State<AppState>,
    Json(req): Json<EmailRequest>,
) -> Result<Json<CheckEmailResponse>, ServerError> {
    let exists = state.accounts.check_email(&req.email).await?;
    Ok(Json(CheckEmailResponse { exists }))
}

pub async fn register(
    State(state): State<AppState>,
    ClientMeta(client): ClientMeta,
    Json(req): Json<RegisterRequest>,
) -> Result<(StatusCode, Json<RegisterResponse>), ServerError> {
    let (user, token) = state
        .accounts
        .register(&req.name, &req.email, &req.password, &client)
        .await?;

    Ok((
        StatusCode::CREATED,
        Json(RegisterResponse {
            message: "User registered successfully",
            user,
            token: token.access_token,
            refresh_token: token.refresh_token,
        }),
    ))
}

pub async fn login(
    State(state): State<AppState>,
    ClientMeta(client): ClientMeta,
    Json(req): Json<LoginRequest>,
) -> Result<(StatusCode, Json<LoginResponse>), ServerError> {
    let token = state.accounts.login(&req.email, &req.password, &client).await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(LoginResponse {
            access_token: token.access_token,
            refresh_token: token.refresh_token,
        }),
    ))
}

pub async fn forgot_password(
    State(state): State<AppState>,
    Json(req): Json<EmailRequest>,
) -> Result<Json<MessageResponse>, ServerError> {
    state.accounts.forgot_password(&req.email).await?;
    Ok(MessageResponse::new("If the email exists, a reset link was sent"))
}

pub async fn reset_password(
    State(state): State<AppState>,
    Json(req): Json<ResetPasswordRequest>,
) -> Result<Json<MessageResponse>, ServerError> {
    state.accounts.reset_password(&req.token, &req.password).await?;
    Ok(MessageResponse::new("Password has been reset"))
}

/// Echo a valid bearer, or refresh an expired one with the refresh token
/// stored on its row. Every failure asks the client to sign in again.
pub async fn refresh_token(
    State(state): State<AppState>,
    BearerToken(access): BearerToken,
) -> Result<Json<RefreshResponse>, ServerError> {
    let outcome = state
        .sessions
        .refresh_for_bearer(&access)
        .await
        .map_err(|e| match e {
            ServerError::Internal(_)
            | ServerError::Storage(_)
            | ServerError::UpstreamAuthFailure { .. } => e,
            other => {
                debug!(error = %other, "Refresh rejected");
                ServerError::InvalidOrExpired {
                    refresh_token: None,
                }
            }
        })?;

    Ok(Json(match outcome {
        RefreshOutcome::StillValid { access_token } => RefreshResponse {
            message: "Access token is still valid",
            access_token,
            expires_at: None,
        },
        RefreshOutcome::Refreshed(token) => RefreshResponse {
            message: "Token refreshed successfully",
            access_token: token.access_token,
            expires_at: Some(token.expires_at),
        },
    }))
}

pub async fn auth_me(CurrentUser { user, .. }: CurrentUser) -> Json<User> {
    Json(user)
}

pub async fn logout(
    State(state): State<AppState>,
    BearerToken(access): BearerToken,
) -> Result<Json<MessageResponse>, ServerError> {
    if !state.sessions.logout(&access).await? {
        debug!("Logout for an unknown token");
    }
    Ok(MessageResponse::new("Logged out"))
}

pub async fn search_user(
    State(state): State<AppState>,
    caller: CurrentUser,
    Query(query): Query<EmailRequest>,
) -> Result<Json<UserSearchResult>, ServerError> {
    Ok(Json(
        state
            .accounts
            .search_by_email(&caller.user, &query.email)
            .await?,
    ))
}

// -- Federated sign-in --

#[derive(Debug, Deserialize)]
pub struct CallbackQuery {
    pub code: Option<String>,
    pub state: Option<String>,
    pub error: Option<String>,
}

#[derive(Serialize)]
pub struct CallbackResponse {
    message: &'static str,
    user: FederatedUserInfo,
    device: Device,
    token: String,
}

/// Start the consent flow with a fresh anti-forgery `state` cookie.
pub async fn google_login(State(state): State<AppState>) -> Result<Response, ServerError> {
    let provider = state
        .sessions
        .identity()
        .ok_or_else(|| ServerError::NotFound("Federated sign-in is not configured".into()))?;

    let nonce = hex::encode(rand::random::<[u8; 16]>());
    let cookie = cookie(
        STATE_COOKIE,
        &nonce,
        STATE_COOKIE_MAX_AGE,
        "/api/auth/google",
        None,
        state.config.backend_url.starts_with("https://"),
    );

    Ok(redirect(&provider.authorize_url(&nonce), &[cookie]))
}

pub async fn google_callback(
    State(state): State<AppState>,
    ClientMeta(client): ClientMeta,
    headers: HeaderMap,
    Query(query): Query<CallbackQuery>,
) -> Response {
    match finish_google_login(&state, &client, &headers, query).await {
        Ok(response) => response,
        Err(e) => {
            warn!(error = %e, "Federated sign-in failed");
            let message = match &e {
                ServerError::UpstreamAuthFailure { stage, .. } => {
                    format!("Sign-in failed during {stage}")
                }
                _ => "Sign-in failed".to_string(),
            };
            redirect(&error_url(&state.config.frontend_url, &message), &[])
        }
    }
}

async fn finish_google_login(
    state: &AppState,
    client: &crate::session::ClientInfo,
    headers: &HeaderMap,
    query: CallbackQuery,
) -> Result<Response, ServerError> {
    if let Some(error) = query.error {
        return Err(ServerError::upstream(AuthStage::Exchange, error));
    }

    let expected = read_cookie(headers, STATE_COOKIE)
        .ok_or_else(|| ServerError::upstream(AuthStage::State, "missing state cookie"))?;
    let presented = query.state.unwrap_or_default();
    if presented.is_empty() || !bool::from(presented.as_bytes().ct_eq(expected.as_bytes())) {
        return Err(ServerError::upstream(AuthStage::State, "state mismatch"));
    }

    let code = query
        .code
        .filter(|c| !c.is_empty())
        .ok_or_else(|| ServerError::upstream(AuthStage::Exchange, "missing code"))?;

    let (info, token, device) = state
        .sessions
        .handle_federated_callback(&code, client)
        .await?;
    info!(device_id = %device.id, "Federated sign-in complete");

    let secure = state.config.backend_url.starts_with("https://");
    let max_age = (token.expires_at - Utc::now().timestamp()).max(0);
    let cookies = [
        cookie(
            SESSION_COOKIE,
            &token.access_token,
            max_age,
            "/",
            state.config.cookie_domain.as_deref(),
            secure,
        ),
        cookie(STATE_COOKIE, "", 0, "/api/auth/google", None, secure),
    ];

    let body = Json(CallbackResponse {
        message: "Login successful!",
        user: info,
        device,
        token: token.access_token,
    });

    let mut response = body.into_response();
    append_cookies(response.headers_mut(), &cookies);
    Ok(response)
}

fn cookie(
    name: &str,
    value: &str,
    max_age: i64,
    path: &str,
    domain: Option<&str>,
    secure: bool,
) -> String {
    let mut cookie = format!("{name}={value}; Max-Age={max_age}; Path={path}; HttpOnly; SameSite=Lax");
    if let Some(domain) = domain {
        cookie.push_str("; Domain=");
        cookie.push_str(domain);
    }
    if secure {
        cookie.push_str("; Secure");
    }
    cookie
}

fn read_cookie(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(key, _)| *key == name)
        .map(|(_, value)| value.to_string())
}

fn append_cookies(headers: &mut HeaderMap, cookies: &[String]) {
    for cookie in cookies {
        match HeaderValue::from_str(cookie) {
            Ok(value) => {
                headers.append(header::SET_COOKIE, value);
            }
            Err(e) => warn!(error = %e, "Dropping malformed cookie"),
        }
    }
}

fn redirect(location: &str, cookies: &[String]) -> Response {
    let mut response = StatusCode::TEMPORARY_REDIRECT.into_response();
    match HeaderValue::from_str(location) {
        Ok(value) => {
            response.headers_mut().insert(header::LOCATION, value);
        }
        Err(e) => {
            warn!(error = %e, "Invalid redirect target");
            return ServerError::internal("invalid redirect target").into_response();
        }
    }
    append_cookies(response.headers_mut(), cookies);
    response
}

/// `{frontend}/auth/error?message=<url-encoded>`.
fn error_url(frontend_url: &str, message: &str) -> String {
    let base = format!("{frontend_url}/auth/error");
    match Url::parse_with_params(&base, &[("message", message)]) {
        Ok(url) => url.to_string(),
        Err(_) => base,
    }
}
