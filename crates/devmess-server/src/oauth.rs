//! Federated identity provider client.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use reqwest::Url;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use devmess_shared::types::Provider;

const GOOGLE_AUTH_URL: &str = "https://accounts.google.com/o/oauth2/auth";
const GOOGLE_TOKEN_URL: &str = "https://oauth2.googleapis.com/token";
const GOOGLE_USERINFO_URL: &str = "https://www.googleapis.com/oauth2/v2/userinfo";
const GOOGLE_SCOPES: &str =
    "https://www.googleapis.com/auth/userinfo.email https://www.googleapis.com/auth/userinfo.profile";

const HTTP_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum OAuthError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Provider returned status {0}")]
    Status(u16),

    #[error("Invalid provider response: {0}")]
    InvalidResponse(String),
}

/// Profile returned by the provider's user-info endpoint.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FederatedUserInfo {
    pub id: String,
    pub email: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub picture: Option<String>,
}

/// Credentials granted by the provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderTokens {
    pub access_token: String,
    pub refresh_token: Option<String>,
    /// Epoch seconds.
    pub expires_at: i64,
}

#[async_trait]
pub trait IdentityProvider: Send + Sync {
    fn provider(&self) -> Provider;

    /// Where to send the browser to start the consent flow.
    fn authorize_url(&self, state: &str) -> String;

    async fn exchange_code(&self, code: &str) -> Result<ProviderTokens, OAuthError>;

    async fn fetch_user_info(&self, access_token: &str) -> Result<FederatedUserInfo, OAuthError>;

    /// Trade a refresh token for new credentials. Providers that do not
    /// rotate refresh tokens return `refresh_token: None`.
    async fn refresh(&self, refresh_token: &str) -> Result<ProviderTokens, OAuthError>;

    /// Fetch a resource the provider links to (avatar images).
    async fn download(&self, url: &str) -> Result<Bytes, OAuthError>;
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_in: Option<i64>,
}

impl TokenResponse {
    fn into_tokens(self) -> ProviderTokens {
        ProviderTokens {
            access_token: self.access_token,
            refresh_token: self.refresh_token.filter(|t| !t.is_empty()),
            expires_at: Utc::now().timestamp() + self.expires_in.unwrap_or(3600),
        }
    }
}

/// Google OAuth 2.0 over `reqwest`.
#[derive(Clone)]
pub struct GoogleProvider {
    http: reqwest::Client,
    client_id: String,
    client_secret: String,
    redirect_url: String,
}

impl GoogleProvider {
    pub fn new(
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
        redirect_url: impl Into<String>,
    ) -> Result<Self, OAuthError> {
        let http = reqwest::Client::builder().timeout(HTTP_TIMEOUT).build()?;
        Ok(Self {
            http,
            client_id: client_id.into(),
            client_secret: client_secret.into(),
            redirect_url: redirect_url.into(),
        })
    }

    async fn token_request(&self, form: &[(&str, &str)]) -> Result<ProviderTokens, OAuthError> {
        let resp = self.http.post(GOOGLE_TOKEN_URL).form(form).send().await?;
        if !resp.status().is_success() {
            return Err(OAuthError::Status(resp.status().as_u16()));
        }
        let body: TokenResponse = resp
            .json()
            .await
            .map_err(|e| OAuthError::InvalidResponse(e.to_string()))?;
        Ok(body.into_tokens())
    }
}

#[async_trait]
impl IdentityProvider for GoogleProvider {
    fn provider(&self) -> Provider {
        Provider::Google
    }

    fn authorize_url(&self, state: &str) -> String {
        let params = [
            ("client_id", self.client_id.as_str()),
            ("redirect_uri", self.redirect_url.as_str()),
            ("response_type", "code"),
            ("scope", GOOGLE_SCOPES),
            ("access_type", "offline"),
            ("prompt", "consent"),
            ("state", state),
        ];
        match Url::parse_with_params(GOOGLE_AUTH_URL, &params) {
            Ok(url) => url.into(),
            Err(_) => GOOGLE_AUTH_URL.to_string(),
        }
    }

    async fn exchange_code(&self, code: &str) -> Result<ProviderTokens, OAuthError> {
        self.token_request(&[
            ("grant_type", "authorization_code"),
            ("code", code),
            ("client_id", &self.client_id),
            ("client_secret", &self.client_secret),
            ("redirect_uri", &self.redirect_url),
        ])
        .await
    }

    async fn fetch_user_info(&self, access_token: &str) -> Result<FederatedUserInfo, OAuthError> {
        let resp = self
            .http
            .get(GOOGLE_USERINFO_URL)
            .bearer_auth(access_token)
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(OAuthError::Status(resp.status().as_u16()));
        }
        let info: FederatedUserInfo = resp
            .json()
            .await
            .map_err(|e| OAuthError::InvalidResponse(e.to_string()))?;
        if info.email.is_empty() {
            return Err(OAuthError::InvalidResponse("missing email".into()));
        }
        Ok(info)
    }

    async fn refresh(&self, refresh_token: &str) -> Result<ProviderTokens, OAuthError> {
        self.token_request(&[
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
            ("client_id", &self.client_id),
            ("client_secret", &self.client_secret),
        ])
        .await
    }

    async fn download(&self, url: &str) -> Result<Bytes, OAuthError> {
        let resp = self.http.get(url).send().await?;
        if !resp.status().is_success() {
            return Err(OAuthError::Status(resp.status().as_u16()));
        }
        Ok(resp.bytes().await?)
    }
}
