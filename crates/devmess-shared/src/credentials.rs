//! HS256-signed bearer tokens.
//!
//! Three issuers share one signing secret but are never interchangeable:
//! a refresh token presented where an access token is expected is rejected
//! with [`CredentialError::WrongIssuer`].

use std::fmt;

use chrono::Utc;
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::constants::{
    ACCESS_TOKEN_TTL_SECS, REFRESHED_ACCESS_TTL_SECS, REFRESH_TOKEN_TTL_SECS,
    RESET_TOKEN_TTL_SECS,
};
use crate::error::CredentialError;

pub const ACCESS_ISSUER: &str = "web_chat_app";
pub const REFRESH_ISSUER: &str = "web_chat_app_refresh";
pub const RESET_ISSUER: &str = "web_chat_app_reset";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenKind {
    Access,
    Refresh,
    Reset,
}

impl TokenKind {
    pub fn issuer(&self) -> &'static str {
        match self {
            Self::Access => ACCESS_ISSUER,
            Self::Refresh => REFRESH_ISSUER,
            Self::Reset => RESET_ISSUER,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Claims {
    pub user_id: Uuid,
    pub iat: i64,
    pub exp: i64,
    pub iss: String,
    /// Unique per issued token, so two tokens minted for the same user in
    /// the same second still differ.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jti: Option<Uuid>,
}

/// A freshly signed token and its absolute expiry (epoch seconds).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssuedToken {
    pub token: String,
    pub expires_at: i64,
}

#[derive(Clone)]
pub struct TokenSigner {
    encoding: EncodingKey,
    decoding: DecodingKey,
}

impl fmt::Debug for TokenSigner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenSigner").finish_non_exhaustive()
    }
}

impl TokenSigner {
    pub fn new(secret: &[u8]) -> Self {
        Self {
            encoding: EncodingKey::from_secret(secret),
            decoding: DecodingKey::from_secret(secret),
        }
    }

    /// Sign a token of `kind` for `user_id` that expires `ttl_secs` from now.
    pub fn issue(
        &self,
        kind: TokenKind,
        user_id: Uuid,
        ttl_secs: i64,
    ) -> Result<IssuedToken, CredentialError> {
        let now = Utc::now().timestamp();
        let claims = Claims {
            user_id,
            iat: now,
            exp: now + ttl_secs,
            iss: kind.issuer().to_string(),
            jti: Some(Uuid::new_v4()),
        };

        let token = encode(&Header::new(Algorithm::HS256), &claims, &self.encoding)
            .map_err(|e| CredentialError::Signing(e.to_string()))?;

        Ok(IssuedToken {
            token,
            expires_at: claims.exp,
        })
    }

    pub fn issue_access(&self, user_id: Uuid) -> Result<IssuedToken, CredentialError> {
        self.issue(TokenKind::Access, user_id, ACCESS_TOKEN_TTL_SECS)
    }

    /// Short-lived access token handed out by a local refresh.
    pub fn issue_refreshed_access(&self, user_id: Uuid) -> Result<IssuedToken, CredentialError> {
        self.issue(TokenKind::Access, user_id, REFRESHED_ACCESS_TTL_SECS)
    }

    pub fn issue_refresh(&self, user_id: Uuid) -> Result<IssuedToken, CredentialError> {
        self.issue(TokenKind::Refresh, user_id, REFRESH_TOKEN_TTL_SECS)
    }

    pub fn issue_reset(&self, user_id: Uuid) -> Result<IssuedToken, CredentialError> {
        self.issue(TokenKind::Reset, user_id, RESET_TOKEN_TTL_SECS)
    }

    /// Check signature, algorithm, expiry and issuer, in that order.
    pub fn verify(&self, token: &str, kind: TokenKind) -> Result<Claims, CredentialError> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 0;
        validation.set_issuer(&[kind.issuer()]);
        validation.set_required_spec_claims(&["exp", "iss"]);

        decode::<Claims>(token, &self.decoding, &validation)
            .map(|data| data.claims)
            .map_err(|e| match e.kind() {
                ErrorKind::ExpiredSignature => CredentialError::Expired,
                ErrorKind::InvalidIssuer => CredentialError::WrongIssuer,
                ErrorKind::InvalidSignature => CredentialError::BadSignature,
                ErrorKind::InvalidAlgorithm | ErrorKind::InvalidAlgorithmName => {
                    CredentialError::UnsupportedAlgorithm
                }
                _ => CredentialError::Malformed(e.to_string()),
            })
    }
}
