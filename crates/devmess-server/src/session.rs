//! Device sessions: issuance, verification, refresh and federated sign-in.
//!
//! A session is a device row plus the single token row it owns. Every
//! issued or refreshed access token is written through to the cache with a
//! TTL equal to its remaining lifetime, so verification usually never
//! touches SQLite.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use devmess_shared::constants::ACCESS_TOKEN_TTL_SECS;
use devmess_shared::credentials::{TokenKind, TokenSigner};
use devmess_shared::types::{browser_name, DeviceKind, Provider};
use devmess_store::columns::now_millis;
use devmess_store::{Device, Token, User};

use crate::blob_store::{Folder, ObjectStorage};
use crate::cache::Cache;
use crate::db::{with_db, Db};
use crate::error::{AuthStage, ServerError};
use crate::oauth::{FederatedUserInfo, IdentityProvider};

/// Avatar key used when a federated profile picture cannot be fetched.
pub const DEFAULT_AVATAR: &str = "avatar/img.jpg";

/// Credentials minted elsewhere (a federated provider) to bind to a device.
#[derive(Debug, Clone)]
pub struct ExternalCredentials {
    pub access_token: String,
    pub refresh_token: Option<String>,
    /// Epoch seconds.
    pub expires_at: i64,
}

/// Where a sign-in came from.
#[derive(Debug, Clone)]
pub struct ClientInfo {
    pub ip: String,
    pub user_agent: String,
}

/// Result of presenting a bearer token to the refresh endpoint.
#[derive(Debug, Clone)]
pub enum RefreshOutcome {
    /// The presented access token is still valid.
    StillValid { access_token: String },
    Refreshed(Token),
}

#[derive(Clone)]
pub struct SessionService {
    db: Db,
    cache: Cache,
    signer: TokenSigner,
    identity: Option<Arc<dyn IdentityProvider>>,
    storage: Arc<dyn ObjectStorage>,
}

impl SessionService {
    pub fn new(
        db: Db,
        cache: Cache,
        signer: TokenSigner,
        identity: Option<Arc<dyn IdentityProvider>>,
        storage: Arc<dyn ObjectStorage>,
    ) -> Self {
        Self {
            db,
            cache,
            signer,
            identity,
            storage,
        }
    }

    pub fn signer(&self) -> &TokenSigner {
        &self.signer
    }

    pub fn identity(&self) -> Option<&Arc<dyn IdentityProvider>> {
        self.identity.as_ref()
    }

    /// Bind a fresh token to the device `(user, ip, user_agent)`, creating
    /// the device on first sight. Without `external` credentials a local
    /// access/refresh pair is minted.
    pub async fn create_session(
        &self,
        user: &User,
        client: &ClientInfo,
        external: Option<ExternalCredentials>,
        provider: Provider,
    ) -> Result<(Token, Device), ServerError> {
        let device = self.identify_device(user.id, client).await?;

        let (access_token, refresh_token, expires_at) = match external {
            Some(creds) => {
                let refresh = match creds.refresh_token {
                    Some(refresh) => refresh,
                    None => self.signer.issue_refresh(user.id)?.token,
                };
                (creds.access_token, refresh, creds.expires_at)
            }
            None => {
                let access = self.signer.issue_access(user.id)?;
                let refresh = self.signer.issue_refresh(user.id)?;
                (access.token, refresh.token, access.expires_at)
            }
        };

        let token = Token {
            id: Uuid::new_v4(),
            device_id: device.id,
            access_token,
            refresh_token: Some(refresh_token),
            expires_at,
            token_type: provider,
            created_at: now_millis(),
        };
        let row = token.clone();
        with_db(&self.db, move |db| db.replace_device_token(&row)).await?;

        self.cache_session(&token.access_token, user, token.expires_at)
            .await;

        info!(
            user_id = %user.id,
            device_id = %device.id,
            provider = provider.as_str(),
            "Session created"
        );
        Ok((token, device))
    }

    async fn identify_device(&self, user_id: Uuid, client: &ClientInfo) -> Result<Device, ServerError> {
        let (ip, ua) = (client.ip.clone(), client.user_agent.clone());
        if let Some(device) = with_db(&self.db, move |db| db.find_device(user_id, &ip, &ua)).await? {
            return Ok(device);
        }

        let device = Device {
            id: Uuid::new_v4(),
            user_id,
            device_type: DeviceKind::from_user_agent(&client.user_agent)
                .as_str()
                .to_string(),
            name: browser_name(&client.user_agent).to_string(),
            ip: client.ip.clone(),
            user_agent: client.user_agent.clone(),
            created_at: now_millis(),
        };
        let row = device.clone();
        match with_db(&self.db, move |db| db.insert_device(&row)).await {
            Ok(()) => {
                debug!(user_id = %user_id, device_id = %device.id, "Device registered");
                Ok(device)
            }
            // A concurrent sign-in from the same triple won the insert.
            Err(ServerError::Conflict(_)) => {
                let (ip, ua) = (client.ip.clone(), client.user_agent.clone());
                with_db(&self.db, move |db| db.find_device(user_id, &ip, &ua))
                    .await?
                    .ok_or_else(|| ServerError::internal("device vanished after conflict"))
            }
            Err(e) => Err(e),
        }
    }

    async fn cache_session(&self, access_token: &str, user: &User, expires_at: i64) {
        let remaining = expires_at - Utc::now().timestamp();
        if remaining <= 0 {
            return;
        }
        if let Err(e) = self
            .cache
            .put_session_user(access_token, user, Duration::from_secs(remaining as u64))
            .await
        {
            warn!(user_id = %user.id, error = %e, "Failed to cache session");
        }
    }

    async fn evict(&self, access_token: &str) {
        if let Err(e) = self.cache.evict_session(access_token).await {
            warn!(error = %e, "Failed to evict cached session");
        }
    }

    /// Resolve the owner of an access token.
    ///
    /// A cache hit wins; otherwise the token row decides. An expired row
    /// yields [`ServerError::InvalidOrExpired`] carrying its refresh token.
    pub async fn verify_access(&self, access_token: &str) -> Result<User, ServerError> {
        if access_token.is_empty() {
            return Err(ServerError::InvalidOrExpired {
                refresh_token: None,
            });
        }

        match self.cache.get_session_user(access_token).await {
            Ok(Some(user)) => return Ok(user),
            Ok(None) => {}
            Err(e) => debug!(error = %e, "Session cache unavailable, using store"),
        }

        let access = access_token.to_string();
        let found = with_db(&self.db, move |db| db.find_user_by_access_token(&access)).await?;
        match found {
            Some((user, token)) if !token.is_expired_at(Utc::now().timestamp()) => {
                self.cache_session(access_token, &user, token.expires_at)
                    .await;
                Ok(user)
            }
            Some((_, token)) => Err(ServerError::InvalidOrExpired {
                refresh_token: token.refresh_token,
            }),
            None => Err(ServerError::InvalidOrExpired {
                refresh_token: None,
            }),
        }
    }

    /// Exchange `refresh_token` for a new access token on the same row.
    ///
    /// `prior_access` must still resolve to a user (cache or store). Any
    /// failure evicts the cached session for `prior_access`.
    pub async fn refresh(&self, refresh_token: &str, prior_access: &str) -> Result<Token, ServerError> {
        let result = self.try_refresh(refresh_token, prior_access).await;
        if result.is_err() {
            self.evict(prior_access).await;
        }
        result
    }

    async fn try_refresh(&self, refresh_token: &str, prior_access: &str) -> Result<Token, ServerError> {
        let refresh = refresh_token.to_string();
        let mut token = with_db(&self.db, move |db| db.find_token_by_refresh(&refresh))
            .await?
            .ok_or_else(|| ServerError::Unauthenticated("Refresh token not recognised".into()))?;

        // The refresh token only renews the session row it was issued with.
        if token.access_token != prior_access {
            return Err(ServerError::Unauthenticated(
                "Refresh token does not belong to this session".into(),
            ));
        }

        let user = self.user_for_prior_access(prior_access).await?;

        match token.token_type {
            Provider::Google => {
                let provider = self.identity.as_ref().ok_or_else(|| {
                    ServerError::upstream(AuthStage::Refresh, "federated sign-in is not configured")
                })?;
                let granted = provider
                    .refresh(refresh_token)
                    .await
                    .map_err(|e| ServerError::upstream(AuthStage::Refresh, e))?;

                token.access_token = granted.access_token;
                token.expires_at = granted.expires_at;
                if granted.refresh_token.is_some() {
                    token.refresh_token = granted.refresh_token;
                }
            }
            Provider::Local => {
                let claims = self.signer.verify(refresh_token, TokenKind::Refresh)?;
                if claims.user_id != user.id {
                    return Err(ServerError::Unauthenticated(
                        "Refresh token does not belong to this session".into(),
                    ));
                }
                let access = self.signer.issue_refreshed_access(user.id)?;
                token.access_token = access.token;
                token.expires_at = access.expires_at;
            }
        }

        let (id, access, rotated, expires_at) = (
            token.id,
            token.access_token.clone(),
            token.refresh_token.clone(),
            token.expires_at,
        );
        with_db(&self.db, move |db| {
            db.update_token_credentials(id, &access, rotated.as_deref(), expires_at)
        })
        .await?;

        if prior_access != token.access_token {
            self.evict(prior_access).await;
        }
        self.cache_session(&token.access_token, &user, token.expires_at)
            .await;

        info!(user_id = %user.id, token_id = %token.id, "Session refreshed");
        Ok(token)
    }

    async fn user_for_prior_access(&self, prior_access: &str) -> Result<User, ServerError> {
        if let Ok(Some(user)) = self.cache.get_session_user(prior_access).await {
            return Ok(user);
        }
        let access = prior_access.to_string();
        with_db(&self.db, move |db| db.find_user_by_access_token(&access))
            .await?
            .map(|(user, _)| user)
            .ok_or_else(|| ServerError::Unauthenticated("Cannot resolve user, please login again".into()))
    }

    /// Bearer-driven refresh: a still-valid token is echoed back, an expired
    /// one is refreshed with the refresh token stored on its row.
    pub async fn refresh_for_bearer(&self, access_token: &str) -> Result<RefreshOutcome, ServerError> {
        match self.verify_access(access_token).await {
            Ok(_) => Ok(RefreshOutcome::StillValid {
                access_token: access_token.to_string(),
            }),
            Err(ServerError::InvalidOrExpired {
                refresh_token: Some(refresh),
            }) => Ok(RefreshOutcome::Refreshed(
                self.refresh(&refresh, access_token).await?,
            )),
            Err(e) => Err(e),
        }
    }

    /// Complete a federated sign-in: exchange the code, fetch the profile,
    /// upsert the user by email and open a session.
    pub async fn handle_federated_callback(
        &self,
        code: &str,
        client: &ClientInfo,
    ) -> Result<(FederatedUserInfo, Token, Device), ServerError> {
        let provider = self.identity.as_ref().ok_or_else(|| {
            ServerError::upstream(AuthStage::Exchange, "federated sign-in is not configured")
        })?;

        let granted = provider
            .exchange_code(code)
            .await
            .map_err(|e| ServerError::upstream(AuthStage::Exchange, e))?;
        let info = provider
            .fetch_user_info(&granted.access_token)
            .await
            .map_err(|e| ServerError::upstream(AuthStage::UserInfo, e))?;

        let user = self
            .upsert_federated_user(provider.as_ref(), &info)
            .await
            .map_err(|e| ServerError::upstream(AuthStage::Persist, e))?;

        let external = ExternalCredentials {
            access_token: granted.access_token,
            refresh_token: granted.refresh_token,
            expires_at: Utc::now().timestamp() + ACCESS_TOKEN_TTL_SECS,
        };
        let (token, device) = self
            .create_session(&user, client, Some(external), provider.provider())
            .await
            .map_err(|e| ServerError::upstream(AuthStage::Session, e))?;

        Ok((info, token, device))
    }

    async fn upsert_federated_user(
        &self,
        provider: &dyn IdentityProvider,
        info: &FederatedUserInfo,
    ) -> Result<User, ServerError> {
        let email = info.email.to_lowercase();
        let lookup = email.clone();
        if let Some(user) = with_db(&self.db, move |db| db.find_user_by_email(&lookup)).await? {
            return Ok(user);
        }

        let mut user = User::new_federated(&info.name, &email, provider.provider());
        user.avatar = self.fetch_avatar(provider, info).await;

        let row = user.clone();
        match with_db(&self.db, move |db| db.insert_user(&row)).await {
            Ok(()) => {
                info!(user_id = %user.id, "Federated account created");
                Ok(user)
            }
            Err(ServerError::Conflict(_)) => {
                with_db(&self.db, move |db| db.find_user_by_email(&email))
                    .await?
                    .ok_or_else(|| ServerError::internal("user vanished after conflict"))
            }
            Err(e) => Err(e),
        }
    }

    async fn fetch_avatar(&self, provider: &dyn IdentityProvider, info: &FederatedUserInfo) -> String {
        let Some(url) = info.picture.as_deref().filter(|u| !u.is_empty()) else {
            return DEFAULT_AVATAR.to_string();
        };
        let stored = match provider.download(url).await {
            Ok(bytes) => self.storage.put(Folder::Avatars, "avatar.jpg", &bytes).await,
            Err(e) => Err(ServerError::upstream(AuthStage::UserInfo, e)),
        };
        match stored {
            Ok(object) => object.key,
            Err(e) => {
                warn!(error = %e, "Failed to store federated avatar");
                DEFAULT_AVATAR.to_string()
            }
        }
    }

    /// Drop cached lookups for sessions already deleted from the store.
    pub async fn forget_sessions(&self, access_tokens: &[String]) {
        for access_token in access_tokens {
            self.evict(access_token).await;
        }
    }

    /// Destroy the session behind `access_token`.
    pub async fn logout(&self, access_token: &str) -> Result<bool, ServerError> {
        let access = access_token.to_string();
        let removed = with_db(&self.db, move |db| db.delete_token_by_access(&access)).await?;
        self.evict(access_token).await;
        Ok(removed)
    }
}
