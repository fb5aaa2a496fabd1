//! Local accounts: registration, password sign-in, password reset and
//! profile lookups.

use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use devmess_shared::constants::MIN_PASSWORD_LEN;
use devmess_shared::credentials::TokenKind;
use devmess_shared::password;
use devmess_shared::types::{FriendshipStatus, Provider};
use devmess_store::{Token, User};

use crate::db::{with_db, Db};
use crate::error::ServerError;
use crate::mailer::{Mailer, OutgoingMail};
use crate::session::{ClientInfo, SessionService};

const BAD_CREDENTIALS: &str = "Invalid email or password";

/// A user found by search, seen from the caller's side.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct UserSearchResult {
    #[serde(flatten)]
    pub user: User,
    /// `None` when the two users have never interacted.
    pub friend_status: Option<FriendshipStatus>,
    pub requested_by: Option<Uuid>,
}

#[derive(Clone)]
pub struct AccountService {
    db: Db,
    sessions: SessionService,
    mailer: Arc<dyn Mailer>,
    frontend_url: String,
}

fn normalise_email(email: &str) -> Result<String, ServerError> {
    let email = email.trim().to_lowercase();
    let valid = email
        .split_once('@')
        .map(|(local, domain)| !local.is_empty() && !domain.is_empty())
        .unwrap_or(false);
    if !valid {
        return Err(ServerError::BadInput("A valid email is required".into()));
    }
    Ok(email)
}

fn check_password(password: &str) -> Result<(), ServerError> {
    if password.chars().count() < MIN_PASSWORD_LEN {
        return Err(ServerError::BadInput(format!(
            "Password must be at least {MIN_PASSWORD_LEN} characters"
        )));
    }
    Ok(())
}

async fn hash_password(plain: String) -> Result<String, ServerError> {
    tokio::task::spawn_blocking(move || password::hash(&plain))
        .await
        .map_err(ServerError::internal)?
        .map_err(ServerError::from)
}

async fn verify_password(stored: String, candidate: String) -> Result<bool, ServerError> {
    tokio::task::spawn_blocking(move || password::verify(&stored, &candidate))
        .await
        .map_err(ServerError::internal)
}

impl AccountService {
    pub fn new(
        db: Db,
        sessions: SessionService,
        mailer: Arc<dyn Mailer>,
        frontend_url: impl Into<String>,
    ) -> Self {
        Self {
            db,
            sessions,
            mailer,
            frontend_url: frontend_url.into(),
        }
    }

    pub async fn check_email(&self, email: &str) -> Result<bool, ServerError> {
        let email = normalise_email(email)?;
        let found = with_db(&self.db, move |db| db.find_user_by_email(&email)).await?;
        Ok(found.is_some())
    }

    /// Create a local account and sign it in from `client`.
    pub async fn register(
        &self,
        name: &str,
        email: &str,
        password: &str,
        client: &ClientInfo,
    ) -> Result<(User, Token), ServerError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(ServerError::BadInput("Name is required".into()));
        }
        let email = normalise_email(email)?;
        check_password(password)?;

        if self.check_email(&email).await? {
            return Err(ServerError::AlreadyExists("Email already in use".into()));
        }

        let hash = hash_password(password.to_string()).await?;
        let user = User::new_local(name, &email, hash);
        let row = user.clone();
        with_db(&self.db, move |db| db.insert_user(&row))
            .await
            .map_err(|e| match e {
                ServerError::Conflict(_) => ServerError::AlreadyExists("Email already in use".into()),
                other => other,
            })?;
        info!(user_id = %user.id, "Account registered");

        let (token, _) = self
            .sessions
            .create_session(&user, client, None, Provider::Local)
            .await?;
        Ok((user, token))
    }

    /// Password sign-in. Unknown emails, federated-only accounts and wrong
    /// passwords all fail with the same message.
    pub async fn login(
        &self,
        email: &str,
        password: &str,
        client: &ClientInfo,
    ) -> Result<Token, ServerError> {
        if password.is_empty() {
            return Err(ServerError::BadInput("Password is required".into()));
        }
        let email = normalise_email(email)?;
        let user = with_db(&self.db, move |db| db.find_user_by_email(&email))
            .await?
            .ok_or_else(|| ServerError::Unauthenticated(BAD_CREDENTIALS.into()))?;

        let stored = match (&user.provider, &user.password_hash) {
            (Provider::Local, Some(hash)) => hash.clone(),
            _ => return Err(ServerError::Unauthenticated(BAD_CREDENTIALS.into())),
        };
        if !verify_password(stored, password.to_string()).await? {
            debug!(user_id = %user.id, "Password mismatch");
            return Err(ServerError::Unauthenticated(BAD_CREDENTIALS.into()));
        }

        let (token, _) = self
            .sessions
            .create_session(&user, client, None, Provider::Local)
            .await?;
        Ok(token)
    }

    /// Mail a reset link when `email` belongs to a local account. The
    /// outcome is never reported to the caller.
    pub async fn forgot_password(&self, email: &str) -> Result<(), ServerError> {
        let email = normalise_email(email)?;
        let lookup = email.clone();
        let user = match with_db(&self.db, move |db| db.find_user_by_email(&lookup)).await? {
            Some(user) if user.provider == Provider::Local => user,
            Some(_) => {
                debug!("Reset requested for a federated account");
                return Ok(());
            }
            None => return Ok(()),
        };

        let reset = self.sessions.signer().issue_reset(user.id)?;
        let link = format!("{}/reset-password?token={}", self.frontend_url, reset.token);
        if let Err(e) = self
            .mailer
            .send(OutgoingMail::password_reset(&user.email, &link))
            .await
        {
            warn!(user_id = %user.id, error = %e, "Failed to send reset mail");
        }
        Ok(())
    }

    pub async fn reset_password(&self, token: &str, new_password: &str) -> Result<(), ServerError> {
        check_password(new_password)?;
        let claims = self
            .sessions
            .signer()
            .verify(token, TokenKind::Reset)
            .map_err(|e| ServerError::BadInput(e.to_string()))?;

        let user_id = claims.user_id;
        let user = with_db(&self.db, move |db| db.get_user(user_id))
            .await
            .map_err(|_| ServerError::BadInput("User not found".into()))?;
        if user.provider != Provider::Local {
            return Err(ServerError::BadInput(
                "This account signs in with an external provider".into(),
            ));
        }

        let jti = claims
            .jti
            .ok_or_else(|| ServerError::BadInput("Reset link is not valid".into()))?;
        let hash = hash_password(new_password.to_string()).await?;
        let revoked = with_db(&self.db, move |db| db.redeem_password_reset(user_id, jti, &hash))
            .await
            .map_err(|e| match e {
                ServerError::Conflict(_) => {
                    ServerError::BadInput("Reset link has already been used".into())
                }
                other => other,
            })?;
        self.sessions.forget_sessions(&revoked).await;
        info!(user_id = %user_id, revoked = revoked.len(), "Password reset");
        Ok(())
    }

    /// Look a user up by exact email, with the friendship state between them
    /// and `caller`.
    pub async fn search_by_email(
        &self,
        caller: &User,
        email: &str,
    ) -> Result<UserSearchResult, ServerError> {
        let email = normalise_email(email)?;
        if email == caller.email {
            return Err(ServerError::BadInput("Cannot search for yourself".into()));
        }

        let user = with_db(&self.db, move |db| db.find_user_by_email(&email))
            .await?
            .ok_or_else(|| ServerError::NotFound("User".into()))?;

        let (me, other) = (caller.id, user.id);
        let friendship = with_db(&self.db, move |db| db.get_friendship(me, other)).await?;

        Ok(UserSearchResult {
            friend_status: friendship.as_ref().map(|f| f.status),
            requested_by: friendship.as_ref().map(|f| f.requested_by),
            user,
        })
    }
}
