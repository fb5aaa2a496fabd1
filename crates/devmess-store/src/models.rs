//! Domain model structs persisted in the SQLite database.
//!
//! Entities reference each other by id only; joined read models such as
//! [`ConversationSummary`] are assembled at query time.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use devmess_shared::types::{
    ConversationType, FriendshipStatus, MessageStatus, MessageType, ParticipantRole, Provider,
    UserStatus,
};

// ---------------------------------------------------------------------------
// User
// ---------------------------------------------------------------------------

/// A registered account.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct User {
    pub id: Uuid,
    pub name: String,
    /// Globally unique, stored lowercased.
    pub email: String,
    /// Present iff `provider` is [`Provider::Local`]. Never serialised, so it
    /// cannot leak through API responses or the session cache.
    #[serde(skip_serializing, default)]
    pub password_hash: Option<String>,
    /// Storage key or URL of the avatar image.
    pub avatar: String,
    pub provider: Provider,
    pub status: UserStatus,
    pub last_seen: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl User {
    /// A fresh local account with a pre-hashed password.
    pub fn new_local(name: &str, email: &str, password_hash: String) -> Self {
        let now = crate::columns::now_millis();
        Self {
            id: Uuid::new_v4(),
            name: name.to_string(),
            email: email.to_lowercase(),
            password_hash: Some(password_hash),
            avatar: String::new(),
            provider: Provider::Local,
            status: UserStatus::Offline,
            last_seen: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// A fresh account created by a federated sign-in.
    pub fn new_federated(name: &str, email: &str, provider: Provider) -> Self {
        let now = crate::columns::now_millis();
        Self {
            id: Uuid::new_v4(),
            name: name.to_string(),
            email: email.to_lowercase(),
            password_hash: None,
            avatar: String::new(),
            provider,
            status: UserStatus::Offline,
            last_seen: None,
            created_at: now,
            updated_at: now,
        }
    }
}

// ---------------------------------------------------------------------------
// Device & Token
// ---------------------------------------------------------------------------

/// A signed-in client, unique per `(user_id, ip, user_agent)`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Device {
    pub id: Uuid,
    pub user_id: Uuid,
    #[serde(rename = "type")]
    pub device_type: String,
    pub name: String,
    pub ip: String,
    pub user_agent: String,
    pub created_at: DateTime<Utc>,
}

/// The single live credential pair of a device.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Token {
    pub id: Uuid,
    pub device_id: Uuid,
    pub access_token: String,
    pub refresh_token: Option<String>,
    /// Epoch seconds.
    pub expires_at: i64,
    pub token_type: Provider,
    pub created_at: DateTime<Utc>,
}

impl Token {
    pub fn is_expired_at(&self, now_epoch: i64) -> bool {
        now_epoch >= self.expires_at
    }
}

// ---------------------------------------------------------------------------
// Friendship
// ---------------------------------------------------------------------------

/// Relationship between two users. `user_id < friend_id` always holds in
/// storage; use [`Friendship::other_party`] rather than assuming a side.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Friendship {
    pub id: Uuid,
    pub user_id: Uuid,
    pub friend_id: Uuid,
    pub requested_by: Uuid,
    pub status: FriendshipStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Friendship {
    pub fn other_party(&self, me: Uuid) -> Uuid {
        if self.user_id == me {
            self.friend_id
        } else {
            self.user_id
        }
    }
}

// ---------------------------------------------------------------------------
// Conversation, Participant, Message
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Conversation {
    pub id: Uuid,
    #[serde(rename = "type")]
    pub conversation_type: ConversationType,
    pub name: Option<String>,
    pub last_message_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Participant {
    pub id: Uuid,
    pub conversation_id: Uuid,
    pub user_id: Uuid,
    pub role: ParticipantRole,
    pub last_read_at: Option<DateTime<Utc>>,
    pub joined_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Message {
    pub id: Uuid,
    pub conversation_id: Uuid,
    /// `None` for system messages.
    pub sender_id: Option<Uuid>,
    pub content: String,
    #[serde(rename = "type")]
    pub message_type: MessageType,
    pub status: MessageStatus,
    pub is_edited: bool,
    pub reply_to_id: Option<Uuid>,
    pub deleted: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Read models
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ParticipantWithUser {
    #[serde(flatten)]
    pub participant: Participant,
    pub user: User,
}

/// One row of the conversation list: the conversation with its members and
/// latest message preloaded.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConversationSummary {
    #[serde(flatten)]
    pub conversation: Conversation,
    pub participants: Vec<ParticipantWithUser>,
    pub last_message: Option<Message>,
}
