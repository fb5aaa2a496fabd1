//! Realtime wire schema.
//!
//! Every frame on the bidirectional transport is a JSON object
//! `{type, from?, to?, payload?}`. The payload is kept as raw JSON so a
//! forwarded frame reaches its recipient byte-for-byte as the sender wrote it.

use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;
use uuid::Uuid;

/// Event discriminator. Unrecognised values are preserved in `Unknown` so
/// the endpoint can answer them with an error frame instead of dropping the
/// connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum EventType {
    Ping,
    Chat,
    NotifyFriend,
    IsOnline,
    IsOnlineResponse,
    FriendInvite,
    UpdateFriend,
    DirectConversation,
    ReceiveMessage,
    Error,
    Unknown(String),
}

impl EventType {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Ping => "ping",
            Self::Chat => "chat",
            Self::NotifyFriend => "notify_friend",
            Self::IsOnline => "is_online",
            Self::IsOnlineResponse => "is_online_response",
            Self::FriendInvite => "friend_invite",
            Self::UpdateFriend => "update_friend",
            Self::DirectConversation => "direct_conversation",
            Self::ReceiveMessage => "receive_message",
            Self::Error => "error",
            Self::Unknown(other) => other,
        }
    }
}

impl From<String> for EventType {
    fn from(value: String) -> Self {
        match value.as_str() {
            "ping" => Self::Ping,
            "chat" => Self::Chat,
            "notify_friend" => Self::NotifyFriend,
            "is_online" => Self::IsOnline,
            "is_online_response" => Self::IsOnlineResponse,
            "friend_invite" => Self::FriendInvite,
            "update_friend" => Self::UpdateFriend,
            "direct_conversation" => Self::DirectConversation,
            "receive_message" => Self::ReceiveMessage,
            "error" => Self::Error,
            _ => Self::Unknown(value),
        }
    }
}

impl From<EventType> for String {
    fn from(value: EventType) -> Self {
        match value {
            EventType::Unknown(other) => other,
            known => known.as_str().to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WsEvent {
    #[serde(rename = "type")]
    pub event_type: EventType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Box<RawValue>>,
}

impl WsEvent {
    pub fn new(event_type: EventType) -> Self {
        Self {
            event_type,
            from: None,
            to: None,
            payload: None,
        }
    }

    /// Build an event whose payload is `payload` serialised as JSON.
    pub fn with_payload<T: Serialize>(
        event_type: EventType,
        payload: &T,
    ) -> Result<Self, serde_json::Error> {
        let mut event = Self::new(event_type);
        event.payload = Some(serde_json::value::to_raw_value(payload)?);
        Ok(event)
    }

    pub fn error(message: &str) -> Self {
        // A plain string always serialises.
        let payload = serde_json::value::to_raw_value(message).ok();
        Self {
            payload,
            ..Self::new(EventType::Error)
        }
    }

    pub fn from_user(mut self, user_id: Uuid) -> Self {
        self.from = Some(user_id);
        self
    }

    pub fn to_user(mut self, user_id: Uuid) -> Self {
        self.to = Some(user_id);
        self
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn from_slice(data: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(data)
    }

    /// The raw payload text, if any.
    pub fn payload_str(&self) -> Option<&str> {
        self.payload.as_deref().map(RawValue::get)
    }
}

/// Reply to an `is_online` query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OnlineStatus {
    pub user_id: Uuid,
    pub is_online: bool,
    /// Seconds since the user was last seen active.
    pub time_online: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_chat_frame_keeps_payload_verbatim() {
        let to = Uuid::new_v4();
        let raw = format!(
            r#"{{"type":"chat","to":"{to}","payload":{{"text":"hi",  "n":[1,2]}}}}"#
        );

        let event = WsEvent::from_slice(raw.as_bytes()).unwrap();
        assert_eq!(event.event_type, EventType::Chat);
        assert_eq!(event.to, Some(to));
        assert!(event.from.is_none());
        assert_eq!(event.payload_str(), Some(r#"{"text":"hi",  "n":[1,2]}"#));
    }

    #[test]
    fn test_unknown_type_survives_parsing() {
        let event = WsEvent::from_slice(br#"{"type":"dance"}"#).unwrap();
        assert_eq!(event.event_type, EventType::Unknown("dance".to_string()));

        let bytes = event.to_bytes().unwrap();
        assert_eq!(bytes, br#"{"type":"dance"}"#);
    }

    #[test]
    fn test_error_frame_shape() {
        let bytes = WsEvent::error("unknown message type").to_bytes().unwrap();
        assert_eq!(
            String::from_utf8(bytes).unwrap(),
            r#"{"type":"error","payload":"unknown message type"}"#
        );
    }

    #[test]
    fn test_with_payload() {
        let user_id = Uuid::new_v4();
        let status = OnlineStatus {
            user_id,
            is_online: true,
            time_online: 3,
        };
        let event = WsEvent::with_payload(EventType::IsOnlineResponse, &status)
            .unwrap()
            .to_user(user_id);

        let value: serde_json::Value = serde_json::from_slice(&event.to_bytes().unwrap()).unwrap();
        assert_eq!(value["type"], "is_online_response");
        assert_eq!(value["payload"]["is_online"], true);
        assert_eq!(value["payload"]["time_online"], 3);
    }

    #[test]
    fn test_missing_type_is_invalid() {
        assert!(WsEvent::from_slice(br#"{"to":null}"#).is_err());
        assert!(WsEvent::from_slice(b"not json").is_err());
    }
}
