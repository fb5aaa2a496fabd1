//! Direct conversations and their messages.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, warn};
use uuid::Uuid;

use devmess_shared::constants::{
    CONVERSATION_CACHE_TTL_SECS, DEFAULT_CONVERSATION_PAGE, DEFAULT_MESSAGE_PAGE,
    DIRECT_GREETING, MAX_PAGE_SIZE, PARTICIPANTS_CACHE_TTL_SECS,
};
use devmess_shared::protocol::{EventType, WsEvent};
use devmess_shared::types::MessageType;
use devmess_store::columns::now_millis;
use devmess_store::{Conversation, ConversationSummary, Message, Participant};

use crate::cache::Cache;
use crate::db::{with_db, Db};
use crate::error::ServerError;
use crate::hub::Hub;

/// Clamp a requested page size into `1..=MAX_PAGE_SIZE`.
fn page_size(requested: Option<u32>, default: u32) -> u32 {
    requested.unwrap_or(default).clamp(1, MAX_PAGE_SIZE)
}

#[derive(Clone)]
pub struct ConversationService {
    db: Db,
    cache: Cache,
    hub: Arc<Hub>,
}

impl ConversationService {
    pub fn new(db: Db, cache: Cache, hub: Arc<Hub>) -> Self {
        Self { db, cache, hub }
    }

    /// The direct conversation between `a` and `b`, created with its greeting
    /// on first use. Returns whether this call created it.
    pub async fn open_direct(&self, a: Uuid, b: Uuid) -> Result<(Conversation, bool), ServerError> {
        if let Ok(Some(conversation)) = self.cache.get_direct_conversation(a, b).await {
            return Ok((conversation, false));
        }

        let (conversation, created) = with_db(&self.db, move |db| {
            db.create_direct_conversation(a, b, DIRECT_GREETING)
        })
        .await?;

        self.remember_direct(a, b, &conversation).await;
        Ok((conversation, created))
    }

    async fn remember_direct(&self, a: Uuid, b: Uuid, conversation: &Conversation) {
        let ttl = Duration::from_secs(CONVERSATION_CACHE_TTL_SECS);
        if let Err(e) = self
            .cache
            .put_direct_conversation(a, b, conversation, ttl)
            .await
        {
            debug!(error = %e, "Failed to cache direct conversation");
        }
    }

    pub async fn find_by_other_user(&self, caller: Uuid, other: Uuid) -> Result<Conversation, ServerError> {
        if let Ok(Some(conversation)) = self.cache.get_direct_conversation(caller, other).await {
            return Ok(conversation);
        }

        let conversation = with_db(&self.db, move |db| db.find_direct_conversation(caller, other))
            .await?
            .ok_or_else(|| ServerError::NotFound("Conversation".into()))?;
        self.remember_direct(caller, other, &conversation).await;
        Ok(conversation)
    }

    pub async fn list_for_user(
        &self,
        caller: Uuid,
        before: Option<DateTime<Utc>>,
        limit: Option<u32>,
    ) -> Result<Vec<ConversationSummary>, ServerError> {
        let limit = page_size(limit, DEFAULT_CONVERSATION_PAGE);
        with_db(&self.db, move |db| db.list_conversations_for_user(caller, before, limit)).await
    }

    /// Participants of a conversation, served from the cache when warm.
    pub async fn participants(&self, conversation_id: Uuid) -> Result<Vec<Participant>, ServerError> {
        if let Ok(Some(participants)) = self.cache.get_participants(conversation_id).await {
            return Ok(participants);
        }

        let participants =
            with_db(&self.db, move |db| db.list_participants(conversation_id)).await?;
        if let Err(e) = self
            .cache
            .put_participants(
                conversation_id,
                &participants,
                Duration::from_secs(PARTICIPANTS_CACHE_TTL_SECS),
            )
            .await
        {
            debug!(error = %e, "Failed to cache participants");
        }
        Ok(participants)
    }

    /// Participants of a conversation the caller belongs to.
    async fn members_for(&self, caller: Uuid, conversation_id: Uuid) -> Result<Vec<Participant>, ServerError> {
        let participants = self.participants(conversation_id).await?;
        if participants.iter().any(|p| p.user_id == caller) {
            Ok(participants)
        } else if participants.is_empty() {
            Err(ServerError::NotFound("Conversation".into()))
        } else {
            Err(ServerError::Forbidden("Not a participant of this conversation".into()))
        }
    }

    pub async fn list_messages(
        &self,
        caller: Uuid,
        conversation_id: Uuid,
        before: Option<DateTime<Utc>>,
        limit: Option<u32>,
    ) -> Result<Vec<Message>, ServerError> {
        self.members_for(caller, conversation_id).await?;
        let limit = page_size(limit, DEFAULT_MESSAGE_PAGE);
        with_db(&self.db, move |db| {
            db.list_messages_for_participant(conversation_id, caller, before, limit)
        })
        .await
    }

    /// Append a text message from `caller` and push it to the other
    /// participants. Delivery is best effort; the stored message is the
    /// source of truth.
    pub async fn send_message(
        &self,
        caller: Uuid,
        conversation_id: Uuid,
        content: &str,
    ) -> Result<Message, ServerError> {
        let content = content.trim();
        if content.is_empty() {
            return Err(ServerError::BadInput("Message content is required".into()));
        }
        let members = self.members_for(caller, conversation_id).await?;

        let text = content.to_string();
        let message = with_db(&self.db, move |db| {
            db.append_message(conversation_id, Some(caller), &text, MessageType::Text)
        })
        .await?;

        let recipients: Vec<Uuid> = members
            .iter()
            .map(|p| p.user_id)
            .filter(|id| *id != caller)
            .collect();
        match WsEvent::with_payload(EventType::ReceiveMessage, &message) {
            Ok(event) => {
                let event = event.from_user(caller);
                for recipient in recipients {
                    self.hub.push(recipient, &event.clone().to_user(recipient));
                }
            }
            Err(e) => warn!(error = %e, "Failed to encode message event"),
        }

        Ok(message)
    }

    /// Advance the caller's read cursor to now.
    pub async fn mark_read(&self, caller: Uuid, conversation_id: Uuid) -> Result<DateTime<Utc>, ServerError> {
        let at = now_millis();
        let read_at = with_db(&self.db, move |db| db.mark_read(conversation_id, caller, at))
            .await
            .map_err(|e| match e {
                ServerError::NotFound(_) => {
                    ServerError::Forbidden("Not a participant of this conversation".into())
                }
                other => other,
            })?;

        if let Err(e) = self.cache.evict_participants(conversation_id).await {
            debug!(error = %e, "Failed to evict participants");
        }
        Ok(read_at)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use devmess_store::{Database, User};

    async fn setup() -> (ConversationService, Arc<Hub>, Db, User, User) {
        let db: Db = Arc::new(Database::open_in_memory().unwrap());
        let cache = Cache::in_memory();
        let hub = Hub::spawn(cache.clone());
        let a = User::new_local("A", "a@x", "h".into());
        let b = User::new_local("B", "b@x", "h".into());
        db.insert_user(&a).unwrap();
        db.insert_user(&b).unwrap();
        (ConversationService::new(db.clone(), cache, hub.clone()), hub, db, a, b)
    }

    #[test]
    fn test_page_size_bounds() {
        assert_eq!(page_size(None, 20), 20);
        assert_eq!(page_size(Some(0), 20), 1);
        assert_eq!(page_size(Some(1000), 20), MAX_PAGE_SIZE);
    }

    #[tokio::test]
    async fn test_open_direct_is_idempotent() {
        let (service, _hub, db, a, b) = setup().await;

        let (first, created) = service.open_direct(a.id, b.id).await.unwrap();
        assert!(created);
        let (second, created) = service.open_direct(b.id, a.id).await.unwrap();
        assert!(!created);
        assert_eq!(first.id, second.id);
        assert_eq!(db.list_participants(first.id).unwrap().len(), 2);

        assert_eq!(
            service.find_by_other_user(b.id, a.id).await.unwrap().id,
            first.id
        );
    }

    #[tokio::test]
    async fn test_find_by_other_user_missing() {
        let (service, _hub, _db, a, b) = setup().await;
        assert!(matches!(
            service.find_by_other_user(a.id, b.id).await,
            Err(ServerError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_send_message_advances_and_notifies() {
        let (service, hub, _db, a, b) = setup().await;
        let (conversation, _) = service.open_direct(a.id, b.id).await.unwrap();
        let mut inbox = hub.register(b.id).await.unwrap();

        let message = service
            .send_message(a.id, conversation.id, "  hello ")
            .await
            .unwrap();
        assert_eq!(message.content, "hello");

        let page = service.list_for_user(b.id, None, None).await.unwrap();
        assert_eq!(page[0].conversation.id, conversation.id);
        assert!(page[0].conversation.updated_at > conversation.updated_at);
        assert_eq!(page[0].last_message.as_ref().unwrap().content, "hello");

        let frame = inbox.queue.recv().await.unwrap();
        let event = WsEvent::from_slice(&frame).unwrap();
        assert_eq!(event.event_type, EventType::ReceiveMessage);
        assert_eq!(event.from, Some(a.id));
        let delivered: Message = serde_json::from_str(event.payload_str().unwrap()).unwrap();
        assert_eq!(delivered.id, message.id);
    }

    #[tokio::test]
    async fn test_non_members_are_refused() {
        let (service, _hub, db, a, b) = setup().await;
        let (conversation, _) = service.open_direct(a.id, b.id).await.unwrap();
        let outsider = User::new_local("C", "c@x", "h".into());
        db.insert_user(&outsider).unwrap();

        assert!(matches!(
            service.send_message(outsider.id, conversation.id, "hi").await,
            Err(ServerError::Forbidden(_))
        ));
        assert!(matches!(
            service.list_messages(outsider.id, conversation.id, None, None).await,
            Err(ServerError::Forbidden(_))
        ));
        assert!(matches!(
            service.mark_read(outsider.id, conversation.id).await,
            Err(ServerError::Forbidden(_))
        ));
        assert!(matches!(
            service.send_message(a.id, Uuid::new_v4(), "hi").await,
            Err(ServerError::NotFound(_))
        ));
        assert!(matches!(
            service.send_message(a.id, conversation.id, "   ").await,
            Err(ServerError::BadInput(_))
        ));
    }

    #[tokio::test]
    async fn test_message_history_and_read_cursor() {
        let (service, _hub, _db, a, b) = setup().await;
        let (conversation, _) = service.open_direct(a.id, b.id).await.unwrap();
        for i in 0..3 {
            service
                .send_message(a.id, conversation.id, &format!("m{i}"))
                .await
                .unwrap();
        }

        let page = service
            .list_messages(b.id, conversation.id, None, Some(2))
            .await
            .unwrap();
        assert_eq!(page.len(), 2);
        assert_eq!(page[0].content, "m2");

        let older = service
            .list_messages(b.id, conversation.id, Some(page[1].created_at), None)
            .await
            .unwrap();
        // m0 plus the greeting.
        assert_eq!(older.len(), 2);
        assert_eq!(older[0].content, "m0");

        // Warm the participants cache, then make sure mark-read invalidates it.
        service.participants(conversation.id).await.unwrap();
        let read_at = service.mark_read(b.id, conversation.id).await.unwrap();
        let participants = service.participants(conversation.id).await.unwrap();
        let me = participants.iter().find(|p| p.user_id == b.id).unwrap();
        assert_eq!(me.last_read_at, Some(read_at));
    }
}
