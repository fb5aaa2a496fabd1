//! Repository for [`Conversation`] records and the conversation list read
//! model.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use uuid::Uuid;

use devmess_shared::types::{ConversationType, MessageStatus, MessageType, ParticipantRole};

use crate::columns::{enum_at, fmt_opt_ts, fmt_ts, now_millis, opt_uuid_at, ts_at, uuid_at};
use crate::database::Database;
use crate::error::{Result, StoreError};
use crate::messages::{insert_message_in, message_in};
use crate::models::{Conversation, ConversationSummary, Message};
use crate::participants::{insert_participant_in, participants_with_users_in};

const CONVERSATION_COLUMNS: &str =
    "c.id, c.type, c.name, c.last_message_id, c.created_at, c.updated_at";

impl Database {
    /// The direct conversation both users take part in, if one exists.
    pub fn find_direct_conversation(&self, a: Uuid, b: Uuid) -> Result<Option<Conversation>> {
        find_direct_in(&self.conn(), a, b)
    }

    /// Open the direct conversation between `a` and `b`.
    ///
    /// The existence check, the conversation row, its greeting message, the
    /// last-message pointer and both participants all happen in one
    /// immediate transaction, so concurrent callers end up with a single
    /// conversation. Returns the conversation and whether it was created by
    /// this call.
    pub fn create_direct_conversation(
        &self,
        a: Uuid,
        b: Uuid,
        greeting: &str,
    ) -> Result<(Conversation, bool)> {
        let mut conn = self.conn();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        if let Some(existing) = find_direct_in(&tx, a, b)? {
            tx.commit()?;
            return Ok((existing, false));
        }

        let now = now_millis();
        let mut conversation = Conversation {
            id: Uuid::new_v4(),
            conversation_type: ConversationType::Direct,
            name: None,
            last_message_id: None,
            created_at: now,
            updated_at: now,
        };
        tx.execute(
            "INSERT INTO conversations (id, type, name, last_message_id, created_at, updated_at)
             VALUES (?1, ?2, ?3, NULL, ?4, ?5)",
            params![
                conversation.id.to_string(),
                conversation.conversation_type.as_str(),
                conversation.name,
                fmt_ts(&conversation.created_at),
                fmt_ts(&conversation.updated_at),
            ],
        )?;

        let greeting = Message {
            id: Uuid::new_v4(),
            conversation_id: conversation.id,
            sender_id: None,
            content: greeting.to_string(),
            message_type: MessageType::System,
            status: MessageStatus::Sent,
            is_edited: false,
            reply_to_id: None,
            deleted: false,
            created_at: now,
            updated_at: now,
        };
        insert_message_in(&tx, &greeting)?;

        tx.execute(
            "UPDATE conversations SET last_message_id = ?2 WHERE id = ?1",
            params![conversation.id.to_string(), greeting.id.to_string()],
        )?;
        conversation.last_message_id = Some(greeting.id);

        for user_id in [a, b] {
            insert_participant_in(&tx, conversation.id, user_id, ParticipantRole::Member, now)?;
        }

        tx.commit()?;
        tracing::info!(conversation_id = %conversation.id, "direct conversation created");

        Ok((conversation, true))
    }

    pub fn get_conversation(&self, id: Uuid) -> Result<Conversation> {
        self.conn()
            .query_row(
                &format!("SELECT {CONVERSATION_COLUMNS} FROM conversations c WHERE c.id = ?1"),
                params![id.to_string()],
                row_to_conversation,
            )
            .map_err(StoreError::classify)
    }

    /// One page of `user_id`'s conversations, most recently active first.
    ///
    /// Only conversations with `updated_at` strictly before `before` are
    /// returned; ties on `updated_at` are broken by descending id. Each entry
    /// carries its participants (with their users) and its last message.
    pub fn list_conversations_for_user(
        &self,
        user_id: Uuid,
        before: Option<DateTime<Utc>>,
        limit: u32,
    ) -> Result<Vec<ConversationSummary>> {
        let conn = self.conn();

        let conversations = {
            let mut stmt = conn.prepare(&format!(
                "SELECT {CONVERSATION_COLUMNS}
                 FROM conversations c
                 JOIN participants p ON p.conversation_id = c.id AND p.user_id = ?1
                 WHERE (?2 IS NULL OR c.updated_at < ?2)
                 ORDER BY c.updated_at DESC, c.id DESC
                 LIMIT ?3"
            ))?;
            let rows = stmt.query_map(
                params![user_id.to_string(), fmt_opt_ts(&before), limit],
                row_to_conversation,
            )?;
            let mut conversations = Vec::new();
            for row in rows {
                conversations.push(row?);
            }
            conversations
        };

        let mut summaries = Vec::with_capacity(conversations.len());
        for conversation in conversations {
            let participants = participants_with_users_in(&conn, conversation.id)?;
            let last_message = match conversation.last_message_id {
                Some(id) => message_in(&conn, id)?,
                None => None,
            };
            summaries.push(ConversationSummary {
                conversation,
                participants,
                last_message,
            });
        }
        Ok(summaries)
    }
}

fn find_direct_in(conn: &Connection, a: Uuid, b: Uuid) -> Result<Option<Conversation>> {
    let conversation = conn
        .query_row(
            &format!(
                "SELECT {CONVERSATION_COLUMNS}
                 FROM conversations c
                 JOIN participants pa ON pa.conversation_id = c.id AND pa.user_id = ?1
                 JOIN participants pb ON pb.conversation_id = c.id AND pb.user_id = ?2
                 WHERE c.type = 'direct'
                 ORDER BY c.created_at ASC
                 LIMIT 1"
            ),
            params![a.to_string(), b.to_string()],
            row_to_conversation,
        )
        .optional()?;
    Ok(conversation)
}

fn row_to_conversation(row: &rusqlite::Row<'_>) -> rusqlite::Result<Conversation> {
    Ok(Conversation {
        id: uuid_at(row, 0)?,
        conversation_type: enum_at(row, 1)?,
        name: row.get(2)?,
        last_message_id: opt_uuid_at(row, 3)?,
        created_at: ts_at(row, 4)?,
        updated_at: ts_at(row, 5)?,
    })
}
