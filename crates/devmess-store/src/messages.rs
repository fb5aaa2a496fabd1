use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use uuid::Uuid;

use devmess_shared::types::{MessageStatus, MessageType};

use crate::columns::{enum_at, fmt_opt_ts, fmt_ts, now_millis, opt_uuid_at, ts_at, uuid_at};
use crate::database::Database;
use crate::error::{Result, StoreError};
use crate::models::Message;

const MESSAGE_COLUMNS: &str = "m.id, m.conversation_id, m.sender_id, m.content, m.type, m.status, \
     m.is_edited, m.reply_to_id, m.deleted, m.created_at, m.updated_at";

impl Database {
    /// Append a message and advance the conversation's last-message pointer.
    ///
    /// The new `created_at` (and the conversation's `updated_at`) is strictly
    /// later than the conversation's previous `updated_at`, even when the
    /// wall clock has not moved or has stepped backwards.
    pub fn append_message(
        &self,
        conversation_id: Uuid,
        sender_id: Option<Uuid>,
        content: &str,
        message_type: MessageType,
    ) -> Result<Message> {
        let mut conn = self.conn();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let previous: String = tx
            .query_row(
                "SELECT updated_at FROM conversations WHERE id = ?1",
                params![conversation_id.to_string()],
                |row| row.get(0),
            )
            .map_err(StoreError::classify)?;
        let previous = DateTime::parse_from_rfc3339(&previous)?.with_timezone(&Utc);

        let at = next_timestamp(previous, now_millis());
        let message = Message {
            id: Uuid::new_v4(),
            conversation_id,
            sender_id,
            content: content.to_string(),
            message_type,
            status: MessageStatus::Sent,
            is_edited: false,
            reply_to_id: None,
            deleted: false,
            created_at: at,
            updated_at: at,
        };

        insert_message_in(&tx, &message)?;
        tx.execute(
            "UPDATE conversations SET last_message_id = ?2, updated_at = ?3 WHERE id = ?1",
            params![
                conversation_id.to_string(),
                message.id.to_string(),
                fmt_ts(&at)
            ],
        )?;
        tx.commit()?;

        Ok(message)
    }

    pub fn get_message(&self, id: Uuid) -> Result<Message> {
        message_in(&self.conn(), id)?.ok_or(StoreError::NotFound)
    }

    /// Newest-first page of a conversation's messages, visible only to its
    /// participants: a non-member gets an empty page.
    pub fn list_messages_for_participant(
        &self,
        conversation_id: Uuid,
        user_id: Uuid,
        before: Option<DateTime<Utc>>,
        limit: u32,
    ) -> Result<Vec<Message>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {MESSAGE_COLUMNS}
             FROM messages m
             JOIN participants p
               ON p.conversation_id = m.conversation_id AND p.user_id = ?2
             WHERE m.conversation_id = ?1
               AND m.deleted = 0
               AND (?3 IS NULL OR m.created_at < ?3)
             ORDER BY m.created_at DESC, m.id DESC
             LIMIT ?4"
        ))?;

        let rows = stmt.query_map(
            params![
                conversation_id.to_string(),
                user_id.to_string(),
                fmt_opt_ts(&before),
                limit,
            ],
            row_to_message,
        )?;

        let mut messages = Vec::new();
        for row in rows {
            messages.push(row?);
        }
        Ok(messages)
    }
}

/// Smallest storable timestamp that is both `>= now` and `> previous`.
fn next_timestamp(previous: DateTime<Utc>, now: DateTime<Utc>) -> DateTime<Utc> {
    let floor = previous + Duration::milliseconds(1);
    if now < floor {
        floor
    } else {
        now
    }
}

pub(crate) fn insert_message_in(conn: &Connection, message: &Message) -> Result<()> {
    conn.execute(
        "INSERT INTO messages (id, conversation_id, sender_id, content, type, status,
                               is_edited, reply_to_id, deleted, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
        params![
            message.id.to_string(),
            message.conversation_id.to_string(),
            message.sender_id.map(|u| u.to_string()),
            message.content,
            message.message_type.as_str(),
            message.status.as_str(),
            message.is_edited,
            message.reply_to_id.map(|u| u.to_string()),
            message.deleted,
            fmt_ts(&message.created_at),
            fmt_ts(&message.updated_at),
        ],
    )
    .map_err(StoreError::classify)?;
    Ok(())
}

pub(crate) fn message_in(conn: &Connection, id: Uuid) -> Result<Option<Message>> {
    let message = conn
        .query_row(
            &format!("SELECT {MESSAGE_COLUMNS} FROM messages m WHERE m.id = ?1"),
            params![id.to_string()],
            row_to_message,
        )
        .optional()?;
    Ok(message)
}

fn row_to_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<Message> {
    Ok(Message {
        id: uuid_at(row, 0)?,
        conversation_id: uuid_at(row, 1)?,
        sender_id: opt_uuid_at(row, 2)?,
        content: row.get(3)?,
        message_type: enum_at(row, 4)?,
        status: enum_at(row, 5)?,
        is_edited: row.get(6)?,
        reply_to_id: opt_uuid_at(row, 7)?,
        deleted: row.get(8)?,
        created_at: ts_at(row, 9)?,
        updated_at: ts_at(row, 10)?,
    })
}
