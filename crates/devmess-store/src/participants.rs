use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use uuid::Uuid;

use devmess_shared::types::ParticipantRole;

use crate::columns::{enum_at, fmt_ts, opt_ts_at, ts_at, uuid_at};
use crate::database::Database;
use crate::error::{Result, StoreError};
use crate::models::{Participant, ParticipantWithUser};
use crate::users::{row_to_user, USER_COLUMNS};

const PARTICIPANT_COLUMNS: &str =
    "p.id, p.conversation_id, p.user_id, p.role, p.last_read_at, p.joined_at";

impl Database {
    pub fn list_participants(&self, conversation_id: Uuid) -> Result<Vec<Participant>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {PARTICIPANT_COLUMNS}
             FROM participants p
             WHERE p.conversation_id = ?1
             ORDER BY p.joined_at ASC, p.id ASC"
        ))?;
        let rows = stmt.query_map(params![conversation_id.to_string()], |row| {
            row_to_participant(row, 0)
        })?;

        let mut participants = Vec::new();
        for row in rows {
            participants.push(row?);
        }
        Ok(participants)
    }

    /// Advance the read cursor of `user_id` in a conversation. The cursor
    /// never moves backwards.
    pub fn mark_read(
        &self,
        conversation_id: Uuid,
        user_id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<DateTime<Utc>> {
        let conn = self.conn();
        let affected = conn.execute(
            "UPDATE participants
             SET last_read_at = MAX(COALESCE(last_read_at, ''), ?3)
             WHERE conversation_id = ?1 AND user_id = ?2",
            params![conversation_id.to_string(), user_id.to_string(), fmt_ts(&at)],
        )?;
        if affected == 0 {
            return Err(StoreError::NotFound);
        }

        let stored: String = conn.query_row(
            "SELECT last_read_at FROM participants WHERE conversation_id = ?1 AND user_id = ?2",
            params![conversation_id.to_string(), user_id.to_string()],
            |row| row.get(0),
        )?;
        Ok(DateTime::parse_from_rfc3339(&stored)?.with_timezone(&Utc))
    }
}

pub(crate) fn insert_participant_in(
    conn: &Connection,
    conversation_id: Uuid,
    user_id: Uuid,
    role: ParticipantRole,
    joined_at: DateTime<Utc>,
) -> Result<()> {
    conn.execute(
        "INSERT INTO participants (id, conversation_id, user_id, role, last_read_at, joined_at)
         VALUES (?1, ?2, ?3, ?4, NULL, ?5)",
        params![
            Uuid::new_v4().to_string(),
            conversation_id.to_string(),
            user_id.to_string(),
            role.as_str(),
            fmt_ts(&joined_at),
        ],
    )
    .map_err(StoreError::classify)?;
    Ok(())
}

pub(crate) fn participants_with_users_in(
    conn: &Connection,
    conversation_id: Uuid,
) -> Result<Vec<ParticipantWithUser>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {PARTICIPANT_COLUMNS}, {USER_COLUMNS}
         FROM participants p
         JOIN users u ON u.id = p.user_id
         WHERE p.conversation_id = ?1
         ORDER BY p.joined_at ASC, p.id ASC"
    ))?;
    let rows = stmt.query_map(params![conversation_id.to_string()], |row| {
        Ok(ParticipantWithUser {
            participant: row_to_participant(row, 0)?,
            user: row_to_user(row, 6)?,
        })
    })?;

    let mut participants = Vec::new();
    for row in rows {
        participants.push(row?);
    }
    Ok(participants)
}

fn row_to_participant(row: &rusqlite::Row<'_>, offset: usize) -> rusqlite::Result<Participant> {
    Ok(Participant {
        id: uuid_at(row, offset)?,
        conversation_id: uuid_at(row, offset + 1)?,
        user_id: uuid_at(row, offset + 2)?,
        role: enum_at(row, offset + 3)?,
        last_read_at: opt_ts_at(row, offset + 4)?,
        joined_at: ts_at(row, offset + 5)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::columns::now_millis;
    use crate::models::User;
    use chrono::Duration;

    fn setup() -> (Database, User, User, Uuid) {
        let db = Database::open_in_memory().unwrap();
        let a = User::new_local("A", "a@x", "h".into());
        let b = User::new_local("B", "b@x", "h".into());
        db.insert_user(&a).unwrap();
        db.insert_user(&b).unwrap();
        let (conversation, _) = db.create_direct_conversation(a.id, b.id, "hi").unwrap();
        (db, a, b, conversation.id)
    }

    #[test]
    fn membership() {
        let (db, a, b, cid) = setup();
        let members: Vec<Uuid> = db
            .list_participants(cid)
            .unwrap()
            .iter()
            .map(|p| p.user_id)
            .collect();
        assert_eq!(members.len(), 2);
        assert!(members.contains(&a.id) && members.contains(&b.id));
        assert!(db.list_participants(Uuid::new_v4()).unwrap().is_empty());

        let with_users = participants_with_users_in(&db.conn(), cid).unwrap();
        assert_eq!(with_users.len(), 2);
        assert!(with_users.iter().all(|p| p.user.id == p.participant.user_id));
    }

    #[test]
    fn participant_pair_is_unique() {
        let (db, a, _b, cid) = setup();
        let conn = db.conn();
        let err = insert_participant_in(&conn, cid, a.id, ParticipantRole::Member, now_millis())
            .unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
    }

    #[test]
    fn read_cursor_only_moves_forward() {
        let (db, a, _b, cid) = setup();
        let t = now_millis();

        assert_eq!(db.mark_read(cid, a.id, t).unwrap(), t);
        assert_eq!(db.mark_read(cid, a.id, t - Duration::seconds(30)).unwrap(), t);

        let later = t + Duration::seconds(5);
        assert_eq!(db.mark_read(cid, a.id, later).unwrap(), later);

        assert!(matches!(
            db.mark_read(cid, Uuid::new_v4(), t),
            Err(StoreError::NotFound)
        ));
    }
}
