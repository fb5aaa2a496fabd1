//! Repository for [`Friendship`] records.
//!
//! A pair of users is stored once, with the smaller id in `user_id`. Every
//! lookup canonicalises its arguments, so callers never care which side of
//! the pair they are on. State changes go through
//! [`Database::transition_friendship`], a compare-and-set that lets exactly
//! one of several concurrent actors win.

use rusqlite::{params, OptionalExtension};
use uuid::Uuid;

use devmess_shared::types::FriendshipStatus;

use crate::columns::{enum_at, fmt_ts, now_millis, ts_at, uuid_at};
use crate::database::Database;
use crate::error::{Result, StoreError};
use crate::models::{Friendship, User};
use crate::users::{row_to_user, USER_COLUMNS};

/// Order a pair of user ids the way it is stored.
pub fn canonical_pair(a: Uuid, b: Uuid) -> (Uuid, Uuid) {
    if a <= b {
        (a, b)
    } else {
        (b, a)
    }
}

/// Expected current state for a compare-and-set transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FriendshipGuard {
    pub status: FriendshipStatus,
    /// When set, the row must also have been requested by this user.
    pub requested_by: Option<Uuid>,
}

impl Database {
    /// Create the row for a pair that has none. Fails with
    /// [`StoreError::Conflict`] if a concurrent writer created it first.
    pub fn insert_friendship(
        &self,
        a: Uuid,
        b: Uuid,
        requested_by: Uuid,
        status: FriendshipStatus,
    ) -> Result<Friendship> {
        let (user_id, friend_id) = canonical_pair(a, b);
        let now = now_millis();
        let friendship = Friendship {
            id: Uuid::new_v4(),
            user_id,
            friend_id,
            requested_by,
            status,
            created_at: now,
            updated_at: now,
        };

        self.conn()
            .execute(
                "INSERT INTO friendships (id, user_id, friend_id, requested_by, status,
                                          created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    friendship.id.to_string(),
                    friendship.user_id.to_string(),
                    friendship.friend_id.to_string(),
                    friendship.requested_by.to_string(),
                    friendship.status.as_str(),
                    fmt_ts(&friendship.created_at),
                    fmt_ts(&friendship.updated_at),
                ],
            )
            .map_err(StoreError::classify)?;

        Ok(friendship)
    }

    /// The row for the unordered pair `{a, b}`, if any.
    pub fn get_friendship(&self, a: Uuid, b: Uuid) -> Result<Option<Friendship>> {
        let (user_id, friend_id) = canonical_pair(a, b);
        let friendship = self
            .conn()
            .query_row(
                "SELECT id, user_id, friend_id, requested_by, status, created_at, updated_at
                 FROM friendships
                 WHERE user_id = ?1 AND friend_id = ?2",
                params![user_id.to_string(), friend_id.to_string()],
                row_to_friendship,
            )
            .optional()?;
        Ok(friendship)
    }

    /// Move the row to `to` only if it is still in the `expected` state.
    ///
    /// Returns the updated row on success and `None` if another actor got
    /// there first (or the row never matched).
    pub fn transition_friendship(
        &self,
        id: Uuid,
        expected: FriendshipGuard,
        to: FriendshipStatus,
        new_requested_by: Option<Uuid>,
    ) -> Result<Option<Friendship>> {
        let conn = self.conn();
        let affected = conn.execute(
            "UPDATE friendships
             SET status = ?4,
                 requested_by = COALESCE(?5, requested_by),
                 updated_at = ?6
             WHERE id = ?1
               AND status = ?2
               AND (?3 IS NULL OR requested_by = ?3)",
            params![
                id.to_string(),
                expected.status.as_str(),
                expected.requested_by.map(|u| u.to_string()),
                to.as_str(),
                new_requested_by.map(|u| u.to_string()),
                fmt_ts(&now_millis()),
            ],
        )?;

        if affected == 0 {
            return Ok(None);
        }

        let updated = conn.query_row(
            "SELECT id, user_id, friend_id, requested_by, status, created_at, updated_at
             FROM friendships WHERE id = ?1",
            params![id.to_string()],
            row_to_friendship,
        )?;
        Ok(Some(updated))
    }

    /// Users who invited `user` and are still waiting for an answer.
    pub fn list_pending_invites_for(&self, user: Uuid) -> Result<Vec<User>> {
        self.list_counterparts(user, FriendshipStatus::Pending, true)
    }

    pub fn list_friends_of(&self, user: Uuid) -> Result<Vec<User>> {
        self.list_counterparts(user, FriendshipStatus::Friend, false)
    }

    fn list_counterparts(
        &self,
        user: Uuid,
        status: FriendshipStatus,
        incoming_only: bool,
    ) -> Result<Vec<User>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {USER_COLUMNS}
             FROM friendships f
             JOIN users u
               ON u.id = CASE WHEN f.user_id = ?1 THEN f.friend_id ELSE f.user_id END
             WHERE (f.user_id = ?1 OR f.friend_id = ?1)
               AND f.status = ?2
               AND (?3 = 0 OR f.requested_by <> ?1)
               AND u.deleted_at IS NULL
             ORDER BY f.updated_at DESC"
        ))?;

        let rows = stmt.query_map(
            params![user.to_string(), status.as_str(), incoming_only],
            |row| row_to_user(row, 0),
        )?;

        let mut users = Vec::new();
        for row in rows {
            users.push(row?);
        }
        Ok(users)
    }
}

fn row_to_friendship(row: &rusqlite::Row<'_>) -> rusqlite::Result<Friendship> {
    Ok(Friendship {
        id: uuid_at(row, 0)?,
        user_id: uuid_at(row, 1)?,
        friend_id: uuid_at(row, 2)?,
        requested_by: uuid_at(row, 3)?,
        status: enum_at(row, 4)?,
        created_at: ts_at(row, 5)?,
        updated_at: ts_at(row, 6)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> (Database, User, User) {
        let db = Database::open_in_memory().unwrap();
        let a = User::new_local("A", "a@x", "h".into());
        let b = User::new_local("B", "b@x", "h".into());
        db.insert_user(&a).unwrap();
        db.insert_user(&b).unwrap();
        (db, a, b)
    }

    #[test]
    fn pair_is_unordered_and_unique() {
        let (db, a, b) = setup();

        let created = db
            .insert_friendship(b.id, a.id, b.id, FriendshipStatus::Pending)
            .unwrap();
        assert!(created.user_id < created.friend_id);

        let err = db
            .insert_friendship(a.id, b.id, a.id, FriendshipStatus::Pending)
            .unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));

        let from_a = db.get_friendship(a.id, b.id).unwrap().unwrap();
        let from_b = db.get_friendship(b.id, a.id).unwrap().unwrap();
        assert_eq!(from_a, from_b);
        assert_eq!(from_a.requested_by, b.id);
    }

    #[test]
    fn transition_is_compare_and_set() {
        let (db, a, b) = setup();
        let row = db
            .insert_friendship(a.id, b.id, a.id, FriendshipStatus::Pending)
            .unwrap();
        let guard = FriendshipGuard {
            status: FriendshipStatus::Pending,
            requested_by: Some(a.id),
        };

        let first = db
            .transition_friendship(row.id, guard, FriendshipStatus::Friend, None)
            .unwrap();
        assert_eq!(first.unwrap().status, FriendshipStatus::Friend);

        let second = db
            .transition_friendship(row.id, guard, FriendshipStatus::Friend, None)
            .unwrap();
        assert!(second.is_none());
    }

    #[test]
    fn transition_checks_requester() {
        let (db, a, b) = setup();
        let row = db
            .insert_friendship(a.id, b.id, a.id, FriendshipStatus::Pending)
            .unwrap();
        let wrong = FriendshipGuard {
            status: FriendshipStatus::Pending,
            requested_by: Some(b.id),
        };
        assert!(db
            .transition_friendship(row.id, wrong, FriendshipStatus::NoFriend, None)
            .unwrap()
            .is_none());
    }

    #[test]
    fn pending_lists_only_incoming() {
        let (db, a, b) = setup();
        db.insert_friendship(a.id, b.id, a.id, FriendshipStatus::Pending)
            .unwrap();

        let for_b = db.list_pending_invites_for(b.id).unwrap();
        assert_eq!(for_b.len(), 1);
        assert_eq!(for_b[0].id, a.id);
        assert!(db.list_pending_invites_for(a.id).unwrap().is_empty());
        assert!(db.list_friends_of(a.id).unwrap().is_empty());
    }

    #[test]
    fn friends_listed_from_both_sides() {
        let (db, a, b) = setup();
        db.insert_friendship(a.id, b.id, a.id, FriendshipStatus::Friend)
            .unwrap();

        assert_eq!(db.list_friends_of(a.id).unwrap()[0].id, b.id);
        assert_eq!(db.list_friends_of(b.id).unwrap()[0].id, a.id);
    }
}
