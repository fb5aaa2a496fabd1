//! Friendship state machine.
//!
//! Every transition is a compare-and-set on the pair's row, so when two
//! actors race on the same pair exactly one of them moves it and the other
//! sees a [`ServerError::Conflict`].

use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use devmess_shared::protocol::{EventType, WsEvent};
use devmess_shared::types::FriendshipStatus;
use devmess_store::friendships::FriendshipGuard;
use devmess_store::{Conversation, Friendship, StoreError, User};

use crate::conversation::ConversationService;
use crate::db::{with_db, Db};
use crate::error::ServerError;
use crate::hub::Hub;

#[derive(Serialize)]
struct InvitePayload<'a> {
    user: &'a User,
}

#[derive(Clone)]
pub struct FriendshipService {
    db: Db,
    hub: Arc<Hub>,
    conversations: ConversationService,
}

impl FriendshipService {
    pub fn new(db: Db, hub: Arc<Hub>, conversations: ConversationService) -> Self {
        Self {
            db,
            hub,
            conversations,
        }
    }

    /// Invite `target` on behalf of `caller` and notify the target.
    pub async fn send_invite(&self, caller: &User, target: Uuid) -> Result<Friendship, ServerError> {
        let requester = caller.id;
        if requester == target {
            return Err(ServerError::BadInput("Cannot invite yourself".into()));
        }

        let outcome = with_db(&self.db, move |db| {
            // Unknown targets surface as NotFound.
            db.get_user(target)?;
            match db.get_friendship(requester, target)? {
                None => db
                    .insert_friendship(requester, target, requester, FriendshipStatus::Pending)
                    .map(Ok),
                Some(row) if row.status == FriendshipStatus::NoFriend => db
                    .transition_friendship(
                        row.id,
                        FriendshipGuard {
                            status: FriendshipStatus::NoFriend,
                            requested_by: None,
                        },
                        FriendshipStatus::Pending,
                        Some(requester),
                    )?
                    .map(Ok)
                    .ok_or_else(|| StoreError::Conflict("friendship changed".into())),
                Some(row) => Ok(Err(row.status)),
            }
        })
        .await
        .map_err(|e| match e {
            ServerError::NotFound(_) => ServerError::NotFound("User".into()),
            other => other,
        })?;

        let friendship = outcome.map_err(|status| {
            ServerError::AlreadyExists(format!("Friendship is already {}", status.as_str()))
        })?;

        info!(from = %requester, to = %target, "Friend invite sent");
        match WsEvent::with_payload(EventType::FriendInvite, &InvitePayload { user: caller }) {
            Ok(event) => {
                self.hub.push(target, &event.from_user(requester).to_user(target));
            }
            Err(e) => warn!(error = %e, "Failed to encode invite event"),
        }
        Ok(friendship)
    }

    /// Withdraw an invite the caller sent.
    pub async fn cancel_invite(&self, caller: Uuid, target: Uuid) -> Result<Friendship, ServerError> {
        self.transition(
            caller,
            target,
            FriendshipGuard {
                status: FriendshipStatus::Pending,
                requested_by: Some(caller),
            },
            FriendshipStatus::NoFriend,
        )
        .await
    }

    /// Accept an invite from `requester`, open the pair's direct
    /// conversation and tell both sides.
    pub async fn accept_invite(
        &self,
        caller: Uuid,
        requester: Uuid,
    ) -> Result<(Friendship, Conversation), ServerError> {
        let friendship = self
            .transition(
                caller,
                requester,
                FriendshipGuard {
                    status: FriendshipStatus::Pending,
                    requested_by: Some(requester),
                },
                FriendshipStatus::Friend,
            )
            .await?;

        let (conversation, created) = self.conversations.open_direct(requester, caller).await?;
        info!(
            user_id = %caller,
            friend_id = %requester,
            conversation_id = %conversation.id,
            created,
            "Friend invite accepted"
        );

        let both = [requester, caller];
        self.notify(&both, EventType::UpdateFriend, &friendship);
        self.notify(&both, EventType::DirectConversation, &conversation);

        Ok((friendship, conversation))
    }

    /// Decline an invite from `requester`.
    pub async fn reject_invite(&self, caller: Uuid, requester: Uuid) -> Result<Friendship, ServerError> {
        self.transition(
            caller,
            requester,
            FriendshipGuard {
                status: FriendshipStatus::Pending,
                requested_by: Some(requester),
            },
            FriendshipStatus::NoFriend,
        )
        .await
    }

    /// End a friendship. Either side may do it.
    pub async fn remove_friend(&self, caller: Uuid, other: Uuid) -> Result<Friendship, ServerError> {
        self.transition(
            caller,
            other,
            FriendshipGuard {
                status: FriendshipStatus::Friend,
                requested_by: None,
            },
            FriendshipStatus::NoFriend,
        )
        .await
    }

    /// Users waiting for the caller to answer their invite.
    pub async fn list_pending(&self, caller: Uuid) -> Result<Vec<User>, ServerError> {
        with_db(&self.db, move |db| db.list_pending_invites_for(caller)).await
    }

    pub async fn list_friends(&self, caller: Uuid) -> Result<Vec<User>, ServerError> {
        with_db(&self.db, move |db| db.list_friends_of(caller)).await
    }

    async fn transition(
        &self,
        caller: Uuid,
        other: Uuid,
        expected: FriendshipGuard,
        to: FriendshipStatus,
    ) -> Result<Friendship, ServerError> {
        if caller == other {
            return Err(ServerError::BadInput("Invalid friend id".into()));
        }

        let row = with_db(&self.db, move |db| db.get_friendship(caller, other))
            .await?
            .filter(|row| {
                row.status == expected.status
                    && expected.requested_by.map_or(true, |id| row.requested_by == id)
            })
            .ok_or_else(|| ServerError::NotFound(not_found_label(expected.status).into()))?;

        let updated = with_db(&self.db, move |db| {
            db.transition_friendship(row.id, expected, to, None)
        })
        .await?
        .ok_or_else(|| ServerError::Conflict("Friendship changed concurrently".into()))?;

        debug!(
            friendship_id = %updated.id,
            from = expected.status.as_str(),
            to = to.as_str(),
            "Friendship transition"
        );
        Ok(updated)
    }

    fn notify<T: Serialize>(&self, users: &[Uuid], event_type: EventType, payload: &T) {
        let event = match WsEvent::with_payload(event_type, payload) {
            Ok(event) => event,
            Err(e) => {
                warn!(error = %e, "Failed to encode friendship event");
                return;
            }
        };
        for user in users {
            self.hub.push(*user, &event.clone().to_user(*user));
        }
    }
}

fn not_found_label(status: FriendshipStatus) -> &'static str {
    match status {
        FriendshipStatus::Pending => "Pending invite",
        _ => "Friendship",
    }
}
