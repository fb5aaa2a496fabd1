use axum::{extract::State, Json};
use serde::{Deserialize, Serialize};

use devmess_store::{Conversation, Friendship, User};

use super::{parse_id, AppState, CurrentUser};
use crate::error::ServerError;

/// `{"friend_id": ...}`. A `user_id`, when sent, must name the caller.
#[derive(Debug, Deserialize)]
pub struct FriendRequest {
    pub user_id: Option<String>,
    pub friend_id: String,
}

impl FriendRequest {
    fn other_party(&self, caller: &User) -> Result<uuid::Uuid, ServerError> {
        if let Some(user_id) = self.user_id.as_deref().filter(|id| !id.is_empty()) {
            if parse_id(user_id, "user_id")? != caller.id {
                return Err(ServerError::Forbidden(
                    "user_id does not match the signed-in user".into(),
                ));
            }
        }
        parse_id(&self.friend_id, "friend_id")
    }
}

#[derive(Serialize)]
pub struct FriendshipResponse {
    message: &'static str,
    friendship: Friendship,
    #[serde(skip_serializing_if = "Option::is_none")]
    conversation: Option<Conversation>,
}

impl FriendshipResponse {
    fn new(message: &'static str, friendship: Friendship) -> Json<Self> {
        Json(Self {
            message,
            friendship,
            conversation: None,
        })
    }
}

pub async fn send_invite(
    State(state): State<AppState>,
    caller: CurrentUser,
    Json(req): Json<FriendRequest>,
) -> Result<Json<FriendshipResponse>, ServerError> {
    let target = req.other_party(&caller.user)?;
    let friendship = state.friendships.send_invite(&caller.user, target).await?;
    Ok(FriendshipResponse::new("Invite sent", friendship))
}

pub async fn cancel_invite(
    State(state): State<AppState>,
    caller: CurrentUser,
    Json(req): Json<FriendRequest>,
) -> Result<Json<FriendshipResponse>, ServerError> {
    let target = req.other_party(&caller.user)?;
    let friendship = state.friendships.cancel_invite(caller.user.id, target).await?;
    Ok(FriendshipResponse::new("Invite cancelled", friendship))
}

pub async fn accept_invite(
    State(state): State<AppState>,
    caller: CurrentUser,
    Json(req): Json<FriendRequest>,
) -> Result<Json<FriendshipResponse>, ServerError> {
    let requester = req.other_party(&caller.user)?;
    let (friendship, conversation) = state
        .friendships
        .accept_invite(caller.user.id, requester)
        .await?;
    Ok(Json(FriendshipResponse {
        message: "Invite accepted",
        friendship,
        conversation: Some(conversation),
    }))
}

pub async fn reject_invite(
    State(state): State<AppState>,
    caller: CurrentUser,
    Json(req): Json<FriendRequest>,
) -> Result<Json<FriendshipResponse>, ServerError> {
    let requester = req.other_party(&caller.user)?;
    let friendship = state.friendships.reject_invite(caller.user.id, requester).await?;
    Ok(FriendshipResponse::new("Invite rejected", friendship))
}

pub async fn remove_friend(
    State(state): State<AppState>,
    caller: CurrentUser,
    Json(req): Json<FriendRequest>,
) -> Result<Json<FriendshipResponse>, ServerError> {
    let other = req.other_party(&caller.user)?;
    let friendship = state.friendships.remove_friend(caller.user.id, other).await?;
    Ok(FriendshipResponse::new("Friend removed", friendship))
}

/// Users with a pending invite addressed to the caller.
pub async fn list_invites(
    State(state): State<AppState>,
    caller: CurrentUser,
) -> Result<Json<Vec<User>>, ServerError> {
    Ok(Json(state.friendships.list_pending(caller.user.id).await?))
}

pub async fn list_friends(
    State(state): State<AppState>,
    caller: CurrentUser,
) -> Result<Json<Vec<User>>, ServerError> {
    Ok(Json(state.friendships.list_friends(caller.user.id).await?))
}
