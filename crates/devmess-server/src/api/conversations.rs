use axum::{
    extract::{Query, State},
    http::StatusCode,
    Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use devmess_store::{Conversation, ConversationSummary, Message};

use super::{parse_id, AppState, CurrentUser};
use crate::error::ServerError;

/// Cursor pagination: `before` is epoch milliseconds, exclusive.
#[derive(Debug, Default, Deserialize)]
pub struct PageQuery {
    pub limit: Option<u32>,
    pub before: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct MessagesQuery {
    pub conversation_id: String,
    pub limit: Option<u32>,
    pub before: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct FindConversationRequest {
    pub user_id: String,
}

#[derive(Debug, Deserialize)]
pub struct ConversationRef {
    pub conversation_id: String,
}

#[derive(Debug, Deserialize)]
pub struct SendMessageRequest {
    pub conversation_id: String,
    pub content: String,
}

#[derive(Serialize)]
pub struct MarkReadResponse {
    last_read_at: DateTime<Utc>,
}

fn cursor(before: Option<i64>) -> Result<Option<DateTime<Utc>>, ServerError> {
    before
        .map(|millis| {
            DateTime::from_timestamp_millis(millis)
                .ok_or_else(|| ServerError::BadInput("before is out of range".into()))
        })
        .transpose()
}

/// The caller's conversations, most recently active first.
pub async fn list(
    State(state): State<AppState>,
    caller: CurrentUser,
    Query(page): Query<PageQuery>,
) -> Result<Json<Vec<ConversationSummary>>, ServerError> {
    let conversations = state
        .conversations
        .list_for_user(caller.user.id, cursor(page.before)?, page.limit)
        .await?;
    Ok(Json(conversations))
}

/// One page of a conversation's history, newest first.
pub async fn messages(
    State(state): State<AppState>,
    caller: CurrentUser,
    Query(query): Query<MessagesQuery>,
) -> Result<Json<Vec<Message>>, ServerError> {
    let conversation_id = parse_id(&query.conversation_id, "conversation_id")?;
    let messages = state
        .conversations
        .list_messages(
            caller.user.id,
            conversation_id,
            cursor(query.before)?,
            query.limit,
        )
        .await?;
    Ok(Json(messages))
}

pub async fn find_by_user(
    State(state): State<AppState>,
    caller: CurrentUser,
    Json(req): Json<FindConversationRequest>,
) -> Result<Json<Conversation>, ServerError> {
    let other = parse_id(&req.user_id, "user_id")?;
    Ok(Json(
        state
            .conversations
            .find_by_other_user(caller.user.id, other)
            .await?,
    ))
}

pub async fn mark_read(
    State(state): State<AppState>,
    caller: CurrentUser,
    Json(req): Json<ConversationRef>,
) -> Result<Json<MarkReadResponse>, ServerError> {
    let conversation_id = parse_id(&req.conversation_id, "conversation_id")?;
    let last_read_at = state
        .conversations
        .mark_read(caller.user.id, conversation_id)
        .await?;
    Ok(Json(MarkReadResponse { last_read_at }))
}

pub async fn send_message(
    State(state): State<AppState>,
    caller: CurrentUser,
    Json(req): Json<SendMessageRequest>,
) -> Result<(StatusCode, Json<Message>), ServerError> {
    let conversation_id = parse_id(&req.conversation_id, "conversation_id")?;
    let message = state
        .conversations
        .send_message(caller.user.id, conversation_id, &req.content)
        .await?;
    Ok((StatusCode::CREATED, Json(message)))
}

#[cfg(test)]
mod tests {
    use axum::http::StatusCode;
    use serde_json::json;

    use super::cursor;
    use crate::api::tests::TestApp;

    async fn befriend(app: &TestApp) -> (String, String, String, String) {
        let (u1, t1) = app.register("One", "one@x").await;
        let (u2, t2) = app.register("Two", "two@x").await;
        app.post_json("/api/v1/friendships/send-invite", Some(&t1), json!({"friend_id": u2}))
            .await;
        let (_, body) = app
            .post_json("/api/v1/friendships/accept-invite", Some(&t2), json!({"friend_id": u1}))
            .await;
        (
            t1,
            t2,
            u1,
            body["conversation"]["id"].as_str().unwrap().to_string(),
        )
    }

    #[tokio::test]
    async fn test_paging_with_before_cursor() {
        let app = TestApp::new().await;
        let (t1, t2, _, cid) = befriend(&app).await;

        for i in 0..3 {
            let (status, _) = app
                .post_json(
                    "/api/v1/messages/send",
                    Some(&t1),
                    json!({"conversation_id": cid, "content": format!("m{i}")}),
                )
                .await;
            assert_eq!(status, StatusCode::CREATED);
        }

        let (_, first) = app
            .get_json(&format!("/api/v1/messages?conversation_id={cid}&limit=2"), Some(&t2))
            .await;
        let first = first.as_array().unwrap();
        assert_eq!(first.len(), 2);
        assert_eq!(first[0]["content"], "m2");
        assert_eq!(first[1]["content"], "m1");

        let oldest: chrono::DateTime<chrono::Utc> =
            first[1]["created_at"].as_str().unwrap().parse().unwrap();
        let (_, rest) = app
            .get_json(
                &format!(
                    "/api/v1/messages?conversation_id={cid}&before={}",
                    oldest.timestamp_millis()
                ),
                Some(&t2),
            )
            .await;
        let rest = rest.as_array().unwrap();
        assert_eq!(rest.len(), 2);
        assert_eq!(rest[0]["content"], "m0");
        assert_eq!(rest[1]["type"], "system");
    }

    #[tokio::test]
    async fn test_send_validation_and_mark_read() {
        let app = TestApp::new().await;
        let (t1, t2, u1, cid) = befriend(&app).await;

        let (status, _) = app
            .post_json(
                "/api/v1/messages/send",
                Some(&t1),
                json!({"conversation_id": cid, "content": "   "}),
            )
            .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, body) = app
            .post_json("/api/v1/conversations/mark-read", Some(&t2), json!({"conversation_id": cid}))
            .await;
        assert_eq!(status, StatusCode::OK, "{body}");
        assert!(body["last_read_at"].is_string());

        let (_, t3) = app.register("Three", "three@x").await;
        let (status, _) = app
            .post_json("/api/v1/conversations/mark-read", Some(&t3), json!({"conversation_id": cid}))
            .await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        let (status, _) = app
            .post_json(
                "/api/v1/messages/send",
                Some(&t3),
                json!({"conversation_id": cid, "content": "hi"}),
            )
            .await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        let (status, _) = app
            .post_json("/api/v1/conversations/find-conversation", Some(&t3), json!({"user_id": u1}))
            .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[test]
    fn test_cursor_bounds() {
        assert!(cursor(None).unwrap().is_none());
        assert_eq!(cursor(Some(0)).unwrap().unwrap().timestamp_millis(), 0);
        assert!(cursor(Some(i64::MAX)).is_err());
    }
}
