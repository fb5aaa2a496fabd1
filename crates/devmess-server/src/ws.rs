//! Realtime endpoint: `GET /ws?token=<access>`.
//!
//! Each connection runs a reader task and a writer. The writer owns the
//! socket sink and drains the queue the hub hands out at registration; the
//! handler blocks on it, so the connection lives exactly as long as the
//! writer does. The reader unregisters from the hub when the peer goes
//! away, which closes the queue and in turn stops the writer.

use std::fmt::Display;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{
        ws::{close_code, CloseFrame, Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    response::Response,
};
use bytes::Bytes;
use chrono::Utc;
use futures::{Sink, SinkExt, Stream, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio::time::{interval_at, timeout, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

use devmess_shared::constants::{
    MAX_FRAME_SIZE, PING_PERIOD_SECS, PONG_WAIT_SECS, PRESENCE_THROTTLE_SECS, WRITE_WAIT_SECS,
};
use devmess_shared::protocol::{EventType, OnlineStatus, WsEvent};

use crate::api::AppState;
use crate::cache::Cache;
use crate::hub::{Hub, Registration};

#[derive(Debug, Deserialize)]
pub struct WsQuery {
    pub token: Option<String>,
}

pub async fn ws_upgrade(
    State(state): State<AppState>,
    Query(query): Query<WsQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    let ws = ws.max_message_size(MAX_FRAME_SIZE);

    let token = match query.token.filter(|t| !t.is_empty()) {
        Some(token) => token,
        None => return reject(ws, "Missing token"),
    };

    match state.sessions.verify_access(&token).await {
        Ok(user) => {
            info!(user_id = %user.id, "Realtime connection authenticated");
            let connection = Connection {
                user_id: user.id,
                hub: state.hub.clone(),
                cache: state.cache.clone(),
            };
            ws.on_upgrade(move |socket| connection.serve(socket))
        }
        Err(e) => {
            warn!(error = %e, "Realtime authentication failed");
            reject(ws, "Authentication failed")
        }
    }
}

/// Complete the upgrade, then close with a policy-violation frame.
fn reject(ws: WebSocketUpgrade, reason: &'static str) -> Response {
    ws.on_upgrade(move |mut socket| async move {
        let frame = CloseFrame {
            code: close_code::POLICY,
            reason: reason.into(),
        };
        let _ = socket.send(Message::Close(Some(frame))).await;
    })
}

struct Connection {
    user_id: Uuid,
    hub: Arc<Hub>,
    cache: Cache,
}

impl Connection {
    async fn serve(self, socket: WebSocket) {
        let Registration { conn_id, queue } = match self.hub.register(self.user_id).await {
            Ok(registration) => registration,
            Err(e) => {
                warn!(user_id = %self.user_id, error = %e, "Hub registration failed");
                return;
            }
        };

        let (sink, stream) = socket.split();
        let (control_tx, control_rx) = mpsc::channel::<Message>(8);

        let connection = Arc::new(self);
        let reader = {
            let connection = Arc::clone(&connection);
            tokio::spawn(async move {
                connection.read_loop(stream, control_tx).await;
                connection.hub.unregister(connection.user_id, conn_id);
            })
        };

        write_loop(sink, queue, control_rx).await;

        // The writer may stop first on a write error; the reader must not
        // outlive the connection.
        reader.abort();
        connection.hub.unregister(connection.user_id, conn_id);
        debug!(user_id = %connection.user_id, "Realtime connection closed");
    }

    async fn read_loop<S, E>(&self, mut stream: S, control: mpsc::Sender<Message>)
    where
        S: Stream<Item = Result<Message, E>> + Unpin,
        E: Display,
    {
        let deadline = Duration::from_secs(PONG_WAIT_SECS);
        loop {
            let message = match timeout(deadline, stream.next()).await {
                Err(_) => {
                    debug!(user_id = %self.user_id, "Read deadline passed");
                    break;
                }
                Ok(None) => break,
                Ok(Some(Err(e))) => {
                    warn!(user_id = %self.user_id, error = %e, "Unexpected close");
                    break;
                }
                Ok(Some(Ok(message))) => message,
            };

            let reply = match message {
                Message::Text(text) => self.dispatch(text.as_bytes()).await,
                Message::Binary(data) => self.dispatch(&data).await,
                // Any traffic, pongs included, resets the deadline above.
                Message::Ping(_) | Message::Pong(_) => None,
                Message::Close(_) => break,
            };

            if let Some(reply) = reply {
                if control.send(reply).await.is_err() {
                    break;
                }
            }
        }
    }

    /// Handle one inbound frame. Replies that must bypass the event queue
    /// (control pongs) are returned to the caller.
    async fn dispatch(&self, frame: &[u8]) -> Option<Message> {
        let mut event = match WsEvent::from_slice(frame) {
            Ok(event) => event,
            Err(e) => {
                debug!(user_id = %self.user_id, error = %e, "Malformed frame");
                self.reply_error("Invalid event");
                return None;
            }
        };

        self.hub.update_presence(
            self.user_id,
            Duration::from_secs(PRESENCE_THROTTLE_SECS),
        );

        match event.event_type {
            EventType::Ping => return Some(Message::Pong(Vec::new())),
            EventType::Chat => {
                let Some(to) = event.to else {
                    self.reply_error("Missing recipient");
                    return None;
                };
                // The sender is always the authenticated user; the payload
                // is forwarded untouched.
                event.from = Some(self.user_id);
                self.hub.push(to, &event);
            }
            EventType::NotifyFriend => {
                let Some(to) = event.to else {
                    self.reply_error("Missing recipient");
                    return None;
                };
                let Some(payload) = event.payload_str() else {
                    self.reply_error("Missing payload");
                    return None;
                };
                // Only the payload itself reaches the friend, not the envelope.
                let frame = Bytes::copy_from_slice(payload.as_bytes());
                if let Err(e) = self.hub.send_to_user(to, frame) {
                    debug!(user_id = %to, error = %e, "Notification not delivered");
                }
            }
            EventType::IsOnline => {
                let Some(target) = event.to else {
                    self.reply_error("Missing recipient");
                    return None;
                };
                self.answer_presence(target).await;
            }
            _ => self.reply_error("Unknown event type"),
        }
        None
    }

    async fn answer_presence(&self, target: Uuid) {
        let status = match self.cache.presence(target).await {
            Ok(presence) => OnlineStatus {
                user_id: target,
                is_online: presence.is_online,
                time_online: presence.seconds_since_seen(Utc::now().timestamp()),
            },
            Err(e) => {
                warn!(user_id = %target, error = %e, "Presence lookup failed");
                OnlineStatus {
                    user_id: target,
                    is_online: false,
                    time_online: 0,
                }
            }
        };

        match WsEvent::with_payload(EventType::IsOnlineResponse, &status) {
            Ok(reply) => {
                self.hub
                    .push(self.user_id, &reply.from_user(target).to_user(self.user_id));
            }
            Err(e) => warn!(error = %e, "Failed to encode presence reply"),
        }
    }

    fn reply_error(&self, message: &str) {
        self.hub
            .push(self.user_id, &WsEvent::error(message).to_user(self.user_id));
    }
}

/// Drain the outbound queue into `sink` until the queue closes or a write
/// fails. Frames already waiting behind the first one are sent with it,
/// newline separated. A control ping goes out every ping period.
async fn write_loop<S>(
    mut sink: S,
    mut queue: mpsc::Receiver<Bytes>,
    mut control: mpsc::Receiver<Message>,
) where
    S: Sink<Message> + Unpin,
    S::Error: Display,
{
    let period = Duration::from_secs(PING_PERIOD_SECS);
    let mut ping = interval_at(Instant::now() + period, period);

    loop {
        let message = tokio::select! {
            frame = queue.recv() => match frame {
                Some(frame) => Message::Text(coalesce(frame, &mut queue)),
                None => {
                    // The hub closed the queue.
                    let _ = send_with_deadline(&mut sink, Message::Close(None)).await;
                    return;
                }
            },
            Some(reply) = control.recv() => reply,
            _ = ping.tick() => Message::Ping(Vec::new()),
        };

        if let Err(e) = send_with_deadline(&mut sink, message).await {
            debug!(error = %e, "Write failed, closing connection");
            return;
        }
    }
}

fn coalesce(first: Bytes, queue: &mut mpsc::Receiver<Bytes>) -> String {
    let mut buf = first.to_vec();
    while let Ok(next) = queue.try_recv() {
        buf.push(b'\n');
        buf.extend_from_slice(&next);
    }
    String::from_utf8_lossy(&buf).into_owned()
}

async fn send_with_deadline<S>(sink: &mut S, message: Message) -> Result<(), String>
where
    S: Sink<Message> + Unpin,
    S::Error: Display,
{
    match timeout(Duration::from_secs(WRITE_WAIT_SECS), sink.send(message)).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(e.to_string()),
        Err(_) => Err("write deadline passed".to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::Cache;
    use futures::channel::mpsc as fmpsc;

    fn connection(hub: &Arc<Hub>, cache: &Cache) -> Connection {
        Connection {
            user_id: Uuid::new_v4(),
            hub: hub.clone(),
            cache: cache.clone(),
        }
    }

    async fn next_event(registration: &mut Registration) -> WsEvent {
        let frame = registration.queue.recv().await.unwrap();
        WsEvent::from_slice(&frame).unwrap()
    }

    #[tokio::test]
    async fn test_ping_gets_control_pong() {
        let cache = Cache::in_memory();
        let hub = Hub::spawn(cache.clone());
        let conn = connection(&hub, &cache);

        let reply = conn.dispatch(br#"{"type":"ping"}"#).await;
        assert!(matches!(reply, Some(Message::Pong(_))));
    }

    #[tokio::test]
    async fn test_chat_is_forwarded_with_sender_stamped() {
        let cache = Cache::in_memory();
        let hub = Hub::spawn(cache.clone());
        let conn = connection(&hub, &cache);
        let target = Uuid::new_v4();
        let mut inbox = hub.register(target).await.unwrap();

        let spoofed = Uuid::new_v4();
        let frame = format!(
            r#"{{"type":"chat","from":"{spoofed}","to":"{target}","payload":{{"text":"hi",  "x":1}}}}"#
        );
        assert!(conn.dispatch(frame.as_bytes()).await.is_none());

        let event = next_event(&mut inbox).await;
        assert_eq!(event.event_type, EventType::Chat);
        assert_eq!(event.from, Some(conn.user_id));
        assert_eq!(event.payload_str(), Some(r#"{"text":"hi",  "x":1}"#));
    }

    #[tokio::test]
    async fn test_notify_friend_forwards_bare_payload() {
        let cache = Cache::in_memory();
        let hub = Hub::spawn(cache.clone());
        let conn = connection(&hub, &cache);
        let mut own = hub.register(conn.user_id).await.unwrap();
        let friend = Uuid::new_v4();
        let mut inbox = hub.register(friend).await.unwrap();

        let frame = format!(r#"{{"type":"notify_friend","to":"{friend}","payload":{{"kind":"x"}}}}"#);
        assert!(conn.dispatch(frame.as_bytes()).await.is_none());
        assert_eq!(inbox.queue.recv().await.unwrap(), r#"{"kind":"x"}"#);

        let frame = format!(r#"{{"type":"notify_friend","to":"{friend}"}}"#);
        conn.dispatch(frame.as_bytes()).await;
        let event = next_event(&mut own).await;
        assert_eq!(event.event_type, EventType::Error);
        assert_eq!(event.payload_str(), Some(r#""Missing payload""#));
        assert!(inbox.queue.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_unknown_and_malformed_frames_get_error_events() {
        let cache = Cache::in_memory();
        let hub = Hub::spawn(cache.clone());
        let conn = connection(&hub, &cache);
        let mut own = hub.register(conn.user_id).await.unwrap();

        conn.dispatch(br#"{"type":"dance"}"#).await;
        let event = next_event(&mut own).await;
        assert_eq!(event.event_type, EventType::Error);
        assert_eq!(event.payload_str(), Some(r#""Unknown event type""#));

        conn.dispatch(b"not json").await;
        assert_eq!(next_event(&mut own).await.event_type, EventType::Error);

        conn.dispatch(br#"{"type":"chat"}"#).await;
        assert_eq!(next_event(&mut own).await.event_type, EventType::Error);
    }

    #[tokio::test]
    async fn test_is_online_reports_presence() {
        let cache = Cache::in_memory();
        let hub = Hub::spawn(cache.clone());
        let conn = connection(&hub, &cache);
        let mut own = hub.register(conn.user_id).await.unwrap();

        let online = Uuid::new_v4();
        cache.mark_online(online, Utc::now().timestamp()).await.unwrap();

        conn.dispatch(format!(r#"{{"type":"is_online","to":"{online}"}}"#).as_bytes())
            .await;
        let event = next_event(&mut own).await;
        assert_eq!(event.event_type, EventType::IsOnlineResponse);
        assert_eq!(event.from, Some(online));
        let status: OnlineStatus = serde_json::from_str(event.payload_str().unwrap()).unwrap();
        assert!(status.is_online);

        let offline = Uuid::new_v4();
        conn.dispatch(format!(r#"{{"type":"is_online","to":"{offline}"}}"#).as_bytes())
            .await;
        let status: OnlineStatus =
            serde_json::from_str(next_event(&mut own).await.payload_str().unwrap()).unwrap();
        assert!(!status.is_online);
        assert_eq!(status.time_online, 0);
    }

    #[tokio::test]
    async fn test_write_loop_coalesces_and_closes() {
        let (queue_tx, queue_rx) = mpsc::channel(8);
        let (_control_tx, control_rx) = mpsc::channel(1);
        let (sink, mut written) = fmpsc::unbounded::<Message>();

        queue_tx.send(Bytes::from_static(b"{\"a\":1}")).await.unwrap();
        queue_tx.send(Bytes::from_static(b"{\"b\":2}")).await.unwrap();
        drop(queue_tx);

        write_loop(sink, queue_rx, control_rx).await;

        match written.next().await {
            Some(Message::Text(text)) => assert_eq!(text, "{\"a\":1}\n{\"b\":2}"),
            other => panic!("unexpected {other:?}"),
        }
        assert!(matches!(written.next().await, Some(Message::Close(None))));
    }

    #[tokio::test]
    async fn test_read_loop_replies_and_stops_on_close() {
        let cache = Cache::in_memory();
        let hub = Hub::spawn(cache.clone());
        let conn = connection(&hub, &cache);

        let inbound = futures::stream::iter(vec![
            Ok::<_, axum::Error>(Message::Text(r#"{"type":"ping"}"#.to_string())),
            Ok(Message::Close(None)),
            Ok(Message::Text(r#"{"type":"ping"}"#.to_string())),
        ]);
        let (control_tx, mut control_rx) = mpsc::channel(8);

        conn.read_loop(inbound, control_tx).await;

        assert!(matches!(control_rx.recv().await, Some(Message::Pong(_))));
        // The frame after the close is never read.
        assert!(control_rx.recv().await.is_none());
    }
}
