//! In-process delivery hub.
//!
//! Keeps one outbound queue per connected user and routes serialized frames
//! to it. Registration changes go through a single coordinator task;
//! sends only take a read lock long enough to clone the queue handle, so a
//! slow recipient never blocks a producer.

use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Duration, Instant};

use bytes::Bytes;
use chrono::Utc;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};
use uuid::Uuid;

use devmess_shared::constants::{HUB_HOUSEKEEPING_SECS, SEND_QUEUE_CAPACITY};
use devmess_shared::protocol::WsEvent;

use crate::cache::Cache;
use crate::error::ServerError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DeliveryError {
    #[error("user not connected")]
    NotConnected,
    #[error("user send queue full")]
    Backpressure,
}

impl From<DeliveryError> for ServerError {
    fn from(err: DeliveryError) -> Self {
        match err {
            DeliveryError::NotConnected => ServerError::NotConnected,
            DeliveryError::Backpressure => ServerError::Backpressure,
        }
    }
}

struct ClientHandle {
    conn_id: Uuid,
    sender: mpsc::Sender<Bytes>,
}

/// The receiving half handed to a connection after registration.
pub struct Registration {
    pub conn_id: Uuid,
    pub queue: mpsc::Receiver<Bytes>,
}

enum HubCommand {
    Register {
        user_id: Uuid,
        conn_id: Uuid,
        sender: mpsc::Sender<Bytes>,
        ack: oneshot::Sender<()>,
    },
    Unregister {
        user_id: Uuid,
        conn_id: Uuid,
    },
    Broadcast(Bytes),
}

pub struct Hub {
    clients: RwLock<HashMap<Uuid, ClientHandle>>,
    last_update: RwLock<HashMap<Uuid, Instant>>,
    commands: mpsc::UnboundedSender<HubCommand>,
    cache: Cache,
}

/// The coordinator half of a [`Hub`]; drive it with [`HubLoop::run`].
pub struct HubLoop {
    hub: Arc<Hub>,
    commands: mpsc::UnboundedReceiver<HubCommand>,
    housekeeping: Duration,
}

impl Hub {
    pub fn new(cache: Cache) -> (Arc<Self>, HubLoop) {
        let (tx, rx) = mpsc::unbounded_channel();
        let hub = Arc::new(Self {
            clients: RwLock::new(HashMap::new()),
            last_update: RwLock::new(HashMap::new()),
            commands: tx,
            cache,
        });
        let runner = HubLoop {
            hub: Arc::clone(&hub),
            commands: rx,
            housekeeping: Duration::from_secs(HUB_HOUSEKEEPING_SECS),
        };
        (hub, runner)
    }

    /// Build a hub and spawn its coordinator on the current runtime.
    pub fn spawn(cache: Cache) -> Arc<Self> {
        let (hub, runner) = Self::new(cache);
        tokio::spawn(runner.run());
        hub
    }

    fn clients(&self) -> RwLockReadGuard<'_, HashMap<Uuid, ClientHandle>> {
        self.clients.read().unwrap_or_else(|e| e.into_inner())
    }

    fn clients_mut(&self) -> RwLockWriteGuard<'_, HashMap<Uuid, ClientHandle>> {
        self.clients.write().unwrap_or_else(|e| e.into_inner())
    }

    fn last_update_mut(&self) -> RwLockWriteGuard<'_, HashMap<Uuid, Instant>> {
        self.last_update.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Install a new outbound queue for `user_id`, replacing (and thereby
    /// closing) any previous one. Resolves once the coordinator has applied
    /// the registration.
    pub async fn register(&self, user_id: Uuid) -> Result<Registration, ServerError> {
        let (sender, queue) = mpsc::channel(SEND_QUEUE_CAPACITY);
        let (ack, acked) = oneshot::channel();
        let conn_id = Uuid::new_v4();

        self.commands
            .send(HubCommand::Register {
                user_id,
                conn_id,
                sender,
                ack,
            })
            .map_err(|_| ServerError::internal("delivery hub stopped"))?;
        acked
            .await
            .map_err(|_| ServerError::internal("delivery hub stopped"))?;

        Ok(Registration { conn_id, queue })
    }

    /// Remove the registration identified by `conn_id`. A newer connection
    /// of the same user is left untouched.
    pub fn unregister(&self, user_id: Uuid, conn_id: Uuid) {
        if self
            .commands
            .send(HubCommand::Unregister { user_id, conn_id })
            .is_err()
        {
            warn!(user_id = %user_id, "Delivery hub stopped before unregister");
        }
    }

    /// Queue a frame for every connected client. Full queues are skipped.
    pub fn broadcast(&self, frame: Bytes) {
        let _ = self.commands.send(HubCommand::Broadcast(frame));
    }

    pub fn is_connected(&self, user_id: Uuid) -> bool {
        self.clients().contains_key(&user_id)
    }

    /// Number of users with a registered connection.
    pub fn connected_count(&self) -> usize {
        self.clients().len()
    }

    /// Enqueue `frame` for `user_id` without waiting.
    pub fn send_to_user(&self, user_id: Uuid, frame: Bytes) -> Result<(), DeliveryError> {
        let sender = self
            .clients()
            .get(&user_id)
            .map(|client| client.sender.clone())
            .ok_or(DeliveryError::NotConnected)?;

        sender.try_send(frame).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => DeliveryError::Backpressure,
            mpsc::error::TrySendError::Closed(_) => DeliveryError::NotConnected,
        })
    }

    /// Best-effort fan-out. Returns the users the frame could not be queued
    /// for.
    pub fn send_to_users(&self, user_ids: &[Uuid], frame: Bytes) -> Vec<Uuid> {
        let mut failed = Vec::new();
        for &user_id in user_ids {
            if let Err(e) = self.send_to_user(user_id, frame.clone()) {
                debug!(user_id = %user_id, error = %e, "Fan-out skipped recipient");
                failed.push(user_id);
            }
        }
        failed
    }

    /// Serialize `event` and queue it for `user_id`. A recipient that is
    /// offline or saturated is logged and skipped; returns whether the frame
    /// was queued.
    pub fn push(&self, user_id: Uuid, event: &WsEvent) -> bool {
        let frame = match event.to_bytes() {
            Ok(frame) => Bytes::from(frame),
            Err(e) => {
                warn!(event = event.event_type.as_str(), error = %e, "Failed to encode event");
                return false;
            }
        };
        match self.send_to_user(user_id, frame) {
            Ok(()) => true,
            Err(e) => {
                debug!(
                    user_id = %user_id,
                    event = event.event_type.as_str(),
                    error = %e,
                    "Event not delivered"
                );
                false
            }
        }
    }

    /// Record activity for `user_id` and refresh its presence in the cache,
    /// at most once per `threshold`. Returns whether a cache write was
    /// scheduled.
    pub fn update_presence(&self, user_id: Uuid, threshold: Duration) -> bool {
        let now = Instant::now();
        {
            let mut last_update = self.last_update_mut();
            if let Some(previous) = last_update.get(&user_id) {
                if now.duration_since(*previous) < threshold {
                    return false;
                }
            }
            last_update.insert(user_id, now);
        }

        self.schedule_mark_online(user_id);
        true
    }

    fn schedule_mark_online(&self, user_id: Uuid) {
        let cache = self.cache.clone();
        tokio::spawn(async move {
            match cache.mark_online(user_id, Utc::now().timestamp()).await {
                Ok(()) => debug!(user_id = %user_id, "Presence refreshed"),
                Err(e) => warn!(user_id = %user_id, error = %e, "Failed to refresh presence"),
            }
        });
    }

    /// Forget throttle entries of users that are no longer connected.
    pub fn housekeeping(&self) -> usize {
        let clients = self.clients();
        let mut last_update = self.last_update_mut();
        let before = last_update.len();
        last_update.retain(|user_id, _| clients.contains_key(user_id));
        before - last_update.len()
    }

    fn apply(&self, command: HubCommand) {
        match command {
            HubCommand::Register {
                user_id,
                conn_id,
                sender,
                ack,
            } => {
                let replaced = self
                    .clients_mut()
                    .insert(user_id, ClientHandle { conn_id, sender })
                    .is_some();
                info!(user_id = %user_id, replaced, "Client registered");
                // Counts as a presence update so the first ping is throttled.
                self.last_update_mut().insert(user_id, Instant::now());
                self.schedule_mark_online(user_id);
                let _ = ack.send(());
            }
            HubCommand::Unregister { user_id, conn_id } => {
                let mut clients = self.clients_mut();
                if clients.get(&user_id).map(|c| c.conn_id) == Some(conn_id) {
                    // Dropping the handle closes the queue.
                    clients.remove(&user_id);
                    info!(user_id = %user_id, "Client unregistered");
                }
            }
            HubCommand::Broadcast(frame) => {
                let senders: Vec<mpsc::Sender<Bytes>> =
                    self.clients().values().map(|c| c.sender.clone()).collect();
                for sender in senders {
                    let _ = sender.try_send(frame.clone());
                }
            }
        }
    }
}

impl HubLoop {
    /// Apply registration commands and run housekeeping. Never returns
    /// while the process is serving; the task is dropped at shutdown.
    pub async fn run(mut self) {
        let mut ticker = tokio::time::interval(self.housekeeping);
        ticker.tick().await;

        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(command) => self.hub.apply(command),
                    None => break,
                },
                _ = ticker.tick() => {
                    let removed = self.hub.housekeeping();
                    debug!(removed, "Hub housekeeping");
                }
            }
        }

        info!("Delivery hub stopped");
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;

    use super::*;
    use crate::cache::tests::CountingStore;

    fn hub() -> Arc<Hub> {
        Hub::spawn(Cache::in_memory())
    }

    #[tokio::test]
    async fn test_send_to_connected_user() {
        let hub = hub();
        let user = Uuid::new_v4();
        let mut registration = hub.register(user).await.unwrap();

        hub.send_to_user(user, Bytes::from_static(b"hello")).unwrap();
        assert_eq!(registration.queue.recv().await.unwrap(), "hello");
    }

    #[tokio::test]
    async fn test_send_to_absent_user() {
        let hub = hub();
        assert_eq!(
            hub.send_to_user(Uuid::new_v4(), Bytes::from_static(b"x")),
            Err(DeliveryError::NotConnected)
        );
    }

    #[tokio::test]
    async fn test_full_queue_reports_backpressure_without_blocking() {
        let hub = hub();
        let user = Uuid::new_v4();
        let _registration = hub.register(user).await.unwrap();

        for _ in 0..SEND_QUEUE_CAPACITY {
            hub.send_to_user(user, Bytes::from_static(b"x")).unwrap();
        }

        let started = Instant::now();
        assert_eq!(
            hub.send_to_user(user, Bytes::from_static(b"x")),
            Err(DeliveryError::Backpressure)
        );
        assert!(started.elapsed() < Duration::from_millis(100));
        // The slow client stays registered.
        assert!(hub.is_connected(user));
    }

    #[tokio::test]
    async fn test_send_to_users_reports_failures() {
        let hub = hub();
        let online = Uuid::new_v4();
        let offline = Uuid::new_v4();
        let mut registration = hub.register(online).await.unwrap();

        let failed = hub.send_to_users(&[online, offline], Bytes::from_static(b"hi"));
        assert_eq!(failed, vec![offline]);
        assert_eq!(registration.queue.recv().await.unwrap(), "hi");
    }

    #[tokio::test]
    async fn test_unregister_closes_queue() {
        let hub = hub();
        let user = Uuid::new_v4();
        let mut registration = hub.register(user).await.unwrap();

        hub.unregister(user, registration.conn_id);
        assert!(registration.queue.recv().await.is_none());
        assert!(!hub.is_connected(user));
    }

    #[tokio::test]
    async fn test_stale_unregister_keeps_newer_connection() {
        let hub = hub();
        let user = Uuid::new_v4();
        let mut first = hub.register(user).await.unwrap();
        let mut second = hub.register(user).await.unwrap();

        // Replacing the registration closed the first queue.
        assert!(first.queue.recv().await.is_none());

        hub.unregister(user, first.conn_id);
        // Round-trip through the coordinator so the unregister is applied.
        let _registration = hub.register(Uuid::new_v4()).await.unwrap();

        assert!(hub.is_connected(user));
        hub.send_to_user(user, Bytes::from_static(b"still here"))
            .unwrap();
        assert_eq!(second.queue.recv().await.unwrap(), "still here");
    }

    #[tokio::test]
    async fn test_broadcast_reaches_everyone() {
        let hub = hub();
        let mut a = hub.register(Uuid::new_v4()).await.unwrap();
        let mut b = hub.register(Uuid::new_v4()).await.unwrap();

        hub.broadcast(Bytes::from_static(b"all"));
        assert_eq!(a.queue.recv().await.unwrap(), "all");
        assert_eq!(b.queue.recv().await.unwrap(), "all");
    }

    #[tokio::test]
    async fn test_presence_is_throttled() {
        let store = Arc::new(CountingStore::default());
        let cache = Cache::new(store.clone());
        let (hub, _runner) = Hub::new(cache);
        let user = Uuid::new_v4();

        let scheduled = (0..50)
            .filter(|_| hub.update_presence(user, Duration::from_secs(10)))
            .count();
        assert_eq!(scheduled, 1);

        // Let the spawned cache write land.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(store.presence_writes.load(Ordering::SeqCst), 1);

        assert!(hub.update_presence(user, Duration::ZERO));
    }

    #[tokio::test]
    async fn test_register_counts_as_presence_update() {
        let store = Arc::new(CountingStore::default());
        let hub = Hub::spawn(Cache::new(store.clone()));
        let user = Uuid::new_v4();

        let _registration = hub.register(user).await.unwrap();
        // A ping right after connecting falls inside the throttle window.
        assert!(!hub.update_presence(user, Duration::from_secs(10)));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(store.presence_writes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_housekeeping_drops_disconnected_users() {
        let (hub, _runner) = Hub::new(Cache::in_memory());
        hub.update_presence(Uuid::new_v4(), Duration::from_secs(10));
        assert_eq!(hub.housekeeping(), 1);
        assert_eq!(hub.housekeeping(), 0);
    }
}
