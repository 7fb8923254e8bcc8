use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, RwLock as StdRwLock},
    time::Duration,
};

use chrono::{DateTime, Utc};
use tokio::sync::{RwLock, mpsc};
use uuid::Uuid;

use super::message::Envelope;

/// Ping cadence and how long a client has to answer with a pong.
pub const PING_PERIOD: Duration = Duration::from_secs(54);
pub const PONG_WAIT: Duration = Duration::from_secs(60);
/// Outbound queue depth per connection; a full queue marks the client slow.
pub const SEND_BUFFER: usize = 256;

/// One connected client. The writer task owns the receiving half of the
/// send channel; the hub only ever enqueues.
pub struct Connection {
    pub id: Uuid,
    pub connected_at: DateTime<Utc>,
    user_id: StdRwLock<Option<Uuid>>,
    projects: StdRwLock<HashSet<Uuid>>,
    tx: mpsc::Sender<Envelope>,
    last_pong: StdRwLock<DateTime<Utc>>,
}

impl Connection {
    /// Build a connection plus the receiver its writer task drains.
    pub fn channel() -> (Arc<Self>, mpsc::Receiver<Envelope>) {
        let (tx, rx) = mpsc::channel(SEND_BUFFER);
        let conn = Arc::new(Self {
            id: Uuid::new_v4(),
            connected_at: Utc::now(),
            user_id: StdRwLock::new(None),
            projects: StdRwLock::new(HashSet::new()),
            tx,
            last_pong: StdRwLock::new(Utc::now()),
        });
        (conn, rx)
    }

    pub fn user_id(&self) -> Option<Uuid> {
        *self.user_id.read().unwrap()
    }

    pub fn subscribed_projects(&self) -> HashSet<Uuid> {
        self.projects.read().unwrap().clone()
    }

    pub fn record_pong(&self) {
        *self.last_pong.write().unwrap() = Utc::now();
    }

    /// Enqueue directly onto this connection's outbound channel, bypassing
    /// the fan-out indexes. Returns false when the buffer is full or closed.
    pub fn try_enqueue(&self, envelope: Envelope) -> bool {
        self.tx.try_send(envelope).is_ok()
    }

    fn last_pong(&self) -> DateTime<Utc> {
        *self.last_pong.read().unwrap()
    }
}

#[derive(Default)]
struct HubIndexes {
    connections: HashMap<Uuid, Arc<Connection>>,
    by_project: HashMap<Uuid, HashSet<Uuid>>,
    by_user: HashMap<Uuid, HashSet<Uuid>>,
}

/// In-process registry of live client connections with per-project and
/// per-user fan-out.
///
/// Sends never block: a slow consumer's message is dropped and the connection
/// is queued for asynchronous unregistration.
#[derive(Clone, Default)]
pub struct Hub {
    inner: Arc<RwLock<HubIndexes>>,
}

impl Hub {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, conn: Arc<Connection>) {
        let mut inner = self.inner.write().await;
        tracing::debug!("Registering connection {}", conn.id);
        inner.connections.insert(conn.id, conn);
    }

    /// Idempotent; cleans the project and user indexes.
    pub async fn unregister(&self, conn_id: Uuid) {
        let mut inner = self.inner.write().await;
        if inner.connections.remove(&conn_id).is_none() {
            return;
        }
        for members in inner.by_project.values_mut() {
            members.remove(&conn_id);
        }
        inner.by_project.retain(|_, members| !members.is_empty());
        for members in inner.by_user.values_mut() {
            members.remove(&conn_id);
        }
        inner.by_user.retain(|_, members| !members.is_empty());
        tracing::debug!("Unregistered connection {conn_id}");
    }

    pub async fn subscribe(&self, conn_id: Uuid, project_id: Uuid) {
        let mut inner = self.inner.write().await;
        let Some(conn) = inner.connections.get(&conn_id).cloned() else {
            return;
        };
        conn.projects.write().unwrap().insert(project_id);
        inner.by_project.entry(project_id).or_default().insert(conn_id);
    }

    pub async fn unsubscribe(&self, conn_id: Uuid, project_id: Uuid) {
        let mut inner = self.inner.write().await;
        if let Some(conn) = inner.connections.get(&conn_id) {
            conn.projects.write().unwrap().remove(&project_id);
        }
        let emptied = inner
            .by_project
            .get_mut(&project_id)
            .map(|members| {
                members.remove(&conn_id);
                members.is_empty()
            })
            .unwrap_or(false);
        if emptied {
            inner.by_project.remove(&project_id);
        }
    }

    /// Bind a connection to a user, re-indexing if it was bound before.
    pub async fn associate_user(&self, conn_id: Uuid, user_id: Uuid) {
        let mut inner = self.inner.write().await;
        let Some(conn) = inner.connections.get(&conn_id).cloned() else {
            return;
        };
        if let Some(previous) = conn.user_id() {
            let emptied = inner
                .by_user
                .get_mut(&previous)
                .map(|members| {
                    members.remove(&conn_id);
                    members.is_empty()
                })
                .unwrap_or(false);
            if emptied {
                inner.by_user.remove(&previous);
            }
        }
        *conn.user_id.write().unwrap() = Some(user_id);
        inner.by_user.entry(user_id).or_default().insert(conn_id);
    }

    pub async fn broadcast_to_project(
        &self,
        envelope: Envelope,
        project_id: Uuid,
        exclude: Option<Uuid>,
    ) {
        let targets = {
            let inner = self.inner.read().await;
            let Some(members) = inner.by_project.get(&project_id) else {
                return;
            };
            members
                .iter()
                .filter(|id| Some(**id) != exclude)
                .filter_map(|id| inner.connections.get(id).cloned())
                .collect::<Vec<_>>()
        };
        for conn in targets {
            self.deliver(&conn, envelope.clone());
        }
    }

    pub async fn broadcast_to_user(&self, envelope: Envelope, user_id: Uuid, exclude: Option<Uuid>) {
        let targets = {
            let inner = self.inner.read().await;
            let Some(members) = inner.by_user.get(&user_id) else {
                return;
            };
            members
                .iter()
                .filter(|id| Some(**id) != exclude)
                .filter_map(|id| inner.connections.get(id).cloned())
                .collect::<Vec<_>>()
        };
        for conn in targets {
            self.deliver(&conn, envelope.clone());
        }
    }

    pub async fn broadcast_to_all(&self, envelope: Envelope, exclude: Option<Uuid>) {
        let targets = {
            let inner = self.inner.read().await;
            inner
                .connections
                .values()
                .filter(|conn| Some(conn.id) != exclude)
                .cloned()
                .collect::<Vec<_>>()
        };
        for conn in targets {
            self.deliver(&conn, envelope.clone());
        }
    }

    pub async fn connection_count(&self) -> usize {
        self.inner.read().await.connections.len()
    }

    /// Non-blocking enqueue. A full or closed channel drops the message and
    /// schedules the connection for unregistration off the caller's path.
    fn deliver(&self, conn: &Arc<Connection>, envelope: Envelope) {
        match conn.tx.try_send(envelope) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::warn!(
                    "Send buffer full for connection {}, dropping message and unregistering",
                    conn.id
                );
                let hub = self.clone();
                let conn_id = conn.id;
                tokio::spawn(async move { hub.unregister(conn_id).await });
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                let hub = self.clone();
                let conn_id = conn.id;
                tokio::spawn(async move { hub.unregister(conn_id).await });
            }
        }
    }

    /// Periodically drop connections whose last pong is older than twice the
    /// pong deadline.
    pub fn spawn_stale_sweeper(&self, interval: Duration) -> tokio::task::JoinHandle<()> {
        let hub = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let deadline = Utc::now()
                    - chrono::Duration::from_std(2 * PONG_WAIT).unwrap_or_else(|_| {
                        chrono::Duration::seconds(120)
                    });
                let stale: Vec<Uuid> = {
                    let inner = hub.inner.read().await;
                    inner
                        .connections
                        .values()
                        .filter(|conn| conn.last_pong() < deadline)
                        .map(|conn| conn.id)
                        .collect()
                };
                for conn_id in stale {
                    tracing::info!("Dropping stale connection {conn_id}");
                    hub.unregister(conn_id).await;
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::services::message::MessageType;

    fn envelope() -> Envelope {
        Envelope::new(MessageType::TaskUpdated, json!({"k": 1}))
    }

    #[tokio::test]
    async fn project_broadcast_reaches_only_subscribers() {
        let hub = Hub::new();
        let project_a = Uuid::new_v4();
        let project_b = Uuid::new_v4();

        let (conn_a, mut rx_a) = Connection::channel();
        let (conn_b, mut rx_b) = Connection::channel();
        hub.register(conn_a.clone()).await;
        hub.register(conn_b.clone()).await;
        hub.subscribe(conn_a.id, project_a).await;
        hub.subscribe(conn_b.id, project_b).await;

        hub.broadcast_to_project(envelope(), project_a, None).await;

        assert!(rx_a.try_recv().is_ok());
        assert!(rx_b.try_recv().is_err());
    }

    #[tokio::test]
    async fn exclude_skips_the_originating_connection() {
        let hub = Hub::new();
        let project = Uuid::new_v4();
        let (conn_a, mut rx_a) = Connection::channel();
        let (conn_b, mut rx_b) = Connection::channel();
        hub.register(conn_a.clone()).await;
        hub.register(conn_b.clone()).await;
        hub.subscribe(conn_a.id, project).await;
        hub.subscribe(conn_b.id, project).await;

        hub.broadcast_to_project(envelope(), project, Some(conn_a.id))
            .await;
        assert!(rx_a.try_recv().is_err());
        assert!(rx_b.try_recv().is_ok());
    }

    #[tokio::test]
    async fn user_rebind_moves_the_index() {
        let hub = Hub::new();
        let (conn, mut rx) = Connection::channel();
        hub.register(conn.clone()).await;

        let first = Uuid::new_v4();
        let second = Uuid::new_v4();
        hub.associate_user(conn.id, first).await;
        hub.associate_user(conn.id, second).await;

        hub.broadcast_to_user(envelope(), first, None).await;
        assert!(rx.try_recv().is_err());
        hub.broadcast_to_user(envelope(), second, None).await;
        assert!(rx.try_recv().is_ok());
    }

    #[tokio::test]
    async fn slow_consumer_is_dropped_without_blocking() {
        let hub = Hub::new();
        let project = Uuid::new_v4();
        let (conn, _rx) = Connection::channel();
        hub.register(conn.clone()).await;
        hub.subscribe(conn.id, project).await;

        // Nobody drains `_rx`: overflow the buffer and one more.
        for _ in 0..=SEND_BUFFER {
            hub.broadcast_to_project(envelope(), project, None).await;
        }

        // The overflowing send scheduled an async unregister.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(hub.connection_count().await, 0);
    }

    #[tokio::test]
    async fn unregister_is_idempotent() {
        let hub = Hub::new();
        let (conn, _rx) = Connection::channel();
        hub.register(conn.clone()).await;
        hub.unregister(conn.id).await;
        hub.unregister(conn.id).await;
        assert_eq!(hub.connection_count().await, 0);
    }
}
