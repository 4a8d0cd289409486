//! Live connection bookkeeping and event fan-out.
//!
//! Each connection owns a bounded outbox drained by its socket task. Emission
//! never waits on a peer: frames are offered with `try_send` and dropped for
//! any peer whose outbox is full or closed.

use std::{
    collections::{HashMap, HashSet},
    fmt,
    sync::Arc,
};

use chrono::{DateTime, Utc};
use parley_core::OutboundEvent;
use tokio::sync::{
    mpsc::{self, error::TrySendError},
    RwLock,
};
use tracing::{debug, error, warn};
use uuid::Uuid;

/// A pre-encoded outbound frame shared between all recipients.
pub type Frame = Arc<str>;
pub type Outbox = mpsc::Sender<Frame>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Snapshot of a registered connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Connection {
    pub id: ConnectionId,
    pub identity: Option<String>,
    pub session_expires_at: Option<DateTime<Utc>>,
    pub connected_at: DateTime<Utc>,
}

impl Connection {
    pub fn is_bound(&self) -> bool {
        self.identity.is_some()
    }
}

struct Entry {
    connection: Connection,
    outbox: Outbox,
}

#[derive(Default)]
struct Inner {
    connections: HashMap<ConnectionId, Entry>,
    by_identity: HashMap<String, HashSet<ConnectionId>>,
}

#[derive(Default)]
pub struct ConnectionRegistry {
    inner: RwLock<Inner>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, id: ConnectionId, outbox: Outbox) -> Connection {
        let connection = Connection {
            id,
            identity: None,
            session_expires_at: None,
            connected_at: Utc::now(),
        };
        let mut inner = self.inner.write().await;
        if let Some(previous) = inner.connections.insert(
            id,
            Entry {
                connection: connection.clone(),
                outbox,
            },
        ) {
            inner.unindex(id, previous.connection.identity.as_deref());
        }
        connection
    }

    /// Bind `id` to an authenticated identity. Returns false when the
    /// connection is no longer registered.
    pub async fn bind(
        &self,
        id: ConnectionId,
        identity: &str,
        expires_at: Option<DateTime<Utc>>,
    ) -> bool {
        let mut inner = self.inner.write().await;
        let Some(entry) = inner.connections.get_mut(&id) else {
            return false;
        };
        let previous = entry.connection.identity.replace(identity.to_string());
        entry.connection.session_expires_at = expires_at;
        inner.unindex(id, previous.as_deref());
        inner
            .by_identity
            .entry(identity.to_string())
            .or_default()
            .insert(id);
        true
    }

    pub async fn unregister(&self, id: ConnectionId) -> Option<Connection> {
        let mut inner = self.inner.write().await;
        let entry = inner.connections.remove(&id)?;
        inner.unindex(id, entry.connection.identity.as_deref());
        Some(entry.connection)
    }

    pub async fn connection(&self, id: ConnectionId) -> Option<Connection> {
        let inner = self.inner.read().await;
        inner.connections.get(&id).map(|e| e.connection.clone())
    }

    #[cfg(test)]
    pub async fn is_live(&self, id: ConnectionId) -> bool {
        let inner = self.inner.read().await;
        inner
            .connections
            .get(&id)
            .is_some_and(|e| !e.outbox.is_closed())
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.connections.len()
    }

    pub async fn broadcast_all(&self, event: &OutboundEvent) -> usize {
        self.broadcast(event, None).await
    }

    pub async fn broadcast_except(&self, event: &OutboundEvent, exclude: ConnectionId) -> usize {
        self.broadcast(event, Some(exclude)).await
    }

    /// Deliver to every live connection bound to `identity`. Events for users
    /// without a connection are dropped.
    pub async fn send_to(&self, identity: &str, event: &OutboundEvent) -> usize {
        let Some(frame) = encode(event) else {
            return 0;
        };
        let inner = self.inner.read().await;
        let Some(ids) = inner.by_identity.get(identity) else {
            debug!(%identity, event = event.name(), "no live connection for recipient");
            return 0;
        };
        ids.iter()
            .filter_map(|id| inner.connections.get(id))
            .filter(|entry| offer(entry, &frame, event.name()))
            .count()
    }

    pub async fn send_to_connection(&self, id: ConnectionId, event: &OutboundEvent) -> bool {
        let Some(frame) = encode(event) else {
            return false;
        };
        let inner = self.inner.read().await;
        inner
            .connections
            .get(&id)
            .is_some_and(|entry| offer(entry, &frame, event.name()))
    }

    async fn broadcast(&self, event: &OutboundEvent, exclude: Option<ConnectionId>) -> usize {
        let Some(frame) = encode(event) else {
            return 0;
        };
        let inner = self.inner.read().await;
        inner
            .connections
            .iter()
            .filter(|(id, _)| Some(**id) != exclude)
            .filter(|(_, entry)| offer(entry, &frame, event.name()))
            .count()
    }
}

impl Inner {
    fn unindex(&mut self, id: ConnectionId, identity: Option<&str>) {
        let Some(identity) = identity else {
            return;
        };
        if let Some(ids) = self.by_identity.get_mut(identity) {
            ids.remove(&id);
            if ids.is_empty() {
                self.by_identity.remove(identity);
            }
        }
    }
}

fn encode(event: &OutboundEvent) -> Option<Frame> {
    match event.encode() {
        Ok(text) => Some(Arc::from(text)),
        Err(err) => {
            error!(?err, event = event.name(), "failed to encode outbound event");
            None
        }
    }
}

fn offer(entry: &Entry, frame: &Frame, event: &'static str) -> bool {
    match entry.outbox.try_send(frame.clone()) {
        Ok(()) => true,
        Err(TrySendError::Full(_)) => {
            warn!(connection = %entry.connection.id, event, "outbox full; dropping event");
            false
        }
        Err(TrySendError::Closed(_)) => false,
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use serde_json::{json, Value};
    use tokio::sync::mpsc::Receiver;

    pub async fn connect(
        registry: &ConnectionRegistry,
        capacity: usize,
    ) -> (ConnectionId, Receiver<Frame>) {
        let (tx, rx) = mpsc::channel(capacity);
        let id = ConnectionId::new();
        registry.register(id, tx).await;
        (id, rx)
    }

    /// Drain every queued frame, decoded as JSON.
    pub fn drain(rx: &mut Receiver<Frame>) -> Vec<Value> {
        let mut frames = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            frames.push(serde_json::from_str(&frame).expect("frame is json"));
        }
        frames
    }

    fn typing() -> OutboundEvent {
        OutboundEvent::UserTyping(json!({"user": "a"}))
    }

    #[tokio::test]
    async fn broadcast_except_skips_the_origin() {
        let registry = ConnectionRegistry::new();
        let (x, mut rx_x) = connect(&registry, 4).await;
        let (_, mut rx_y) = connect(&registry, 4).await;
        let (_, mut rx_z) = connect(&registry, 4).await;

        assert_eq!(registry.broadcast_except(&typing(), x).await, 2);
        assert!(drain(&mut rx_x).is_empty());
        assert_eq!(drain(&mut rx_y)[0]["event"], "user_typing");
        assert_eq!(drain(&mut rx_z).len(), 1);
    }

    #[tokio::test]
    async fn broadcast_all_includes_the_origin() {
        let registry = ConnectionRegistry::new();
        let (_, mut rx_x) = connect(&registry, 4).await;
        let (_, mut rx_y) = connect(&registry, 4).await;

        assert_eq!(registry.broadcast_all(&typing()).await, 2);
        assert_eq!(drain(&mut rx_x).len(), 1);
        assert_eq!(drain(&mut rx_y).len(), 1);
    }

    #[tokio::test]
    async fn send_to_reaches_every_bound_connection_only() {
        let registry = ConnectionRegistry::new();
        let (phone, mut rx_phone) = connect(&registry, 4).await;
        let (laptop, mut rx_laptop) = connect(&registry, 4).await;
        let (_, mut rx_other) = connect(&registry, 4).await;
        assert!(registry.bind(phone, "a@example.org", None).await);
        assert!(registry.bind(laptop, "a@example.org", None).await);

        assert_eq!(registry.send_to("a@example.org", &typing()).await, 2);
        assert_eq!(drain(&mut rx_phone).len(), 1);
        assert_eq!(drain(&mut rx_laptop).len(), 1);
        assert!(drain(&mut rx_other).is_empty());

        assert_eq!(registry.send_to("offline@example.org", &typing()).await, 0);
    }

    #[tokio::test]
    async fn bind_after_unregister_is_a_noop() {
        let registry = ConnectionRegistry::new();
        let (id, _rx) = connect(&registry, 4).await;

        assert!(registry.unregister(id).await.is_some());
        assert!(registry.unregister(id).await.is_none());
        assert!(!registry.bind(id, "a@example.org", None).await);
        assert_eq!(registry.len().await, 0);
        assert_eq!(registry.send_to("a@example.org", &typing()).await, 0);
    }

    #[tokio::test]
    async fn rebinding_moves_the_identity_index() {
        let registry = ConnectionRegistry::new();
        let (id, mut rx) = connect(&registry, 4).await;
        registry.bind(id, "a@example.org", None).await;
        registry.bind(id, "b@example.org", None).await;

        assert_eq!(registry.send_to("a@example.org", &typing()).await, 0);
        assert_eq!(registry.send_to("b@example.org", &typing()).await, 1);
        assert_eq!(drain(&mut rx).len(), 1);
        let connection = registry.connection(id).await.expect("registered");
        assert_eq!(connection.identity.as_deref(), Some("b@example.org"));
    }

    #[tokio::test]
    async fn full_outbox_drops_only_for_the_stalled_peer() {
        let registry = ConnectionRegistry::new();
        let (_, mut stalled) = connect(&registry, 1).await;
        let (_, mut healthy) = connect(&registry, 8).await;

        assert_eq!(registry.broadcast_all(&typing()).await, 2);
        assert_eq!(registry.broadcast_all(&typing()).await, 1);
        assert_eq!(registry.broadcast_all(&typing()).await, 1);

        assert_eq!(drain(&mut stalled).len(), 1);
        assert_eq!(drain(&mut healthy).len(), 3);
    }

    #[tokio::test]
    async fn closed_outbox_is_not_live() {
        let registry = ConnectionRegistry::new();
        let (id, rx) = connect(&registry, 1).await;
        assert!(registry.is_live(id).await);

        drop(rx);
        assert!(!registry.is_live(id).await);
        assert_eq!(registry.broadcast_all(&typing()).await, 0);
    }
}
