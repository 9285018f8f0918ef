use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tokio::sync::{mpsc, watch};
use uuid::Uuid;

use crate::connection::Outbound;

/// Why an event didn't reach a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum DeliveryError {
    #[error("outbound buffer full")]
    BufferFull,
    #[error("connection closed")]
    Closed,
}

/// The registry's view of one live socket.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    pub id: Uuid,
    pub user_id: Uuid,
    /// Session the socket authenticated with.
    pub session_id: Uuid,
    tx: mpsc::Sender<Outbound>,
    closing: Arc<watch::Sender<bool>>,
}

impl ConnectionHandle {
    pub fn new(id: Uuid, user_id: Uuid, session_id: Uuid, tx: mpsc::Sender<Outbound>) -> Self {
        Self {
            id,
            user_id,
            session_id,
            tx,
            closing: Arc::new(watch::Sender::new(false)),
        }
    }

    /// Ask the socket to shut down. Nothing more is delivered to it.
    pub fn close(&self) {
        self.closing.send_replace(true);
    }

    pub fn is_closing(&self) -> bool {
        *self.closing.borrow()
    }

    /// Resolves once [`ConnectionHandle::close`] has been called.
    pub async fn closed(&self) {
        let mut rx = self.closing.subscribe();
        // The sender lives in `self`, so this only ends on close.
        let _ = rx.wait_for(|closing| *closing).await;
    }

    /// Queue without waiting. A slow reader never stalls the caller.
    pub fn deliver(&self, item: Outbound) -> Result<(), DeliveryError> {
        self.tx.try_send(item).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => DeliveryError::BufferFull,
            mpsc::error::TrySendError::Closed(_) => DeliveryError::Closed,
        })
    }
}

#[derive(Default)]
struct RoomEntry {
    subscribers: HashSet<Uuid>,
    last_message: Option<Uuid>,
}

#[derive(Default)]
struct Inner {
    connections: HashMap<Uuid, ConnectionHandle>,
    rooms: HashMap<Uuid, RoomEntry>,
}

/// Which live connections are subscribed to which rooms.
///
/// Holds no authorization logic: callers check membership before calling
/// [`RoomRegistry::subscribe`]. Locks are never held across an await.
#[derive(Default)]
pub struct RoomRegistry {
    inner: RwLock<Inner>,
}

impl RoomRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, handle: ConnectionHandle) {
        self.write().connections.insert(handle.id, handle);
    }

    /// Forget a connection and drop it from every room. Returns the rooms it
    /// was subscribed to.
    pub fn remove_connection(&self, conn_id: Uuid) -> Vec<Uuid> {
        let mut inner = self.write();
        inner.connections.remove(&conn_id);

        let mut left = Vec::new();
        for (room_id, entry) in inner.rooms.iter_mut() {
            if entry.subscribers.remove(&conn_id) {
                left.push(*room_id);
            }
        }
        left
    }

    /// Returns false if the connection is unknown or already subscribed.
    pub fn subscribe(&self, conn_id: Uuid, room_id: Uuid) -> bool {
        let mut inner = self.write();
        if !inner.connections.contains_key(&conn_id) {
            return false;
        }
        inner.rooms.entry(room_id).or_default().subscribers.insert(conn_id)
    }

    /// Returns false if the connection wasn't subscribed.
    pub fn unsubscribe(&self, conn_id: Uuid, room_id: Uuid) -> bool {
        self.write()
            .rooms
            .get_mut(&room_id)
            .is_some_and(|entry| entry.subscribers.remove(&conn_id))
    }

    pub fn is_subscribed(&self, conn_id: Uuid, room_id: Uuid) -> bool {
        self.read()
            .rooms
            .get(&room_id)
            .is_some_and(|entry| entry.subscribers.contains(&conn_id))
    }

    /// Snapshot of the room's subscribers at call time.
    pub fn subscribers_of(&self, room_id: Uuid) -> Vec<ConnectionHandle> {
        let inner = self.read();
        let Some(entry) = inner.rooms.get(&room_id) else {
            return Vec::new();
        };
        entry
            .subscribers
            .iter()
            .filter_map(|id| inner.connections.get(id).cloned())
            .collect()
    }

    pub fn connections_of(&self, user_id: Uuid) -> Vec<ConnectionHandle> {
        self.read()
            .connections
            .values()
            .filter(|handle| handle.user_id == user_id)
            .cloned()
            .collect()
    }

    pub fn connections_of_session(&self, session_id: Uuid) -> Vec<ConnectionHandle> {
        self.read()
            .connections
            .values()
            .filter(|handle| handle.session_id == session_id)
            .cloned()
            .collect()
    }

    pub fn all_connections(&self) -> Vec<ConnectionHandle> {
        self.read().connections.values().cloned().collect()
    }

    pub fn record_message(&self, room_id: Uuid, message_id: Uuid) {
        self.write().rooms.entry(room_id).or_default().last_message = Some(message_id);
    }

    /// Last message committed to the room since startup, if any.
    pub fn last_message(&self, room_id: Uuid) -> Option<Uuid> {
        self.read().rooms.get(&room_id).and_then(|entry| entry.last_message)
    }

    // Every update leaves the maps consistent, so poisoning is ignored.
    fn read(&self) -> RwLockReadGuard<'_, Inner> {
        self.inner.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Inner> {
        self.inner.write().unwrap_or_else(|e| e.into_inner())
    }
}
