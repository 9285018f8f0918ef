use std::sync::Arc;

use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

use ember_db::writer::{CommitListener, Committed};
use ember_types::events::ServerEvent;

use crate::connection::Outbound;
use crate::registry::{ConnectionHandle, DeliveryError, RoomRegistry};

/// An event serialized once and shared by every recipient.
#[derive(Debug)]
pub struct Dispatched {
    /// Room the event belongs to, if any. Used to hold it back while that
    /// room's catch-up is in flight.
    pub room: Option<Uuid>,
    /// Set for `message_created`, so a connection can skip it when catch-up
    /// already delivered the same message.
    pub created_message_id: Option<Uuid>,
    pub json: Arc<str>,
}

impl Dispatched {
    pub fn encode(event: &ServerEvent) -> serde_json::Result<Arc<Self>> {
        let created_message_id = match event {
            ServerEvent::MessageCreated { message } => Some(message.id),
            _ => None,
        };
        Ok(Arc::new(Self {
            room: event.room_id(),
            created_message_id,
            json: serde_json::to_string(event)?.into(),
        }))
    }
}

/// Fans events out to live connections. Never blocks and never fails. A
/// connection whose buffer is full is closed so the client reconnects and
/// catches up.
#[derive(Clone)]
pub struct Dispatcher {
    registry: Arc<RoomRegistry>,
}

impl Dispatcher {
    pub fn new(registry: Arc<RoomRegistry>) -> Self {
        Self { registry }
    }

    /// Send to every connection currently subscribed to `room_id`.
    pub fn publish(&self, room_id: Uuid, event: &ServerEvent) {
        let targets = self.registry.subscribers_of(room_id);
        self.fan_out(event, targets);
    }

    /// Send to every live connection.
    pub fn publish_global(&self, event: &ServerEvent) {
        let targets = self.registry.all_connections();
        self.fan_out(event, targets);
    }

    /// Send to the room's subscribers and to every connection of `user_id`,
    /// each at most once.
    pub fn publish_to_room_and_user(&self, room_id: Uuid, user_id: Uuid, event: &ServerEvent) {
        let mut targets = self.registry.subscribers_of(room_id);
        for handle in self.registry.connections_of(user_id) {
            if !targets.iter().any(|t| t.id == handle.id) {
                targets.push(handle);
            }
        }
        self.fan_out(event, targets);
    }

    /// Close every socket of `user_id`. Returns how many there were.
    pub fn disconnect_user(&self, user_id: Uuid) -> usize {
        Self::close_all(self.registry.connections_of(user_id))
    }

    /// Close the sockets opened with `session_id`.
    pub fn disconnect_session(&self, session_id: Uuid) -> usize {
        Self::close_all(self.registry.connections_of_session(session_id))
    }

    fn close_all(handles: Vec<ConnectionHandle>) -> usize {
        for handle in &handles {
            info!("Closing connection {} of {}", handle.id, handle.user_id);
            handle.close();
        }
        handles.len()
    }

    fn fan_out(&self, event: &ServerEvent, targets: Vec<ConnectionHandle>) {
        if targets.is_empty() {
            return;
        }

        let dispatched = match Dispatched::encode(event) {
            Ok(d) => d,
            Err(e) => {
                error!("Failed to serialize event: {}", e);
                return;
            }
        };

        trace!("Dispatching to {} connections: {}", targets.len(), dispatched.json);

        for handle in targets {
            if handle.is_closing() {
                continue;
            }
            match handle.deliver(Outbound::Event(dispatched.clone())) {
                Ok(()) => {}
                Err(DeliveryError::BufferFull) => {
                    warn!(
                        "Connection {} (user {}) fell behind: {}, closing",
                        handle.id,
                        handle.user_id,
                        DeliveryError::BufferFull
                    );
                    handle.close();
                }
                Err(DeliveryError::Closed) => {
                    debug!("Connection {} already closed, skipping event", handle.id);
                }
            }
        }
    }
}

impl CommitListener for Dispatcher {
    fn committed(&self, event: &Committed) {
        match event {
            Committed::MessageCreated(message) => {
                self.registry.record_message(message.room_id, message.id);
                self.publish(
                    message.room_id,
                    &ServerEvent::MessageCreated { message: message.clone() },
                );
            }
            Committed::MessageUpdated(message) => {
                self.publish(
                    message.room_id,
                    &ServerEvent::MessageUpdated { message: message.clone() },
                );
            }
            Committed::MembershipChanged(membership) => {
                // The member hears about it even before subscribing to the room.
                self.publish_to_room_and_user(
                    membership.room_id,
                    membership.user_id,
                    &ServerEvent::MembershipChanged { membership: membership.clone() },
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use ember_types::models::{Involvement, Membership, Message};
    use tokio::sync::mpsc;

    fn connect(
        registry: &RoomRegistry,
        user_id: Uuid,
        capacity: usize,
    ) -> (Uuid, mpsc::Receiver<Outbound>) {
        let (tx, rx) = mpsc::channel(capacity);
        let id = Uuid::new_v4();
        registry.register(ConnectionHandle::new(id, user_id, Uuid::new_v4(), tx));
        (id, rx)
    }

    fn handle_of(registry: &RoomRegistry, conn: Uuid) -> ConnectionHandle {
        registry
            .all_connections()
            .into_iter()
            .find(|h| h.id == conn)
            .unwrap()
    }

    fn message(room_id: Uuid, body: &str) -> Message {
        let now = Utc::now();
        Message {
            id: Uuid::new_v4(),
            room_id,
            creator_id: Uuid::new_v4(),
            creator_name: "alice".into(),
            body: body.into(),
            correlation_id: body.into(),
            created_at: now,
            updated_at: now,
        }
    }

    fn drain(rx: &mut mpsc::Receiver<Outbound>) -> Vec<Arc<Dispatched>> {
        let mut out = Vec::new();
        while let Ok(item) = rx.try_recv() {
            if let Outbound::Event(d) = item {
                out.push(d);
            }
        }
        out
    }

    #[test]
    fn publish_reaches_only_room_subscribers() {
        let registry = Arc::new(RoomRegistry::new());
        let dispatcher = Dispatcher::new(registry.clone());
        let room = Uuid::new_v4();

        let (inside, mut inside_rx) = connect(&registry, Uuid::new_v4(), 8);
        let (_outside, mut outside_rx) = connect(&registry, Uuid::new_v4(), 8);
        registry.subscribe(inside, room);

        dispatcher.publish(room, &ServerEvent::TypingChanged { user: Uuid::new_v4(), room, is_typing: true });

        assert_eq!(drain(&mut inside_rx).len(), 1);
        assert!(drain(&mut outside_rx).is_empty());
    }

    #[test]
    fn subscribers_share_one_encoding() {
        let registry = Arc::new(RoomRegistry::new());
        let dispatcher = Dispatcher::new(registry.clone());
        let room = Uuid::new_v4();

        let (a, mut a_rx) = connect(&registry, Uuid::new_v4(), 8);
        let (b, mut b_rx) = connect(&registry, Uuid::new_v4(), 8);
        registry.subscribe(a, room);
        registry.subscribe(b, room);

        let m = message(room, "hi");
        dispatcher.committed(&Committed::MessageCreated(m.clone()));

        let (a_events, b_events) = (drain(&mut a_rx), drain(&mut b_rx));
        assert!(Arc::ptr_eq(&a_events[0], &b_events[0]));
        assert_eq!(a_events[0].created_message_id, Some(m.id));
        assert_eq!(a_events[0].room, Some(room));
        assert_eq!(registry.last_message(room), Some(m.id));
    }

    #[test]
    fn commits_arrive_in_commit_order() {
        let registry = Arc::new(RoomRegistry::new());
        let dispatcher = Dispatcher::new(registry.clone());
        let room = Uuid::new_v4();

        let (conn, mut rx) = connect(&registry, Uuid::new_v4(), 64);
        registry.subscribe(conn, room);

        let messages: Vec<Message> = (0..10).map(|i| message(room, &format!("m{i}"))).collect();
        for m in &messages {
            dispatcher.committed(&Committed::MessageCreated(m.clone()));
        }

        let received: Vec<Uuid> = drain(&mut rx)
            .iter()
            .filter_map(|d| d.created_message_id)
            .collect();
        let expected: Vec<Uuid> = messages.iter().map(|m| m.id).collect();
        assert_eq!(received, expected);
    }

    #[test]
    fn full_buffer_does_not_affect_other_subscribers() {
        let registry = Arc::new(RoomRegistry::new());
        let dispatcher = Dispatcher::new(registry.clone());
        let room = Uuid::new_v4();

        let (slow, mut slow_rx) = connect(&registry, Uuid::new_v4(), 1);
        let (fast, mut fast_rx) = connect(&registry, Uuid::new_v4(), 8);
        registry.subscribe(slow, room);
        registry.subscribe(fast, room);

        for i in 0..3 {
            dispatcher.committed(&Committed::MessageCreated(message(room, &format!("m{i}"))));
        }

        assert_eq!(drain(&mut slow_rx).len(), 1);
        assert_eq!(drain(&mut fast_rx).len(), 3);
    }

    #[test]
    fn full_buffer_closes_the_connection() {
        let registry = Arc::new(RoomRegistry::new());
        let dispatcher = Dispatcher::new(registry.clone());
        let room = Uuid::new_v4();

        let (slow, mut slow_rx) = connect(&registry, Uuid::new_v4(), 1);
        let (fast, _fast_rx) = connect(&registry, Uuid::new_v4(), 8);
        registry.subscribe(slow, room);
        registry.subscribe(fast, room);

        dispatcher.committed(&Committed::MessageCreated(message(room, "m0")));
        assert!(!handle_of(&registry, slow).is_closing());

        dispatcher.committed(&Committed::MessageCreated(message(room, "m1")));
        assert!(handle_of(&registry, slow).is_closing());
        assert!(!handle_of(&registry, fast).is_closing());

        // Nothing more is queued once closing.
        drain(&mut slow_rx);
        dispatcher.committed(&Committed::MessageCreated(message(room, "m2")));
        assert!(drain(&mut slow_rx).is_empty());
    }

    #[test]
    fn disconnect_user_closes_only_that_users_sockets() {
        let registry = Arc::new(RoomRegistry::new());
        let dispatcher = Dispatcher::new(registry.clone());
        let (bob, alice) = (Uuid::new_v4(), Uuid::new_v4());

        let (phone, _rx1) = connect(&registry, bob, 8);
        let (laptop, _rx2) = connect(&registry, bob, 8);
        let (other, _rx3) = connect(&registry, alice, 8);

        assert_eq!(dispatcher.disconnect_user(bob), 2);
        assert!(handle_of(&registry, phone).is_closing());
        assert!(handle_of(&registry, laptop).is_closing());
        assert!(!handle_of(&registry, other).is_closing());
    }

    #[test]
    fn disconnect_session_leaves_other_sessions_open() {
        let registry = Arc::new(RoomRegistry::new());
        let dispatcher = Dispatcher::new(registry.clone());
        let user = Uuid::new_v4();

        let (a, _rx1) = connect(&registry, user, 8);
        let (b, _rx2) = connect(&registry, user, 8);
        let session = handle_of(&registry, a).session_id;

        assert_eq!(dispatcher.disconnect_session(session), 1);
        assert!(handle_of(&registry, a).is_closing());
        assert!(!handle_of(&registry, b).is_closing());
    }

    #[test]
    fn membership_change_reaches_the_member_outside_the_room() {
        let registry = Arc::new(RoomRegistry::new());
        let dispatcher = Dispatcher::new(registry.clone());
        let room = Uuid::new_v4();
        let newcomer = Uuid::new_v4();

        let (_conn, mut rx) = connect(&registry, newcomer, 8);
        dispatcher.committed(&Committed::MembershipChanged(Membership {
            user_id: newcomer,
            room_id: room,
            involvement: Involvement::Mentions,
            connections: 0,
            connected_at: None,
            last_read_at: None,
        }));

        let events = drain(&mut rx);
        assert_eq!(events.len(), 1);
        assert!(events[0].json.contains("membership_changed"));
    }

    #[test]
    fn presence_goes_to_everyone() {
        let registry = Arc::new(RoomRegistry::new());
        let dispatcher = Dispatcher::new(registry.clone());

        let (_a, mut a_rx) = connect(&registry, Uuid::new_v4(), 8);
        let (_b, mut b_rx) = connect(&registry, Uuid::new_v4(), 8);

        dispatcher.publish_global(&ServerEvent::PresenceChanged { user: Uuid::new_v4(), online: true });

        assert_eq!(drain(&mut a_rx).len(), 1);
        assert_eq!(drain(&mut b_rx).len(), 1);
    }
}
