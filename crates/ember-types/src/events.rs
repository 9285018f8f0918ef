use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::{Membership, Message};

/// Events sent FROM server TO client over the WebSocket gateway.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ServerEvent {
    /// Sent once the connection is authenticated
    Connected { connection_id: Uuid },

    /// A message was committed to a room
    MessageCreated { message: Message },

    /// A message body was edited
    MessageUpdated { message: Message },

    /// A user started or stopped typing in a room
    TypingChanged { user: Uuid, room: Uuid, is_typing: bool },

    /// A membership's involvement changed, or a member was added
    MembershipChanged { membership: Membership },

    /// A user came online or went offline
    PresenceChanged { user: Uuid, online: bool },

    /// A client request was rejected
    Error { reason: String },
}

impl ServerEvent {
    /// Returns the room this event is scoped to. Events that return `None`
    /// go to every connection.
    pub fn room_id(&self) -> Option<Uuid> {
        match self {
            Self::MessageCreated { message } | Self::MessageUpdated { message } => {
                Some(message.room_id)
            }
            Self::TypingChanged { room, .. } => Some(*room),
            Self::MembershipChanged { membership } => Some(membership.room_id),
            Self::Connected { .. } | Self::PresenceChanged { .. } | Self::Error { .. } => None,
        }
    }

    pub fn error(reason: impl Into<String>) -> Self {
        Self::Error { reason: reason.into() }
    }
}

/// Commands sent FROM client TO server over the WebSocket gateway.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ClientCommand {
    /// Start receiving a room's events. With `last_seen_id`, the server first
    /// replays what was missed since that message.
    Subscribe {
        room: Uuid,
        #[serde(default)]
        last_seen_id: Option<Uuid>,
    },

    Unsubscribe { room: Uuid },

    TypingStart { room: Uuid },

    TypingStop { room: Uuid },

    /// Keeps the connection and the user's presence alive
    Heartbeat,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn commands_use_type_and_data_envelope() {
        let room = Uuid::new_v4();
        let raw = format!(r#"{{"type":"subscribe","data":{{"room":"{room}"}}}}"#);
        let cmd: ClientCommand = serde_json::from_str(&raw).unwrap();
        assert_eq!(cmd, ClientCommand::Subscribe { room, last_seen_id: None });

        let cmd: ClientCommand = serde_json::from_str(r#"{"type":"heartbeat"}"#).unwrap();
        assert_eq!(cmd, ClientCommand::Heartbeat);
    }

    #[test]
    fn unknown_command_is_rejected() {
        assert!(serde_json::from_str::<ClientCommand>(r#"{"type":"shout","data":{}}"#).is_err());
    }

    #[test]
    fn typing_event_is_room_scoped() {
        let room = Uuid::new_v4();
        let event = ServerEvent::TypingChanged { user: Uuid::new_v4(), room, is_typing: true };
        assert_eq!(event.room_id(), Some(room));

        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "typing_changed");
        assert_eq!(json["data"]["is_typing"], true);
    }

    #[test]
    fn presence_event_is_global() {
        let event = ServerEvent::PresenceChanged { user: Uuid::new_v4(), online: false };
        assert_eq!(event.room_id(), None);
    }
}
