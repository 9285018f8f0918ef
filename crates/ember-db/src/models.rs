//! Write payloads accepted by the writer. Callers validate shape and length
//! before building these.

use ember_types::models::{Message, Role, RoomKind};
use uuid::Uuid;

pub struct NewUser {
    pub name: String,
    /// Argon2 hash; `None` for bots, which authenticate by token only.
    pub password_hash: Option<String>,
    pub role: Role,
}

pub struct NewRoom {
    pub name: String,
    /// `Open` or `Closed`. Direct rooms go through
    /// `Writer::find_or_create_direct_room`.
    pub kind: RoomKind,
    pub creator_id: Uuid,
    /// Extra members for closed rooms. Ignored for open rooms, which include
    /// every active user.
    pub member_ids: Vec<Uuid>,
}

pub struct NewMessage {
    pub room_id: Uuid,
    pub creator_id: Uuid,
    pub body: String,
    pub correlation_id: String,
}

/// Result of a create-message submission.
#[derive(Debug, Clone, PartialEq)]
pub enum CreateOutcome {
    Created(Message),
    /// The (room, correlation id) pair was already stored; this is the
    /// original record, untouched.
    Existing(Message),
}

impl CreateOutcome {
    pub fn message(&self) -> &Message {
        match self {
            Self::Created(m) | Self::Existing(m) => m,
        }
    }

    pub fn is_created(&self) -> bool {
        matches!(self, Self::Created(_))
    }
}
