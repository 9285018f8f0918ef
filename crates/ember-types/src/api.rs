use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::{Involvement, Membership, Room, User};

pub const MAX_BODY_CHARS: usize = 10_000;
pub const MAX_CORRELATION_ID_CHARS: usize = 128;
pub const MAX_ROOM_NAME_CHARS: usize = 100;

// -- Auth --

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RegisterRequest {
    pub name: String,
    pub password: String,
}

impl RegisterRequest {
    pub fn validate(&self) -> Result<(), String> {
        let len = self.name.chars().count();
        if !(3..=32).contains(&len) {
            return Err("name must be 3 to 32 characters".into());
        }
        if self.name.trim() != self.name {
            return Err("name must not start or end with whitespace".into());
        }
        if self.password.len() < 8 {
            return Err("password must be at least 8 characters".into());
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoginRequest {
    pub name: String,
    pub password: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AuthResponse {
    pub user: User,
    pub token: String,
}

// -- Rooms --

/// Only shared rooms are created this way; direct rooms go through
/// [`DirectRoomRequest`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SharedRoomKind {
    Open,
    Closed,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CreateRoomRequest {
    pub name: String,
    pub kind: SharedRoomKind,
    #[serde(default)]
    pub member_ids: Vec<Uuid>,
}

impl CreateRoomRequest {
    pub fn validate(&self) -> Result<(), String> {
        let len = self.name.trim().chars().count();
        if len == 0 {
            return Err("room name must not be blank".into());
        }
        if len > MAX_ROOM_NAME_CHARS {
            return Err(format!("room name must be at most {MAX_ROOM_NAME_CHARS} characters"));
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DirectRoomRequest {
    pub user_ids: Vec<Uuid>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AddMembersRequest {
    pub user_ids: Vec<Uuid>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SetInvolvementRequest {
    pub involvement: Involvement,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RoomListing {
    pub room: Room,
    pub membership: Membership,
}

// -- Messages --

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SendMessageRequest {
    pub content: String,
    pub correlation_id: String,
}

impl SendMessageRequest {
    pub fn validate(&self) -> Result<(), String> {
        validate_body(&self.content)?;
        let len = self.correlation_id.chars().count();
        if len == 0 || len > MAX_CORRELATION_ID_CHARS {
            return Err(format!(
                "correlation_id must be 1 to {MAX_CORRELATION_ID_CHARS} characters"
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EditMessageRequest {
    pub content: String,
}

impl EditMessageRequest {
    pub fn validate(&self) -> Result<(), String> {
        validate_body(&self.content)
    }
}

fn validate_body(body: &str) -> Result<(), String> {
    if body.trim().is_empty() {
        return Err("content must not be blank".into());
    }
    if body.chars().count() > MAX_BODY_CHARS {
        return Err(format!("content must be at most {MAX_BODY_CHARS} characters"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn send(content: &str, correlation_id: &str) -> SendMessageRequest {
        SendMessageRequest { content: content.into(), correlation_id: correlation_id.into() }
    }

    #[test]
    fn body_length_bounds() {
        assert!(send("hi", "c1").validate().is_ok());
        assert!(send(&"x".repeat(MAX_BODY_CHARS), "c1").validate().is_ok());
        assert!(send(&"x".repeat(MAX_BODY_CHARS + 1), "c1").validate().is_err());
        assert!(send("   ", "c1").validate().is_err());
        assert!(send("", "c1").validate().is_err());
    }

    #[test]
    fn body_limit_counts_characters_not_bytes() {
        let body = "é".repeat(MAX_BODY_CHARS);
        assert!(body.len() > MAX_BODY_CHARS);
        assert!(send(&body, "c1").validate().is_ok());
    }

    #[test]
    fn correlation_id_is_required() {
        assert!(send("hi", "").validate().is_err());
        assert!(send("hi", &"c".repeat(MAX_CORRELATION_ID_CHARS + 1)).validate().is_err());
    }

    #[test]
    fn register_rejects_short_password() {
        let req = RegisterRequest { name: "alice".into(), password: "short".into() };
        assert!(req.validate().is_err());
        let req = RegisterRequest { name: "alice".into(), password: "long enough".into() };
        assert!(req.validate().is_ok());
    }

    #[test]
    fn send_request_rejects_unknown_fields() {
        let raw = r#"{"content":"hi","correlation_id":"c1","extra":1}"#;
        assert!(serde_json::from_str::<SendMessageRequest>(raw).is_err());
    }

    #[test]
    fn room_name_must_not_be_blank() {
        let req = CreateRoomRequest { name: "  ".into(), kind: SharedRoomKind::Open, member_ids: vec![] };
        assert!(req.validate().is_err());
    }
}
