use anyhow::Result;
use rusqlite::types::Type;
use rusqlite::{Connection, Row};
use std::str::FromStr;
use uuid::Uuid;

use ember_types::models::{Membership, Message, ParseEnumError, Room, Session, User};

use crate::Database;

pub(crate) const USER_COLUMNS: &str = "id, name, role, active, created_at";
pub(crate) const ROOM_COLUMNS: &str = "id, name, kind, creator_id, last_message_at, created_at";
pub(crate) const MEMBERSHIP_COLUMNS: &str =
    "user_id, room_id, involvement, connections, connected_at, last_read_at";
const MESSAGE_SELECT: &str = "SELECT m.id, m.room_id, m.creator_id, u.name, m.body, m.correlation_id, m.created_at, m.updated_at
     FROM messages m
     JOIN users u ON u.id = m.creator_id";

impl Database {
    // -- Users --

    pub fn get_user(&self, id: Uuid) -> Result<Option<User>> {
        self.with_conn(|conn| query_user(conn, id))
    }

    /// Look up a user and their password hash by login name.
    pub fn get_user_credentials(&self, name: &str) -> Result<Option<(User, Option<String>)>> {
        self.with_conn(|conn| {
            conn.query_row(
                &format!("SELECT {USER_COLUMNS}, password FROM users WHERE name = ?1"),
                [name],
                |row| Ok((map_user(row, 0)?, row.get(5)?)),
            )
            .optional()
        })
    }

    // -- Sessions --

    /// Resolve a stored token hash to its session and owner.
    pub fn find_session(&self, token_hash: &str) -> Result<Option<(Session, User)>> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT s.id, s.user_id, s.created_at, s.last_active_at,
                        u.id, u.name, u.role, u.active, u.created_at
                 FROM sessions s
                 JOIN users u ON u.id = s.user_id
                 WHERE s.token_hash = ?1",
                [token_hash],
                |row| Ok((map_session(row, 0)?, map_user(row, 4)?)),
            )
            .optional()
        })
    }

    // -- Rooms & memberships --

    pub fn get_room(&self, id: Uuid) -> Result<Option<Room>> {
        self.with_conn(|conn| query_room(conn, id))
    }

    pub fn get_membership(&self, user_id: Uuid, room_id: Uuid) -> Result<Option<Membership>> {
        self.with_conn(|conn| query_membership(conn, user_id, room_id))
    }

    /// Every room the user belongs to, most recently active first.
    pub fn list_rooms_for_user(&self, user_id: Uuid) -> Result<Vec<(Room, Membership)>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT r.id, r.name, r.kind, r.creator_id, r.last_message_at, r.created_at,
                        mb.user_id, mb.room_id, mb.involvement, mb.connections, mb.connected_at, mb.last_read_at
                 FROM memberships mb
                 JOIN rooms r ON r.id = mb.room_id
                 WHERE mb.user_id = ?1
                 ORDER BY COALESCE(r.last_message_at, r.created_at) DESC",
            )?;

            let rows = stmt
                .query_map([user_id], |row| Ok((map_room(row, 0)?, map_membership(row, 6)?)))?
                .collect::<std::result::Result<Vec<_>, _>>()?;

            Ok(rows)
        })
    }

    // -- Messages --

    pub fn get_message(&self, id: Uuid) -> Result<Option<Message>> {
        self.with_conn(|conn| query_message(conn, id))
    }

    /// One page of history, oldest first. With `before`, only messages
    /// committed before that message are returned; an id that isn't in the
    /// room yields an empty page.
    pub fn get_messages(
        &self,
        room_id: Uuid,
        before: Option<Uuid>,
        limit: u32,
    ) -> Result<Vec<Message>> {
        self.with_conn(|conn| query_messages_before(conn, room_id, before, limit))
    }

    /// Messages committed after `last_seen_id`, oldest first, for a
    /// reconnecting subscriber.
    ///
    /// At most `cap` messages come back. If more than `cap` were missed, or
    /// `last_seen_id` isn't a message in this room, the most recent `cap`
    /// messages are returned instead.
    pub fn messages_since(
        &self,
        room_id: Uuid,
        last_seen_id: Uuid,
        cap: usize,
    ) -> Result<Vec<Message>> {
        let cap = u32::try_from(cap).unwrap_or(u32::MAX);
        self.with_conn(|conn| {
            let anchor: Option<i64> = conn
                .query_row(
                    "SELECT seq FROM messages WHERE id = ?1 AND room_id = ?2",
                    rusqlite::params![last_seen_id, room_id],
                    |row| row.get(0),
                )
                .optional()?;

            let Some(anchor) = anchor else {
                return query_messages_before(conn, room_id, None, cap);
            };

            let mut stmt = conn.prepare(&format!(
                "{MESSAGE_SELECT}
                 WHERE m.room_id = ?1 AND m.seq > ?2
                 ORDER BY m.seq ASC
                 LIMIT ?3"
            ))?;
            let rows = stmt
                .query_map(
                    rusqlite::params![room_id, anchor, i64::from(cap) + 1],
                    map_message,
                )?
                .collect::<std::result::Result<Vec<_>, _>>()?;

            if rows.len() > cap as usize {
                return query_messages_before(conn, room_id, None, cap);
            }
            Ok(rows)
        })
    }

    pub fn count_messages(&self, room_id: Uuid) -> Result<usize> {
        self.with_conn(|conn| {
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM messages WHERE room_id = ?1",
                [room_id],
                |row| row.get(0),
            )?;
            Ok(count as usize)
        })
    }
}

pub(crate) fn query_user(conn: &Connection, id: Uuid) -> Result<Option<User>> {
    conn.query_row(
        &format!("SELECT {USER_COLUMNS} FROM users WHERE id = ?1"),
        [id],
        |row| map_user(row, 0),
    )
    .optional()
}

pub(crate) fn query_room(conn: &Connection, id: Uuid) -> Result<Option<Room>> {
    conn.query_row(
        &format!("SELECT {ROOM_COLUMNS} FROM rooms WHERE id = ?1"),
        [id],
        |row| map_room(row, 0),
    )
    .optional()
}

pub(crate) fn query_membership(
    conn: &Connection,
    user_id: Uuid,
    room_id: Uuid,
) -> Result<Option<Membership>> {
    conn.query_row(
        &format!("SELECT {MEMBERSHIP_COLUMNS} FROM memberships WHERE user_id = ?1 AND room_id = ?2"),
        rusqlite::params![user_id, room_id],
        |row| map_membership(row, 0),
    )
    .optional()
}

pub(crate) fn query_message(conn: &Connection, id: Uuid) -> Result<Option<Message>> {
    conn.query_row(&format!("{MESSAGE_SELECT} WHERE m.id = ?1"), [id], map_message)
        .optional()
}

pub(crate) fn query_message_by_correlation(
    conn: &Connection,
    room_id: Uuid,
    correlation_id: &str,
) -> Result<Option<Message>> {
    conn.query_row(
        &format!("{MESSAGE_SELECT} WHERE m.room_id = ?1 AND m.correlation_id = ?2"),
        rusqlite::params![room_id, correlation_id],
        map_message,
    )
    .optional()
}

fn query_messages_before(
    conn: &Connection,
    room_id: Uuid,
    before: Option<Uuid>,
    limit: u32,
) -> Result<Vec<Message>> {
    let mut rows = match before {
        Some(before) => {
            let mut stmt = conn.prepare(&format!(
                "{MESSAGE_SELECT}
                 WHERE m.room_id = ?1
                   AND m.seq < (SELECT seq FROM messages WHERE id = ?2 AND room_id = ?1)
                 ORDER BY m.seq DESC
                 LIMIT ?3"
            ))?;
            stmt.query_map(rusqlite::params![room_id, before, limit], map_message)?
                .collect::<std::result::Result<Vec<_>, _>>()?
        }
        None => {
            let mut stmt = conn.prepare(&format!(
                "{MESSAGE_SELECT}
                 WHERE m.room_id = ?1
                 ORDER BY m.seq DESC
                 LIMIT ?2"
            ))?;
            stmt.query_map(rusqlite::params![room_id, limit], map_message)?
                .collect::<std::result::Result<Vec<_>, _>>()?
        }
    };

    // Fetched newest first so LIMIT keeps the latest; hand back oldest first.
    rows.reverse();
    Ok(rows)
}

// -- Row mapping --

pub(crate) fn map_user(row: &Row, offset: usize) -> rusqlite::Result<User> {
    Ok(User {
        id: row.get(offset)?,
        name: row.get(offset + 1)?,
        role: enum_col(row, offset + 2)?,
        active: row.get(offset + 3)?,
        created_at: row.get(offset + 4)?,
    })
}

pub(crate) fn map_room(row: &Row, offset: usize) -> rusqlite::Result<Room> {
    Ok(Room {
        id: row.get(offset)?,
        name: row.get(offset + 1)?,
        kind: enum_col(row, offset + 2)?,
        creator_id: row.get(offset + 3)?,
        last_message_at: row.get(offset + 4)?,
        created_at: row.get(offset + 5)?,
    })
}

pub(crate) fn map_membership(row: &Row, offset: usize) -> rusqlite::Result<Membership> {
    Ok(Membership {
        user_id: row.get(offset)?,
        room_id: row.get(offset + 1)?,
        involvement: enum_col(row, offset + 2)?,
        connections: row.get(offset + 3)?,
        connected_at: row.get(offset + 4)?,
        last_read_at: row.get(offset + 5)?,
    })
}

pub(crate) fn map_session(row: &Row, offset: usize) -> rusqlite::Result<Session> {
    Ok(Session {
        id: row.get(offset)?,
        user_id: row.get(offset + 1)?,
        created_at: row.get(offset + 2)?,
        last_active_at: row.get(offset + 3)?,
    })
}

fn map_message(row: &Row) -> rusqlite::Result<Message> {
    Ok(Message {
        id: row.get(0)?,
        room_id: row.get(1)?,
        creator_id: row.get(2)?,
        creator_name: row.get(3)?,
        body: row.get(4)?,
        correlation_id: row.get(5)?,
        created_at: row.get(6)?,
        updated_at: row.get(7)?,
    })
}

/// Read a TEXT column holding one of our enum names.
fn enum_col<T>(row: &Row, idx: usize) -> rusqlite::Result<T>
where
    T: FromStr<Err = ParseEnumError>,
{
    let raw: String = row.get(idx)?;
    raw.parse()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

/// Extension trait for optional query results
pub(crate) trait OptionalExt<T> {
    fn optional(self) -> Result<Option<T>>;
}

impl<T> OptionalExt<T> for std::result::Result<T, rusqlite::Error> {
    fn optional(self) -> Result<Option<T>> {
        match self {
            Ok(val) => Ok(Some(val)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}
