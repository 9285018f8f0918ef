//! Store mutations. Crate-private: only the writer task calls these, one at
//! a time, on the writer connection.

use anyhow::{Result, anyhow};
use chrono::{DateTime, Utc};
use rusqlite::{Connection, ErrorCode};
use uuid::Uuid;

use ember_types::models::{Involvement, Membership, Message, Role, Room, RoomKind, Session, User};

use crate::Database;
use crate::models::{CreateOutcome, NewMessage, NewRoom, NewUser};
use crate::queries::{
    OptionalExt, query_membership, query_message, query_message_by_correlation, query_room,
    query_user,
};

impl Database {
    // -- Users --

    /// The first user ever created is promoted to administrator. New users
    /// join every open room.
    pub(crate) fn insert_user(&self, new: &NewUser, now: DateTime<Utc>) -> Result<User> {
        self.with_conn_mut(|conn| {
            let tx = conn.unchecked_transaction()?;

            let existing: i64 = tx.query_row("SELECT COUNT(*) FROM users", [], |r| r.get(0))?;
            let role = if existing == 0 { Role::Administrator } else { new.role };

            let id = Uuid::new_v4();
            tx.execute(
                "INSERT INTO users (id, name, password, role, active, created_at)
                 VALUES (?1, ?2, ?3, ?4, 1, ?5)",
                rusqlite::params![id, new.name, new.password_hash, role.as_str(), now],
            )?;
            tx.execute(
                "INSERT INTO memberships (user_id, room_id, involvement, created_at)
                 SELECT ?1, id, ?2, ?3 FROM rooms WHERE kind = 'open'",
                rusqlite::params![id, Involvement::default_for(RoomKind::Open).as_str(), now],
            )?;

            let user = query_user(&tx, id)?.ok_or_else(|| anyhow!("user {} vanished", id))?;
            tx.commit()?;
            Ok(user)
        })
    }

    /// Soft-deactivate a user and drop their sessions.
    pub(crate) fn deactivate_user(&self, id: Uuid) -> Result<Option<User>> {
        self.with_conn_mut(|conn| {
            let tx = conn.unchecked_transaction()?;
            if tx.execute("UPDATE users SET active = 0 WHERE id = ?1", [id])? == 0 {
                return Ok(None);
            }
            tx.execute("DELETE FROM sessions WHERE user_id = ?1", [id])?;
            let user = query_user(&tx, id)?;
            tx.commit()?;
            Ok(user)
        })
    }

    // -- Sessions --

    pub(crate) fn insert_session(
        &self,
        user_id: Uuid,
        token_hash: &str,
        now: DateTime<Utc>,
    ) -> Result<Session> {
        self.with_conn_mut(|conn| {
            let id = Uuid::new_v4();
            conn.execute(
                "INSERT INTO sessions (id, user_id, token_hash, created_at, last_active_at)
                 VALUES (?1, ?2, ?3, ?4, ?4)",
                rusqlite::params![id, user_id, token_hash, now],
            )?;
            Ok(Session { id, user_id, created_at: now, last_active_at: now })
        })
    }

    pub(crate) fn touch_session(&self, id: Uuid, now: DateTime<Utc>) -> Result<bool> {
        self.with_conn_mut(|conn| {
            let n = conn.execute(
                "UPDATE sessions SET last_active_at = ?2 WHERE id = ?1",
                rusqlite::params![id, now],
            )?;
            Ok(n > 0)
        })
    }

    pub(crate) fn delete_session(&self, id: Uuid) -> Result<bool> {
        self.with_conn_mut(|conn| Ok(conn.execute("DELETE FROM sessions WHERE id = ?1", [id])? > 0))
    }

    pub(crate) fn purge_sessions_before(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        self.with_conn_mut(|conn| {
            Ok(conn.execute("DELETE FROM sessions WHERE last_active_at < ?1", [cutoff])?)
        })
    }

    // -- Rooms --

    pub(crate) fn insert_room(&self, new: &NewRoom, now: DateTime<Utc>) -> Result<Room> {
        self.with_conn_mut(|conn| {
            let tx = conn.unchecked_transaction()?;
            let id = Uuid::new_v4();
            let involvement = Involvement::default_for(new.kind);

            tx.execute(
                "INSERT INTO rooms (id, name, kind, creator_id, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                rusqlite::params![id, new.name, new.kind.as_str(), new.creator_id, now],
            )?;

            match new.kind {
                RoomKind::Open => {
                    tx.execute(
                        "INSERT INTO memberships (user_id, room_id, involvement, created_at)
                         SELECT id, ?1, ?2, ?3 FROM users WHERE active = 1",
                        rusqlite::params![id, involvement.as_str(), now],
                    )?;
                }
                RoomKind::Closed => {
                    let mut members = vec![new.creator_id];
                    members.extend(new.member_ids.iter().copied());
                    insert_memberships(&tx, id, &members, involvement, now)?;
                }
                RoomKind::Direct => {
                    return Err(anyhow!("direct rooms are created by participant set"));
                }
            }

            let room = query_room(&tx, id)?.ok_or_else(|| anyhow!("room {} vanished", id))?;
            tx.commit()?;
            Ok(room)
        })
    }

    /// Returns the direct room for exactly this participant set, creating it
    /// if needed. The bool is true when the room was created.
    pub(crate) fn find_or_insert_direct_room(
        &self,
        creator_id: Uuid,
        participants: &[Uuid],
        now: DateTime<Utc>,
    ) -> Result<(Room, bool)> {
        let key = direct_key(participants);
        self.with_conn_mut(|conn| {
            let existing: Option<Uuid> = conn
                .query_row("SELECT id FROM rooms WHERE direct_key = ?1", [&key], |r| r.get(0))
                .optional()?;
            if let Some(id) = existing {
                let room = query_room(conn, id)?.ok_or_else(|| anyhow!("room {} vanished", id))?;
                return Ok((room, false));
            }

            let tx = conn.unchecked_transaction()?;
            let id = Uuid::new_v4();
            tx.execute(
                "INSERT INTO rooms (id, name, kind, creator_id, direct_key, created_at)
                 VALUES (?1, NULL, ?2, ?3, ?4, ?5)",
                rusqlite::params![id, RoomKind::Direct.as_str(), creator_id, key, now],
            )?;
            insert_memberships(
                &tx,
                id,
                participants,
                Involvement::default_for(RoomKind::Direct),
                now,
            )?;
            let room = query_room(&tx, id)?.ok_or_else(|| anyhow!("room {} vanished", id))?;
            tx.commit()?;
            Ok((room, true))
        })
    }

    // -- Memberships --

    /// Adds members to a room, skipping users who already belong. Returns
    /// only the memberships that were created.
    pub(crate) fn insert_members(
        &self,
        room_id: Uuid,
        user_ids: &[Uuid],
        now: DateTime<Utc>,
    ) -> Result<Option<Vec<Membership>>> {
        self.with_conn_mut(|conn| {
            let tx = conn.unchecked_transaction()?;
            let Some(room) = query_room(&tx, room_id)? else {
                return Ok(None);
            };
            let added = insert_memberships(
                &tx,
                room_id,
                user_ids,
                Involvement::default_for(room.kind),
                now,
            )?;
            tx.commit()?;
            Ok(Some(added))
        })
    }

    pub(crate) fn update_involvement(
        &self,
        user_id: Uuid,
        room_id: Uuid,
        involvement: Involvement,
    ) -> Result<Option<Membership>> {
        self.with_conn_mut(|conn| {
            conn.execute(
                "UPDATE memberships SET involvement = ?3 WHERE user_id = ?1 AND room_id = ?2",
                rusqlite::params![user_id, room_id, involvement.as_str()],
            )?;
            query_membership(conn, user_id, room_id)
        })
    }

    pub(crate) fn update_last_read(
        &self,
        user_id: Uuid,
        room_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Option<Membership>> {
        self.with_conn_mut(|conn| {
            conn.execute(
                "UPDATE memberships SET last_read_at = ?3 WHERE user_id = ?1 AND room_id = ?2",
                rusqlite::params![user_id, room_id, now],
            )?;
            query_membership(conn, user_id, room_id)
        })
    }

    /// Bump the live socket counter for (user, room) by +1 or -1, never
    /// below zero. Connecting also stamps `connected_at`.
    pub(crate) fn adjust_connections(
        &self,
        user_id: Uuid,
        room_id: Uuid,
        connected: bool,
        now: DateTime<Utc>,
    ) -> Result<Option<Membership>> {
        self.with_conn_mut(|conn| {
            if connected {
                conn.execute(
                    "UPDATE memberships SET connections = connections + 1, connected_at = ?3
                     WHERE user_id = ?1 AND room_id = ?2",
                    rusqlite::params![user_id, room_id, now],
                )?;
            } else {
                conn.execute(
                    "UPDATE memberships SET connections = MAX(connections - 1, 0)
                     WHERE user_id = ?1 AND room_id = ?2",
                    rusqlite::params![user_id, room_id],
                )?;
            }
            query_membership(conn, user_id, room_id)
        })
    }

    pub(crate) fn reset_connections(&self) -> Result<usize> {
        self.with_conn_mut(|conn| {
            Ok(conn.execute("UPDATE memberships SET connections = 0 WHERE connections > 0", [])?)
        })
    }

    // -- Messages --

    /// Insert a message unless (room, correlation id) is already taken, in
    /// which case the stored message comes back untouched.
    pub(crate) fn insert_message_dedup(
        &self,
        new: &NewMessage,
        now: DateTime<Utc>,
    ) -> Result<CreateOutcome> {
        self.with_conn_mut(|conn| {
            if let Some(existing) =
                query_message_by_correlation(conn, new.room_id, &new.correlation_id)?
            {
                return Ok(CreateOutcome::Existing(existing));
            }

            let tx = conn.unchecked_transaction()?;
            let id = Uuid::new_v4();
            let inserted = tx.execute(
                "INSERT INTO messages (id, room_id, creator_id, body, correlation_id, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)",
                rusqlite::params![id, new.room_id, new.creator_id, new.body, new.correlation_id, now],
            );

            match inserted {
                Ok(_) => {}
                Err(rusqlite::Error::SqliteFailure(e, _)) if e.code == ErrorCode::ConstraintViolation => {
                    drop(tx);
                    // Lost a race on the unique key: same as finding it up front.
                    return query_message_by_correlation(conn, new.room_id, &new.correlation_id)?
                        .map(CreateOutcome::Existing)
                        .ok_or_else(|| anyhow!("message insert violated a constraint"));
                }
                Err(e) => return Err(e.into()),
            }

            tx.execute(
                "UPDATE rooms SET last_message_at = ?2 WHERE id = ?1",
                rusqlite::params![new.room_id, now],
            )?;

            let message = query_message(&tx, id)?.ok_or_else(|| anyhow!("message {} vanished", id))?;
            tx.commit()?;
            Ok(CreateOutcome::Created(message))
        })
    }

    pub(crate) fn update_message_body(
        &self,
        id: Uuid,
        body: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<Message>> {
        self.with_conn_mut(|conn| {
            let n = conn.execute(
                "UPDATE messages SET body = ?2, updated_at = ?3 WHERE id = ?1",
                rusqlite::params![id, body, now],
            )?;
            if n == 0 {
                return Ok(None);
            }
            query_message(conn, id)
        })
    }
}

fn insert_memberships(
    conn: &Connection,
    room_id: Uuid,
    user_ids: &[Uuid],
    involvement: Involvement,
    now: DateTime<Utc>,
) -> Result<Vec<Membership>> {
    let mut stmt = conn.prepare(
        "INSERT OR IGNORE INTO memberships (user_id, room_id, involvement, created_at)
         VALUES (?1, ?2, ?3, ?4)",
    )?;

    let mut added = Vec::new();
    for &user_id in user_ids {
        if stmt.execute(rusqlite::params![user_id, room_id, involvement.as_str(), now])? > 0 {
            if let Some(m) = query_membership(conn, user_id, room_id)? {
                added.push(m);
            }
        }
    }
    Ok(added)
}

/// Canonical key for a direct room's participant set: sorted, deduplicated
/// ids joined by commas.
pub(crate) fn direct_key(participants: &[Uuid]) -> String {
    let mut ids: Vec<Uuid> = participants.to_vec();
    ids.sort();
    ids.dedup();
    ids.iter().map(Uuid::to_string).collect::<Vec<_>>().join(",")
}
