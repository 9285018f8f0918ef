use anyhow::Result;
use rusqlite::Connection;
use tracing::info;

pub fn run(conn: &Connection) -> Result<()> {
    conn.execute_batch("CREATE TABLE IF NOT EXISTS schema_version (version INTEGER NOT NULL);")?;

    let version: i64 = conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_version",
        [],
        |r| r.get(0),
    )?;

    if version < 1 {
        info!("Running migration v1 (initial schema)");
        conn.execute_batch(
            "
            BEGIN;

            CREATE TABLE users (
                id          BLOB PRIMARY KEY,
                name        TEXT NOT NULL UNIQUE,
                password    TEXT,
                role        TEXT NOT NULL,
                active      INTEGER NOT NULL DEFAULT 1,
                created_at  TEXT NOT NULL
            );

            CREATE TABLE rooms (
                id              BLOB PRIMARY KEY,
                name            TEXT,
                kind            TEXT NOT NULL,
                creator_id      BLOB NOT NULL REFERENCES users(id),
                -- sorted participant ids, set for direct rooms only
                direct_key      TEXT UNIQUE,
                last_message_at TEXT,
                created_at      TEXT NOT NULL
            );

            CREATE TABLE memberships (
                user_id         BLOB NOT NULL REFERENCES users(id),
                room_id         BLOB NOT NULL REFERENCES rooms(id),
                involvement     TEXT NOT NULL,
                connections     INTEGER NOT NULL DEFAULT 0,
                connected_at    TEXT,
                last_read_at    TEXT,
                created_at      TEXT NOT NULL,
                PRIMARY KEY (user_id, room_id)
            );

            CREATE INDEX idx_memberships_room ON memberships(room_id);

            CREATE TABLE messages (
                seq             INTEGER PRIMARY KEY AUTOINCREMENT,
                id              BLOB NOT NULL UNIQUE,
                room_id         BLOB NOT NULL REFERENCES rooms(id),
                creator_id      BLOB NOT NULL REFERENCES users(id),
                body            TEXT NOT NULL,
                correlation_id  TEXT NOT NULL,
                created_at      TEXT NOT NULL,
                updated_at      TEXT NOT NULL,
                UNIQUE (room_id, correlation_id)
            );

            CREATE INDEX idx_messages_room_seq ON messages(room_id, seq);

            CREATE TABLE sessions (
                id              BLOB PRIMARY KEY,
                user_id         BLOB NOT NULL REFERENCES users(id),
                token_hash      TEXT NOT NULL UNIQUE,
                created_at      TEXT NOT NULL,
                last_active_at  TEXT NOT NULL
            );

            CREATE INDEX idx_sessions_user ON sessions(user_id);

            INSERT INTO schema_version (version) VALUES (1);

            COMMIT;
            ",
        )?;
    }

    info!("Database migrations complete");
    Ok(())
}
