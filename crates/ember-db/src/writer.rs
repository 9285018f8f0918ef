//! Single-writer serialization.
//!
//! Every mutation is submitted to one queue and executed by one task, in
//! submission order, one at a time. Each caller awaits only its own reply.
//! After a mutation commits, and before the next one starts, the resulting
//! [`Committed`] events go to the [`CommitListener`], so listeners observe
//! commits in exactly the order they happened.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use rusqlite::ErrorCode;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};
use uuid::Uuid;

use ember_types::models::{Involvement, Membership, Message, Room, Session, User};

use crate::Database;
use crate::models::{CreateOutcome, NewMessage, NewRoom, NewUser};

const QUEUE_CAPACITY: usize = 1024;

/// A committed mutation that connected clients may care about.
#[derive(Debug, Clone, PartialEq)]
pub enum Committed {
    MessageCreated(Message),
    MessageUpdated(Message),
    MembershipChanged(Membership),
}

/// Receives commits in commit order. Called from the writer task; must not
/// block.
pub trait CommitListener: Send + Sync + 'static {
    fn committed(&self, event: &Committed);
}

/// Listener that ignores everything.
pub struct NoopListener;

impl CommitListener for NoopListener {
    fn committed(&self, _event: &Committed) {}
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum WriteError {
    /// I/O or SQLite failure. Safe to retry.
    #[error("storage error: {0}")]
    Storage(String),

    /// A uniqueness or foreign-key constraint rejected the write.
    #[error("conflict: {0}")]
    Conflict(String),

    #[error("not found")]
    NotFound,

    #[error("writer is not running")]
    Closed,
}

impl WriteError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Storage(_) | Self::Closed)
    }
}

impl From<anyhow::Error> for WriteError {
    fn from(err: anyhow::Error) -> Self {
        match err.downcast_ref::<rusqlite::Error>() {
            Some(rusqlite::Error::SqliteFailure(e, _)) if e.code == ErrorCode::ConstraintViolation => {
                Self::Conflict(err.to_string())
            }
            _ => Self::Storage(err.to_string()),
        }
    }
}

struct Completion {
    events: Vec<Committed>,
    respond: Box<dyn FnOnce() + Send>,
}

type Job = Box<dyn FnOnce(&Database) -> Completion + Send>;

/// Handle to the writer task. Cheap to clone; the task stops once every
/// handle is dropped.
#[derive(Clone)]
pub struct Writer {
    tx: mpsc::Sender<Job>,
}

impl Writer {
    /// Spawn the writer task on the current runtime.
    pub fn spawn(db: Arc<Database>, listener: Arc<dyn CommitListener>) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(QUEUE_CAPACITY);
        let handle = tokio::spawn(run_writer(db, rx, listener));
        (Self { tx }, handle)
    }

    // -- Users --

    pub async fn create_user(&self, new: NewUser) -> Result<User, WriteError> {
        self.submit(move |db| Ok((db.insert_user(&new, Utc::now())?, vec![])))
            .await
    }

    pub async fn deactivate_user(&self, user_id: Uuid) -> Result<User, WriteError> {
        self.submit(move |db| {
            let user = db.deactivate_user(user_id)?.ok_or(WriteError::NotFound)?;
            Ok((user, vec![]))
        })
        .await
    }

    // -- Sessions --

    pub async fn create_session(&self, user_id: Uuid, token_hash: String) -> Result<Session, WriteError> {
        self.submit(move |db| Ok((db.insert_session(user_id, &token_hash, Utc::now())?, vec![])))
            .await
    }

    pub async fn touch_session(&self, session_id: Uuid) -> Result<(), WriteError> {
        self.submit(move |db| {
            if !db.touch_session(session_id, Utc::now())? {
                return Err(WriteError::NotFound);
            }
            Ok(((), vec![]))
        })
        .await
    }

    pub async fn expire_session(&self, session_id: Uuid) -> Result<(), WriteError> {
        self.submit(move |db| {
            db.delete_session(session_id)?;
            Ok(((), vec![]))
        })
        .await
    }

    /// Remove sessions idle since before `cutoff`. Returns how many went.
    pub async fn purge_expired_sessions(&self, cutoff: DateTime<Utc>) -> Result<usize, WriteError> {
        self.submit(move |db| Ok((db.purge_sessions_before(cutoff)?, vec![])))
            .await
    }

    // -- Rooms & memberships --

    pub async fn create_room(&self, new: NewRoom) -> Result<Room, WriteError> {
        self.submit(move |db| Ok((db.insert_room(&new, Utc::now())?, vec![])))
            .await
    }

    /// Returns `(room, created)`.
    pub async fn find_or_create_direct_room(
        &self,
        creator_id: Uuid,
        participants: Vec<Uuid>,
    ) -> Result<(Room, bool), WriteError> {
        self.submit(move |db| {
            let found = db.find_or_insert_direct_room(creator_id, &participants, Utc::now())?;
            Ok((found, vec![]))
        })
        .await
    }

    pub async fn add_members(
        &self,
        room_id: Uuid,
        user_ids: Vec<Uuid>,
    ) -> Result<Vec<Membership>, WriteError> {
        self.submit(move |db| {
            let added = db
                .insert_members(room_id, &user_ids, Utc::now())?
                .ok_or(WriteError::NotFound)?;
            let events = added.iter().cloned().map(Committed::MembershipChanged).collect();
            Ok((added, events))
        })
        .await
    }

    pub async fn set_involvement(
        &self,
        user_id: Uuid,
        room_id: Uuid,
        involvement: Involvement,
    ) -> Result<Membership, WriteError> {
        self.submit(move |db| {
            let membership = db
                .update_involvement(user_id, room_id, involvement)?
                .ok_or(WriteError::NotFound)?;
            Ok((membership.clone(), vec![Committed::MembershipChanged(membership)]))
        })
        .await
    }

    pub async fn mark_read(&self, user_id: Uuid, room_id: Uuid) -> Result<Membership, WriteError> {
        self.submit(move |db| {
            let membership = db
                .update_last_read(user_id, room_id, Utc::now())?
                .ok_or(WriteError::NotFound)?;
            Ok((membership, vec![]))
        })
        .await
    }

    /// A socket for this user subscribed to the room.
    pub async fn membership_connected(
        &self,
        user_id: Uuid,
        room_id: Uuid,
    ) -> Result<Membership, WriteError> {
        self.adjust_connections(user_id, room_id, true).await
    }

    /// A socket for this user left the room. Floors at zero.
    pub async fn membership_disconnected(
        &self,
        user_id: Uuid,
        room_id: Uuid,
    ) -> Result<Membership, WriteError> {
        self.adjust_connections(user_id, room_id, false).await
    }

    async fn adjust_connections(
        &self,
        user_id: Uuid,
        room_id: Uuid,
        connected: bool,
    ) -> Result<Membership, WriteError> {
        self.submit(move |db| {
            let membership = db
                .adjust_connections(user_id, room_id, connected, Utc::now())?
                .ok_or(WriteError::NotFound)?;
            Ok((membership, vec![]))
        })
        .await
    }

    /// Zero every connection counter. Run once at startup: no socket
    /// survives a restart.
    pub async fn reset_connections(&self) -> Result<usize, WriteError> {
        self.submit(move |db| Ok((db.reset_connections()?, vec![])))
            .await
    }

    // -- Messages --

    /// Create a message, or return the stored one if this (room,
    /// correlation id) was already submitted. Only a real insert is
    /// announced to the listener.
    pub async fn create_message(&self, new: NewMessage) -> Result<CreateOutcome, WriteError> {
        self.submit(move |db| {
            let outcome = db.insert_message_dedup(&new, Utc::now())?;
            let events = match &outcome {
                CreateOutcome::Created(m) => vec![Committed::MessageCreated(m.clone())],
                CreateOutcome::Existing(m) => {
                    debug!("Dedup hit for correlation id {} in room {}", m.correlation_id, m.room_id);
                    vec![]
                }
            };
            Ok((outcome, events))
        })
        .await
    }

    pub async fn update_message(&self, message_id: Uuid, body: String) -> Result<Message, WriteError> {
        self.submit(move |db| {
            let message = db
                .update_message_body(message_id, &body, Utc::now())?
                .ok_or(WriteError::NotFound)?;
            Ok((message.clone(), vec![Committed::MessageUpdated(message)]))
        })
        .await
    }

    /// Queue one operation and wait for its result.
    async fn submit<T, F>(&self, op: F) -> Result<T, WriteError>
    where
        T: Send + 'static,
        F: FnOnce(&Database) -> Result<(T, Vec<Committed>), WriteError> + Send + 'static,
    {
        let (reply_tx, reply_rx) = oneshot::channel();

        let job: Job = Box::new(move |db: &Database| match op(db) {
            Ok((value, events)) => Completion {
                events,
                respond: Box::new(move || {
                    let _ = reply_tx.send(Ok(value));
                }),
            },
            Err(e) => Completion {
                events: vec![],
                respond: Box::new(move || {
                    let _ = reply_tx.send(Err(e));
                }),
            },
        });

        self.tx.send(job).await.map_err(|_| WriteError::Closed)?;
        reply_rx.await.map_err(|_| WriteError::Closed)?
    }
}

async fn run_writer(
    db: Arc<Database>,
    mut rx: mpsc::Receiver<Job>,
    listener: Arc<dyn CommitListener>,
) {
    info!("Writer task started");

    while let Some(job) = rx.recv().await {
        let db = db.clone();
        let completion = match tokio::task::spawn_blocking(move || job(&*db)).await {
            Ok(completion) => completion,
            Err(e) => {
                // The reply sender went down with the job; the caller sees Closed.
                error!("Write job failed to complete: {}", e);
                continue;
            }
        };

        for event in &completion.events {
            listener.committed(event);
        }
        (completion.respond)();
    }

    info!("Writer queue closed, writer task stopping");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::open_temp;
    use ember_types::models::{Role, RoomKind};
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<Committed>>,
    }

    impl CommitListener for Recorder {
        fn committed(&self, event: &Committed) {
            self.events.lock().unwrap().push(event.clone());
        }
    }

    impl Recorder {
        fn created_ids(&self) -> Vec<Uuid> {
            self.events
                .lock()
                .unwrap()
                .iter()
                .filter_map(|e| match e {
                    Committed::MessageCreated(m) => Some(m.id),
                    _ => None,
                })
                .collect()
        }
    }

    async fn user(writer: &Writer, name: &str) -> User {
        writer
            .create_user(NewUser { name: name.into(), password_hash: None, role: Role::Member })
            .await
            .unwrap()
    }

    async fn open_room(writer: &Writer, creator: &User) -> Room {
        writer
            .create_room(NewRoom {
                name: "lobby".into(),
                kind: RoomKind::Open,
                creator_id: creator.id,
                member_ids: vec![],
            })
            .await
            .unwrap()
    }

    fn message(room: &Room, creator: &User, body: &str, correlation_id: &str) -> NewMessage {
        NewMessage {
            room_id: room.id,
            creator_id: creator.id,
            body: body.into(),
            correlation_id: correlation_id.into(),
        }
    }

    #[tokio::test]
    async fn resubmission_returns_the_original_message() {
        let (db, _dir) = open_temp();
        let recorder = Arc::new(Recorder::default());
        let (writer, _task) = Writer::spawn(db.clone(), recorder.clone());

        let alice = user(&writer, "alice").await;
        let room = open_room(&writer, &alice).await;

        let first = writer.create_message(message(&room, &alice, "hi", "c1")).await.unwrap();
        let second = writer
            .create_message(message(&room, &alice, "something else", "c1"))
            .await
            .unwrap();

        assert!(first.is_created());
        assert!(!second.is_created());
        assert_eq!(first.message(), second.message());
        assert_eq!(second.message().body, "hi");
        assert_eq!(db.count_messages(room.id).unwrap(), 1);
        assert_eq!(recorder.created_ids(), vec![first.message().id]);
    }

    #[tokio::test]
    async fn concurrent_duplicates_persist_exactly_one_message() {
        let (db, _dir) = open_temp();
        let (writer, _task) = Writer::spawn(db.clone(), Arc::new(NoopListener));

        let alice = user(&writer, "alice").await;
        let room = open_room(&writer, &alice).await;

        let mut tasks = Vec::new();
        for i in 0..16 {
            let writer = writer.clone();
            let new = message(&room, &alice, &format!("attempt {i}"), "same");
            tasks.push(tokio::spawn(async move { writer.create_message(new).await }));
        }

        let mut ids = Vec::new();
        let mut created = 0;
        for task in tasks {
            let outcome = task.await.unwrap().unwrap();
            if outcome.is_created() {
                created += 1;
            }
            ids.push(outcome.message().id);
        }

        assert_eq!(created, 1);
        ids.dedup();
        assert_eq!(ids.len(), 1);
        assert_eq!(db.count_messages(room.id).unwrap(), 1);
    }

    #[tokio::test]
    async fn same_correlation_id_in_another_room_is_a_new_message() {
        let (db, _dir) = open_temp();
        let (writer, _task) = Writer::spawn(db.clone(), Arc::new(NoopListener));

        let alice = user(&writer, "alice").await;
        let a = open_room(&writer, &alice).await;
        let b = open_room(&writer, &alice).await;

        let in_a = writer.create_message(message(&a, &alice, "hi", "c1")).await.unwrap();
        let in_b = writer.create_message(message(&b, &alice, "hi", "c1")).await.unwrap();

        assert!(in_a.is_created() && in_b.is_created());
        assert_ne!(in_a.message().id, in_b.message().id);
    }

    #[tokio::test]
    async fn listener_sees_commits_in_commit_order() {
        let (db, _dir) = open_temp();
        let recorder = Arc::new(Recorder::default());
        let (writer, _task) = Writer::spawn(db.clone(), recorder.clone());

        let alice = user(&writer, "alice").await;
        let room = open_room(&writer, &alice).await;

        let mut tasks = Vec::new();
        for i in 0..20 {
            let writer = writer.clone();
            let new = message(&room, &alice, "hi", &format!("c{i}"));
            tasks.push(tokio::spawn(async move { writer.create_message(new).await }));
        }
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        let stored: Vec<Uuid> = db
            .get_messages(room.id, None, 100)
            .unwrap()
            .into_iter()
            .map(|m| m.id)
            .collect();
        assert_eq!(recorder.created_ids(), stored);
    }

    #[tokio::test]
    async fn creating_a_message_bumps_room_last_message_at() {
        let (db, _dir) = open_temp();
        let (writer, _task) = Writer::spawn(db.clone(), Arc::new(NoopListener));

        let alice = user(&writer, "alice").await;
        let room = open_room(&writer, &alice).await;
        assert!(room.last_message_at.is_none());

        let outcome = writer.create_message(message(&room, &alice, "hi", "c1")).await.unwrap();
        let room = db.get_room(room.id).unwrap().unwrap();
        assert_eq!(room.last_message_at, Some(outcome.message().created_at));
    }

    #[tokio::test]
    async fn first_user_is_administrator_and_joins_open_rooms() {
        let (db, _dir) = open_temp();
        let (writer, _task) = Writer::spawn(db.clone(), Arc::new(NoopListener));

        let alice = user(&writer, "alice").await;
        assert_eq!(alice.role, Role::Administrator);

        let room = open_room(&writer, &alice).await;
        let bob = user(&writer, "bob").await;
        assert_eq!(bob.role, Role::Member);

        let membership = db.get_membership(bob.id, room.id).unwrap().unwrap();
        assert_eq!(membership.involvement, Involvement::Mentions);
        assert_eq!(membership.connections, 0);
    }

    #[tokio::test]
    async fn duplicate_user_name_is_a_conflict() {
        let (db, _dir) = open_temp();
        let (writer, _task) = Writer::spawn(db, Arc::new(NoopListener));

        user(&writer, "alice").await;
        let err = writer
            .create_user(NewUser { name: "alice".into(), password_hash: None, role: Role::Member })
            .await
            .unwrap_err();
        assert!(matches!(err, WriteError::Conflict(_)));
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn direct_room_is_unique_per_participant_set() {
        let (db, _dir) = open_temp();
        let (writer, _task) = Writer::spawn(db.clone(), Arc::new(NoopListener));

        let alice = user(&writer, "alice").await;
        let bob = user(&writer, "bob").await;
        let carol = user(&writer, "carol").await;

        let (first, created) = writer
            .find_or_create_direct_room(alice.id, vec![alice.id, bob.id])
            .await
            .unwrap();
        assert!(created);
        assert_eq!(first.kind, RoomKind::Direct);
        assert!(first.name.is_none());

        let (again, created) = writer
            .find_or_create_direct_room(bob.id, vec![bob.id, alice.id])
            .await
            .unwrap();
        assert!(!created);
        assert_eq!(again.id, first.id);

        let (group, created) = writer
            .find_or_create_direct_room(alice.id, vec![alice.id, bob.id, carol.id])
            .await
            .unwrap();
        assert!(created);
        assert_ne!(group.id, first.id);

        let membership = db.get_membership(bob.id, first.id).unwrap().unwrap();
        assert_eq!(membership.involvement, Involvement::Everything);
    }

    #[tokio::test]
    async fn connection_counter_floors_at_zero() {
        let (db, _dir) = open_temp();
        let (writer, _task) = Writer::spawn(db.clone(), Arc::new(NoopListener));

        let alice = user(&writer, "alice").await;
        let room = open_room(&writer, &alice).await;

        let m = writer.membership_connected(alice.id, room.id).await.unwrap();
        assert_eq!(m.connections, 1);
        assert!(m.connected_at.is_some());
        let m = writer.membership_connected(alice.id, room.id).await.unwrap();
        assert_eq!(m.connections, 2);

        writer.membership_disconnected(alice.id, room.id).await.unwrap();
        writer.membership_disconnected(alice.id, room.id).await.unwrap();
        let m = writer.membership_disconnected(alice.id, room.id).await.unwrap();
        assert_eq!(m.connections, 0);

        writer.membership_connected(alice.id, room.id).await.unwrap();
        assert_eq!(writer.reset_connections().await.unwrap(), 1);
        assert_eq!(db.get_membership(alice.id, room.id).unwrap().unwrap().connections, 0);
    }

    #[tokio::test]
    async fn involvement_change_is_announced() {
        let (db, _dir) = open_temp();
        let recorder = Arc::new(Recorder::default());
        let (writer, _task) = Writer::spawn(db, recorder.clone());

        let alice = user(&writer, "alice").await;
        let room = open_room(&writer, &alice).await;

        let m = writer
            .set_involvement(alice.id, room.id, Involvement::Invisible)
            .await
            .unwrap();
        assert_eq!(m.involvement, Involvement::Invisible);
        assert_eq!(
            recorder.events.lock().unwrap().last(),
            Some(&Committed::MembershipChanged(m))
        );
    }

    #[tokio::test]
    async fn closed_room_members_can_be_added_once() {
        let (db, _dir) = open_temp();
        let (writer, _task) = Writer::spawn(db.clone(), Arc::new(NoopListener));

        let alice = user(&writer, "alice").await;
        let bob = user(&writer, "bob").await;
        let room = writer
            .create_room(NewRoom {
                name: "secret".into(),
                kind: RoomKind::Closed,
                creator_id: alice.id,
                member_ids: vec![],
            })
            .await
            .unwrap();
        assert!(db.get_membership(bob.id, room.id).unwrap().is_none());

        let added = writer.add_members(room.id, vec![bob.id, alice.id]).await.unwrap();
        assert_eq!(added.len(), 1);
        assert_eq!(added[0].user_id, bob.id);

        let added = writer.add_members(room.id, vec![bob.id]).await.unwrap();
        assert!(added.is_empty());
    }

    #[tokio::test]
    async fn editing_publishes_the_updated_message() {
        let (db, _dir) = open_temp();
        let recorder = Arc::new(Recorder::default());
        let (writer, _task) = Writer::spawn(db.clone(), recorder.clone());

        let alice = user(&writer, "alice").await;
        let room = open_room(&writer, &alice).await;
        let original = writer.create_message(message(&room, &alice, "helo", "c1")).await.unwrap();
        let original = original.message().clone();

        let edited = writer.update_message(original.id, "hello".into()).await.unwrap();
        assert_eq!(edited.id, original.id);
        assert_eq!(edited.body, "hello");
        assert_eq!(edited.correlation_id, original.correlation_id);
        assert_eq!(db.get_message(original.id).unwrap().unwrap().body, "hello");

        let events = recorder.events.lock().unwrap().clone();
        assert_eq!(events.last(), Some(&Committed::MessageUpdated(edited)));
    }

    #[tokio::test]
    async fn catch_up_from_an_unknown_pointer_returns_the_latest() {
        let (db, _dir) = open_temp();
        let (writer, _task) = Writer::spawn(db.clone(), Arc::new(NoopListener));

        let alice = user(&writer, "alice").await;
        let room = open_room(&writer, &alice).await;
        let other = open_room(&writer, &alice).await;
        let elsewhere = writer.create_message(message(&other, &alice, "x", "x")).await.unwrap();

        let mut ids = Vec::new();
        for i in 0..5 {
            let m = writer
                .create_message(message(&room, &alice, &format!("m{i}"), &format!("c{i}")))
                .await
                .unwrap();
            ids.push(m.message().id);
        }

        let latest: Vec<Uuid> = ids[2..].to_vec();
        let unknown: Vec<Uuid> = db
            .messages_since(room.id, Uuid::new_v4(), 3)
            .unwrap()
            .iter()
            .map(|m| m.id)
            .collect();
        assert_eq!(unknown, latest);

        // A pointer from another room is just as unknown here.
        let foreign: Vec<Uuid> = db
            .messages_since(room.id, elsewhere.message().id, 3)
            .unwrap()
            .iter()
            .map(|m| m.id)
            .collect();
        assert_eq!(foreign, latest);

        let since_second: Vec<Uuid> = db
            .messages_since(room.id, ids[1], 3)
            .unwrap()
            .iter()
            .map(|m| m.id)
            .collect();
        assert_eq!(since_second, ids[2..].to_vec());
    }

    #[tokio::test]
    async fn editing_a_missing_message_is_not_found() {
        let (db, _dir) = open_temp();
        let (writer, _task) = Writer::spawn(db, Arc::new(NoopListener));

        let err = writer.update_message(Uuid::new_v4(), "x".into()).await.unwrap_err();
        assert_eq!(err, WriteError::NotFound);
    }

    #[tokio::test]
    async fn sessions_expire_and_purge() {
        let (db, _dir) = open_temp();
        let (writer, _task) = Writer::spawn(db.clone(), Arc::new(NoopListener));

        let alice = user(&writer, "alice").await;
        let session = writer.create_session(alice.id, "hash-1".into()).await.unwrap();
        let (found, owner) = db.find_session("hash-1").unwrap().unwrap();
        assert_eq!(found.id, session.id);
        assert_eq!(owner.id, alice.id);

        let err = writer.create_session(alice.id, "hash-1".into()).await.unwrap_err();
        assert!(matches!(err, WriteError::Conflict(_)));

        let purged = writer
            .purge_expired_sessions(Utc::now() + chrono::Duration::seconds(1))
            .await
            .unwrap();
        assert_eq!(purged, 1);
        assert!(db.find_session("hash-1").unwrap().is_none());
    }

    #[tokio::test]
    async fn deactivation_drops_sessions() {
        let (db, _dir) = open_temp();
        let (writer, _task) = Writer::spawn(db.clone(), Arc::new(NoopListener));

        let alice = user(&writer, "alice").await;
        let bob = user(&writer, "bob").await;
        writer.create_session(bob.id, "bob-token".into()).await.unwrap();

        let bob = writer.deactivate_user(bob.id).await.unwrap();
        assert!(!bob.active);
        assert!(db.find_session("bob-token").unwrap().is_none());
        assert!(db.get_user(alice.id).unwrap().unwrap().active);
    }

    #[tokio::test]
    async fn dropped_writer_reports_closed() {
        let (db, _dir) = open_temp();
        let (writer, task) = Writer::spawn(db, Arc::new(NoopListener));
        task.abort();
        let _ = task.await;

        let err = writer.reset_connections().await.unwrap_err();
        assert_eq!(err, WriteError::Closed);
    }
}
