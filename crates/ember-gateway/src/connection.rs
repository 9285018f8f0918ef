use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use axum::extract::ws::{Message, WebSocket};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

use ember_types::events::{ClientCommand, ServerEvent};
use ember_types::models::{self, Involvement, User};

use crate::Gateway;
use crate::dispatcher::Dispatched;
use crate::registry::ConnectionHandle;

/// Per-connection outbound queue depth. A connection that fills it is closed
/// and has to reconnect with its last seen ids.
pub const OUTBOUND_CAPACITY: usize = 256;

/// Everything the outbound task can be asked to do.
#[derive(Debug)]
pub enum Outbound {
    /// A fanned-out event shared with other connections.
    Event(Arc<Dispatched>),
    /// An event for this connection only.
    Direct(ServerEvent),
    /// Hold back live events for `room` until its catch-up arrives. Also sent
    /// for a room that is already live when the client asks for a replay.
    BeginSubscribe { room: Uuid },
    /// Missed messages for `room`, oldest first. Releases held-back events.
    CatchUp { room: Uuid, messages: Vec<models::Message> },
    Unsubscribed { room: Uuid },
}

/// Last message id delivered per room on one connection. Shared between the
/// reader and the outbound task so a bare re-subscribe resumes from it.
#[derive(Clone, Default)]
struct SeenPointers(Arc<Mutex<HashMap<Uuid, Uuid>>>);

impl SeenPointers {
    fn get(&self, room: Uuid) -> Option<Uuid> {
        self.0.lock().unwrap_or_else(|e| e.into_inner()).get(&room).copied()
    }

    fn set(&self, room: Uuid, message_id: Uuid) {
        self.0.lock().unwrap_or_else(|e| e.into_inner()).insert(room, message_id);
    }
}

enum RoomStream {
    CatchingUp(Vec<Arc<Dispatched>>),
    Live,
}

/// Outbound-side state machine. Turns queue items into text frames, holding
/// back a room's live events while its catch-up is outstanding.
struct OutboundState {
    rooms: HashMap<Uuid, RoomStream>,
    seen: SeenPointers,
}

impl OutboundState {
    fn new(seen: SeenPointers) -> Self {
        Self { rooms: HashMap::new(), seen }
    }

    fn apply(&mut self, item: Outbound) -> Vec<Arc<str>> {
        match item {
            Outbound::Event(event) => {
                if let Some(RoomStream::CatchingUp(held)) =
                    event.room.and_then(|room| self.rooms.get_mut(&room))
                {
                    held.push(event);
                    return Vec::new();
                }
                self.note_delivered(&event);
                vec![event.json.clone()]
            }
            Outbound::Direct(event) => match serde_json::to_string(&event) {
                Ok(json) => vec![json.into()],
                Err(e) => {
                    error!("Failed to serialize direct event: {}", e);
                    Vec::new()
                }
            },
            Outbound::BeginSubscribe { room } => {
                self.rooms.insert(room, RoomStream::CatchingUp(Vec::new()));
                Vec::new()
            }
            Outbound::CatchUp { room, messages } => {
                let held = match self.rooms.remove(&room) {
                    Some(RoomStream::CatchingUp(held)) => held,
                    Some(RoomStream::Live) | None => {
                        // Unsubscribed before the catch-up landed.
                        return Vec::new();
                    }
                };

                let mut frames = Vec::with_capacity(messages.len() + held.len());
                let mut replayed = HashSet::with_capacity(messages.len());

                for message in messages {
                    replayed.insert(message.id);
                    let id = message.id;
                    match Dispatched::encode(&ServerEvent::MessageCreated { message }) {
                        Ok(event) => {
                            self.seen.set(room, id);
                            frames.push(event.json.clone());
                        }
                        Err(e) => error!("Failed to serialize catch-up message {}: {}", id, e),
                    }
                }

                for event in held {
                    if event.created_message_id.is_some_and(|id| replayed.contains(&id)) {
                        continue;
                    }
                    self.note_delivered(&event);
                    frames.push(event.json.clone());
                }

                self.rooms.insert(room, RoomStream::Live);
                frames
            }
            Outbound::Unsubscribed { room } => {
                self.rooms.remove(&room);
                Vec::new()
            }
        }
    }

    fn note_delivered(&self, event: &Dispatched) {
        if let (Some(room), Some(id)) = (event.room, event.created_message_id) {
            self.seen.set(room, id);
        }
    }
}

/// Reader-side context for one authenticated socket.
struct ConnectionContext {
    id: Uuid,
    user: User,
    gateway: Arc<Gateway>,
    tx: mpsc::Sender<Outbound>,
    seen: SeenPointers,
}

impl ConnectionContext {
    async fn reply(&self, event: ServerEvent) {
        if self.tx.send(Outbound::Direct(event)).await.is_err() {
            debug!("Connection {} outbound closed, reply dropped", self.id);
        }
    }

    async fn queue(&self, item: Outbound) {
        if self.tx.send(item).await.is_err() {
            debug!("Connection {} outbound closed", self.id);
        }
    }
}

/// Drive an authenticated WebSocket until it closes, or until its session is
/// revoked.
pub async fn handle_connection(
    socket: WebSocket,
    gateway: Arc<Gateway>,
    user: User,
    session_id: Uuid,
) {
    let conn_id = Uuid::new_v4();
    let (tx, rx) = mpsc::channel(OUTBOUND_CAPACITY);
    let seen = SeenPointers::default();

    let handle = ConnectionHandle::new(conn_id, user.id, session_id, tx.clone());
    gateway.registry.register(handle.clone());

    info!(
        "{} ({}) connected to gateway as {}",
        user.name, user.id, conn_id
    );

    let ctx = Arc::new(ConnectionContext {
        id: conn_id,
        user: user.clone(),
        gateway: gateway.clone(),
        tx,
        seen: seen.clone(),
    });

    ctx.reply(ServerEvent::Connected { connection_id: conn_id }).await;

    // Who is already here
    for online in gateway.presence.online_users() {
        ctx.reply(ServerEvent::PresenceChanged { user: online, online: true })
            .await;
    }

    if gateway.presence.connected(user.id) {
        gateway
            .dispatcher
            .publish_global(&ServerEvent::PresenceChanged { user: user.id, online: true });
    }

    let (sender, receiver) = socket.split();

    let mut send_task = tokio::spawn(run_outbound(
        sender,
        rx,
        OutboundState::new(seen),
        handle,
        gateway.settings.heartbeat_interval,
    ));
    let mut recv_task = tokio::spawn(run_inbound(receiver, ctx));

    // Wait for either task to finish
    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }

    let rooms = gateway.registry.remove_connection(conn_id);
    for room in rooms {
        if let Err(e) = gateway.writer.membership_disconnected(user.id, room).await {
            warn!("Failed to release membership {}/{}: {}", user.id, room, e);
        }
    }

    if gateway.presence.disconnected(user.id) {
        gateway
            .dispatcher
            .publish_global(&ServerEvent::PresenceChanged { user: user.id, online: false });
    }

    info!("{} ({}) disconnected from gateway", user.name, user.id);
}

async fn run_outbound(
    mut sender: SplitSink<WebSocket, Message>,
    mut rx: mpsc::Receiver<Outbound>,
    mut state: OutboundState,
    handle: ConnectionHandle,
    heartbeat_interval: std::time::Duration,
) {
    let mut heartbeat = tokio::time::interval(heartbeat_interval);
    heartbeat.tick().await;

    loop {
        tokio::select! {
            item = rx.recv() => {
                let Some(item) = item else { break };
                for frame in state.apply(item) {
                    if sender.send(Message::Text((&*frame).into())).await.is_err() {
                        return;
                    }
                }
            }
            _ = heartbeat.tick() => {
                if sender.send(Message::Ping(vec![].into())).await.is_err() {
                    break;
                }
            }
            _ = handle.closed() => {
                debug!("Connection {} closed by server", handle.id);
                let _ = sender.send(Message::Close(None)).await;
                break;
            }
        }
    }
}

async fn run_inbound(mut receiver: SplitStream<WebSocket>, ctx: Arc<ConnectionContext>) {
    let idle_timeout = ctx.gateway.settings.idle_timeout;

    loop {
        let msg = match tokio::time::timeout(idle_timeout, receiver.next()).await {
            Ok(Some(Ok(msg))) => msg,
            Ok(Some(Err(e))) => {
                debug!("Connection {} read error: {}", ctx.id, e);
                break;
            }
            Ok(None) => break,
            Err(_) => {
                info!(
                    "{} ({}) idle for {:?}, closing",
                    ctx.user.name, ctx.user.id, idle_timeout
                );
                break;
            }
        };

        match msg {
            Message::Text(text) => match serde_json::from_str::<ClientCommand>(&text) {
                Ok(cmd) => {
                    trace!("Connection {} command: {:?}", ctx.id, cmd);
                    touch_presence(&ctx);
                    handle_command(&ctx, cmd).await;
                }
                Err(e) => {
                    warn!(
                        "{} ({}) bad command: {} -- raw: {}",
                        ctx.user.name,
                        ctx.user.id,
                        e,
                        text.chars().take(200).collect::<String>()
                    );
                }
            },
            Message::Pong(_) | Message::Ping(_) => touch_presence(&ctx),
            Message::Binary(data) => {
                warn!(
                    "{} ({}) sent {} bytes of binary, ignored",
                    ctx.user.name,
                    ctx.user.id,
                    data.len()
                );
            }
            Message::Close(_) => break,
        }
    }
}

fn touch_presence(ctx: &ConnectionContext) {
    if ctx.gateway.presence.touch(ctx.user.id) {
        debug!("{} ({}) back from idle", ctx.user.name, ctx.user.id);
        ctx.gateway
            .dispatcher
            .publish_global(&ServerEvent::PresenceChanged { user: ctx.user.id, online: true });
    }
}

async fn handle_command(ctx: &ConnectionContext, cmd: ClientCommand) {
    let gateway = &ctx.gateway;

    match cmd {
        ClientCommand::Subscribe { room, last_seen_id } => {
            subscribe(ctx, room, last_seen_id).await;
        }

        ClientCommand::Unsubscribe { room } => {
            if !gateway.registry.unsubscribe(ctx.id, room) {
                debug!("Connection {} not subscribed to {}", ctx.id, room);
                return;
            }
            ctx.queue(Outbound::Unsubscribed { room }).await;
            if let Err(e) = gateway.writer.membership_disconnected(ctx.user.id, room).await {
                warn!("Failed to release membership {}/{}: {}", ctx.user.id, room, e);
            }
            info!("{} ({}) unsubscribed from {}", ctx.user.name, ctx.user.id, room);
        }

        ClientCommand::TypingStart { room } | ClientCommand::TypingStop { room } => {
            let is_typing = matches!(cmd, ClientCommand::TypingStart { .. });
            if !gateway.registry.is_subscribed(ctx.id, room) {
                ctx.reply(ServerEvent::error("not subscribed")).await;
                return;
            }
            gateway.dispatcher.publish(
                room,
                &ServerEvent::TypingChanged { user: ctx.user.id, room, is_typing },
            );
        }

        ClientCommand::Heartbeat => {}
    }
}

async fn subscribe(ctx: &ConnectionContext, room: Uuid, last_seen_id: Option<Uuid>) {
    let gateway = &ctx.gateway;
    let user_id = ctx.user.id;

    // On a live room only an explicit last_seen_id does anything: a replay.
    let resubscribe = gateway.registry.is_subscribed(ctx.id, room);
    if resubscribe && last_seen_id.is_none() {
        debug!("Connection {} already subscribed to {}", ctx.id, room);
        return;
    }

    let membership = gateway
        .db
        .read(move |db| db.get_membership(user_id, room))
        .await;

    match membership {
        Ok(Some(m)) if m.involvement != Involvement::Invisible => {}
        Ok(_) => {
            info!("{} ({}) denied subscription to {}", ctx.user.name, user_id, room);
            ctx.reply(ServerEvent::error("forbidden")).await;
            return;
        }
        Err(e) => {
            warn!("Membership lookup failed for {}/{}: {}", user_id, room, e);
            ctx.reply(ServerEvent::error("try again")).await;
            return;
        }
    }

    // Queue the hold before going live so no event lands between catch-up
    // and the live stream.
    ctx.queue(Outbound::BeginSubscribe { room }).await;
    if !resubscribe {
        if !gateway.registry.subscribe(ctx.id, room) {
            ctx.queue(Outbound::Unsubscribed { room }).await;
            return;
        }

        if let Err(e) = gateway.writer.membership_connected(user_id, room).await {
            warn!("Failed to record connection on {}/{}: {}", user_id, room, e);
        }
    }

    let pointer = last_seen_id.or_else(|| ctx.seen.get(room));
    let messages = match pointer {
        None => Vec::new(),
        Some(seen) if gateway.registry.last_message(room) == Some(seen) => Vec::new(),
        Some(seen) => {
            let cap = gateway.settings.catchup_cap;
            match gateway
                .db
                .read(move |db| db.messages_since(room, seen, cap))
                .await
            {
                Ok(messages) => messages,
                Err(e) => {
                    warn!("Catch-up query failed for {}: {}", room, e);
                    Vec::new()
                }
            }
        }
    };

    info!(
        "{} ({}) {} {} ({} to catch up)",
        ctx.user.name,
        user_id,
        if resubscribe { "replaying" } else { "subscribed to" },
        room,
        messages.len()
    );
    ctx.queue(Outbound::CatchUp { room, messages }).await;
}
