use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use tracing::{debug, info};
use uuid::Uuid;

use ember_types::events::ServerEvent;

use crate::dispatcher::Dispatcher;

struct Entry {
    connections: u32,
    last_active: Instant,
    /// Swept for silence while sockets stay open.
    stale: bool,
}

impl Entry {
    fn online(&self) -> bool {
        self.connections > 0 && !self.stale
    }
}

/// Online state per user, counted across all of the user's connections.
///
/// A user is online while they have at least one live connection and have
/// shown activity within the staleness window. A sweep never forgets the
/// connection count, so sockets opened before it still balance out.
#[derive(Default)]
pub struct PresenceTracker {
    users: Mutex<HashMap<Uuid, Entry>>,
}

impl PresenceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true if this connection brought the user online.
    pub fn connected(&self, user_id: Uuid) -> bool {
        self.connected_at(user_id, Instant::now())
    }

    fn connected_at(&self, user_id: Uuid, now: Instant) -> bool {
        let mut users = self.lock();
        let entry = users.entry(user_id).or_insert(Entry {
            connections: 0,
            last_active: now,
            stale: false,
        });
        let was_online = entry.online();
        entry.connections += 1;
        entry.last_active = now;
        entry.stale = false;
        !was_online
    }

    /// Returns true if this took the user offline. Extra calls for a user
    /// with no connections do nothing.
    pub fn disconnected(&self, user_id: Uuid) -> bool {
        let mut users = self.lock();
        let Some(entry) = users.get_mut(&user_id) else {
            return false;
        };
        let was_online = entry.online();
        entry.connections = entry.connections.saturating_sub(1);
        if entry.connections == 0 {
            users.remove(&user_id);
            return was_online;
        }
        false
    }

    /// Record activity. Returns true if it brought a swept user back online.
    /// Ignored for users with no connections.
    pub fn touch(&self, user_id: Uuid) -> bool {
        self.touch_at(user_id, Instant::now())
    }

    fn touch_at(&self, user_id: Uuid, now: Instant) -> bool {
        let mut users = self.lock();
        let Some(entry) = users.get_mut(&user_id) else {
            return false;
        };
        entry.last_active = now;
        std::mem::replace(&mut entry.stale, false)
    }

    pub fn is_online(&self, user_id: Uuid) -> bool {
        self.lock().get(&user_id).is_some_and(Entry::online)
    }

    pub fn online_users(&self) -> Vec<Uuid> {
        self.lock()
            .iter()
            .filter(|(_, entry)| entry.online())
            .map(|(id, _)| *id)
            .collect()
    }

    /// Mark users idle for longer than `staleness` offline. Returns who went
    /// offline.
    pub fn sweep(&self, staleness: Duration) -> Vec<Uuid> {
        self.sweep_at(Instant::now(), staleness)
    }

    fn sweep_at(&self, now: Instant, staleness: Duration) -> Vec<Uuid> {
        let mut users = self.lock();
        let mut swept = Vec::new();
        for (id, entry) in users.iter_mut() {
            if entry.online() && now.saturating_duration_since(entry.last_active) > staleness {
                entry.stale = true;
                swept.push(*id);
            }
        }
        swept
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<Uuid, Entry>> {
        self.users.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Background task that takes silent users offline.
pub async fn run_sweep_loop(
    presence: Arc<PresenceTracker>,
    dispatcher: Dispatcher,
    interval: Duration,
    staleness: Duration,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await;

    loop {
        ticker.tick().await;

        let swept = presence.sweep(staleness);
        if swept.is_empty() {
            continue;
        }
        info!("Presence sweep: {} users went stale", swept.len());

        for user in swept {
            debug!("{} marked offline by sweep", user);
            dispatcher.publish_global(&ServerEvent::PresenceChanged { user, online: false });
        }
    }
}
