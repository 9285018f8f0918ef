pub mod connection;
pub mod dispatcher;
pub mod presence;
pub mod registry;

use std::sync::Arc;
use std::time::Duration;

use ember_db::Database;
use ember_db::writer::Writer;

use crate::dispatcher::Dispatcher;
use crate::presence::PresenceTracker;
use crate::registry::RoomRegistry;

#[derive(Debug, Clone)]
pub struct GatewaySettings {
    /// Most messages replayed on subscribe.
    pub catchup_cap: usize,
    /// Close a socket that sends nothing for this long.
    pub idle_timeout: Duration,
    pub heartbeat_interval: Duration,
    /// Deadline for validating the token on upgrade.
    pub auth_timeout: Duration,
}

/// Shared state for every gateway connection.
pub struct Gateway {
    pub registry: Arc<RoomRegistry>,
    pub dispatcher: Dispatcher,
    pub presence: Arc<PresenceTracker>,
    pub db: Arc<Database>,
    pub writer: Writer,
    pub settings: GatewaySettings,
}
