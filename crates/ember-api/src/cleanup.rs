use std::time::Duration;

use chrono::Utc;
use tracing::{info, warn};

use ember_db::writer::Writer;

/// Background task that purges sessions idle for longer than `ttl`.
pub async fn run_session_cleanup_loop(writer: Writer, ttl: chrono::Duration, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);

    loop {
        ticker.tick().await;

        match writer.purge_expired_sessions(Utc::now() - ttl).await {
            Ok(count) => {
                if count > 0 {
                    info!("Cleanup: purged {} expired sessions", count);
                }
            }
            Err(e) => {
                warn!("Cleanup error: {}", e);
            }
        }
    }
}
