//! Dashboard snapshots
//!
//! A periodic rollup of connected peers, locks, recent diffs, recent
//! conflicts, and store health, pushed to subscribed connections every
//! `DASHBOARD_UPDATE_INTERVAL_MS` and once immediately on subscribe.

use crate::config::{
    now_ms, DASHBOARD_RECENT_CONFLICTS, DASHBOARD_RECENT_DIFFS, DASHBOARD_UPDATE_INTERVAL_MS,
};
use crate::core::error::Result;
use crate::protocol::{DashboardState, Envelope, HealthMetrics};
use crate::relay::Relay;
use std::sync::Arc;
use std::time::Duration;

/// Build one snapshot of the relay's current state.
pub async fn snapshot(relay: &Relay) -> Result<DashboardState> {
    Ok(DashboardState {
        clients: relay.client_summaries().await,
        locks: relay.locks.get_all(now_ms()).await,
        recent_diffs: relay.db.recent_diffs(DASHBOARD_RECENT_DIFFS)?,
        recent_conflicts: relay.db.recent_conflicts(DASHBOARD_RECENT_CONFLICTS)?,
        health: HealthMetrics {
            uptime_ms: relay.uptime_ms(),
            db_size_bytes: relay.db.size_bytes(),
            total_diffs: relay.db.total_diffs()?,
            total_files: relay.db.total_files()?,
        },
    })
}

/// Push snapshots to subscribers until the relay shuts down.
pub async fn run_pusher(relay: Arc<Relay>) {
    let mut interval = tokio::time::interval(Duration::from_millis(DASHBOARD_UPDATE_INTERVAL_MS));
    loop {
        interval.tick().await;
        let subscribers = relay.dashboard_subscriber_ids().await;
        if subscribers.is_empty() {
            continue;
        }
        let state = match snapshot(&relay).await {
            Ok(state) => state,
            Err(e) => {
                tracing::error!("Dashboard snapshot failed: {}", e);
                continue;
            }
        };
        for connection_id in subscribers {
            relay
                .send_to(
                    connection_id,
                    Envelope::DashboardState(Box::new(state.clone())),
                )
                .await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::Database;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_snapshot_reflects_store() {
        let dir = TempDir::new().unwrap();
        let db = Arc::new(Database::open(dir.path().join("partsync.db")).unwrap());
        let relay = Relay::new(db, 0);

        let state = snapshot(&relay).await.unwrap();
        assert!(state.clients.is_empty());
        assert_eq!(state.health.total_diffs, 0);
        assert!(state.health.db_size_bytes > 0);
        assert!(state.health.uptime_ms >= 0);
    }
}
