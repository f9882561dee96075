//! Relay-side state
//!
//! One `Relay` value owns everything the dispatcher mutates: the store,
//! the lock table, the connected-client map, and the dashboard subscriber
//! set. Message handlers live in `dispatcher`, the axum surface in
//! `server`, the periodic rollup in `dashboard`.

pub mod dashboard;
pub mod dispatcher;
pub mod server;

use crate::config::now_ms;
use crate::core::locks::LockTable;
use crate::protocol::{ClientSummary, Envelope};
use crate::storage::Database;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use uuid::Uuid;

/// Relay-side record of a connected peer (memory only).
#[derive(Clone, Debug)]
pub struct ClientInfo {
    pub connection_id: Uuid,
    pub display_name: String,
    pub connected_since: i64,
    pub last_activity: i64,
}

/// A connected peer plus its outbound channel.
struct ClientHandle {
    info: ClientInfo,
    sender: mpsc::Sender<Envelope>,
}

/// Shared state for all connections.
pub struct Relay {
    pub db: Arc<Database>,
    pub locks: LockTable,
    clients: RwLock<HashMap<Uuid, ClientHandle>>,
    dashboard_subscribers: RwLock<HashSet<Uuid>>,
    started_at: i64,
    port: u16,
}

impl Relay {
    pub fn new(db: Arc<Database>, port: u16) -> Arc<Self> {
        Arc::new(Self {
            locks: LockTable::new(db.clone()),
            db,
            clients: RwLock::new(HashMap::new()),
            dashboard_subscribers: RwLock::new(HashSet::new()),
            started_at: now_ms(),
            port,
        })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn uptime_ms(&self) -> i64 {
        now_ms() - self.started_at
    }

    /// Register a new connection and hand back its id.
    pub async fn register(&self, display_name: &str, sender: mpsc::Sender<Envelope>) -> Uuid {
        let connection_id = Uuid::new_v4();
        let now = now_ms();
        let handle = ClientHandle {
            info: ClientInfo {
                connection_id,
                display_name: display_name.to_string(),
                connected_since: now,
                last_activity: now,
            },
            sender,
        };
        self.clients.write().await.insert(connection_id, handle);
        tracing::info!(client = display_name, %connection_id, "Client connected");
        connection_id
    }

    /// Drop a connection's registration and dashboard subscription.
    pub async fn unregister(&self, connection_id: Uuid) -> Option<ClientInfo> {
        self.dashboard_subscribers
            .write()
            .await
            .remove(&connection_id);
        let removed = self.clients.write().await.remove(&connection_id);
        if let Some(handle) = &removed {
            tracing::info!(
                client = %handle.info.display_name,
                %connection_id,
                "Client disconnected"
            );
        }
        removed.map(|h| h.info)
    }

    /// Bump a connection's activity timestamp.
    pub async fn touch(&self, connection_id: Uuid) {
        if let Some(handle) = self.clients.write().await.get_mut(&connection_id) {
            handle.info.last_activity = now_ms();
        }
    }

    /// Snapshot of connected peers for the dashboard.
    pub async fn client_summaries(&self) -> Vec<ClientSummary> {
        self.clients
            .read()
            .await
            .values()
            .map(|h| ClientSummary {
                connection_id: h.info.connection_id.to_string(),
                display_name: h.info.display_name.clone(),
                connected_since: h.info.connected_since,
                last_activity: h.info.last_activity,
            })
            .collect()
    }

    /// Send to one connection. Best-effort: a full or closed channel only
    /// logs.
    pub async fn send_to(&self, connection_id: Uuid, message: Envelope) {
        let sender = {
            let clients = self.clients.read().await;
            clients.get(&connection_id).map(|h| h.sender.clone())
        };
        let Some(sender) = sender else {
            return;
        };
        if sender.send(message).await.is_err() {
            tracing::debug!(%connection_id, "Dropping message for closed connection");
        }
    }

    /// Broadcast to every connection except `skip`.
    pub async fn broadcast_except(&self, skip: Option<Uuid>, message: &Envelope) {
        let targets: Vec<(Uuid, mpsc::Sender<Envelope>)> = {
            let clients = self.clients.read().await;
            clients
                .values()
                .filter(|h| Some(h.info.connection_id) != skip)
                .map(|h| (h.info.connection_id, h.sender.clone()))
                .collect()
        };
        for (connection_id, sender) in targets {
            if sender.send(message.clone()).await.is_err() {
                tracing::debug!(%connection_id, "Dropping broadcast for closed connection");
            }
        }
    }

    /// Broadcast to every connection, sender included.
    pub async fn broadcast_all(&self, message: &Envelope) {
        self.broadcast_except(None, message).await;
    }

    /// Push the full lock snapshot to everyone.
    pub async fn broadcast_locks(&self) {
        let locks = self.locks.get_all(now_ms()).await;
        self.broadcast_all(&Envelope::FileLockChanged(locks)).await;
    }

    /// Mark a connection as a dashboard subscriber.
    pub async fn subscribe_dashboard(&self, connection_id: Uuid) {
        self.dashboard_subscribers
            .write()
            .await
            .insert(connection_id);
    }

    pub async fn dashboard_subscriber_ids(&self) -> Vec<Uuid> {
        self.dashboard_subscribers.read().await.iter().copied().collect()
    }
}
