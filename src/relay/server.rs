//! Relay HTTP/WebSocket surface
//!
//! `/ws` upgrades sync connections (`clientName` query parameter names the
//! peer), `/health` and `/api/status` answer liveness probes.

use crate::config::{now_ms, LOCK_SWEEP_INTERVAL_MS, MAX_PAYLOAD_BYTES};
use crate::relay::{dashboard, dispatcher, Relay};
use crate::storage::Database;
use anyhow::Context;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Query, State};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Settings for one relay process.
#[derive(Clone, Debug)]
pub struct RelayOptions {
    pub port: u16,
    pub db_path: PathBuf,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WsQuery {
    client_name: Option<String>,
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(query): Query<WsQuery>,
    State(relay): State<Arc<Relay>>,
) -> impl IntoResponse {
    let client_name = query
        .client_name
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| "anonymous".to_string());
    ws.max_message_size(MAX_PAYLOAD_BYTES)
        .on_upgrade(move |socket| dispatcher::handle_socket(socket, relay, client_name))
}

async fn health(State(relay): State<Arc<Relay>>) -> Json<serde_json::Value> {
    let uptime = relay.uptime_ms();
    Json(json!({
        "status": "ok",
        "name": "partsync",
        "version": env!("CARGO_PKG_VERSION"),
        "uptime": uptime,
        "uptimeHuman": human_uptime(uptime),
    }))
}

async fn api_status(State(relay): State<Arc<Relay>>) -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "port": relay.port(),
    }))
}

/// Build the relay's router.
pub fn router(relay: Arc<Relay>) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health))
        .route("/api/status", get(api_status))
        .with_state(relay)
}

/// Spawn the periodic maintenance tasks: the expired-lock sweeper and the
/// dashboard pusher.
pub fn spawn_background_tasks(relay: &Arc<Relay>) {
    let sweeper = relay.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_millis(LOCK_SWEEP_INTERVAL_MS));
        loop {
            interval.tick().await;
            match sweeper.locks.sweep_expired(now_ms()).await {
                Ok(freed) if !freed.is_empty() => sweeper.broadcast_locks().await,
                Ok(_) => {}
                Err(e) => tracing::error!("Lock sweep failed: {}", e),
            }
        }
    });
    tokio::spawn(dashboard::run_pusher(relay.clone()));
}

/// Open the store, restore locks, and serve until shutdown.
pub async fn run(options: RelayOptions) -> anyhow::Result<()> {
    let db = Arc::new(
        Database::open(&options.db_path)
            .with_context(|| format!("opening store at {:?}", options.db_path))?,
    );
    let relay = Relay::new(db, options.port);
    relay.locks.restore_from_store(now_ms()).await?;
    spawn_background_tasks(&relay);

    let addr = SocketAddr::from(([0, 0, 0, 0], options.port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    tracing::info!("Relay listening on {}", addr);
    axum::serve(listener, router(relay)).await?;
    Ok(())
}

fn human_uptime(ms: i64) -> String {
    let total_secs = ms.max(0) / 1000;
    let hours = total_secs / 3600;
    let minutes = (total_secs % 3600) / 60;
    let seconds = total_secs % 60;
    if hours > 0 {
        format!("{hours}h {minutes}m {seconds}s")
    } else if minutes > 0 {
        format!("{minutes}m {seconds}s")
    } else {
        format!("{seconds}s")
    }
}
