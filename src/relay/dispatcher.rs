//! Per-connection dispatcher
//!
//! Each WebSocket connection gets a read loop feeding these handlers and a
//! writer task draining its outbound queue. Handlers are bounded units:
//! recoverable errors are logged and absorbed, storage errors close the
//! offending connection and let the client re-handshake.

use crate::config::{now_ms, MAX_DIFF_HISTORY};
use crate::core::conflict::{evaluate, MergeDecision};
use crate::core::diff::invert_patch;
use crate::core::error::{Result, SyncError};
use crate::protocol::{
    AuthorType, Envelope, FileDiff, SyncHandshake, SyncHandshakeResponse, UndoRequest,
};
use crate::relay::{dashboard, Relay};
use axum::extract::ws::{Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use uuid::Uuid;

/// Outbound messages queued per connection before backpressure applies.
const OUTBOUND_QUEUE: usize = 256;

/// Drive one WebSocket connection from registration to cleanup.
pub async fn handle_socket(socket: WebSocket, relay: std::sync::Arc<Relay>, client_name: String) {
    let (mut ws_sender, mut ws_receiver) = socket.split();
    let (tx, mut rx) = mpsc::channel::<Envelope>(OUTBOUND_QUEUE);

    let connection_id = relay.register(&client_name, tx).await;

    // Writer task: serialize and push queued envelopes.
    let writer = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            match message.encode() {
                Ok(text) => {
                    if ws_sender.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    tracing::warn!("Skipping oversized outbound message: {}", e);
                }
            }
        }
    });

    // Read loop: arrival order is processing order.
    while let Some(message) = ws_receiver.next().await {
        match message {
            Ok(Message::Text(text)) => {
                let envelope = match Envelope::decode(text.as_str()) {
                    Ok(envelope) => envelope,
                    Err(e) => {
                        tracing::warn!(client = %client_name, "Ignoring unknown message: {}", e);
                        continue;
                    }
                };
                relay.touch(connection_id).await;
                if let Err(e) = relay
                    .handle_envelope(connection_id, &client_name, envelope)
                    .await
                {
                    if matches!(e, SyncError::Storage(_)) {
                        tracing::error!(client = %client_name, "Storage failure, closing: {}", e);
                        break;
                    }
                    tracing::warn!(client = %client_name, "Handler error: {}", e);
                }
            }
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                tracing::debug!(client = %client_name, "WebSocket error: {}", e);
                break;
            }
        }
    }

    // Cleanup on disconnect: drop registration, free the client's locks.
    relay.unregister(connection_id).await;
    match relay
        .locks
        .release_for_client(Some(&client_name), Some(connection_id))
        .await
    {
        Ok(freed) if !freed.is_empty() => relay.broadcast_locks().await,
        Ok(_) => {}
        Err(e) => tracing::error!("Failed to release locks on disconnect: {}", e),
    }
    writer.abort();
}

impl Relay {
    /// Route one incoming envelope.
    pub async fn handle_envelope(
        &self,
        connection_id: Uuid,
        client_name: &str,
        envelope: Envelope,
    ) -> Result<()> {
        match envelope {
            Envelope::FileDiff(diff) => self.on_file_diff(connection_id, diff).await,
            Envelope::FileLock(req) => {
                self.locks
                    .acquire(
                        &req.file,
                        client_name,
                        req.lock_type,
                        Some(connection_id),
                        now_ms(),
                    )
                    .await?;
                self.broadcast_locks().await;
                Ok(())
            }
            Envelope::FileUnlock(req) => {
                self.locks.release(&req.file, Some(client_name)).await?;
                self.broadcast_locks().await;
                Ok(())
            }
            Envelope::FileDelete(payload) => {
                self.locks.release(&payload.file, None).await?;
                self.broadcast_except(Some(connection_id), &Envelope::FileDelete(payload))
                    .await;
                Ok(())
            }
            Envelope::FileRename(payload) => {
                self.locks.release(&payload.old_file, None).await?;
                self.broadcast_except(Some(connection_id), &Envelope::FileRename(payload))
                    .await;
                Ok(())
            }
            Envelope::SyncFullFile(payload) => {
                self.db
                    .upsert_version(&payload.file, &payload.hash, now_ms())?;
                self.broadcast_except(Some(connection_id), &Envelope::SyncApplyFullFile(payload))
                    .await;
                Ok(())
            }
            Envelope::SyncHandshake(handshake) => {
                let response = self.on_handshake(&handshake).await?;
                self.send_to(connection_id, Envelope::SyncHandshakeResponse(response))
                    .await;
                Ok(())
            }
            Envelope::DashboardSubscribe => {
                self.subscribe_dashboard(connection_id).await;
                let snapshot = dashboard::snapshot(self).await?;
                self.send_to(connection_id, Envelope::DashboardState(Box::new(snapshot)))
                    .await;
                Ok(())
            }
            Envelope::DiffUndo(req) => self.on_undo(client_name, req).await,
            // Relay-originated events arriving from a client are noise.
            other => {
                tracing::warn!(
                    client = %client_name,
                    event = other.event(),
                    "Ignoring relay-bound event from client"
                );
                Ok(())
            }
        }
    }

    /// Ingest one diff: version-chain check, conflict detection, store,
    /// prune, re-broadcast with its assigned id.
    async fn on_file_diff(&self, connection_id: Uuid, diff: FileDiff) -> Result<()> {
        let current = self.db.get_version(&diff.file)?;

        // The detector only runs when the chain disagrees: the sender
        // patched a version the relay has already moved past.
        if let Some(current) = current.filter(|v| v.hash != diff.previous_version) {
            tracing::debug!(
                file = %diff.file,
                expected = %current.hash,
                got = %diff.previous_version,
                "Version mismatch, checking overlap"
            );
            if let Some(existing) = self.db.diffs_by_file(&diff.file, 1)?.into_iter().next() {
                if let MergeDecision::Conflict(mut event) = evaluate(&existing, &diff, now_ms()) {
                    event.id = Some(self.db.insert_conflict(&event)?);
                    tracing::info!(
                        file = %event.file,
                        a = %event.author_a,
                        b = %event.author_b,
                        "Conflict detected"
                    );
                    self.broadcast_all(&Envelope::FileConflict(event)).await;
                }
            }
        }

        // Both sides of a conflict are stored and broadcast; clients hold
        // authoritative content and converge on later diffs.
        let id = self.db.insert_diff(&diff)?;
        self.db
            .upsert_version(&diff.file, &diff.version, diff.timestamp)?;
        self.db.prune(&diff.file, MAX_DIFF_HISTORY)?;

        let mut stored = diff;
        stored.id = Some(id);
        self.broadcast_except(Some(connection_id), &Envelope::FileDiff(stored))
            .await;
        Ok(())
    }

    /// Answer a handshake: every chain the client's fingerprints miss,
    /// oldest first, plus the lock snapshot.
    async fn on_handshake(&self, handshake: &SyncHandshake) -> Result<SyncHandshakeResponse> {
        let mut missing = Vec::new();
        for row in self.db.all_versions()? {
            match handshake.file_versions.get(&row.file) {
                Some(hash) if *hash == row.hash => {}
                Some(hash) => missing.extend(self.db.diffs_since(&row.file, hash)?),
                None => missing.extend(self.db.diffs_since(&row.file, "")?),
            }
        }
        tracing::debug!(
            client = %handshake.client_id,
            missing = missing.len(),
            "Handshake"
        );
        Ok(SyncHandshakeResponse {
            request_id: handshake.request_id,
            missing_diffs: missing,
            // Reserved for future use; clients iterate it regardless.
            full_files: Vec::new(),
            locks: self.locks.get_all(now_ms()).await,
        })
    }

    /// Undo a stored diff: broadcast its true inverse to every connection,
    /// the caller included, and roll the chain back with it.
    async fn on_undo(&self, client_name: &str, req: UndoRequest) -> Result<()> {
        let Some(original) = self.db.diff_by_id(req.diff_id)? else {
            tracing::warn!(diff_id = req.diff_id, "Undo of unknown diff");
            return Err(SyncError::UnknownDiff(req.diff_id));
        };
        let patch = match invert_patch(&original.patch) {
            Ok(patch) => patch,
            Err(e) => {
                // Fall back to symmetric re-application of the original
                // text; only safe for plain replace hunks.
                tracing::warn!(diff_id = req.diff_id, "Could not invert patch: {}", e);
                original.patch.clone()
            }
        };
        let inverse = FileDiff {
            id: None,
            file: req.file.clone(),
            patch,
            author: client_name.to_string(),
            author_type: AuthorType::Human,
            timestamp: now_ms(),
            version: original.previous_version.clone(),
            previous_version: original.version.clone(),
            compressed: false,
        };

        let id = self.db.insert_diff(&inverse)?;
        self.db
            .upsert_version(&inverse.file, &inverse.version, inverse.timestamp)?;
        self.db.prune(&inverse.file, MAX_DIFF_HISTORY)?;

        let mut stored = inverse;
        stored.id = Some(id);
        self.broadcast_all(&Envelope::FileDiff(stored)).await;
        Ok(())
    }
}
