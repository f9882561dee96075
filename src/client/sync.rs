//! Client sync loop
//!
//! A single actor owns the local caches and reacts to watcher events,
//! debounce expiries, and transport traffic. Outbound: debounced local
//! change → patch → relay, with an offline queue. Inbound: apply patches
//! best-effort and suppress the watcher echo of our own writes via
//! pre-registered expected fingerprints, with the timed applying-incoming
//! guard as the coarse backstop.

use crate::client::transport::{Transport, TransportEvent};
use crate::client::watcher::{initial_scan, safe_join, FsEvent, ProjectWatcher};
use crate::config::{
    now_ms, IgnoreSet, APPLY_SETTLE_MS, ECHO_FINGERPRINT_CAP, HANDSHAKE_TIMEOUT_MS,
    LOCK_IDLE_RELEASE_MS,
};
use crate::core::burst::BurstDetector;
use crate::core::diff::{apply_patch, fingerprint, has_changed, make_patch};
use crate::protocol::{
    Envelope, FileDeletePayload, FileDiff, FileRenamePayload, FullFileSync, LockRequest,
    LockState, SyncHandshake, SyncHandshakeResponse, UnlockRequest,
};
use std::collections::{HashMap, HashSet, VecDeque};
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Settings for one sync client.
#[derive(Clone, Debug)]
pub struct ClientOptions {
    /// Relay endpoint, e.g. `ws://localhost:3777`.
    pub server_url: String,
    /// Project root to watch.
    pub dir: PathBuf,
    /// Display name attached to diffs and locks.
    pub name: String,
    /// Extra ignore patterns on top of the defaults.
    pub ignore: Vec<String>,
}

/// Everything the actor reacts to.
#[derive(Debug)]
enum ClientEvent {
    Fs(FsEvent),
    DebounceFired(String),
    Transport(TransportEvent),
    HandshakeTimeout(u64),
    IdleUnlock(String),
    GuardRelease,
}

/// The sync actor's state. All mutation happens on the event loop task.
pub struct SyncClient {
    root: PathBuf,
    name: String,
    project_id: String,
    transport: Transport,
    events_tx: mpsc::Sender<ClientEvent>,

    file_contents: HashMap<String, String>,
    file_versions: HashMap<String, String>,
    pending_diffs: VecDeque<FileDiff>,
    /// Fingerprints we expect the watcher to observe for our own writes.
    expected_fingerprints: HashMap<String, VecDeque<String>>,
    /// Coarse echo guard; counts in-flight settle timers.
    guard_count: usize,
    burst: BurstDetector,
    debounce_timers: HashMap<String, JoinHandle<()>>,
    idle_unlock_timers: HashMap<String, JoinHandle<()>>,
    held_locks: HashSet<String>,
    remote_locks: Vec<LockState>,

    connected: bool,
    awaiting_handshake: Option<u64>,
    next_request_id: u64,
}

impl SyncClient {
    fn new(
        options: &ClientOptions,
        transport: Transport,
        events_tx: mpsc::Sender<ClientEvent>,
    ) -> Self {
        let project_id = options
            .dir
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "project".to_string());
        Self {
            root: options.dir.clone(),
            name: options.name.clone(),
            project_id,
            transport,
            events_tx,
            file_contents: HashMap::new(),
            file_versions: HashMap::new(),
            pending_diffs: VecDeque::new(),
            expected_fingerprints: HashMap::new(),
            guard_count: 0,
            burst: BurstDetector::new(),
            debounce_timers: HashMap::new(),
            idle_unlock_timers: HashMap::new(),
            held_locks: HashSet::new(),
            remote_locks: Vec::new(),
            connected: false,
            awaiting_handshake: None,
            next_request_id: 0,
        }
    }

    /// Run the client until ctrl-c.
    pub async fn run(options: ClientOptions) -> anyhow::Result<()> {
        let ignore = IgnoreSet::new(&options.ignore);
        let (events_tx, mut events_rx) = mpsc::channel::<ClientEvent>(512);

        let (_watcher, mut fs_rx) = ProjectWatcher::start(&options.dir, ignore.clone())?;
        let fs_forward = events_tx.clone();
        tokio::spawn(async move {
            while let Some(event) = fs_rx.recv().await {
                if fs_forward.send(ClientEvent::Fs(event)).await.is_err() {
                    break;
                }
            }
        });

        let (transport_tx, mut transport_rx) = mpsc::channel::<TransportEvent>(512);
        let transport_forward = events_tx.clone();
        tokio::spawn(async move {
            while let Some(event) = transport_rx.recv().await {
                if transport_forward
                    .send(ClientEvent::Transport(event))
                    .await
                    .is_err()
                {
                    break;
                }
            }
        });
        let transport = Transport::spawn(&options.server_url, &options.name, transport_tx);

        let mut client = Self::new(&options, transport, events_tx);
        client.file_contents = initial_scan(&options.dir, &ignore);
        client.file_versions = client
            .file_contents
            .iter()
            .map(|(file, content)| (file.clone(), fingerprint(content)))
            .collect();

        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    client.shutdown();
                    break;
                }
                event = events_rx.recv() => match event {
                    Some(event) => client.handle_event(event).await,
                    None => break,
                },
            }
        }
        Ok(())
    }

    async fn handle_event(&mut self, event: ClientEvent) {
        match event {
            ClientEvent::Fs(fs_event) => self.on_fs_event(fs_event),
            ClientEvent::DebounceFired(file) => self.on_debounce_fired(file),
            ClientEvent::Transport(TransportEvent::Connected) => self.on_connected(),
            ClientEvent::Transport(TransportEvent::Disconnected) => {
                tracing::warn!("Offline: queueing local diffs");
                self.connected = false;
                self.awaiting_handshake = None;
            }
            ClientEvent::Transport(TransportEvent::Message(message)) => {
                self.on_message(message);
            }
            ClientEvent::HandshakeTimeout(id) => {
                if self.connected && self.awaiting_handshake == Some(id) {
                    tracing::warn!("Handshake timed out, retrying");
                    self.send_handshake();
                }
            }
            ClientEvent::IdleUnlock(file) => {
                self.idle_unlock_timers.remove(&file);
                if self.held_locks.remove(&file) && self.connected {
                    self.transport
                        .send(Envelope::FileUnlock(UnlockRequest { file }));
                }
            }
            ClientEvent::GuardRelease => {
                self.guard_count = self.guard_count.saturating_sub(1);
            }
        }
    }

    // ========== Filesystem → outbound ==========

    fn on_fs_event(&mut self, event: FsEvent) {
        // Writes we performed ourselves are still settling; their own
        // debounce-time fingerprint check handles the rest.
        if self.guard_count > 0 {
            return;
        }
        match event {
            FsEvent::Touched { path } => {
                self.burst.record_write(now_ms());
                self.restart_debounce(path);
            }
            FsEvent::Removed { path } => self.on_local_removed(path),
        }
    }

    fn restart_debounce(&mut self, file: String) {
        if let Some(handle) = self.debounce_timers.remove(&file) {
            handle.abort();
        }
        let delay = self.burst.debounce_ms(now_ms());
        let events = self.events_tx.clone();
        let key = file.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(delay)).await;
            let _ = events.send(ClientEvent::DebounceFired(key)).await;
        });
        self.debounce_timers.insert(file, handle);
    }

    fn on_debounce_fired(&mut self, file: String) {
        self.debounce_timers.remove(&file);
        let Some(abs) = safe_join(&self.root, &file) else {
            return;
        };
        let bytes = match std::fs::read(&abs) {
            Ok(bytes) => bytes,
            // Gone already; the remove event handles it.
            Err(_) => return,
        };
        let new_content = match String::from_utf8(bytes) {
            Ok(text) => text,
            Err(_) => {
                tracing::debug!(file = %file, "Skipping non-UTF-8 file");
                return;
            }
        };

        let new_hash = fingerprint(&new_content);
        if self.consume_expected(&file, &new_hash) {
            // Echo of our own apply: absorb into the caches, emit nothing.
            self.file_contents.insert(file.clone(), new_content);
            self.file_versions.insert(file, new_hash);
            return;
        }

        let old_content = self.file_contents.get(&file).cloned().unwrap_or_default();
        if !has_changed(&old_content, &new_content) {
            return;
        }

        let now = now_ms();
        if old_content.is_empty() {
            // New (or never-cached) file: a patch against nothing is just
            // the content. Full-file sends are best-effort while offline.
            let message = Envelope::SyncFullFile(FullFileSync {
                file: file.clone(),
                content: new_content.clone(),
                hash: new_hash.clone(),
            });
            if self.connected && !self.transport.send(message) {
                tracing::warn!(file = %file, "Dropped full-file send");
            }
        } else {
            let diff = FileDiff {
                id: None,
                file: file.clone(),
                patch: make_patch(&old_content, &new_content),
                author: self.name.clone(),
                author_type: self.burst.author_type(now),
                timestamp: now,
                version: new_hash.clone(),
                previous_version: fingerprint(&old_content),
                compressed: false,
            };
            self.send_diff(diff);
        }

        self.file_contents.insert(file.clone(), new_content);
        self.file_versions.insert(file.clone(), new_hash);
        self.refresh_lock(file);
    }

    fn on_local_removed(&mut self, file: String) {
        if let Some(handle) = self.debounce_timers.remove(&file) {
            handle.abort();
        }
        if self.file_contents.remove(&file).is_none() {
            return;
        }
        self.file_versions.remove(&file);
        self.expected_fingerprints.remove(&file);
        // Deletes are not queued offline by design.
        if self.connected {
            self.transport.send(Envelope::FileDelete(FileDeletePayload {
                file,
                author: self.name.clone(),
            }));
        }
    }

    fn send_diff(&mut self, diff: FileDiff) {
        if self.connected {
            if self.transport.send(Envelope::FileDiff(diff.clone())) {
                return;
            }
            tracing::warn!("Transport saturated, queueing diff");
        }
        self.pending_diffs.push_back(diff);
    }

    /// Refresh our soft lock on a file and (re)arm its idle release.
    fn refresh_lock(&mut self, file: String) {
        if self.connected {
            self.transport.send(Envelope::FileLock(LockRequest {
                file: file.clone(),
                lock_type: self.burst.author_type(now_ms()).into(),
            }));
        }
        self.held_locks.insert(file.clone());
        if let Some(handle) = self.idle_unlock_timers.remove(&file) {
            handle.abort();
        }
        let events = self.events_tx.clone();
        let key = file.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(LOCK_IDLE_RELEASE_MS)).await;
            let _ = events.send(ClientEvent::IdleUnlock(key)).await;
        });
        self.idle_unlock_timers.insert(file, handle);
    }

    // ========== Incoming → filesystem ==========

    fn on_message(&mut self, message: Envelope) {
        match message {
            Envelope::FileDiff(diff) => self.apply_incoming_diff(&diff),
            Envelope::FileDelete(payload) => self.apply_incoming_delete(&payload),
            Envelope::FileRename(payload) => self.apply_incoming_rename(&payload),
            Envelope::SyncApplyFullFile(payload) => self.apply_incoming_full_file(&payload),
            Envelope::FileConflict(event) => {
                tracing::warn!(
                    file = %event.file,
                    authors = %format!("{} vs {}", event.author_a, event.author_b),
                    copy = %event.conflict_file,
                    "Conflicting edits detected"
                );
            }
            Envelope::FileLockChanged(locks) => self.on_locks_changed(locks),
            Envelope::SyncHandshakeResponse(response) => self.on_handshake_response(response),
            other => {
                tracing::debug!(event = other.event(), "Ignoring message");
            }
        }
    }

    fn apply_incoming_diff(&mut self, diff: &FileDiff) {
        let Some(abs) = safe_join(&self.root, &diff.file) else {
            tracing::warn!(file = %diff.file, "Rejecting unsafe path");
            return;
        };
        let current = std::fs::read_to_string(&abs).unwrap_or_default();
        let outcome = apply_patch(&diff.patch, &current);
        if !outcome.ok {
            // Converge on best effort rather than freeze the file.
            tracing::warn!(
                file = %diff.file,
                failed = outcome.hunks_ok.iter().filter(|ok| !**ok).count(),
                "Partial patch application"
            );
        }

        self.begin_guard();
        let result_hash = fingerprint(&outcome.result);
        self.expect_fingerprint(&diff.file, result_hash.clone());
        if let Some(parent) = abs.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        if let Err(e) = std::fs::write(&abs, &outcome.result) {
            tracing::error!(file = %diff.file, "Failed to write patched file: {}", e);
            return;
        }

        let version = if outcome.ok {
            diff.version.clone()
        } else {
            result_hash
        };
        self.file_contents.insert(diff.file.clone(), outcome.result);
        self.file_versions.insert(diff.file.clone(), version);
    }

    fn apply_incoming_delete(&mut self, payload: &FileDeletePayload) {
        let Some(abs) = safe_join(&self.root, &payload.file) else {
            return;
        };
        self.begin_guard();
        if abs.exists() {
            if let Err(e) = std::fs::remove_file(&abs) {
                tracing::warn!(file = %payload.file, "Failed to delete: {}", e);
            }
        }
        self.file_contents.remove(&payload.file);
        self.file_versions.remove(&payload.file);
        self.expected_fingerprints.remove(&payload.file);
    }

    fn apply_incoming_rename(&mut self, payload: &FileRenamePayload) {
        let (Some(old_abs), Some(new_abs)) = (
            safe_join(&self.root, &payload.old_file),
            safe_join(&self.root, &payload.new_file),
        ) else {
            return;
        };
        self.begin_guard();
        if let Some(parent) = new_abs.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        if old_abs.exists() {
            if let Err(e) = std::fs::rename(&old_abs, &new_abs) {
                tracing::warn!(from = %payload.old_file, "Failed to rename: {}", e);
                return;
            }
        }
        if let Some(content) = self.file_contents.remove(&payload.old_file) {
            self.file_contents.insert(payload.new_file.clone(), content);
        }
        if let Some(version) = self.file_versions.remove(&payload.old_file) {
            self.file_versions.insert(payload.new_file.clone(), version);
        }
    }

    fn apply_incoming_full_file(&mut self, payload: &FullFileSync) {
        let Some(abs) = safe_join(&self.root, &payload.file) else {
            return;
        };
        self.begin_guard();
        self.expect_fingerprint(&payload.file, fingerprint(&payload.content));
        if let Some(parent) = abs.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        if let Err(e) = std::fs::write(&abs, &payload.content) {
            tracing::error!(file = %payload.file, "Failed to write file: {}", e);
            return;
        }
        self.file_contents
            .insert(payload.file.clone(), payload.content.clone());
        self.file_versions
            .insert(payload.file.clone(), fingerprint(&payload.content));
    }

    fn on_locks_changed(&mut self, locks: Vec<LockState>) {
        for lock in &locks {
            if lock.locked_by != self.name && self.held_locks.contains(&lock.file) {
                tracing::warn!(
                    file = %lock.file,
                    holder = %lock.locked_by,
                    "File is soft-locked by another author"
                );
            }
        }
        self.remote_locks = locks;
    }

    // ========== Connection lifecycle ==========

    fn on_connected(&mut self) {
        self.connected = true;
        self.send_handshake();
    }

    fn send_handshake(&mut self) {
        self.next_request_id += 1;
        let request_id = self.next_request_id;
        self.awaiting_handshake = Some(request_id);
        self.transport
            .send(Envelope::SyncHandshake(SyncHandshake {
                request_id: Some(request_id),
                client_id: self.name.clone(),
                project_id: self.project_id.clone(),
                file_versions: self.file_versions.clone(),
            }));
        let events = self.events_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(HANDSHAKE_TIMEOUT_MS)).await;
            let _ = events.send(ClientEvent::HandshakeTimeout(request_id)).await;
        });
    }

    fn on_handshake_response(&mut self, response: SyncHandshakeResponse) {
        if self.awaiting_handshake.is_none()
            || response.request_id != self.awaiting_handshake
        {
            tracing::debug!("Ignoring stale handshake response");
            return;
        }
        self.awaiting_handshake = None;
        tracing::info!(
            missing = response.missing_diffs.len(),
            "Handshake complete"
        );

        for diff in &response.missing_diffs {
            self.apply_incoming_diff(diff);
        }
        for full in &response.full_files {
            self.apply_incoming_full_file(&FullFileSync {
                file: full.file.clone(),
                hash: fingerprint(&full.content),
                content: full.content.clone(),
            });
        }
        self.remote_locks = response.locks;
        self.flush_pending();
    }

    /// Deliver queued diffs in FIFO order after a reconnect handshake.
    fn flush_pending(&mut self) {
        while let Some(diff) = self.pending_diffs.pop_front() {
            if !self.connected || !self.transport.send(Envelope::FileDiff(diff.clone())) {
                self.pending_diffs.push_front(diff);
                break;
            }
        }
        if !self.pending_diffs.is_empty() {
            tracing::warn!(queued = self.pending_diffs.len(), "Pending diffs remain");
        }
    }

    /// Best-effort lock release on shutdown.
    fn shutdown(&mut self) {
        tracing::info!("Shutting down");
        if self.connected {
            for file in self.held_locks.drain() {
                self.transport
                    .send(Envelope::FileUnlock(UnlockRequest { file }));
            }
        }
    }

    // ========== Echo suppression ==========

    fn begin_guard(&mut self) {
        self.guard_count += 1;
        let events = self.events_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(APPLY_SETTLE_MS)).await;
            let _ = events.send(ClientEvent::GuardRelease).await;
        });
    }

    fn expect_fingerprint(&mut self, file: &str, hash: String) {
        let entry = self.expected_fingerprints.entry(file.to_string()).or_default();
        entry.push_back(hash);
        while entry.len() > ECHO_FINGERPRINT_CAP {
            entry.pop_front();
        }
    }

    fn consume_expected(&mut self, file: &str, hash: &str) -> bool {
        let Some(entry) = self.expected_fingerprints.get_mut(file) else {
            return false;
        };
        let Some(at) = entry.iter().position(|h| h == hash) else {
            return false;
        };
        entry.remove(at);
        if entry.is_empty() {
            self.expected_fingerprints.remove(file);
        }
        true
    }
}
