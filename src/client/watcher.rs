//! Project directory watcher
//!
//! Bridges notify's callback thread into the client's event loop and
//! filters everything through the ignore set. Events carry project-relative
//! forward-slash paths; classification into added/changed/removed is
//! finished by the sync loop, which knows the cache state.

use crate::config::IgnoreSet;
use crate::core::error::{Result, SyncError};
use notify::{
    event::{CreateKind, ModifyKind, RemoveKind, RenameMode},
    Config, EventKind, RecommendedWatcher, RecursiveMode, Watcher,
};
use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;
use tokio::sync::mpsc;
use walkdir::WalkDir;

/// Raw watcher event, pre-classification.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FsEvent {
    /// Created or modified on disk.
    Touched { path: String },
    /// Gone from disk.
    Removed { path: String },
}

impl FsEvent {
    pub fn path(&self) -> &str {
        match self {
            FsEvent::Touched { path } | FsEvent::Removed { path } => path,
        }
    }
}

/// Watches one project root. Dropping this stops the watcher.
pub struct ProjectWatcher {
    _watcher: RecommendedWatcher,
}

impl ProjectWatcher {
    /// Start watching `root` recursively, emitting filtered events into the
    /// returned channel.
    pub fn start(root: &Path, ignore: IgnoreSet) -> Result<(Self, mpsc::Receiver<FsEvent>)> {
        if !root.is_dir() {
            return Err(SyncError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("not a directory: {root:?}"),
            )));
        }
        // Watch the resolved path so event paths strip cleanly even when
        // the root was reached through a symlink.
        let root = root.canonicalize()?;

        let (raw_tx, mut raw_rx) = mpsc::channel::<notify::Result<notify::Event>>(256);
        let mut watcher = RecommendedWatcher::new(
            move |res| {
                let _ = raw_tx.blocking_send(res);
            },
            Config::default().with_poll_interval(Duration::from_secs(2)),
        )
        .map_err(|e| SyncError::ConnectionFailed(format!("watcher init: {e}")))?;
        watcher
            .watch(&root, RecursiveMode::Recursive)
            .map_err(|e| SyncError::ConnectionFailed(format!("watch {root:?}: {e}")))?;
        tracing::info!("Watching {:?}", root);

        let (event_tx, event_rx) = mpsc::channel::<FsEvent>(256);
        tokio::spawn(async move {
            while let Some(res) = raw_rx.recv().await {
                match res {
                    Ok(event) => {
                        for fs_event in convert_event(&event, &root, &ignore) {
                            if event_tx.send(fs_event).await.is_err() {
                                return;
                            }
                        }
                    }
                    Err(e) => {
                        tracing::warn!("File watcher error: {}", e);
                    }
                }
            }
            tracing::debug!("File watcher channel closed");
        });

        Ok((Self { _watcher: watcher }, event_rx))
    }
}

/// Convert one notify event into sync events, applying the ignore set.
fn convert_event(event: &notify::Event, root: &Path, ignore: &IgnoreSet) -> Vec<FsEvent> {
    let mut out = Vec::new();
    let mut push = |path: &PathBuf, removed: bool| {
        if let Some(rel) = relative_path(root, path) {
            if !ignore.matches(&rel) {
                out.push(if removed {
                    FsEvent::Removed { path: rel }
                } else {
                    FsEvent::Touched { path: rel }
                });
            }
        }
    };

    match &event.kind {
        EventKind::Create(CreateKind::File)
        | EventKind::Modify(ModifyKind::Data(_))
        | EventKind::Modify(ModifyKind::Any) => {
            if let Some(path) = event.paths.first() {
                if path.is_file() {
                    push(path, false);
                }
            }
        }
        EventKind::Remove(RemoveKind::File) | EventKind::Remove(RemoveKind::Any) => {
            if let Some(path) = event.paths.first() {
                push(path, true);
            }
        }
        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) => {
            // A rename surfaces as removal of the old path plus content at
            // the new one.
            if event.paths.len() >= 2 {
                push(&event.paths[0], true);
                let new_path = &event.paths[1];
                if new_path.is_file() {
                    push(new_path, false);
                }
            }
        }
        EventKind::Modify(ModifyKind::Name(_)) => {
            if let Some(path) = event.paths.first() {
                push(path, !path.exists());
            }
        }
        _ => {}
    }
    out
}

/// Project-relative forward-slash form of an absolute path.
pub fn relative_path(root: &Path, path: &Path) -> Option<String> {
    let rel = path.strip_prefix(root).ok()?;
    let parts: Vec<String> = rel
        .components()
        .filter_map(|c| match c {
            Component::Normal(name) => Some(name.to_string_lossy().to_string()),
            _ => None,
        })
        .collect();
    if parts.is_empty() {
        None
    } else {
        Some(parts.join("/"))
    }
}

/// Resolve a project-relative path under `root`, rejecting traversal.
pub fn safe_join(root: &Path, rel: &str) -> Option<PathBuf> {
    let rel_path = Path::new(rel);
    if rel_path.is_absolute()
        || rel_path
            .components()
            .any(|c| !matches!(c, Component::Normal(_)))
    {
        return None;
    }
    Some(root.join(rel_path))
}

/// Walk the project once, loading every UTF-8 text file through the ignore
/// filter. Non-text files are skipped silently.
pub fn initial_scan(root: &Path, ignore: &IgnoreSet) -> HashMap<String, String> {
    let mut contents = HashMap::new();
    for entry in WalkDir::new(root).into_iter().filter_map(|e| e.ok()) {
        if !entry.file_type().is_file() {
            continue;
        }
        let Some(rel) = relative_path(root, entry.path()) else {
            continue;
        };
        if ignore.matches(&rel) {
            continue;
        }
        match std::fs::read(entry.path()) {
            Ok(bytes) => match String::from_utf8(bytes) {
                Ok(text) => {
                    contents.insert(rel, text);
                }
                Err(_) => {
                    tracing::debug!(file = %rel, "Skipping non-UTF-8 file");
                }
            },
            Err(e) => {
                tracing::debug!(file = %rel, "Skipping unreadable file: {}", e);
            }
        }
    }
    tracing::info!("Initial scan loaded {} files", contents.len());
    contents
}
