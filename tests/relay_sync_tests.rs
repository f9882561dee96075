//! Integration tests for the relay over real WebSocket connections
//!
//! These spin the axum surface on an ephemeral port, connect raw
//! tokio-tungstenite peers, and drive the protocol end to end: diff
//! broadcast, conflict detection, handshake replay, locks, and undo.
//! Run with: cargo test --test relay_sync_tests -- --nocapture

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use partsync::core::diff::{apply_patch, fingerprint, make_patch};
use partsync::protocol::{
    AuthorType, Envelope, FileDiff, LockRequest, LockType, SyncHandshake, UndoRequest,
};
use partsync::relay::server::router;
use partsync::relay::Relay;
use partsync::storage::Database;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

type WsWrite = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;
type WsRead = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

struct TestPeer {
    write: WsWrite,
    read: WsRead,
}

impl TestPeer {
    /// Connect and complete a handshake round trip, so the relay has
    /// registered this peer before the test sends anything else.
    async fn connect(addr: SocketAddr, name: &str) -> Self {
        let url = format!("ws://{addr}/ws?clientName={name}");
        let (stream, _) = connect_async(url.as_str()).await.expect("connect");
        let (write, read) = stream.split();
        let mut peer = Self { write, read };
        peer.send(Envelope::SyncHandshake(SyncHandshake {
            request_id: None,
            client_id: name.into(),
            project_id: "demo".into(),
            file_versions: Default::default(),
        }))
        .await;
        peer.expect("registration handshake", |e| {
            matches!(e, Envelope::SyncHandshakeResponse(_))
        })
        .await;
        peer
    }

    async fn send(&mut self, message: Envelope) {
        let text = message.encode().expect("encode");
        self.write
            .send(Message::Text(text.into()))
            .await
            .expect("send");
    }

    /// Receive the next envelope matching the predicate, skipping noise
    /// like interleaved lock broadcasts.
    async fn expect<F>(&mut self, what: &str, mut predicate: F) -> Envelope
    where
        F: FnMut(&Envelope) -> bool,
    {
        let deadline = Duration::from_secs(5);
        tokio::time::timeout(deadline, async {
            while let Some(Ok(message)) = self.read.next().await {
                if let Message::Text(text) = message {
                    if let Ok(envelope) = Envelope::decode(text.as_str()) {
                        if predicate(&envelope) {
                            return envelope;
                        }
                    }
                }
            }
            panic!("connection closed while waiting for {what}");
        })
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {what}"))
    }
}

async fn start_relay() -> (TempDir, SocketAddr, Arc<Relay>) {
    let dir = TempDir::new().unwrap();
    let db = Arc::new(Database::open(dir.path().join("partsync.db")).unwrap());
    let relay = Relay::new(db, 0);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = router(relay.clone());
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (dir, addr, relay)
}

fn diff_between(file: &str, old: &str, new: &str, author: &str) -> FileDiff {
    FileDiff {
        id: None,
        file: file.into(),
        patch: make_patch(old, new),
        author: author.into(),
        author_type: AuthorType::Human,
        timestamp: chrono::Utc::now().timestamp_millis(),
        version: fingerprint(new),
        previous_version: fingerprint(old),
        compressed: false,
    }
}

#[tokio::test]
async fn test_diff_reaches_other_peers_with_id() {
    let (_dir, addr, _relay) = start_relay().await;
    let mut alice = TestPeer::connect(addr, "alice").await;
    let mut bob = TestPeer::connect(addr, "bob").await;

    let base = "line1\nline2\nline3\n";
    let edited = "line1\nline2\nline3\nline4\n";
    alice
        .send(Envelope::FileDiff(diff_between(
            "notes.txt", base, edited, "alice",
        )))
        .await;

    let received = bob
        .expect("rebroadcast diff", |e| matches!(e, Envelope::FileDiff(_)))
        .await;
    let Envelope::FileDiff(diff) = received else {
        unreachable!()
    };
    assert!(diff.id.is_some(), "stored diff carries its id");
    assert_eq!(diff.author, "alice");

    // Applying the broadcast patch converges bob onto alice's content.
    let outcome = apply_patch(&diff.patch, base);
    assert!(outcome.ok);
    assert_eq!(fingerprint(&outcome.result), diff.version);
    assert_eq!(outcome.result, edited);
}

#[tokio::test]
async fn test_overlapping_concurrent_edits_emit_one_conflict() {
    let (_dir, addr, relay) = start_relay().await;
    let mut alice = TestPeer::connect(addr, "alice").await;
    let mut bob = TestPeer::connect(addr, "bob").await;

    let base = "line1\nline2\nline3\n";
    let from_a = "line1\nTWO-A\nline3\n";
    let from_b = "line1\nTWO-B\nline3\n";

    alice
        .send(Envelope::FileDiff(diff_between(
            "foo.txt", base, from_a, "alice",
        )))
        .await;
    // Bob edited the same base without seeing alice's version.
    bob.send(Envelope::FileDiff(diff_between(
        "foo.txt", base, from_b, "bob",
    )))
    .await;

    // Both peers are told, alice included.
    for peer in [&mut alice, &mut bob] {
        let event = peer
            .expect("conflict", |e| matches!(e, Envelope::FileConflict(_)))
            .await;
        let Envelope::FileConflict(conflict) = event else {
            unreachable!()
        };
        assert_eq!(conflict.author_a, "alice");
        assert_eq!(conflict.author_b, "bob");
        assert!(conflict.conflict_file.starts_with("foo.conflict-"));
        assert!(conflict.conflict_file.ends_with(".txt"));
        assert!(!conflict.resolved);
    }

    // Exactly one record; both diffs stored regardless.
    let conflicts = relay.db.recent_conflicts(10).unwrap();
    assert_eq!(conflicts.len(), 1);
    assert_eq!(relay.db.diffs_by_file("foo.txt", 10).unwrap().len(), 2);
}

#[tokio::test]
async fn test_handshake_replays_missed_diffs_oldest_first() {
    let (_dir, addr, _relay) = start_relay().await;
    let mut alice = TestPeer::connect(addr, "alice").await;

    // Three edits to three files while bob is away.
    let mut latest = Vec::new();
    for i in 0..3 {
        let file = format!("f{i}.txt");
        let old = format!("file {i}\n");
        let new = format!("file {i}\nedited\n");
        alice
            .send(Envelope::FileDiff(diff_between(&file, &old, &new, "alice")))
            .await;
        latest.push((file, old, new));
    }

    // Give the relay a beat to persist before the handshake reads state.
    tokio::time::sleep(Duration::from_millis(200)).await;

    let mut bob = TestPeer::connect(addr, "bob").await;
    bob.send(Envelope::SyncHandshake(SyncHandshake {
        request_id: Some(1),
        client_id: "bob".into(),
        project_id: "demo".into(),
        file_versions: Default::default(),
    }))
    .await;

    let response = bob
        .expect("handshake response", |e| {
            matches!(e, Envelope::SyncHandshakeResponse(_))
        })
        .await;
    let Envelope::SyncHandshakeResponse(response) = response else {
        unreachable!()
    };
    assert_eq!(response.request_id, Some(1));
    assert_eq!(response.missing_diffs.len(), 3);
    assert!(response.full_files.is_empty());

    // Each replayed chain applies onto bob's (stale) copy.
    for (file, old, new) in &latest {
        let diff = response
            .missing_diffs
            .iter()
            .find(|d| &d.file == file)
            .expect("diff for file");
        let outcome = apply_patch(&diff.patch, old);
        assert!(outcome.ok);
        assert_eq!(&outcome.result, new);
    }
}

#[tokio::test]
async fn test_lock_denied_until_holder_releases() {
    let (_dir, addr, _relay) = start_relay().await;
    let mut alice = TestPeer::connect(addr, "alice").await;
    let mut bob = TestPeer::connect(addr, "bob").await;

    alice
        .send(Envelope::FileLock(LockRequest {
            file: "x.ts".into(),
            lock_type: LockType::Editing,
        }))
        .await;
    let locks = bob
        .expect("lock broadcast", |e| {
            matches!(e, Envelope::FileLockChanged(locks) if !locks.is_empty())
        })
        .await;
    let Envelope::FileLockChanged(locks) = locks else {
        unreachable!()
    };
    assert_eq!(locks[0].locked_by, "alice");

    // Bob's acquire does not steal the unexpired lock.
    bob.send(Envelope::FileLock(LockRequest {
        file: "x.ts".into(),
        lock_type: LockType::Editing,
    }))
    .await;
    let locks = bob
        .expect("lock broadcast", |e| matches!(e, Envelope::FileLockChanged(_)))
        .await;
    let Envelope::FileLockChanged(locks) = locks else {
        unreachable!()
    };
    assert_eq!(locks.len(), 1);
    assert_eq!(locks[0].locked_by, "alice");

    // Holder disconnect frees the file.
    drop(alice);
    let locks = bob
        .expect("release broadcast", |e| {
            matches!(e, Envelope::FileLockChanged(locks) if locks.is_empty())
        })
        .await;
    assert!(matches!(locks, Envelope::FileLockChanged(_)));
}

#[tokio::test]
async fn test_undo_restores_previous_fingerprint_on_both_peers() {
    let (_dir, addr, _relay) = start_relay().await;
    let mut alice = TestPeer::connect(addr, "alice").await;
    let mut bob = TestPeer::connect(addr, "bob").await;

    let v0 = "alpha\nbeta\n";
    let v1 = "alpha\nbeta edited\n";
    alice
        .send(Envelope::FileDiff(diff_between("m.ts", v0, v1, "alice")))
        .await;
    let Envelope::FileDiff(stored) = bob
        .expect("rebroadcast", |e| matches!(e, Envelope::FileDiff(_)))
        .await
    else {
        unreachable!()
    };
    let diff_id = stored.id.unwrap();

    alice
        .send(Envelope::DiffUndo(UndoRequest {
            file: "m.ts".into(),
            diff_id,
        }))
        .await;

    // Everyone gets the inverse, the sender included.
    for (name, peer) in [("alice", &mut alice), ("bob", &mut bob)] {
        let Envelope::FileDiff(inverse) = peer
            .expect("inverse diff", |e| matches!(e, Envelope::FileDiff(_)))
            .await
        else {
            unreachable!()
        };
        assert_eq!(inverse.version, fingerprint(v0), "peer {name}");
        assert_eq!(inverse.previous_version, fingerprint(v1));
        let outcome = apply_patch(&inverse.patch, v1);
        assert!(outcome.ok);
        assert_eq!(fingerprint(&outcome.result), fingerprint(v0));
    }
}

#[tokio::test]
async fn test_full_file_rebroadcast_and_delete() {
    let (_dir, addr, relay) = start_relay().await;
    let mut alice = TestPeer::connect(addr, "alice").await;
    let mut bob = TestPeer::connect(addr, "bob").await;

    alice
        .send(Envelope::SyncFullFile(partsync::protocol::FullFileSync {
            file: "fresh.txt".into(),
            content: "hello\n".into(),
            hash: fingerprint("hello\n"),
        }))
        .await;

    let Envelope::SyncApplyFullFile(payload) = bob
        .expect("apply-full-file", |e| {
            matches!(e, Envelope::SyncApplyFullFile(_))
        })
        .await
    else {
        unreachable!()
    };
    assert_eq!(payload.content, "hello\n");
    assert_eq!(
        relay.db.get_version("fresh.txt").unwrap().unwrap().hash,
        fingerprint("hello\n")
    );

    alice
        .send(Envelope::FileDelete(partsync::protocol::FileDeletePayload {
            file: "fresh.txt".into(),
            author: "alice".into(),
        }))
        .await;
    let Envelope::FileDelete(deleted) = bob
        .expect("delete", |e| matches!(e, Envelope::FileDelete(_)))
        .await
    else {
        unreachable!()
    };
    assert_eq!(deleted.file, "fresh.txt");
    assert_eq!(deleted.author, "alice");
}

#[tokio::test]
async fn test_dashboard_subscribe_pushes_immediate_state() {
    let (_dir, addr, _relay) = start_relay().await;
    let mut viewer = TestPeer::connect(addr, "viewer").await;

    viewer.send(Envelope::DashboardSubscribe).await;
    let Envelope::DashboardState(state) = viewer
        .expect("dashboard state", |e| matches!(e, Envelope::DashboardState(_)))
        .await
    else {
        unreachable!()
    };
    assert_eq!(state.clients.len(), 1);
    assert_eq!(state.clients[0].display_name, "viewer");
    assert_eq!(state.health.total_diffs, 0);
}

#[tokio::test]
async fn test_health_endpoint() {
    let (_dir, addr, _relay) = start_relay().await;
    let body: serde_json::Value = reqwest::get(format!("http://{addr}/health"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["status"], "ok");
    assert_eq!(body["name"], "partsync");
    assert!(body["uptimeHuman"].is_string());

    let status: serde_json::Value = reqwest::get(format!("http://{addr}/api/status"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(status["status"], "ok");
}
