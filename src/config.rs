//! Normative constants and shared settings
//!
//! Timings and bounds used across the relay and the client. These values
//! are part of the protocol contract; changing them changes observable
//! sync behavior.

use glob::Pattern;

/// Default relay port.
pub const DEFAULT_PORT: u16 = 3777;

/// Diff rows retained per file; older rows are pruned after every insert.
pub const MAX_DIFF_HISTORY: usize = 100;

/// Debounce window for human-speed edits.
pub const DEBOUNCE_MS: u64 = 300;

/// Inter-arrival time below which consecutive writes count toward a burst.
pub const AI_BURST_THRESHOLD_MS: u64 = 50;

/// Consecutive fast writes required to classify the author as an agent.
pub const AI_BURST_COUNT: usize = 3;

/// Shortened debounce used while an agent burst is active.
pub const AI_BURST_DEBOUNCE_MS: u64 = 100;

/// Idle time after which the burst classification falls back to human.
pub const AI_BURST_IDLE_MS: u64 = 2_000;

/// Write timestamps kept for burst classification.
pub const WRITE_WINDOW: usize = 20;

/// Delay between client reconnect attempts.
pub const RECONNECT_DELAY_MS: u64 = 2_000;

/// Reconnect attempts before the client gives up.
pub const MAX_RECONNECT_ATTEMPTS: u32 = 50;

/// Absolute lock lifetime at the relay.
pub const LOCK_EXPIRY_MS: i64 = 300_000;

/// Interval of the relay's expired-lock sweeper.
pub const LOCK_SWEEP_INTERVAL_MS: u64 = 30_000;

/// Idle time after which the client releases its own lock on a file.
pub const LOCK_IDLE_RELEASE_MS: u64 = 30_000;

/// Dashboard snapshot push interval.
pub const DASHBOARD_UPDATE_INTERVAL_MS: u64 = 2_000;

/// Settle delay before the applying-incoming guard is released, letting the
/// watcher's own events for a just-written file drain.
pub const APPLY_SETTLE_MS: u64 = 200;

/// Upper bound on a single wire message.
pub const MAX_PAYLOAD_BYTES: usize = 5 * 1024 * 1024;

/// Handshake response deadline before the connection is retried from scratch.
pub const HANDSHAKE_TIMEOUT_MS: u64 = 30_000;

/// Expected fingerprints remembered per file for echo suppression.
pub const ECHO_FINGERPRINT_CAP: usize = 8;

/// Diff rows included in a dashboard snapshot.
pub const DASHBOARD_RECENT_DIFFS: usize = 30;

/// Conflict rows included in a dashboard snapshot.
pub const DASHBOARD_RECENT_CONFLICTS: usize = 10;

/// Paths never watched or synced.
pub const DEFAULT_IGNORE: &[&str] = &[
    "**/node_modules/**",
    "**/.git/**",
    "**/dist/**",
    "**/*.db",
    "**/*.db-journal",
    "**/.DS_Store",
    "**/package-lock.json",
    "**/yarn.lock",
    "**/.partsync/**",
];

/// Compiled ignore set applied to project-relative forward-slash paths.
#[derive(Debug, Clone)]
pub struct IgnoreSet {
    patterns: Vec<Pattern>,
}

impl IgnoreSet {
    /// Build from the default set plus any extra user patterns. Patterns
    /// that fail to compile are skipped with a warning.
    pub fn new(extra: &[String]) -> Self {
        let patterns = DEFAULT_IGNORE
            .iter()
            .map(|p| (*p).to_string())
            .chain(extra.iter().cloned())
            .filter_map(|p| match Pattern::new(&p) {
                Ok(pat) => Some(pat),
                Err(e) => {
                    tracing::warn!("Skipping unparseable ignore pattern {:?}: {}", p, e);
                    None
                }
            })
            .collect();
        Self { patterns }
    }

    /// Check a project-relative path (forward slashes) against the set.
    pub fn matches(&self, rel_path: &str) -> bool {
        // Leading "./" never appears in normalized paths, but patterns like
        // "**/dist/**" must also catch a top-level "dist/x", so test both the
        // bare path and a rooted variant.
        let rooted = format!("/{rel_path}");
        self.patterns
            .iter()
            .any(|p| p.matches(rel_path) || p.matches(&rooted))
    }
}

impl Default for IgnoreSet {
    fn default() -> Self {
        Self::new(&[])
    }
}

/// Current time in milliseconds since the Unix epoch.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
