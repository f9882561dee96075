//! Agent-burst detection
//!
//! Classifies the local author as human or agent from write cadence: a run
//! of rapid-fire saves is a code generator, not a person typing. The
//! classification tags outgoing diffs and locks and shortens the debounce
//! so bursts are tracked without losing coalescing.

use crate::config::{
    AI_BURST_COUNT, AI_BURST_DEBOUNCE_MS, AI_BURST_IDLE_MS, AI_BURST_THRESHOLD_MS, DEBOUNCE_MS,
    WRITE_WINDOW,
};
use crate::protocol::AuthorType;
use std::collections::VecDeque;

/// Sliding-window burst detector. Times are milliseconds since epoch so
/// the logic is directly testable.
#[derive(Debug, Default)]
pub struct BurstDetector {
    writes: VecDeque<i64>,
    /// While set and in the future, the author is classified as an agent.
    burst_until: Option<i64>,
}

impl BurstDetector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one local write and update the classification.
    pub fn record_write(&mut self, now_ms: i64) {
        self.writes.push_back(now_ms);
        while self.writes.len() > WRITE_WINDOW {
            self.writes.pop_front();
        }

        if self.burst_detected() {
            self.burst_until = Some(now_ms + AI_BURST_IDLE_MS as i64);
        } else if self.is_agent(now_ms) {
            // Still inside a burst: any write pushes the fallback out.
            self.burst_until = Some(now_ms + AI_BURST_IDLE_MS as i64);
        }
    }

    /// The last `AI_BURST_COUNT` writes all landed within the threshold of
    /// each other.
    fn burst_detected(&self) -> bool {
        if self.writes.len() < AI_BURST_COUNT {
            return false;
        }
        self.writes
            .iter()
            .rev()
            .take(AI_BURST_COUNT)
            .collect::<Vec<_>>()
            .windows(2)
            .all(|pair| (pair[0] - pair[1]) < AI_BURST_THRESHOLD_MS as i64)
    }

    /// Whether the agent classification is currently active.
    pub fn is_agent(&self, now_ms: i64) -> bool {
        self.burst_until.map(|until| now_ms < until).unwrap_or(false)
    }

    /// Author type to stamp on the next outgoing diff.
    pub fn author_type(&self, now_ms: i64) -> AuthorType {
        if self.is_agent(now_ms) {
            AuthorType::Agent
        } else {
            AuthorType::Human
        }
    }

    /// Debounce to use for the next change on this client.
    pub fn debounce_ms(&self, now_ms: i64) -> u64 {
        if self.is_agent(now_ms) {
            AI_BURST_DEBOUNCE_MS
        } else {
            DEBOUNCE_MS
        }
    }
}
