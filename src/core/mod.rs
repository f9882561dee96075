//! Core sync primitives: diffing, conflict detection, locks, burst
//! classification, and the shared error type.

pub mod burst;
pub mod conflict;
pub mod diff;
pub mod error;
pub mod locks;

pub use burst::BurstDetector;
pub use conflict::MergeDecision;
pub use error::{Result, SyncError};
pub use locks::{AcquireResult, LockTable};
