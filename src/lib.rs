//! partsync: near-real-time, diff-based synchronization of a project's
//! text-file tree across cooperating endpoints via a central relay.
//!
//! The relay owns history, per-file version fingerprints, soft locks, and
//! conflict records; clients own content and converge by exchanging
//! unified-diff patches.

pub mod client;
pub mod config;
pub mod core;
pub mod protocol;
pub mod relay;
pub mod storage;
