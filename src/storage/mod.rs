//! Persistent storage for the relay.

mod db;

pub use db::Database;
