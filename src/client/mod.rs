//! Client side: watcher, transport, and the sync loop.

pub mod sync;
pub mod transport;
pub mod watcher;

pub use sync::{ClientOptions, SyncClient};
pub use transport::{Transport, TransportEvent};
