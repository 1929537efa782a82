// sprite-runtime: transport and connection management for the sprite
// execution protocol.
//
// This crate is not part of the public API surface and should only be used
// through the `sprite-rs` crate.

pub mod connection;
pub mod error;
pub mod fake;
pub mod pool;
pub mod registry;
#[cfg(test)]
pub(crate) mod test_util;
pub mod transport;

pub use connection::{ControlConnection, MonitorSender, OwnerEvent, OwnerSender};
pub use error::{Error, Result};
pub use pool::{ConnectionPool, Connector, PoolConfig, PoolStats, PooledConnection};
pub use registry::{PoolRegistry, Target};
pub use transport::{Transport, TransportParts, TransportReceiver, WireMessage, connect, ws_url};
