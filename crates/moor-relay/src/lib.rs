//! Client for the moor collaboration relay.
//!
//! Joins a remote workspace session over a TLS websocket, multiplexes
//! RPC calls and server notifications on the one connection, and
//! bridges shared remote ports to local listeners.

pub mod error;
mod ports;
pub mod rpc;
pub mod session;
pub mod transport;
pub mod tunnel;

pub use error::RelayError;
pub use rpc::{RelayStream, RpcClient};
pub use session::{Connection, RelayClient, Session};
pub use transport::{Transport, TransportPeer};
pub use tunnel::Tunnel;

pub use moor_protocol::{ChannelId, Port, PortChangeKind, PortNotification};
