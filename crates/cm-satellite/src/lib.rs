//! Resource RPC between a satellite process and the primary runtime
//!
//! A satellite holds stand-ins for resources owned by the primary. Calls on
//! a stand-in go through a [`SatelliteClient`] as `(resource_id, method,
//! args)`; on the primary a [`SatelliteHost`] looks the resource up, runs
//! the handler registered for that method and sends back the result or an
//! [`RpcFault`].
//!
//! Plugins express this as one capability trait with two implementations:
//! a local one acting on the device and a remote one forwarding through a
//! [`RemoteResource`]. The runtime picks one at construction.

mod client;
mod host;
mod protocol;
mod transport;

pub use client::{RemoteResource, SatelliteClient};
pub use host::{RpcFuture, RpcMethod, RpcTable, SatelliteHost};
pub use protocol::{arg, RpcFault, RpcOutcome, RpcRequest, RpcResponse, RpcResult};
pub use transport::{connect_in_memory, connect_stream, serve_stream};

use thiserror::Error;

/// Result type for satellite setup and transport
pub type SatelliteResult<T> = Result<T, SatelliteError>;

/// Errors raised while wiring or running a satellite channel
///
/// Per-call failures are [`RpcFault`]s instead.
#[derive(Debug, Error)]
pub enum SatelliteError {
    #[error("slot handler already defined for {0}")]
    KindAlreadyDefined(&'static str),

    #[error("satellite I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("satellite codec error: {0}")]
    Codec(#[from] serde_json::Error),
}
