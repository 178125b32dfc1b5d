//! Wire types
//!
//! Each message is one JSON object per line. The satellite sends
//! [`RpcRequest`]s and the primary answers each with one [`RpcResponse`]
//! carrying the same `request_id`:
//!
//! ```text
//! → {"request_id":7,"resource_id":"01J..","method":"set_power","args":[true]}
//! ← {"request_id":7,"result":{"on":true}}
//! ← {"request_id":8,"fault":{"kind":"unknown_method","kind_name":"Plug","method":"explode"}}
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Result type for remote calls
pub type RpcResult<T> = Result<T, RpcFault>;

/// A call on a resource owned by the primary process
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcRequest {
    pub request_id: u64,
    pub resource_id: String,
    pub method: String,
    #[serde(default)]
    pub args: Vec<Value>,
}

/// Answer to one [`RpcRequest`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcResponse {
    pub request_id: u64,
    #[serde(flatten)]
    pub outcome: RpcOutcome,
}

impl RpcResponse {
    pub fn new(request_id: u64, outcome: RpcResult<Value>) -> Self {
        Self {
            request_id,
            outcome: outcome.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RpcOutcome {
    Result(Value),
    Fault(RpcFault),
}

impl From<RpcResult<Value>> for RpcOutcome {
    fn from(result: RpcResult<Value>) -> Self {
        match result {
            Ok(value) => RpcOutcome::Result(value),
            Err(fault) => RpcOutcome::Fault(fault),
        }
    }
}

impl From<RpcOutcome> for RpcResult<Value> {
    fn from(outcome: RpcOutcome) -> Self {
        match outcome {
            RpcOutcome::Result(value) => Ok(value),
            RpcOutcome::Fault(fault) => Err(fault),
        }
    }
}

/// Why a remote call failed
///
/// Faults are returned to the caller as-is; nothing is retried.
#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RpcFault {
    #[error("no remotely callable resource with id {id}")]
    UnknownResource { id: String },

    #[error("{kind_name} has no remote method {method}")]
    UnknownMethod { kind_name: String, method: String },

    #[error("invalid arguments: {message}")]
    InvalidArgs { message: String },

    #[error("handler failed: {message}")]
    HandlerFailed { message: String },

    #[error("malformed request: {message}")]
    MalformedRequest { message: String },

    #[error("channel closed")]
    ChannelClosed,

    #[error("timed out waiting for response")]
    Timeout,
}

impl RpcFault {
    pub fn handler_failed(message: impl std::fmt::Display) -> Self {
        RpcFault::HandlerFailed {
            message: message.to_string(),
        }
    }

    pub fn invalid_args(message: impl std::fmt::Display) -> Self {
        RpcFault::InvalidArgs {
            message: message.to_string(),
        }
    }
}

/// Decode positional argument `index`
pub fn arg<T: serde::de::DeserializeOwned>(args: &[Value], index: usize) -> RpcResult<T> {
    let value = args.get(index).cloned().unwrap_or(Value::Null);
    serde_json::from_value(value)
        .map_err(|e| RpcFault::invalid_args(format!("argument {}: {}", index, e)))
}
