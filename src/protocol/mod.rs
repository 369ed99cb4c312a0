//! Wire protocol for replication sessions
//!
//! Line-delimited JSON-RPC 2.0 and the static service description.

mod jsonrpc;
mod service;

pub use jsonrpc::{
    ErrorObject, JsonRpcError, JsonRpcRequest, JsonRpcResponse, JsonRpcStreamItem, ServerFrame,
};
pub use service::{FetchParams, Method, MethodKind};
