//! Wire-level protocol adapters. One JSON-RPC 2.0 envelope, one MCP method
//! table, two transports (HTTP request/response and newline-delimited
//! stdio) that both funnel into [`crate::persistence_adapter::dispatch`].

pub mod http;
pub mod jsonrpc;
pub mod stdio;

pub use jsonrpc::{JsonRpcError, JsonRpcRequest, JsonRpcResponse};
