//! Async client for Delve's JSON-RPC service (`dlv --headless --api-version=2`).
//!
//! The client multiplexes concurrent calls over one TCP connection. Resume
//! commands block on the server until the target stops, so a `halt` issued
//! from another task is the only way to interrupt them.

mod client;
mod codec;
pub mod types;

#[cfg(any(test, feature = "wire-test-support"))]
pub mod mock;

pub use client::{DelveClient, DelveClientConfig};
pub use codec::{decode_reply, encode_request, JsonStreamDecoder, RpcReply, MAX_RPC_MESSAGE_BYTES};
pub use types::{DelveError, Result};
