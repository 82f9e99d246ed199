//! Debug Adapter Protocol front end for the Delve Go debugger.
//!
//! In bridge mode ([`server`]) the adapter translates DAP requests into
//! Delve JSON-RPC calls itself. In proxy mode ([`proxy`]) it relays DAP
//! frames to `dlv dap`.

pub mod backend;
pub mod dap;
pub mod handles;
pub mod hardening;
pub mod launch;
pub mod paths;
pub mod proxy;
pub mod server;
pub mod session;
pub mod state;
pub mod vars;
