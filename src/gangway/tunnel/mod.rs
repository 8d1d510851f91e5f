//! Reverse tunnel: the control channel, pooled work connections, and the
//! per-proxy public endpoints that forward user traffic back to clients.

pub mod bridge;
pub mod client;
pub mod control;
pub mod crypto;
pub mod dispatch;
pub mod manager;
pub mod pool;
pub mod ports;
pub mod protocol;
pub mod server;
pub mod transport;
