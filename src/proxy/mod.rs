//! Remote proxy layer: the wire codec and the TCP server that exposes the
//! registry and session manager to remote clients.

pub mod server;
pub mod wire;

pub use server::ProxyServer;
