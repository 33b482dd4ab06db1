//! Core library for the labhost instrument server.
//!
//! labhost exposes physical laboratory devices (tunable lasers, detectors,
//! motion controllers, ...) attached to a host machine as remotely
//! addressable objects. Client code anywhere on the lab network can drive
//! hardware through a small request/response protocol without linking
//! against device-specific transport code.
//!
//! The crate is organized around five layers, leaf-first:
//!
//! - [`transport`]: byte-oriented adapters over serial lines, VISA buses and
//!   raw sockets, with a uniform open/write/read/query contract.
//! - [`driver`]: per-instrument-family drivers that translate domain
//!   operations (e.g. `set_wavelength`) into adapter-level byte exchanges.
//! - [`session`]: the session manager, which enforces exclusive hardware
//!   access with FIFO queueing, lease expiry, and bounded reconnection.
//! - [`registry`]: the naming service mapping logical instrument names to
//!   network endpoints, with liveness expiry.
//! - [`proxy`]: the network-facing boundary serving the naming and session
//!   APIs over a length-prefixed wire protocol.

pub mod client;
pub mod config;
pub mod driver;
pub mod error;
pub mod proxy;
pub mod registry;
pub mod session;
pub mod transport;

pub use error::{AppResult, LabError};
