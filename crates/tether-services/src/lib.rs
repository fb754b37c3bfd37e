//! tether-services — connection registry, lifecycle state machine, and the
//! client/server endpoints built on them.

pub mod client;
pub mod lifecycle;
pub mod registry;
pub mod server;
pub mod shutdown;

#[cfg(test)]
mod testing;

pub use client::ClientEndpoint;
pub use lifecycle::LifecycleController;
pub use registry::{ConnectionKey, ConnectionRegistry};
pub use server::{derive_connection_id, InboundValidator, ServerEndpoint, SEND_CLOSE_REASON};
pub use shutdown::{drain_open, DrainReport};
