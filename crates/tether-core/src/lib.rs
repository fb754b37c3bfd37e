//! tether-core — connection records, transport capabilities, errors and config.
//! All other tether crates depend on this one.

pub mod config;
pub mod error;
pub mod record;
pub mod transport;

pub use config::{ClientConfig, ServerConfig, ShutdownConfig, TetherConfig, TransportConfig};
pub use error::{SessionError, TransportError};
pub use record::{
    close_code, close_status_name, ConnectionRecord, ConnectionSnapshot, ConnectionState,
    Direction, InvalidTransition, LoggedMessage, Payload,
};
pub use transport::{
    Acceptor, CloseInfo, ConnectionEvents, Handle, InboundRequest, ServerTransport, Transport,
};
