//! Error taxonomy shared by the transport and the session facades.

use std::net::SocketAddr;

use thiserror::Error;

use crate::transport::Handle;

/// Failures reported by a transport primitive.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("invalid uri {uri}: {reason}")]
    InvalidUri { uri: String, reason: String },
    #[error("failed to listen on {addr}: {source}")]
    Listen {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to start event loop: {0}")]
    Runtime(#[source] std::io::Error),
    #[error("connection {0} is no longer active")]
    UnknownHandle(Handle),
    #[error("invalid state: {0}")]
    InvalidState(&'static str),
    #[error("invalid close code {0}")]
    InvalidCloseCode(u16),
    #[error("event loop stopped")]
    Stopped,
}

/// Errors returned by the session facades. Every variant is recovered
/// locally and handed back to the caller.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("no connection found with id {0}")]
    UnknownConnection(String),
    #[error("transport rejected request: {0}")]
    TransportRejected(#[source] TransportError),
    #[error("send failed: {0}")]
    SendFailed(#[source] TransportError),
    #[error("inbound connection rejected: {0}")]
    ValidationRejected(String),
    #[error("state conflict on {id}: {reason}")]
    StateConflict { id: String, reason: String },
    #[error("endpoint is shutting down")]
    ShuttingDown,
}

impl SessionError {
    pub fn is_unknown_connection(&self) -> bool {
        matches!(self, SessionError::UnknownConnection(_))
    }
}
