//! Transport capabilities — the boundary to the WebSocket implementation.
//!
//! The transport owns sockets and the event loop. Everything above it only
//! sees opaque `Handle`s and receives lifecycle events through a
//! `ConnectionEvents` listener registered once per connection. All events are
//! delivered on the single thread that is inside `Transport::run`.

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use crate::error::{SessionError, TransportError};
use crate::record::Payload;

/// Opaque transport-layer reference to one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Handle(u64);

impl Handle {
    pub fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub fn raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "h{}", self.0)
    }
}

/// Close information reported by the peer (or synthesised on abnormal loss).
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CloseInfo {
    pub code: Option<u16>,
    pub reason: String,
}

/// Per-connection lifecycle listener.
pub trait ConnectionEvents: Send + Sync {
    /// Handshake completed. `remote_banner` is the peer's self-description
    /// (`Server` header for outbound, `User-Agent` for inbound).
    fn on_open(&self, remote_banner: Option<String>);

    /// Handshake or connect failed before the connection opened.
    fn on_fail(&self, reason: String);

    /// Connection closed after (or instead of) opening.
    fn on_close(&self, close: CloseInfo);

    fn on_message(&self, payload: Payload);
}

/// What the server sees of an inbound request before it is accepted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundRequest {
    pub uri: String,
    pub query: Option<String>,
    pub peer_addr: Option<SocketAddr>,
    pub user_agent: Option<String>,
}

/// Inbound validation hook, invoked on the event-loop thread before the
/// handshake response is written. Returning an error refuses the connection.
pub trait Acceptor: Send + Sync {
    fn on_validate(
        &self,
        handle: Handle,
        request: &InboundRequest,
    ) -> Result<Arc<dyn ConnectionEvents>, SessionError>;
}

/// Connect/send/close primitives plus the event loop that drives them.
///
/// `create`, `connect`, `send` and `close` only submit work; outcomes arrive
/// later through `ConnectionEvents`.
pub trait Transport: Send + Sync + 'static {
    /// Validate `uri` and reserve a handle. No network activity.
    fn create(&self, uri: &str) -> Result<Handle, TransportError>;

    /// Start the asynchronous connect for a handle returned by `create`.
    fn connect(
        &self,
        handle: Handle,
        events: Arc<dyn ConnectionEvents>,
    ) -> Result<(), TransportError>;

    fn send(&self, handle: Handle, payload: Payload) -> Result<(), TransportError>;

    fn close(&self, handle: Handle, code: u16, reason: &str) -> Result<(), TransportError>;

    /// Pump the event loop on the calling thread until `stop` was called and
    /// in-flight connections have delivered their final event.
    fn run(&self);

    /// Leave perpetual mode. Idempotent.
    fn stop(&self);
}

/// A transport that can also accept inbound connections.
pub trait ServerTransport: Transport {
    /// Bind and start accepting. Returns the bound address.
    fn listen(
        &self,
        addr: SocketAddr,
        acceptor: Arc<dyn Acceptor>,
    ) -> Result<SocketAddr, TransportError>;

    fn stop_listening(&self);
}
