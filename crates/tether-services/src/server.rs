//! Server endpoint — inbound connections addressed by a string key taken
//! from the handshake request.
//!
//! Records are created only by `InboundValidator`, on the event-loop thread,
//! before the handshake response is written. The registry tracks currently
//! addressable peers: `send_close` evicts as soon as the transport accepted
//! the close.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use url::form_urlencoded;

use tether_core::{
    close_code, Acceptor, ConnectionEvents, ConnectionRecord, ConnectionSnapshot, Handle,
    InboundRequest, Payload, ServerConfig, ServerTransport, SessionError, ShutdownConfig,
};

use crate::lifecycle::LifecycleController;
use crate::registry::ConnectionRegistry;
use crate::shutdown::{drain_open, DrainReport};

/// Reason sent by `send_close`.
pub const SEND_CLOSE_REASON: &str = "terminating...";

pub struct ServerEndpoint<T: ServerTransport> {
    transport: Arc<T>,
    registry: ConnectionRegistry<String>,
    controller: LifecycleController<String>,
    config: ServerConfig,
    shutdown: ShutdownConfig,
    stopping: AtomicBool,
}

impl<T: ServerTransport> ServerEndpoint<T> {
    pub fn new(transport: Arc<T>, config: ServerConfig, shutdown: ShutdownConfig) -> Self {
        let registry = ConnectionRegistry::new();
        Self {
            transport,
            controller: LifecycleController::new(registry.clone()),
            registry,
            config,
            shutdown,
            stopping: AtomicBool::new(false),
        }
    }

    /// Bind the configured address and start accepting.
    pub fn init(&self) -> Result<SocketAddr, SessionError> {
        let validator = Arc::new(InboundValidator {
            registry: self.registry.clone(),
            controller: self.controller.clone(),
            id_param: self.config.id_param.clone(),
        });
        let bound = self
            .transport
            .listen(self.config.socket_addr(), validator)
            .map_err(SessionError::TransportRejected)?;
        tracing::info!(addr = %bound, id_param = %self.config.id_param, "listening");
        Ok(bound)
    }

    /// Pump the event loop on the calling thread until `stop` has drained it.
    pub fn run(&self) {
        self.transport.run();
    }

    /// Stop accepting, close every live peer, and let `run` return. Idempotent.
    pub fn stop(&self) -> DrainReport {
        if self.stopping.swap(true, Ordering::AcqRel) {
            return DrainReport::default();
        }
        self.transport.stop_listening();
        let report = drain_open(
            &self.registry,
            self.transport.as_ref(),
            self.shutdown.server_code,
            &self.shutdown.server_reason,
            true,
        );
        tracing::info!(closed = report.closed, failed = report.failed, "server stopping");
        self.transport.stop();
        report
    }

    pub fn send_data(&self, id: &str, data: impl Into<Payload>) -> Result<(), SessionError> {
        let payload = data.into();
        self.registry
            .with_entry(&id.to_string(), |record| {
                self.transport
                    .send(record.handle(), payload.clone())
                    .map_err(SessionError::SendFailed)?;
                record.record_sent(&payload);
                Ok(())
            })
            .unwrap_or_else(|| Err(SessionError::UnknownConnection(id.to_string())))
    }

    /// Close with normal status and evict the entry.
    pub fn send_close(&self, id: &str) -> Result<(), SessionError> {
        let key = id.to_string();
        let handle = self
            .registry
            .with_entry(&key, |record| {
                self.transport
                    .close(record.handle(), close_code::NORMAL, SEND_CLOSE_REASON)
                    .map_err(SessionError::TransportRejected)?;
                record.mark_close_requested();
                Ok(record.handle())
            })
            .unwrap_or_else(|| Err(SessionError::UnknownConnection(id.to_string())))?;

        // A new peer may have claimed the id in between; only evict our own.
        self.registry.remove_if(&key, |r| r.handle() == handle);
        tracing::info!(id, handle = %handle, "connection closed and evicted");
        Ok(())
    }

    pub fn describe(&self, id: &str) -> Option<ConnectionSnapshot> {
        self.registry.lookup(&id.to_string())
    }

    /// Snapshots of every tracked peer, ordered by id.
    pub fn connections(&self) -> Vec<ConnectionSnapshot> {
        let mut all = Vec::with_capacity(self.registry.len());
        self.registry.for_each(|_, snap| all.push(snap.clone()));
        all.sort_by(|a, b| a.id.cmp(&b.id));
        all
    }

    pub fn connection_count(&self) -> usize {
        self.registry.len()
    }
}

// ── Validation ────────────────────────────────────────────────────────────────

/// The server's `Acceptor`: derives the id and creates the record.
pub struct InboundValidator {
    registry: ConnectionRegistry<String>,
    controller: LifecycleController<String>,
    id_param: String,
}

impl Acceptor for InboundValidator {
    fn on_validate(
        &self,
        handle: Handle,
        request: &InboundRequest,
    ) -> Result<Arc<dyn ConnectionEvents>, SessionError> {
        let id = derive_connection_id(request, &self.id_param).inspect_err(|e| {
            tracing::warn!(handle = %handle, uri = %request.uri, error = %e, "inbound connection refused");
        })?;

        if self
            .registry
            .remove_if(&id, |r| r.state().is_terminal())
            .is_some()
        {
            tracing::debug!(id = %id, "reclaimed id from settled connection");
        }
        self.registry
            .insert(ConnectionRecord::new(id.clone(), handle, request.uri.clone()))
            .inspect_err(|e| {
                tracing::warn!(handle = %handle, error = %e, "inbound connection refused");
            })?;

        tracing::info!(id = %id, handle = %handle, peer = ?request.peer_addr, "inbound connection validated");
        Ok(self.controller.bind(id, handle))
    }
}

/// Connection id from the `param` query parameter of the handshake request.
pub fn derive_connection_id(request: &InboundRequest, param: &str) -> Result<String, SessionError> {
    let query = request
        .query
        .as_deref()
        .filter(|q| !q.is_empty())
        .ok_or_else(|| SessionError::ValidationRejected("request has no query string".to_string()))?;

    form_urlencoded::parse(query.as_bytes())
        .find(|(key, _)| key == param)
        .map(|(_, value)| value.into_owned())
        .filter(|value| !value.is_empty())
        .ok_or_else(|| {
            SessionError::ValidationRejected(format!("missing `{param}` query parameter"))
        })
}
