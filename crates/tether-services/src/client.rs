//! Client endpoint — outbound connections addressed by integer id.
//!
//! Owns the registry, the lifecycle controller, and the dedicated event-loop
//! thread. Control-path calls only submit work to the transport; outcomes
//! arrive later on the event-loop thread and land in the registry.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::Mutex;

use tether_core::{
    ConnectionRecord, ConnectionSnapshot, Payload, SessionError, ShutdownConfig, Transport,
    TransportError,
};

use crate::lifecycle::LifecycleController;
use crate::registry::ConnectionRegistry;
use crate::shutdown::{drain_open, DrainReport};

pub struct ClientEndpoint<T: Transport> {
    transport: Arc<T>,
    registry: ConnectionRegistry<u64>,
    controller: LifecycleController<u64>,
    next_id: AtomicU64,
    accepting: AtomicBool,
    shutdown: ShutdownConfig,
    event_loop: Mutex<Option<JoinHandle<()>>>,
}

impl<T: Transport> ClientEndpoint<T> {
    /// Start the event-loop thread and return a ready endpoint.
    pub fn start(transport: Arc<T>, shutdown: ShutdownConfig) -> Result<Self, SessionError> {
        let looped = transport.clone();
        let event_loop = std::thread::Builder::new()
            .name("tether-event-loop".to_string())
            .spawn(move || {
                tracing::debug!("event loop started");
                looped.run();
                tracing::debug!("event loop finished");
            })
            .map_err(|e| SessionError::TransportRejected(TransportError::Runtime(e)))?;

        let registry = ConnectionRegistry::new();
        Ok(Self {
            transport,
            controller: LifecycleController::new(registry.clone()),
            registry,
            next_id: AtomicU64::new(0),
            accepting: AtomicBool::new(true),
            shutdown,
            event_loop: Mutex::new(Some(event_loop)),
        })
    }

    /// Begin an outbound connection. Returns as soon as the connect is
    /// submitted; the record starts in Connecting.
    pub fn connect(&self, uri: &str) -> Result<u64, SessionError> {
        if !self.accepting.load(Ordering::Acquire) {
            return Err(SessionError::ShuttingDown);
        }

        let handle = self
            .transport
            .create(uri)
            .map_err(SessionError::TransportRejected)?;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.registry.insert(ConnectionRecord::new(id, handle, uri))?;

        if let Err(e) = self.transport.connect(handle, self.controller.bind(id, handle)) {
            self.registry.remove(&id);
            return Err(SessionError::TransportRejected(e));
        }

        tracing::info!(id, handle = %handle, uri, "connection requested");
        Ok(id)
    }

    pub fn send(&self, id: u64, payload: impl Into<Payload>) -> Result<(), SessionError> {
        let payload = payload.into();
        self.registry
            .with_entry(&id, |record| {
                self.transport
                    .send(record.handle(), payload.clone())
                    .map_err(SessionError::SendFailed)?;
                record.record_sent(&payload);
                Ok(())
            })
            .unwrap_or_else(|| Err(SessionError::UnknownConnection(id.to_string())))
    }

    /// Request a close. The record moves to Closed when the transport reports
    /// the close; it stays queryable afterwards.
    pub fn close(&self, id: u64, code: u16, reason: &str) -> Result<(), SessionError> {
        self.registry
            .with_entry(&id, |record| {
                self.transport
                    .close(record.handle(), code, reason)
                    .map_err(SessionError::TransportRejected)?;
                record.mark_close_requested();
                Ok(())
            })
            .unwrap_or_else(|| Err(SessionError::UnknownConnection(id.to_string())))?;

        tracing::info!(id, code, reason, "close requested");
        Ok(())
    }

    pub fn describe(&self, id: u64) -> Option<ConnectionSnapshot> {
        self.registry.lookup(&id)
    }

    pub fn ids(&self) -> Vec<u64> {
        let mut ids = self.registry.ids();
        ids.sort_unstable();
        ids
    }

    /// Close every Open connection with the configured going-away status,
    /// stop the event loop, and wait for it to finish. Idempotent.
    pub fn shutdown(&self) -> DrainReport {
        let mut report = DrainReport::default();
        if self.accepting.swap(false, Ordering::AcqRel) {
            report = drain_open(
                &self.registry,
                self.transport.as_ref(),
                self.shutdown.client_code,
                &self.shutdown.client_reason,
                false,
            );
            tracing::info!(closed = report.closed, failed = report.failed, "client shutting down");
        }

        self.transport.stop();
        // Held across the join: every caller returns only after the loop exits.
        let mut event_loop = self.event_loop.lock();
        if let Some(handle) = event_loop.take() {
            if handle.join().is_err() {
                tracing::error!("event loop thread panicked");
            }
        }
        report
    }
}

impl<T: Transport> Drop for ClientEndpoint<T> {
    fn drop(&mut self) {
        self.shutdown();
    }
}
