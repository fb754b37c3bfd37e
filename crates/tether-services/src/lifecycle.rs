//! Lifecycle controller — turns transport events into registry transitions.
//!
//! Runs on the event-loop thread. Every handler is idempotent with respect to
//! late delivery: an event for an absent, stale, or terminal record is logged
//! and dropped, never an error.

use std::sync::Arc;

use tether_core::{
    close_code, CloseInfo, ConnectionEvents, ConnectionRecord, ConnectionState, Handle, Payload,
};

use crate::registry::{ConnectionKey, ConnectionRegistry};

pub struct LifecycleController<K: ConnectionKey> {
    registry: ConnectionRegistry<K>,
}

impl<K: ConnectionKey> Clone for LifecycleController<K> {
    fn clone(&self) -> Self {
        Self {
            registry: self.registry.clone(),
        }
    }
}

impl<K: ConnectionKey> LifecycleController<K> {
    pub fn new(registry: ConnectionRegistry<K>) -> Self {
        Self { registry }
    }

    /// Listener for one connection, registered once with the transport.
    pub fn bind(&self, id: K, handle: Handle) -> Arc<dyn ConnectionEvents> {
        Arc::new(BoundConnection {
            id,
            handle,
            controller: self.clone(),
        })
    }

    pub fn on_open(&self, id: &K, handle: Handle, remote_banner: Option<String>) {
        self.apply(id, handle, "open", |record| {
            if record.state() != ConnectionState::Connecting {
                return Outcome::Ignored;
            }
            record.set_remote_server(remote_banner);
            if record.close_requested() {
                // Close already in flight; the transport follows with on_close.
                return Outcome::Deferred;
            }
            transition(record, ConnectionState::Open)
        });
    }

    pub fn on_fail(&self, id: &K, handle: Handle, reason: String) {
        self.apply(id, handle, "fail", |record| {
            if record.state() != ConnectionState::Connecting {
                return Outcome::Ignored;
            }
            record.set_detail(reason);
            transition(record, ConnectionState::Failed)
        });
    }

    pub fn on_close(&self, id: &K, handle: Handle, close: CloseInfo) {
        self.apply(id, handle, "close", |record| {
            let next = match (record.state(), record.close_requested()) {
                (ConnectionState::Open, _) | (ConnectionState::Connecting, true) => {
                    ConnectionState::Closed
                }
                // Closed before ever opening and nobody asked: a failed handshake.
                (ConnectionState::Connecting, false) => ConnectionState::Failed,
                _ => return Outcome::Ignored,
            };
            record.set_close(close.code.unwrap_or(close_code::ABNORMAL), &close.reason);
            transition(record, next)
        });
    }

    pub fn on_message(&self, id: &K, handle: Handle, payload: Payload) {
        self.apply(id, handle, "message", |record| {
            if record.state().is_terminal() {
                return Outcome::Ignored;
            }
            record.record_received(&payload);
            Outcome::Recorded
        });
    }

    fn apply(
        &self,
        id: &K,
        handle: Handle,
        event: &'static str,
        f: impl FnOnce(&mut ConnectionRecord<K>) -> Outcome,
    ) {
        let outcome = self.registry.with_entry(id, |record| {
            if record.handle() != handle {
                return Outcome::Stale;
            }
            f(record)
        });

        match outcome {
            Some(Outcome::Moved(state)) => {
                tracing::debug!(id = %id, handle = %handle, event, state = %state, "connection state changed");
            }
            Some(Outcome::Recorded) => {
                tracing::trace!(id = %id, handle = %handle, event, "event recorded");
            }
            Some(Outcome::Deferred) => {
                tracing::debug!(id = %id, handle = %handle, event, "open after close request, awaiting close");
            }
            Some(Outcome::Ignored) => {
                tracing::debug!(id = %id, handle = %handle, event, "late event for settled connection, ignoring");
            }
            Some(Outcome::Stale) => {
                tracing::debug!(id = %id, handle = %handle, event, "event for replaced connection, ignoring");
            }
            None => {
                tracing::debug!(id = %id, handle = %handle, event, "event for evicted connection, ignoring");
            }
        }
    }
}

enum Outcome {
    Moved(ConnectionState),
    Recorded,
    Deferred,
    Ignored,
    Stale,
}

fn transition<K>(record: &mut ConnectionRecord<K>, next: ConnectionState) -> Outcome {
    match record.transition(next) {
        Ok(()) => Outcome::Moved(next),
        Err(e) => {
            tracing::warn!(error = %e, "refused state transition");
            Outcome::Ignored
        }
    }
}

/// `ConnectionEvents` bound to one (id, handle) pair.
struct BoundConnection<K: ConnectionKey> {
    id: K,
    handle: Handle,
    controller: LifecycleController<K>,
}

impl<K: ConnectionKey> ConnectionEvents for BoundConnection<K> {
    fn on_open(&self, remote_banner: Option<String>) {
        self.controller.on_open(&self.id, self.handle, remote_banner);
    }

    fn on_fail(&self, reason: String) {
        self.controller.on_fail(&self.id, self.handle, reason);
    }

    fn on_close(&self, close: CloseInfo) {
        self.controller.on_close(&self.id, self.handle, close);
    }

    fn on_message(&self, payload: Payload) {
        self.controller.on_message(&self.id, self.handle, payload);
    }
}
