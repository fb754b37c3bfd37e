//! tether-ws — `Transport` and `ServerTransport` over tokio-tungstenite.
//!
//! Every connection runs as a task on one current-thread runtime. Only the
//! thread inside `run` polls that runtime, so all `ConnectionEvents`
//! callbacks arrive on that thread. `create`/`connect`/`send`/`close` may be
//! called from any thread; they only queue work.

mod accept;
mod dial;
mod pump;
mod shared;

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::runtime::{Builder, Runtime};
use tokio_util::sync::CancellationToken;

use tether_core::{
    Acceptor, ConnectionEvents, Handle, Payload, ServerTransport, Transport, TransportConfig,
    TransportError,
};

use crate::shared::{Command, Phase, Shared, Slot};

pub use dial::{parse_ws_uri, ABANDONED};
pub use pump::{is_sendable_close_code, MAX_CLOSE_REASON};

pub struct WsTransport {
    runtime: Runtime,
    shared: Arc<Shared>,
}

impl WsTransport {
    pub fn new(config: TransportConfig) -> Result<Self, TransportError> {
        let runtime = Builder::new_current_thread()
            .enable_all()
            .thread_name("tether-ws")
            .build()
            .map_err(TransportError::Runtime)?;
        Ok(Self {
            runtime,
            shared: Arc::new(Shared::new(config)),
        })
    }

    /// Connections the transport still holds (pending, open or closing).
    pub fn active_connections(&self) -> usize {
        self.shared.connections.len()
    }
}

impl Transport for WsTransport {
    fn create(&self, uri: &str) -> Result<Handle, TransportError> {
        if self.shared.stopping.is_cancelled() {
            return Err(TransportError::Stopped);
        }
        let request = parse_ws_uri(uri)?;
        let handle = self.shared.allocate_handle();
        self.shared
            .connections
            .insert(handle, Slot::Pending(Box::new(request)));
        Ok(handle)
    }

    fn connect(
        &self,
        handle: Handle,
        events: Arc<dyn ConnectionEvents>,
    ) -> Result<(), TransportError> {
        if self.shared.stopping.is_cancelled() {
            self.shared.release(handle);
            return Err(TransportError::Stopped);
        }

        let (request, commands) = {
            let mut slot = self
                .shared
                .connections
                .get_mut(&handle)
                .ok_or(TransportError::UnknownHandle(handle))?;
            if !matches!(slot.value(), Slot::Pending(_)) {
                return Err(TransportError::InvalidState("connect already issued"));
            }
            let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
            let live = Slot::Live {
                tx,
                phase: Phase::Connecting,
            };
            match std::mem::replace(slot.value_mut(), live) {
                Slot::Pending(request) => (*request, rx),
                Slot::Live { .. } => return Err(TransportError::InvalidState("connect already issued")),
            }
        };

        self.shared.tracker.spawn_on(
            dial::dial(self.shared.clone(), handle, request, events, commands),
            self.runtime.handle(),
        );
        tracing::debug!(handle = %handle, "connect submitted");
        Ok(())
    }

    fn send(&self, handle: Handle, payload: Payload) -> Result<(), TransportError> {
        let slot = self
            .shared
            .connections
            .get(&handle)
            .ok_or(TransportError::UnknownHandle(handle))?;
        match slot.value() {
            Slot::Live {
                tx,
                phase: Phase::Open,
            } => tx
                .send(Command::Send(pump::to_message(payload)))
                .map_err(|_| TransportError::UnknownHandle(handle)),
            _ => Err(TransportError::InvalidState("connection not open")),
        }
    }

    fn close(&self, handle: Handle, code: u16, reason: &str) -> Result<(), TransportError> {
        let frame = pump::close_frame(code, reason)?;

        // Never dialled: nothing on the wire, just forget it.
        if self
            .shared
            .connections
            .remove_if(&handle, |_, slot| matches!(slot, Slot::Pending(_)))
            .is_some()
        {
            return Ok(());
        }

        let mut slot = self
            .shared
            .connections
            .get_mut(&handle)
            .ok_or(TransportError::UnknownHandle(handle))?;
        match slot.value_mut() {
            Slot::Live {
                phase: Phase::Closing,
                ..
            } => Err(TransportError::InvalidState("connection is already closing")),
            Slot::Live { tx, phase } => {
                tx.send(Command::Close(frame))
                    .map_err(|_| TransportError::UnknownHandle(handle))?;
                *phase = Phase::Closing;
                Ok(())
            }
            Slot::Pending(_) => Err(TransportError::InvalidState("connection not started")),
        }
    }

    fn run(&self) {
        let shared = self.shared.clone();
        self.runtime.block_on(async move {
            shared.stopping.cancelled().await;
            shared.tracker.close();

            let drain = shared.config.drain_timeout();
            if tokio::time::timeout(drain, shared.tracker.wait()).await.is_err() {
                tracing::warn!(
                    remaining = shared.tracker.len(),
                    "drain timed out, aborting remaining connections"
                );
                shared.abort.cancel();
                shared.tracker.wait().await;
            }
        });
        tracing::debug!("event loop drained");
    }

    fn stop(&self) {
        if !self.shared.stopping.is_cancelled() {
            tracing::info!("transport stopping");
        }
        self.shared.stopping.cancel();
    }
}

impl ServerTransport for WsTransport {
    fn listen(
        &self,
        addr: SocketAddr,
        acceptor: Arc<dyn Acceptor>,
    ) -> Result<SocketAddr, TransportError> {
        if self.shared.stopping.is_cancelled() {
            return Err(TransportError::Stopped);
        }
        let listen_err = |source| TransportError::Listen { addr, source };

        let std_listener = std::net::TcpListener::bind(addr).map_err(listen_err)?;
        std_listener.set_nonblocking(true).map_err(listen_err)?;
        let bound = std_listener.local_addr().map_err(listen_err)?;
        let listener = {
            let _guard = self.runtime.enter();
            TcpListener::from_std(std_listener).map_err(listen_err)?
        };

        let stop = CancellationToken::new();
        if let Some(previous) = self.shared.listener.lock().replace(stop.clone()) {
            previous.cancel();
        }
        self.shared.tracker.spawn_on(
            accept::accept_loop(self.shared.clone(), listener, acceptor, stop),
            self.runtime.handle(),
        );
        tracing::info!(addr = %bound, "accepting websocket connections");
        Ok(bound)
    }

    fn stop_listening(&self) {
        if let Some(stop) = self.shared.listener.lock().take() {
            stop.cancel();
        }
    }
}
