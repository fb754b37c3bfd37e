//! In-memory transport for facade and controller tests.
//!
//! Records every primitive call and lets the test fire lifecycle events by
//! hand. `run` parks until `stop`, then acknowledges every requested close the
//! way a real peer would.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use tether_core::{
    Acceptor, CloseInfo, ConnectionEvents, Handle, InboundRequest, Payload, ServerTransport,
    SessionError, Transport, TransportError,
};

struct Conn {
    events: Option<Arc<dyn ConnectionEvents>>,
    open: bool,
    close: Option<(u16, String)>,
    acked: bool,
}

#[derive(Default)]
struct Inner {
    next_handle: u64,
    conns: HashMap<Handle, Conn>,
    sends: Vec<(Handle, Payload)>,
    closes: Vec<(Handle, u16, String)>,
    rejected_closes: HashSet<Handle>,
    acceptor: Option<Arc<dyn Acceptor>>,
    listening: bool,
    refuse_listen: bool,
    stopped: bool,
    linger: Duration,
}

#[derive(Default)]
pub struct ScriptedTransport {
    inner: Mutex<Inner>,
    wake: Condvar,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sends(&self) -> Vec<(Handle, Payload)> {
        self.inner.lock().sends.clone()
    }

    pub fn closes(&self) -> Vec<(Handle, u16, String)> {
        self.inner.lock().closes.clone()
    }

    pub fn is_listening(&self) -> bool {
        self.inner.lock().listening
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.lock().stopped
    }

    /// Make `run` hold on this long after `stop` before acknowledging closes.
    pub fn linger_on_stop(&self, linger: Duration) {
        self.inner.lock().linger = linger;
    }

    pub fn reject_close(&self, handle: Handle) {
        self.inner.lock().rejected_closes.insert(handle);
    }

    pub fn refuse_listen(&self) {
        self.inner.lock().refuse_listen = true;
    }

    // ── Event injection ──────────────────────────────────────────────────────

    pub fn open(&self, handle: Handle, banner: Option<&str>) {
        let events = {
            let mut inner = self.inner.lock();
            let Some(conn) = inner.conns.get_mut(&handle) else {
                return;
            };
            conn.open = true;
            conn.events.clone()
        };
        if let Some(events) = events {
            events.on_open(banner.map(str::to_string));
        }
    }

    pub fn fail(&self, handle: Handle, reason: &str) {
        if let Some(events) = self.events(handle) {
            events.on_fail(reason.to_string());
        }
    }

    pub fn deliver(&self, handle: Handle, payload: impl Into<Payload>) {
        if let Some(events) = self.events(handle) {
            events.on_message(payload.into());
        }
    }

    /// Peer-initiated close, or the acknowledgement of a requested one.
    pub fn peer_close(&self, handle: Handle, code: Option<u16>, reason: &str) {
        let events = {
            let mut inner = self.inner.lock();
            let Some(conn) = inner.conns.get_mut(&handle) else {
                return;
            };
            conn.open = false;
            conn.acked = true;
            conn.events.clone()
        };
        if let Some(events) = events {
            events.on_close(CloseInfo {
                code,
                reason: reason.to_string(),
            });
        }
    }

    /// Simulate an inbound handshake through the registered acceptor.
    pub fn inbound(&self, query: Option<&str>) -> Result<Handle, SessionError> {
        let (handle, acceptor) = {
            let mut inner = self.inner.lock();
            let handle = Handle::new(inner.next_handle);
            inner.next_handle += 1;
            (handle, inner.acceptor.clone())
        };
        let acceptor = acceptor.ok_or_else(|| {
            SessionError::TransportRejected(TransportError::InvalidState("not listening"))
        })?;
        let request = InboundRequest {
            uri: match query {
                Some(q) => format!("/?{q}"),
                None => "/".to_string(),
            },
            query: query.map(str::to_string),
            peer_addr: None,
            user_agent: Some("scripted-peer".to_string()),
        };
        let events = acceptor.on_validate(handle, &request)?;
        self.inner.lock().conns.insert(
            handle,
            Conn {
                events: Some(events),
                open: false,
                close: None,
                acked: false,
            },
        );
        Ok(handle)
    }

    fn events(&self, handle: Handle) -> Option<Arc<dyn ConnectionEvents>> {
        self.inner
            .lock()
            .conns
            .get(&handle)
            .and_then(|c| c.events.clone())
    }
}

impl Transport for ScriptedTransport {
    fn create(&self, uri: &str) -> Result<Handle, TransportError> {
        if !uri.starts_with("ws://") {
            return Err(TransportError::InvalidUri {
                uri: uri.to_string(),
                reason: "unsupported scheme".to_string(),
            });
        }
        let mut inner = self.inner.lock();
        if inner.stopped {
            return Err(TransportError::Stopped);
        }
        let handle = Handle::new(inner.next_handle);
        inner.next_handle += 1;
        inner.conns.insert(
            handle,
            Conn {
                events: None,
                open: false,
                close: None,
                acked: false,
            },
        );
        Ok(handle)
    }

    fn connect(
        &self,
        handle: Handle,
        events: Arc<dyn ConnectionEvents>,
    ) -> Result<(), TransportError> {
        let mut inner = self.inner.lock();
        let conn = inner
            .conns
            .get_mut(&handle)
            .ok_or(TransportError::UnknownHandle(handle))?;
        conn.events = Some(events);
        Ok(())
    }

    fn send(&self, handle: Handle, payload: Payload) -> Result<(), TransportError> {
        let mut inner = self.inner.lock();
        let conn = inner
            .conns
            .get(&handle)
            .ok_or(TransportError::UnknownHandle(handle))?;
        if !conn.open {
            return Err(TransportError::InvalidState("connection not open"));
        }
        inner.sends.push((handle, payload));
        Ok(())
    }

    fn close(&self, handle: Handle, code: u16, reason: &str) -> Result<(), TransportError> {
        let mut inner = self.inner.lock();
        if inner.rejected_closes.contains(&handle) {
            return Err(TransportError::InvalidState("close refused"));
        }
        let conn = inner
            .conns
            .get_mut(&handle)
            .ok_or(TransportError::UnknownHandle(handle))?;
        conn.close = Some((code, reason.to_string()));
        inner.closes.push((handle, code, reason.to_string()));
        Ok(())
    }

    fn run(&self) {
        let linger = {
            let mut inner = self.inner.lock();
            while !inner.stopped {
                self.wake.wait(&mut inner);
            }
            inner.linger
        };
        std::thread::sleep(linger);

        let pending: Vec<(Arc<dyn ConnectionEvents>, u16, String)> = {
            let mut inner = self.inner.lock();
            inner
                .conns
                .values_mut()
                .filter(|c| !c.acked)
                .filter_map(|c| {
                    let (code, reason) = c.close.clone()?;
                    let events = c.events.clone()?;
                    c.acked = true;
                    c.open = false;
                    Some((events, code, reason))
                })
                .collect()
        };
        for (events, code, reason) in pending {
            events.on_close(CloseInfo {
                code: Some(code),
                reason,
            });
        }
    }

    fn stop(&self) {
        self.inner.lock().stopped = true;
        self.wake.notify_all();
    }
}

impl ServerTransport for ScriptedTransport {
    fn listen(
        &self,
        addr: SocketAddr,
        acceptor: Arc<dyn Acceptor>,
    ) -> Result<SocketAddr, TransportError> {
        let mut inner = self.inner.lock();
        if inner.refuse_listen {
            return Err(TransportError::Listen {
                addr,
                source: std::io::Error::new(std::io::ErrorKind::AddrInUse, "address in use"),
            });
        }
        inner.acceptor = Some(acceptor);
        inner.listening = true;
        Ok(addr)
    }

    fn stop_listening(&self) {
        let mut inner = self.inner.lock();
        inner.listening = false;
        inner.acceptor = None;
    }
}
