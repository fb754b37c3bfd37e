//! State shared between the transport facade and its connection tasks.

use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::handshake::client::Request;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use tether_core::{Handle, TransportConfig};

/// Work submitted to a live connection task.
#[derive(Debug)]
pub(crate) enum Command {
    Send(Message),
    Close(CloseFrame),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Phase {
    Connecting,
    Open,
    Closing,
}

pub(crate) enum Slot {
    /// Created but `connect` not issued yet.
    Pending(Box<Request>),
    Live {
        tx: mpsc::UnboundedSender<Command>,
        phase: Phase,
    },
}

pub(crate) struct Shared {
    pub config: TransportConfig,
    pub connections: DashMap<Handle, Slot>,
    pub tracker: TaskTracker,
    /// Cancelled by `stop`: no new work, live connections wind down.
    pub stopping: CancellationToken,
    /// Cancelled once the drain deadline passed: every task exits now.
    pub abort: CancellationToken,
    pub listener: Mutex<Option<CancellationToken>>,
    next_handle: AtomicU64,
}

impl Shared {
    pub fn new(config: TransportConfig) -> Self {
        Self {
            config,
            connections: DashMap::new(),
            tracker: TaskTracker::new(),
            stopping: CancellationToken::new(),
            abort: CancellationToken::new(),
            listener: Mutex::new(None),
            next_handle: AtomicU64::new(0),
        }
    }

    pub fn allocate_handle(&self) -> Handle {
        Handle::new(self.next_handle.fetch_add(1, Ordering::Relaxed))
    }

    /// Register a live connection and return its command receiver.
    pub fn register_live(&self, handle: Handle) -> mpsc::UnboundedReceiver<Command> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.connections.insert(
            handle,
            Slot::Live {
                tx,
                phase: Phase::Connecting,
            },
        );
        rx
    }

    /// Connecting → Open. A close requested in the meantime wins.
    pub fn mark_open(&self, handle: Handle) {
        if let Some(mut slot) = self.connections.get_mut(&handle) {
            if let Slot::Live { phase, .. } = slot.value_mut() {
                if *phase == Phase::Connecting {
                    *phase = Phase::Open;
                }
            }
        }
    }

    pub fn mark_closing(&self, handle: Handle) {
        if let Some(mut slot) = self.connections.get_mut(&handle) {
            if let Slot::Live { phase, .. } = slot.value_mut() {
                *phase = Phase::Closing;
            }
        }
    }

    pub fn release(&self, handle: Handle) {
        self.connections.remove(&handle);
    }
}
