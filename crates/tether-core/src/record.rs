//! Connection records — identity plus observed state for one logical connection.
//!
//! A record is created once (outbound connect or inbound validation) and
//! only ever moves forward through its state graph:
//!
//!   Connecting → Open → Closed
//!   Connecting → Failed
//!   Connecting → Closed   (close requested before the handshake finished)

use std::fmt;

use bytes::Bytes;
use thiserror::Error;

use crate::transport::Handle;

// ── Close codes ───────────────────────────────────────────────────────────────

pub mod close_code {
    pub const NORMAL: u16 = 1000;
    pub const GOING_AWAY: u16 = 1001;
    pub const NO_STATUS: u16 = 1005;
    pub const ABNORMAL: u16 = 1006;
}

/// Short human name for an RFC 6455 close code.
pub fn close_status_name(code: u16) -> &'static str {
    match code {
        1000 => "Normal close",
        1001 => "Going away",
        1002 => "Protocol error",
        1003 => "Unsupported data",
        1005 => "No status set",
        1006 => "Abnormal close",
        1007 => "Invalid payload",
        1008 => "Policy violation",
        1009 => "Message too big",
        1010 => "Extension required",
        1011 => "Internal endpoint error",
        1012 => "Service restart",
        1013 => "Try again later",
        1015 => "TLS handshake failure",
        _ => "Unknown",
    }
}

// ── State ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Connecting,
    Open,
    Failed,
    Closed,
}

impl ConnectionState {
    /// Failed and Closed never transition again.
    pub fn is_terminal(self) -> bool {
        matches!(self, ConnectionState::Failed | ConnectionState::Closed)
    }

    pub fn can_transition_to(self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        matches!(
            (self, next),
            (Connecting, Open) | (Connecting, Failed) | (Connecting, Closed) | (Open, Closed)
        )
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionState::Connecting => "Connecting",
            ConnectionState::Open => "Open",
            ConnectionState::Failed => "Failed",
            ConnectionState::Closed => "Closed",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("invalid transition {from} -> {to}")]
pub struct InvalidTransition {
    pub from: ConnectionState,
    pub to: ConnectionState,
}

// ── Payloads ──────────────────────────────────────────────────────────────────

/// A single WebSocket message body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    Text(String),
    Binary(Bytes),
}

impl Payload {
    /// Text verbatim, binary as lowercase hex.
    pub fn to_log_string(&self) -> String {
        match self {
            Payload::Text(t) => t.clone(),
            Payload::Binary(b) => hex::encode(b),
        }
    }
}

impl From<&str> for Payload {
    fn from(s: &str) -> Self {
        Payload::Text(s.to_string())
    }
}

impl From<String> for Payload {
    fn from(s: String) -> Self {
        Payload::Text(s)
    }
}

impl From<Bytes> for Payload {
    fn from(b: Bytes) -> Self {
        Payload::Binary(b)
    }
}

impl From<Vec<u8>> for Payload {
    fn from(b: Vec<u8>) -> Self {
        Payload::Binary(Bytes::from(b))
    }
}

// ── Transcript ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Sent,
    Received,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggedMessage {
    pub direction: Direction,
    pub body: String,
}

impl fmt::Display for LoggedMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.direction {
            Direction::Sent => write!(f, ">> {}", self.body),
            Direction::Received => write!(f, "<< {}", self.body),
        }
    }
}

// ── Record ────────────────────────────────────────────────────────────────────

/// Stored state for one logical connection.
///
/// Only the registry hands out `&mut ConnectionRecord`, and only inside an
/// exclusive section for that id.
#[derive(Debug)]
pub struct ConnectionRecord<K> {
    id: K,
    handle: Handle,
    uri: String,
    state: ConnectionState,
    close_requested: bool,
    remote_server: Option<String>,
    detail: Option<String>,
    close_code: Option<u16>,
    transcript: Vec<LoggedMessage>,
}

impl<K> ConnectionRecord<K> {
    /// New record in `Connecting`.
    pub fn new(id: K, handle: Handle, uri: impl Into<String>) -> Self {
        Self {
            id,
            handle,
            uri: uri.into(),
            state: ConnectionState::Connecting,
            close_requested: false,
            remote_server: None,
            detail: None,
            close_code: None,
            transcript: Vec::new(),
        }
    }

    pub fn id(&self) -> &K {
        &self.id
    }

    pub fn handle(&self) -> Handle {
        self.handle
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn close_requested(&self) -> bool {
        self.close_requested
    }

    pub fn remote_server(&self) -> Option<&str> {
        self.remote_server.as_deref()
    }

    pub fn detail(&self) -> Option<&str> {
        self.detail.as_deref()
    }

    pub fn close_code(&self) -> Option<u16> {
        self.close_code
    }

    /// Move along the state graph. Edges outside the graph are refused and
    /// leave the record untouched.
    pub fn transition(&mut self, next: ConnectionState) -> Result<(), InvalidTransition> {
        if !self.state.can_transition_to(next) {
            return Err(InvalidTransition {
                from: self.state,
                to: next,
            });
        }
        self.state = next;
        Ok(())
    }

    pub fn mark_close_requested(&mut self) {
        self.close_requested = true;
    }

    pub fn set_remote_server(&mut self, banner: Option<String>) {
        self.remote_server = banner.filter(|b| !b.is_empty());
    }

    pub fn set_detail(&mut self, detail: impl Into<String>) {
        self.detail = Some(detail.into());
    }

    /// Record the remote close code and the formatted close diagnostic.
    pub fn set_close(&mut self, code: u16, reason: &str) {
        self.close_code = Some(code);
        self.detail = Some(format!(
            "close code: {} ({}), close reason: {}",
            code,
            close_status_name(code),
            reason
        ));
    }

    pub fn record_sent(&mut self, payload: &Payload) {
        self.transcript.push(LoggedMessage {
            direction: Direction::Sent,
            body: payload.to_log_string(),
        });
    }

    pub fn record_received(&mut self, payload: &Payload) {
        self.transcript.push(LoggedMessage {
            direction: Direction::Received,
            body: payload.to_log_string(),
        });
    }

    pub fn sent_log(&self) -> impl Iterator<Item = &str> {
        self.transcript
            .iter()
            .filter(|m| m.direction == Direction::Sent)
            .map(|m| m.body.as_str())
    }

    pub fn received_log(&self) -> impl Iterator<Item = &str> {
        self.transcript
            .iter()
            .filter(|m| m.direction == Direction::Received)
            .map(|m| m.body.as_str())
    }
}

impl<K: fmt::Display> ConnectionRecord<K> {
    /// Owned copy of the displayable fields.
    pub fn snapshot(&self) -> ConnectionSnapshot {
        ConnectionSnapshot {
            id: self.id.to_string(),
            uri: self.uri.clone(),
            state: self.state,
            remote_server: self.remote_server.clone(),
            detail: self.detail.clone(),
            close_code: self.close_code,
            messages: self.transcript.clone(),
        }
    }
}

// ── Snapshot ──────────────────────────────────────────────────────────────────

/// Immutable view of a record, safe to hold while the record keeps changing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionSnapshot {
    pub id: String,
    pub uri: String,
    pub state: ConnectionState,
    pub remote_server: Option<String>,
    pub detail: Option<String>,
    pub close_code: Option<u16>,
    pub messages: Vec<LoggedMessage>,
}

impl ConnectionSnapshot {
    pub fn sent(&self) -> Vec<&str> {
        self.messages
            .iter()
            .filter(|m| m.direction == Direction::Sent)
            .map(|m| m.body.as_str())
            .collect()
    }

    pub fn received(&self) -> Vec<&str> {
        self.messages
            .iter()
            .filter(|m| m.direction == Direction::Received)
            .map(|m| m.body.as_str())
            .collect()
    }
}

impl fmt::Display for ConnectionSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "> URI: {}", self.uri)?;
        writeln!(f, "> Status: {}", self.state)?;
        writeln!(
            f,
            "> Remote Server: {}",
            self.remote_server.as_deref().unwrap_or("None Specified")
        )?;
        writeln!(
            f,
            "> Error/close reason: {}",
            self.detail.as_deref().unwrap_or("N/A")
        )?;
        write!(f, "> Messages Processed: ({})", self.messages.len())?;
        for m in &self.messages {
            write!(f, "\n{}", m)?;
        }
        Ok(())
    }
}
