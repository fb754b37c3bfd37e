//! Per-connection pump: frames in, commands out, one final `on_close`.

use std::future::pending;
use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::time::{sleep_until, Instant};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

use tether_core::{close_code, CloseInfo, ConnectionEvents, Handle, Payload, TransportError};

use crate::shared::{Command, Shared};

/// Longest close reason that fits a control frame next to the status code.
pub const MAX_CLOSE_REASON: usize = 123;

/// Close codes an endpoint may put on the wire (RFC 6455 §7.4).
pub fn is_sendable_close_code(code: u16) -> bool {
    matches!(code, 1000..=1003 | 1007..=1014 | 3000..=4999)
}

pub(crate) fn close_frame(code: u16, reason: &str) -> Result<CloseFrame, TransportError> {
    if !is_sendable_close_code(code) {
        return Err(TransportError::InvalidCloseCode(code));
    }
    if reason.len() > MAX_CLOSE_REASON {
        return Err(TransportError::InvalidState("close reason exceeds 123 bytes"));
    }
    Ok(CloseFrame {
        code: CloseCode::from(code),
        reason: reason.into(),
    })
}

pub(crate) fn to_message(payload: Payload) -> Message {
    match payload {
        Payload::Text(text) => Message::text(text),
        Payload::Binary(data) => Message::binary(data),
    }
}

fn close_info(frame: Option<CloseFrame>) -> CloseInfo {
    match frame {
        Some(frame) => CloseInfo {
            code: Some(u16::from(frame.code)),
            reason: frame.reason.as_str().to_string(),
        },
        None => CloseInfo {
            code: Some(close_code::NO_STATUS),
            reason: String::new(),
        },
    }
}

pub(crate) async fn pump<S>(
    shared: Arc<Shared>,
    handle: Handle,
    ws: WebSocketStream<S>,
    events: Arc<dyn ConnectionEvents>,
    mut commands: mpsc::UnboundedReceiver<Command>,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (mut sink, mut stream) = ws.split();
    let mut received_close: Option<CloseInfo> = None;
    let mut close_deadline: Option<Instant> = None;
    let close_timeout = shared.config.close_timeout();

    loop {
        let deadline = close_deadline;
        let close_wait = async move {
            match deadline {
                Some(deadline) => sleep_until(deadline).await,
                None => pending().await,
            }
        };

        tokio::select! {
            biased;

            _ = shared.abort.cancelled() => {
                tracing::debug!(handle = %handle, "connection aborted");
                break;
            }

            command = commands.recv() => match command {
                Some(Command::Send(message)) => {
                    if let Err(e) = sink.send(message).await {
                        tracing::debug!(handle = %handle, error = %e, "send failed, dropping connection");
                        break;
                    }
                }
                Some(Command::Close(frame)) => {
                    let code = u16::from(frame.code);
                    if let Err(e) = sink.send(Message::Close(Some(frame))).await {
                        tracing::debug!(handle = %handle, error = %e, "close frame not sent");
                        break;
                    }
                    tracing::debug!(handle = %handle, code, "close frame sent");
                    close_deadline.get_or_insert_with(|| Instant::now() + close_timeout);
                }
                // Slot released elsewhere.
                None => break,
            },

            frame = stream.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    events.on_message(Payload::Text(text.as_str().to_string()));
                }
                Some(Ok(Message::Binary(data))) => events.on_message(Payload::Binary(data)),
                Some(Ok(Message::Close(frame))) => {
                    let info = close_info(frame);
                    tracing::debug!(handle = %handle, code = ?info.code, "peer sent close");
                    received_close = Some(info);
                    shared.mark_closing(handle);
                    close_deadline.get_or_insert_with(|| Instant::now() + close_timeout);
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    tracing::debug!(handle = %handle, error = %e, "connection error");
                    break;
                }
                None => break,
            },

            _ = shared.stopping.cancelled(), if close_deadline.is_none() => {
                shared.mark_closing(handle);
                let frame = CloseFrame {
                    code: CloseCode::Away,
                    reason: "transport stopping".into(),
                };
                if sink.send(Message::Close(Some(frame))).await.is_err() {
                    break;
                }
                close_deadline = Some(Instant::now() + close_timeout);
            }

            _ = close_wait => {
                tracing::debug!(handle = %handle, "close handshake timed out");
                break;
            }
        }
    }

    shared.release(handle);
    let info = received_close.unwrap_or(CloseInfo {
        code: Some(close_code::ABNORMAL),
        reason: String::new(),
    });
    tracing::debug!(handle = %handle, code = ?info.code, "connection closed");
    events.on_close(info);
}
