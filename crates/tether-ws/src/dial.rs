//! Outbound connections: uri validation and the connect task.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::client::Request;
use tokio_tungstenite::tungstenite::http::header::SERVER;

use tether_core::{ConnectionEvents, Handle, TransportError};

use crate::pump::pump;
use crate::shared::{Command, Shared};

/// Reason reported when a close request beats the handshake.
pub const ABANDONED: &str = "connection abandoned: close requested before open";

/// Parse `uri` into a handshake request. Only plain `ws://` with a host.
pub fn parse_ws_uri(uri: &str) -> Result<Request, TransportError> {
    let invalid = |reason: String| TransportError::InvalidUri {
        uri: uri.to_string(),
        reason,
    };

    let request = uri
        .into_client_request()
        .map_err(|e| invalid(e.to_string()))?;
    match request.uri().scheme_str() {
        Some("ws") => {}
        Some(other) => return Err(invalid(format!("unsupported scheme `{other}`"))),
        None => return Err(invalid("missing scheme".to_string())),
    }
    if request.uri().host().map_or(true, str::is_empty) {
        return Err(invalid("missing host".to_string()));
    }
    Ok(request)
}

/// Resolves once a close is requested (or the slot is gone).
async fn close_requested(commands: &mut mpsc::UnboundedReceiver<Command>) {
    while let Some(command) = commands.recv().await {
        if let Command::Close(_) = command {
            return;
        }
    }
}

pub(crate) async fn dial(
    shared: Arc<Shared>,
    handle: Handle,
    request: Request,
    events: Arc<dyn ConnectionEvents>,
    mut commands: mpsc::UnboundedReceiver<Command>,
) {
    let uri = request.uri().to_string();
    let connect_timeout = shared.config.connect_timeout();

    let outcome = tokio::select! {
        biased;

        _ = shared.abort.cancelled() => Err("event loop stopped before open".to_string()),
        _ = close_requested(&mut commands) => Err(ABANDONED.to_string()),
        result = timeout(connect_timeout, connect_async(request)) => match result {
            Ok(Ok(connected)) => Ok(connected),
            Ok(Err(e)) => Err(e.to_string()),
            Err(_) => Err(format!("connect timed out after {}ms", connect_timeout.as_millis())),
        },
    };

    match outcome {
        Ok((ws, response)) => {
            let banner = response
                .headers()
                .get(SERVER)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string);
            tracing::debug!(handle = %handle, uri = %uri, server = ?banner, "connection open");
            shared.mark_open(handle);
            events.on_open(banner);
            pump(shared, handle, ws, events, commands).await;
        }
        Err(reason) => {
            tracing::debug!(handle = %handle, uri = %uri, reason = %reason, "connection failed");
            shared.release(handle);
            events.on_fail(reason);
        }
    }
}
