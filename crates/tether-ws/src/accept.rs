//! Inbound connections: accept loop, validated handshake, then the pump.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::accept_hdr_async;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::header::{HeaderValue, SERVER, USER_AGENT};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_util::sync::CancellationToken;

use tether_core::{Acceptor, ConnectionEvents, Handle, InboundRequest, SessionError};

use crate::pump::pump;
use crate::shared::{Command, Shared};

pub(crate) async fn accept_loop(
    shared: Arc<Shared>,
    listener: TcpListener,
    acceptor: Arc<dyn Acceptor>,
    stop: CancellationToken,
) {
    loop {
        let (stream, peer) = tokio::select! {
            _ = stop.cancelled() => break,
            _ = shared.stopping.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    tracing::warn!(error = %e, "accept failed");
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    continue;
                }
            },
        };

        let handle = shared.allocate_handle();
        let commands = shared.register_live(handle);
        tracing::trace!(handle = %handle, peer = %peer, "tcp connection accepted");
        shared.tracker.spawn(handshake(
            shared.clone(),
            handle,
            stream,
            peer,
            acceptor.clone(),
            commands,
        ));
    }
    tracing::info!("listener stopped");
}

/// HTTP response for a refused upgrade.
pub(crate) fn rejection(err: &SessionError) -> ErrorResponse {
    let status = match err {
        SessionError::ValidationRejected(_) => StatusCode::BAD_REQUEST,
        SessionError::StateConflict { .. } => StatusCode::CONFLICT,
        _ => StatusCode::SERVICE_UNAVAILABLE,
    };
    let mut response = ErrorResponse::new(Some(err.to_string()));
    *response.status_mut() = status;
    response
}

pub(crate) fn inbound_request(request: &Request, peer: SocketAddr) -> InboundRequest {
    InboundRequest {
        uri: request.uri().to_string(),
        query: request.uri().query().map(str::to_string),
        peer_addr: Some(peer),
        user_agent: request
            .headers()
            .get(USER_AGENT)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string),
    }
}

async fn handshake(
    shared: Arc<Shared>,
    handle: Handle,
    stream: TcpStream,
    peer: SocketAddr,
    acceptor: Arc<dyn Acceptor>,
    commands: mpsc::UnboundedReceiver<Command>,
) {
    let banner = HeaderValue::from_str(&shared.config.server_banner)
        .ok()
        .filter(|v| !v.is_empty());
    let mut accepted: Option<(Arc<dyn ConnectionEvents>, Option<String>)> = None;

    let validate = |request: &Request, mut response: Response| -> Result<Response, ErrorResponse> {
        let inbound = inbound_request(request, peer);
        match acceptor.on_validate(handle, &inbound) {
            Ok(events) => {
                if let Some(banner) = banner {
                    response.headers_mut().insert(SERVER, banner);
                }
                accepted = Some((events, inbound.user_agent));
                Ok(response)
            }
            Err(e) => Err(rejection(&e)),
        }
    };

    let handshake_timeout = shared.config.connect_timeout();
    let result = tokio::select! {
        _ = shared.abort.cancelled() => Err("event loop stopped before open".to_string()),
        result = timeout(handshake_timeout, accept_hdr_async(stream, validate)) => match result {
            Ok(Ok(ws)) => Ok(ws),
            Ok(Err(e)) => Err(e.to_string()),
            Err(_) => Err(format!("handshake timed out after {}ms", handshake_timeout.as_millis())),
        },
    };

    match (result, accepted) {
        (Ok(ws), Some((events, user_agent))) => {
            tracing::debug!(handle = %handle, peer = %peer, "inbound connection open");
            shared.mark_open(handle);
            events.on_open(user_agent);
            pump(shared, handle, ws, events, commands).await;
        }
        (Err(reason), Some((events, _))) => {
            tracing::debug!(handle = %handle, peer = %peer, reason = %reason, "handshake failed after validation");
            shared.release(handle);
            events.on_fail(reason);
        }
        (Ok(_), None) => {
            // Unreachable through accept_hdr_async; nothing to notify.
            shared.release(handle);
        }
        (Err(reason), None) => {
            tracing::debug!(handle = %handle, peer = %peer, reason = %reason, "inbound connection refused");
            shared.release(handle);
        }
    }
}
