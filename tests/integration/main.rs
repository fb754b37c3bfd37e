//! tether integration test harness.
//!
//! Tests drive real endpoints over loopback sockets. Raw WebSocket peers
//! (echo servers, stalled servers, plain clients) run on a separate tokio
//! runtime owned by each test; endpoints are always created and dropped on
//! the test thread, never inside async context.
//!
//!   cargo test --test integration

use std::net::SocketAddr;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::runtime::Runtime;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::header::{HeaderValue, SERVER};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{accept_hdr_async, connect_async, MaybeTlsStream, WebSocketStream};

use tether_core::{
    ConnectionState, ServerConfig, ShutdownConfig, TransportConfig,
};
use tether_services::{ClientEndpoint, ServerEndpoint};
use tether_ws::WsTransport;

mod server;

// ── Harness ───────────────────────────────────────────────────────────────────

/// Upper bound for any single asynchronous outcome.
pub const WAIT: Duration = Duration::from_secs(5);

/// `Server` header the echo peer answers with.
pub const ECHO_BANNER: &str = "echo-peer/1.0";

/// Text that makes the echo peer close with 4000 instead of echoing.
pub const CLOSE_ME: &str = "close-me";

pub type PeerStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Poll `condition` until it holds or `WAIT` elapses.
pub fn wait_until(what: &str, mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + WAIT;
    while Instant::now() < deadline {
        if condition() {
            return;
        }
        thread::sleep(Duration::from_millis(10));
    }
    panic!("timed out waiting for {what}");
}

pub fn peer_runtime() -> Runtime {
    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .enable_all()
        .build()
        .expect("peer runtime")
}

pub fn transport_config() -> TransportConfig {
    TransportConfig {
        connect_timeout_ms: 2_000,
        close_timeout_ms: 1_000,
        drain_timeout_ms: 1_000,
        ..TransportConfig::default()
    }
}

pub fn client() -> ClientEndpoint<WsTransport> {
    let transport = WsTransport::new(transport_config()).expect("transport");
    ClientEndpoint::start(Arc::new(transport), ShutdownConfig::default()).expect("client endpoint")
}

pub fn client_state(client: &ClientEndpoint<WsTransport>, id: u64) -> Option<ConnectionState> {
    client.describe(id).map(|s| s.state)
}

/// A server endpoint pumping its event loop on a background thread.
pub struct RunningServer {
    pub endpoint: Arc<ServerEndpoint<WsTransport>>,
    pub addr: SocketAddr,
    runner: Option<JoinHandle<()>>,
}

impl RunningServer {
    pub fn start() -> Self {
        let config = ServerConfig {
            bind_addr: "127.0.0.1".parse().expect("loopback"),
            port: 0,
            ..ServerConfig::default()
        };
        let transport = WsTransport::new(transport_config()).expect("transport");
        let endpoint = Arc::new(ServerEndpoint::new(
            Arc::new(transport),
            config,
            ShutdownConfig::default(),
        ));
        let addr = endpoint.init().expect("server init");
        let runner = {
            let endpoint = endpoint.clone();
            thread::spawn(move || endpoint.run())
        };
        Self {
            endpoint,
            addr,
            runner: Some(runner),
        }
    }

    pub fn url(&self, query: &str) -> String {
        format!("ws://{}/{}", self.addr, query)
    }

    pub fn state(&self, id: &str) -> Option<ConnectionState> {
        self.endpoint.describe(id).map(|s| s.state)
    }

    /// Stop and wait for `run` to return. Fails the test if it hangs.
    pub fn stop_and_join(&mut self) {
        self.endpoint.stop();
        if let Some(runner) = self.runner.take() {
            let deadline = Instant::now() + WAIT;
            while !runner.is_finished() {
                assert!(Instant::now() < deadline, "server run() did not return");
                thread::sleep(Duration::from_millis(10));
            }
            runner.join().expect("server event loop panicked");
        }
    }
}

impl Drop for RunningServer {
    fn drop(&mut self) {
        if self.runner.is_some() {
            self.stop_and_join();
        }
    }
}

// ── Raw peers ────────────────────────────────────────────────────────────────

fn bind_loopback(rt: &Runtime) -> (TcpListener, SocketAddr) {
    let listener = rt
        .block_on(TcpListener::bind("127.0.0.1:0"))
        .expect("bind loopback");
    let addr = listener.local_addr().expect("local addr");
    (listener, addr)
}

/// Echoes text and binary frames; answers `CLOSE_ME` with a 4000 close.
pub fn spawn_echo_server(rt: &Runtime) -> SocketAddr {
    let (listener, addr) = bind_loopback(rt);
    rt.spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            tokio::spawn(echo(stream));
        }
    });
    addr
}

async fn echo(stream: TcpStream) {
    let banner = |_: &Request, mut response: Response| -> Result<Response, ErrorResponse> {
        response
            .headers_mut()
            .insert(SERVER, HeaderValue::from_static(ECHO_BANNER));
        Ok(response)
    };
    let Ok(mut ws) = accept_hdr_async(stream, banner).await else {
        return;
    };
    while let Some(Ok(message)) = ws.next().await {
        match message {
            Message::Text(ref text) if text.as_str() == CLOSE_ME => {
                let frame = CloseFrame {
                    code: CloseCode::from(4000),
                    reason: "asked to".into(),
                };
                let _ = ws.close(Some(frame)).await;
            }
            Message::Text(_) | Message::Binary(_) => {
                if ws.send(message).await.is_err() {
                    break;
                }
            }
            _ => {}
        }
    }
}

/// Refuses every upgrade with 403.
pub fn spawn_refusing_server(rt: &Runtime) -> SocketAddr {
    let (listener, addr) = bind_loopback(rt);
    rt.spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let refuse = |_: &Request, _: Response| -> Result<Response, ErrorResponse> {
                    let mut response = ErrorResponse::new(Some("go away".to_string()));
                    *response.status_mut() = StatusCode::FORBIDDEN;
                    Err(response)
                };
                let _ = accept_hdr_async(stream, refuse).await;
            });
        }
    });
    addr
}

/// Accepts TCP connections and never answers the upgrade.
pub fn spawn_stalled_server(rt: &Runtime) -> SocketAddr {
    let (listener, addr) = bind_loopback(rt);
    rt.spawn(async move {
        let mut held = Vec::new();
        while let Ok((stream, _)) = listener.accept().await {
            held.push(stream);
        }
    });
    addr
}

/// An address nothing listens on.
pub fn closed_port() -> SocketAddr {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind");
    listener.local_addr().expect("local addr")
}

pub fn dial_peer(
    rt: &Runtime,
    url: &str,
) -> Result<(PeerStream, tokio_tungstenite::tungstenite::handshake::client::Response), tokio_tungstenite::tungstenite::Error>
{
    rt.block_on(connect_async(url))
}

/// Next data or close frame from a raw peer, skipping pings.
pub fn next_frame(rt: &Runtime, ws: &mut PeerStream) -> Option<Message> {
    rt.block_on(async {
        let deadline = tokio::time::Instant::now() + WAIT;
        loop {
            match tokio::time::timeout_at(deadline, ws.next()).await {
                Ok(Some(Ok(Message::Ping(_) | Message::Pong(_)))) => continue,
                Ok(Some(Ok(message))) => return Some(message),
                _ => return None,
            }
        }
    })
}

/// Read until the peer's close frame, then drive the close reply out.
pub fn expect_close(rt: &Runtime, ws: &mut PeerStream) -> Option<CloseFrame> {
    loop {
        match next_frame(rt, ws)? {
            Message::Close(frame) => {
                let _ = next_frame(rt, ws);
                return frame;
            }
            _ => continue,
        }
    }
}

pub fn send_text(rt: &Runtime, ws: &mut PeerStream, text: &str) {
    rt.block_on(ws.send(Message::text(text))).expect("peer send");
}
