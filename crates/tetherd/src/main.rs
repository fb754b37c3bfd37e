//! tetherd — WebSocket server daemon.
//!
//! Peers connect with `ws://<host>:<port>/?id=<name>`; the id names the peer
//! for the operator console on stdin. Ctrl-C or `stop` closes every peer and
//! exits once the event loop has drained.

use std::io::{self, BufRead};
use std::sync::Arc;

use anyhow::{Context, Result};

use tether_core::TetherConfig;
use tether_services::ServerEndpoint;
use tether_ws::WsTransport;

mod console;

use console::{execute, parse_console, ConsoleCommand};

type Server = ServerEndpoint<WsTransport>;

fn spawn_console(server: Arc<Server>) -> io::Result<()> {
    std::thread::Builder::new()
        .name("tetherd-console".to_string())
        .spawn(move || {
            for line in io::stdin().lock().lines() {
                let line = match line {
                    Ok(line) => line,
                    Err(e) => {
                        tracing::warn!(error = %e, "console read failed");
                        break;
                    }
                };
                match parse_console(&line) {
                    Ok(ConsoleCommand::Nothing) => {}
                    Ok(ConsoleCommand::Stop) => {
                        println!("{}", execute(&server, ConsoleCommand::Stop));
                        break;
                    }
                    Ok(command) => println!("{}", execute(&server, command)),
                    Err(e) => println!("> {e}"),
                }
            }
            tracing::debug!("console closed");
        })
        .map(|_| ())
}

fn spawn_signal_watcher(server: Arc<Server>) -> io::Result<()> {
    std::thread::Builder::new()
        .name("tetherd-signal".to_string())
        .spawn(move || {
            let runtime = match tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
            {
                Ok(runtime) => runtime,
                Err(e) => {
                    tracing::warn!(error = %e, "signal watcher unavailable");
                    return;
                }
            };
            if runtime.block_on(tokio::signal::ctrl_c()).is_ok() {
                tracing::info!("shutdown signal received");
                server.stop();
            }
        })
        .map(|_| ())
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(io::stderr)
        .init();

    if let Err(e) = TetherConfig::write_default_if_missing() {
        tracing::warn!(error = %e, "failed to write default config");
    }
    let config = TetherConfig::load().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "failed to load config, using defaults");
        TetherConfig::default()
    });

    let transport = Arc::new(
        WsTransport::new(config.transport.clone()).context("failed to start websocket transport")?,
    );
    let server = Arc::new(ServerEndpoint::new(
        transport,
        config.server.clone(),
        config.shutdown.clone(),
    ));

    let addr = server
        .init()
        .with_context(|| format!("failed to listen on {}", config.server.socket_addr()))?;
    tracing::info!(%addr, id_param = %config.server.id_param, "tetherd started");

    spawn_console(server.clone()).context("failed to start console")?;
    spawn_signal_watcher(server.clone()).context("failed to start signal watcher")?;

    server.run();
    tracing::info!("tetherd stopped");
    Ok(())
}
