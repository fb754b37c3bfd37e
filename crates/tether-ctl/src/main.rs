//! tether-ctl — interactive WebSocket client.
//!
//! Reads one command per line from stdin and prints one result line per
//! command. Logs go to stderr (`RUST_LOG=debug` for connection detail).

use std::io::{self, BufRead, Write};
use std::sync::Arc;

use anyhow::{Context, Result};

use tether_core::{SessionError, TetherConfig, Transport};
use tether_services::ClientEndpoint;
use tether_ws::WsTransport;

mod command;

use command::{parse_command, Command, HELP};

/// Result line for one command.
fn execute<T: Transport>(endpoint: &ClientEndpoint<T>, command: Command) -> String {
    match command {
        Command::Connect(uri) => match endpoint.connect(&uri) {
            Ok(id) => format!("> created with id {id}"),
            Err(e) => format!("> Error creating connection: {e}"),
        },
        Command::Send { id, message } => match endpoint.send(id, message) {
            Ok(()) => format!("> sent to {id}"),
            Err(SessionError::UnknownConnection(_)) => format!("> No connection found with id {id}"),
            Err(e) => format!("> Error sending message: {e}"),
        },
        Command::Close { id, code, reason } => match endpoint.close(id, code, &reason) {
            Ok(()) => format!("> closing {id}"),
            Err(SessionError::UnknownConnection(_)) => format!("> No connection found with id {id}"),
            Err(e) => format!("> Error initiating close: {e}"),
        },
        Command::Show(id) => match endpoint.describe(id) {
            Some(snapshot) => snapshot.to_string(),
            None => format!("> Unknown connection id {id}"),
        },
        Command::Help => HELP.to_string(),
        Command::Quit | Command::Nothing => String::new(),
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(io::stderr)
        .init();

    let config = TetherConfig::load().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "failed to load config, using defaults");
        TetherConfig::default()
    });

    let transport = Arc::new(
        WsTransport::new(config.transport.clone()).context("failed to start websocket transport")?,
    );
    let endpoint = ClientEndpoint::start(transport, config.shutdown.clone())
        .context("failed to start event loop")?;
    tracing::info!("tether-ctl ready");

    let stdin = io::stdin();
    let mut stdout = io::stdout();
    let mut line = String::new();
    loop {
        write!(stdout, "{}", config.client.prompt)?;
        stdout.flush()?;

        line.clear();
        if stdin.lock().read_line(&mut line).context("failed to read stdin")? == 0 {
            writeln!(stdout)?;
            break;
        }

        match parse_command(&line) {
            Ok(Command::Quit) => break,
            Ok(Command::Nothing) => {}
            Ok(command) => writeln!(stdout, "{}", execute(&endpoint, command))?,
            Err(e) => writeln!(stdout, "> {e}")?,
        }
    }

    let report = endpoint.shutdown();
    tracing::info!(closed = report.closed, failed = report.failed, "tether-ctl exiting");
    Ok(())
}
