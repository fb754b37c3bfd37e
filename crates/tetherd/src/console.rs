//! Operator console — stdin commands against the running server.

use thiserror::Error;

use tether_core::{ServerTransport, SessionError};
use tether_services::ServerEndpoint;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsoleCommand {
    Send { id: String, message: String },
    Close(String),
    Show(String),
    List,
    Stop,
    Help,
    Nothing,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConsoleError {
    #[error("usage: {0}")]
    Usage(&'static str),
    #[error("unrecognized command `{0}`, try `help`")]
    Unrecognized(String),
}

pub const HELP: &str = "\
console commands:
  send <id> <message>   send a text message to a peer
  close <id>            close a peer and forget it
  show <id>             show peer metadata
  list                  list connected peers
  stop                  close every peer and shut down";

pub fn parse_console(line: &str) -> Result<ConsoleCommand, ConsoleError> {
    let line = line.trim();
    let (verb, rest) = line.split_once(char::is_whitespace).unwrap_or((line, ""));
    let rest = rest.trim_start();
    let id_only = |usage: &'static str| -> Result<String, ConsoleError> {
        match rest.split_whitespace().next() {
            Some(id) => Ok(id.to_string()),
            None => Err(ConsoleError::Usage(usage)),
        }
    };

    match verb {
        "" => Ok(ConsoleCommand::Nothing),
        "send" => {
            let (id, message) = rest.split_once(char::is_whitespace).unwrap_or((rest, ""));
            if id.is_empty() {
                return Err(ConsoleError::Usage("send <id> <message>"));
            }
            Ok(ConsoleCommand::Send {
                id: id.to_string(),
                message: message.trim_start().to_string(),
            })
        }
        "close" => Ok(ConsoleCommand::Close(id_only("close <id>")?)),
        "show" => Ok(ConsoleCommand::Show(id_only("show <id>")?)),
        "list" => Ok(ConsoleCommand::List),
        "stop" => Ok(ConsoleCommand::Stop),
        "help" => Ok(ConsoleCommand::Help),
        other => Err(ConsoleError::Unrecognized(other.to_string())),
    }
}

pub fn execute<T: ServerTransport>(server: &ServerEndpoint<T>, command: ConsoleCommand) -> String {
    match command {
        ConsoleCommand::Send { id, message } => match server.send_data(&id, message) {
            Ok(()) => format!("> sent to {id}"),
            Err(SessionError::UnknownConnection(_)) => format!("> No connection found with id {id}"),
            Err(e) => format!("> Error sending message: {e}"),
        },
        ConsoleCommand::Close(id) => match server.send_close(&id) {
            Ok(()) => format!("> closed {id}"),
            Err(SessionError::UnknownConnection(_)) => format!("> No connection found with id {id}"),
            Err(e) => format!("> Error initiating close: {e}"),
        },
        ConsoleCommand::Show(id) => match server.describe(&id) {
            Some(snapshot) => snapshot.to_string(),
            None => format!("> Unknown connection id {id}"),
        },
        ConsoleCommand::List => {
            let peers = server.connections();
            if peers.is_empty() {
                return "> no connections".to_string();
            }
            peers
                .iter()
                .map(|p| format!("> {} [{}] {}", p.id, p.state, p.uri))
                .collect::<Vec<_>>()
                .join("\n")
        }
        ConsoleCommand::Stop => {
            let report = server.stop();
            format!("> stopping, closed {} connection(s)", report.closed)
        }
        ConsoleCommand::Help => HELP.to_string(),
        ConsoleCommand::Nothing => String::new(),
    }
}
