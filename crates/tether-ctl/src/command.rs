//! Line command parsing for the interactive client.

use tether_core::close_code;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Connect(String),
    Send { id: u64, message: String },
    Close { id: u64, code: u16, reason: String },
    Show(u64),
    Help,
    Quit,
    /// Blank line.
    Nothing,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CommandError {
    #[error("usage: {0}")]
    Usage(&'static str),
    #[error("invalid connection id `{0}`")]
    InvalidId(String),
    #[error("invalid close code `{0}`")]
    InvalidCode(String),
    #[error("unrecognized command `{0}`, try `help`")]
    Unrecognized(String),
}

pub const HELP: &str = "\
command list:
  connect <ws uri>             open a connection
  send <id> <message>          send a text message
  close <id> [code] [reason]   initiate close (default code 1000)
  show <id>                    show connection metadata
  help                         display this help
  quit                         exit the program";

/// Split off the first whitespace-delimited word.
fn next_word(input: &str) -> (&str, &str) {
    let input = input.trim_start();
    match input.split_once(char::is_whitespace) {
        Some((word, rest)) => (word, rest),
        None => (input, ""),
    }
}

fn parse_id(word: &str, usage: &'static str) -> Result<u64, CommandError> {
    if word.is_empty() {
        return Err(CommandError::Usage(usage));
    }
    word.parse()
        .map_err(|_| CommandError::InvalidId(word.to_string()))
}

pub fn parse_command(line: &str) -> Result<Command, CommandError> {
    let (verb, rest) = next_word(line.trim_end_matches(['\r', '\n']));
    match verb {
        "" => Ok(Command::Nothing),
        "help" => Ok(Command::Help),
        "quit" => Ok(Command::Quit),
        "connect" => {
            let (uri, _) = next_word(rest);
            if uri.is_empty() {
                return Err(CommandError::Usage("connect <ws uri>"));
            }
            Ok(Command::Connect(uri.to_string()))
        }
        "send" => {
            const USAGE: &str = "send <id> <message>";
            let (id, message) = next_word(rest);
            Ok(Command::Send {
                id: parse_id(id, USAGE)?,
                message: message.trim_start().to_string(),
            })
        }
        "close" => {
            const USAGE: &str = "close <id> [code] [reason]";
            let (id, rest) = next_word(rest);
            let id = parse_id(id, USAGE)?;
            let (code, reason) = next_word(rest);
            let code = if code.is_empty() {
                close_code::NORMAL
            } else {
                code.parse()
                    .map_err(|_| CommandError::InvalidCode(code.to_string()))?
            };
            Ok(Command::Close {
                id,
                code,
                reason: reason.trim().to_string(),
            })
        }
        "show" => {
            let (id, _) = next_word(rest);
            Ok(Command::Show(parse_id(id, "show <id>")?))
        }
        other => Err(CommandError::Unrecognized(other.to_string())),
    }
}
