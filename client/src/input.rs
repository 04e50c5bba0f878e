//! Console command parsing for the lobby client

use shared::MAX_PAYLOAD_LEN;
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Ready,
    Unready,
    Toggle,
    Payload(Vec<i32>),
    Status,
    Help,
    Quit,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CommandError {
    #[error("empty command")]
    Empty,
    #[error("unknown command '{0}', type 'help' for a list")]
    Unknown(String),
    #[error("invalid payload value '{0}'")]
    InvalidPayload(String),
    #[error("payload has {0} values, at most {max} allowed", max = MAX_PAYLOAD_LEN)]
    PayloadTooLong(usize),
}

impl Command {
    pub fn parse(line: &str) -> Result<Self, CommandError> {
        let line = line.trim();
        let (word, rest) = match line.split_once(char::is_whitespace) {
            Some((word, rest)) => (word, rest.trim()),
            None => (line, ""),
        };

        match word.to_ascii_lowercase().as_str() {
            "" => Err(CommandError::Empty),
            "ready" | "r" => Ok(Command::Ready),
            "unready" | "u" => Ok(Command::Unready),
            "toggle" | "t" => Ok(Command::Toggle),
            "payload" | "p" => parse_payload(rest).map(Command::Payload),
            "status" | "s" => Ok(Command::Status),
            "help" | "h" | "?" => Ok(Command::Help),
            "quit" | "q" | "exit" => Ok(Command::Quit),
            other => Err(CommandError::Unknown(other.to_string())),
        }
    }

    pub fn usage() -> &'static str {
        "ready | unready | toggle | payload <n,n,...> | status | help | quit"
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::Ready => f.write_str("ready"),
            Command::Unready => f.write_str("unready"),
            Command::Toggle => f.write_str("toggle"),
            Command::Payload(values) => write!(f, "payload {:?}", values),
            Command::Status => f.write_str("status"),
            Command::Help => f.write_str("help"),
            Command::Quit => f.write_str("quit"),
        }
    }
}

/// Parses a payload given as integers separated by commas and/or spaces.
/// An empty string is an empty payload. Payloads longer than the lobby
/// accepts are refused here rather than by the server.
pub fn parse_payload(text: &str) -> Result<Vec<i32>, CommandError> {
    let payload = text
        .split(|c: char| c == ',' || c.is_whitespace())
        .filter(|part| !part.is_empty())
        .map(|part| {
            part.parse::<i32>()
                .map_err(|_| CommandError::InvalidPayload(part.to_string()))
        })
        .collect::<Result<Vec<_>, _>>()?;

    if payload.len() > MAX_PAYLOAD_LEN {
        return Err(CommandError::PayloadTooLong(payload.len()));
    }
    Ok(payload)
}
