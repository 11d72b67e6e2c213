//! Request and reply types for the line protocol
//!
//! A request frame is the command keyword, an optional transaction id and
//! then the command's parameters, one per line:
//!
//! ```text
//! LOGIN\n[txn\n]username\npassword\r\n
//! ```
//!
//! Whether the second line is a transaction id is decided by the command's
//! arity: a frame carrying exactly one extra line has a txn id. Replies
//! echo the txn id on their own line ahead of the body.

use std::borrow::Cow;

use bytes::Bytes;
use thiserror::Error;

use super::frame::{FRAME_DELIMITER, Frame, LINE_SEPARATOR};
use crate::store::{RoomId, format_line};

/// Upper bound for a LOGS request
pub const MAX_LOGS_LIMIT: usize = 10_000;

/// A parsed client command
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Authenticate an existing user
    Login { username: String, password: String },
    /// Create a user and authenticate as it
    Register { username: String, password: String },
    /// Select the current room
    Menu { room: String },
    /// Post a message to the current room
    Msg { text: String },
    /// Fetch recent history of the current room
    Logs { limit: usize },
    /// List the rooms known to the server
    Rooms,
}

impl Command {
    /// Wire keyword for this command
    pub fn keyword(&self) -> &'static str {
        match self {
            Command::Login { .. } => "LOGIN",
            Command::Register { .. } => "REGISTER",
            Command::Menu { .. } => "MENU",
            Command::Msg { .. } => "MSG",
            Command::Logs { .. } => "LOGS",
            Command::Rooms => "ROOMS",
        }
    }

    /// Number of parameter lines a keyword takes, `None` if unknown
    pub fn arity(keyword: &str) -> Option<usize> {
        match keyword {
            "LOGIN" | "REGISTER" => Some(2),
            "MENU" | "MSG" | "LOGS" => Some(1),
            "ROOMS" => Some(0),
            _ => None,
        }
    }

    fn params(&self) -> Vec<Cow<'_, str>> {
        match self {
            Command::Login { username, password } | Command::Register { username, password } => {
                vec![Cow::from(username.as_str()), Cow::from(password.as_str())]
            }
            Command::Menu { room } => vec![Cow::from(room.as_str())],
            Command::Msg { text } => vec![Cow::from(text.as_str())],
            Command::Logs { limit } => vec![Cow::from(limit.to_string())],
            Command::Rooms => Vec::new(),
        }
    }
}

/// A command together with the transaction id it arrived with
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub txn_id: Option<String>,
    pub command: Command,
}

impl Request {
    /// Request without a transaction id
    pub fn new(command: Command) -> Self {
        Self {
            txn_id: None,
            command,
        }
    }

    /// Request tagged with a transaction id
    pub fn with_txn(txn_id: impl Into<String>, command: Command) -> Self {
        Self {
            txn_id: Some(txn_id.into()),
            command,
        }
    }

    /// Parse a decoded frame into a request
    pub fn parse(frame: &Frame) -> Result<Self, ProtocolError> {
        let text = frame.text().map_err(|e| ProtocolError {
            txn_id: None,
            kind: ProtocolErrorKind::Encoding,
            detail: e.to_string(),
        })?;

        // Trailing '\r's are not part of the value; a stored value must never
        // end in one or it could form a delimiter when lines are joined
        let mut lines = text
            .split(LINE_SEPARATOR)
            .map(|line| line.trim_end_matches('\r'));
        let keyword = lines.next().unwrap_or_default();
        let rest: Vec<&str> = lines.collect();

        let Some(arity) = Command::arity(keyword) else {
            return Err(ProtocolError {
                txn_id: None,
                kind: ProtocolErrorKind::UnknownCommand,
                detail: keyword.to_string(),
            });
        };

        let (txn_id, params) = if rest.len() == arity + 1 {
            (Some(rest[0].to_string()), &rest[1..])
        } else if rest.len() == arity {
            (None, &rest[..])
        } else {
            let kind = if rest.len() < arity {
                ProtocolErrorKind::MissingParameter
            } else {
                ProtocolErrorKind::UnexpectedParameter
            };
            return Err(ProtocolError {
                txn_id: None,
                kind,
                detail: format!("{} expects {} parameters, got {}", keyword, arity, rest.len()),
            });
        };

        let command = match keyword {
            "LOGIN" => Command::Login {
                username: params[0].to_string(),
                password: params[1].to_string(),
            },
            "REGISTER" => Command::Register {
                username: params[0].to_string(),
                password: params[1].to_string(),
            },
            "MENU" => Command::Menu {
                room: params[0].to_string(),
            },
            "MSG" => Command::Msg {
                text: params[0].to_string(),
            },
            "LOGS" => Command::Logs {
                limit: parse_limit(params[0]).map_err(|detail| ProtocolError {
                    txn_id: txn_id.clone(),
                    kind: ProtocolErrorKind::InvalidLimit,
                    detail,
                })?,
            },
            _ => Command::Rooms,
        };

        Ok(Self { txn_id, command })
    }

    /// Encode as a request frame, delimiter included.
    ///
    /// Fails if the txn id or a parameter contains a line break, which would
    /// split the request into extra lines or frames.
    pub fn encode(&self) -> Result<Bytes, ProtocolError> {
        let mut lines: Vec<Cow<'_, str>> = vec![Cow::from(self.command.keyword())];
        if let Some(txn) = &self.txn_id {
            lines.push(Cow::from(txn.as_str()));
        }
        lines.extend(self.command.params());

        if let Some(bad) = lines.iter().find(|line| line.contains(['\r', '\n'])) {
            return Err(ProtocolError {
                txn_id: self.txn_id.clone(),
                kind: ProtocolErrorKind::LineBreak,
                detail: format!(
                    "{} parameter {:?} contains a line break",
                    self.command.keyword(),
                    bad
                ),
            });
        }
        Ok(Frame::from_lines(lines).encode_to_bytes())
    }
}

fn parse_limit(raw: &str) -> Result<usize, String> {
    let limit: usize = raw
        .trim()
        .parse()
        .map_err(|e| format!("invalid limit {:?}: {}", raw, e))?;
    if limit > MAX_LOGS_LIMIT {
        return Err(format!("limit {} exceeds {}", limit, MAX_LOGS_LIMIT));
    }
    Ok(limit)
}

/// Category of a malformed request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolErrorKind {
    /// Frame is not valid UTF-8
    Encoding,
    /// Keyword not recognised
    UnknownCommand,
    /// Fewer lines than the command needs
    MissingParameter,
    /// More lines than the command and a txn id can account for
    UnexpectedParameter,
    /// LOGS limit is not a non-negative integer in range
    InvalidLimit,
    /// Outgoing parameter contains `\r` or `\n`
    LineBreak,
    /// Frame exceeded the size limit
    FrameTooLong,
    /// Connection closed in the middle of a frame
    Truncated,
}

/// A request that could not be turned into a [`Command`]
#[derive(Debug, Clone, Error)]
#[error("{kind:?}: {detail}")]
pub struct ProtocolError {
    /// Txn id, when one could be recovered before the failure
    pub txn_id: Option<String>,
    pub kind: ProtocolErrorKind,
    pub detail: String,
}

impl ProtocolError {
    pub fn new(kind: ProtocolErrorKind, detail: impl Into<String>) -> Self {
        Self {
            txn_id: None,
            kind,
            detail: detail.into(),
        }
    }

    /// The reply the client gets for this failure
    pub fn reply(&self) -> Reply {
        match self.kind {
            ProtocolErrorKind::UnknownCommand => Reply::UnknownCommand,
            _ => Reply::Error,
        }
    }
}

/// Server reply to a single request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    True,
    False,
    Error,
    /// Unrecognised keyword; never carries a txn id
    UnknownCommand,
    /// Connection refused because the server is at capacity
    ServerFull,
    /// Successful MENU with the store's room id
    RoomId(RoomId),
    /// LOGS payload, lines separated by `\n`
    History(String),
    /// ROOMS payload
    Rooms(Vec<String>),
}

impl Reply {
    /// Reply body without txn id or delimiter
    pub fn body(&self) -> Cow<'_, str> {
        match self {
            Reply::True => Cow::from("TRUE"),
            Reply::False => Cow::from("FALSE"),
            Reply::Error => Cow::from("ERROR"),
            Reply::UnknownCommand => Cow::from("ERROR unknown_command"),
            Reply::ServerFull => Cow::from("ERROR server_full"),
            Reply::RoomId(id) => Cow::from(id.to_string()),
            Reply::History(history) => Cow::from(history.as_str()),
            Reply::Rooms(names) => Cow::from(names.join("\n")),
        }
    }

    /// Encode for the wire, prefixing the txn id line when present
    pub fn encode(&self, txn_id: Option<&str>) -> Bytes {
        let body = self.body();
        let txn_id = match self {
            Reply::UnknownCommand | Reply::ServerFull => None,
            _ => txn_id,
        };

        let mut out = String::with_capacity(
            txn_id.map_or(0, |t| t.len() + 1) + body.len() + FRAME_DELIMITER.len(),
        );
        if let Some(txn) = txn_id {
            out.push_str(txn);
            out.push(LINE_SEPARATOR);
        }
        out.push_str(&body);
        out.push_str("\r\n");
        Bytes::from(out)
    }
}

/// Frame relayed to the other members of a room
pub fn broadcast_frame(username: &str, text: &str) -> Bytes {
    let mut line = format_line(username, text);
    line.push_str("\r\n");
    Bytes::from(line)
}
