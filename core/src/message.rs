//! IRC message parsing and handling
//!
//! Clients speak RFC 1459 lines (`:prefix COMMAND params`). Linked servers
//! speak P10: the source is a bare numeric and the command a short token
//! (`ABAAA M #chan +o ABAAB 1000`). A message whose prefix is
//! [`Prefix::Numeric`] is rendered in the P10 form.

use serde::{Deserialize, Serialize};
use std::fmt;

/// IRC message prefix (server, user, or P10 numeric)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Prefix {
    /// Server name
    Server(String),
    /// User prefix (nick!user@host)
    User {
        nick: String,
        user: String,
        host: String,
    },
    /// P10 numeric of a server or client
    Numeric(String),
}

impl fmt::Display for Prefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Prefix::Server(name) => write!(f, "{}", name),
            Prefix::User { nick, user, host } => write!(f, "{}!{}@{}", nick, user, host),
            Prefix::Numeric(numeric) => write!(f, "{}", numeric),
        }
    }
}

/// IRC message types
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageType {
    // Connection registration
    Password,
    Nick,
    User,
    Server,
    Oper,
    Quit,
    ServerQuit,
    EndOfBurst,
    EndOfBurstAck,

    // Channel operations
    Join,
    Create,
    Part,
    Kick,
    Mode,
    OpMode,
    BMode,
    ClearMode,
    Burst,
    Destruct,
    Topic,
    Names,
    Invite,

    // Messaging
    PrivMsg,
    Notice,

    // Miscellaneous
    Ping,
    Pong,
    Error,

    // Numerics and unknown commands
    Custom(String),
}

impl MessageType {
    /// Long command name, as sent to clients
    pub fn name(&self) -> &str {
        match self {
            MessageType::Password => "PASS",
            MessageType::Nick => "NICK",
            MessageType::User => "USER",
            MessageType::Server => "SERVER",
            MessageType::Oper => "OPER",
            MessageType::Quit => "QUIT",
            MessageType::ServerQuit => "SQUIT",
            MessageType::EndOfBurst => "END_OF_BURST",
            MessageType::EndOfBurstAck => "EOB_ACK",
            MessageType::Join => "JOIN",
            MessageType::Create => "CREATE",
            MessageType::Part => "PART",
            MessageType::Kick => "KICK",
            MessageType::Mode => "MODE",
            MessageType::OpMode => "OPMODE",
            MessageType::BMode => "BMODE",
            MessageType::ClearMode => "CLEARMODE",
            MessageType::Burst => "BURST",
            MessageType::Destruct => "DESTRUCT",
            MessageType::Topic => "TOPIC",
            MessageType::Names => "NAMES",
            MessageType::Invite => "INVITE",
            MessageType::PrivMsg => "PRIVMSG",
            MessageType::Notice => "NOTICE",
            MessageType::Ping => "PING",
            MessageType::Pong => "PONG",
            MessageType::Error => "ERROR",
            MessageType::Custom(cmd) => cmd,
        }
    }

    /// P10 token, as sent to servers
    pub fn token(&self) -> &str {
        match self {
            MessageType::Password => "PA",
            MessageType::Nick => "N",
            MessageType::User => "USER",
            MessageType::Server => "S",
            MessageType::Oper => "OPER",
            MessageType::Quit => "Q",
            MessageType::ServerQuit => "SQ",
            MessageType::EndOfBurst => "EB",
            MessageType::EndOfBurstAck => "EA",
            MessageType::Join => "J",
            MessageType::Create => "C",
            MessageType::Part => "L",
            MessageType::Kick => "K",
            MessageType::Mode => "M",
            MessageType::OpMode => "OM",
            MessageType::BMode => "BM",
            MessageType::ClearMode => "CM",
            MessageType::Burst => "B",
            MessageType::Destruct => "DE",
            MessageType::Topic => "T",
            MessageType::Names => "E",
            MessageType::Invite => "I",
            MessageType::PrivMsg => "P",
            MessageType::Notice => "O",
            MessageType::Ping => "G",
            MessageType::Pong => "Z",
            MessageType::Error => "Y",
            MessageType::Custom(cmd) => cmd,
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl From<&str> for MessageType {
    fn from(s: &str) -> Self {
        match s.to_uppercase().as_str() {
            "PASS" | "PA" => MessageType::Password,
            "NICK" | "N" => MessageType::Nick,
            "USER" => MessageType::User,
            "SERVER" | "S" => MessageType::Server,
            "OPER" => MessageType::Oper,
            "QUIT" | "Q" => MessageType::Quit,
            "SQUIT" | "SQ" => MessageType::ServerQuit,
            "END_OF_BURST" | "EB" => MessageType::EndOfBurst,
            "EOB_ACK" | "EA" => MessageType::EndOfBurstAck,
            "JOIN" | "J" => MessageType::Join,
            "CREATE" | "C" => MessageType::Create,
            "PART" | "L" => MessageType::Part,
            "KICK" | "K" => MessageType::Kick,
            "MODE" | "M" => MessageType::Mode,
            "OPMODE" | "OM" => MessageType::OpMode,
            "BMODE" | "BM" => MessageType::BMode,
            "CLEARMODE" | "CM" => MessageType::ClearMode,
            "BURST" | "B" => MessageType::Burst,
            "DESTRUCT" | "DE" => MessageType::Destruct,
            "TOPIC" | "T" => MessageType::Topic,
            "NAMES" | "E" => MessageType::Names,
            "INVITE" | "I" => MessageType::Invite,
            "PRIVMSG" | "P" => MessageType::PrivMsg,
            "NOTICE" | "O" => MessageType::Notice,
            "PING" | "G" => MessageType::Ping,
            "PONG" | "Z" => MessageType::Pong,
            "ERROR" | "Y" => MessageType::Error,
            _ => MessageType::Custom(s.to_string()),
        }
    }
}

/// IRC message as defined in RFC 1459
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Optional prefix (server, user or numeric)
    pub prefix: Option<Prefix>,
    /// Message command/type
    pub command: MessageType,
    /// Message parameters
    pub params: Vec<String>,
}

/// Split a line into its middle parameters and optional trailing parameter
fn split_params(rest: &str) -> Vec<String> {
    let mut params = Vec::new();
    let mut rest = rest.trim_start_matches(' ');
    while !rest.is_empty() {
        if let Some(trailing) = rest.strip_prefix(':') {
            params.push(trailing.to_string());
            break;
        }
        match rest.find(' ') {
            Some(end) => {
                params.push(rest[..end].to_string());
                rest = rest[end..].trim_start_matches(' ');
            }
            None => {
                params.push(rest.to_string());
                break;
            }
        }
    }
    params
}

fn next_word(input: &str) -> (&str, &str) {
    match input.find(' ') {
        Some(end) => (&input[..end], input[end..].trim_start_matches(' ')),
        None => (input, ""),
    }
}

impl Message {
    /// Create a new message
    pub fn new(command: MessageType, params: Vec<String>) -> Self {
        Self {
            prefix: None,
            command,
            params,
        }
    }

    /// Create a new message with prefix
    pub fn with_prefix(prefix: Prefix, command: MessageType, params: Vec<String>) -> Self {
        Self {
            prefix: Some(prefix),
            command,
            params,
        }
    }

    /// Parse a client line (RFC 1459 form)
    pub fn parse(input: &str) -> crate::Result<Self> {
        let input = input.trim_end_matches(['\r', '\n']).trim_start_matches(' ');
        if input.is_empty() {
            return Err(crate::Error::MessageParse("Empty message".to_string()));
        }

        let (prefix, rest) = if let Some(stripped) = input.strip_prefix(':') {
            let (prefix_str, rest) = next_word(stripped);
            let prefix = match prefix_str.split_once('!') {
                Some((nick, user_host)) => {
                    let (user, host) = user_host
                        .split_once('@')
                        .ok_or_else(|| crate::Error::MessageParse("Invalid user prefix format".to_string()))?;
                    Prefix::User {
                        nick: nick.to_string(),
                        user: user.to_string(),
                        host: host.to_string(),
                    }
                }
                None => Prefix::Server(prefix_str.to_string()),
            };
            (Some(prefix), rest)
        } else {
            (None, input)
        };

        let (command_str, rest) = next_word(rest);
        if command_str.is_empty() {
            return Err(crate::Error::MessageParse("No command found".to_string()));
        }

        Ok(Message {
            prefix,
            command: MessageType::from(command_str),
            params: split_params(rest),
        })
    }

    /// Parse a line from a registered server link: `<numeric> <TOKEN> params`
    pub fn parse_p10(input: &str) -> crate::Result<Self> {
        let trimmed = input.trim_end_matches(['\r', '\n']).trim_start_matches(' ');
        if trimmed.starts_with(':') {
            return Self::parse(trimmed);
        }
        let (source, rest) = next_word(trimmed);
        let (command_str, rest) = next_word(rest);
        if source.is_empty() || command_str.is_empty() {
            return Err(crate::Error::MessageParse(format!("Malformed server line '{}'", trimmed)));
        }
        Ok(Message {
            prefix: Some(Prefix::Numeric(source.to_string())),
            command: MessageType::from(command_str),
            params: split_params(rest),
        })
    }

    /// Is this a P10 (server-to-server) message?
    pub fn is_p10(&self) -> bool {
        matches!(self.prefix, Some(Prefix::Numeric(_)))
    }

    /// Parameter at `idx`, if present
    pub fn param(&self, idx: usize) -> Option<&str> {
        self.params.get(idx).map(String::as_str)
    }

    /// Serialized line including CRLF
    pub fn to_line(&self) -> String {
        let mut line = self.to_string();
        line.push_str("\r\n");
        line
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.prefix {
            Some(Prefix::Numeric(numeric)) => write!(f, "{} {}", numeric, self.command.token())?,
            Some(prefix) => write!(f, ":{} {}", prefix, self.command.name())?,
            None => f.write_str(self.command.name())?,
        }

        for (i, param) in self.params.iter().enumerate() {
            f.write_str(" ")?;
            let last = i + 1 == self.params.len();
            if last && (param.is_empty() || param.contains(' ') || param.starts_with(':')) {
                f.write_str(":")?;
            }
            f.write_str(param)?;
        }
        Ok(())
    }
}
