//! The TCP handshake grammar.
//!
//! A client opens one connection per channel and sends a single line:
//!
//! ```text
//! username,password,role,width,height,channelRole
//! ```
//!
//! `role` is `sharer` or `viewer`, `channelRole` is `screen`, `control`
//! or `chat`. Fields past the sixth are ignored. The relay answers with
//! `true,<message>` or `false,<reason>`.

use std::fmt;
use std::str::FromStr;

use crate::error::HandshakeError;

/// Line sent on the sharer's control channel once a viewer is paired.
pub const START_SESSION: &str = "START_SESSION";

// ── Role ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Sharer,
    Viewer,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Sharer => "sharer",
            Self::Viewer => "viewer",
        }
    }
}

impl FromStr for Role {
    type Err = HandshakeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "sharer" => Ok(Self::Sharer),
            "viewer" => Ok(Self::Viewer),
            other => Err(HandshakeError::UnknownRole(other.to_string())),
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Channel ──────────────────────────────────────────────────────

/// One of the three independent streams of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    Screen,
    Control,
    Chat,
}

impl Channel {
    pub const ALL: [Channel; 3] = [Channel::Screen, Channel::Control, Channel::Chat];

    /// Slot index used by per-channel arrays.
    pub fn index(self) -> usize {
        match self {
            Self::Screen => 0,
            Self::Control => 1,
            Self::Chat => 2,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Screen => "screen",
            Self::Control => "control",
            Self::Chat => "chat",
        }
    }
}

impl FromStr for Channel {
    type Err = HandshakeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "screen" => Ok(Self::Screen),
            "control" => Ok(Self::Control),
            "chat" => Ok(Self::Chat),
            other => Err(HandshakeError::UnknownChannel(other.to_string())),
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Handshake ────────────────────────────────────────────────────

#[derive(Clone, PartialEq, Eq)]
pub struct Handshake {
    pub username: String,
    pub password: String,
    pub role: Role,
    pub width: u32,
    pub height: u32,
    pub channel: Channel,
}

impl Handshake {
    pub fn parse(line: &str) -> Result<Self, HandshakeError> {
        let fields: Vec<&str> = line.trim_end_matches(['\r', '\n']).split(',').collect();
        if fields.len() < 6 {
            return Err(HandshakeError::TooFewFields(fields.len()));
        }

        let username = fields[0].trim();
        if username.is_empty() {
            return Err(HandshakeError::EmptyUsername);
        }

        Ok(Self {
            username: username.to_string(),
            password: fields[1].to_string(),
            role: fields[2].parse()?,
            width: parse_dimension("width", fields[3])?,
            height: parse_dimension("height", fields[4])?,
            channel: fields[5].parse()?,
        })
    }

    /// Render back to the wire form.
    pub fn to_line(&self) -> String {
        format!(
            "{},{},{},{},{},{}",
            self.username, self.password, self.role, self.width, self.height, self.channel
        )
    }
}

impl FromStr for Handshake {
    type Err = HandshakeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

// The password never reaches logs.
impl fmt::Debug for Handshake {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handshake")
            .field("username", &self.username)
            .field("role", &self.role)
            .field("width", &self.width)
            .field("height", &self.height)
            .field("channel", &self.channel)
            .finish_non_exhaustive()
    }
}

fn parse_dimension(field: &'static str, value: &str) -> Result<u32, HandshakeError> {
    value
        .trim()
        .parse()
        .map_err(|_| HandshakeError::InvalidDimension {
            field,
            value: value.to_string(),
        })
}

// ── Reply ────────────────────────────────────────────────────────

/// The relay's one-line answer to a handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Accepted(String),
    Rejected(String),
}

impl Reply {
    pub fn accepted(message: impl Into<String>) -> Self {
        Self::Accepted(message.into())
    }

    pub fn rejected(reason: impl fmt::Display) -> Self {
        Self::Rejected(reason.to_string())
    }

    /// Viewer success carries the sharer's declared dimensions.
    pub fn dimensions(width: u32, height: u32) -> Self {
        Self::Accepted(format!("{width},{height}"))
    }

    pub fn is_accepted(&self) -> bool {
        matches!(self, Self::Accepted(_))
    }

    /// Parse a reply line as a client would.
    pub fn parse(line: &str) -> Option<Self> {
        let (flag, rest) = line.split_once(',')?;
        match flag {
            "true" => Some(Self::Accepted(rest.to_string())),
            "false" => Some(Self::Rejected(rest.to_string())),
            _ => None,
        }
    }
}

impl fmt::Display for Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Accepted(message) => write!(f, "true,{message}"),
            Self::Rejected(reason) => write!(f, "false,{reason}"),
        }
    }
}
