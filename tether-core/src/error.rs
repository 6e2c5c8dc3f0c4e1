//! Domain-specific error types for the Tether relay.
//!
//! All fallible operations return `Result<T, TetherError>`.
//! Handshake problems are split in two: [`HandshakeError`] for input that
//! does not parse, [`Rejection`] for input that parses but is refused.
//! Both render as the `<reason>` half of a `false,<reason>` reply.

use thiserror::Error;

/// The canonical error type for the Tether relay.
#[derive(Debug, Error)]
pub enum TetherError {
    // ── Protocol Errors ──────────────────────────────────────────
    /// Datagram does not start with the Tether magic.
    #[error("invalid magic: {found:#06x}")]
    InvalidMagic { found: u16 },

    /// The payload CRC32 does not match the header.
    #[error("checksum mismatch: header {expected:#010x}, payload {actual:#010x}")]
    ChecksumMismatch { expected: u32, actual: u32 },

    /// A numeric value did not map to any known enum variant.
    #[error("unknown {type_name} discriminant: {value:#x}")]
    UnknownVariant { type_name: &'static str, value: u64 },

    // ── Packet Errors ────────────────────────────────────────────
    /// The buffer ended before a complete field could be read.
    #[error("truncated packet: need {needed} bytes, got {actual}")]
    Truncated { needed: usize, actual: usize },

    /// The declared payload length disagrees with the bytes present.
    #[error("payload length mismatch: declared {declared}, got {actual}")]
    LengthMismatch { declared: usize, actual: usize },

    /// The payload exceeds what fits in one datagram.
    #[error("payload too large: {size} bytes (max {max})")]
    PayloadTooLarge { size: usize, max: usize },

    // ── Handshake Errors ─────────────────────────────────────────
    /// The handshake line could not be parsed.
    #[error(transparent)]
    Handshake(#[from] HandshakeError),

    /// The handshake was well-formed but refused.
    #[error("handshake rejected: {0}")]
    Rejected(#[from] Rejection),

    /// A length-prefixed line exceeded the configured limit.
    #[error("line too long: {size} bytes (max {max})")]
    LineTooLong { size: usize, max: usize },

    // ── Session Errors ───────────────────────────────────────────
    /// The session was torn down and accepts no further sockets.
    #[error("session {0} is closed")]
    SessionClosed(String),

    // ── Connection Errors ────────────────────────────────────────
    /// The TCP/UDP layer reported an error.
    #[error("connection error: {0}")]
    Connection(#[from] std::io::Error),

    /// UTF-8 conversion failed.
    #[error("invalid utf-8: {0}")]
    InvalidUtf8(#[from] std::string::FromUtf8Error),
}

// ── HandshakeError ───────────────────────────────────────────────

/// Why a handshake line failed to parse.
///
/// `Display` is the exact text sent back after `false,`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HandshakeError {
    #[error("Malformed handshake: expected 6 fields, got {0}")]
    TooFewFields(usize),

    #[error("Malformed handshake: empty username")]
    EmptyUsername,

    #[error("Malformed handshake: unknown role '{0}'")]
    UnknownRole(String),

    #[error("Malformed handshake: unknown channel '{0}'")]
    UnknownChannel(String),

    #[error("Malformed handshake: invalid {field} '{value}'")]
    InvalidDimension { field: &'static str, value: String },

    #[error("Malformed handshake: unreadable line")]
    Unreadable,
}

// ── Rejection ────────────────────────────────────────────────────

/// A well-formed handshake the relay refuses to honour.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Rejection {
    #[error("Server is full")]
    ServerFull,

    #[error("Session not found")]
    SessionNotFound,

    #[error("Sharer not ready")]
    SharerNotReady,

    #[error("Invalid password")]
    InvalidPassword,

    #[error("Session already started")]
    AlreadyStarted,

    #[error("Username unavailable")]
    UsernameUnavailable,

    #[error("Channel mismatch")]
    ChannelMismatch,

    /// A sharer rejoin for a channel whose viewer already left.
    #[error("Viewer disconnected")]
    ViewerGone,
}
