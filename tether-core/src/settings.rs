//! Runtime knobs shared by the handler, registry and pumps.

use std::time::Duration;

use crate::codec::DEFAULT_MAX_LINE;

#[derive(Debug, Clone)]
pub struct RelaySettings {
    /// Maximum number of sessions waiting for a viewer.
    pub max_sessions: usize,
    /// How long after a socket replacement disconnects are ignored.
    pub grace_period: Duration,
    /// Longest accepted handshake line, in bytes.
    pub max_handshake_bytes: usize,
    /// Read buffer of each relay pump.
    pub relay_buffer_bytes: usize,
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self {
            max_sessions: 100,
            grace_period: Duration::from_secs(5),
            max_handshake_bytes: DEFAULT_MAX_LINE,
            relay_buffer_bytes: 8 * 1024,
        }
    }
}
