//! # tether-core
//!
//! Rendezvous and relay core for the Tether remote desktop relay.
//!
//! This crate contains:
//! - **Handshake**: `Handshake`, `Reply`, `Role`, `Channel` and the
//!   length-prefixed line framing in `codec`
//! - **Session**: per-username rendezvous state, the `Registry`, and the
//!   `Link` wrapper shared by a session and its pumps
//! - **Relay**: `RelayPump`, one direction of byte forwarding
//! - **Network**: `ConnectionHandler` for TCP handshakes and
//!   `DatagramDispatcher` for the UDP path
//! - **Packet**: the UDP wire format with CRC32-checked frames
//! - **Error**: `TetherError` and the `false,<reason>` enums

pub mod codec;
pub mod error;
pub mod handshake;
pub mod header;
pub mod network;
pub mod packet;
pub mod relay;
pub mod session;
pub mod settings;

// ── Re-exports for ergonomic usage ───────────────────────────────

pub use codec::{LineCodec, read_line, write_line};
pub use error::{HandshakeError, Rejection, TetherError};
pub use handshake::{Channel, Handshake, Reply, Role, START_SESSION};
pub use header::{HEADER_SIZE, MAGIC, PacketHeader, PacketType};
pub use network::{ConnectionHandler, DatagramDispatcher, wait_for_stop};
pub use packet::{FRAME_HEADER_SIZE, Frame, MAX_PAYLOAD_SIZE, Packet};
pub use relay::{PumpExit, RelayPump};
pub use session::{Registry, Session, SessionState, client_id_for};
pub use settings::RelaySettings;
