//! Byte relaying between paired sockets.

pub mod pump;

pub use pump::{DEFAULT_BUFFER_SIZE, PumpExit, RelayPump};
