//! Network-facing workers: the TCP handshake handler and the UDP
//! datagram dispatcher.

pub mod dispatcher;
pub mod handler;

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

pub use dispatcher::{DatagramDispatcher, DropReason, Route};
pub use handler::ConnectionHandler;

/// Resolve once `running` has been cleared. Polls every 100 ms.
pub async fn wait_for_stop(running: &AtomicBool) {
    while running.load(Ordering::SeqCst) {
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}
