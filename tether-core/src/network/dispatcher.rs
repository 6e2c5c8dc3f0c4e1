//! The UDP side of the relay.
//!
//! One loop receives every datagram on the shared socket, validates it
//! and forwards it verbatim to the other party of its session:
//!
//! | type                    | from   | forwarded to |
//! |-------------------------|--------|--------------|
//! | REGISTER                | either | (acked)      |
//! | REQUEST, ACK            | viewer | sharer       |
//! | FULL_FRAME, DELTA_FRAME | sharer | viewer       |
//!
//! Anything that fails to decode or has nowhere to go is logged and
//! dropped; the loop never stops on bad input.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::{Bytes, BytesMut};
use tokio::net::UdpSocket;
use tracing::{debug, info, trace, warn};

use crate::error::TetherError;
use crate::handshake::Role;
use crate::header::{PacketHeader, PacketType};
use crate::network::wait_for_stop;
use crate::packet::{MAX_DATAGRAM_SIZE, Packet};
use crate::session::{Endpoint, Registry};

/// What to do with one received datagram.
#[derive(Debug)]
pub enum Route {
    /// Send `datagram` back to `to` (REGISTER acknowledgement).
    Reply { to: SocketAddr, datagram: Bytes },
    /// Send the received bytes unchanged to `to`.
    Forward { to: SocketAddr },
    Drop(DropReason),
}

#[derive(Debug)]
pub enum DropReason {
    Malformed(TetherError),
    UnknownType(u8),
    /// No live session is routed under the client id.
    UnknownSession(u32),
    /// Both endpoints of the session are already registered.
    RolesTaken(u32),
    /// The destination party has not sent REGISTER yet.
    NoEndpoint { client_id: u32, role: Role },
}

/// Decide where a datagram goes. Registers the sender as a side effect
/// of a REGISTER.
pub fn route(registry: &Registry, datagram: &[u8], from: SocketAddr) -> Route {
    let packet = match Packet::decode(datagram) {
        Ok(packet) => packet,
        Err(e) => return Route::Drop(DropReason::Malformed(e)),
    };
    let client_id = packet.client_id();
    let destination = match &packet {
        Packet::Unknown(header) => return Route::Drop(DropReason::UnknownType(header.kind)),
        Packet::Register { .. } => None,
        Packet::Request { .. } | Packet::Ack { .. } => Some(Role::Sharer),
        Packet::FullFrame(_) | Packet::DeltaFrame(_) => Some(Role::Viewer),
    };

    let Some(session) = registry.route(client_id) else {
        return Route::Drop(DropReason::UnknownSession(client_id));
    };

    match destination {
        None => match session.register_endpoint(Endpoint { addr: from, client_id }) {
            Some(role) => {
                debug!(username = session.username(), %from, %role, "udp endpoint registered");
                let mut ack = BytesMut::with_capacity(crate::header::HEADER_SIZE);
                PacketHeader::new(PacketType::Register, client_id).encode(&mut ack);
                Route::Reply {
                    to: from,
                    datagram: ack.freeze(),
                }
            }
            None => Route::Drop(DropReason::RolesTaken(client_id)),
        },
        Some(role) => match session.endpoint(role) {
            Some(endpoint) => Route::Forward { to: endpoint.addr },
            None => Route::Drop(DropReason::NoEndpoint { client_id, role }),
        },
    }
}

#[derive(Debug)]
pub struct DatagramDispatcher {
    socket: Arc<UdpSocket>,
    registry: Arc<Registry>,
    running: Arc<AtomicBool>,
}

impl DatagramDispatcher {
    pub fn new(socket: UdpSocket, registry: Arc<Registry>) -> Self {
        Self {
            socket: Arc::new(socket),
            registry,
            running: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Share a running flag with the rest of the service.
    pub fn with_stop_handle(mut self, running: Arc<AtomicBool>) -> Self {
        self.running = running;
        self
    }

    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.running)
    }

    pub fn local_addr(&self) -> Result<SocketAddr, TetherError> {
        Ok(self.socket.local_addr()?)
    }

    /// Receive and route datagrams until the running flag clears.
    pub async fn run(&self) {
        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
        if let Ok(addr) = self.socket.local_addr() {
            info!("datagram dispatcher on {addr}");
        }

        while self.running.load(Ordering::SeqCst) {
            let received = tokio::select! {
                r = self.socket.recv_from(&mut buf) => r,
                _ = wait_for_stop(&self.running) => break,
            };
            let (len, from) = match received {
                Ok(pair) => pair,
                Err(e) => {
                    warn!("udp receive error: {e}");
                    continue;
                }
            };

            let datagram = &buf[..len];
            let sent = match route(&self.registry, datagram, from) {
                Route::Reply { to, datagram } => self.socket.send_to(&datagram, to).await,
                Route::Forward { to } => {
                    trace!(%from, %to, len, "forward");
                    self.socket.send_to(datagram, to).await
                }
                Route::Drop(DropReason::RolesTaken(client_id)) => {
                    warn!(%from, client_id, "REGISTER rejected: both endpoints taken");
                    continue;
                }
                Route::Drop(reason) => {
                    debug!(%from, ?reason, "datagram dropped");
                    continue;
                }
            };
            if let Err(e) = sent {
                warn!("udp send error: {e}");
            }
        }
        info!("datagram dispatcher stopped");
    }
}
