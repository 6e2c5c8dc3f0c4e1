//! Per-connection handshake worker.
//!
//! Reads one handshake line, registers the socket with its session and
//! answers `true,...` or `false,<reason>`. On success the socket belongs
//! to the session and the handler is done; it never relays bytes itself.
//! On failure the socket is closed after the reply. Nothing is retried.

use std::sync::Arc;

use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

use crate::codec;
use crate::error::{HandshakeError, Rejection, TetherError};
use crate::handshake::{Channel, Handshake, Reply, Role};
use crate::session::{Link, Registry, Session, SharerAdmission, ViewerAdmission};
use crate::settings::RelaySettings;

#[derive(Debug, Clone)]
pub struct ConnectionHandler {
    registry: Arc<Registry>,
    settings: RelaySettings,
    /// Channel served by the accepting listener, if it is dedicated.
    channel: Option<Channel>,
}

impl ConnectionHandler {
    pub fn new(registry: Arc<Registry>, settings: RelaySettings) -> Self {
        Self {
            registry,
            settings,
            channel: None,
        }
    }

    /// Only accept handshakes for `channel` on this handler.
    pub fn for_channel(mut self, channel: Channel) -> Self {
        self.channel = Some(channel);
        self
    }

    /// Run the handshake on a freshly accepted connection. Returns the
    /// reply that was sent.
    pub async fn handle(&self, mut stream: TcpStream) -> Result<Reply, TetherError> {
        let peer = stream.peer_addr()?;

        let line = match codec::read_line(&mut stream, self.settings.max_handshake_bytes).await {
            Ok(line) => line,
            Err(e) => {
                warn!(%peer, "unreadable handshake: {e}");
                return refuse_stream(stream, Reply::rejected(HandshakeError::Unreadable)).await;
            }
        };

        let handshake = match Handshake::parse(&line) {
            Ok(handshake) => handshake,
            Err(e) => {
                warn!(%peer, "{e}");
                return refuse_stream(stream, Reply::rejected(e)).await;
            }
        };

        if self.channel.is_some_and(|c| c != handshake.channel) {
            warn!(%peer, ?handshake, listener = ?self.channel, "handshake on wrong listener");
            return refuse_stream(stream, Reply::rejected(Rejection::ChannelMismatch)).await;
        }

        let link = Arc::new(Link::new(stream)?);
        let reply = match handshake.role {
            Role::Sharer => self.admit_sharer(&handshake, link).await?,
            Role::Viewer => self.admit_viewer(&handshake, link).await?,
        };

        if reply.is_accepted() {
            info!(%peer, username = %handshake.username, role = %handshake.role,
                channel = %handshake.channel, "handshake accepted");
        } else {
            warn!(%peer, username = %handshake.username, role = %handshake.role,
                channel = %handshake.channel, %reply, "handshake rejected");
        }
        Ok(reply)
    }

    async fn admit_sharer(&self, handshake: &Handshake, link: Arc<Link>) -> Result<Reply, TetherError> {
        let session = match self.registry.admit_sharer(handshake) {
            Ok(session) => session,
            Err(rejection) => return refuse_link(&link, rejection).await,
        };
        if !session.is_relaying() {
            session.declare_dimensions(handshake.width, handshake.height);
        }

        // Hold the write half until the reply is out, so a START_SESSION
        // triggered by a fast viewer cannot overtake it.
        let mut writer = link.writer().await;
        let admission = match session.register_sharer_channel(handshake.channel, link.clone()) {
            Ok(admission) => admission,
            Err(e) => {
                debug!("sharer registration failed: {e}");
                drop(writer);
                let rejection = match e {
                    TetherError::Rejected(rejection) => rejection,
                    _ => Rejection::AlreadyStarted,
                };
                return refuse_link(&link, rejection).await;
            }
        };

        let reply = match &admission {
            SharerAdmission::Partial => Reply::accepted("Waiting for remaining channels"),
            SharerAdmission::Ready => Reply::accepted("Ready for viewer"),
            SharerAdmission::Rejoined(_) => Reply::accepted("Rejoined session"),
        };
        let written = codec::write_line(&mut *writer, &reply.to_string()).await;
        drop(writer);

        match admission {
            SharerAdmission::Rejoined(plan) => {
                info!(username = session.username(), channel = %plan.channel, "sharer rejoined");
                session.spawn_channel(plan, self.settings.relay_buffer_bytes);
            }
            SharerAdmission::Partial | SharerAdmission::Ready => {
                tokio::spawn(watch_pending_sharer(
                    Arc::clone(&self.registry),
                    session,
                    handshake.channel,
                    link,
                ));
            }
        }
        written?;
        Ok(reply)
    }

    async fn admit_viewer(&self, handshake: &Handshake, link: Arc<Link>) -> Result<Reply, TetherError> {
        let Some(session) = self.registry.get(&handshake.username) else {
            return refuse_link(&link, Rejection::SessionNotFound).await;
        };
        if !session.is_sharer_ready() {
            return refuse_link(&link, Rejection::SharerNotReady).await;
        }
        if !session.check_secret(&handshake.password) {
            return refuse_link(&link, Rejection::InvalidPassword).await;
        }

        let (width, height) = session.dimensions();
        let mut writer = link.writer().await;
        let admission = match session.register_viewer_channel(handshake.channel, link.clone()) {
            Ok(admission) => admission,
            Err(rejection) => {
                drop(writer);
                return refuse_link(&link, rejection).await;
            }
        };

        let reply = Reply::dimensions(width, height);
        let written = codec::write_line(&mut *writer, &reply.to_string()).await;
        drop(writer);

        if let ViewerAdmission::Start(plan) = admission {
            // One-shot: the session leaves the registry whether or not
            // the start succeeds.
            self.registry.remove(&session);
            if let Err(e) = session
                .start_relay(plan, self.settings.relay_buffer_bytes)
                .await
            {
                warn!(username = session.username(), "relay start failed: {e}");
            }
        }
        written?;
        Ok(reply)
    }
}

/// Notice a pending sharer socket closing before its session pairs, and
/// release the session's registry slot once no sharer socket is left.
///
/// Only peeks, so nothing the sharer sends is consumed; the read half is
/// handed back as soon as the session stops waiting.
async fn watch_pending_sharer(
    registry: Arc<Registry>,
    session: Arc<Session>,
    channel: Channel,
    link: Arc<Link>,
) {
    let mut reader = tokio::select! {
        guard = link.reader() => guard,
        _ = link.closed() => return,
        _ = session.rendezvous_ended() => return,
    };

    let mut byte = [0u8; 1];
    let ended = tokio::select! {
        biased;
        _ = link.closed() => false,
        _ = session.rendezvous_ended() => false,
        peeked = reader.peek(&mut byte) => matches!(peeked, Ok(0) | Err(_)),
    };
    drop(reader);

    if ended && session.on_pending_sharer_drop(channel, &link) {
        registry.remove(&session);
        info!(username = session.username(), "pending session released");
    }
}

/// Reply on a raw stream and close it.
async fn refuse_stream(mut stream: TcpStream, reply: Reply) -> Result<Reply, TetherError> {
    let written = codec::write_line(&mut stream, &reply.to_string()).await;
    let _ = stream.shutdown().await;
    written.map(|_| reply)
}

/// Reply on a registered-but-refused link and close it.
async fn refuse_link(link: &Link, rejection: Rejection) -> Result<Reply, TetherError> {
    let reply = Reply::rejected(rejection);
    let written = link.send_line(&reply.to_string()).await;
    link.shutdown().await;
    written.map(|_| reply)
}
