//! One-direction byte forwarding between two links.
//!
//! A pump copies `source → destination` until the source ends, errors,
//! or either link is closed. Each chunk is written and flushed before
//! the next read.
//!
//! When the source ends, an owned pump asks its session whether the
//! disconnect is real (see [`Session::classify_disconnect`]):
//!
//! | verdict                  | action                                   |
//! |--------------------------|------------------------------------------|
//! | within grace / stale     | none                                     |
//! | sharer left              | open the grace window, wait it out, then |
//! |                          | shut the viewer socket unless rejoined   |
//! | viewer left              | notify session, sharer socket untouched  |
//!
//! The source link is closed in every case, before any waiting, so the
//! opposite pump lets go of the viewer socket for a rejoin.

use std::sync::Arc;

use tokio::io::AsyncReadExt;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use crate::session::{Disconnect, Link, Session, Ticket};

pub const DEFAULT_BUFFER_SIZE: usize = 8 * 1024;

/// Why a pump stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PumpExit {
    /// Source reached end-of-stream.
    SourceEnded,
    /// Reading the source failed.
    SourceFailed,
    /// The source link was closed by someone else.
    SourceClosed,
    /// The destination link was closed by someone else.
    DestinationClosed,
    /// Writing the destination failed.
    DestinationFailed,
}

impl PumpExit {
    /// Whether the source side went away on its own.
    pub fn is_source_end(self) -> bool {
        matches!(self, Self::SourceEnded | Self::SourceFailed)
    }
}

#[derive(Debug)]
struct Owner {
    session: Arc<Session>,
    source: Ticket,
    destination: Ticket,
}

#[derive(Debug)]
pub struct RelayPump {
    source: Arc<Link>,
    destination: Arc<Link>,
    owner: Option<Owner>,
    buffer_size: usize,
}

impl RelayPump {
    pub fn new(source: Arc<Link>, destination: Arc<Link>) -> Self {
        Self {
            source,
            destination,
            owner: None,
            buffer_size: DEFAULT_BUFFER_SIZE,
        }
    }

    pub fn with_buffer_size(mut self, buffer_size: usize) -> Self {
        self.buffer_size = buffer_size.max(1);
        self
    }

    /// Attach the session consulted on disconnect, with the tickets the
    /// two links were registered under.
    pub fn with_owner(mut self, session: Arc<Session>, source: Ticket, destination: Ticket) -> Self {
        self.owner = Some(Owner {
            session,
            source,
            destination,
        });
        self
    }

    pub fn spawn(self) -> JoinHandle<PumpExit> {
        tokio::spawn(self.run())
    }

    pub async fn run(self) -> PumpExit {
        let exit = self.forward().await;
        debug!(
            from = %self.source.peer_addr(),
            to = %self.destination.peer_addr(),
            ?exit,
            "pump stopped"
        );
        if exit.is_source_end() {
            self.on_source_end().await;
        }
        exit
    }

    async fn forward(&self) -> PumpExit {
        // A rejoined channel waits here until the superseded pump lets go.
        let mut reader = tokio::select! {
            guard = self.source.reader() => guard,
            _ = self.source.closed() => return PumpExit::SourceClosed,
            _ = self.destination.closed() => return PumpExit::DestinationClosed,
        };

        let mut buf = vec![0u8; self.buffer_size];
        loop {
            let n = tokio::select! {
                biased;
                _ = self.source.closed() => return PumpExit::SourceClosed,
                _ = self.destination.closed() => return PumpExit::DestinationClosed,
                read = reader.read(&mut buf) => match read {
                    Ok(0) => return PumpExit::SourceEnded,
                    Ok(n) => n,
                    Err(e) => {
                        debug!("source read failed: {e}");
                        return PumpExit::SourceFailed;
                    }
                },
            };

            let written = tokio::select! {
                biased;
                _ = self.destination.closed() => return PumpExit::DestinationClosed,
                result = self.destination.write_all(&buf[..n]) => result,
            };
            if let Err(e) = written {
                debug!("destination write failed: {e}");
                return PumpExit::DestinationFailed;
            }
            trace!(bytes = n, "relayed");
        }
    }

    async fn on_source_end(&self) {
        let Some(owner) = &self.owner else {
            self.source.close();
            self.destination.shutdown().await;
            return;
        };

        let mut verdict = owner
            .session
            .classify_disconnect(owner.source, owner.destination);
        self.source.close();

        if verdict == Disconnect::SharerLeft {
            if let Some(until) = owner.session.open_grace(owner.source) {
                tokio::time::sleep_until(until.into()).await;
            }
            verdict = owner
                .session
                .classify_disconnect(owner.source, owner.destination);
        }

        match verdict {
            Disconnect::SharerLeft => {
                self.destination.shutdown().await;
                owner.session.on_sharer_disconnect(owner.source);
            }
            Disconnect::ViewerLeft => {
                owner.session.on_viewer_disconnect(owner.source);
            }
            Disconnect::WithinGrace | Disconnect::StaleDestination | Disconnect::StaleSource => {
                debug!(
                    username = owner.session.username(),
                    channel = %owner.source.channel,
                    ?verdict,
                    "disconnect ignored"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    use super::*;
    use crate::codec::read_line;
    use crate::handshake::{Channel, START_SESSION};
    use crate::session::link::test_support::link_pair;
    use crate::session::{SharerAdmission, ViewerAdmission};

    const WAIT: Duration = Duration::from_secs(5);

    struct Paired {
        session: Arc<Session>,
        sharer_links: Vec<Arc<Link>>,
        viewer_links: Vec<Arc<Link>>,
        sharers: Vec<TcpStream>,
        viewers: Vec<TcpStream>,
    }

    /// A session with all six sockets registered and its relay running.
    async fn paired(grace: Duration) -> Paired {
        let session = Arc::new(Session::new("alice", "x", 800, 600, grace));
        let mut p = Paired {
            session: session.clone(),
            sharer_links: Vec::new(),
            viewer_links: Vec::new(),
            sharers: Vec::new(),
            viewers: Vec::new(),
        };
        for channel in Channel::ALL {
            let (link, client) = link_pair().await;
            session.register_sharer_channel(channel, link.clone()).unwrap();
            p.sharer_links.push(link);
            p.sharers.push(client);
        }
        let mut plan = None;
        for channel in Channel::ALL {
            let (link, client) = link_pair().await;
            if let ViewerAdmission::Start(started) =
                session.register_viewer_channel(channel, link.clone()).unwrap()
            {
                plan = Some(started);
            }
            p.viewer_links.push(link);
            p.viewers.push(client);
        }
        session.start_relay(plan.unwrap(), 1024).await.unwrap();

        let signal = read_line(&mut p.sharers[Channel::Control.index()], 64)
            .await
            .unwrap();
        assert_eq!(signal, START_SESSION);
        p
    }

    async fn read_some(stream: &mut TcpStream, len: usize) -> Vec<u8> {
        let mut buf = vec![0u8; len];
        tokio::time::timeout(WAIT, stream.read_exact(&mut buf))
            .await
            .expect("timed out")
            .unwrap();
        buf
    }

    async fn expect_eof(stream: &mut TcpStream) {
        let mut buf = [0u8; 16];
        let n = tokio::time::timeout(WAIT, stream.read(&mut buf))
            .await
            .expect("timed out waiting for EOF")
            .unwrap_or(0);
        assert_eq!(n, 0);
    }

    #[tokio::test]
    async fn forwards_bytes_verbatim() {
        let (source, mut src_client) = link_pair().await;
        let (destination, mut dst_client) = link_pair().await;
        let pump = RelayPump::new(source, destination).with_buffer_size(7).spawn();

        let payload: Vec<u8> = (0..=255).collect();
        src_client.write_all(&payload).await.unwrap();
        assert_eq!(read_some(&mut dst_client, payload.len()).await, payload);

        drop(src_client);
        expect_eof(&mut dst_client).await;
        assert_eq!(pump.await.unwrap(), PumpExit::SourceEnded);
    }

    #[tokio::test]
    async fn closing_destination_stops_pump() {
        let (source, _src_client) = link_pair().await;
        let (destination, _dst_client) = link_pair().await;
        let pump = RelayPump::new(source.clone(), destination.clone()).spawn();
        destination.close();
        let exit = tokio::time::timeout(WAIT, pump).await.unwrap().unwrap();
        assert_eq!(exit, PumpExit::DestinationClosed);
        assert!(!source.is_closed());
    }

    #[tokio::test]
    async fn all_channels_relay_both_ways() {
        let mut p = paired(Duration::ZERO).await;
        for channel in Channel::ALL {
            let i = channel.index();
            p.sharers[i].write_all(channel.as_str().as_bytes()).await.unwrap();
            assert_eq!(
                read_some(&mut p.viewers[i], channel.as_str().len()).await,
                channel.as_str().as_bytes()
            );
            p.viewers[i].write_all(b"input").await.unwrap();
            assert_eq!(read_some(&mut p.sharers[i], 5).await, b"input");
        }
    }

    #[tokio::test]
    async fn sharer_disconnect_closes_viewer() {
        let mut p = paired(Duration::ZERO).await;
        let screen = Channel::Screen.index();
        let sharer = p.sharers.remove(screen);
        drop(sharer);

        let mut viewer = p.viewers.remove(screen);
        expect_eof(&mut viewer).await;
        assert!(p.viewer_links[screen].is_closed());
    }

    #[tokio::test]
    async fn viewer_disconnect_leaves_sharer_open() {
        let mut p = paired(Duration::ZERO).await;
        let chat = Channel::Chat.index();
        drop(p.viewers.remove(chat));

        // Wait for the viewer-side pump to observe the drop.
        tokio::time::timeout(WAIT, p.viewer_links[chat].closed())
            .await
            .unwrap();
        assert!(!p.sharer_links[chat].is_closed());

        let mut buf = [0u8; 1];
        let read = tokio::time::timeout(
            Duration::from_millis(200),
            p.sharers[chat].read(&mut buf),
        )
        .await;
        assert!(read.is_err(), "sharer socket must stay open");
    }

    #[tokio::test]
    async fn sharer_rejoin_keeps_viewer_open() {
        let mut p = paired(Duration::from_secs(30)).await;
        let screen = Channel::Screen.index();

        let (replacement, mut new_sharer) = link_pair().await;
        let admission = p
            .session
            .register_sharer_channel(Channel::Screen, replacement)
            .unwrap();
        let plan = match admission {
            SharerAdmission::Rejoined(plan) => plan,
            other => panic!("expected rejoin, got {other:?}"),
        };
        assert!(p.sharer_links[screen].is_closed());
        p.session.spawn_channel(plan, 1024);

        // The superseded sharer goes away; the viewer must not notice.
        drop(p.sharers.remove(screen));
        new_sharer.write_all(b"frame").await.unwrap();
        assert_eq!(read_some(&mut p.viewers[screen], 5).await, b"frame");
        assert!(!p.viewer_links[screen].is_closed());

        p.viewers[screen].write_all(b"click").await.unwrap();
        assert_eq!(read_some(&mut new_sharer, 5).await, b"click");
    }

    #[tokio::test]
    async fn sharer_drop_then_rejoin_keeps_viewer() {
        let mut p = paired(Duration::from_secs(30)).await;
        let screen = Channel::Screen.index();

        // The sharer's socket goes away first.
        drop(p.sharers.remove(screen));
        tokio::time::timeout(WAIT, p.sharer_links[screen].closed())
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!p.viewer_links[screen].is_closed());

        // Then reconnects within the window.
        let (replacement, mut new_sharer) = link_pair().await;
        let plan = match p
            .session
            .register_sharer_channel(Channel::Screen, replacement)
            .unwrap()
        {
            SharerAdmission::Rejoined(plan) => plan,
            other => panic!("expected rejoin, got {other:?}"),
        };
        p.session.spawn_channel(plan, 1024);

        new_sharer.write_all(b"fresh").await.unwrap();
        assert_eq!(read_some(&mut p.viewers[screen], 5).await, b"fresh");
        p.viewers[screen].write_all(b"input").await.unwrap();
        assert_eq!(read_some(&mut new_sharer, 5).await, b"input");
        assert!(!p.viewer_links[screen].is_closed());
    }

    #[tokio::test]
    async fn sharer_drop_without_rejoin_closes_viewer_after_grace() {
        let mut p = paired(Duration::from_millis(300)).await;
        let control = Channel::Control.index();

        drop(p.sharers.remove(control));
        tokio::time::timeout(WAIT, p.sharer_links[control].closed())
            .await
            .unwrap();
        assert!(!p.viewer_links[control].is_closed());

        let mut viewer = p.viewers.remove(control);
        expect_eof(&mut viewer).await;
        assert!(p.viewer_links[control].is_closed());
    }
}
