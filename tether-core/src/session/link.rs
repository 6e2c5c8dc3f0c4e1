//! A registered TCP socket, shareable between a session and its pumps.
//!
//! The stream is split once at registration. The read half is taken by
//! exactly one pump at a time; the write half is locked per write, so a
//! handshake reply, the start signal and relayed bytes never interleave.
//! Closing is a cancellation signal: every pump touching the link stops,
//! and the socket itself is released when the last `Arc<Link>` drops.

use std::io;
use std::net::SocketAddr;

use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{Mutex, MutexGuard};
use tokio_util::sync::CancellationToken;

use crate::codec;
use crate::error::TetherError;

#[derive(Debug)]
pub struct Link {
    peer: SocketAddr,
    reader: Mutex<OwnedReadHalf>,
    writer: Mutex<OwnedWriteHalf>,
    closed: CancellationToken,
}

impl Link {
    pub fn new(stream: TcpStream) -> io::Result<Self> {
        let peer = stream.peer_addr()?;
        // Interactive traffic: no Nagle delay on small input/chat writes.
        stream.set_nodelay(true)?;
        let (reader, writer) = stream.into_split();
        Ok(Self {
            peer,
            reader: Mutex::new(reader),
            writer: Mutex::new(writer),
            closed: CancellationToken::new(),
        })
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    /// Signal every user of this link to let go of it.
    pub fn close(&self) {
        self.closed.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Resolves once [`close`](Self::close) has been called.
    pub async fn closed(&self) {
        self.closed.cancelled().await
    }

    pub(crate) async fn reader(&self) -> MutexGuard<'_, OwnedReadHalf> {
        self.reader.lock().await
    }

    /// Exclusive access to the write half.
    ///
    /// Holding the guard across a registration keeps the handshake reply
    /// ahead of anything the session writes to this socket.
    pub async fn writer(&self) -> MutexGuard<'_, OwnedWriteHalf> {
        self.writer.lock().await
    }

    /// Write and flush raw bytes.
    pub async fn write_all(&self, buf: &[u8]) -> io::Result<()> {
        let mut writer = self.writer.lock().await;
        writer.write_all(buf).await?;
        writer.flush().await
    }

    /// Write one length-prefixed line.
    pub async fn send_line(&self, line: &str) -> Result<(), TetherError> {
        let mut writer = self.writer.lock().await;
        codec::write_line(&mut *writer, line).await
    }

    /// Half-close the socket so the peer sees end-of-stream now rather
    /// than when the last reference drops.
    pub async fn shutdown(&self) {
        self.close();
        let mut writer = self.writer.lock().await;
        let _ = writer.shutdown().await;
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::sync::Arc;

    use tokio::net::{TcpListener, TcpStream};

    use super::Link;

    /// A registered server-side link plus the client stream talking to it.
    pub async fn link_pair() -> (Arc<Link>, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();
        (Arc::new(Link::new(server).unwrap()), client)
    }
}
