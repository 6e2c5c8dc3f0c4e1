//! Length-prefixed UTF-8 lines for the TCP handshake.
//!
//! ```text
//! length: u16 (big-endian)
//! text:   [u8; length]  (UTF-8)
//! ```
//!
//! Handshakes, replies and the `START_SESSION` signal all use this
//! framing. The relay reads exactly one line per connection with
//! [`read_line`] so that no relayed bytes are consumed into a codec
//! buffer; clients can use [`LineCodec`] with `Framed`.

use bytes::{Buf, BufMut, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::TetherError;

/// Default cap on a single line.
pub const DEFAULT_MAX_LINE: usize = 1024;

const PREFIX_SIZE: usize = 2;

// ── LineCodec ────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct LineCodec {
    max_line: usize,
}

impl LineCodec {
    pub fn new(max_line: usize) -> Self {
        Self {
            max_line: max_line.min(u16::MAX as usize),
        }
    }

    pub fn max_line(&self) -> usize {
        self.max_line
    }
}

impl Default for LineCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_LINE)
    }
}

impl Decoder for LineCodec {
    type Item = String;
    type Error = TetherError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < PREFIX_SIZE {
            return Ok(None);
        }
        let len = u16::from_be_bytes([src[0], src[1]]) as usize;
        if len > self.max_line {
            return Err(TetherError::LineTooLong {
                size: len,
                max: self.max_line,
            });
        }
        if src.len() < PREFIX_SIZE + len {
            src.reserve(PREFIX_SIZE + len - src.len());
            return Ok(None);
        }
        src.advance(PREFIX_SIZE);
        let text = src.split_to(len);
        Ok(Some(String::from_utf8(text.to_vec())?))
    }
}

impl Encoder<&str> for LineCodec {
    type Error = TetherError;

    fn encode(&mut self, item: &str, dst: &mut BytesMut) -> Result<(), Self::Error> {
        if item.len() > self.max_line {
            return Err(TetherError::LineTooLong {
                size: item.len(),
                max: self.max_line,
            });
        }
        dst.reserve(PREFIX_SIZE + item.len());
        dst.put_u16(item.len() as u16);
        dst.put_slice(item.as_bytes());
        Ok(())
    }
}

// ── Direct I/O ───────────────────────────────────────────────────

/// Read exactly one line, consuming nothing past it.
pub async fn read_line<R>(reader: &mut R, max_line: usize) -> Result<String, TetherError>
where
    R: AsyncRead + Unpin,
{
    let len = reader.read_u16().await? as usize;
    if len > max_line {
        return Err(TetherError::LineTooLong {
            size: len,
            max: max_line,
        });
    }
    let mut text = vec![0u8; len];
    reader.read_exact(&mut text).await?;
    Ok(String::from_utf8(text)?)
}

/// Write one line and flush it.
pub async fn write_line<W>(writer: &mut W, line: &str) -> Result<(), TetherError>
where
    W: AsyncWrite + Unpin,
{
    let mut buf = BytesMut::new();
    LineCodec::new(u16::MAX as usize).encode(line, &mut buf)?;
    writer.write_all(&buf).await?;
    writer.flush().await?;
    Ok(())
}
