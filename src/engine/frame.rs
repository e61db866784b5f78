//! Framed-stream codec for non-TTY attach, exec and logs streams.
//!
//! Each frame is an 8-byte header followed by the payload:
//!
//! ```text
//! [stream id: u8][reserved: 3 bytes][length: u32 big-endian][payload...]
//! ```
//!
//! TTY streams are never framed and are copied through verbatim.

use bytes::{Buf, Bytes, BytesMut};
use futures::StreamExt;
use std::io;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio_util::codec::{Decoder, FramedRead};

const HEADER_LEN: usize = 8;

/// Upper bound on buffer growth requested ahead of a partial frame.
const MAX_RESERVE: usize = 64 * 1024;

/// Stream a frame belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Stdin,
    Stdout,
    Stderr,
    /// Engine-side error text.
    System,
}

impl StreamKind {
    const fn from_id(id: u8) -> Option<Self> {
        match id {
            0 => Some(Self::Stdin),
            1 => Some(Self::Stdout),
            2 => Some(Self::Stderr),
            3 => Some(Self::System),
            _ => None,
        }
    }

    #[must_use]
    pub const fn id(self) -> u8 {
        match self {
            Self::Stdin => 0,
            Self::Stdout => 1,
            Self::Stderr => 2,
            Self::System => 3,
        }
    }
}

/// A decoded frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub stream: StreamKind,
    pub payload: Bytes,
}

/// Decoder for the 8-byte-header framing.
#[derive(Debug, Default, Clone, Copy)]
pub struct FrameCodec;

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < HEADER_LEN {
            return Ok(None);
        }

        let stream = StreamKind::from_id(src[0]).ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!("invalid stream id {} in frame header", src[0]),
            )
        })?;
        let len = u32::from_be_bytes([src[4], src[5], src[6], src[7]]) as usize;

        if src.len() < HEADER_LEN + len {
            src.reserve((HEADER_LEN + len - src.len()).min(MAX_RESERVE));
            return Ok(None);
        }

        src.advance(HEADER_LEN);
        let payload = src.split_to(len).freeze();
        Ok(Some(Frame { stream, payload }))
    }
}

/// Encode one frame. Used by the fake engine and tests.
#[must_use]
pub fn encode_frame(stream: StreamKind, payload: &[u8]) -> Vec<u8> {
    let len = u32::try_from(payload.len()).unwrap_or(u32::MAX);
    let mut out = Vec::with_capacity(HEADER_LEN + payload.len());
    out.push(stream.id());
    out.extend_from_slice(&[0, 0, 0]);
    out.extend_from_slice(&len.to_be_bytes());
    out.extend_from_slice(payload);
    out
}

/// Demultiplex a framed stream into stdout and stderr.
///
/// Payloads are written in the order they arrive. Stdin frames are dropped;
/// system-error frames go to stderr. Returns the number of payload bytes
/// written.
pub async fn demux_copy<R, O, E>(reader: R, stdout: &mut O, stderr: &mut E) -> io::Result<u64>
where
    R: AsyncRead + Unpin,
    O: AsyncWrite + Unpin + ?Sized,
    E: AsyncWrite + Unpin + ?Sized,
{
    let mut frames = FramedRead::new(reader, FrameCodec);
    let mut written = 0u64;

    while let Some(frame) = frames.next().await {
        let frame = frame?;
        match frame.stream {
            StreamKind::Stdout => {
                stdout.write_all(&frame.payload).await?;
                stdout.flush().await?;
            }
            StreamKind::Stderr | StreamKind::System => {
                stderr.write_all(&frame.payload).await?;
                stderr.flush().await?;
            }
            StreamKind::Stdin => continue,
        }
        written += frame.payload.len() as u64;
    }

    Ok(written)
}
