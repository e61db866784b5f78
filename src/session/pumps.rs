//! Stream pumps between host stdio and a hijacked engine stream.

use super::detach::{DetachKeys, DetachMatcher};
use super::SessionIo;
use crate::engine::frame::demux_copy;
use crate::engine::{HijackedStream, StreamReader, StreamWriter};
use std::io;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// How the input pump stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputEnd {
    /// Host stdin reached EOF.
    Eof,
    /// The detach sequence was typed.
    Detached,
    Cancelled,
}

/// Copy a raw (TTY) stream to `out`, flushing after every read.
async fn copy_raw<W>(mut reader: StreamReader, out: &mut W) -> io::Result<u64>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut buf = [0u8; 4096];
    let mut total = 0u64;
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            return Ok(total);
        }
        out.write_all(&buf[..n]).await?;
        out.flush().await?;
        total += n as u64;
    }
}

/// Copy host stdin to the container, watching for the detach sequence.
///
/// The write side is half-closed on every exit path so the container sees
/// EOF on its stdin.
pub async fn input_pump<R>(
    mut stdin: R,
    mut writer: StreamWriter,
    detach_keys: Option<DetachKeys>,
    detached: CancellationToken,
    cancel: CancellationToken,
) -> io::Result<InputEnd>
where
    R: AsyncRead + Unpin,
{
    let mut matcher = detach_keys.as_ref().map(DetachMatcher::new);
    let mut buf = [0u8; 1024];

    let end = loop {
        let n = tokio::select! {
            biased;
            () = cancel.cancelled() => break InputEnd::Cancelled,
            result = stdin.read(&mut buf) => result?,
        };

        if n == 0 {
            debug!("EOF on stdin, closing container input");
            if let Some(m) = matcher.as_mut() {
                let held = m.flush();
                if !held.is_empty() {
                    writer.write_all(&held).await?;
                }
            }
            break InputEnd::Eof;
        }

        let (forward, detach) = match matcher.as_mut() {
            Some(m) => {
                let scan = m.feed(&buf[..n]);
                (scan.forward, scan.detach)
            }
            None => (buf[..n].to_vec(), false),
        };

        if !forward.is_empty() {
            writer.write_all(&forward).await?;
            writer.flush().await?;
        }

        if detach {
            debug!("detach sequence received");
            detached.cancel();
            break InputEnd::Detached;
        }
    };

    if let Err(e) = writer.shutdown().await {
        debug!("half-close of container stdin failed: {e}");
    }
    Ok(end)
}

/// Copy container output to host stdout/stderr until the stream closes.
pub async fn output_pump<O, E>(
    reader: StreamReader,
    framed: bool,
    stdout: &mut O,
    stderr: &mut E,
    cancel: CancellationToken,
) -> io::Result<u64>
where
    O: AsyncWrite + Unpin + ?Sized,
    E: AsyncWrite + Unpin + ?Sized,
{
    tokio::select! {
        biased;
        () = cancel.cancelled() => Ok(0),
        result = async {
            if framed {
                demux_copy(reader, stdout, stderr).await
            } else {
                copy_raw(reader, stdout).await
            }
        } => result,
    }
}

/// The running pump tasks of one session.
pub struct Pumps {
    output: Option<JoinHandle<io::Result<u64>>>,
    input: Option<JoinHandle<io::Result<InputEnd>>>,
    output_finished: bool,
    /// Cancelled by the input pump when the detach sequence is typed.
    pub detached: CancellationToken,
}

impl Pumps {
    /// Spawn the output pump and, if `stdin_open`, the input pump.
    pub fn start(
        stream: HijackedStream,
        io: SessionIo,
        stdin_open: bool,
        detach_keys: Option<DetachKeys>,
        cancel: &CancellationToken,
    ) -> Self {
        let HijackedStream {
            reader,
            writer,
            framed,
        } = stream;
        let SessionIo {
            stdin,
            mut stdout,
            mut stderr,
        } = io;
        let detached = CancellationToken::new();

        let output_cancel = cancel.clone();
        let output = tokio::spawn(async move {
            output_pump(reader, framed, &mut stdout, &mut stderr, output_cancel).await
        });

        let input = stdin_open.then(|| {
            tokio::spawn(input_pump(
                stdin,
                writer,
                detach_keys,
                detached.clone(),
                cancel.clone(),
            ))
        });

        Self {
            output: Some(output),
            input,
            output_finished: false,
            detached,
        }
    }

    #[must_use]
    pub const fn output_finished(&self) -> bool {
        self.output_finished
    }

    /// Wait for the output stream to close. Returns immediately once it has.
    pub async fn output_closed(&mut self) {
        if self.output_finished {
            return;
        }
        if let Some(handle) = self.output.as_mut() {
            match handle.await {
                Ok(Ok(bytes)) => debug!(bytes, "output stream closed"),
                Ok(Err(e)) => warn!("output stream ended with error: {e}"),
                Err(e) => warn!("output pump failed: {e}"),
            }
            self.output = None;
        }
        self.output_finished = true;
    }

    /// Wait for the pumps to finish until `timeout`, then abort the rest.
    pub async fn shutdown(&mut self, timeout: Duration) {
        let deadline = Instant::now() + timeout;
        if let Some(mut handle) = self.output.take() {
            if tokio::time::timeout_at(deadline, &mut handle).await.is_err() {
                debug!("output pump did not stop in time, aborting");
                handle.abort();
            }
            self.output_finished = true;
        }
        if let Some(mut handle) = self.input.take() {
            match tokio::time::timeout_at(deadline, &mut handle).await {
                Ok(Ok(Ok(end))) => debug!(?end, "input pump stopped"),
                Ok(Ok(Err(e))) => debug!("input pump ended with error: {e}"),
                Ok(Err(e)) => warn!("input pump failed: {e}"),
                Err(_) => {
                    debug!("input pump did not stop in time, aborting");
                    handle.abort();
                }
            }
        }
    }
}

impl Drop for Pumps {
    fn drop(&mut self) {
        if let Some(handle) = self.output.take() {
            handle.abort();
        }
        if let Some(handle) = self.input.take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::frame::{encode_frame, StreamKind};
    use tokio::io::duplex;

    #[tokio::test]
    async fn test_input_pump_swallows_detach_sequence() {
        let (mut host, stdin) = duplex(64);
        let (container_side, writer) = duplex(64);
        let detached = CancellationToken::new();

        host.write_all(b"hi\x10\x11ignored").await.unwrap();
        let end = input_pump(
            stdin,
            Box::pin(writer),
            Some(DetachKeys::default()),
            detached.clone(),
            CancellationToken::new(),
        )
        .await
        .unwrap();

        assert_eq!(end, InputEnd::Detached);
        assert!(detached.is_cancelled());

        let mut received = Vec::new();
        let mut container_side = container_side;
        container_side.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, b"hi");
    }

    #[tokio::test]
    async fn test_input_pump_half_closes_on_eof() {
        let (mut host, stdin) = duplex(64);
        let (mut container_side, writer) = duplex(64);

        host.write_all(b"data\x10").await.unwrap();
        drop(host);

        let end = input_pump(
            stdin,
            Box::pin(writer),
            Some(DetachKeys::default()),
            CancellationToken::new(),
            CancellationToken::new(),
        )
        .await
        .unwrap();
        assert_eq!(end, InputEnd::Eof);

        let mut received = Vec::new();
        container_side.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, b"data\x10");
    }

    #[tokio::test]
    async fn test_input_pump_stops_on_cancel() {
        let (_host, stdin) = duplex(64);
        let (_container_side, writer) = duplex(64);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let end = input_pump(stdin, Box::pin(writer), None, CancellationToken::new(), cancel)
            .await
            .unwrap();
        assert_eq!(end, InputEnd::Cancelled);
    }

    #[tokio::test]
    async fn test_output_pump_demuxes_framed_stream() {
        let mut input = Vec::new();
        input.extend(encode_frame(StreamKind::Stdout, b"out"));
        input.extend(encode_frame(StreamKind::Stderr, b"err"));

        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        output_pump(
            Box::pin(std::io::Cursor::new(input)),
            true,
            &mut stdout,
            &mut stderr,
            CancellationToken::new(),
        )
        .await
        .unwrap();

        assert_eq!(stdout, b"out");
        assert_eq!(stderr, b"err");
    }

    #[tokio::test]
    async fn test_output_pump_copies_tty_stream_verbatim() {
        let raw = encode_frame(StreamKind::Stdout, b"looks framed");
        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        output_pump(
            Box::pin(std::io::Cursor::new(raw.clone())),
            false,
            &mut stdout,
            &mut stderr,
            CancellationToken::new(),
        )
        .await
        .unwrap();

        assert_eq!(stdout, raw);
        assert!(stderr.is_empty());
    }
}
