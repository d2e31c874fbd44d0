//! Framed message transport
//!
//! One duplex byte stream carries two kinds of traffic that never
//! interleave: control messages, each framed as a big-endian `u32` length
//! followed by that many bytes of JSON, and raw file payloads announced by a
//! `GET_FILE` message. The read side lives in [`MessageReader`], owned by the
//! agent's receive loop; the write side and the connection's close signal
//! live in [`Transport`].

use std::future::Future;
use std::io::ErrorKind;
use std::path::Path;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::fs::File;
use tokio::io::{
    self, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader, ReadHalf, WriteHalf,
};
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, trace};

use super::Message;
use crate::error::TransportError;

pub const DEFAULT_MAX_FRAME: usize = 1024 * 1024;

type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Splits a duplex stream into its message reader and writer halves.
pub fn split<S>(stream: S, max_frame: usize, timeout: Duration) -> (Transport, MessageReader)
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (read_half, write_half): (ReadHalf<S>, WriteHalf<S>) = io::split(stream);
    (
        Transport::new(Box::new(write_half), timeout),
        MessageReader::new(Box::new(read_half), max_frame),
    )
}

/// Serializes `message` into one length-prefixed frame.
pub fn encode_frame(message: &Message) -> Result<Vec<u8>, TransportError> {
    let body = serde_json::to_vec(message).map_err(TransportError::Encode)?;
    let len = u32::try_from(body.len()).map_err(|_| TransportError::FrameTooLarge {
        size: body.len(),
        limit: u32::MAX as usize,
    })?;

    let mut frame = Vec::with_capacity(4 + body.len());
    frame.extend_from_slice(&len.to_be_bytes());
    frame.extend_from_slice(&body);
    Ok(frame)
}

/// Receiving half of a connection.
pub struct MessageReader {
    inner: BufReader<BoxedReader>,
    max_frame: usize,
}

impl MessageReader {
    pub fn new(reader: BoxedReader, max_frame: usize) -> Self {
        Self {
            inner: BufReader::new(reader),
            max_frame,
        }
    }

    /// Reads the next control message. `Ok(None)` means the peer closed the
    /// stream between frames.
    pub async fn recv(&mut self) -> Result<Option<Message>, TransportError> {
        let Some(body) = self.recv_frame().await? else {
            return Ok(None);
        };
        let message = serde_json::from_slice(&body).map_err(TransportError::Decode)?;
        trace!(?message, "received");
        Ok(Some(message))
    }

    /// Reads one raw frame body without decoding it.
    pub async fn recv_frame(&mut self) -> Result<Option<Vec<u8>>, TransportError> {
        let len = match self.inner.read_u32().await {
            Ok(len) => len as usize,
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        if len > self.max_frame {
            return Err(TransportError::FrameTooLarge {
                size: len,
                limit: self.max_frame,
            });
        }

        let mut body = vec![0u8; len];
        self.inner.read_exact(&mut body).await?;
        Ok(Some(body))
    }

    /// Copies exactly `size` raw bytes off the connection into a new file at
    /// `path`. Bytes past `size` stay buffered for the next message.
    pub async fn get_file(&mut self, path: &Path, size: u64) -> Result<(), TransportError> {
        debug!(path = %path.display(), size, "receiving file");
        let mut output = File::create(path).await?;

        let mut payload = (&mut self.inner).take(size);
        let received = io::copy(&mut payload, &mut output).await?;
        output.flush().await?;

        if received != size {
            return Err(TransportError::SizeMismatch {
                expected: size,
                actual: received,
            });
        }
        Ok(())
    }
}

/// Sending half of a connection plus its liveness and close state.
pub struct Transport {
    writer: tokio::sync::Mutex<BoxedWriter>,
    closed: watch::Sender<bool>,
    timeout: Mutex<Duration>,
    last_activity: Mutex<Instant>,
}

impl Transport {
    pub fn new(writer: BoxedWriter, timeout: Duration) -> Self {
        let (closed, _) = watch::channel(false);
        Self {
            writer: tokio::sync::Mutex::new(writer),
            closed,
            timeout: Mutex::new(timeout),
            last_activity: Mutex::new(Instant::now()),
        }
    }

    pub async fn send_message(&self, message: &Message) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        let frame = encode_frame(message)?;
        trace!(?message, "sending");

        let mut writer = self.writer.lock().await;
        tokio::select! {
            written = async {
                writer.write_all(&frame).await?;
                writer.flush().await
            } => Ok(written?),
            _ = self.closed() => Err(TransportError::Closed),
        }
    }

    /// Streams exactly `size` bytes of the file at `path`. A file that no
    /// longer holds `size` bytes fails the transfer, since the peer is
    /// already committed to reading that many.
    pub async fn send_file(&self, path: &Path, size: u64) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        let file = File::open(path).await?;
        let mut payload = file.take(size);

        let mut writer = self.writer.lock().await;
        let sent = tokio::select! {
            sent = async {
                let sent = io::copy(&mut payload, &mut *writer).await?;
                writer.flush().await?;
                Ok::<_, std::io::Error>(sent)
            } => sent?,
            _ = self.closed() => return Err(TransportError::Closed),
        };

        if sent != size {
            return Err(TransportError::SizeMismatch {
                expected: size,
                actual: sent,
            });
        }
        Ok(())
    }

    /// Sets the deadline applied to [`Transport::await_response`].
    pub fn set_timeout(&self, timeout: Duration) {
        *self.timeout.lock() = timeout;
    }

    pub fn timeout(&self) -> Duration {
        *self.timeout.lock()
    }

    /// Records that the peer just sent something.
    pub fn touch(&self) {
        *self.last_activity.lock() = Instant::now();
    }

    /// Waits for `response` until the peer has been silent for the whole
    /// timeout. Missing the deadline closes the connection.
    pub async fn await_response<F: Future>(
        &self,
        response: F,
    ) -> Result<F::Output, TransportError> {
        let started = Instant::now();
        tokio::pin!(response);

        loop {
            let idle_since = (*self.last_activity.lock()).max(started);
            let deadline = idle_since + self.timeout();
            if deadline <= Instant::now() {
                debug!("peer response deadline elapsed");
                self.close_connection(None).await;
                return Err(TransportError::Timeout);
            }

            tokio::select! {
                output = &mut response => return Ok(output),
                _ = tokio::time::sleep_until(deadline) => {}
            }
        }
    }

    /// Flushes an optional last message, then signals `closed` and shuts the
    /// write side down. Safe to call more than once.
    pub async fn close_connection(&self, final_message: Option<&Message>) {
        if let Some(message) = final_message {
            let _ = self.send_message(message).await;
        }
        let first = !self.closed.send_replace(true);
        if first {
            // Writes in flight give up on `closed`, so the lock frees up even
            // when a sender is stuck on a full socket.
            let mut writer = self.writer.lock().await;
            let _ = writer.shutdown().await;
        }
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Resolves once the connection has been closed.
    pub async fn closed(&self) {
        let mut receiver = self.closed.subscribe();
        let _ = receiver.wait_for(|closed| *closed).await;
    }
}
