//! Chunked binary file transfer.
//!
//! # Chunk Format
//!
//! ```text
//! +----------------+------------------+
//! | length (i32 BE)| length raw bytes |   repeated
//! +----------------+------------------+
//! | -1 (i32 BE)    |                      terminator
//! +----------------+
//! ```
//!
//! The `-1` header is the only end-of-transmission signal. Receivers never
//! infer completion from how many bytes happen to be buffered or from a size
//! announced up front.
//!
//! Cancellation is checked between chunks, so it takes effect at most one
//! chunk late.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

use crate::error::{ProtocolError, Result};

/// Default number of bytes read from the source per chunk.
pub const DEFAULT_CHUNK_SIZE: usize = 1024;

/// Largest chunk a receiver accepts (1MB).
pub const MAX_CHUNK_SIZE: usize = 1024 * 1024;

/// Chunk header value marking the end of a transfer.
pub const END_OF_TRANSMISSION: i32 = -1;

/// Direction of a transfer, seen from the local side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Local bytes are sent to the peer.
    Upload,
    /// Peer bytes are written locally.
    Download,
}

/// Snapshot of a transfer's progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Progress {
    /// Bytes moved so far.
    pub transferred: u64,
    /// Declared total size, when known.
    pub total: Option<u64>,
}

impl Progress {
    /// Completion percentage, when the total is known.
    pub fn percent(&self) -> Option<u8> {
        match self.total {
            Some(0) => Some(100),
            Some(total) => Some(((self.transferred.min(total) * 100) / total) as u8),
            None => None,
        }
    }
}

/// State of one transfer over one connection.
#[derive(Debug)]
pub struct TransferSession {
    direction: Direction,
    transferred: u64,
    total_size: Option<u64>,
    chunk_size: usize,
    cancel: CancellationToken,
}

impl TransferSession {
    /// Create a session that stops when `cancel` is triggered.
    pub fn new(direction: Direction, cancel: CancellationToken) -> Self {
        Self {
            direction,
            transferred: 0,
            total_size: None,
            chunk_size: DEFAULT_CHUNK_SIZE,
            cancel,
        }
    }

    /// Set the declared total size.
    pub fn with_total_size(mut self, total_size: u64) -> Self {
        self.total_size = Some(total_size);
        self
    }

    /// Set the sender's read buffer size, clamped to `1..=MAX_CHUNK_SIZE`.
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.clamp(1, MAX_CHUNK_SIZE);
        self
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn transferred(&self) -> u64 {
        self.transferred
    }

    pub fn total_size(&self) -> Option<u64> {
        self.total_size
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Whether cancellation has been requested.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// The token that cancels this session.
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Current progress.
    pub fn progress(&self) -> Progress {
        Progress {
            transferred: self.transferred,
            total: self.total_size,
        }
    }

    fn record(&mut self, bytes: usize) {
        self.transferred += bytes as u64;
    }

    fn cancelled(&self) -> ProtocolError {
        ProtocolError::TransferCancelled {
            transferred: self.transferred,
        }
    }

    /// Errors observed after cancellation are reported as the cancellation.
    fn classify(&self, err: impl Into<ProtocolError>) -> ProtocolError {
        if self.is_cancelled() {
            self.cancelled()
        } else {
            err.into()
        }
    }
}

/// Read from `source` until `buffer` is full or the source is exhausted.
async fn fill_buffer<R>(source: &mut R, buffer: &mut [u8]) -> std::io::Result<usize>
where
    R: AsyncRead + Unpin,
{
    let mut filled = 0;
    while filled < buffer.len() {
        let n = source.read(&mut buffer[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

/// Stream `source` to `writer` as length-prefixed chunks.
///
/// `on_progress` runs after every data chunk. When the session is cancelled
/// the terminator is still written, so the receiver ends cleanly, and the
/// call returns [`ProtocolError::TransferCancelled`].
pub async fn send_file<W, R, F>(
    writer: &mut W,
    source: &mut R,
    session: &mut TransferSession,
    mut on_progress: F,
) -> Result<()>
where
    W: AsyncWrite + Unpin,
    R: AsyncRead + Unpin,
    F: FnMut(Progress),
{
    let mut buffer = vec![0u8; session.chunk_size];

    while !session.is_cancelled() {
        let n = fill_buffer(source, &mut buffer).await?;
        if n == 0 {
            break;
        }

        writer
            .write_i32(n as i32)
            .await
            .map_err(|e| session.classify(e))?;
        writer
            .write_all(&buffer[..n])
            .await
            .map_err(|e| session.classify(e))?;

        session.record(n);
        on_progress(session.progress());
    }

    writer
        .write_i32(END_OF_TRANSMISSION)
        .await
        .map_err(|e| session.classify(e))?;
    writer.flush().await.map_err(|e| session.classify(e))?;

    if session.is_cancelled() {
        tracing::debug!(transferred = session.transferred, "upload cancelled");
        return Err(session.cancelled());
    }
    Ok(())
}

/// Read length-prefixed chunks from `reader` into `destination` until the
/// terminator arrives.
///
/// Cancellation returns [`ProtocolError::TransferCancelled`] with everything
/// received so far flushed to `destination`. The caller drops the
/// connection, which tells the sender to stop.
pub async fn receive_file<R, W, F>(
    reader: &mut R,
    destination: &mut W,
    session: &mut TransferSession,
    mut on_progress: F,
) -> Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
    F: FnMut(Progress),
{
    let mut buffer = Vec::new();

    loop {
        let header = tokio::select! {
            biased;
            _ = session.cancel.cancelled() => None,
            header = reader.read_i32() => Some(header.map_err(|e| session.classify(e))?),
        };

        let Some(header) = header else {
            destination.flush().await?;
            tracing::debug!(transferred = session.transferred, "download cancelled");
            return Err(session.cancelled());
        };

        if header == END_OF_TRANSMISSION {
            break;
        }
        if header < 0 || header as usize > MAX_CHUNK_SIZE {
            return Err(ProtocolError::ProtocolViolation(format!(
                "invalid chunk header {}",
                header
            )));
        }

        let len = header as usize;
        buffer.resize(len, 0);
        reader
            .read_exact(&mut buffer)
            .await
            .map_err(|e| session.classify(e))?;
        destination.write_all(&buffer).await?;

        session.record(len);
        on_progress(session.progress());
    }

    destination.flush().await?;
    Ok(())
}
