use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use axum::body::Body;
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use futures::{Stream, StreamExt};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, DuplexStream};
use tokio_util::io::ReaderStream;
use tokio_util::sync::{CancellationToken, DropGuard};

use crate::{ByteInterval, ContentHandle};

pub const IO_BUFFER_SIZE: usize = 32 * 1024;
pub const READAHEAD: usize = 1024 * 1024;

/// Tuning for the body writer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamConfig {
    /// Largest single read, and the capacity of the pipe feeding the body.
    pub buffer_size: usize,
    /// Prefetch hint passed to the reader; `None` leaves the reader's default.
    pub readahead: Option<usize>,
    /// Longest a single read may wait for data before the stream is aborted.
    pub read_timeout: Option<Duration>,
}

impl Default for StreamConfig {
    fn default() -> Self {
        StreamConfig {
            buffer_size: IO_BUFFER_SIZE,
            readahead: Some(READAHEAD),
            read_timeout: None,
        }
    }
}

/// Outcome of writing a range to a sink.
#[derive(Debug)]
pub enum StreamResult {
    /// The reader was drained. `written` is short of the interval length
    /// when the source ended before its declared length.
    Completed { written: u64 },
    /// Streaming stopped early; bytes already written stay written.
    Aborted { written: u64, cause: AbortCause },
}

impl StreamResult {
    pub fn written(&self) -> u64 {
        match self {
            StreamResult::Completed { written } | StreamResult::Aborted { written, .. } => *written,
        }
    }

    pub fn is_completed(&self) -> bool {
        matches!(self, StreamResult::Completed { .. })
    }
}

#[derive(Debug, Error)]
pub enum AbortCause {
    #[error("failed to open reader: {0}")]
    Open(#[source] io::Error),
    #[error("failed to read source: {0}")]
    Read(#[source] io::Error),
    #[error("failed to write to client: {0}")]
    Write(#[source] io::Error),
    #[error("no data arrived within {0:?}")]
    Timeout(Duration),
    #[error("cancelled")]
    Cancelled,
}

/// Body of a partial response: one interval of one handle.
///
/// Use [`RangedBody::write_to`] to stream into any [`AsyncWrite`], or convert
/// it into a response body, which runs the writer on its own task.
pub struct RangedBody {
    handle: Arc<dyn ContentHandle>,
    interval: ByteInterval,
    config: StreamConfig,
    cancel: CancellationToken,
}

impl std::fmt::Debug for RangedBody {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RangedBody")
            .field("name", &self.handle.name())
            .field("interval", &self.interval)
            .finish()
    }
}

impl RangedBody {
    pub(crate) fn new(handle: Arc<dyn ContentHandle>, interval: ByteInterval, config: StreamConfig) -> Self {
        RangedBody { handle, interval, config, cancel: CancellationToken::new() }
    }

    pub fn interval(&self) -> ByteInterval {
        self.interval
    }

    /// Stops streaming as soon as `token` is cancelled, even while a read is
    /// waiting for data.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Writes exactly `interval.len()` bytes to `sink`, or fewer if the
    /// source ends early, any read or write fails, or the body is cancelled.
    /// Never retries.
    ///
    /// `written` counts every byte the sink accepted, including those of a
    /// chunk whose write failed part way.
    pub async fn write_to<W>(self, sink: &mut W) -> StreamResult
    where
        W: AsyncWrite + Unpin + ?Sized,
    {
        let RangedBody { handle, interval, config, cancel } = self;
        let mut written = 0u64;

        let mut reader = match handle.open_reader_at(interval.start).await {
            Ok(reader) => reader,
            Err(e) => return StreamResult::Aborted { written, cause: AbortCause::Open(e) },
        };
        if let Some(readahead) = config.readahead {
            reader.set_readahead(readahead);
        }

        let mut buffer = vec![0u8; config.buffer_size.max(1)];
        let mut remaining = interval.len();

        while remaining > 0 {
            // the smaller of the buffer size and the number of bytes remaining
            let nbytes = std::cmp::min(buffer.len(), usize::try_from(remaining).unwrap_or(usize::MAX));
            let read = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    return StreamResult::Aborted { written, cause: AbortCause::Cancelled };
                }
                read = read_bounded(&mut reader, &mut buffer[..nbytes], config.read_timeout) => read,
            };

            let n = match read {
                Ok(0) => {
                    tracing::warn!(
                        name = handle.name(),
                        written,
                        missing = remaining,
                        "source ended before its declared length"
                    );
                    break;
                }
                Ok(n) => n,
                Err(cause) => return StreamResult::Aborted { written, cause },
            };

            let mut chunk = &buffer[..n];
            while !chunk.is_empty() {
                let wrote = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {
                        return StreamResult::Aborted { written, cause: AbortCause::Cancelled };
                    }
                    wrote = sink.write(chunk) => wrote,
                };
                match wrote {
                    Ok(0) => {
                        let e = io::Error::from(io::ErrorKind::WriteZero);
                        return StreamResult::Aborted { written, cause: AbortCause::Write(e) };
                    }
                    Ok(m) => {
                        written += m as u64;
                        remaining -= m as u64;
                        chunk = &chunk[m..];
                    }
                    Err(e) => return StreamResult::Aborted { written, cause: AbortCause::Write(e) },
                }
            }
        }

        if let Err(e) = sink.flush().await {
            return StreamResult::Aborted { written, cause: AbortCause::Write(e) };
        }
        StreamResult::Completed { written }
    }
}

async fn read_bounded<R>(reader: &mut R, buf: &mut [u8], limit: Option<Duration>) -> Result<usize, AbortCause>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let read = match limit {
        Some(limit) => tokio::time::timeout(limit, reader.read(buf))
            .await
            .map_err(|_| AbortCause::Timeout(limit))?,
        None => reader.read(buf).await,
    };
    read.map_err(AbortCause::Read)
}

/// Response body that cancels its writer when hyper drops it, e.g. because
/// the client went away.
struct CancelOnDrop {
    inner: ReaderStream<DuplexStream>,
    _guard: DropGuard,
}

impl Stream for CancelOnDrop {
    type Item = io::Result<Bytes>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inner.poll_next_unpin(cx)
    }
}

impl IntoResponse for RangedBody {
    fn into_response(mut self) -> Response {
        let capacity = self.config.buffer_size.max(1);
        let (mut writer, reader) = tokio::io::duplex(capacity);
        let name = self.handle.name().to_string();
        let interval = self.interval;

        // a child token, so dropping one body never cancels a shared parent
        self.cancel = self.cancel.child_token();
        let guard = self.cancel.clone().drop_guard();

        tokio::spawn(async move {
            match self.write_to(&mut writer).await {
                StreamResult::Completed { written } => {
                    tracing::debug!(%name, start = interval.start, end = interval.end, written, "range streamed");
                }
                StreamResult::Aborted { written, cause: AbortCause::Cancelled } => {
                    tracing::debug!(%name, start = interval.start, end = interval.end, written, "range stream cancelled");
                }
                StreamResult::Aborted { written, cause } => {
                    tracing::warn!(%name, start = interval.start, end = interval.end, written, %cause, "range stream aborted");
                }
            }
        });

        let body = CancelOnDrop { inner: ReaderStream::with_capacity(reader, capacity), _guard: guard };
        Response::new(Body::from_stream(body))
    }
}
