//! In-memory content that is populated piece by piece, in any order.
//!
//! Readers over a [`PartialContent`] suspend when the byte at their cursor
//! has not arrived yet and wake as soon as the piece holding it is inserted.
//! Removing the content fails every pending and future read.

use std::collections::BTreeMap;
use std::io;
use std::ops::Range;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context, Poll};

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use thiserror::Error;
use tokio::io::{AsyncRead, ReadBuf};
use tokio::sync::watch;
use tokio_stream::wrappers::WatchStream;

use crate::{ContentHandle, ContentReader};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PieceError {
    #[error("piece {index} is out of range ({count} pieces)")]
    OutOfRange { index: usize, count: usize },
    #[error("piece {index} must be {expected} bytes, got {actual}")]
    LengthMismatch { index: usize, expected: u64, actual: u64 },
    #[error("content has been removed")]
    Removed,
}

#[derive(Debug)]
struct Pieces {
    pieces: Vec<Option<Bytes>>,
    available: u64,
    removed: bool,
    /// Read-ahead window of each live reader, keyed by reader id.
    wanted: BTreeMap<u64, Range<u64>>,
}

enum Slot {
    /// Number of bytes copied into the caller's buffer.
    Copied(usize),
    Missing,
    End,
    Removed,
}

/// Fixed-length content split into equally sized pieces (the last one may be
/// shorter).
#[derive(Debug)]
pub struct PartialContent {
    name: String,
    length: u64,
    piece_len: u64,
    state: Mutex<Pieces>,
    changes: watch::Sender<u64>,
    next_reader: AtomicU64,
}

impl PartialContent {
    /// Creates empty content of `length` bytes. A zero `piece_len` is treated
    /// as one byte.
    pub fn new(name: impl Into<String>, length: u64, piece_len: u64) -> Arc<PartialContent> {
        let piece_len = piece_len.max(1);
        let count = usize::try_from(length.div_ceil(piece_len)).unwrap_or(usize::MAX);
        let (changes, _) = watch::channel(0);
        Arc::new(PartialContent {
            name: name.into(),
            length,
            piece_len,
            state: Mutex::new(Pieces {
                pieces: vec![None; count],
                available: 0,
                removed: false,
                wanted: BTreeMap::new(),
            }),
            changes,
            next_reader: AtomicU64::new(0),
        })
    }

    /// Creates content with every piece already present.
    pub fn complete(name: impl Into<String>, data: Bytes, piece_len: u64) -> Arc<PartialContent> {
        let content = PartialContent::new(name, data.len() as u64, piece_len);
        for index in 0..content.piece_count() {
            let range = content.piece_range(index);
            let piece = data.slice(range.start as usize..range.end as usize);
            // lengths come from the same data, insertion cannot fail
            let _ = content.insert_piece(index, piece);
        }
        content
    }

    pub fn piece_count(&self) -> usize {
        self.lock().pieces.len()
    }

    pub fn piece_len(&self) -> u64 {
        self.piece_len
    }

    /// Byte range covered by piece `index`.
    pub fn piece_range(&self, index: usize) -> Range<u64> {
        let start = index as u64 * self.piece_len;
        start..(start + self.piece_len).min(self.length)
    }

    /// Stores a piece and wakes every reader waiting on new data. Inserting a
    /// piece that is already present replaces it.
    pub fn insert_piece(&self, index: usize, data: Bytes) -> Result<(), PieceError> {
        let mut state = self.lock();
        if state.removed {
            return Err(PieceError::Removed);
        }
        let count = state.pieces.len();
        if index >= count {
            return Err(PieceError::OutOfRange { index, count });
        }
        let range = self.piece_range(index);
        let expected = range.end - range.start;
        if data.len() as u64 != expected {
            return Err(PieceError::LengthMismatch { index, expected, actual: data.len() as u64 });
        }
        if state.pieces[index].replace(data).is_none() {
            state.available += expected;
        }
        drop(state);
        self.changes.send_modify(|version| *version += 1);
        Ok(())
    }

    pub fn has_piece(&self, index: usize) -> bool {
        self.lock().pieces.get(index).is_some_and(Option::is_some)
    }

    /// Number of bytes currently present, contiguous or not.
    pub fn bytes_available(&self) -> u64 {
        self.lock().available
    }

    pub fn is_complete(&self) -> bool {
        self.bytes_available() == self.length
    }

    /// The windows live readers asked to be fetched first, oldest reader
    /// first. A reader's window goes away when the reader is dropped.
    pub fn wanted(&self) -> Vec<Range<u64>> {
        self.lock().wanted.values().cloned().collect()
    }

    /// Marks the content as gone. Readers fail with [`io::ErrorKind::NotFound`].
    pub fn remove(&self) {
        let mut state = self.lock();
        state.removed = true;
        state.pieces.iter_mut().for_each(|piece| *piece = None);
        state.available = 0;
        drop(state);
        self.changes.send_modify(|version| *version += 1);
    }

    fn lock(&self) -> MutexGuard<'_, Pieces> {
        // a panicking writer cannot leave the piece table half-updated
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn read_at(&self, position: u64, buf: &mut ReadBuf<'_>) -> Slot {
        let state = self.lock();
        if state.removed {
            return Slot::Removed;
        }
        if position >= self.length {
            return Slot::End;
        }
        let index = (position / self.piece_len) as usize;
        match &state.pieces[index] {
            None => Slot::Missing,
            Some(piece) => {
                let offset = (position % self.piece_len) as usize;
                let n = buf.remaining().min(piece.len() - offset);
                buf.put_slice(&piece[offset..offset + n]);
                Slot::Copied(n)
            }
        }
    }

    fn set_wanted(&self, reader: u64, wanted: Option<Range<u64>>) {
        let mut state = self.lock();
        match wanted {
            Some(window) => state.wanted.insert(reader, window),
            None => state.wanted.remove(&reader),
        };
    }
}

#[async_trait]
impl ContentHandle for Arc<PartialContent> {
    fn name(&self) -> &str {
        &self.name
    }

    fn length(&self) -> u64 {
        self.length
    }

    async fn open_reader_at(&self, offset: u64) -> io::Result<Box<dyn ContentReader>> {
        Ok(Box::new(PartialReader::new(Arc::clone(self), offset)))
    }
}

/// Sequential reader over a [`PartialContent`].
pub struct PartialReader {
    id: u64,
    content: Arc<PartialContent>,
    position: u64,
    readahead: usize,
    changes: WatchStream<u64>,
}

impl PartialReader {
    pub fn new(content: Arc<PartialContent>, position: u64) -> Self {
        // subscribe before the first read so no insertion can slip between a
        // miss and the wait that follows it
        let changes = WatchStream::from_changes(content.changes.subscribe());
        let id = content.next_reader.fetch_add(1, Ordering::Relaxed);
        PartialReader { id, content, position, readahead: 0, changes }
    }

    pub fn position(&self) -> u64 {
        self.position
    }

    fn publish_wanted(&self) {
        let wanted = match self.readahead {
            0 => None,
            n => {
                let end = self.position.saturating_add(n as u64).min(self.content.length);
                (self.position < end).then_some(self.position..end)
            }
        };
        self.content.set_wanted(self.id, wanted);
    }
}

impl Drop for PartialReader {
    fn drop(&mut self) {
        self.content.set_wanted(self.id, None);
    }
}

impl AsyncRead for PartialReader {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if buf.remaining() == 0 {
            return Poll::Ready(Ok(()));
        }

        loop {
            match this.content.read_at(this.position, buf) {
                Slot::Copied(n) => {
                    this.position += n as u64;
                    this.publish_wanted();
                    return Poll::Ready(Ok(()));
                }
                Slot::End => return Poll::Ready(Ok(())),
                Slot::Removed => {
                    return Poll::Ready(Err(io::Error::new(io::ErrorKind::NotFound, PieceError::Removed)));
                }
                Slot::Missing => match this.changes.poll_next_unpin(cx) {
                    Poll::Pending => return Poll::Pending,
                    Poll::Ready(Some(_)) => continue,
                    Poll::Ready(None) => {
                        return Poll::Ready(Err(io::Error::new(io::ErrorKind::NotFound, PieceError::Removed)));
                    }
                },
            }
        }
    }
}

impl ContentReader for PartialReader {
    fn set_readahead(&mut self, bytes: usize) {
        self.readahead = bytes;
        self.publish_wanted();
    }
}
