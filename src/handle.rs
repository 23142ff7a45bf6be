use std::io;
use std::path::Path;

use async_trait::async_trait;
use tokio::io::AsyncRead;

const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

const CONTENT_TYPES: &[(&str, &str)] = &[
    ("mp4", "video/mp4"),
    ("mkv", "video/x-matroska"),
    ("mp3", "audio/mpeg"),
    ("wav", "audio/wav"),
];

/// A byte-addressable resource with a fixed declared length.
///
/// The length is the final size of the resource and does not change while
/// bytes are still being materialized. Readers opened on a handle may
/// therefore suspend until the bytes they need become available.
#[async_trait]
pub trait ContentHandle: Send + Sync {
    /// Name used to pick a content type, usually the file path.
    fn name(&self) -> &str;

    /// The total size of the underlying resource.
    fn length(&self) -> u64;

    /// Opens a sequential reader positioned at `offset`.
    async fn open_reader_at(&self, offset: u64) -> io::Result<Box<dyn ContentReader>>;

    fn content_type(&self) -> &'static str {
        content_type_for(self.name())
    }
}

/// Sequential reader over a [`ContentHandle`].
pub trait ContentReader: AsyncRead + Send + Unpin {
    /// Advisory prefetch distance past the current read position.
    fn set_readahead(&mut self, _bytes: usize) {}
}

impl ContentReader for tokio::fs::File {}

/// Maps a file name to a content type by its extension, ignoring case.
pub fn content_type_for(name: &str) -> &'static str {
    let extension = Path::new(name)
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.to_ascii_lowercase());

    extension
        .and_then(|ext| {
            CONTENT_TYPES
                .iter()
                .find(|(known, _)| *known == ext)
                .map(|(_, content_type)| *content_type)
        })
        .unwrap_or(DEFAULT_CONTENT_TYPE)
}
