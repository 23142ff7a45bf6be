use std::io;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::fs::File;
use tokio::io::AsyncSeekExt;

use crate::{ContentHandle, ContentReader};

/// Implements [`ContentHandle`] for a file on the local filesystem.
///
/// Each reader opens its own file descriptor, so concurrent requests never
/// share a cursor.
pub struct FileHandle {
    name: String,
    path: PathBuf,
    byte_size: u64,
}

impl std::fmt::Debug for FileHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileHandle")
            .field("path", &self.path)
            .field("byte_size", &self.byte_size)
            .finish()
    }
}

impl FileHandle {
    /// Calls [`tokio::fs::metadata`] to determine file size.
    pub async fn open(path: impl Into<PathBuf>) -> io::Result<FileHandle> {
        let path = path.into();
        let byte_size = tokio::fs::metadata(&path).await?.len();
        let name = path.to_string_lossy().into_owned();
        Ok(FileHandle { name, path, byte_size })
    }

    /// Construct a [`FileHandle`] with a byte size supplied manually.
    ///
    /// The file may be shorter than `byte_size` while it is still being
    /// written; readers then see end of file early.
    pub fn sized(name: impl Into<String>, path: impl Into<PathBuf>, byte_size: u64) -> Self {
        FileHandle { name: name.into(), path: path.into(), byte_size }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl ContentHandle for FileHandle {
    fn name(&self) -> &str {
        &self.name
    }

    fn length(&self) -> u64 {
        self.byte_size
    }

    async fn open_reader_at(&self, offset: u64) -> io::Result<Box<dyn ContentReader>> {
        let mut file = File::open(&self.path).await?;
        file.seek(io::SeekFrom::Start(offset)).await?;
        Ok(Box::new(file))
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::AsyncReadExt;

    use crate::ContentHandle;

    use super::FileHandle;

    #[tokio::test]
    async fn test_file_size() {
        let handle = FileHandle::open("test/fixture.txt").await.unwrap();
        assert_eq!(54, handle.length());
        assert_eq!("application/octet-stream", handle.content_type());
    }

    #[tokio::test]
    async fn test_reader_starts_at_offset() {
        let handle = FileHandle::open("test/fixture.txt").await.unwrap();
        let mut reader = handle.open_reader_at(30).await.unwrap();
        let mut rest = String::new();
        reader.read_to_string(&mut rest).await.unwrap();
        assert_eq!("test range requests on!\n", rest);
    }

    #[tokio::test]
    async fn test_sized_keeps_declared_length() {
        let handle = FileHandle::sized("movie.mp4", "test/fixture.txt", 1000);
        assert_eq!(1000, handle.length());
        assert_eq!("video/mp4", handle.content_type());
    }

    #[tokio::test]
    async fn test_missing_file() {
        assert!(FileHandle::open("test/does-not-exist.bin").await.is_err());
        let handle = FileHandle::sized("gone.bin", "test/does-not-exist.bin", 10);
        assert!(handle.open_reader_at(0).await.is_err());
    }
}
