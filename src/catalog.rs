//! The set of resources the server knows about, looked up by id.

use std::collections::HashMap;
use std::fmt;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, RwLock};

use async_trait::async_trait;
use serde::{Deserialize, Serialize, Serializer};
use tokio_util::sync::CancellationToken;
use walkdir::WalkDir;

use crate::{ContentHandle, Error, FileHandle, Result};

const ID_LEN: usize = 20;
const VERIFY_CHUNK: usize = 256 * 1024;

/// Hash-derived resource identifier, 40 lowercase hex characters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ResourceId([u8; ID_LEN]);

impl ResourceId {
    pub fn from_bytes(bytes: [u8; ID_LEN]) -> Self {
        ResourceId(bytes)
    }

    /// Derives an id from arbitrary data, e.g. a canonical path.
    pub fn digest(data: &[u8]) -> Self {
        let hash = blake3::hash(data);
        let mut id = [0u8; ID_LEN];
        id.copy_from_slice(&hash.as_bytes()[..ID_LEN]);
        ResourceId(id)
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl FromStr for ResourceId {
    type Err = hex::FromHexError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let mut id = [0u8; ID_LEN];
        hex::decode_to_slice(s, &mut id)?;
        Ok(ResourceId(id))
    }
}

impl Serialize for ResourceId {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FileInfo {
    pub name: String,
    pub path: String,
    pub size: u64,
    pub progress: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceInfo {
    pub id: ResourceId,
    pub name: String,
    pub progress: f64,
    pub size: u64,
    pub downloaded: u64,
    pub files: Vec<FileInfo>,
}

/// Body of a registration request.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AddResource {
    pub path: PathBuf,
}

/// Lookup and lifecycle of resources. Owns all shared state; the streaming
/// path only ever receives a [`ContentHandle`].
#[async_trait]
pub trait Catalog: Send + Sync {
    async fn list(&self) -> Vec<ResourceInfo>;

    /// Registers a resource once its name, size and file list are known.
    async fn add(&self, descriptor: &Path) -> Result<ResourceInfo>;

    async fn get(&self, id: &ResourceId) -> Result<ResourceInfo>;

    /// Forgets a resource and deletes what it materialized on disk. A
    /// [`Error::CleanupFailure`] means the resource is gone but its files
    /// were not fully deleted.
    async fn remove(&self, id: &ResourceId) -> Result<()>;

    /// Resolves one file of a resource to a handle for streaming.
    async fn file(&self, id: &ResourceId, path: &str) -> Result<Arc<dyn ContentHandle>>;
}

fn ratio(part: u64, whole: u64) -> f64 {
    if whole == 0 {
        1.0
    } else {
        part as f64 / whole as f64
    }
}

#[derive(Debug)]
struct LocalFile {
    name: String,
    path: String,
    location: PathBuf,
    size: u64,
    verified: AtomicU64,
    checksum: OnceLock<String>,
}

impl LocalFile {
    fn info(&self) -> FileInfo {
        let verified = self.verified.load(Ordering::Relaxed);
        FileInfo {
            name: self.name.clone(),
            path: self.path.clone(),
            size: self.size,
            progress: ratio(verified, self.size),
            checksum: self.checksum.get().cloned(),
        }
    }

    /// Hashes the bytes already on disk, publishing progress as it goes.
    fn verify(&self, cancel: &CancellationToken) -> Result<()> {
        self.hash(cancel).map_err(Error::SourceReadFailure)
    }

    fn hash(&self, cancel: &CancellationToken) -> io::Result<()> {
        let mut file = std::fs::File::open(&self.location)?;
        let mut hasher = blake3::Hasher::new();
        let mut buffer = vec![0u8; VERIFY_CHUNK];
        let mut verified = 0u64;
        while verified < self.size && !cancel.is_cancelled() {
            let n = file.read(&mut buffer)?;
            if n == 0 {
                break;
            }
            hasher.update(&buffer[..n]);
            verified = (verified + n as u64).min(self.size);
            self.verified.store(verified, Ordering::Relaxed);
        }
        if verified == self.size {
            let _ = self.checksum.set(hasher.finalize().to_hex().to_string());
        }
        Ok(())
    }
}

#[derive(Debug)]
struct LocalResource {
    id: ResourceId,
    name: String,
    root: PathBuf,
    files: Vec<LocalFile>,
    cancel: CancellationToken,
}

impl LocalResource {
    fn info(&self) -> ResourceInfo {
        let files: Vec<FileInfo> = self.files.iter().map(LocalFile::info).collect();
        let size = self.files.iter().map(|file| file.size).sum();
        let downloaded = self.files.iter().map(|file| file.verified.load(Ordering::Relaxed)).sum();
        ResourceInfo {
            id: self.id,
            name: self.name.clone(),
            progress: ratio(downloaded, size),
            size,
            downloaded,
            files,
        }
    }

    /// Walks `descriptor` (a file or a directory) and collects its files.
    fn scan(descriptor: &Path) -> io::Result<LocalResource> {
        let root = descriptor.canonicalize()?;
        let name = root
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "descriptor has no file name"))?;

        let mut files = Vec::new();
        for entry in WalkDir::new(&root).follow_links(true).sort_by_file_name() {
            let entry = entry.map_err(io::Error::from)?;
            if !entry.file_type().is_file() {
                continue;
            }
            // a single-file resource is addressed by its own name
            let relative = match entry.path().strip_prefix(&root) {
                Ok(relative) if !relative.as_os_str().is_empty() => relative,
                _ => Path::new(&name),
            };
            let path = relative
                .components()
                .map(|part| part.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");
            files.push(LocalFile {
                name: entry.file_name().to_string_lossy().into_owned(),
                path,
                location: entry.path().to_path_buf(),
                size: entry.metadata().map_err(io::Error::from)?.len(),
                verified: AtomicU64::new(0),
                checksum: OnceLock::new(),
            });
        }

        Ok(LocalResource {
            id: ResourceId::digest(root.as_os_str().as_encoded_bytes()),
            name,
            root,
            files,
            cancel: CancellationToken::new(),
        })
    }
}

/// A [`Catalog`] over files already present on the local filesystem.
///
/// Registration accepts a path to a file or a directory. Removal deletes the
/// resource's files only when they live inside the download directory.
#[derive(Debug)]
pub struct LocalCatalog {
    download_dir: PathBuf,
    resources: RwLock<HashMap<ResourceId, Arc<LocalResource>>>,
}

impl LocalCatalog {
    pub fn new(download_dir: impl Into<PathBuf>) -> Self {
        LocalCatalog {
            download_dir: download_dir.into(),
            resources: RwLock::new(HashMap::new()),
        }
    }

    /// Creates `download_dir` if it is missing and returns an empty catalog
    /// over it.
    pub async fn open(download_dir: impl Into<PathBuf>) -> io::Result<Self> {
        let download_dir = download_dir.into();
        tokio::fs::create_dir_all(&download_dir).await?;
        Ok(LocalCatalog::new(download_dir))
    }

    pub fn download_dir(&self) -> &Path {
        &self.download_dir
    }

    fn lookup(&self, id: &ResourceId) -> Result<Arc<LocalResource>> {
        self.resources
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(id)
            .cloned()
            .ok_or_else(|| Error::resource_not_found(id.to_string()))
    }

    fn spawn_verification(resource: Arc<LocalResource>) {
        tokio::task::spawn_blocking(move || {
            for file in &resource.files {
                if resource.cancel.is_cancelled() {
                    return;
                }
                if let Err(error) = file.verify(&resource.cancel) {
                    tracing::warn!(id = %resource.id, path = %file.path, %error, "verification failed");
                }
            }
            tracing::info!(id = %resource.id, name = %resource.name, "verification finished");
        });
    }
}

#[async_trait]
impl Catalog for LocalCatalog {
    async fn list(&self) -> Vec<ResourceInfo> {
        let resources = self.resources.read().unwrap_or_else(|poisoned| poisoned.into_inner());
        let mut infos: Vec<ResourceInfo> = resources.values().map(|resource| resource.info()).collect();
        infos.sort_by(|a, b| a.name.cmp(&b.name));
        infos
    }

    async fn add(&self, descriptor: &Path) -> Result<ResourceInfo> {
        let path = descriptor.to_path_buf();
        let scanned = {
            let path = path.clone();
            tokio::task::spawn_blocking(move || LocalResource::scan(&path))
                .await
                .map_err(io::Error::other)
        };
        let resource = scanned
            .and_then(|scan| scan)
            .map_err(|source| Error::InvalidDescriptor { path, source })?;

        let resource = {
            let mut resources = self.resources.write().unwrap_or_else(|poisoned| poisoned.into_inner());
            if let Some(existing) = resources.get(&resource.id) {
                return Ok(existing.info());
            }
            let resource = Arc::new(resource);
            resources.insert(resource.id, Arc::clone(&resource));
            resource
        };

        tracing::info!(
            id = %resource.id,
            name = %resource.name,
            files = resource.files.len(),
            "resource registered"
        );
        let info = resource.info();
        LocalCatalog::spawn_verification(resource);
        Ok(info)
    }

    async fn get(&self, id: &ResourceId) -> Result<ResourceInfo> {
        Ok(self.lookup(id)?.info())
    }

    async fn remove(&self, id: &ResourceId) -> Result<()> {
        let resource = self
            .resources
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(id)
            .ok_or_else(|| Error::resource_not_found(id.to_string()))?;
        resource.cancel.cancel();
        tracing::info!(id = %id, name = %resource.name, "resource removed");

        let owned = match self.download_dir.canonicalize() {
            Ok(dir) => resource.root.starts_with(&dir) && resource.root != dir,
            Err(_) => false,
        };
        if !owned {
            tracing::debug!(id = %id, root = %resource.root.display(), "data outside download directory, leaving it");
            return Ok(());
        }

        let cleanup = if resource.root.is_dir() {
            tokio::fs::remove_dir_all(&resource.root).await
        } else {
            tokio::fs::remove_file(&resource.root).await
        };
        match cleanup {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(Error::CleanupFailure { id: id.to_string(), source }),
        }
    }

    async fn file(&self, id: &ResourceId, path: &str) -> Result<Arc<dyn ContentHandle>> {
        let resource = self.lookup(id)?;
        let file = resource
            .files
            .iter()
            .find(|file| file.path == path)
            .ok_or_else(|| Error::file_not_found(path))?;
        match tokio::fs::metadata(&file.location).await {
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Err(Error::file_not_found(path)),
            Err(e) => return Err(Error::SourceReadFailure(e)),
        }
        Ok(Arc::new(FileHandle::sized(file.path.clone(), file.location.clone(), file.size)))
    }
}
