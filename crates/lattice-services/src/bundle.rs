//! Zip-backed in-memory filesystems for the static asset bundles.
//!
//! The hub serves two bundles (lib and assets) over plain HTTP. Each is a
//! single zip file on disk, expanded into memory at load; a POST replaces
//! the file and rebuilds the whole filesystem atomically under the guard.

use std::collections::HashMap;
use std::io::{Cursor, Read};
use std::path::PathBuf;

use bytes::Bytes;
use tokio::sync::RwLock;

#[derive(Debug, thiserror::Error)]
pub enum BundleError {
    #[error("bundle io: {0}")]
    Io(#[from] std::io::Error),
    #[error("bundle archive: {0}")]
    Archive(#[from] zip::result::ZipError),
}

struct Bundle {
    /// The zip exactly as uploaded, for whole-bundle downloads.
    raw: Bytes,
    files: HashMap<String, Vec<u8>>,
}

pub struct BundleFs {
    path: PathBuf,
    inner: RwLock<Option<Bundle>>,
}

impl BundleFs {
    /// An empty filesystem backed by the given zip path. Nothing is served
    /// until `load` or `replace` succeeds.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            inner: RwLock::new(None),
        }
    }

    /// (Re)build the filesystem from the zip on disk.
    pub async fn load(&self) -> Result<(), BundleError> {
        let raw = std::fs::read(&self.path)?;
        let bundle = build(raw)?;
        tracing::info!(
            path = %self.path.display(),
            files = bundle.files.len(),
            "bundle filesystem loaded"
        );
        *self.inner.write().await = Some(bundle);
        Ok(())
    }

    /// Replace the zip bytes on disk and rebuild. The write is tmp+rename
    /// so a crash never leaves a torn file.
    pub async fn replace(&self, raw: Vec<u8>) -> Result<(), BundleError> {
        let bundle = build(raw.clone())?;

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let tmp = self.path.with_extension("tmp");
        std::fs::write(&tmp, &raw)?;
        std::fs::rename(&tmp, &self.path)?;

        tracing::info!(
            path = %self.path.display(),
            bytes = raw.len(),
            files = bundle.files.len(),
            "bundle replaced"
        );
        *self.inner.write().await = Some(bundle);
        Ok(())
    }

    /// Look up one file. Leading slashes in the request path are ignored.
    pub async fn file(&self, path: &str) -> Option<Vec<u8>> {
        let inner = self.inner.read().await;
        inner
            .as_ref()?
            .files
            .get(path.trim_start_matches('/'))
            .cloned()
    }

    /// The raw zip, if a bundle is loaded.
    pub async fn raw(&self) -> Option<Bytes> {
        self.inner.read().await.as_ref().map(|b| b.raw.clone())
    }
}

fn build(raw: Vec<u8>) -> Result<Bundle, BundleError> {
    let mut archive = zip::ZipArchive::new(Cursor::new(&raw))?;
    let mut files = HashMap::new();
    for index in 0..archive.len() {
        let mut entry = archive.by_index(index)?;
        if !entry.is_file() {
            continue;
        }
        let mut contents = Vec::with_capacity(entry.size() as usize);
        entry.read_to_end(&mut contents)?;
        files.insert(entry.name().to_string(), contents);
    }
    Ok(Bundle {
        raw: Bytes::from(raw),
        files,
    })
}
