use std::io;
use std::path::{Component, Path, PathBuf};
use std::pin::Pin;

use async_trait::async_trait;
use tokio::io::AsyncRead;

pub struct StoredFile {
    pub len: u64,
    pub reader: Pin<Box<dyn AsyncRead + Send>>,
}

/// Where ebook binaries live. Paths come from ebook records, never from clients.
#[async_trait]
pub trait FileStorage: Send + Sync {
    async fn exists(&self, path: &str) -> bool;

    async fn open(&self, path: &str) -> io::Result<StoredFile>;
}

pub struct LocalFileStorage {
    root: PathBuf,
}

impl LocalFileStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Joins `path` under the root. A leading `/` is treated as root-relative;
    /// anything that would climb out of the root resolves to nothing.
    fn resolve(&self, path: &str) -> Option<PathBuf> {
        let relative = Path::new(path.trim_start_matches('/'));
        let mut resolved = self.root.clone();
        for component in relative.components() {
            match component {
                Component::Normal(part) => resolved.push(part),
                Component::CurDir => {}
                Component::ParentDir | Component::RootDir | Component::Prefix(_) => return None,
            }
        }
        (resolved != self.root).then_some(resolved)
    }
}

#[async_trait]
impl FileStorage for LocalFileStorage {
    async fn exists(&self, path: &str) -> bool {
        let Some(resolved) = self.resolve(path) else {
            return false;
        };
        tokio::fs::metadata(&resolved)
            .await
            .map(|meta| meta.is_file())
            .unwrap_or(false)
    }

    async fn open(&self, path: &str) -> io::Result<StoredFile> {
        let resolved = self.resolve(path).ok_or_else(|| {
            io::Error::new(io::ErrorKind::NotFound, "path escapes storage root")
        })?;
        let file = tokio::fs::File::open(&resolved).await?;
        let len = file.metadata().await?.len();
        Ok(StoredFile {
            len,
            reader: Box::pin(file),
        })
    }
}
