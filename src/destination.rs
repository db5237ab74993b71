use crate::error::{EngineError, Result};
use async_trait::async_trait;
use std::path::PathBuf;
use tokio::fs;
use tokio::io::{AsyncRead, AsyncWrite};

pub type DestinationWriter = Box<dyn AsyncWrite + Send + Unpin>;
pub type DestinationReader = Box<dyn AsyncRead + Send + Unpin>;

/// Byte-stream destination for backup artifacts.
#[async_trait]
pub trait Destination: Send + Sync {
    /// Open a writer at `path`, creating intermediate directories.
    async fn open_write(&self, path: &str) -> Result<DestinationWriter>;

    async fn open_read(&self, path: &str) -> Result<DestinationReader>;

    async fn delete(&self, path: &str) -> Result<()>;

    async fn size(&self, path: &str) -> Result<u64>;
}

/// Local filesystem destination rooted at a base directory.
#[derive(Debug, Clone)]
pub struct FilesystemDestination {
    base_path: PathBuf,
}

impl FilesystemDestination {
    pub fn new(base_path: PathBuf) -> Self {
        Self { base_path }
    }

    /// Convert an artifact path to a filesystem path, normalized to prevent
    /// traversal outside the base.
    fn resolve(&self, path: &str) -> PathBuf {
        let normalized = path.trim_start_matches('/');
        self.base_path.join(normalized)
    }
}

#[async_trait]
impl Destination for FilesystemDestination {
    async fn open_write(&self, path: &str) -> Result<DestinationWriter> {
        let full = self.resolve(path);
        if let Some(parent) = full.parent() {
            fs::create_dir_all(parent).await.map_err(|e| {
                EngineError::DestinationWrite(format!(
                    "failed to create directories for {}: {}",
                    full.display(),
                    e
                ))
            })?;
        }
        let file = fs::File::create(&full).await.map_err(|e| {
            EngineError::DestinationWrite(format!("failed to create {}: {}", full.display(), e))
        })?;
        Ok(Box::new(file))
    }

    async fn open_read(&self, path: &str) -> Result<DestinationReader> {
        let full = self.resolve(path);
        let file = fs::File::open(&full).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                EngineError::NotFound(path.to_string())
            } else {
                EngineError::DestinationWrite(format!("failed to open {}: {}", full.display(), e))
            }
        })?;
        Ok(Box::new(file))
    }

    async fn delete(&self, path: &str) -> Result<()> {
        let full = self.resolve(path);
        fs::remove_file(&full).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                EngineError::NotFound(path.to_string())
            } else {
                EngineError::DestinationWrite(format!("failed to delete {}: {}", full.display(), e))
            }
        })
    }

    async fn size(&self, path: &str) -> Result<u64> {
        let full = self.resolve(path);
        let meta = fs::metadata(&full).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                EngineError::NotFound(path.to_string())
            } else {
                EngineError::DestinationWrite(format!("failed to stat {}: {}", full.display(), e))
            }
        })?;
        Ok(meta.len())
    }
}
