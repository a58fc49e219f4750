//! External content storage.
//!
//! Content bytes live outside the transactional store and are referenced by
//! key from the entity row. [`FsContentStore`] keeps them in a directory;
//! other backends implement [`ContentStore`].

use std::io::Write;
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};

/// Errors raised by a content store.
#[derive(Debug, thiserror::Error)]
pub enum ContentError {
    #[error("invalid content key: {0}")]
    InvalidKey(String),

    #[error("content not found: {0}")]
    NotFound(String),

    #[error("content store i/o error for '{key}': {source}")]
    Io {
        key: String,
        #[source]
        source: std::io::Error,
    },
}

/// Result of a completed content write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentRef {
    pub key: String,
    pub size: i64,
    /// Hex-encoded SHA-256 of the stored bytes.
    pub digest: String,
}

/// Blob storage addressed by key.
///
/// `put` returns only after the bytes are durably stored; a returned
/// [`ContentRef`] is safe to commit.
pub trait ContentStore: Send + Sync + 'static {
    fn put(&self, key: &str, bytes: &[u8]) -> Result<ContentRef, ContentError>;
    fn get(&self, key: &str) -> Result<Vec<u8>, ContentError>;
}

/// Filesystem-backed content store rooted at a directory.
#[derive(Debug, Clone)]
pub struct FsContentStore {
    root: PathBuf,
}

impl FsContentStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &str) -> Result<PathBuf, ContentError> {
        let valid_segment = |s: &str| {
            !s.is_empty()
                && s != "."
                && s != ".."
                && s.chars()
                    .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
        };
        if key.is_empty() || !key.split('/').all(valid_segment) {
            return Err(ContentError::InvalidKey(key.to_string()));
        }
        Ok(self.root.join(key))
    }
}

impl ContentStore for FsContentStore {
    fn put(&self, key: &str, bytes: &[u8]) -> Result<ContentRef, ContentError> {
        let path = self.path_for(key)?;
        let io_err = |source| ContentError::Io {
            key: key.to_string(),
            source,
        };

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(io_err)?;
        }

        // Write to a sibling temp file and rename so readers never observe a
        // partial object.
        let tmp = path.with_extension("partial");
        {
            let mut file = std::fs::File::create(&tmp).map_err(io_err)?;
            file.write_all(bytes).map_err(io_err)?;
            file.sync_all().map_err(io_err)?;
        }
        std::fs::rename(&tmp, &path).map_err(io_err)?;

        let digest = hex::encode(Sha256::digest(bytes));
        tracing::debug!(key, size = bytes.len(), "stored content");

        Ok(ContentRef {
            key: key.to_string(),
            size: bytes.len() as i64,
            digest,
        })
    }

    fn get(&self, key: &str) -> Result<Vec<u8>, ContentError> {
        let path = self.path_for(key)?;
        std::fs::read(&path).map_err(|source| {
            if source.kind() == std::io::ErrorKind::NotFound {
                ContentError::NotFound(key.to_string())
            } else {
                ContentError::Io {
                    key: key.to_string(),
                    source,
                }
            }
        })
    }
}
