//! Blob sink for processed payloads.
//!
//! Writes are keyed and overwrite: writing the same key twice leaves one
//! object holding the last bytes written, which is what makes redelivered
//! messages safe to process again.

use async_trait::async_trait;
use std::io;
use std::path::{Component, Path, PathBuf};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;

/// Error type for blob sink operations.
#[derive(Debug, Error)]
pub enum SinkError {
    #[error("invalid blob key {0:?}")]
    InvalidKey(String),

    #[error("blob store I/O failed for {key}: {source}")]
    Io {
        key: String,
        #[source]
        source: io::Error,
    },

    #[error("blob store unavailable: {0}")]
    Unavailable(String),
}

/// Keyed object store with overwrite semantics.
#[async_trait]
pub trait BlobSink: Send + Sync {
    /// Store `bytes` under `key`, replacing any existing object.
    async fn put(&self, key: &str, bytes: &[u8]) -> Result<(), SinkError>;

    /// Fetch the object stored under `key`.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, SinkError>;
}

/// Blob sink rooted at a local directory (the "bucket").
///
/// Objects are written to a temporary sibling and renamed into place, so a
/// reader never observes a partially written object.
#[derive(Debug, Clone)]
pub struct FsBlobSink {
    root: PathBuf,
}

impl FsBlobSink {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Keys of all objects under `prefix`, sorted.
    pub async fn list(&self, prefix: &str) -> Result<Vec<String>, SinkError> {
        let dir = self.path_for(prefix)?;
        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => {
                return Err(SinkError::Io {
                    key: prefix.to_string(),
                    source,
                })
            }
        };

        let mut keys = Vec::new();
        let io_err = |source| SinkError::Io {
            key: prefix.to_string(),
            source,
        };
        while let Some(entry) = entries.next_entry().await.map_err(io_err)? {
            let name = entry.file_name().to_string_lossy().into_owned();
            // In-progress temp files
            if name.starts_with('.') {
                continue;
            }
            if entry.file_type().await.map_err(io_err)?.is_file() {
                keys.push(format!("{}/{name}", prefix.trim_end_matches('/')));
            }
        }
        keys.sort();
        Ok(keys)
    }

    fn path_for(&self, key: &str) -> Result<PathBuf, SinkError> {
        validate_key(key)?;
        Ok(self.root.join(key))
    }
}

#[async_trait]
impl BlobSink for FsBlobSink {
    #[tracing::instrument(skip(self, bytes), fields(bytes = bytes.len()))]
    async fn put(&self, key: &str, bytes: &[u8]) -> Result<(), SinkError> {
        let path = self.path_for(key)?;
        let io_err = |source| SinkError::Io {
            key: key.to_string(),
            source,
        };

        let parent = path.parent().unwrap_or(&self.root);
        fs::create_dir_all(parent).await.map_err(io_err)?;

        let file_name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .ok_or_else(|| SinkError::InvalidKey(key.to_string()))?;
        let temp_path = parent.join(format!(".{file_name}.{}.tmp", uuid::Uuid::new_v4()));

        let written = async {
            let mut file = fs::File::create(&temp_path).await?;
            file.write_all(bytes).await?;
            file.sync_all().await?;
            fs::rename(&temp_path, &path).await
        }
        .await;

        if let Err(source) = written {
            let _ = fs::remove_file(&temp_path).await;
            return Err(io_err(source));
        }

        tracing::trace!(path = %path.display(), "Blob written");
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, SinkError> {
        let path = self.path_for(key)?;
        match fs::read(&path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(source) => Err(SinkError::Io {
                key: key.to_string(),
                source,
            }),
        }
    }
}

/// Keys are relative slash-separated paths without `.` or `..` segments.
fn validate_key(key: &str) -> Result<(), SinkError> {
    let invalid = || SinkError::InvalidKey(key.to_string());
    if key.is_empty() || key.starts_with('/') || key.contains('\\') {
        return Err(invalid());
    }
    for component in Path::new(key).components() {
        match component {
            Component::Normal(part) if !part.to_string_lossy().starts_with('.') => {}
            _ => return Err(invalid()),
        }
    }
    Ok(())
}

/// Object key for a processed delivery.
pub fn processed_key(delivery_id: &str) -> String {
    format!("processed/{delivery_id}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_put_then_get() {
        let dir = TempDir::new().unwrap();
        let sink = FsBlobSink::new(dir.path());

        sink.put("processed/abc", b"{\"a\":1}").await.unwrap();
        assert_eq!(
            sink.get("processed/abc").await.unwrap().as_deref(),
            Some(&b"{\"a\":1}"[..])
        );
        assert_eq!(sink.get("processed/missing").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_put_overwrites_single_object() {
        let dir = TempDir::new().unwrap();
        let sink = FsBlobSink::new(dir.path());

        sink.put("processed/abc", b"first").await.unwrap();
        sink.put("processed/abc", b"second").await.unwrap();

        assert_eq!(sink.list("processed").await.unwrap(), vec!["processed/abc"]);
        assert_eq!(
            sink.get("processed/abc").await.unwrap().as_deref(),
            Some(&b"second"[..])
        );
    }

    #[tokio::test]
    async fn test_list_missing_prefix_is_empty() {
        let dir = TempDir::new().unwrap();
        let sink = FsBlobSink::new(dir.path());
        assert!(sink.list("processed").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_rejects_escaping_keys() {
        let dir = TempDir::new().unwrap();
        let sink = FsBlobSink::new(dir.path());

        let rejected = [
            "",
            "/etc/passwd",
            "../outside",
            "processed/../../x",
            "a\\b",
            "processed/.hidden",
        ];
        for key in rejected {
            assert!(
                matches!(sink.put(key, b"x").await, Err(SinkError::InvalidKey(_))),
                "{key:?} should be rejected"
            );
        }
    }

    #[test]
    fn test_processed_key() {
        assert_eq!(processed_key("d-1"), "processed/d-1");
    }
}
