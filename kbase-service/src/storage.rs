//! Blob storage for uploaded file bytes.
//!
//! Keys are chosen by the caller and are opaque to the store. The filesystem
//! implementation maps `{bucket}/{key}` under a root directory.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::stream::{self, BoxStream, StreamExt};
use std::path::{Component, Path, PathBuf};
use tokio_util::io::ReaderStream;
use tracing::debug;

use crate::error::StorageError;

/// Streamed object contents
pub type BlobStream = BoxStream<'static, std::io::Result<Bytes>>;

/// Blob store client
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Store `data` under a new `key`
    ///
    /// Fails with [`StorageError::AlreadyExists`] if an object is already
    /// stored there; existing objects are never replaced.
    async fn put(&self, key: &str, data: Bytes, content_type: &str) -> Result<(), StorageError>;

    /// Read a whole object
    async fn get(&self, key: &str) -> Result<Bytes, StorageError>;

    /// Open an object as a byte stream
    async fn get_stream(&self, key: &str) -> Result<BlobStream, StorageError> {
        let data = self.get(key).await?;
        Ok(stream::once(async move { Ok(data) }).boxed())
    }

    /// Remove an object. Removing a missing object is not an error.
    async fn delete(&self, key: &str) -> Result<(), StorageError>;
}

/// Build the object key for a new upload:
/// `documents/{kb_id}/{unix_millis}_{filename}`.
///
/// Only the final path component of `filename` is used.
pub fn object_key(kb_id: &str, uploaded_at: DateTime<Utc>, filename: &str) -> String {
    let name = Path::new(filename)
        .file_name()
        .and_then(|n| n.to_str())
        .filter(|n| !n.is_empty())
        .unwrap_or("document");

    format!(
        "documents/{}/{}_{}",
        kb_id,
        uploaded_at.timestamp_millis(),
        name
    )
}

/// Filesystem-backed blob store
pub struct FsBlobStore {
    root: PathBuf,
}

impl FsBlobStore {
    pub fn new(root: impl Into<PathBuf>, bucket: &str) -> Self {
        Self {
            root: root.into().join(bucket),
        }
    }

    fn path_for(&self, key: &str) -> Result<PathBuf, StorageError> {
        let relative = Path::new(key);
        let valid = !key.is_empty()
            && relative
                .components()
                .all(|c| matches!(c, Component::Normal(_)));
        if !valid {
            return Err(StorageError::InvalidKey {
                key: key.to_string(),
            });
        }
        Ok(self.root.join(relative))
    }
}

fn io_error(key: &str, source: std::io::Error) -> StorageError {
    if source.kind() == std::io::ErrorKind::NotFound {
        StorageError::NotFound {
            key: key.to_string(),
        }
    } else {
        StorageError::Io {
            key: key.to_string(),
            source,
        }
    }
}

#[async_trait]
impl BlobStore for FsBlobStore {
    async fn put(&self, key: &str, data: Bytes, content_type: &str) -> Result<(), StorageError> {
        let path = self.path_for(key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| io_error(key, e))?;
        }

        // Write to a private temp file, then link it into place. The link
        // fails if the key is taken, so a put never replaces an object and
        // readers never see a partial one.
        let mut tmp = path.clone().into_os_string();
        tmp.push(format!(".{}.partial", uuid::Uuid::new_v4()));
        let tmp = PathBuf::from(tmp);
        tokio::fs::write(&tmp, &data)
            .await
            .map_err(|e| io_error(key, e))?;

        let linked = tokio::fs::hard_link(&tmp, &path).await;
        if let Err(e) = tokio::fs::remove_file(&tmp).await {
            debug!(path = %tmp.display(), error = %e, "Failed to remove temp file");
        }
        match linked {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                return Err(StorageError::AlreadyExists {
                    key: key.to_string(),
                });
            }
            Err(e) => return Err(io_error(key, e)),
        }

        debug!(key = %key, size = data.len(), content_type = %content_type, "Stored blob");
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Bytes, StorageError> {
        let path = self.path_for(key)?;
        let data = tokio::fs::read(&path).await.map_err(|e| io_error(key, e))?;
        Ok(Bytes::from(data))
    }

    async fn get_stream(&self, key: &str) -> Result<BlobStream, StorageError> {
        let path = self.path_for(key)?;
        let file = tokio::fs::File::open(&path)
            .await
            .map_err(|e| io_error(key, e))?;
        Ok(ReaderStream::new(file).boxed())
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        let path = self.path_for(key)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(io_error(key, e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use futures::TryStreamExt;

    #[test]
    fn test_object_key_format() {
        let at = Utc.with_ymd_and_hms(2024, 3, 5, 14, 7, 9).unwrap();
        assert_eq!(
            object_key("kb-1", at, "notes.txt"),
            "documents/kb-1/1709647629000_notes.txt"
        );
        assert_eq!(
            object_key("kb-1", at, "../../etc/passwd"),
            "documents/kb-1/1709647629000_passwd"
        );
    }

    #[tokio::test]
    async fn test_put_get_delete() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsBlobStore::new(dir.path(), "bucket");
        let key = "documents/kb-1/1_a.txt";

        store
            .put(key, Bytes::from_static(b"hello"), "text/plain")
            .await
            .unwrap();
        assert_eq!(store.get(key).await.unwrap(), Bytes::from_static(b"hello"));

        let streamed: Vec<Bytes> = store.get_stream(key).await.unwrap().try_collect().await.unwrap();
        assert_eq!(streamed.concat(), b"hello");

        store.delete(key).await.unwrap();
        assert!(matches!(
            store.get(key).await,
            Err(StorageError::NotFound { .. })
        ));
        // Deleting twice is fine
        store.delete(key).await.unwrap();
    }

    #[tokio::test]
    async fn test_put_never_replaces_an_object() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsBlobStore::new(dir.path(), "bucket");
        let key = "documents/kb-1/1_a.txt";

        store
            .put(key, Bytes::from_static(b"first"), "text/plain")
            .await
            .unwrap();
        let err = store
            .put(key, Bytes::from_static(b"second"), "text/plain")
            .await
            .unwrap_err();

        assert!(matches!(err, StorageError::AlreadyExists { .. }));
        assert_eq!(store.get(key).await.unwrap(), Bytes::from_static(b"first"));

        let leftovers: Vec<_> = std::fs::read_dir(dir.path().join("bucket/documents/kb-1"))
            .unwrap()
            .map(|entry| entry.unwrap().file_name())
            .collect();
        assert_eq!(leftovers, vec![std::ffi::OsString::from("1_a.txt")]);
    }

    #[tokio::test]
    async fn test_rejects_escaping_keys() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsBlobStore::new(dir.path(), "bucket");

        for key in ["../outside", "/etc/passwd", "", "documents/../../x"] {
            assert!(matches!(
                store.get(key).await,
                Err(StorageError::InvalidKey { .. })
            ));
        }
    }
}
