//! Sharded local filesystem artifact back-end.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::Utc;
use tokio::io::AsyncWriteExt;

use crate::artifact::{sha256_hex, shard_path, ArtifactError, ArtifactKind, ArtifactRef, ArtifactStore, Result};

pub struct FileArtifactStore {
    root: PathBuf,
}

impl FileArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn object_path(&self, hash: &str) -> PathBuf {
        self.root.join(shard_path(hash))
    }
}

#[async_trait]
impl ArtifactStore for FileArtifactStore {
    async fn put(&self, bytes: &[u8], _kind: ArtifactKind) -> Result<ArtifactRef> {
        let hash = sha256_hex(bytes);
        let path = self.object_path(&hash);

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        if !path.exists() {
            write_atomically(&path, bytes).await?;
        }

        Ok(ArtifactRef {
            hash: hash.clone(),
            uri: format!("file://{}", path.display()),
            size: bytes.len() as u64,
            created_at: Utc::now(),
        })
    }

    async fn get(&self, hash: &str) -> Result<Vec<u8>> {
        let path = self.object_path(hash);
        tokio::fs::read(&path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ArtifactError::NotFound { hash: hash.to_owned() }
            } else {
                ArtifactError::Io(e)
            }
        })
    }

    async fn exists(&self, hash: &str) -> Result<bool> {
        Ok(self.object_path(hash).exists())
    }
}

/// Write to a sibling temp file and rename, so a crash mid-write never
/// leaves a partial object visible under its final path.
async fn write_atomically(path: &Path, bytes: &[u8]) -> Result<()> {
    let tmp_path = path.with_extension(format!("tmp-{}", uuid::Uuid::new_v4()));
    let mut file = tokio::fs::File::create(&tmp_path).await?;
    file.write_all(bytes).await?;
    file.sync_all().await?;
    drop(file);
    tokio::fs::rename(&tmp_path, path).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn put_then_get_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileArtifactStore::new(dir.path());
        let reference = store.put(b"hello artifact", ArtifactKind::Log).await.unwrap();
        assert_eq!(store.get(&reference.hash).await.unwrap(), b"hello artifact");
        assert!(store.exists(&reference.hash).await.unwrap());
    }

    #[tokio::test]
    async fn put_is_deduplicated() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileArtifactStore::new(dir.path());
        let a = store.put(b"same bytes", ArtifactKind::Diff).await.unwrap();
        let b = store.put(b"same bytes", ArtifactKind::Diff).await.unwrap();
        assert_eq!(a.hash, b.hash);
        assert_eq!(a.uri, b.uri);
    }

    #[tokio::test]
    async fn objects_are_sharded_by_hash_prefix() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileArtifactStore::new(dir.path());
        let reference = store.put(b"shard me", ArtifactKind::Patch).await.unwrap();
        let expected = dir.path().join(shard_path(&reference.hash));
        assert!(expected.exists());
    }

    #[tokio::test]
    async fn get_on_unknown_hash_returns_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileArtifactStore::new(dir.path());
        let err = store.get(&"0".repeat(64)).await.unwrap_err();
        assert!(matches!(err, ArtifactError::NotFound { .. }));
    }
}
