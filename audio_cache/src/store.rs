//! Filesystem-backed artifact store.
//!
//! Artifacts live in one flat directory as `<fingerprint>.mp3`. Content
//! is a pure function of the fingerprint, so concurrent writers for the
//! same id produce byte-identical files (a benign race, no locking).

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use thiserror::Error;
use tokio::fs;
use tracing::debug;

use crate::fingerprint::Fingerprint;

const ARTIFACT_EXT: &str = "mp3";

/// Storage failures. `NotFound` is a distinct, recoverable outcome; any
/// other I/O error surfaces to the caller rather than being swallowed.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("artifact not found: {0}")]
    NotFound(Fingerprint),

    #[error("storage error: {0}")]
    Io(#[from] std::io::Error),
}

/// Listing entry used for size accounting and eviction planning.
#[derive(Debug, Clone)]
pub struct ArtifactMeta {
    pub id: Fingerprint,
    pub size_bytes: u64,
    pub modified: SystemTime,
}

#[derive(Debug, Clone)]
pub struct ArtifactStore {
    dir: PathBuf,
}

impl ArtifactStore {
    /// Open the store rooted at `dir`, creating the directory if needed.
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let dir = dir.into();
        fs::create_dir_all(&dir).await?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn artifact_path(&self, id: &Fingerprint) -> PathBuf {
        self.dir.join(format!("{id}.{ARTIFACT_EXT}"))
    }

    pub async fn has(&self, id: &Fingerprint) -> Result<bool, StoreError> {
        Ok(fs::try_exists(self.artifact_path(id)).await?)
    }

    /// Read the full payload for `id`.
    pub async fn read(&self, id: &Fingerprint) -> Result<Vec<u8>, StoreError> {
        match fs::read(self.artifact_path(id)).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == ErrorKind::NotFound => Err(StoreError::NotFound(id.clone())),
            Err(e) => Err(e.into()),
        }
    }

    /// Write the payload for `id`. Overwriting is allowed; the system
    /// never intentionally overwrites because content is derived from
    /// the key.
    pub async fn write(&self, id: &Fingerprint, bytes: &[u8]) -> Result<(), StoreError> {
        fs::write(self.artifact_path(id), bytes).await?;
        debug!(%id, bytes = bytes.len(), "artifact written");
        Ok(())
    }

    /// Delete the artifact for `id`. Deleting a missing id is not an error.
    pub async fn delete(&self, id: &Fingerprint) -> Result<(), StoreError> {
        match fs::remove_file(self.artifact_path(id)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Remove every artifact, returning how many were deleted.
    pub async fn delete_all(&self) -> Result<u64, StoreError> {
        let mut deleted = 0u64;
        for meta in self.list_all().await? {
            self.delete(&meta.id).await?;
            deleted += 1;
        }
        debug!(deleted, "artifact store cleared");
        Ok(deleted)
    }

    /// Enumerate current artifacts with size and modification time.
    ///
    /// Re-listing reflects the directory as it is now, not a snapshot.
    /// Files that do not look like artifacts are skipped.
    pub async fn list_all(&self) -> Result<Vec<ArtifactMeta>, StoreError> {
        let mut out = Vec::new();
        let mut entries = fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(ARTIFACT_EXT) {
                continue;
            }
            let Some(id) = path
                .file_stem()
                .and_then(|s| s.to_str())
                .and_then(Fingerprint::from_hex)
            else {
                continue;
            };
            let meta = entry.metadata().await?;
            if !meta.is_file() {
                continue;
            }
            out.push(ArtifactMeta {
                id,
                size_bytes: meta.len(),
                modified: meta.modified()?,
            });
        }
        Ok(out)
    }

    /// Total size and file count, for the cache status surface.
    pub async fn usage(&self) -> Result<(u64, u64), StoreError> {
        let listing = self.list_all().await?;
        let total = listing.iter().map(|m| m.size_bytes).sum();
        Ok((listing.len() as u64, total))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn test_store() -> (ArtifactStore, TempDir) {
        let dir = TempDir::new().unwrap();
        let store = ArtifactStore::open(dir.path().join("audio-cache"))
            .await
            .unwrap();
        (store, dir)
    }

    fn fp(text: &str) -> Fingerprint {
        Fingerprint::derive(text, "alloy", "openai")
    }

    #[tokio::test]
    async fn write_then_read_round_trips() {
        let (store, _dir) = test_store().await;
        let id = fp("round trip");
        let payload: Vec<u8> = (0..128_000u32).map(|i| (i % 251) as u8).collect();

        store.write(&id, &payload).await.unwrap();
        assert!(store.has(&id).await.unwrap());
        assert_eq!(store.read(&id).await.unwrap(), payload);
    }

    #[tokio::test]
    async fn read_missing_is_not_found() {
        let (store, _dir) = test_store().await;
        match store.read(&fp("missing")).await {
            Err(StoreError::NotFound(_)) => {}
            other => panic!("expected NotFound, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn delete_is_idempotent() {
        let (store, _dir) = test_store().await;
        let id = fp("delete me");
        store.write(&id, b"bytes").await.unwrap();

        store.delete(&id).await.unwrap();
        store.delete(&id).await.unwrap();
        assert!(!store.has(&id).await.unwrap());
    }

    #[tokio::test]
    async fn delete_all_reports_count() {
        let (store, _dir) = test_store().await;
        store.write(&fp("a"), b"aa").await.unwrap();
        store.write(&fp("b"), b"bb").await.unwrap();
        store.write(&fp("c"), b"cc").await.unwrap();

        assert_eq!(store.delete_all().await.unwrap(), 3);
        assert!(store.list_all().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn list_all_skips_foreign_files() {
        let (store, _dir) = test_store().await;
        store.write(&fp("keep"), b"audio").await.unwrap();
        tokio::fs::write(store.dir().join("README.txt"), b"junk")
            .await
            .unwrap();
        tokio::fs::write(store.dir().join("short.mp3"), b"junk")
            .await
            .unwrap();

        let listing = store.list_all().await.unwrap();
        assert_eq!(listing.len(), 1);
        assert_eq!(listing[0].id, fp("keep"));
        assert_eq!(listing[0].size_bytes, 5);
    }

    #[tokio::test]
    async fn usage_sums_sizes() {
        let (store, _dir) = test_store().await;
        store.write(&fp("a"), &[0u8; 100]).await.unwrap();
        store.write(&fp("b"), &[0u8; 50]).await.unwrap();

        let (files, bytes) = store.usage().await.unwrap();
        assert_eq!(files, 2);
        assert_eq!(bytes, 150);
    }
}
