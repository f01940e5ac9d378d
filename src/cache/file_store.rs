use super::EmbeddingStore;
use crate::error::StoreError;
use async_trait::async_trait;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;

/// One file per fingerprint under a cache directory.
pub struct FileEmbeddingStore {
    dir: PathBuf,
}

impl FileEmbeddingStore {
    /// Open (and create if needed) a cache directory.
    pub fn new<P: AsRef<Path>>(dir: P) -> Result<Self, StoreError> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;

        tracing::info!("Embedding cache at {}", dir.display());

        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn entry_path(&self, fingerprint: &str) -> Result<PathBuf, StoreError> {
        let valid = !fingerprint.is_empty()
            && fingerprint
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if !valid {
            return Err(StoreError::InvalidKey(fingerprint.to_string()));
        }
        Ok(self.dir.join(format!("{}.emb", fingerprint)))
    }
}

#[async_trait]
impl EmbeddingStore for FileEmbeddingStore {
    async fn get(&self, fingerprint: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let path = self.entry_path(fingerprint)?;
        match fs::read(&path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn put(&self, fingerprint: &str, bytes: Vec<u8>) -> Result<(), StoreError> {
        let path = self.entry_path(fingerprint)?;
        // Readers never see a half-written entry
        let tmp = path.with_extension("emb.tmp");
        fs::write(&tmp, &bytes).await?;
        fs::rename(&tmp, &path).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn entries_survive_reopening() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = FileEmbeddingStore::new(dir.path()).unwrap();
            assert_eq!(store.get("abc123").await.unwrap(), None);
            store.put("abc123", vec![1, 2, 3]).await.unwrap();
            store.put("abc123", vec![4, 5]).await.unwrap();
        }

        let reopened = FileEmbeddingStore::new(dir.path()).unwrap();
        assert_eq!(reopened.get("abc123").await.unwrap(), Some(vec![4, 5]));
    }

    #[tokio::test]
    async fn path_like_keys_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileEmbeddingStore::new(dir.path()).unwrap();
        assert!(matches!(
            store.put("../escape", vec![]).await,
            Err(StoreError::InvalidKey(_))
        ));
        assert!(matches!(store.get("").await, Err(StoreError::InvalidKey(_))));
    }
}
