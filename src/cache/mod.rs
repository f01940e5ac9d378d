mod file_store;
mod memory;

pub use file_store::FileEmbeddingStore;
pub use memory::MemoryEmbeddingStore;

use crate::error::StoreError;
use crate::segmentation::Embeddings;
use async_trait::async_trait;
use image::RgbaImage;
use sha2::{Digest, Sha256};

/// Durable byte store for encoder outputs, keyed by image fingerprint.
///
/// Stores never invalidate: an entry lives until it is overwritten.
#[async_trait]
pub trait EmbeddingStore: Send + Sync {
    /// Fetch the bytes stored under `fingerprint`, if any.
    async fn get(&self, fingerprint: &str) -> Result<Option<Vec<u8>>, StoreError>;

    /// Store `bytes` under `fingerprint`, replacing any previous entry.
    async fn put(&self, fingerprint: &str, bytes: Vec<u8>) -> Result<(), StoreError>;
}

/// Content hash of the letterboxed canvas the encoder will see.
pub fn fingerprint(canvas: &RgbaImage) -> String {
    let mut hasher = Sha256::new();
    hasher.update(canvas.width().to_le_bytes());
    hasher.update(canvas.height().to_le_bytes());
    hasher.update(canvas.as_raw());
    hex::encode(hasher.finalize())
}

pub fn encode_embeddings(embeddings: &Embeddings) -> Result<Vec<u8>, StoreError> {
    Ok(bincode::serialize(embeddings)?)
}

pub fn decode_embeddings(bytes: &[u8]) -> Result<Embeddings, StoreError> {
    Ok(bincode::deserialize(bytes)?)
}

/// Look up embeddings, treating every failure as a miss.
pub async fn load_embeddings(store: &dyn EmbeddingStore, fingerprint: &str) -> Option<Embeddings> {
    let bytes = match store.get(fingerprint).await {
        Ok(Some(bytes)) => bytes,
        Ok(None) => {
            tracing::debug!("Embedding cache miss for {}", fingerprint);
            return None;
        }
        Err(e) => {
            tracing::warn!("Embedding cache lookup failed for {}: {}", fingerprint, e);
            return None;
        }
    };

    let embeddings = match decode_embeddings(&bytes) {
        Ok(embeddings) => embeddings,
        Err(e) => {
            tracing::warn!("Discarding unreadable cache entry {}: {}", fingerprint, e);
            return None;
        }
    };

    if let Err(e) = embeddings.validate() {
        tracing::warn!("Discarding malformed cache entry {}: {}", fingerprint, e);
        return None;
    }

    tracing::debug!("Embedding cache hit for {}", fingerprint);
    Some(embeddings)
}

/// Persist embeddings, logging and swallowing any failure.
pub async fn save_embeddings(store: &dyn EmbeddingStore, fingerprint: &str, embeddings: &Embeddings) {
    let bytes = match encode_embeddings(embeddings) {
        Ok(bytes) => bytes,
        Err(e) => {
            tracing::warn!("Failed to serialize embeddings for {}: {}", fingerprint, e);
            return;
        }
    };

    match store.put(fingerprint, bytes).await {
        Ok(()) => tracing::debug!("Stored embeddings for {}", fingerprint),
        Err(e) => tracing::warn!("Failed to store embeddings for {}: {}", fingerprint, e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgba;

    struct BrokenStore;

    #[async_trait]
    impl EmbeddingStore for BrokenStore {
        async fn get(&self, _fingerprint: &str) -> Result<Option<Vec<u8>>, StoreError> {
            Err(StoreError::Io(std::io::Error::other("disk gone")))
        }

        async fn put(&self, _fingerprint: &str, _bytes: Vec<u8>) -> Result<(), StoreError> {
            Err(StoreError::Io(std::io::Error::other("disk gone")))
        }
    }

    #[test]
    fn fingerprint_depends_on_content() {
        let a = RgbaImage::from_pixel(4, 4, Rgba([1, 2, 3, 255]));
        let mut b = a.clone();
        assert_eq!(fingerprint(&a), fingerprint(&b));
        b.put_pixel(3, 3, Rgba([0, 0, 0, 255]));
        assert_ne!(fingerprint(&a), fingerprint(&b));
        assert_eq!(fingerprint(&a).len(), 64);
    }

    #[tokio::test]
    async fn failing_store_degrades_to_miss() {
        let store = BrokenStore;
        assert!(load_embeddings(&store, "key").await.is_none());
        let embeddings = Embeddings {
            image_embed: vec![],
            high_res_feat1: vec![],
            high_res_feat2: vec![],
        };
        save_embeddings(&store, "key", &embeddings).await;
    }

    #[tokio::test]
    async fn malformed_entry_is_a_miss() {
        let store = MemoryEmbeddingStore::new();
        let short = Embeddings {
            image_embed: vec![1.0; 4],
            high_res_feat1: vec![],
            high_res_feat2: vec![],
        };
        store.put("key", encode_embeddings(&short).unwrap()).await.unwrap();
        assert!(load_embeddings(&store, "key").await.is_none());

        store.put("junk", vec![1, 2, 3]).await.unwrap();
        assert!(load_embeddings(&store, "junk").await.is_none());
    }
}
