use super::EmbeddingStore;
use crate::error::StoreError;
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;

/// Process-local store. Entries are lost when the process exits.
#[derive(Debug, Default)]
pub struct MemoryEmbeddingStore {
    entries: RwLock<HashMap<String, Vec<u8>>>,
}

impl MemoryEmbeddingStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

#[async_trait]
impl EmbeddingStore for MemoryEmbeddingStore {
    async fn get(&self, fingerprint: &str) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.entries.read().get(fingerprint).cloned())
    }

    async fn put(&self, fingerprint: &str, bytes: Vec<u8>) -> Result<(), StoreError> {
        self.entries.write().insert(fingerprint.to_string(), bytes);
        Ok(())
    }
}
