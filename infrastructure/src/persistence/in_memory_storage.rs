// ./infrastructure/src/persistence/in_memory_storage.rs
use application::{KeyValueStorage, StorageError};
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use tracing::{debug, instrument};

/// Key-value area kept in process memory. Contents are lost on exit.
#[derive(Debug, Clone, Default)]
pub struct InMemoryStorage {
    // Slot key -> serialized collection
    slots: Arc<DashMap<String, String>>,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self {
            slots: Arc::new(DashMap::new()),
        }
    }
}

#[async_trait]
impl KeyValueStorage for InMemoryStorage {
    #[instrument(skip(self))]
    async fn get_item(&self, key: &str) -> Result<Option<String>, StorageError> {
        debug!(slot = %key, "Reading slot from in-memory storage");
        Ok(self.slots.get(key).map(|value| value.clone()))
    }

    #[instrument(skip(self, value), fields(bytes = value.len()))]
    async fn set_item(&self, key: &str, value: &str) -> Result<(), StorageError> {
        debug!(slot = %key, "Writing slot to in-memory storage");
        self.slots.insert(key.to_string(), value.to_string());
        Ok(())
    }
}
