use std::{collections::HashMap, sync::Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use tracing::debug;

use super::{PositionKey, PositionStore, StoreError};

#[derive(Debug, Default)]
pub struct MemoryStore {
    positions: Mutex<HashMap<PositionKey, Bytes>>,
}

impl MemoryStore {
    pub fn with_position(key: PositionKey, value: impl Into<Bytes>) -> Self {
        let store = MemoryStore::default();
        store.positions.lock().unwrap().insert(key, value.into());
        store
    }
}

impl Clone for MemoryStore {
    fn clone(&self) -> Self {
        Self {
            positions: Mutex::new(self.positions.lock().unwrap().clone()),
        }
    }
}

#[async_trait]
impl PositionStore for MemoryStore {
    async fn get(&self, key: &PositionKey) -> Result<Option<Bytes>, StoreError> {
        let guard = self.positions.lock().unwrap();
        Ok(guard.get(key).filter(|v| !v.is_empty()).cloned())
    }

    async fn save(&self, key: &PositionKey, value: Bytes) -> Result<(), StoreError> {
        let mut guard = self.positions.lock().unwrap();
        debug!(%key, value = ?value, "stored position");
        guard.insert(key.clone(), value);
        Ok(())
    }

    async fn reset(&self, key: &PositionKey) -> Result<(), StoreError> {
        self.positions.lock().unwrap().remove(key);
        Ok(())
    }
}
