use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use bytes::Bytes;
use tracing::{debug, error, info};

use crate::offset::{OffsetScheme, ReplicationOffset};

use super::{PositionKey, PositionStore, StoreError};

#[derive(Debug, Default)]
struct KeyState {
    loaded: bool,
    committed: Option<ReplicationOffset>,
    poisoned: bool,
}

/// Tracks the committed offset of every key and persists merged values.
///
/// All dispatch tasks saving the same key share one async lock that is held
/// across merge and save, so the persisted value only moves forward even when
/// tasks finish out of order.
#[derive(Clone)]
pub struct StoreHandle {
    store: Arc<dyn PositionStore>,
    scheme: OffsetScheme,
    keys: Arc<Mutex<HashMap<PositionKey, Arc<tokio::sync::Mutex<KeyState>>>>>,
}

impl StoreHandle {
    pub fn new(store: Arc<dyn PositionStore>, scheme: OffsetScheme) -> Self {
        StoreHandle {
            store,
            scheme,
            keys: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn key_state(&self, key: &PositionKey) -> Arc<tokio::sync::Mutex<KeyState>> {
        self.keys
            .lock()
            .unwrap()
            .entry(key.clone())
            .or_default()
            .clone()
    }

    async fn load(&self, key: &PositionKey, state: &mut KeyState) -> Result<(), StoreError> {
        if state.loaded {
            return Ok(());
        }
        let raw = self.store.get(key).await?;
        state.committed = match raw {
            Some(raw) => {
                let token = String::from_utf8_lossy(&raw);
                let offset = ReplicationOffset::parse(self.scheme, &token).map_err(|source| {
                    StoreError::InvalidOffset {
                        key: key.clone(),
                        source,
                    }
                })?;
                Some(offset)
            }
            None => None,
        };
        state.loaded = true;
        Ok(())
    }

    /// Reads the persisted offset for `key`, `None` if nothing was saved yet.
    pub async fn get_latest_committed(
        &self,
        key: &PositionKey,
    ) -> Result<Option<ReplicationOffset>, StoreError> {
        let state = self.key_state(key);
        let mut state = state.lock().await;
        state.loaded = false;
        self.load(key, &mut state).await?;
        Ok(state.committed.clone())
    }

    /// Merges `offset` into the committed value and persists the result.
    ///
    /// Returns `false` when the offset was already covered and nothing was
    /// written.
    pub async fn report_offset(
        &self,
        key: &PositionKey,
        offset: &ReplicationOffset,
    ) -> Result<bool, StoreError> {
        let state = self.key_state(key);
        let mut state = state.lock().await;
        if state.poisoned {
            return Err(StoreError::Poisoned(key.clone()));
        }
        self.load(key, &mut state).await?;

        let merged = match &state.committed {
            Some(committed) => {
                let mut merged = committed.clone();
                let advanced = merged.merge(offset).map_err(|source| StoreError::InvalidOffset {
                    key: key.clone(),
                    source,
                })?;
                if !advanced {
                    return Ok(false);
                }
                merged
            }
            None => offset.clone(),
        };

        match self
            .store
            .save(key, Bytes::from(merged.to_string()))
            .await
        {
            Ok(()) => {
                debug!(%key, offset = %merged, "committed offset");
                state.committed = Some(merged);
                Ok(true)
            }
            Err(e) => {
                if e.is_fatal() {
                    error!(%key, error = %e, "position storage unavailable, disabling key");
                    state.poisoned = true;
                }
                Err(e)
            }
        }
    }

    /// Operator reset. The only path through which a key's offset recedes.
    pub async fn reset(&self, key: &PositionKey) -> Result<(), StoreError> {
        let state = self.key_state(key);
        let mut state = state.lock().await;
        self.store.reset(key).await?;
        *state = KeyState {
            loaded: true,
            ..KeyState::default()
        };
        info!(%key, "offset reset");
        Ok(())
    }
}
