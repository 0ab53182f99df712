use std::fmt;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

use crate::offset::OffsetParseError;

pub mod file;
pub mod memory;
pub mod store;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("position storage unavailable for key {key}: {source}")]
    StorageUnavailable {
        key: PositionKey,
        #[source]
        source: std::io::Error,
    },

    #[error("position write failed for key {key}: {source}")]
    Io {
        key: PositionKey,
        #[source]
        source: std::io::Error,
    },

    #[error("stored offset for key {key} is unusable: {source}")]
    InvalidOffset {
        key: PositionKey,
        #[source]
        source: OffsetParseError,
    },

    #[error("key {0} was disabled by an earlier storage failure")]
    Poisoned(PositionKey),
}

impl StoreError {
    /// Errors after which the key must not be written again in this process.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            StoreError::StorageUnavailable { .. } | StoreError::Poisoned(_)
        )
    }
}

/// Identifies one position record, optionally scoped by discriminators such
/// as the source database names.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PositionKey {
    key: String,
    scopes: Vec<String>,
}

impl PositionKey {
    pub fn new(key: impl Into<String>) -> Self {
        PositionKey {
            key: key.into(),
            scopes: Vec::new(),
        }
    }

    pub fn with_scopes<I, S>(mut self, scopes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.scopes.extend(scopes.into_iter().map(Into::into));
        self.scopes.sort();
        self.scopes.dedup();
        self
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn scopes(&self) -> &[String] {
        &self.scopes
    }
}

impl fmt::Display for PositionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key)?;
        for scope in &self.scopes {
            write!(f, ".{scope}")?;
        }
        Ok(())
    }
}

/// Durable key → raw offset storage.
///
/// `get` returns `None` for a key that was never written (or was reset).
/// `save` replaces the previous value as a whole.
#[async_trait]
pub trait PositionStore: Send + Sync {
    async fn get(&self, key: &PositionKey) -> Result<Option<Bytes>, StoreError>;

    async fn save(&self, key: &PositionKey, value: Bytes) -> Result<(), StoreError>;

    /// Operator reset: removes the record so the next start has no offset.
    async fn reset(&self, key: &PositionKey) -> Result<(), StoreError>;
}
