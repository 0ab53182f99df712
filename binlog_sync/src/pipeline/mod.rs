use dispatcher::DispatcherError;
use sinks::SinkError;
use sources::SourceError;
use stores::StoreError;
use thiserror::Error;

use crate::{config::ConfigError, offset::OffsetParseError};

pub mod batching;
pub mod data_pipeline;
pub mod dispatcher;
pub mod sinks;
pub mod sources;
pub mod stores;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("configuration error: {0}")]
    Configuration(#[from] ConfigError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("source error: {0}")]
    Source(#[from] SourceError),

    #[error("offset error: {0}")]
    Offset(#[from] OffsetParseError),

    #[error("dispatcher error: {0}")]
    Dispatcher(#[from] DispatcherError),

    #[error("sink error: {0}")]
    Sink(#[from] SinkError),

    #[error("gave up connecting after {attempts} attempts: {source}")]
    ConnectionExhausted {
        attempts: usize,
        #[source]
        source: SourceError,
    },
}
