use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;
use thiserror::Error;

use crate::{
    conversions::change_event::SourceEvent,
    offset::{OffsetScheme, ReplicationOffset, StartPosition},
};

pub mod binlog;
pub mod channel;
pub mod json_lines;
pub mod messaging;
pub mod staging;
pub mod transport;

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("unable to connect to {endpoint}: {source}")]
    Connection {
        endpoint: String,
        #[source]
        source: std::io::Error,
    },

    #[error("upstream connection lost: {0}")]
    Disconnected(#[source] std::io::Error),

    #[error("unable to decode replication event: {0}")]
    Decode(String),

    #[error("cdc stream was already started on this connection")]
    StreamAlreadyStarted,

    #[error("invalid event: {0}")]
    InvalidEvent(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("source is not connected")]
    NotConnected,

    #[cfg(feature = "redis")]
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[cfg(feature = "kafka")]
    #[error("kafka error: {0}")]
    Kafka(#[from] rdkafka::error::KafkaError),
}

impl SourceError {
    /// Failures that a fresh connection may cure.
    pub fn is_transient(&self) -> bool {
        match self {
            SourceError::Connection { .. } | SourceError::Disconnected(_) => true,
            #[cfg(feature = "redis")]
            SourceError::Redis(e) => {
                e.is_io_error() || e.is_connection_dropped() || e.is_timeout()
            }
            #[cfg(feature = "kafka")]
            SourceError::Kafka(_) => true,
            _ => false,
        }
    }
}

/// Whether `event` lies at or before the position a stream resumes from.
/// An offset that does not parse is never covered; the event is passed on
/// and rejected downstream.
pub(crate) fn already_applied(
    resume: Option<&ReplicationOffset>,
    scheme: OffsetScheme,
    event: &SourceEvent,
) -> bool {
    let Some(resume) = resume else {
        return false;
    };
    ReplicationOffset::parse(scheme, &event.offset_token)
        .and_then(|offset| resume.covers(&offset))
        .unwrap_or(false)
}

pub type CdcStream = Pin<Box<dyn Stream<Item = Result<SourceEvent, SourceError>> + Send>>;

/// An upstream replication log.
///
/// `connect` may be called again after the stream failed with a transient
/// error; each successful connect allows one `get_cdc_stream`.
#[async_trait]
pub trait Source: Send {
    async fn connect(&mut self) -> Result<(), SourceError>;

    async fn get_cdc_stream(&mut self, start: &StartPosition) -> Result<CdcStream, SourceError>;
}
