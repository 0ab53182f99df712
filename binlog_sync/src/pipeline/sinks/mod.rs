pub mod columnar;
pub mod key_value;
pub mod memory;
pub mod messaging;
pub mod stdout;

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::{
    config::{SinkConfig, SinkKind},
    conversions::{change_event::ChangeEvent, json_cell::JsonValueConversionError},
    table::TableName,
};

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("batch of {batch_size} events affected no rows")]
    NoRowsAffected { batch_size: usize },

    #[error("{table} row has no value for key column `{column}`")]
    MissingKey { table: TableName, column: String },

    #[error("invalid key value: {0}")]
    InvalidKey(#[from] JsonValueConversionError),

    #[error("unable to serialize event: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("destination {0} is closed")]
    Closed(String),

    #[error("destination {0} gave up on the batch before it was written")]
    Abandoned(String),

    #[error("sink type `{0}` is not compiled into this build")]
    Unsupported(&'static str),

    #[error("write failed: {0}")]
    Write(String),

    #[cfg(feature = "clickhouse")]
    #[error("clickhouse error: {0}")]
    Clickhouse(#[from] clickhouse::error::Error),

    #[cfg(feature = "redis")]
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[cfg(feature = "kafka")]
    #[error("kafka error: {0}")]
    Kafka(#[from] rdkafka::error::KafkaError),
}

/// A downstream destination for change events.
///
/// `write` receives one batch in submission order and reports how many rows
/// the destination applied. Writes may be repeated after a crash, so
/// implementations must be idempotent or last-write-wins.
#[async_trait]
pub trait Sink: Send + Sync {
    async fn write(&self, batch: &[Arc<ChangeEvent>]) -> Result<u64, SinkError>;

    /// Pushes out anything the client library still holds.
    async fn flush(&self) -> Result<(), SinkError> {
        Ok(())
    }
}

/// Builds the sink described by `config`.
pub async fn from_config(config: &SinkConfig) -> Result<Arc<dyn Sink>, SinkError> {
    match &config.kind {
        SinkKind::Stdout => Ok(Arc::new(stdout::StdoutSink)),
        #[cfg(feature = "clickhouse")]
        SinkKind::Clickhouse {
            url,
            database,
            user,
            password,
            table,
        } => {
            let writer = columnar::ClickhouseWriter::new(
                url,
                database.as_deref(),
                user.as_deref(),
                password.as_deref(),
            );
            Ok(Arc::new(columnar::ColumnarSink::new(
                writer,
                table,
                config.tables.clone(),
            )))
        }
        #[cfg(feature = "kafka")]
        SinkKind::Kafka {
            brokers,
            acks,
            topic_prefix,
        } => {
            let factory = messaging::KafkaProducerFactory::new(brokers, *acks);
            Ok(Arc::new(messaging::MessagingSink::new(
                factory,
                messaging::DeliveryGuarantee::from_acks(*acks),
                topic_prefix.clone(),
                config.tables.clone(),
            )))
        }
        #[cfg(feature = "redis")]
        SinkKind::Redis {
            url,
            default_primary_key,
        } => {
            let writer = key_value::RedisWriter::connect(url).await?;
            Ok(Arc::new(key_value::KeyValueSink::new(
                writer,
                default_primary_key,
                config.tables.clone(),
            )))
        }
        #[allow(unreachable_patterns)]
        other => Err(SinkError::Unsupported(other.type_name())),
    }
}
