use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use tracing::debug;

use crate::{
    conversions::{change_event::ChangeEvent, json_cell::JsonConverter},
    table::TableConfig,
};

use super::{Sink, SinkError};

pub const OPERATION_FIELD: &str = "_op";
pub const OFFSET_FIELD: &str = "_offset";
pub const TIMESTAMP_FIELD: &str = "_ts";

/// A hash written under `key`, replacing the fields it names.
#[derive(Debug, Clone, PartialEq)]
pub struct KeyValueRecord {
    pub key: String,
    pub fields: Vec<(String, String)>,
}

#[async_trait]
pub trait KeyValueWriter: Send + Sync {
    /// Upserts every record atomically, returning how many were written.
    async fn upsert(&self, records: &[KeyValueRecord]) -> Result<u64, SinkError>;
}

/// Mirrors the latest image of each row into a key-value store.
///
/// Deletes are stored as an upsert of the removed image with `_op = delete`,
/// so a replay after a crash rewrites the same hash instead of failing on a
/// missing key.
pub struct KeyValueSink<W> {
    writer: W,
    default_primary_key: String,
    tables: HashMap<String, TableConfig>,
}

impl<W: KeyValueWriter> KeyValueSink<W> {
    pub fn new(
        writer: W,
        default_primary_key: impl Into<String>,
        tables: HashMap<String, TableConfig>,
    ) -> Self {
        KeyValueSink {
            writer,
            default_primary_key: default_primary_key.into(),
            tables,
        }
    }

    pub fn writer(&self) -> &W {
        &self.writer
    }

    fn record(&self, event: &ChangeEvent) -> Result<KeyValueRecord, SinkError> {
        let config = self.tables.get(&event.table.name);
        let column = config
            .and_then(|t| t.primary_key.as_deref())
            .unwrap_or(&self.default_primary_key);
        let prefix = config
            .and_then(|t| t.target.as_deref())
            .unwrap_or(&event.table.name);

        let id = event
            .key_value(column)?
            .ok_or_else(|| SinkError::MissingKey {
                table: event.table.clone(),
                column: column.to_string(),
            })?;

        let mut fields: Vec<(String, String)> = event
            .values
            .iter()
            .map(|(name, value)| (name.clone(), JsonConverter::to_field(value)))
            .collect();
        fields.push((OPERATION_FIELD.to_string(), event.operation.to_string()));
        fields.push((OFFSET_FIELD.to_string(), event.offset.to_string()));
        fields.push((TIMESTAMP_FIELD.to_string(), event.timestamp.to_rfc3339()));

        Ok(KeyValueRecord {
            key: format!("{prefix}:{id}"),
            fields,
        })
    }
}

#[async_trait]
impl<W: KeyValueWriter> Sink for KeyValueSink<W> {
    async fn write(&self, batch: &[Arc<ChangeEvent>]) -> Result<u64, SinkError> {
        let records = batch
            .iter()
            .map(|event| self.record(event))
            .collect::<Result<Vec<_>, _>>()?;
        let written = self.writer.upsert(&records).await?;
        debug!(written, "upserted records");
        Ok(written)
    }
}

#[cfg(feature = "redis")]
pub struct RedisWriter {
    connection: redis::aio::ConnectionManager,
}

#[cfg(feature = "redis")]
impl RedisWriter {
    pub async fn connect(url: &str) -> Result<Self, SinkError> {
        let client = redis::Client::open(url)?;
        let connection = redis::aio::ConnectionManager::new(client).await?;
        Ok(RedisWriter { connection })
    }
}

#[cfg(feature = "redis")]
#[async_trait]
impl KeyValueWriter for RedisWriter {
    async fn upsert(&self, records: &[KeyValueRecord]) -> Result<u64, SinkError> {
        let mut pipe = redis::pipe();
        pipe.atomic();
        for record in records {
            pipe.hset_multiple(&record.key, record.fields.as_slice()).ignore();
        }
        let mut connection = self.connection.clone();
        pipe.query_async::<_, ()>(&mut connection).await?;
        Ok(records.len() as u64)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use chrono::Utc;
    use serde_json::json;

    use crate::{
        conversions::change_event::{Operation, TableRowRecord},
        offset::{OffsetScheme, ReplicationOffset},
        table::TableName,
    };

    use super::*;

    #[derive(Default)]
    struct HashWriter {
        hashes: Mutex<HashMap<String, HashMap<String, String>>>,
    }

    #[async_trait]
    impl KeyValueWriter for HashWriter {
        async fn upsert(&self, records: &[KeyValueRecord]) -> Result<u64, SinkError> {
            let mut hashes = self.hashes.lock().unwrap();
            for record in records {
                let hash = hashes.entry(record.key.clone()).or_default();
                hash.extend(record.fields.iter().cloned());
            }
            Ok(records.len() as u64)
        }
    }

    fn event(operation: Operation, id: serde_json::Value, gtid: u64) -> Arc<ChangeEvent> {
        let mut values = TableRowRecord::new();
        values.insert("order_id".to_string(), id);
        values.insert("note".to_string(), json!(null));
        Arc::new(ChangeEvent {
            table: TableName::new("shop", "orders"),
            operation,
            values,
            before: None,
            offset: ReplicationOffset::parse(OffsetScheme::Gtid, &format!("g:{gtid}")).unwrap(),
            timestamp: Utc::now(),
        })
    }

    fn sink() -> KeyValueSink<HashWriter> {
        let mut tables = HashMap::new();
        tables.insert(
            "orders".to_string(),
            TableConfig {
                primary_key: Some("order_id".to_string()),
                ..TableConfig::default()
            },
        );
        KeyValueSink::new(HashWriter::default(), "id", tables)
    }

    #[tokio::test]
    async fn replay_is_idempotent() {
        let sink = sink();
        let batch = vec![
            event(Operation::Insert, json!(5), 1),
            event(Operation::Delete, json!(5), 2),
        ];

        assert_eq!(sink.write(&batch).await.unwrap(), 2);
        let first = sink.writer().hashes.lock().unwrap().clone();
        sink.write(&batch).await.unwrap();
        let second = sink.writer().hashes.lock().unwrap().clone();
        assert_eq!(first, second);

        let hash = &second["orders:5"];
        assert_eq!(hash["order_id"], "5");
        assert_eq!(hash["note"], "");
        assert_eq!(hash[OPERATION_FIELD], "delete");
        assert_eq!(hash[OFFSET_FIELD], "g:2");
    }

    #[tokio::test]
    async fn missing_key_fails_the_batch() {
        let sink = KeyValueSink::new(HashWriter::default(), "id", HashMap::new());
        let err = sink
            .write(&[event(Operation::Insert, json!(5), 1)])
            .await
            .unwrap_err();
        assert!(matches!(err, SinkError::MissingKey { ref column, .. } if column == "id"));
        assert!(sink.writer().hashes.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn null_key_is_rejected() {
        let err = sink()
            .write(&[event(Operation::Insert, json!(null), 1)])
            .await
            .unwrap_err();
        assert!(matches!(err, SinkError::InvalidKey(_)));
    }
}
