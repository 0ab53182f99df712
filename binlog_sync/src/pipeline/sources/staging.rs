use std::{collections::VecDeque, sync::Arc, time::Duration};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::time::{Interval, MissedTickBehavior};
use tracing::{debug, error, info};

use crate::{
    conversions::{
        change_event::{Operation, SourceEvent, TableRowRecord},
        json_cell::{JsonConverter, JsonValue},
    },
    offset::{OffsetScheme, ReplicationOffset, StartPosition},
    pipeline::sinks::key_value::{
        KeyValueRecord, OFFSET_FIELD, OPERATION_FIELD, TIMESTAMP_FIELD,
    },
};

use super::{already_applied, CdcStream, Source, SourceError};

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Hashes staged under `{table}:{id}`, laid out the way the key-value sink
/// writes them.
#[async_trait]
pub trait StagingReader: Send + Sync + 'static {
    async fn read(&self, table: &str) -> Result<Vec<KeyValueRecord>, SourceError>;

    async fn remove(&self, keys: &[String]) -> Result<(), SourceError>;
}

/// Polls staged row images on a tick and removes them once they were handed
/// on.
///
/// Every hash must carry `_op` and `_offset`; one that does not is logged
/// and left in place. Hashes at or before the resume offset are removed
/// without being yielded.
pub struct StagingSource<R> {
    reader: Arc<R>,
    database: String,
    tables: Vec<String>,
    poll_interval: Duration,
    scheme: OffsetScheme,
    connected: bool,
}

impl<R: StagingReader> StagingSource<R> {
    pub fn new(
        reader: R,
        database: impl Into<String>,
        tables: Vec<String>,
        poll_interval: Duration,
        scheme: OffsetScheme,
    ) -> Self {
        StagingSource {
            reader: Arc::new(reader),
            database: database.into(),
            tables,
            poll_interval,
            scheme,
            connected: false,
        }
    }
}

#[async_trait]
impl<R: StagingReader> Source for StagingSource<R> {
    async fn connect(&mut self) -> Result<(), SourceError> {
        self.connected = true;
        info!(tables = ?self.tables, interval = ?self.poll_interval, "polling staged records");
        Ok(())
    }

    async fn get_cdc_stream(&mut self, start: &StartPosition) -> Result<CdcStream, SourceError> {
        if !std::mem::take(&mut self.connected) {
            return Err(SourceError::NotConnected);
        }
        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let poller = Poller {
            reader: self.reader.clone(),
            database: self.database.clone(),
            tables: self.tables.clone(),
            scheme: self.scheme,
            resume: start.offset().cloned(),
            ticker,
            pending: VecDeque::new(),
            consumed: Vec::new(),
        };
        let stream = futures::stream::unfold(poller, |mut poller| async move {
            let item = poller.next_event().await;
            Some((item, poller))
        });
        Ok(Box::pin(stream))
    }
}

struct Poller<R> {
    reader: Arc<R>,
    database: String,
    tables: Vec<String>,
    scheme: OffsetScheme,
    resume: Option<ReplicationOffset>,
    ticker: Interval,
    pending: VecDeque<(String, SourceEvent)>,
    consumed: Vec<String>,
}

impl<R: StagingReader> Poller<R> {
    async fn next_event(&mut self) -> Result<SourceEvent, SourceError> {
        loop {
            if let Some((key, event)) = self.pending.pop_front() {
                self.consumed.push(key);
                return Ok(event);
            }
            if !self.consumed.is_empty() {
                self.reader.remove(&self.consumed).await?;
                debug!(removed = self.consumed.len(), "removed consumed records");
                self.consumed.clear();
            }
            self.ticker.tick().await;
            self.poll().await?;
        }
    }

    async fn poll(&mut self) -> Result<(), SourceError> {
        let mut staged = Vec::new();
        for table in &self.tables {
            for record in self.reader.read(table).await? {
                if record.fields.is_empty() {
                    // removed between listing and reading
                    continue;
                }
                match staged_event(&self.database, table, &record) {
                    Ok(event) => staged.push((record.key, event)),
                    Err(reason) => error!(key = %record.key, reason, "leaving staged record"),
                }
            }
        }
        staged.sort_by(|(a_key, a), (b_key, b)| {
            a.timestamp.cmp(&b.timestamp).then_with(|| a_key.cmp(b_key))
        });
        for (key, event) in staged {
            if already_applied(self.resume.as_ref(), self.scheme, &event) {
                debug!(key, offset = %event.offset_token, "removing record before resume offset");
                self.consumed.push(key);
            } else {
                self.pending.push_back((key, event));
            }
        }
        Ok(())
    }
}

fn staged_event(
    database: &str,
    table: &str,
    record: &KeyValueRecord,
) -> Result<SourceEvent, &'static str> {
    let mut operation = None;
    let mut offset_token = None;
    let mut timestamp = None;
    let mut row = TableRowRecord::new();
    for (name, raw) in &record.fields {
        match name.as_str() {
            OPERATION_FIELD => operation = Some(raw.as_str()),
            OFFSET_FIELD => offset_token = Some(raw.clone()),
            TIMESTAMP_FIELD => timestamp = DateTime::parse_from_rfc3339(raw).ok(),
            _ => {
                row.insert(name.clone(), JsonConverter::from_field(raw));
            }
        }
    }
    let operation: Operation = operation
        .and_then(|op| serde_json::from_value(JsonValue::String(op.to_string())).ok())
        .ok_or("missing or unknown operation")?;
    let offset_token = offset_token.ok_or("missing offset")?;
    Ok(SourceEvent {
        database: database.to_string(),
        table: table.to_string(),
        operation,
        rows_before: None,
        rows_after: vec![row],
        offset_token,
        timestamp: timestamp.map_or_else(Utc::now, |t| t.with_timezone(&Utc)),
    })
}

#[cfg(feature = "redis")]
pub type RedisSource = StagingSource<RedisStagingReader>;

#[cfg(feature = "redis")]
pub struct RedisStagingReader {
    connection: redis::aio::ConnectionManager,
}

#[cfg(feature = "redis")]
impl RedisStagingReader {
    pub async fn connect(url: &str) -> Result<Self, SourceError> {
        let client = redis::Client::open(url)?;
        let connection = redis::aio::ConnectionManager::new(client).await?;
        Ok(RedisStagingReader { connection })
    }
}

#[cfg(feature = "redis")]
#[async_trait]
impl StagingReader for RedisStagingReader {
    async fn read(&self, table: &str) -> Result<Vec<KeyValueRecord>, SourceError> {
        use redis::AsyncCommands;

        let mut connection = self.connection.clone();
        let keys: Vec<String> = {
            let mut iter = connection
                .scan_match::<_, String>(format!("{table}:*"))
                .await?;
            let mut keys = Vec::new();
            while let Some(key) = iter.next_item().await {
                keys.push(key);
            }
            keys
        };
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let mut pipe = redis::pipe();
        for key in &keys {
            pipe.hgetall(key);
        }
        let hashes: Vec<Vec<(String, String)>> = pipe.query_async(&mut connection).await?;
        Ok(keys
            .into_iter()
            .zip(hashes)
            .map(|(key, fields)| KeyValueRecord { key, fields })
            .collect())
    }

    async fn remove(&self, keys: &[String]) -> Result<(), SourceError> {
        use redis::AsyncCommands;

        let mut connection = self.connection.clone();
        connection.del::<_, ()>(keys.to_vec()).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::{collections::BTreeMap, sync::Mutex};

    use futures::StreamExt;
    use serde_json::json;

    use super::*;

    #[derive(Default)]
    struct HashStaging {
        hashes: Mutex<BTreeMap<String, Vec<(String, String)>>>,
    }

    impl HashStaging {
        fn stage(&self, key: &str, fields: &[(&str, &str)]) {
            let fields = fields
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect();
            self.hashes.lock().unwrap().insert(key.to_string(), fields);
        }

        fn keys(&self) -> Vec<String> {
            self.hashes.lock().unwrap().keys().cloned().collect()
        }
    }

    #[async_trait]
    impl StagingReader for Arc<HashStaging> {
        async fn read(&self, table: &str) -> Result<Vec<KeyValueRecord>, SourceError> {
            let prefix = format!("{table}:");
            Ok(self
                .hashes
                .lock()
                .unwrap()
                .iter()
                .filter(|(key, _)| key.starts_with(&prefix))
                .map(|(key, fields)| KeyValueRecord {
                    key: key.clone(),
                    fields: fields.clone(),
                })
                .collect())
        }

        async fn remove(&self, keys: &[String]) -> Result<(), SourceError> {
            let mut hashes = self.hashes.lock().unwrap();
            for key in keys {
                hashes.remove(key);
            }
            Ok(())
        }
    }

    fn source(staging: &Arc<HashStaging>) -> StagingSource<Arc<HashStaging>> {
        StagingSource::new(
            staging.clone(),
            "shop",
            vec!["orders".to_string(), "customers".to_string()],
            DEFAULT_POLL_INTERVAL,
            OffsetScheme::Gtid,
        )
    }

    async fn idle(stream: &mut CdcStream) {
        let next = tokio::time::timeout(Duration::from_secs(1), stream.next()).await;
        assert!(next.is_err(), "expected no event, got {next:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn yields_staged_rows_and_removes_them() {
        let staging = Arc::new(HashStaging::default());
        staging.stage(
            "orders:2",
            &[
                ("id", "2"),
                ("note", ""),
                ("_op", "update"),
                ("_offset", "g:2"),
                ("_ts", "2024-03-01T10:00:02+00:00"),
            ],
        );
        staging.stage(
            "customers:9",
            &[
                ("id", "9"),
                ("name", "ada"),
                ("_op", "insert"),
                ("_offset", "g:1"),
                ("_ts", "2024-03-01T10:00:01+00:00"),
            ],
        );
        staging.stage("audit:1", &[("_op", "insert"), ("_offset", "g:3")]);

        let mut source = source(&staging);
        source.connect().await.unwrap();
        let mut stream = source.get_cdc_stream(&StartPosition::Tail).await.unwrap();

        let first = stream.next().await.unwrap().unwrap();
        assert_eq!(first.database, "shop");
        assert_eq!(first.table, "customers");
        assert_eq!(first.operation, Operation::Insert);
        assert_eq!(first.offset_token, "g:1");
        assert_eq!(first.rows_after[0]["name"], json!("ada"));

        let second = stream.next().await.unwrap().unwrap();
        assert_eq!(second.table, "orders");
        assert_eq!(second.operation, Operation::Update);
        assert_eq!(second.rows_after[0]["id"], json!(2));
        assert_eq!(second.rows_after[0]["note"], json!(null));
        assert!(!second.rows_after[0].contains_key("_offset"));

        // nothing is removed until every polled record was handed on
        assert_eq!(staging.keys().len(), 3);
        idle(&mut stream).await;
        assert_eq!(staging.keys(), vec!["audit:1".to_string()]);

        staging.stage("orders:3", &[("id", "3"), ("_op", "delete"), ("_offset", "g:4")]);
        let third = stream.next().await.unwrap().unwrap();
        assert_eq!(third.operation, Operation::Delete);
        assert_eq!(third.offset_token, "g:4");
    }

    #[tokio::test(start_paused = true)]
    async fn records_without_provenance_stay_staged() {
        let staging = Arc::new(HashStaging::default());
        staging.stage("orders:1", &[("id", "1"), ("_op", "insert")]);
        staging.stage("orders:2", &[("id", "2"), ("_op", "merge"), ("_offset", "g:2")]);
        staging.stage("orders:3", &[("id", "3"), ("_op", "insert"), ("_offset", "g:3")]);

        let mut source = source(&staging);
        source.connect().await.unwrap();
        let mut stream = source.get_cdc_stream(&StartPosition::Tail).await.unwrap();

        let event = stream.next().await.unwrap().unwrap();
        assert_eq!(event.offset_token, "g:3");
        idle(&mut stream).await;
        assert_eq!(
            staging.keys(),
            vec!["orders:1".to_string(), "orders:2".to_string()]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn records_before_resume_offset_are_removed_unseen() {
        let staging = Arc::new(HashStaging::default());
        staging.stage("orders:1", &[("id", "1"), ("_op", "insert"), ("_offset", "g:1")]);
        staging.stage("orders:3", &[("id", "3"), ("_op", "insert"), ("_offset", "g:3")]);

        let mut source = source(&staging);
        source.connect().await.unwrap();
        let start = StartPosition::Resume {
            offset: ReplicationOffset::parse(OffsetScheme::Gtid, "g:2").unwrap(),
            token: "g:1-2".to_string(),
        };
        let mut stream = source.get_cdc_stream(&start).await.unwrap();

        let event = stream.next().await.unwrap().unwrap();
        assert_eq!(event.offset_token, "g:3");
        idle(&mut stream).await;
        assert!(staging.keys().is_empty());
    }

    #[tokio::test]
    async fn stream_needs_a_connection() {
        let staging = Arc::new(HashStaging::default());
        let mut source = source(&staging);
        assert!(matches!(
            source.get_cdc_stream(&StartPosition::Tail).await,
            Err(SourceError::NotConnected)
        ));
    }
}
