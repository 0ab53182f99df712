use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, info};

use crate::{
    conversions::change_event::{Operation, SourceEvent, TableRowRecord},
    offset::{OffsetScheme, ReplicationOffset, StartPosition},
};

use super::{already_applied, CdcStream, Source, SourceError};

#[async_trait]
pub trait TopicConsumer: Send + 'static {
    /// The next message payload, or `None` once the consumer was shut down.
    async fn next_payload(&mut self) -> Result<Option<Vec<u8>>, SourceError>;

    /// Commits the position of everything received so far.
    async fn commit(&mut self) -> Result<(), SourceError>;
}

pub trait ConsumerFactory: Send + Sync {
    type Consumer: TopicConsumer;

    fn subscribe(&self, topics: &[String]) -> Result<Self::Consumer, SourceError>;
}

#[derive(Deserialize)]
#[serde(untagged)]
enum Rows {
    Many(Vec<TableRowRecord>),
    One(TableRowRecord),
}

/// `[table, operation, rows, offset]` as the messaging sink publishes it, or
/// `[table, operation, rows, file, position]`.
#[derive(Deserialize)]
#[serde(untagged)]
enum Payload {
    Token(String, Operation, Rows, String),
    FilePosition(String, Operation, Rows, String, u64),
}

/// Decodes one message. A table written as `db.table` names its own
/// database, a bare one belongs to `database`.
pub fn decode_payload(payload: &[u8], database: &str) -> Result<SourceEvent, SourceError> {
    let payload: Payload = serde_json::from_slice(payload)?;
    let (table, operation, rows, offset_token) = match payload {
        Payload::Token(table, operation, rows, token) => (table, operation, rows, token),
        Payload::FilePosition(table, operation, rows, file, position) => {
            (table, operation, rows, format!("{file}:{position}"))
        }
    };
    let (database, table) = match table.split_once('.') {
        Some((database, table)) => (database.to_string(), table.to_string()),
        None => (database.to_string(), table),
    };
    let rows_after = match rows {
        Rows::Many(rows) => rows,
        Rows::One(row) => vec![row],
    };
    Ok(SourceEvent {
        database,
        table,
        operation,
        rows_before: None,
        rows_after,
        offset_token,
        timestamp: chrono::Utc::now(),
    })
}

/// Consumes change events from topics, one event per message.
///
/// A message's position is committed once its event was handed on, that is
/// when the next message is requested. Messages at or before the resume
/// offset are committed without being yielded.
pub struct MessagingSource<F: ConsumerFactory> {
    factory: F,
    topics: Vec<String>,
    database: String,
    scheme: OffsetScheme,
    consumer: Option<F::Consumer>,
}

impl<F: ConsumerFactory> MessagingSource<F> {
    pub fn new(
        factory: F,
        topics: Vec<String>,
        database: impl Into<String>,
        scheme: OffsetScheme,
    ) -> Self {
        MessagingSource {
            factory,
            topics,
            database: database.into(),
            scheme,
            consumer: None,
        }
    }
}

#[async_trait]
impl<F: ConsumerFactory> Source for MessagingSource<F> {
    async fn connect(&mut self) -> Result<(), SourceError> {
        self.consumer = Some(self.factory.subscribe(&self.topics)?);
        info!(topics = ?self.topics, "subscribed");
        Ok(())
    }

    async fn get_cdc_stream(&mut self, start: &StartPosition) -> Result<CdcStream, SourceError> {
        let consumer = self.consumer.take().ok_or(SourceError::NotConnected)?;
        let state = Consumption {
            consumer,
            database: self.database.clone(),
            scheme: self.scheme,
            resume: start.offset().cloned(),
            uncommitted: false,
        };
        let stream = futures::stream::unfold(state, |mut state| async move {
            let item = state.next_event().await?;
            Some((item, state))
        });
        Ok(Box::pin(stream))
    }
}

struct Consumption<C> {
    consumer: C,
    database: String,
    scheme: OffsetScheme,
    resume: Option<ReplicationOffset>,
    uncommitted: bool,
}

impl<C: TopicConsumer> Consumption<C> {
    async fn next_event(&mut self) -> Option<Result<SourceEvent, SourceError>> {
        loop {
            if self.uncommitted {
                if let Err(e) = self.consumer.commit().await {
                    return Some(Err(e));
                }
                self.uncommitted = false;
            }
            let payload = match self.consumer.next_payload().await {
                Ok(Some(payload)) => payload,
                Ok(None) => return None,
                Err(e) => return Some(Err(e)),
            };
            self.uncommitted = true;
            let event = match decode_payload(&payload, &self.database) {
                Ok(event) => event,
                Err(e) => return Some(Err(e)),
            };
            if already_applied(self.resume.as_ref(), self.scheme, &event) {
                debug!(offset = %event.offset_token, "skipping message before resume offset");
                continue;
            }
            return Some(Ok(event));
        }
    }
}

#[cfg(feature = "kafka")]
pub use kafka::{KafkaConsumerFactory, KafkaTopicConsumer};

#[cfg(feature = "kafka")]
pub type KafkaSource = MessagingSource<KafkaConsumerFactory>;

#[cfg(feature = "kafka")]
mod kafka {
    use async_trait::async_trait;
    use rdkafka::{
        consumer::{CommitMode, Consumer, StreamConsumer},
        ClientConfig, Message,
    };
    use tracing::debug;

    use super::{ConsumerFactory, SourceError, TopicConsumer};

    pub struct KafkaConsumerFactory {
        config: ClientConfig,
    }

    impl KafkaConsumerFactory {
        pub fn new(brokers: &str, group_id: &str) -> Self {
            let mut config = ClientConfig::new();
            config
                .set("bootstrap.servers", brokers)
                .set("group.id", group_id)
                .set("enable.auto.commit", "false")
                .set("auto.offset.reset", "earliest");
            KafkaConsumerFactory { config }
        }
    }

    impl ConsumerFactory for KafkaConsumerFactory {
        type Consumer = KafkaTopicConsumer;

        fn subscribe(&self, topics: &[String]) -> Result<KafkaTopicConsumer, SourceError> {
            let consumer: StreamConsumer = self.config.create()?;
            let topics: Vec<&str> = topics.iter().map(String::as_str).collect();
            consumer.subscribe(&topics)?;
            Ok(KafkaTopicConsumer { consumer })
        }
    }

    pub struct KafkaTopicConsumer {
        consumer: StreamConsumer,
    }

    #[async_trait]
    impl TopicConsumer for KafkaTopicConsumer {
        async fn next_payload(&mut self) -> Result<Option<Vec<u8>>, SourceError> {
            loop {
                let message = self.consumer.recv().await?;
                match message.payload() {
                    Some(payload) => return Ok(Some(payload.to_vec())),
                    None => debug!(
                        topic = message.topic(),
                        offset = message.offset(),
                        "skipping empty message"
                    ),
                }
            }
        }

        async fn commit(&mut self) -> Result<(), SourceError> {
            self.consumer.commit_consumer_state(CommitMode::Async)?;
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        collections::VecDeque,
        sync::{Arc, Mutex},
    };

    use futures::StreamExt;
    use serde_json::json;

    use super::*;

    #[derive(Default)]
    struct Log {
        subscriptions: Vec<Vec<String>>,
        // messages received when each commit happened
        commits: Vec<usize>,
    }

    struct QueueFactory {
        payloads: Mutex<Option<VecDeque<Vec<u8>>>>,
        log: Arc<Mutex<Log>>,
    }

    impl QueueFactory {
        fn new(payloads: &[serde_json::Value]) -> (Self, Arc<Mutex<Log>>) {
            let log = Arc::new(Mutex::new(Log::default()));
            let payloads = payloads
                .iter()
                .map(|p| match p {
                    serde_json::Value::String(raw) => raw.clone().into_bytes(),
                    other => serde_json::to_vec(other).unwrap(),
                })
                .collect();
            let factory = QueueFactory {
                payloads: Mutex::new(Some(payloads)),
                log: log.clone(),
            };
            (factory, log)
        }
    }

    impl ConsumerFactory for QueueFactory {
        type Consumer = QueueConsumer;

        fn subscribe(&self, topics: &[String]) -> Result<QueueConsumer, SourceError> {
            self.log.lock().unwrap().subscriptions.push(topics.to_vec());
            Ok(QueueConsumer {
                payloads: self.payloads.lock().unwrap().take().unwrap_or_default(),
                received: 0,
                log: self.log.clone(),
            })
        }
    }

    struct QueueConsumer {
        payloads: VecDeque<Vec<u8>>,
        received: usize,
        log: Arc<Mutex<Log>>,
    }

    #[async_trait]
    impl TopicConsumer for QueueConsumer {
        async fn next_payload(&mut self) -> Result<Option<Vec<u8>>, SourceError> {
            let payload = self.payloads.pop_front();
            if payload.is_some() {
                self.received += 1;
            }
            Ok(payload)
        }

        async fn commit(&mut self) -> Result<(), SourceError> {
            self.log.lock().unwrap().commits.push(self.received);
            Ok(())
        }
    }

    fn source(factory: QueueFactory) -> MessagingSource<QueueFactory> {
        MessagingSource::new(
            factory,
            vec!["orders".to_string(), "customers".to_string()],
            "shop",
            OffsetScheme::Gtid,
        )
    }

    #[test]
    fn decodes_both_payload_layouts() {
        let event = decode_payload(
            br#"["orders","insert",{"id":1,"status":"new"},"g:3"]"#,
            "shop",
        )
        .unwrap();
        assert_eq!(event.database, "shop");
        assert_eq!(event.table, "orders");
        assert_eq!(event.operation, Operation::Insert);
        assert_eq!(event.rows_after.len(), 1);
        assert_eq!(event.rows_after[0]["status"], json!("new"));
        assert_eq!(event.offset_token, "g:3");

        let event = decode_payload(
            br#"["billing.invoices","write",[{"id":1},{"id":2}],"mysql-bin.000003",1200]"#,
            "shop",
        )
        .unwrap();
        assert_eq!(event.database, "billing");
        assert_eq!(event.table, "invoices");
        assert_eq!(event.operation, Operation::Insert);
        assert_eq!(event.rows_after.len(), 2);
        assert_eq!(event.offset_token, "mysql-bin.000003:1200");

        assert!(matches!(
            decode_payload(br#"["orders","truncate",{},"g:1"]"#, "shop"),
            Err(SourceError::InvalidEvent(_))
        ));
    }

    #[tokio::test]
    async fn commits_each_message_after_handing_it_on() {
        let (factory, log) = QueueFactory::new(&[
            json!(["orders", "insert", {"id": 1}, "g:1"]),
            json!("not json"),
            json!(["customers", "update", {"id": 9}, "g:2"]),
        ]);
        let mut source = source(factory);
        source.connect().await.unwrap();
        let mut stream = source.get_cdc_stream(&StartPosition::Tail).await.unwrap();

        let first = stream.next().await.unwrap().unwrap();
        assert_eq!(first.offset_token, "g:1");
        assert!(log.lock().unwrap().commits.is_empty());

        assert!(matches!(
            stream.next().await,
            Some(Err(SourceError::InvalidEvent(_)))
        ));
        let third = stream.next().await.unwrap().unwrap();
        assert_eq!(third.table, "customers");
        assert_eq!(third.operation, Operation::Update);
        assert!(stream.next().await.is_none());

        let log = log.lock().unwrap();
        assert_eq!(
            log.subscriptions,
            vec![vec!["orders".to_string(), "customers".to_string()]]
        );
        assert_eq!(log.commits, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn messages_before_resume_offset_are_committed_not_yielded() {
        let (factory, log) = QueueFactory::new(&[
            json!(["orders", "insert", {"id": 1}, "g:1"]),
            json!(["orders", "insert", {"id": 2}, "g:2"]),
            json!(["orders", "insert", {"id": 3}, "g:3"]),
        ]);
        let mut source = source(factory);
        source.connect().await.unwrap();
        let start = StartPosition::Resume {
            offset: ReplicationOffset::parse(OffsetScheme::Gtid, "g:2").unwrap(),
            token: "g:1-2".to_string(),
        };
        let events: Vec<_> = source
            .get_cdc_stream(&start)
            .await
            .unwrap()
            .collect()
            .await;

        assert_eq!(events.len(), 1);
        assert_eq!(events[0].as_ref().unwrap().offset_token, "g:3");
        assert_eq!(log.lock().unwrap().commits, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn stream_needs_a_connection() {
        let (factory, _log) = QueueFactory::new(&[]);
        let mut source = source(factory);
        assert!(matches!(
            source.get_cdc_stream(&StartPosition::Tail).await,
            Err(SourceError::NotConnected)
        ));
    }
}
