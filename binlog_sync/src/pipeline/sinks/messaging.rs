use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use serde_json::json;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::{conversions::change_event::ChangeEvent, table::TableConfig};

use super::{Sink, SinkError};

/// Whether `write` waits for the broker to acknowledge each message before
/// reporting success (and thereby letting the offset advance).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryGuarantee {
    FireAndForget,
    Acknowledged,
}

impl DeliveryGuarantee {
    pub fn from_acks(acks: i32) -> Self {
        if acks == 0 {
            DeliveryGuarantee::FireAndForget
        } else {
            DeliveryGuarantee::Acknowledged
        }
    }
}

#[async_trait]
pub trait TopicProducer: Send + Sync {
    async fn send(
        &self,
        key: Option<&str>,
        payload: &[u8],
        await_ack: bool,
    ) -> Result<(), SinkError>;

    async fn flush(&self) -> Result<(), SinkError> {
        Ok(())
    }
}

pub trait ProducerFactory: Send + Sync {
    type Producer: TopicProducer + 'static;

    fn create(&self, topic: &str) -> Result<Self::Producer, SinkError>;
}

/// Publishes every event to a topic named after its source table.
///
/// Producers are created on first use of a topic and cached for the life of
/// the sink.
pub struct MessagingSink<F: ProducerFactory> {
    factory: F,
    delivery: DeliveryGuarantee,
    topic_prefix: Option<String>,
    tables: HashMap<String, TableConfig>,
    producers: Mutex<HashMap<String, Arc<F::Producer>>>,
}

impl<F: ProducerFactory> MessagingSink<F> {
    pub fn new(
        factory: F,
        delivery: DeliveryGuarantee,
        topic_prefix: Option<String>,
        tables: HashMap<String, TableConfig>,
    ) -> Self {
        MessagingSink {
            factory,
            delivery,
            topic_prefix,
            tables,
            producers: Mutex::new(HashMap::new()),
        }
    }

    fn topic_for(&self, event: &ChangeEvent) -> String {
        let name = self
            .tables
            .get(&event.table.name)
            .and_then(|t| t.target.as_deref())
            .unwrap_or(&event.table.name);
        match self.topic_prefix.as_deref() {
            Some(prefix) if !prefix.is_empty() => format!("{prefix}.{name}"),
            _ => name.to_string(),
        }
    }

    fn message_key(&self, event: &ChangeEvent) -> Result<Option<String>, SinkError> {
        match self
            .tables
            .get(&event.table.name)
            .and_then(|t| t.primary_key.as_deref())
        {
            Some(column) => Ok(event.key_value(column)?),
            None => Ok(None),
        }
    }

    async fn producer(&self, topic: &str) -> Result<Arc<F::Producer>, SinkError> {
        let mut producers = self.producers.lock().await;
        if let Some(producer) = producers.get(topic) {
            return Ok(producer.clone());
        }
        let producer = Arc::new(self.factory.create(topic)?);
        info!(topic, "created producer");
        producers.insert(topic.to_string(), producer.clone());
        Ok(producer)
    }

    pub async fn topics(&self) -> Vec<String> {
        let mut topics: Vec<String> = self.producers.lock().await.keys().cloned().collect();
        topics.sort();
        topics
    }
}

#[async_trait]
impl<F: ProducerFactory> Sink for MessagingSink<F> {
    async fn write(&self, batch: &[Arc<ChangeEvent>]) -> Result<u64, SinkError> {
        let await_ack = self.delivery == DeliveryGuarantee::Acknowledged;
        let mut published = 0;
        for event in batch {
            let topic = self.topic_for(event);
            let producer = self.producer(&topic).await?;
            let payload = serde_json::to_vec(&json!([
                event.table.name,
                event.operation,
                event.values,
                event.offset.to_string(),
            ]))?;
            let key = self.message_key(event)?;
            producer.send(key.as_deref(), &payload, await_ack).await?;
            published += 1;
        }
        debug!(published, await_ack, "published batch");
        Ok(published)
    }

    async fn flush(&self) -> Result<(), SinkError> {
        let producers: Vec<_> = self.producers.lock().await.values().cloned().collect();
        for producer in producers {
            producer.flush().await?;
        }
        Ok(())
    }
}

#[cfg(feature = "kafka")]
pub use kafka::{KafkaProducerFactory, KafkaTopicProducer};

#[cfg(feature = "kafka")]
mod kafka {
    use std::time::Duration;

    use async_trait::async_trait;
    use rdkafka::{
        producer::{FutureProducer, FutureRecord, Producer},
        ClientConfig,
    };

    use super::{ProducerFactory, SinkError, TopicProducer};

    const DELIVERY_TIMEOUT: Duration = Duration::from_secs(30);

    pub struct KafkaProducerFactory {
        config: ClientConfig,
    }

    impl KafkaProducerFactory {
        pub fn new(brokers: &str, acks: i32) -> Self {
            let mut config = ClientConfig::new();
            config
                .set("bootstrap.servers", brokers)
                .set("acks", acks.to_string())
                .set("message.timeout.ms", "30000");
            if acks < 0 {
                config.set("enable.idempotence", "true");
            }
            KafkaProducerFactory { config }
        }
    }

    impl ProducerFactory for KafkaProducerFactory {
        type Producer = KafkaTopicProducer;

        fn create(&self, topic: &str) -> Result<KafkaTopicProducer, SinkError> {
            Ok(KafkaTopicProducer {
                topic: topic.to_string(),
                producer: self.config.create()?,
            })
        }
    }

    pub struct KafkaTopicProducer {
        topic: String,
        producer: FutureProducer,
    }

    #[async_trait]
    impl TopicProducer for KafkaTopicProducer {
        async fn send(
            &self,
            key: Option<&str>,
            payload: &[u8],
            await_ack: bool,
        ) -> Result<(), SinkError> {
            let record: FutureRecord<'_, str, [u8]> = match key {
                Some(key) => FutureRecord::to(&self.topic).key(key).payload(payload),
                None => FutureRecord::to(&self.topic).payload(payload),
            };
            if await_ack {
                self.producer
                    .send(record, DELIVERY_TIMEOUT)
                    .await
                    .map_err(|(e, _)| SinkError::Kafka(e))?;
            } else {
                // the delivery future is dropped, only enqueueing can fail
                self.producer
                    .send_result(record)
                    .map_err(|(e, _)| SinkError::Kafka(e))?;
            }
            Ok(())
        }

        async fn flush(&self) -> Result<(), SinkError> {
            let producer = self.producer.clone();
            tokio::task::spawn_blocking(move || producer.flush(DELIVERY_TIMEOUT))
                .await
                .map_err(|e| SinkError::Write(e.to_string()))??;
            Ok(())
        }
    }
}
