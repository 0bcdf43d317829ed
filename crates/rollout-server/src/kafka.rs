//! Kafka-backed partition log

use crate::config::ServerConfig;
use crate::error::{ServerError, ServerResult};
use crate::log::{LogProducer, LogRecord, PartitionLog, PartitionReader};
use async_trait::async_trait;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::error::KafkaError;
use rdkafka::message::Message;
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::util::Timeout;
use rdkafka::{Offset, TopicPartitionList};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

const SEND_TIMEOUT: Duration = Duration::from_secs(10);

fn log_error(e: KafkaError) -> ServerError {
    ServerError::LogError(e.to_string())
}

/// Kafka topic used as the partitioned event log
#[derive(Clone)]
pub struct KafkaPartitionLog {
    brokers: String,
    topic: String,
    group_id: String,
    num_partitions: i32,
    producer: Arc<KafkaProducer>,
}

impl KafkaPartitionLog {
    /// Connect the producer; readers connect on demand
    pub fn connect(config: &ServerConfig) -> ServerResult<Self> {
        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", &config.log_brokers)
            .set("message.timeout.ms", "10000")
            .set("enable.idempotence", "true")
            .create()
            .map_err(log_error)?;
        info!(brokers = %config.log_brokers, topic = %config.log_topic, "Connected Kafka producer");
        Ok(Self {
            brokers: config.log_brokers.clone(),
            topic: config.log_topic.clone(),
            group_id: config.log_group_id.clone(),
            num_partitions: config.log_num_partitions,
            producer: Arc::new(KafkaProducer { producer, topic: config.log_topic.clone() }),
        })
    }
}

impl fmt::Debug for KafkaPartitionLog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KafkaPartitionLog")
            .field("brokers", &self.brokers)
            .field("topic", &self.topic)
            .field("num_partitions", &self.num_partitions)
            .finish()
    }
}

impl PartitionLog for KafkaPartitionLog {
    fn num_partitions(&self) -> i32 {
        self.num_partitions
    }

    fn producer(&self) -> Arc<dyn LogProducer> {
        self.producer.clone()
    }

    fn reader(&self, partition: i32) -> ServerResult<Box<dyn PartitionReader>> {
        let consumer: StreamConsumer = ClientConfig::new()
            .set("bootstrap.servers", &self.brokers)
            .set("group.id", &self.group_id)
            .set("enable.auto.commit", "false")
            .set("auto.offset.reset", "earliest")
            .create()
            .map_err(log_error)?;
        Ok(Box::new(KafkaPartitionReader { consumer, topic: self.topic.clone(), partition }))
    }
}

struct KafkaProducer {
    producer: FutureProducer,
    topic: String,
}

impl fmt::Debug for KafkaProducer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KafkaProducer").field("topic", &self.topic).finish()
    }
}

#[async_trait]
impl LogProducer for KafkaProducer {
    async fn append(&self, partition: i32, key: &str, payload: Vec<u8>) -> ServerResult<i64> {
        let record = FutureRecord::to(&self.topic).partition(partition).key(key).payload(&payload);
        let (_, offset) = self
            .producer
            .send(record, Timeout::After(SEND_TIMEOUT))
            .await
            .map_err(|(e, _)| log_error(e))?;
        Ok(offset)
    }
}

/// Reader assigned to one partition of the topic
pub struct KafkaPartitionReader {
    consumer: StreamConsumer,
    topic: String,
    partition: i32,
}

impl fmt::Debug for KafkaPartitionReader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KafkaPartitionReader")
            .field("topic", &self.topic)
            .field("partition", &self.partition)
            .finish()
    }
}

impl KafkaPartitionReader {
    fn partition_list(&self, offset: i64) -> ServerResult<TopicPartitionList> {
        let mut list = TopicPartitionList::new();
        list.add_partition_offset(&self.topic, self.partition, Offset::Offset(offset))
            .map_err(log_error)?;
        Ok(list)
    }
}

#[async_trait]
impl PartitionReader for KafkaPartitionReader {
    fn partition(&self) -> i32 {
        self.partition
    }

    async fn seek(&mut self, offset: i64) -> ServerResult<()> {
        let list = self.partition_list(offset.max(0))?;
        self.consumer.assign(&list).map_err(log_error)?;
        debug!(topic = %self.topic, partition = self.partition, offset, "Assigned partition");
        Ok(())
    }

    async fn poll(&mut self, wait: Duration) -> ServerResult<Option<LogRecord>> {
        match tokio::time::timeout(wait, self.consumer.recv()).await {
            Err(_) => Ok(None),
            Ok(Err(e)) => Err(log_error(e)),
            Ok(Ok(message)) => Ok(Some(LogRecord {
                partition: message.partition(),
                offset: message.offset(),
                key: message.key().map(|key| String::from_utf8_lossy(key).into_owned()),
                payload: message.payload().map(<[u8]>::to_vec).unwrap_or_default(),
            })),
        }
    }

    async fn commit(&mut self, offset: i64) -> ServerResult<()> {
        let list = self.partition_list(offset + 1)?;
        self.consumer.commit(&list, CommitMode::Async).map_err(log_error)
    }
}
