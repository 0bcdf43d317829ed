//! Partitioned event log.
//!
//! [`PartitionLog`] hands out a producer shared by the process and one
//! [`PartitionReader`] per consumed partition. Readers are positioned
//! explicitly with `seek`; offsets are committed by the consumer after the
//! record has been applied.

use crate::error::{ServerError, ServerResult};
use async_trait::async_trait;
use std::fmt::Debug;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Notify;

/// One record read from the log
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    /// Partition the record was read from
    pub partition: i32,
    /// Offset within the partition
    pub offset: i64,
    /// Record key (the workspace id for engine events)
    pub key: Option<String>,
    /// Encoded event envelope
    pub payload: Vec<u8>,
}

/// Appends records to the log
#[async_trait]
pub trait LogProducer: Send + Sync + Debug {
    /// Append a record; returns its offset
    async fn append(&self, partition: i32, key: &str, payload: Vec<u8>) -> ServerResult<i64>;
}

/// Sequential reader of a single partition
#[async_trait]
pub trait PartitionReader: Send + Sync + Debug {
    /// Partition being read
    fn partition(&self) -> i32;

    /// Position the reader so the next record returned is at `offset`
    async fn seek(&mut self, offset: i64) -> ServerResult<()>;

    /// Next record, or `None` if nothing arrived within `wait`
    async fn poll(&mut self, wait: Duration) -> ServerResult<Option<LogRecord>>;

    /// Mark everything up to and including `offset` as processed
    async fn commit(&mut self, offset: i64) -> ServerResult<()>;
}

/// A partitioned log
pub trait PartitionLog: Send + Sync + Debug {
    /// Partition count
    fn num_partitions(&self) -> i32;

    /// Shared producer
    fn producer(&self) -> Arc<dyn LogProducer>;

    /// New reader for `partition`, positioned at the start
    fn reader(&self, partition: i32) -> ServerResult<Box<dyn PartitionReader>>;
}

#[derive(Debug)]
struct MemoryPartition {
    records: Mutex<Vec<LogRecord>>,
    committed: Mutex<Option<i64>>,
    appended: Notify,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Log held in process memory
#[derive(Debug, Clone)]
pub struct InMemoryPartitionLog {
    partitions: Arc<Vec<MemoryPartition>>,
}

impl InMemoryPartitionLog {
    /// Empty log with `num_partitions` partitions
    pub fn new(num_partitions: i32) -> Self {
        let partitions = (0..num_partitions.max(1))
            .map(|_| MemoryPartition {
                records: Mutex::new(Vec::new()),
                committed: Mutex::new(None),
                appended: Notify::new(),
            })
            .collect();
        Self { partitions: Arc::new(partitions) }
    }

    fn partition(&self, partition: i32) -> ServerResult<&MemoryPartition> {
        usize::try_from(partition)
            .ok()
            .and_then(|index| self.partitions.get(index))
            .ok_or_else(|| ServerError::LogError(format!("Unknown partition {}", partition)))
    }

    /// Offset the next append to `partition` receives
    pub fn high_watermark(&self, partition: i32) -> i64 {
        self.partition(partition).map(|p| lock(&p.records).len() as i64).unwrap_or(0)
    }

    /// Last committed offset of `partition`
    pub fn committed(&self, partition: i32) -> Option<i64> {
        self.partition(partition).ok().and_then(|p| *lock(&p.committed))
    }

    /// All records of `partition`
    pub fn records(&self, partition: i32) -> Vec<LogRecord> {
        self.partition(partition).map(|p| lock(&p.records).clone()).unwrap_or_default()
    }

    fn push(&self, partition: i32, key: &str, payload: Vec<u8>) -> ServerResult<i64> {
        let target = self.partition(partition)?;
        let offset = {
            let mut records = lock(&target.records);
            let offset = records.len() as i64;
            records.push(LogRecord { partition, offset, key: Some(key.to_string()), payload });
            offset
        };
        target.appended.notify_waiters();
        Ok(offset)
    }
}

#[async_trait]
impl LogProducer for InMemoryPartitionLog {
    async fn append(&self, partition: i32, key: &str, payload: Vec<u8>) -> ServerResult<i64> {
        self.push(partition, key, payload)
    }
}

impl PartitionLog for InMemoryPartitionLog {
    fn num_partitions(&self) -> i32 {
        self.partitions.len() as i32
    }

    fn producer(&self) -> Arc<dyn LogProducer> {
        Arc::new(self.clone())
    }

    fn reader(&self, partition: i32) -> ServerResult<Box<dyn PartitionReader>> {
        self.partition(partition)?;
        Ok(Box::new(InMemoryPartitionReader { log: self.clone(), partition, position: 0 }))
    }
}

/// Reader over an [`InMemoryPartitionLog`] partition
#[derive(Debug)]
pub struct InMemoryPartitionReader {
    log: InMemoryPartitionLog,
    partition: i32,
    position: i64,
}

#[async_trait]
impl PartitionReader for InMemoryPartitionReader {
    fn partition(&self) -> i32 {
        self.partition
    }

    async fn seek(&mut self, offset: i64) -> ServerResult<()> {
        self.position = offset.max(0);
        Ok(())
    }

    async fn poll(&mut self, wait: Duration) -> ServerResult<Option<LogRecord>> {
        let partition = self.log.partition(self.partition)?;
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            let appended = partition.appended.notified();
            let next = lock(&partition.records).get(self.position as usize).cloned();
            if let Some(record) = next {
                self.position += 1;
                return Ok(Some(record));
            }
            if tokio::time::timeout_at(deadline, appended).await.is_err() {
                return Ok(None);
            }
        }
    }

    async fn commit(&mut self, offset: i64) -> ServerResult<()> {
        let partition = self.log.partition(self.partition)?;
        let mut committed = lock(&partition.committed);
        *committed = Some(committed.map_or(offset, |current| current.max(offset)));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_append_and_read_from_offset() {
        let log = InMemoryPartitionLog::new(2);
        for i in 0..5 {
            log.producer().append(1, "ws", vec![i]).await.unwrap();
        }
        assert_eq!(log.high_watermark(1), 5);
        assert_eq!(log.high_watermark(0), 0);

        let mut reader = log.reader(1).unwrap();
        reader.seek(3).await.unwrap();
        let record = reader.poll(Duration::from_millis(10)).await.unwrap().unwrap();
        assert_eq!((record.offset, record.payload.clone()), (3, vec![3]));
        assert_eq!(reader.poll(Duration::from_millis(10)).await.unwrap().unwrap().offset, 4);
        assert!(reader.poll(Duration::from_millis(10)).await.unwrap().is_none());

        reader.commit(4).await.unwrap();
        reader.commit(2).await.unwrap();
        assert_eq!(log.committed(1), Some(4));
    }

    #[tokio::test]
    async fn test_poll_wakes_on_append() {
        let log = InMemoryPartitionLog::new(1);
        let mut reader = log.reader(0).unwrap();
        let producer = log.producer();
        let writer = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            producer.append(0, "ws", b"late".to_vec()).await.unwrap();
        });
        let record = reader.poll(Duration::from_secs(5)).await.unwrap();
        assert_eq!(record.unwrap().payload, b"late".to_vec());
        writer.await.unwrap();
    }

    #[test]
    fn test_unknown_partition() {
        let log = InMemoryPartitionLog::new(1);
        assert!(log.reader(3).is_err());
        assert!(log.reader(-1).is_err());
    }
}
