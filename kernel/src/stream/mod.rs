// Partition Streams
//
// Views over one partition of a raw store. The three stream kinds
// differ only in the capabilities they expose: read, append, or
// append at an expected index.

use async_trait::async_trait;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::log::{PartitionObserver, RawStore, ScanDirection, StoreError, AUTO_INDEX};

/// Read capability.
#[async_trait]
pub trait ReadStream<P>: Send + Sync {
    /// Partition this stream is bound to.
    fn id(&self) -> &str;

    /// Feed chunks with `from <= index <= to` to `observer`, in index order.
    async fn read(
        &self,
        observer: &mut dyn PartitionObserver<P>,
        from_index_inclusive: i64,
        to_index_inclusive: i64,
        cancel: &CancellationToken,
    ) -> Result<(), StoreError>;

    async fn read_all(
        &self,
        observer: &mut dyn PartitionObserver<P>,
        cancel: &CancellationToken,
    ) -> Result<(), StoreError> {
        self.read(observer, 0, i64::MAX, cancel).await
    }
}

/// Append at the next index, without concurrency checks.
#[async_trait]
pub trait AppendStream<P>: ReadStream<P> {
    async fn append(
        &self,
        payload: P,
        operation_id: Option<String>,
        cancel: &CancellationToken,
    ) -> Result<i64, StoreError>;
}

/// Append at an index the caller expects to be free.
#[async_trait]
pub trait OptimisticAppendStream<P>: ReadStream<P> {
    /// Fails with [`StoreError::DuplicateIndex`] when another writer got there first.
    async fn append(
        &self,
        payload: P,
        expected_index: i64,
        operation_id: Option<String>,
        cancel: &CancellationToken,
    ) -> Result<i64, StoreError>;
}

struct Partition<P> {
    id: String,
    raw: Arc<dyn RawStore<P>>,
}

impl<P> Clone for Partition<P> {
    fn clone(&self) -> Self {
        Self {
            id: self.id.clone(),
            raw: Arc::clone(&self.raw),
        }
    }
}

impl<P: Send + Sync + 'static> Partition<P> {
    async fn read(
        &self,
        observer: &mut dyn PartitionObserver<P>,
        from: i64,
        to: i64,
        cancel: &CancellationToken,
    ) -> Result<(), StoreError> {
        self.raw
            .scan_partition(&self.id, from, to, ScanDirection::Forward, None, observer, cancel)
            .await
    }

    async fn persist(
        &self,
        index: i64,
        payload: P,
        operation_id: Option<String>,
        cancel: &CancellationToken,
    ) -> Result<i64, StoreError> {
        self.raw
            .persist(&self.id, index, payload, operation_id, cancel)
            .await
    }

    async fn delete(&self, cancel: &CancellationToken) -> Result<u64, StoreError> {
        self.raw.delete_partition(&self.id, cancel).await
    }
}

macro_rules! impl_read_stream {
    ($stream:ident) => {
        #[async_trait]
        impl<P: Send + Sync + 'static> ReadStream<P> for $stream<P> {
            fn id(&self) -> &str {
                &self.partition.id
            }

            async fn read(
                &self,
                observer: &mut dyn PartitionObserver<P>,
                from_index_inclusive: i64,
                to_index_inclusive: i64,
                cancel: &CancellationToken,
            ) -> Result<(), StoreError> {
                self.partition
                    .read(observer, from_index_inclusive, to_index_inclusive, cancel)
                    .await
            }
        }
    };
}

/// Stream that can only be read.
#[derive(Clone)]
pub struct ReadOnlyStream<P> {
    partition: Partition<P>,
}

impl_read_stream!(ReadOnlyStream);

/// Stream appending at the next free position.
#[derive(Clone)]
pub struct Stream<P> {
    partition: Partition<P>,
}

impl_read_stream!(Stream);

impl<P: Send + Sync + 'static> Stream<P> {
    /// Remove every chunk of the partition.
    pub async fn delete(&self, cancel: &CancellationToken) -> Result<u64, StoreError> {
        self.partition.delete(cancel).await
    }
}

#[async_trait]
impl<P: Send + Sync + 'static> AppendStream<P> for Stream<P> {
    async fn append(
        &self,
        payload: P,
        operation_id: Option<String>,
        cancel: &CancellationToken,
    ) -> Result<i64, StoreError> {
        self.partition
            .persist(AUTO_INDEX, payload, operation_id, cancel)
            .await
    }
}

/// Stream appending at caller-chosen indexes, detecting concurrent writers.
#[derive(Clone)]
pub struct OptimisticConcurrencyStream<P> {
    partition: Partition<P>,
}

impl_read_stream!(OptimisticConcurrencyStream);

impl<P: Send + Sync + 'static> OptimisticConcurrencyStream<P> {
    /// Remove every chunk of the partition.
    pub async fn delete(&self, cancel: &CancellationToken) -> Result<u64, StoreError> {
        self.partition.delete(cancel).await
    }
}

#[async_trait]
impl<P: Send + Sync + 'static> OptimisticAppendStream<P> for OptimisticConcurrencyStream<P> {
    async fn append(
        &self,
        payload: P,
        expected_index: i64,
        operation_id: Option<String>,
        cancel: &CancellationToken,
    ) -> Result<i64, StoreError> {
        self.partition
            .persist(expected_index, payload, operation_id, cancel)
            .await
    }
}

/// Opens streams over one shared raw store.
pub struct StreamStore<P> {
    raw: Arc<dyn RawStore<P>>,
}

impl<P> Clone for StreamStore<P> {
    fn clone(&self) -> Self {
        Self {
            raw: Arc::clone(&self.raw),
        }
    }
}

impl<P: Send + Sync + 'static> StreamStore<P> {
    pub fn new(raw: Arc<dyn RawStore<P>>) -> Self {
        Self { raw }
    }

    pub fn raw(&self) -> &Arc<dyn RawStore<P>> {
        &self.raw
    }

    fn partition(&self, stream_id: &str) -> Partition<P> {
        Partition {
            id: stream_id.to_string(),
            raw: Arc::clone(&self.raw),
        }
    }

    pub fn open(&self, stream_id: &str) -> Stream<P> {
        Stream {
            partition: self.partition(stream_id),
        }
    }

    pub fn open_optimistic(&self, stream_id: &str) -> OptimisticConcurrencyStream<P> {
        OptimisticConcurrencyStream {
            partition: self.partition(stream_id),
        }
    }

    pub fn open_read_only(&self, stream_id: &str) -> ReadOnlyStream<P> {
        ReadOnlyStream {
            partition: self.partition(stream_id),
        }
    }
}
