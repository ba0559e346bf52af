// Raw Store Contract
//
// The durability contract for partitioned chunks. Streams and the
// aggregate repository only ever talk to this trait.

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use super::{PartitionObserver, ScanDirection, StoreError, StoreObserver};

/// Append/scan/delete access to the chunk log.
///
/// Guarantees required from implementations:
/// - global ids are unique and increase in insertion order
/// - `(partition_id, index)` is unique
/// - `(partition_id, operation_id)` is unique; replays have no second effect
///
/// Every operation accepts a cancellation token that aborts the in-flight
/// backend call. Writes already made durable are not rolled back.
#[async_trait]
pub trait RawStore<P>: Send + Sync {
    /// Append `payload` to a partition and return its global id.
    ///
    /// A negative `index` lets the store use the assigned id as index.
    /// A missing `operation_id` is replaced by a fresh unique token.
    async fn persist(
        &self,
        partition_id: &str,
        index: i64,
        payload: P,
        operation_id: Option<String>,
        cancel: &CancellationToken,
    ) -> Result<i64, StoreError>;

    /// Stream chunks of one partition with `from <= index <= to`, ordered by index.
    async fn scan_partition(
        &self,
        partition_id: &str,
        from_index_inclusive: i64,
        to_index_inclusive: i64,
        direction: ScanDirection,
        limit: Option<usize>,
        observer: &mut dyn PartitionObserver<P>,
        cancel: &CancellationToken,
    ) -> Result<(), StoreError>;

    /// Stream chunks of every partition ordered by global id, starting at `sequence_start`.
    async fn scan_store(
        &self,
        sequence_start: i64,
        direction: ScanDirection,
        limit: Option<usize>,
        observer: &mut dyn StoreObserver<P>,
        cancel: &CancellationToken,
    ) -> Result<(), StoreError>;

    /// Remove chunks of a partition with `from <= index <= to`.
    ///
    /// Fails with [`StoreError::DeleteNotFound`] when nothing matched.
    async fn delete(
        &self,
        partition_id: &str,
        from_index: i64,
        to_index: i64,
        cancel: &CancellationToken,
    ) -> Result<u64, StoreError>;

    /// Remove a whole partition.
    async fn delete_partition(
        &self,
        partition_id: &str,
        cancel: &CancellationToken,
    ) -> Result<u64, StoreError> {
        self.delete(partition_id, 0, i64::MAX, cancel).await
    }

    /// Provision unique constraints and prime the sequence. Idempotent.
    async fn init(&self, cancel: &CancellationToken) -> Result<(), StoreError>;

    /// Irreversibly wipe all persisted state.
    async fn destroy(&self, cancel: &CancellationToken) -> Result<(), StoreError>;
}
