// Backend Adapter Contract
//
// Physical engines plug in behind `ChunkBackend`. The adapter is the
// only place that knows how its engine reports constraint violations;
// it hands the store an already-classified `InsertError`.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::log::{Chunk, ScanDirection};

pub mod memory;

pub use memory::InMemoryBackend;

/// Failures raised by a backend that carry no store semantics.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BackendError {
    #[error("backend unavailable: {0}")]
    Unavailable(String),

    #[error("backend failure: {0}")]
    Other(String),
}

/// Classified outcome of a rejected insert.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InsertError {
    /// `(partition_id, index)` is already taken.
    #[error("partition sequence constraint violated")]
    SequenceConflict,

    /// `(partition_id, operation_id)` is already taken.
    #[error("partition operation constraint violated")]
    DuplicateOperation,

    /// The global id is already taken.
    #[error("chunk id already in use")]
    IdCollision,

    #[error(transparent)]
    Other(#[from] BackendError),
}

/// Structural unique constraints every backend must provide.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UniqueIndex {
    /// Unique over `(partition_id, index)`.
    PartitionSequence,
    /// Unique over `(partition_id, operation_id)`.
    PartitionOperation,
}

impl UniqueIndex {
    pub const ALL: [UniqueIndex; 2] = [UniqueIndex::PartitionSequence, UniqueIndex::PartitionOperation];

    pub fn name(&self) -> &'static str {
        match self {
            UniqueIndex::PartitionSequence => "partition_sequence",
            UniqueIndex::PartitionOperation => "partition_operation",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanRange {
    /// Chunks of one partition with `from <= index <= to`.
    Partition {
        partition_id: String,
        from: i64,
        to: i64,
    },
    /// All chunks from global id `start` onwards in scan direction.
    Store { start: i64 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanQuery {
    pub range: ScanRange,
    pub direction: ScanDirection,
    pub limit: Option<usize>,
}

/// Pull cursor over a scan result, one backend batch at a time.
#[async_trait]
pub trait ChunkCursor<P>: Send {
    /// Fetch the next batch, `None` once exhausted.
    async fn next_batch(&mut self) -> Result<Option<Vec<Chunk<P>>>, BackendError>;
}

/// Storage engine behind a [`ChunkStore`](crate::log::ChunkStore).
///
/// Implementations must:
/// - enforce uniqueness of the chunk id
/// - enforce each provisioned [`UniqueIndex`]
/// - increment counters atomically, server side
#[async_trait]
pub trait ChunkBackend<P>: Send + Sync {
    /// Provision a unique index. Must be idempotent.
    async fn ensure_unique_index(&self, index: UniqueIndex) -> Result<(), BackendError>;

    async fn insert(&self, chunk: &Chunk<P>) -> Result<(), InsertError>;

    async fn open_cursor(&self, query: ScanQuery) -> Result<Box<dyn ChunkCursor<P>>, BackendError>;

    /// Delete chunks of a partition with `from <= index <= to`, returning the count.
    async fn delete_range(&self, partition_id: &str, from: i64, to: i64)
        -> Result<u64, BackendError>;

    /// Highest chunk id, 0 when empty.
    async fn max_id(&self) -> Result<i64, BackendError>;

    /// Atomic increment-and-fetch, creating the counter when missing.
    async fn increment_counter(&self, sequence_id: &str) -> Result<i64, BackendError>;

    /// Atomically raise the counter to at least `floor`.
    async fn raise_counter(&self, sequence_id: &str, floor: i64) -> Result<(), BackendError>;

    /// Drop every chunk, counter and index.
    async fn drop_all(&self) -> Result<(), BackendError>;
}
