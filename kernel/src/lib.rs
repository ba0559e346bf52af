// Chunklog Kernel
//
// Append-only partitioned event log with global ordering, optimistic
// concurrency and idempotent writes, plus the aggregate model on top.

pub mod adapters;
pub mod aggregate;
pub mod config;
pub mod log;
pub mod replay;
pub mod stream;

pub use adapters::{BackendError, ChunkBackend, InMemoryBackend};
pub use aggregate::{Aggregate, AggregateError, AggregatePersister, AggregateState, Changeset};
pub use config::StoreConfig;
pub use log::{Chunk, ChunkStore, RawStore, ScanAction, ScanDirection, StoreError};
pub use replay::{replay_aggregate, ReplayError, Repository};
pub use stream::{
    AppendStream, OptimisticAppendStream, OptimisticConcurrencyStream, ReadOnlyStream, ReadStream,
    Stream, StreamStore,
};
