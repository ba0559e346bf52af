// Partitioned Chunk Log
//
// Core record types for the append-only log: chunks, counters,
// scan directions and the observers that consume scans.

use serde::{Deserialize, Serialize};
use std::future::Future;
use tokio_util::sync::CancellationToken;

use crate::adapters::BackendError;

pub mod chunk_store;
pub mod sequencer;
pub mod store;

pub use chunk_store::ChunkStore;
pub use sequencer::Sequencer;
pub use store::RawStore;

/// Reserved partition holding idempotent-replay placeholders.
pub const EMPTY_PARTITION: &str = "_empty";

/// Sentinel index asking the store to assign `index = id`.
pub const AUTO_INDEX: i64 = -1;

/// One stored record with its global and partition-local position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk<P> {
    pub id: i64,
    pub partition_id: String,
    pub index: i64,
    pub payload: Option<P>,
    pub operation_id: String,
}

impl<P> Chunk<P> {
    /// Placeholder written when an operation id was already applied.
    ///
    /// Keeps the global sequence contiguous without repeating the
    /// original payload.
    pub fn placeholder(id: i64) -> Self {
        Self {
            id,
            partition_id: EMPTY_PARTITION.to_string(),
            index: id,
            payload: None,
            operation_id: format!("_{id}"),
        }
    }

    pub fn is_placeholder(&self) -> bool {
        self.partition_id == EMPTY_PARTITION
    }
}

/// Backend-coordinated sequence state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Counter {
    pub id: String,
    pub last_value: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScanDirection {
    Forward,
    Backward,
}

/// Returned by observers to drive a scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanAction {
    Continue,
    Stop,
}

/// Receives `(index, payload)` for each chunk of a partition scan.
pub trait PartitionObserver<P>: Send {
    fn observe(&mut self, index: i64, payload: Option<&P>) -> ScanAction;
}

impl<P, F> PartitionObserver<P> for F
where
    F: FnMut(i64, Option<&P>) -> ScanAction + Send,
{
    fn observe(&mut self, index: i64, payload: Option<&P>) -> ScanAction {
        self(index, payload)
    }
}

/// Receives `(id, partition_id, index, payload)` for each chunk of a store scan.
pub trait StoreObserver<P>: Send {
    fn observe(&mut self, id: i64, partition_id: &str, index: i64, payload: Option<&P>)
        -> ScanAction;
}

impl<P, F> StoreObserver<P> for F
where
    F: FnMut(i64, &str, i64, Option<&P>) -> ScanAction + Send,
{
    fn observe(
        &mut self,
        id: i64,
        partition_id: &str,
        index: i64,
        payload: Option<&P>,
    ) -> ScanAction {
        self(id, partition_id, index, payload)
    }
}

/// A single observation captured by [`Recorder`].
#[derive(Debug, Clone, PartialEq)]
pub struct Recorded<P> {
    /// Global id, only known for store scans.
    pub id: Option<i64>,
    /// Partition, only known for store scans.
    pub partition_id: Option<String>,
    pub index: i64,
    pub payload: Option<P>,
}

/// Observer that collects everything it sees, optionally stopping early.
#[derive(Debug, Clone)]
pub struct Recorder<P> {
    entries: Vec<Recorded<P>>,
    stop_after: Option<usize>,
}

impl<P> Default for Recorder<P> {
    fn default() -> Self {
        Self::new()
    }
}

impl<P> Recorder<P> {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
            stop_after: None,
        }
    }

    /// Signal `Stop` once `count` items have been recorded.
    pub fn stopping_after(count: usize) -> Self {
        Self {
            entries: Vec::new(),
            stop_after: Some(count),
        }
    }

    pub fn entries(&self) -> &[Recorded<P>] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn indexes(&self) -> Vec<i64> {
        self.entries.iter().map(|e| e.index).collect()
    }

    pub fn payloads(&self) -> Vec<&P> {
        self.entries.iter().filter_map(|e| e.payload.as_ref()).collect()
    }

    fn push(&mut self, entry: Recorded<P>) -> ScanAction {
        self.entries.push(entry);
        match self.stop_after {
            Some(limit) if self.entries.len() >= limit => ScanAction::Stop,
            _ => ScanAction::Continue,
        }
    }
}

impl<P: Clone + Send> PartitionObserver<P> for Recorder<P> {
    fn observe(&mut self, index: i64, payload: Option<&P>) -> ScanAction {
        self.push(Recorded {
            id: None,
            partition_id: None,
            index,
            payload: payload.cloned(),
        })
    }
}

impl<P: Clone + Send> StoreObserver<P> for Recorder<P> {
    fn observe(
        &mut self,
        id: i64,
        partition_id: &str,
        index: i64,
        payload: Option<&P>,
    ) -> ScanAction {
        self.push(Recorded {
            id: Some(id),
            partition_id: Some(partition_id.to_string()),
            index,
            payload: payload.cloned(),
        })
    }
}

/// Errors surfaced by the raw store.
///
/// Backend-specific failures are classified once at the store boundary;
/// nothing above it sees backend error shapes.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("index {index} already taken in partition `{partition_id}`")]
    DuplicateIndex { partition_id: String, index: i64 },

    #[error("partition `{partition_id}` is reserved for replay placeholders")]
    ReservedPartition { partition_id: String },

    #[error("nothing to delete in partition `{partition_id}`")]
    DeleteNotFound { partition_id: String },

    #[error("sequence still stale after {attempts} reloads (last id {last_id})")]
    SequenceExhausted { attempts: u32, last_id: i64 },

    #[error("operation cancelled")]
    Cancelled,

    #[error(transparent)]
    Backend(#[from] BackendError),
}

/// Race a backend call against cancellation.
pub(crate) async fn guarded<T, E, F>(cancel: &CancellationToken, call: F) -> Result<T, StoreError>
where
    F: Future<Output = Result<T, E>>,
    E: Into<StoreError>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(StoreError::Cancelled),
        result = call => result.map_err(Into::into),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn placeholder_uses_reserved_partition() {
        let chunk: Chunk<String> = Chunk::placeholder(42);

        assert!(chunk.is_placeholder());
        assert_eq!(chunk.index, 42);
        assert_eq!(chunk.operation_id, "_42");
        assert!(chunk.payload.is_none());
    }

    #[test]
    fn recorder_stops_after_limit() {
        let mut recorder = Recorder::<u32>::stopping_after(2);

        assert_eq!(
            PartitionObserver::observe(&mut recorder, 1, Some(&10)),
            ScanAction::Continue
        );
        assert_eq!(
            PartitionObserver::observe(&mut recorder, 2, Some(&20)),
            ScanAction::Stop
        );
        assert_eq!(recorder.indexes(), vec![1, 2]);
        assert_eq!(recorder.payloads(), vec![&10, &20]);
    }

    #[test]
    fn closures_are_observers() {
        let mut seen = Vec::new();
        let mut observer = |index: i64, _: Option<&u32>| {
            seen.push(index);
            ScanAction::Continue
        };

        assert_eq!(
            PartitionObserver::observe(&mut observer, 7, None),
            ScanAction::Continue
        );
        drop(observer);
        assert_eq!(seen, vec![7]);
    }

    #[tokio::test]
    async fn guarded_call_reports_cancellation() {
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = guarded(&cancel, std::future::pending::<Result<(), BackendError>>()).await;
        assert!(matches!(result, Err(StoreError::Cancelled)));
    }
}
