// In-Memory Backend
//
// Reference implementation of the backend contract. Holds every
// collection behind one mutex; the lock is never held across an await.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use std::ops::Bound;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use super::{BackendError, ChunkBackend, ChunkCursor, InsertError, ScanQuery, ScanRange, UniqueIndex};
use crate::log::{Chunk, Counter, ScanDirection};

const DEFAULT_BATCH_SIZE: usize = 100;

type SequenceKey = (String, i64, i64);

#[derive(Debug)]
struct Collections<P> {
    chunks: BTreeMap<i64, Chunk<P>>,
    /// `(partition_id, index, id)`, ordered for partition scans.
    by_index: BTreeSet<SequenceKey>,
    /// `(partition_id, operation_id, id)`.
    by_operation: BTreeSet<(String, String, i64)>,
    counters: HashMap<String, Counter>,
    provisioned: HashSet<UniqueIndex>,
}

impl<P> Default for Collections<P> {
    fn default() -> Self {
        Self {
            chunks: BTreeMap::new(),
            by_index: BTreeSet::new(),
            by_operation: BTreeSet::new(),
            counters: HashMap::new(),
            provisioned: HashSet::new(),
        }
    }
}

impl<P: Clone> Collections<P> {
    fn index_taken(&self, partition_id: &str, index: i64) -> bool {
        let lower = (partition_id.to_string(), index, i64::MIN);
        let upper = (partition_id.to_string(), index, i64::MAX);
        self.by_index.range(lower..=upper).next().is_some()
    }

    fn operation_taken(&self, partition_id: &str, operation_id: &str) -> bool {
        let lower = (partition_id.to_string(), operation_id.to_string(), i64::MIN);
        let upper = (partition_id.to_string(), operation_id.to_string(), i64::MAX);
        self.by_operation.range(lower..=upper).next().is_some()
    }

    fn insert(&mut self, chunk: &Chunk<P>) -> Result<(), InsertError> {
        if self.chunks.contains_key(&chunk.id) {
            return Err(InsertError::IdCollision);
        }
        // A replayed operation is reported as such even when its index collides too.
        if self.provisioned.contains(&UniqueIndex::PartitionOperation)
            && self.operation_taken(&chunk.partition_id, &chunk.operation_id)
        {
            return Err(InsertError::DuplicateOperation);
        }
        if self.provisioned.contains(&UniqueIndex::PartitionSequence)
            && self.index_taken(&chunk.partition_id, chunk.index)
        {
            return Err(InsertError::SequenceConflict);
        }

        self.by_index
            .insert((chunk.partition_id.clone(), chunk.index, chunk.id));
        self.by_operation
            .insert((chunk.partition_id.clone(), chunk.operation_id.clone(), chunk.id));
        self.chunks.insert(chunk.id, chunk.clone());
        Ok(())
    }

    fn remove(&mut self, id: i64) -> bool {
        match self.chunks.remove(&id) {
            Some(chunk) => {
                self.by_index
                    .remove(&(chunk.partition_id.clone(), chunk.index, chunk.id));
                self.by_operation
                    .remove(&(chunk.partition_id, chunk.operation_id, chunk.id));
                true
            }
            None => false,
        }
    }
}

/// Backend keeping all state in process memory.
///
/// Unique indexes are only enforced once provisioned through
/// [`ChunkBackend::ensure_unique_index`], the same way a document store
/// behaves before its indexes exist.
#[derive(Debug)]
pub struct InMemoryBackend<P> {
    inner: Arc<Mutex<Collections<P>>>,
    batch_size: usize,
    fetched_batches: Arc<AtomicUsize>,
    injected_failures: Mutex<VecDeque<InsertError>>,
}

impl<P> Default for InMemoryBackend<P> {
    fn default() -> Self {
        Self::new()
    }
}

impl<P> InMemoryBackend<P> {
    pub fn new() -> Self {
        Self::with_batch_size(DEFAULT_BATCH_SIZE)
    }

    /// Cursors returned by this backend deliver at most `batch_size` chunks per fetch.
    pub fn with_batch_size(batch_size: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Collections::default())),
            batch_size: batch_size.max(1),
            fetched_batches: Arc::new(AtomicUsize::new(0)),
            injected_failures: Mutex::new(VecDeque::new()),
        }
    }

    /// Number of non-empty batches handed out by cursors so far.
    pub fn fetched_batches(&self) -> usize {
        self.fetched_batches.load(Ordering::SeqCst)
    }

    /// Queue a failure for an upcoming insert; queued failures are used in order.
    pub fn fail_next_insert(&self, error: InsertError) {
        self.injected_failures.lock().push_back(error);
    }

    pub fn chunk_count(&self) -> usize {
        self.inner.lock().chunks.len()
    }

    pub fn counter(&self, sequence_id: &str) -> Option<Counter> {
        self.inner.lock().counters.get(sequence_id).cloned()
    }

    pub fn is_provisioned(&self, index: UniqueIndex) -> bool {
        self.inner.lock().provisioned.contains(&index)
    }
}

impl<P: Clone> InMemoryBackend<P> {
    /// Insert bypassing the store, as a foreign writer would.
    pub fn insert_raw(&self, chunk: Chunk<P>) -> Result<(), InsertError> {
        self.inner.lock().insert(&chunk)
    }

    pub fn get(&self, id: i64) -> Option<Chunk<P>> {
        self.inner.lock().chunks.get(&id).cloned()
    }
}

#[async_trait]
impl<P> ChunkBackend<P> for InMemoryBackend<P>
where
    P: Clone + Send + Sync + 'static,
{
    async fn ensure_unique_index(&self, index: UniqueIndex) -> Result<(), BackendError> {
        self.inner.lock().provisioned.insert(index);
        Ok(())
    }

    async fn insert(&self, chunk: &Chunk<P>) -> Result<(), InsertError> {
        if let Some(error) = self.injected_failures.lock().pop_front() {
            return Err(error);
        }
        self.inner.lock().insert(chunk)
    }

    async fn open_cursor(&self, query: ScanQuery) -> Result<Box<dyn ChunkCursor<P>>, BackendError> {
        Ok(Box::new(MemoryCursor {
            inner: Arc::clone(&self.inner),
            remaining: query.limit,
            query,
            batch_size: self.batch_size,
            position: Position::Start,
            fetched_batches: Arc::clone(&self.fetched_batches),
        }))
    }

    async fn delete_range(
        &self,
        partition_id: &str,
        from: i64,
        to: i64,
    ) -> Result<u64, BackendError> {
        if from > to {
            return Ok(0);
        }
        let mut inner = self.inner.lock();
        let lower = (partition_id.to_string(), from, i64::MIN);
        let upper = (partition_id.to_string(), to, i64::MAX);
        let ids: Vec<i64> = inner
            .by_index
            .range(lower..=upper)
            .map(|(_, _, id)| *id)
            .collect();

        let mut deleted = 0;
        for id in ids {
            if inner.remove(id) {
                deleted += 1;
            }
        }
        Ok(deleted)
    }

    async fn max_id(&self) -> Result<i64, BackendError> {
        Ok(self
            .inner
            .lock()
            .chunks
            .keys()
            .next_back()
            .copied()
            .unwrap_or(0))
    }

    async fn increment_counter(&self, sequence_id: &str) -> Result<i64, BackendError> {
        let mut inner = self.inner.lock();
        let counter = inner
            .counters
            .entry(sequence_id.to_string())
            .or_insert_with(|| Counter {
                id: sequence_id.to_string(),
                last_value: 0,
            });
        counter.last_value = counter
            .last_value
            .checked_add(1)
            .ok_or_else(|| BackendError::Other(format!("counter `{sequence_id}` overflowed")))?;
        Ok(counter.last_value)
    }

    async fn raise_counter(&self, sequence_id: &str, floor: i64) -> Result<(), BackendError> {
        let mut inner = self.inner.lock();
        let counter = inner
            .counters
            .entry(sequence_id.to_string())
            .or_insert_with(|| Counter {
                id: sequence_id.to_string(),
                last_value: 0,
            });
        counter.last_value = counter.last_value.max(floor);
        Ok(())
    }

    async fn drop_all(&self) -> Result<(), BackendError> {
        *self.inner.lock() = Collections::default();
        Ok(())
    }
}

#[derive(Debug, Clone)]
enum Position {
    Start,
    AfterIndex(SequenceKey),
    AfterId(i64),
    Exhausted,
}

struct MemoryCursor<P> {
    inner: Arc<Mutex<Collections<P>>>,
    query: ScanQuery,
    batch_size: usize,
    remaining: Option<usize>,
    position: Position,
    fetched_batches: Arc<AtomicUsize>,
}

impl<P: Clone> MemoryCursor<P> {
    fn fetch(&self, take: usize) -> Vec<Chunk<P>> {
        let inner = self.inner.lock();
        match &self.query.range {
            ScanRange::Partition {
                partition_id,
                from,
                to,
            } => {
                if from > to {
                    return Vec::new();
                }
                let lower = (partition_id.clone(), *from, i64::MIN);
                let upper = (partition_id.clone(), *to, i64::MAX);
                let after = match &self.position {
                    Position::AfterIndex(key) => Some(key.clone()),
                    _ => None,
                };
                let keys: Vec<i64> = match self.query.direction {
                    ScanDirection::Forward => {
                        let start = after.map_or(Bound::Included(lower), Bound::Excluded);
                        inner
                            .by_index
                            .range((start, Bound::Included(upper)))
                            .take(take)
                            .map(|(_, _, id)| *id)
                            .collect()
                    }
                    ScanDirection::Backward => {
                        let end = after.map_or(Bound::Included(upper), Bound::Excluded);
                        inner
                            .by_index
                            .range((Bound::Included(lower), end))
                            .rev()
                            .take(take)
                            .map(|(_, _, id)| *id)
                            .collect()
                    }
                };
                keys.iter()
                    .filter_map(|id| inner.chunks.get(id).cloned())
                    .collect()
            }
            ScanRange::Store { start } => {
                let after = match self.position {
                    Position::AfterId(id) => Some(id),
                    _ => None,
                };
                match self.query.direction {
                    ScanDirection::Forward => {
                        let lower = after.map_or(Bound::Included(*start), Bound::Excluded);
                        inner
                            .chunks
                            .range((lower, Bound::Unbounded))
                            .take(take)
                            .map(|(_, chunk)| chunk.clone())
                            .collect()
                    }
                    ScanDirection::Backward => {
                        let upper = after.map_or(Bound::Included(*start), Bound::Excluded);
                        inner
                            .chunks
                            .range((Bound::Unbounded, upper))
                            .rev()
                            .take(take)
                            .map(|(_, chunk)| chunk.clone())
                            .collect()
                    }
                }
            }
        }
    }
}

#[async_trait]
impl<P> ChunkCursor<P> for MemoryCursor<P>
where
    P: Clone + Send + Sync + 'static,
{
    async fn next_batch(&mut self) -> Result<Option<Vec<Chunk<P>>>, BackendError> {
        if matches!(self.position, Position::Exhausted) {
            return Ok(None);
        }
        let take = match self.remaining {
            Some(0) => {
                self.position = Position::Exhausted;
                return Ok(None);
            }
            Some(remaining) => remaining.min(self.batch_size),
            None => self.batch_size,
        };

        let batch = self.fetch(take);
        let Some(last) = batch.last() else {
            self.position = Position::Exhausted;
            return Ok(None);
        };

        self.position = match self.query.range {
            ScanRange::Partition { .. } => {
                Position::AfterIndex((last.partition_id.clone(), last.index, last.id))
            }
            ScanRange::Store { .. } => Position::AfterId(last.id),
        };
        if let Some(remaining) = self.remaining.as_mut() {
            *remaining -= batch.len();
        }
        self.fetched_batches.fetch_add(1, Ordering::SeqCst);
        Ok(Some(batch))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(id: i64, partition_id: &str, index: i64, operation_id: &str) -> Chunk<&'static str> {
        Chunk {
            id,
            partition_id: partition_id.to_string(),
            index,
            payload: Some("payload"),
            operation_id: operation_id.to_string(),
        }
    }

    async fn provisioned() -> InMemoryBackend<&'static str> {
        let backend = InMemoryBackend::with_batch_size(2);
        for index in UniqueIndex::ALL {
            backend.ensure_unique_index(index).await.unwrap();
        }
        backend
    }

    async fn drain(mut cursor: Box<dyn ChunkCursor<&'static str>>) -> Vec<i64> {
        let mut ids = Vec::new();
        while let Some(batch) = cursor.next_batch().await.unwrap() {
            ids.extend(batch.iter().map(|c| c.id));
        }
        ids
    }

    #[tokio::test]
    async fn classifies_each_constraint() {
        let backend = provisioned().await;
        backend.insert(&chunk(1, "a", 1, "op-1")).await.unwrap();

        assert_eq!(
            backend.insert(&chunk(1, "b", 1, "op-9")).await,
            Err(InsertError::IdCollision)
        );
        assert_eq!(
            backend.insert(&chunk(2, "a", 1, "op-2")).await,
            Err(InsertError::SequenceConflict)
        );
        assert_eq!(
            backend.insert(&chunk(2, "a", 2, "op-1")).await,
            Err(InsertError::DuplicateOperation)
        );
        // Same index and operation in another partition is fine.
        backend.insert(&chunk(2, "b", 1, "op-1")).await.unwrap();
    }

    #[tokio::test]
    async fn constraints_apply_only_once_provisioned() {
        let backend = InMemoryBackend::new();
        backend.insert(&chunk(1, "a", 1, "op")).await.unwrap();
        backend.insert(&chunk(2, "a", 1, "op")).await.unwrap();

        assert_eq!(backend.chunk_count(), 2);
    }

    #[tokio::test]
    async fn partition_cursor_pages_in_both_directions() {
        let backend = provisioned().await;
        for (id, index) in [(1, 3), (2, 1), (3, 2), (4, 5), (5, 4)] {
            backend
                .insert(&chunk(id, "p", index, &format!("op-{id}")))
                .await
                .unwrap();
        }
        backend.insert(&chunk(6, "other", 1, "op-6")).await.unwrap();

        let forward = ScanQuery {
            range: ScanRange::Partition {
                partition_id: "p".into(),
                from: 2,
                to: 4,
            },
            direction: ScanDirection::Forward,
            limit: None,
        };
        assert_eq!(drain(backend.open_cursor(forward.clone()).await.unwrap()).await, vec![3, 1, 5]);

        let backward = ScanQuery {
            direction: ScanDirection::Backward,
            ..forward
        };
        assert_eq!(drain(backend.open_cursor(backward).await.unwrap()).await, vec![5, 1, 3]);
    }

    #[tokio::test]
    async fn store_cursor_respects_limit() {
        let backend = provisioned().await;
        for id in 1..=5 {
            backend
                .insert(&chunk(id, "p", id, &format!("op-{id}")))
                .await
                .unwrap();
        }

        let query = ScanQuery {
            range: ScanRange::Store { start: 4 },
            direction: ScanDirection::Backward,
            limit: Some(3),
        };
        assert_eq!(drain(backend.open_cursor(query).await.unwrap()).await, vec![4, 3, 2]);
    }

    #[tokio::test]
    async fn delete_range_counts_removed_chunks() {
        let backend = provisioned().await;
        for id in 1..=4 {
            backend
                .insert(&chunk(id, "p", id, &format!("op-{id}")))
                .await
                .unwrap();
        }

        assert_eq!(backend.delete_range("p", 2, 3).await.unwrap(), 2);
        assert_eq!(backend.delete_range("p", 2, 3).await.unwrap(), 0);
        assert_eq!(backend.chunk_count(), 2);

        // Freed slots can be reused.
        backend.insert(&chunk(9, "p", 2, "op-2")).await.unwrap();
    }

    #[tokio::test]
    async fn counters_increment_and_raise() {
        let backend: InMemoryBackend<&'static str> = InMemoryBackend::new();

        assert_eq!(backend.increment_counter("streams").await.unwrap(), 1);
        assert_eq!(backend.increment_counter("streams").await.unwrap(), 2);

        backend.raise_counter("streams", 10).await.unwrap();
        backend.raise_counter("streams", 3).await.unwrap();
        assert_eq!(backend.increment_counter("streams").await.unwrap(), 11);
    }

    #[tokio::test]
    async fn exhausted_counter_is_a_backend_failure() {
        let backend: InMemoryBackend<&'static str> = InMemoryBackend::new();
        backend.raise_counter("streams", i64::MAX).await.unwrap();

        let err = backend.increment_counter("streams").await.unwrap_err();

        assert!(matches!(err, BackendError::Other(ref message) if message.contains("streams")));
        assert_eq!(backend.counter("streams").unwrap().last_value, i64::MAX);
    }

    #[tokio::test]
    async fn drop_all_clears_indexes() {
        let backend = provisioned().await;
        backend.insert(&chunk(1, "p", 1, "op")).await.unwrap();

        backend.drop_all().await.unwrap();

        assert_eq!(backend.chunk_count(), 0);
        assert_eq!(backend.max_id().await.unwrap(), 0);
        assert!(!backend.is_provisioned(UniqueIndex::PartitionSequence));
    }
}
