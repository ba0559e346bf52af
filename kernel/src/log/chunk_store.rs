// Chunk Store
//
// RawStore over any ChunkBackend. Assigns global ids, classifies
// rejected inserts and drives scans as pull cursors.

use async_trait::async_trait;
use std::marker::PhantomData;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{
    guarded, Chunk, PartitionObserver, RawStore, ScanAction, ScanDirection, Sequencer, StoreError,
    StoreObserver, EMPTY_PARTITION,
};
use crate::adapters::{ChunkBackend, InsertError, ScanQuery, ScanRange, UniqueIndex};
use crate::config::StoreConfig;

/// Raw store backed by a pluggable [`ChunkBackend`].
pub struct ChunkStore<P, B> {
    backend: Arc<B>,
    config: StoreConfig,
    sequencer: Sequencer,
    _payload: PhantomData<fn() -> P>,
}

impl<P, B> ChunkStore<P, B>
where
    P: Send + Sync + 'static,
    B: ChunkBackend<P> + 'static,
{
    /// Build a store, rejecting invalid configuration up front.
    pub fn new(backend: Arc<B>, config: StoreConfig) -> Result<Self, StoreError> {
        config.validate()?;
        let sequencer = Sequencer::from_config(&config);
        Ok(Self {
            backend,
            config,
            sequencer,
            _payload: PhantomData,
        })
    }

    pub fn backend(&self) -> &Arc<B> {
        &self.backend
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn sequencer(&self) -> &Sequencer {
        &self.sequencer
    }

    async fn next_id(&self, cancel: &CancellationToken) -> Result<i64, StoreError> {
        guarded(cancel, self.sequencer.next::<P, B>(&*self.backend)).await
    }

    /// Insert `chunk`, resolving constraint violations.
    ///
    /// - `(partition, index)` taken: conflict, returned to the caller.
    /// - `(partition, operation)` taken: a placeholder takes the id instead.
    /// - id taken: reload the sequence and retry, at most `max_id_retries` times.
    async fn insert(
        &self,
        mut chunk: Chunk<P>,
        auto_index: bool,
        cancel: &CancellationToken,
    ) -> Result<i64, StoreError> {
        let mut reloads = 0;
        let mut replayed = false;

        loop {
            let outcome = guarded(cancel, async {
                Ok::<_, StoreError>(self.backend.insert(&chunk).await)
            })
            .await?;

            let stale = match outcome {
                Ok(()) => return Ok(chunk.id),
                Err(InsertError::Other(error)) => return Err(error.into()),
                // A placeholder only trips a constraint when its id is already in use.
                Err(_) if replayed => true,
                Err(InsertError::SequenceConflict) => {
                    return Err(StoreError::DuplicateIndex {
                        partition_id: chunk.partition_id,
                        index: chunk.index,
                    })
                }
                Err(InsertError::DuplicateOperation) => {
                    warn!(
                        partition_id = %chunk.partition_id,
                        operation_id = %chunk.operation_id,
                        id = chunk.id,
                        "operation already applied, writing placeholder"
                    );
                    chunk = Chunk::placeholder(chunk.id);
                    replayed = true;
                    false
                }
                Err(InsertError::IdCollision) => true,
            };

            if stale {
                if reloads >= self.config.max_id_retries {
                    return Err(StoreError::SequenceExhausted {
                        attempts: reloads,
                        last_id: chunk.id,
                    });
                }
                reloads += 1;
                warn!(id = chunk.id, attempt = reloads, "chunk id already taken, reloading sequence");

                let last = guarded(cancel, self.sequencer.reload::<P, B>(&*self.backend)).await?;
                let id = self.next_id(cancel).await?;
                info!(last, id, "sequence reloaded");

                if replayed {
                    chunk = Chunk::placeholder(id);
                } else {
                    chunk.id = id;
                    if auto_index {
                        chunk.index = id;
                    }
                }
            }
        }
    }

    /// Pull batches from the backend and hand chunks to `deliver` one at a time.
    ///
    /// No batch is requested after `deliver` returns `Stop` or `limit` is reached.
    async fn drive<F>(
        &self,
        query: ScanQuery,
        cancel: &CancellationToken,
        mut deliver: F,
    ) -> Result<usize, StoreError>
    where
        F: FnMut(&Chunk<P>) -> ScanAction + Send,
    {
        let limit = query.limit;
        if limit == Some(0) {
            return Ok(0);
        }

        let mut cursor = guarded(cancel, self.backend.open_cursor(query)).await?;
        let mut delivered = 0;
        while let Some(batch) = guarded(cancel, cursor.next_batch()).await? {
            for chunk in &batch {
                delivered += 1;
                let action = deliver(chunk);
                if action == ScanAction::Stop || limit.is_some_and(|limit| delivered >= limit) {
                    return Ok(delivered);
                }
            }
        }
        Ok(delivered)
    }
}

#[async_trait]
impl<P, B> RawStore<P> for ChunkStore<P, B>
where
    P: Send + Sync + 'static,
    B: ChunkBackend<P> + 'static,
{
    async fn persist(
        &self,
        partition_id: &str,
        index: i64,
        payload: P,
        operation_id: Option<String>,
        cancel: &CancellationToken,
    ) -> Result<i64, StoreError> {
        if partition_id == EMPTY_PARTITION {
            return Err(StoreError::ReservedPartition {
                partition_id: partition_id.to_string(),
            });
        }
        let id = self.next_id(cancel).await?;
        let auto_index = index < 0;
        let chunk = Chunk {
            id,
            partition_id: partition_id.to_string(),
            index: if auto_index { id } else { index },
            payload: Some(payload),
            operation_id: operation_id.unwrap_or_else(|| Uuid::new_v4().to_string()),
        };
        debug!(partition_id, index = chunk.index, id, "persisting chunk");

        self.insert(chunk, auto_index, cancel).await
    }

    async fn scan_partition(
        &self,
        partition_id: &str,
        from_index_inclusive: i64,
        to_index_inclusive: i64,
        direction: ScanDirection,
        limit: Option<usize>,
        observer: &mut dyn PartitionObserver<P>,
        cancel: &CancellationToken,
    ) -> Result<(), StoreError> {
        let query = ScanQuery {
            range: ScanRange::Partition {
                partition_id: partition_id.to_string(),
                from: from_index_inclusive,
                to: to_index_inclusive,
            },
            direction,
            limit,
        };
        let delivered = self
            .drive(query, cancel, |chunk: &Chunk<P>| {
                observer.observe(chunk.index, chunk.payload.as_ref())
            })
            .await?;

        debug!(partition_id, ?direction, delivered, "partition scanned");
        Ok(())
    }

    async fn scan_store(
        &self,
        sequence_start: i64,
        direction: ScanDirection,
        limit: Option<usize>,
        observer: &mut dyn StoreObserver<P>,
        cancel: &CancellationToken,
    ) -> Result<(), StoreError> {
        let query = ScanQuery {
            range: ScanRange::Store {
                start: sequence_start,
            },
            direction,
            limit,
        };
        let delivered = self
            .drive(query, cancel, |chunk: &Chunk<P>| {
                observer.observe(
                    chunk.id,
                    &chunk.partition_id,
                    chunk.index,
                    chunk.payload.as_ref(),
                )
            })
            .await?;

        debug!(sequence_start, ?direction, delivered, "store scanned");
        Ok(())
    }

    async fn delete(
        &self,
        partition_id: &str,
        from_index: i64,
        to_index: i64,
        cancel: &CancellationToken,
    ) -> Result<u64, StoreError> {
        let deleted = guarded(
            cancel,
            self.backend.delete_range(partition_id, from_index, to_index),
        )
        .await?;

        if deleted == 0 {
            return Err(StoreError::DeleteNotFound {
                partition_id: partition_id.to_string(),
            });
        }
        debug!(partition_id, from_index, to_index, deleted, "chunks deleted");
        Ok(deleted)
    }

    async fn init(&self, cancel: &CancellationToken) -> Result<(), StoreError> {
        info!(
            partitions = %self.config.partitions_collection,
            sequence = %self.config.sequence_collection,
            local_sequence = self.config.use_local_sequence,
            "initializing chunk store"
        );

        if self.config.drop_on_init {
            guarded(cancel, self.backend.drop_all()).await?;
            self.sequencer.reset();
            info!("existing chunks dropped");
        }

        for index in UniqueIndex::ALL {
            guarded(cancel, self.backend.ensure_unique_index(index)).await?;
            debug!(index = index.name(), "unique index ensured");
        }

        if self.sequencer.is_local() {
            let last = guarded(cancel, self.sequencer.reload::<P, B>(&*self.backend)).await?;
            info!(last, "local sequence primed");
        }
        Ok(())
    }

    async fn destroy(&self, cancel: &CancellationToken) -> Result<(), StoreError> {
        guarded(cancel, self.backend.drop_all()).await?;
        self.sequencer.reset();
        info!(partitions = %self.config.partitions_collection, "chunk store destroyed");
        Ok(())
    }
}
