// Aggregate Replay & Repository
//
// Rebuilds aggregates by folding the changesets stored in their
// partition, and appends new changesets with optimistic concurrency.

use std::marker::PhantomData;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::aggregate::{Aggregate, AggregateError, AggregatePersister, AggregateState, Changeset};
use crate::log::{ScanAction, StoreError};
use crate::stream::{OptimisticAppendStream, ReadStream, StreamStore};

/// Errors that can occur while loading or saving an aggregate.
#[derive(Debug, thiserror::Error)]
pub enum ReplayError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("aggregate error: {0}")]
    Aggregate(#[from] AggregateError),
}

/// Fold every changeset of `stream` into `aggregate`, in index order.
///
/// Stops at the first changeset the aggregate rejects.
pub async fn replay_aggregate<S, R>(
    stream: &R,
    aggregate: &mut Aggregate<S>,
    cancel: &CancellationToken,
) -> Result<usize, ReplayError>
where
    S: AggregateState,
    R: ReadStream<Changeset<S::Event>> + ?Sized,
{
    let mut applied = 0;
    let mut failure = None;
    let mut observer = |_index: i64, payload: Option<&Changeset<S::Event>>| {
        let Some(changeset) = payload else {
            return ScanAction::Continue;
        };
        match aggregate.apply_changes(changeset) {
            Ok(()) => {
                applied += 1;
                ScanAction::Continue
            }
            Err(err) => {
                failure = Some(err);
                ScanAction::Stop
            }
        }
    };
    stream.read_all(&mut observer, cancel).await?;

    match failure {
        Some(err) => Err(err.into()),
        None => Ok(applied),
    }
}

/// Loads and saves aggregates of one kind, one partition per aggregate.
pub struct Repository<S: AggregateState> {
    streams: StreamStore<Changeset<S::Event>>,
    _state: PhantomData<fn() -> S>,
}

impl<S: AggregateState> Repository<S> {
    pub fn new(streams: StreamStore<Changeset<S::Event>>) -> Self {
        Self {
            streams,
            _state: PhantomData,
        }
    }

    /// Rebuild aggregate `id` from its partition. Unknown ids yield a fresh aggregate.
    pub async fn load(
        &self,
        id: &str,
        cancel: &CancellationToken,
    ) -> Result<Aggregate<S>, ReplayError> {
        let mut aggregate = Aggregate::with_id(id)?;
        let stream = self.streams.open_read_only(id);
        let applied = replay_aggregate(&stream, &mut aggregate, cancel).await?;

        debug!(id, applied, version = aggregate.version(), "aggregate loaded");
        Ok(aggregate)
    }

    /// Append pending events as one changeset.
    ///
    /// The changeset goes to index `version + 1`, so two writers saving from
    /// the same version conflict. Returns the chunk id, or `None` when there
    /// was nothing to save.
    pub async fn save(
        &self,
        aggregate: &mut Aggregate<S>,
        operation_id: Option<String>,
        cancel: &CancellationToken,
    ) -> Result<Option<i64>, ReplayError> {
        let id = aggregate
            .id()
            .ok_or(AggregateError::NotInitialized {
                aggregate_type: Aggregate::<S>::aggregate_type(),
            })?
            .to_string();

        let changeset = aggregate.changeset();
        if changeset.is_empty() {
            return Ok(None);
        }

        let stream = self.streams.open_optimistic(&id);
        let chunk_id = stream
            .append(changeset.clone(), aggregate.version() + 1, operation_id, cancel)
            .await?;
        aggregate.changes_persisted(&changeset)?;

        debug!(id, chunk_id, version = changeset.version, "aggregate saved");
        Ok(Some(chunk_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::InMemoryBackend;
    use crate::aggregate::tests::{Ticket, TicketEvent};
    use crate::config::StoreConfig;
    use crate::log::{ChunkStore, RawStore, Recorder};
    use std::sync::Arc;

    async fn repository() -> Repository<Ticket> {
        let store = ChunkStore::new(
            Arc::new(InMemoryBackend::<Changeset<TicketEvent>>::new()),
            StoreConfig::new("memory://tickets").with_local_sequence(),
        )
        .unwrap();
        store.init(&CancellationToken::new()).await.unwrap();
        Repository::new(StreamStore::new(Arc::new(store)))
    }

    #[tokio::test]
    async fn unknown_aggregate_loads_fresh() {
        let tickets = repository().await;

        let ticket = tickets.load("ticket-1", &CancellationToken::new()).await.unwrap();

        assert!(ticket.is_initialized());
        assert_eq!(ticket.version(), 0);
        assert_eq!(ticket.state(), Some(&Ticket::default()));
    }

    #[tokio::test]
    async fn saved_changesets_are_replayed() {
        let tickets = repository().await;
        let cancel = CancellationToken::new();

        let mut ticket = tickets.load("ticket-1", &cancel).await.unwrap();
        ticket.raise(TicketEvent::Sold).unwrap();
        tickets.save(&mut ticket, None, &cancel).await.unwrap();
        ticket.raise(TicketEvent::Refunded).unwrap();
        tickets.save(&mut ticket, None, &cancel).await.unwrap();

        assert_eq!(ticket.version(), 2);
        assert!(!ticket.is_dirty());

        let reloaded = tickets.load("ticket-1", &cancel).await.unwrap();
        assert_eq!(reloaded.version(), 2);
        assert_eq!(
            reloaded.state(),
            Some(&Ticket {
                sold: true,
                refunded: true
            })
        );
    }

    #[tokio::test]
    async fn changeset_is_stored_after_loaded_version() {
        let tickets = repository().await;
        let cancel = CancellationToken::new();

        let mut ticket = tickets.load("ticket-1", &cancel).await.unwrap();
        ticket.raise(TicketEvent::Sold).unwrap();
        ticket.raise(TicketEvent::Refunded).unwrap();
        tickets.save(&mut ticket, None, &cancel).await.unwrap();
        assert_eq!(ticket.version(), 2);

        ticket.raise(TicketEvent::Sold).unwrap();
        tickets.save(&mut ticket, None, &cancel).await.unwrap();

        let mut recorder = Recorder::<Changeset<TicketEvent>>::new();
        tickets
            .streams
            .open_read_only("ticket-1")
            .read_all(&mut recorder, &cancel)
            .await
            .unwrap();
        assert_eq!(recorder.indexes(), vec![1, 3]);
        let versions: Vec<_> = recorder.payloads().iter().map(|c| c.version).collect();
        assert_eq!(versions, vec![2, 3]);
    }

    #[tokio::test]
    async fn saving_without_changes_is_a_no_op() {
        let tickets = repository().await;
        let cancel = CancellationToken::new();
        let mut ticket = tickets.load("ticket-1", &cancel).await.unwrap();

        assert_eq!(tickets.save(&mut ticket, None, &cancel).await.unwrap(), None);
    }

    #[tokio::test]
    async fn concurrent_saves_conflict() {
        let tickets = repository().await;
        let cancel = CancellationToken::new();

        let mut first = tickets.load("ticket-1", &cancel).await.unwrap();
        let mut second = tickets.load("ticket-1", &cancel).await.unwrap();
        first.raise(TicketEvent::Sold).unwrap();
        second.raise(TicketEvent::Sold).unwrap();
        second.raise(TicketEvent::Refunded).unwrap();

        tickets.save(&mut first, None, &cancel).await.unwrap();
        let err = tickets.save(&mut second, None, &cancel).await.unwrap_err();

        assert!(matches!(
            err,
            ReplayError::Store(StoreError::DuplicateIndex { index: 1, .. })
        ));
        assert!(second.is_dirty());
    }

    #[tokio::test]
    async fn retried_save_is_idempotent() {
        let tickets = repository().await;
        let cancel = CancellationToken::new();

        let mut ticket = tickets.load("ticket-1", &cancel).await.unwrap();
        ticket.raise(TicketEvent::Sold).unwrap();
        let mut retry = tickets.load("ticket-1", &cancel).await.unwrap();
        retry.raise(TicketEvent::Sold).unwrap();

        tickets
            .save(&mut ticket, Some("sell-1".into()), &cancel)
            .await
            .unwrap();
        tickets
            .save(&mut retry, Some("sell-1".into()), &cancel)
            .await
            .unwrap();

        let reloaded = tickets.load("ticket-1", &cancel).await.unwrap();
        assert_eq!(reloaded.version(), 1);
    }

    #[tokio::test]
    async fn replay_reports_uninitialized_aggregate() {
        let tickets = repository().await;
        let cancel = CancellationToken::new();
        let mut ticket = tickets.load("ticket-1", &cancel).await.unwrap();
        ticket.raise(TicketEvent::Sold).unwrap();
        tickets.save(&mut ticket, None, &cancel).await.unwrap();

        let mut blank = Aggregate::<Ticket>::new();
        let stream = tickets.streams.open_read_only("ticket-1");
        let err = replay_aggregate(&stream, &mut blank, &cancel)
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            ReplayError::Aggregate(AggregateError::NotInitialized { .. })
        ));
    }
}
