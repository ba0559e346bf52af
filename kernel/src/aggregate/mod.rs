// Aggregates & Changesets
//
// A versioned domain entity rebuilt from its changesets. Raised events
// change state immediately but only count towards the version once a
// changeset is applied or persisted.

use serde::{Deserialize, Serialize};
use std::any::type_name;

/// Domain state folded from events.
pub trait AggregateState: Default + Send + Sync {
    type Event: Clone + Send + Sync + 'static;

    /// Apply one event. Must not fail: events are facts.
    fn apply(&mut self, event: &Self::Event);
}

/// Events raised by an aggregate since a known version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Changeset<E> {
    /// Version the aggregate reaches once these events are applied.
    pub version: i64,
    pub events: Vec<E>,
}

impl<E> Changeset<E> {
    pub fn new(version: i64, events: Vec<E>) -> Self {
        Self { version, events }
    }

    pub fn single(version: i64, event: E) -> Self {
        Self::new(version, vec![event])
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }
}

/// Errors raised by misuse of an aggregate. Detected before any I/O.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum AggregateError {
    #[error("aggregate id must not be empty")]
    InvalidId,

    #[error("aggregate `{id}` of type {aggregate_type} is already initialized")]
    AlreadyInitialized {
        id: String,
        aggregate_type: &'static str,
    },

    #[error("aggregate of type {aggregate_type} is not initialized")]
    NotInitialized { aggregate_type: &'static str },
}

/// Commit-side view of an aggregate.
pub trait AggregatePersister {
    type Event;

    /// Pending events as a changeset. Does not clear them.
    fn changeset(&self) -> Changeset<Self::Event>;

    /// Replay committed events onto state and adopt their version.
    fn apply_changes(&mut self, changeset: &Changeset<Self::Event>) -> Result<(), AggregateError>;

    /// Mark an extracted changeset as stored without replaying it.
    fn changes_persisted(&mut self, changeset: &Changeset<Self::Event>)
        -> Result<(), AggregateError>;
}

/// Versioned entity with a buffer of uncommitted events.
///
/// Lifecycle: uninitialized until `init`, then initialized for good.
#[derive(Debug)]
pub struct Aggregate<S: AggregateState> {
    id: Option<String>,
    version: i64,
    state: Option<S>,
    pending: Vec<S::Event>,
}

impl<S: AggregateState> Default for Aggregate<S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S: AggregateState> Aggregate<S> {
    pub fn new() -> Self {
        Self {
            id: None,
            version: 0,
            state: None,
            pending: Vec::new(),
        }
    }

    /// Create and initialize in one go.
    pub fn with_id(id: impl Into<String>) -> Result<Self, AggregateError> {
        let mut aggregate = Self::new();
        aggregate.init(id)?;
        Ok(aggregate)
    }

    pub fn aggregate_type() -> &'static str {
        type_name::<S>()
    }

    /// Bind the aggregate to `id` and create its default state.
    pub fn init(&mut self, id: impl Into<String>) -> Result<(), AggregateError> {
        let id = id.into();
        if id.trim().is_empty() {
            return Err(AggregateError::InvalidId);
        }
        if let Some(existing) = &self.id {
            return Err(AggregateError::AlreadyInitialized {
                id: existing.clone(),
                aggregate_type: Self::aggregate_type(),
            });
        }

        self.id = Some(id);
        self.state = Some(S::default());
        Ok(())
    }

    /// Record an event and apply it to state right away.
    pub fn raise(&mut self, event: S::Event) -> Result<(), AggregateError> {
        let state = self.state_mut()?;
        state.apply(&event);
        self.pending.push(event);
        Ok(())
    }

    pub fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    pub fn version(&self) -> i64 {
        self.version
    }

    pub fn state(&self) -> Option<&S> {
        self.state.as_ref()
    }

    pub fn is_initialized(&self) -> bool {
        self.state.is_some()
    }

    pub fn is_dirty(&self) -> bool {
        !self.pending.is_empty()
    }

    pub fn pending_events(&self) -> &[S::Event] {
        &self.pending
    }

    fn state_mut(&mut self) -> Result<&mut S, AggregateError> {
        self.state.as_mut().ok_or(AggregateError::NotInitialized {
            aggregate_type: Self::aggregate_type(),
        })
    }
}

impl<S: AggregateState> AggregatePersister for Aggregate<S> {
    type Event = S::Event;

    fn changeset(&self) -> Changeset<S::Event> {
        Changeset::new(
            self.version + self.pending.len() as i64,
            self.pending.clone(),
        )
    }

    fn apply_changes(&mut self, changeset: &Changeset<S::Event>) -> Result<(), AggregateError> {
        let state = self.state_mut()?;
        for event in &changeset.events {
            state.apply(event);
        }
        self.version = changeset.version;
        self.pending.clear();
        Ok(())
    }

    fn changes_persisted(
        &mut self,
        changeset: &Changeset<S::Event>,
    ) -> Result<(), AggregateError> {
        if !self.is_initialized() {
            return Err(AggregateError::NotInitialized {
                aggregate_type: Self::aggregate_type(),
            });
        }
        // Events raised after the changeset was extracted stay pending.
        let stored = changeset.len().min(self.pending.len());
        self.pending.drain(..stored);
        self.version = changeset.version;
        Ok(())
    }
}
