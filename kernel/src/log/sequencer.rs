// Global Sequence Allocation
//
// Hands out chunk ids. The local mode keeps the counter in this
// process; the distributed mode lets the backend increment it.

use std::sync::atomic::{AtomicI64, Ordering};

use crate::adapters::{BackendError, ChunkBackend};
use crate::config::StoreConfig;

/// Source of global chunk ids.
///
/// Lifecycle of the local counter: primed from the backend's highest id
/// by `reload` (called on store init), advanced only through atomic
/// increments, and zeroed by `reset` when the store is destroyed.
#[derive(Debug)]
pub enum Sequencer {
    /// In-process counter. Only safe when one process owns the store.
    Local { last: AtomicI64 },
    /// Counter document incremented by the backend.
    Distributed { sequence_id: String },
}

impl Sequencer {
    pub fn local() -> Self {
        Sequencer::Local {
            last: AtomicI64::new(0),
        }
    }

    pub fn distributed(sequence_id: impl Into<String>) -> Self {
        Sequencer::Distributed {
            sequence_id: sequence_id.into(),
        }
    }

    pub fn from_config(config: &StoreConfig) -> Self {
        if config.use_local_sequence {
            Self::local()
        } else {
            Self::distributed(config.sequence_id.clone())
        }
    }

    pub fn is_local(&self) -> bool {
        matches!(self, Sequencer::Local { .. })
    }

    /// Allocate the next id.
    pub async fn next<P, B>(&self, backend: &B) -> Result<i64, BackendError>
    where
        P: Send + Sync + 'static,
        B: ChunkBackend<P> + ?Sized,
    {
        match self {
            Sequencer::Local { last } => Ok(last.fetch_add(1, Ordering::SeqCst) + 1),
            Sequencer::Distributed { sequence_id } => backend.increment_counter(sequence_id).await,
        }
    }

    /// Resynchronize with the highest id the backend holds.
    ///
    /// Returns the id the sequence now continues after.
    pub async fn reload<P, B>(&self, backend: &B) -> Result<i64, BackendError>
    where
        P: Send + Sync + 'static,
        B: ChunkBackend<P> + ?Sized,
    {
        let max_id = backend.max_id().await?;
        match self {
            Sequencer::Local { last } => {
                last.fetch_max(max_id, Ordering::SeqCst);
                Ok(last.load(Ordering::SeqCst))
            }
            Sequencer::Distributed { sequence_id } => {
                backend.raise_counter(sequence_id, max_id).await?;
                Ok(max_id)
            }
        }
    }

    /// Forget all local state.
    pub fn reset(&self) {
        if let Sequencer::Local { last } = self {
            last.store(0, Ordering::SeqCst);
        }
    }

    /// Last id handed out by the local counter, `None` in distributed mode.
    pub fn current(&self) -> Option<i64> {
        match self {
            Sequencer::Local { last } => Some(last.load(Ordering::SeqCst)),
            Sequencer::Distributed { .. } => None,
        }
    }
}
