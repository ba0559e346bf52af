// Store Configuration
//
// Recognized options for a chunk store, loadable from JSON.

use serde::{Deserialize, Serialize};

use crate::log::StoreError;

/// Options for a [`ChunkStore`](crate::log::ChunkStore).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Connection target holding the chunks.
    pub partitions_target: String,

    /// Connection target holding the counter. Defaults to `partitions_target`.
    pub sequence_target: Option<String>,

    pub partitions_collection: String,

    pub sequence_collection: String,

    /// Key of the counter record.
    pub sequence_id: String,

    /// Allocate ids in-process instead of through the backend counter.
    pub use_local_sequence: bool,

    /// Wipe everything when the store is initialized.
    pub drop_on_init: bool,

    /// How many times a stale id is reloaded before giving up.
    pub max_id_retries: u32,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            partitions_target: String::new(),
            sequence_target: None,
            partitions_collection: "chunks".into(),
            sequence_collection: "seq".into(),
            sequence_id: "streams".into(),
            use_local_sequence: false,
            drop_on_init: false,
            max_id_retries: 5,
        }
    }
}

impl StoreConfig {
    pub fn new(partitions_target: impl Into<String>) -> Self {
        Self {
            partitions_target: partitions_target.into(),
            ..Self::default()
        }
    }

    pub fn with_local_sequence(mut self) -> Self {
        self.use_local_sequence = true;
        self
    }

    pub fn from_json(json: &str) -> Result<Self, StoreError> {
        let config: StoreConfig =
            serde_json::from_str(json).map_err(|e| StoreError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Target for the counter, falling back to the chunk target.
    pub fn sequence_target(&self) -> &str {
        self.sequence_target
            .as_deref()
            .unwrap_or(&self.partitions_target)
    }

    pub fn validate(&self) -> Result<(), StoreError> {
        if self.partitions_target.trim().is_empty() {
            return Err(StoreError::Config("partitions target is missing".into()));
        }
        if self.sequence_target().trim().is_empty() {
            return Err(StoreError::Config("sequence target is blank".into()));
        }
        for (field, value) in [
            ("partitions_collection", &self.partitions_collection),
            ("sequence_collection", &self.sequence_collection),
            ("sequence_id", &self.sequence_id),
        ] {
            if value.trim().is_empty() {
                return Err(StoreError::Config(format!("{field} is blank")));
            }
        }
        if self.max_id_retries == 0 {
            return Err(StoreError::Config("max_id_retries must be at least 1".into()));
        }
        Ok(())
    }
}
