//! Saga checkpoints and their storage.

use crate::saga::error::StepFailure;
use crate::saga::state::SagaState;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

/// A step that completed and may need compensating
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletedStep {
    pub index: usize,
    pub name: String,
    pub completed_at: DateTime<Utc>,
}

/// Durable snapshot of a saga instance.
///
/// `completed_steps` is the compensation stack: compensation pops from the
/// end. `version` is the value the store assigned on the last save.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SagaCheckpoint {
    pub saga_id: String,
    pub saga_name: String,
    pub step_names: Vec<String>,
    pub state: SagaState,
    /// Index of the next forward step to run
    pub next_step: usize,
    pub completed_steps: Vec<CompletedStep>,
    pub data: serde_json::Value,
    /// The forward failure that triggered compensation
    pub failure: Option<StepFailure>,
    pub compensation_errors: Vec<StepFailure>,
    /// Compensation was triggered by cancellation
    pub cancelled: bool,
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Persistence error types
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PersistenceError {
    /// Another writer saved the saga since it was loaded
    #[error("Concurrency conflict for saga '{saga_id}': expected version {expected}, found {actual}")]
    ConcurrencyConflict {
        saga_id: String,
        expected: u64,
        actual: u64,
    },

    #[error("Saga checkpoint not found: {0}")]
    NotFound(String),

    #[error("Checkpoint serialization error: {0}")]
    Serialization(String),

    #[error("Checkpoint storage error: {0}")]
    Storage(String),
}

impl From<serde_json::Error> for PersistenceError {
    fn from(err: serde_json::Error) -> Self {
        PersistenceError::Serialization(err.to_string())
    }
}

pub type PersistenceResult<T> = std::result::Result<T, PersistenceError>;

/// Storage for saga checkpoints with optimistic concurrency
#[async_trait]
pub trait SagaPersistence: Send + Sync {
    /// Store `checkpoint` if the stored version equals `expected_version`
    /// (0 means the saga must not exist yet). Returns the new version.
    async fn save_checkpoint(
        &self,
        checkpoint: &SagaCheckpoint,
        expected_version: u64,
    ) -> PersistenceResult<u64>;

    async fn load_checkpoint(&self, saga_id: &str) -> PersistenceResult<SagaCheckpoint>;
}

/// Checkpoints kept in a concurrent map
#[derive(Debug, Default)]
pub struct InMemorySagaPersistence {
    checkpoints: DashMap<String, SagaCheckpoint>,
}

impl InMemorySagaPersistence {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.checkpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.checkpoints.is_empty()
    }

    /// Ids of stored sagas that are not in a terminal state
    pub fn unfinished(&self) -> Vec<String> {
        self.checkpoints
            .iter()
            .filter(|entry| !entry.value().state.is_terminal())
            .map(|entry| entry.key().clone())
            .collect()
    }
}

#[async_trait]
impl SagaPersistence for InMemorySagaPersistence {
    async fn save_checkpoint(
        &self,
        checkpoint: &SagaCheckpoint,
        expected_version: u64,
    ) -> PersistenceResult<u64> {
        let new_version = expected_version + 1;
        let mut stored = checkpoint.clone();
        stored.version = new_version;

        match self.checkpoints.entry(checkpoint.saga_id.clone()) {
            Entry::Occupied(mut entry) => {
                let actual = entry.get().version;
                if actual != expected_version {
                    return Err(PersistenceError::ConcurrencyConflict {
                        saga_id: checkpoint.saga_id.clone(),
                        expected: expected_version,
                        actual,
                    });
                }
                entry.insert(stored);
            }
            Entry::Vacant(entry) => {
                if expected_version != 0 {
                    return Err(PersistenceError::ConcurrencyConflict {
                        saga_id: checkpoint.saga_id.clone(),
                        expected: expected_version,
                        actual: 0,
                    });
                }
                entry.insert(stored);
            }
        }

        debug!(
            saga_id = %checkpoint.saga_id,
            state = %checkpoint.state,
            version = new_version,
            "Saved saga checkpoint"
        );
        Ok(new_version)
    }

    async fn load_checkpoint(&self, saga_id: &str) -> PersistenceResult<SagaCheckpoint> {
        self.checkpoints
            .get(saga_id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| PersistenceError::NotFound(saga_id.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn checkpoint(id: &str) -> SagaCheckpoint {
        let now = Utc::now();
        SagaCheckpoint {
            saga_id: id.to_string(),
            saga_name: "order".to_string(),
            step_names: vec!["a".to_string(), "b".to_string()],
            state: SagaState::Running,
            next_step: 0,
            completed_steps: Vec::new(),
            data: serde_json::json!({"total": 10}),
            failure: None,
            compensation_errors: Vec::new(),
            cancelled: false,
            version: 0,
            created_at: now,
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn test_save_and_load() {
        let store = InMemorySagaPersistence::new();
        let version = store.save_checkpoint(&checkpoint("s-1"), 0).await.unwrap();
        assert_eq!(version, 1);

        let loaded = store.load_checkpoint("s-1").await.unwrap();
        assert_eq!(loaded.version, 1);
        assert_eq!(loaded.data["total"], 10);
        assert_eq!(store.unfinished(), vec!["s-1".to_string()]);
    }

    #[tokio::test]
    async fn test_stale_writer_is_rejected() {
        let store = InMemorySagaPersistence::new();
        store.save_checkpoint(&checkpoint("s-1"), 0).await.unwrap();
        store.save_checkpoint(&checkpoint("s-1"), 1).await.unwrap();

        let err = store.save_checkpoint(&checkpoint("s-1"), 1).await.unwrap_err();
        assert_eq!(
            err,
            PersistenceError::ConcurrencyConflict {
                saga_id: "s-1".to_string(),
                expected: 1,
                actual: 2,
            }
        );
    }

    #[tokio::test]
    async fn test_create_twice_conflicts() {
        let store = InMemorySagaPersistence::new();
        store.save_checkpoint(&checkpoint("s-1"), 0).await.unwrap();
        assert!(matches!(
            store.save_checkpoint(&checkpoint("s-1"), 0).await,
            Err(PersistenceError::ConcurrencyConflict { .. })
        ));
    }

    #[tokio::test]
    async fn test_update_of_missing_saga_conflicts() {
        let store = InMemorySagaPersistence::new();
        assert!(matches!(
            store.save_checkpoint(&checkpoint("s-1"), 3).await,
            Err(PersistenceError::ConcurrencyConflict { actual: 0, .. })
        ));
    }

    #[tokio::test]
    async fn test_missing_checkpoint() {
        let store = InMemorySagaPersistence::new();
        assert_eq!(
            store.load_checkpoint("nope").await.unwrap_err(),
            PersistenceError::NotFound("nope".to_string())
        );
    }
}
