//! Poison-message tracking and quarantine decisions.
//!
//! Failures are counted per (destination, message id). Records live in a
//! bounded `moka` cache, so memory stays flat however many distinct messages
//! fail.

use crate::config::duration_ms;
use crate::error::{PipelineError, Result};
use chrono::{DateTime, Utc};
use moka::future::Cache;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Poison guard settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoisonConfig {
    /// Failures after which a message is quarantined
    pub threshold: u32,

    /// Maximum number of messages tracked at once
    pub max_tracked: u64,

    /// Records untouched for this long are forgotten
    #[serde(with = "duration_ms")]
    pub idle_ttl: Duration,
}

impl Default for PoisonConfig {
    fn default() -> Self {
        Self {
            threshold: 3,
            max_tracked: 100_000,
            idle_ttl: Duration::from_secs(600),
        }
    }
}

impl PoisonConfig {
    pub fn validate(&self) -> Result<()> {
        if self.threshold == 0 {
            return Err(PipelineError::Configuration(
                "poison.threshold must be greater than 0".to_string(),
            ));
        }
        if self.max_tracked == 0 {
            return Err(PipelineError::Configuration(
                "poison.max_tracked must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// Failure history of one message
#[derive(Debug, Clone, Serialize)]
pub struct PoisonRecord {
    pub destination: String,
    pub message_id: String,
    pub failure_count: u32,
    pub last_error: String,
    pub first_seen: DateTime<Utc>,
    pub quarantined: bool,
}

/// Outcome of recording a failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoisonDecision {
    /// Below the threshold; let the message be redelivered
    Retry { attempts: u32 },
    /// Threshold reached; dead-letter the message. Returned once per message.
    Quarantine { attempts: u32 },
    /// A failure arrived for a message that was already quarantined
    AlreadyQuarantined { attempts: u32 },
}

type PoisonKey = (String, String);

/// Tracks failures per message and decides when to quarantine
#[derive(Clone)]
pub struct PoisonMessageGuard {
    config: PoisonConfig,
    records: Cache<PoisonKey, Arc<Mutex<PoisonRecord>>>,
}

impl PoisonMessageGuard {
    pub fn new(config: PoisonConfig) -> Self {
        let records = Cache::builder()
            .max_capacity(config.max_tracked)
            .time_to_idle(config.idle_ttl)
            .build();

        Self { config, records }
    }

    pub fn threshold(&self) -> u32 {
        self.config.threshold
    }

    /// Count a handler failure for the message
    pub async fn record_failure(
        &self,
        destination: &str,
        message_id: &str,
        error: &str,
    ) -> PoisonDecision {
        let key = (destination.to_string(), message_id.to_string());
        let record = self
            .records
            .get_with(key, async {
                Arc::new(Mutex::new(PoisonRecord {
                    destination: destination.to_string(),
                    message_id: message_id.to_string(),
                    failure_count: 0,
                    last_error: String::new(),
                    first_seen: Utc::now(),
                    quarantined: false,
                }))
            })
            .await;

        let mut record = record.lock();
        record.failure_count = record.failure_count.saturating_add(1);
        record.last_error = error.to_string();
        let attempts = record.failure_count;

        if record.quarantined {
            debug!(destination, message_id, attempts, "Failure for already quarantined message");
            PoisonDecision::AlreadyQuarantined { attempts }
        } else if attempts >= self.config.threshold {
            record.quarantined = true;
            warn!(
                destination,
                message_id,
                attempts,
                error,
                "Message reached poison threshold, quarantining"
            );
            PoisonDecision::Quarantine { attempts }
        } else {
            debug!(destination, message_id, attempts, "Recorded message failure");
            PoisonDecision::Retry { attempts }
        }
    }

    /// Forget a message that eventually succeeded
    pub async fn record_success(&self, destination: &str, message_id: &str) {
        self.records
            .invalidate(&(destination.to_string(), message_id.to_string()))
            .await;
    }

    /// Drop tracking once the message has been dead-lettered
    pub async fn release(&self, destination: &str, message_id: &str) {
        self.records
            .invalidate(&(destination.to_string(), message_id.to_string()))
            .await;
    }

    /// Snapshot of a tracked message, if any
    pub async fn record(&self, destination: &str, message_id: &str) -> Option<PoisonRecord> {
        self.records
            .get(&(destination.to_string(), message_id.to_string()))
            .await
            .map(|record| record.lock().clone())
    }

    /// Approximate number of tracked messages
    pub async fn tracked_count(&self) -> u64 {
        self.records.run_pending_tasks().await;
        self.records.entry_count()
    }
}

impl std::fmt::Debug for PoisonMessageGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoisonMessageGuard")
            .field("config", &self.config)
            .finish()
    }
}
