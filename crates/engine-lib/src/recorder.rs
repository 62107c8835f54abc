//! Decision recorder
//!
//! Sole writer of the decision log. An id collision is repaired and
//! retried a bounded number of times; anything else is returned as-is.

use crate::models::{DecisionEvent, NewDecision};
use crate::observability::EngineMetrics;
use crate::store::{DecisionStore, StoreError, MAX_HISTORY_LIMIT};
use std::sync::Arc;
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Clone)]
pub struct RecorderConfig {
    /// Total insert attempts, including the first
    pub max_attempts: u32,
}

impl Default for RecorderConfig {
    fn default() -> Self {
        Self { max_attempts: 2 }
    }
}

#[derive(Debug, Error)]
pub enum RecordError {
    #[error("decision not recorded after {attempts} attempts: {source}")]
    Exhausted {
        attempts: u32,
        #[source]
        source: StoreError,
    },

    #[error(transparent)]
    Store(#[from] StoreError),
}

pub struct DecisionRecorder {
    store: Arc<dyn DecisionStore>,
    config: RecorderConfig,
    metrics: EngineMetrics,
}

impl DecisionRecorder {
    pub fn new(store: Arc<dyn DecisionStore>, config: RecorderConfig) -> Self {
        Self {
            store,
            config,
            metrics: EngineMetrics::new(),
        }
    }

    /// Persist one decision and return its id
    pub async fn record(&self, decision: &NewDecision) -> Result<i64, RecordError> {
        let max_attempts = self.config.max_attempts.max(1);
        let mut attempt = 0;

        loop {
            attempt += 1;
            match self.store.insert_decision(decision).await {
                Ok(id) => return Ok(id),
                Err(StoreError::Conflict(detail)) if attempt < max_attempts => {
                    warn!(
                        device_id = %decision.device_id,
                        attempt = attempt,
                        detail = %detail,
                        "Decision id conflict, repairing sequence"
                    );
                    self.metrics.inc_record_retries();
                    self.store.repair_sequence().await?;
                }
                Err(err @ StoreError::Conflict(_)) => {
                    return Err(RecordError::Exhausted {
                        attempts: attempt,
                        source: err,
                    })
                }
                Err(err) => return Err(RecordError::Store(err)),
            }
        }
    }

    pub async fn latest(&self, device_id: &str) -> Result<Option<DecisionEvent>, StoreError> {
        self.store.latest_decision(device_id.trim()).await
    }

    /// Newest first; `limit` is clamped to 1..=500
    pub async fn history(
        &self,
        device_id: &str,
        limit: u32,
    ) -> Result<Vec<DecisionEvent>, StoreError> {
        let limit = limit.clamp(1, MAX_HISTORY_LIMIT);
        self.store.decision_history(device_id.trim(), limit).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ActionSet, ActionSource, ActionType};
    use crate::store::MemoryStore;
    use async_trait::async_trait;
    use chrono::Utc;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn decision() -> NewDecision {
        NewDecision {
            device_id: "kit-1".to_string(),
            recorded_at: Utc::now(),
            actions: ActionSet::idle(ActionSource::Rule).with(ActionType::Refill, 6),
            manual: false,
            auto: true,
        }
    }

    /// Store whose sequence never recovers
    struct AlwaysConflicting {
        inserts: AtomicU32,
        repairs: AtomicU32,
    }

    #[async_trait]
    impl DecisionStore for AlwaysConflicting {
        async fn insert_decision(&self, _: &NewDecision) -> Result<i64, StoreError> {
            self.inserts.fetch_add(1, Ordering::SeqCst);
            Err(StoreError::Conflict("Key (id)=(1) already exists".into()))
        }

        async fn repair_sequence(&self) -> Result<(), StoreError> {
            self.repairs.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn latest_decision(&self, _: &str) -> Result<Option<DecisionEvent>, StoreError> {
            Ok(None)
        }

        async fn decision_history(&self, _: &str, _: u32) -> Result<Vec<DecisionEvent>, StoreError> {
            Ok(vec![])
        }
    }

    #[tokio::test]
    async fn test_conflict_is_repaired_and_retried() {
        let store = Arc::new(MemoryStore::new());
        let recorder = DecisionRecorder::new(store.clone(), RecorderConfig::default());

        recorder.record(&decision()).await.unwrap();
        store.rewind_sequence(1);

        let id = recorder.record(&decision()).await.unwrap();
        assert_eq!(id, 2);
        assert_eq!(store.decision_count().await, 2);
    }

    #[tokio::test]
    async fn test_retries_are_bounded() {
        let store = Arc::new(AlwaysConflicting {
            inserts: AtomicU32::new(0),
            repairs: AtomicU32::new(0),
        });
        let recorder = DecisionRecorder::new(store.clone(), RecorderConfig { max_attempts: 2 });

        let err = recorder.record(&decision()).await.unwrap_err();

        assert!(matches!(err, RecordError::Exhausted { attempts: 2, .. }));
        assert_eq!(store.inserts.load(Ordering::SeqCst), 2);
        assert_eq!(store.repairs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_history_limit_is_clamped() {
        let store = Arc::new(MemoryStore::new());
        let recorder = DecisionRecorder::new(store.clone(), RecorderConfig::default());
        for _ in 0..3 {
            recorder.record(&decision()).await.unwrap();
        }

        assert_eq!(recorder.history(" kit-1 ", 0).await.unwrap().len(), 1);
        assert_eq!(recorder.history("kit-1", 10_000).await.unwrap().len(), 3);
        assert!(recorder.latest("kit-1").await.unwrap().is_some());
        assert!(recorder.latest("kit-9").await.unwrap().is_none());
    }
}
