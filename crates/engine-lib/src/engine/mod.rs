//! Decision pipeline
//!
//! One invocation takes a device from snapshot to persisted decision:
//!
//! 1. resolve and validate the device
//! 2. load the latest snapshot (zeros if there is none)
//! 3. ask the predictor, falling back to the rule engine on any failure
//! 4. claim cooldown windows for what survives the guard
//! 5. record the decision, handing the windows back if that fails
//!
//! Invocations for the same device are served in arrival order within one
//! engine. Across engines the store-level claim keeps an action from firing
//! twice in one window.

mod request;

#[cfg(test)]
mod tests;

pub use request::{DecisionRequest, DecisionResponse, ManualOverrides, RequestMode, ResponseStatus};

use crate::clock::{Clock, SystemClock};
use crate::cooldown::{CooldownConfig, CooldownGuard, CriticalCondition};
use crate::health::{components, HealthRegistry};
use crate::models::{ActionSet, ActionType, NewDecision, TelemetrySnapshot};
use crate::observability::{EngineMetrics, StructuredLogger};
use crate::predictor::{DisabledPredictor, Predictor, PredictorError, DEFAULT_PREDICTOR_TIMEOUT};
use crate::recorder::{DecisionRecorder, RecordError, RecorderConfig};
use crate::rules::{RuleEngine, Tier};
use crate::store::{CooldownStore, DecisionStore, DeviceRegistry, StoreError, TelemetrySource};
use anyhow::Result;
use dashmap::DashMap;
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, error, warn};

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("unknown device '{0}'")]
    UnknownDevice(String),

    #[error(transparent)]
    Record(#[from] RecordError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone)]
pub struct EngineSettings {
    /// Hard bound on a predictor round trip, independent of the HTTP client
    pub predictor_timeout: Duration,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            predictor_timeout: DEFAULT_PREDICTOR_TIMEOUT,
        }
    }
}

/// What one invocation produced
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DecisionOutcome {
    pub decision_id: i64,
    pub device_id: String,
    pub actions: ActionSet,
    /// Set when the rule engine produced the candidate
    pub tier: Option<Tier>,
    pub suppressed: Vec<ActionType>,
    /// Critical conditions that bypassed the cooldown guard
    pub critical: Vec<CriticalCondition>,
    pub manual: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub requested_by: Option<String>,
}

pub struct DecisionEngine {
    telemetry: Arc<dyn TelemetrySource>,
    registry: Arc<dyn DeviceRegistry>,
    predictor: Arc<dyn Predictor>,
    rules: RuleEngine,
    guard: CooldownGuard,
    recorder: DecisionRecorder,
    clock: Arc<dyn Clock>,
    settings: EngineSettings,
    device_locks: DashMap<String, Arc<Mutex<()>>>,
    health: HealthRegistry,
    metrics: EngineMetrics,
    logger: StructuredLogger,
}

impl DecisionEngine {
    pub fn builder() -> DecisionEngineBuilder {
        DecisionEngineBuilder::default()
    }

    pub fn recorder(&self) -> &DecisionRecorder {
        &self.recorder
    }

    pub fn health(&self) -> &HealthRegistry {
        &self.health
    }

    pub fn metrics(&self) -> &EngineMetrics {
        &self.metrics
    }

    pub fn predictor_name(&self) -> &str {
        self.predictor.name()
    }

    /// Run the full pipeline for one request
    pub async fn invoke(&self, request: DecisionRequest) -> Result<DecisionOutcome, EngineError> {
        let started = Instant::now();
        let device_id = request.device_id.trim().to_string();

        if device_id.is_empty() || !self.registry.is_registered(&device_id).await? {
            return Err(EngineError::UnknownDevice(device_id));
        }

        let lock = self.device_lock(&device_id);
        let _serialized = lock.lock().await;

        let reported = self.load_snapshot(&device_id).await?;
        let snapshot = reported
            .clone()
            .unwrap_or_else(|| TelemetrySnapshot::zeroed(&device_id, self.clock.now()));
        let manual = request.mode.is_manual();
        let (candidate, tier) = match request.mode {
            RequestMode::Auto => self.compute(&snapshot).await,
            RequestMode::Manual(overrides) => (overrides.into_action_set(), None),
        };

        let now = self.clock.now();
        let screened = self
            .guard
            .acquire(&device_id, candidate, reported.as_ref(), now)
            .await?;
        if screened.bypassed() {
            self.metrics.inc_critical_bypasses();
            let conditions = screened
                .critical
                .iter()
                .map(|c| c.to_string())
                .collect::<Vec<_>>()
                .join(",");
            self.logger.log_critical_bypass(&device_id, &conditions);
        }
        for action in &screened.suppressed {
            self.metrics.inc_cooldown_suppressions(*action);
        }
        self.logger.log_suppressed(&device_id, &screened.suppressed);

        let decision = NewDecision {
            device_id: device_id.clone(),
            recorded_at: now,
            actions: screened.actions,
            manual,
            auto: !manual,
        };

        let decision_id = match self.recorder.record(&decision).await {
            Ok(id) => id,
            Err(err) => {
                self.metrics.inc_record_failures();
                self.health
                    .set_degraded(components::STORE, err.to_string())
                    .await;
                error!(device_id = %device_id, error = %err, "Failed to record decision");
                self.guard.release(&screened.claims).await;
                return Err(err.into());
            }
        };
        self.health.set_healthy(components::STORE).await;

        let elapsed = started.elapsed();
        self.metrics.observe_decision_latency(elapsed.as_secs_f64());
        self.metrics
            .inc_decisions_recorded(decision.actions.source().as_str());
        self.logger.log_decision(
            decision_id,
            &device_id,
            &decision.actions,
            manual,
            request.requested_by.as_deref(),
            elapsed.as_millis() as u64,
        );

        Ok(DecisionOutcome {
            decision_id,
            device_id,
            actions: decision.actions,
            tier,
            suppressed: screened.suppressed,
            critical: screened.critical,
            manual,
            requested_by: request.requested_by,
        })
    }

    fn device_lock(&self, device_id: &str) -> Arc<Mutex<()>> {
        self.device_locks
            .entry(device_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    async fn load_snapshot(
        &self,
        device_id: &str,
    ) -> Result<Option<TelemetrySnapshot>, StoreError> {
        let snapshot = self.telemetry.latest_snapshot(device_id).await?;
        if snapshot.is_none() {
            warn!(device_id = %device_id, "No telemetry for device, using zeroed snapshot");
        }
        Ok(snapshot)
    }

    /// Predictor first, rule engine on any soft failure
    async fn compute(&self, snapshot: &TelemetrySnapshot) -> (ActionSet, Option<Tier>) {
        let timeout = self.settings.predictor_timeout;
        let started = Instant::now();
        let result = tokio::time::timeout(timeout, self.predictor.predict(snapshot)).await;

        let failure = match result {
            Ok(Ok(prediction)) => {
                self.metrics
                    .observe_predictor_latency(started.elapsed().as_secs_f64());
                self.health.set_healthy(components::PREDICTOR).await;
                if !prediction.clamped.is_empty() {
                    warn!(
                        device_id = %snapshot.device_id,
                        clamped = ?prediction.clamped,
                        model = ?prediction.model,
                        "Predictor exceeded actuator limits, clamped"
                    );
                }
                return (prediction.actions, None);
            }
            Ok(Err(err)) => err,
            Err(_) => PredictorError::Timeout(timeout),
        };

        match &failure {
            PredictorError::Disabled => {
                debug!(device_id = %snapshot.device_id, "Predictor disabled, using rules");
            }
            err => {
                self.logger.log_predictor_fallback(
                    &snapshot.device_id,
                    err.reason(),
                    &err.to_string(),
                );
                self.health
                    .set_degraded(components::PREDICTOR, err.to_string())
                    .await;
            }
        }
        self.metrics.inc_predictor_fallbacks(failure.reason());

        let outcome = self.rules.evaluate(snapshot);
        (outcome.actions, Some(outcome.tier))
    }
}

/// Builder for [`DecisionEngine`]
#[derive(Default)]
pub struct DecisionEngineBuilder {
    telemetry: Option<Arc<dyn TelemetrySource>>,
    registry: Option<Arc<dyn DeviceRegistry>>,
    decisions: Option<Arc<dyn DecisionStore>>,
    cooldowns: Option<Arc<dyn CooldownStore>>,
    predictor: Option<Arc<dyn Predictor>>,
    clock: Option<Arc<dyn Clock>>,
    rules: Option<RuleEngine>,
    cooldown_config: Option<CooldownConfig>,
    recorder_config: Option<RecorderConfig>,
    settings: Option<EngineSettings>,
    health: Option<HealthRegistry>,
    service_name: Option<String>,
}

impl DecisionEngineBuilder {
    /// Use one backend for every persistence seam
    pub fn store<S>(mut self, store: Arc<S>) -> Self
    where
        S: TelemetrySource + DeviceRegistry + DecisionStore + CooldownStore + 'static,
    {
        self.telemetry = Some(store.clone() as Arc<dyn TelemetrySource>);
        self.registry = Some(store.clone() as Arc<dyn DeviceRegistry>);
        self.decisions = Some(store.clone() as Arc<dyn DecisionStore>);
        self.cooldowns = Some(store as Arc<dyn CooldownStore>);
        self
    }

    pub fn telemetry(mut self, telemetry: Arc<dyn TelemetrySource>) -> Self {
        self.telemetry = Some(telemetry);
        self
    }

    pub fn registry(mut self, registry: Arc<dyn DeviceRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn decisions(mut self, decisions: Arc<dyn DecisionStore>) -> Self {
        self.decisions = Some(decisions);
        self
    }

    pub fn cooldowns(mut self, cooldowns: Arc<dyn CooldownStore>) -> Self {
        self.cooldowns = Some(cooldowns);
        self
    }

    pub fn predictor(mut self, predictor: Arc<dyn Predictor>) -> Self {
        self.predictor = Some(predictor);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn rules(mut self, rules: RuleEngine) -> Self {
        self.rules = Some(rules);
        self
    }

    pub fn cooldown_config(mut self, config: CooldownConfig) -> Self {
        self.cooldown_config = Some(config);
        self
    }

    pub fn recorder_config(mut self, config: RecorderConfig) -> Self {
        self.recorder_config = Some(config);
        self
    }

    pub fn settings(mut self, settings: EngineSettings) -> Self {
        self.settings = Some(settings);
        self
    }

    pub fn health(mut self, health: HealthRegistry) -> Self {
        self.health = Some(health);
        self
    }

    pub fn service_name(mut self, name: impl Into<String>) -> Self {
        self.service_name = Some(name.into());
        self
    }

    pub fn build(self) -> Result<DecisionEngine> {
        let telemetry = self
            .telemetry
            .ok_or_else(|| anyhow::anyhow!("telemetry source is required"))?;
        let registry = self
            .registry
            .ok_or_else(|| anyhow::anyhow!("device registry is required"))?;
        let decisions = self
            .decisions
            .ok_or_else(|| anyhow::anyhow!("decision store is required"))?;
        let cooldowns = self
            .cooldowns
            .ok_or_else(|| anyhow::anyhow!("cooldown store is required"))?;

        Ok(DecisionEngine {
            telemetry,
            registry,
            predictor: self.predictor.unwrap_or_else(|| Arc::new(DisabledPredictor)),
            rules: self.rules.unwrap_or_default(),
            guard: CooldownGuard::new(cooldowns, self.cooldown_config.unwrap_or_default()),
            recorder: DecisionRecorder::new(decisions, self.recorder_config.unwrap_or_default()),
            clock: self.clock.unwrap_or_else(|| Arc::new(SystemClock)),
            settings: self.settings.unwrap_or_default(),
            device_locks: DashMap::new(),
            health: self.health.unwrap_or_default(),
            metrics: EngineMetrics::new(),
            logger: StructuredLogger::new(
                self.service_name
                    .unwrap_or_else(|| "actuation-engine".to_string()),
            ),
        })
    }
}
