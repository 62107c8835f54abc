//! Pipeline tests against the in-memory store

use super::*;
use crate::clock::ManualClock;
use crate::health::ComponentStatus;
use crate::models::{ActionSource, CooldownRecord, DecisionEvent};
use crate::predictor::{Prediction, PredictionFormatter, RawPrediction};
use crate::store::{CooldownClaim, MemoryStore, MAX_HISTORY_LIMIT};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};

const DEVICE: &str = "kit-1";

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 1, 8, 0, 0).unwrap()
}

fn snapshot(ph: f64, ppm: f64, water_level: f64) -> TelemetrySnapshot {
    TelemetrySnapshot {
        device_id: DEVICE.to_string(),
        ph,
        ppm,
        water_level,
        temp_c: 24.0,
        humidity: 55.0,
        water_temp: 21.0,
        captured_at: t0(),
    }
}

struct Harness {
    store: Arc<MemoryStore>,
    clock: Arc<ManualClock>,
    engine: Arc<DecisionEngine>,
}

impl Harness {
    fn new() -> Self {
        Self::with(|builder| builder)
    }

    fn with(configure: impl FnOnce(DecisionEngineBuilder) -> DecisionEngineBuilder) -> Self {
        let store = Arc::new(MemoryStore::new());
        store.register_device(DEVICE);
        let clock = Arc::new(ManualClock::new(t0()));

        let builder = DecisionEngine::builder()
            .store(store.clone())
            .clock(clock.clone());
        let engine = configure(builder).build().unwrap();

        Self {
            store,
            clock,
            engine: Arc::new(engine),
        }
    }

    async fn decide(&self, ph: f64, ppm: f64, water_level: f64) -> DecisionOutcome {
        self.store.put_snapshot(snapshot(ph, ppm, water_level));
        self.engine
            .invoke(DecisionRequest::auto(DEVICE))
            .await
            .unwrap()
    }

    async fn stored(&self, id: i64) -> DecisionEvent {
        self.store
            .decision_history(DEVICE, MAX_HISTORY_LIMIT)
            .await
            .unwrap()
            .into_iter()
            .find(|event| event.id == id)
            .unwrap()
    }
}

/// Predictor returning a fixed raw response
struct FixedPredictor(RawPrediction);

#[async_trait]
impl Predictor for FixedPredictor {
    async fn predict(&self, _: &TelemetrySnapshot) -> Result<Prediction, PredictorError> {
        Ok(PredictionFormatter::new().format(&self.0))
    }

    fn name(&self) -> &str {
        "fixed"
    }
}

struct SlowPredictor;

#[async_trait]
impl Predictor for SlowPredictor {
    async fn predict(&self, _: &TelemetrySnapshot) -> Result<Prediction, PredictorError> {
        tokio::time::sleep(Duration::from_secs(10)).await;
        Err(PredictorError::Connect("unreachable".into()))
    }

    fn name(&self) -> &str {
        "slow"
    }
}

struct FailingPredictor;

#[async_trait]
impl Predictor for FailingPredictor {
    async fn predict(&self, _: &TelemetrySnapshot) -> Result<Prediction, PredictorError> {
        Err(PredictorError::Status(503))
    }

    fn name(&self) -> &str {
        "failing"
    }
}

/// Decision store whose inserts always collide
struct ConflictingDecisions;

#[async_trait]
impl DecisionStore for ConflictingDecisions {
    async fn insert_decision(&self, _: &NewDecision) -> Result<i64, StoreError> {
        Err(StoreError::Conflict("Key (id)=(1) already exists".into()))
    }

    async fn repair_sequence(&self) -> Result<(), StoreError> {
        Ok(())
    }

    async fn latest_decision(&self, _: &str) -> Result<Option<DecisionEvent>, StoreError> {
        Ok(None)
    }

    async fn decision_history(&self, _: &str, _: u32) -> Result<Vec<DecisionEvent>, StoreError> {
        Ok(vec![])
    }
}

/// Shared cooldown table behind a database-like round trip
struct SlowCooldowns {
    inner: Arc<MemoryStore>,
    latency: Duration,
}

#[async_trait]
impl CooldownStore for SlowCooldowns {
    async fn cooldown(
        &self,
        device_id: &str,
        action: ActionType,
    ) -> Result<Option<CooldownRecord>, StoreError> {
        tokio::time::sleep(self.latency).await;
        self.inner.cooldown(device_id, action).await
    }

    async fn claim_cooldown(
        &self,
        record: &CooldownRecord,
        window: Duration,
    ) -> Result<CooldownClaim, StoreError> {
        tokio::time::sleep(self.latency).await;
        self.inner.claim_cooldown(record, window).await
    }

    async fn release_cooldown(
        &self,
        claimed: &CooldownRecord,
        previous: Option<&CooldownRecord>,
    ) -> Result<(), StoreError> {
        tokio::time::sleep(self.latency).await;
        self.inner.release_cooldown(claimed, previous).await
    }
}

#[tokio::test]
async fn test_low_ph_doses_ph_up() {
    let harness = Harness::new();
    let outcome = harness.decide(5.0, 700.0, 2.0).await;

    assert_eq!(outcome.actions.ph_up(), 4);
    assert_eq!(outcome.actions.ph_down(), 0);
    assert_eq!(outcome.actions.nutrient_add(), 0);
    assert_eq!(outcome.actions.refill(), 0);
    assert_eq!(outcome.actions.value_s(), 4);
    assert_eq!(outcome.actions.source(), ActionSource::Rule);
    assert_eq!(outcome.tier, Some(Tier::AcidityCorrection));

    let event = harness.stored(outcome.decision_id).await;
    assert_eq!(event.actions, outcome.actions);
    assert!(event.auto);
    assert!(!event.manual);
    assert_eq!(event.ingest_time, t0());
}

#[tokio::test]
async fn test_critical_water_level_refills() {
    let harness = Harness::new();
    let outcome = harness.decide(6.0, 700.0, 0.9).await;

    assert_eq!(outcome.actions.refill(), 6);
    assert_eq!(outcome.actions.ph_up(), 0);
    assert_eq!(outcome.actions.ph_down(), 0);
    assert_eq!(outcome.actions.nutrient_add(), 0);
    assert_eq!(outcome.tier, Some(Tier::CriticalWaterLevel));
}

#[tokio::test]
async fn test_high_concentration_dilutes() {
    let harness = Harness::new();
    let outcome = harness.decide(6.0, 900.0, 2.0).await;

    assert_eq!(outcome.actions.refill(), 3);
    assert_eq!(outcome.actions.value_s(), 3);
    assert_eq!(outcome.tier, Some(Tier::Dilution));
}

#[tokio::test]
async fn test_repeat_within_window_is_suppressed() {
    let harness = Harness::new();
    let first = harness.decide(5.0, 700.0, 2.0).await;
    assert_eq!(first.actions.ph_up(), 4);

    harness.clock.advance(Duration::from_secs(60));
    let second = harness.decide(5.0, 700.0, 2.0).await;

    assert_eq!(second.actions.ph_up(), 0);
    assert_eq!(second.actions.value_s(), 0);
    assert_eq!(second.suppressed, vec![ActionType::PhUp]);
    assert!(second.decision_id > first.decision_id);

    let event = harness.stored(second.decision_id).await;
    assert!(event.actions.is_idle());
}

#[tokio::test]
async fn test_critical_reading_bypasses_cooldown() {
    let harness = Harness::new();
    harness.decide(5.0, 700.0, 2.0).await;

    harness.clock.advance(Duration::from_secs(60));
    let outcome = harness.decide(4.0, 700.0, 2.0).await;

    assert_eq!(outcome.actions.ph_up(), 12);
    assert!(outcome.suppressed.is_empty());
    assert_eq!(outcome.critical, vec![CriticalCondition::PhOutOfRange]);
}

#[tokio::test]
async fn test_critical_bypass_one_second_after_firing() {
    let harness = Harness::new();
    harness.decide(4.0, 700.0, 2.0).await;

    harness.clock.advance(Duration::from_secs(1));
    let outcome = harness.decide(4.0, 700.0, 2.0).await;

    assert_eq!(outcome.actions.ph_up(), 12);
}

#[tokio::test]
async fn test_suppression_does_not_extend_window() {
    let harness = Harness::new();
    harness.decide(5.0, 700.0, 2.0).await;

    harness.clock.advance(Duration::from_secs(60));
    let held = harness.decide(5.0, 700.0, 2.0).await;
    assert_eq!(held.actions.ph_up(), 0);

    harness.clock.advance(Duration::from_secs(120));
    let released = harness.decide(5.0, 700.0, 2.0).await;
    assert_eq!(released.actions.ph_up(), 4);

    let record = harness
        .store
        .cooldown(DEVICE, ActionType::PhUp)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.last_fired_at, t0() + chrono::Duration::seconds(180));
}

#[tokio::test]
async fn test_other_actions_unaffected_by_cooldown() {
    let harness = Harness::new();
    harness.decide(5.0, 700.0, 2.0).await;

    harness.clock.advance(Duration::from_secs(30));
    let outcome = harness.decide(6.0, 400.0, 2.0).await;

    assert_eq!(outcome.actions.nutrient_add(), 8);
    assert!(outcome.suppressed.is_empty());
}

#[tokio::test]
async fn test_unknown_device_rejected_before_pipeline() {
    let harness = Harness::new();
    let err = harness
        .engine
        .invoke(DecisionRequest::auto("kit-404"))
        .await
        .unwrap_err();

    assert!(matches!(err, EngineError::UnknownDevice(ref id) if id == "kit-404"));
    assert_eq!(harness.store.decision_count().await, 0);

    let err = harness
        .engine
        .invoke(DecisionRequest::auto("   "))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::UnknownDevice(_)));
}

#[tokio::test]
async fn test_device_id_is_trimmed() {
    let harness = Harness::new();
    harness.store.put_snapshot(snapshot(5.0, 700.0, 2.0));

    let outcome = harness
        .engine
        .invoke(DecisionRequest::auto("  kit-1 \n"))
        .await
        .unwrap();
    assert_eq!(outcome.device_id, DEVICE);
}

#[tokio::test]
async fn test_missing_telemetry_uses_zeroed_snapshot() {
    let harness = Harness::new();
    let outcome = harness
        .engine
        .invoke(DecisionRequest::auto(DEVICE))
        .await
        .unwrap();

    assert_eq!(outcome.tier, Some(Tier::CriticalWaterLevel));
    assert_eq!(outcome.actions.refill(), 24);
    assert!(outcome.critical.is_empty());
}

#[tokio::test]
async fn test_missing_telemetry_refill_respects_cooldown() {
    let harness = Harness::new();
    let first = harness
        .engine
        .invoke(DecisionRequest::auto(DEVICE))
        .await
        .unwrap();
    assert_eq!(first.actions.refill(), 24);

    harness.clock.advance(Duration::from_secs(30));
    let second = harness
        .engine
        .invoke(DecisionRequest::auto(DEVICE))
        .await
        .unwrap();
    assert_eq!(second.actions.refill(), 0);
    assert_eq!(second.suppressed, vec![ActionType::Refill]);

    harness.clock.advance(Duration::from_secs(150));
    let third = harness
        .engine
        .invoke(DecisionRequest::auto(DEVICE))
        .await
        .unwrap();
    assert_eq!(third.actions.refill(), 24);
}

#[tokio::test]
async fn test_predictor_output_is_used_and_clamped() {
    let harness = Harness::with(|b| {
        b.predictor(Arc::new(FixedPredictor(RawPrediction {
            ph_up: 0.0,
            ph_down: 90.0,
            nutrient_add: 3.0,
            refill: 0.0,
            model: Some("rf-2".into()),
        })))
    });
    let outcome = harness.decide(6.0, 700.0, 2.0).await;

    assert_eq!(outcome.actions.source(), ActionSource::Ml);
    assert_eq!(outcome.actions.ph_down(), 12);
    assert_eq!(outcome.actions.nutrient_add(), 3);
    assert_eq!(outcome.actions.value_s(), 12);
    assert_eq!(outcome.tier, None);

    let stored = harness.stored(outcome.decision_id).await;
    assert_eq!(stored.actions.source(), ActionSource::Ml);
}

#[tokio::test]
async fn test_predictor_timeout_falls_back_to_rules() {
    let harness = Harness::with(|b| {
        b.predictor(Arc::new(SlowPredictor)).settings(EngineSettings {
            predictor_timeout: Duration::from_millis(50),
        })
    });
    harness.engine.health().register(components::PREDICTOR).await;

    let started = Instant::now();
    let outcome = harness.decide(5.0, 700.0, 2.0).await;

    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(outcome.actions.source(), ActionSource::Rule);
    assert_eq!(outcome.actions.ph_up(), 4);
    assert_eq!(
        harness
            .engine
            .health()
            .component(components::PREDICTOR)
            .await
            .unwrap()
            .status,
        ComponentStatus::Degraded
    );
}

#[tokio::test]
async fn test_predictor_error_status_falls_back_to_rules() {
    let harness = Harness::with(|b| b.predictor(Arc::new(FailingPredictor)));
    let outcome = harness.decide(6.0, 900.0, 2.0).await;

    assert_eq!(outcome.actions.source(), ActionSource::Rule);
    assert_eq!(outcome.actions.refill(), 3);
}

#[tokio::test]
async fn test_manual_overrides_pass_through_guard() {
    let harness = Harness::new();
    harness.store.put_snapshot(snapshot(6.0, 700.0, 2.0));

    let overrides = ManualOverrides {
        ph_up: 3,
        refill: 40,
        ..Default::default()
    };
    let outcome = harness
        .engine
        .invoke(DecisionRequest::manual(DEVICE, overrides).requested_by("user-1"))
        .await
        .unwrap();

    assert_eq!(outcome.actions.source(), ActionSource::Manual);
    assert_eq!(outcome.actions.ph_up(), 3);
    assert_eq!(outcome.actions.refill(), 25);
    assert!(outcome.manual);
    assert_eq!(outcome.requested_by.as_deref(), Some("user-1"));

    let event = harness.stored(outcome.decision_id).await;
    assert!(event.manual);
    assert!(!event.auto);

    harness.clock.advance(Duration::from_secs(10));
    let repeat = harness
        .engine
        .invoke(DecisionRequest::manual(DEVICE, overrides))
        .await
        .unwrap();
    assert!(repeat.actions.is_idle());
    assert_eq!(repeat.suppressed, vec![ActionType::PhUp, ActionType::Refill]);
}

#[tokio::test]
async fn test_concurrent_requests_fire_action_once() {
    let harness = Harness::new();
    harness.store.put_snapshot(snapshot(5.0, 700.0, 2.0));

    let auto = {
        let engine = harness.engine.clone();
        tokio::spawn(async move { engine.invoke(DecisionRequest::auto(DEVICE)).await })
    };
    let manual = {
        let engine = harness.engine.clone();
        tokio::spawn(async move {
            let overrides = ManualOverrides {
                ph_up: 4,
                ..Default::default()
            };
            engine.invoke(DecisionRequest::manual(DEVICE, overrides)).await
        })
    };

    let auto = auto.await.unwrap().unwrap();
    let manual = manual.await.unwrap().unwrap();

    let fired = [auto.actions.ph_up(), manual.actions.ph_up()]
        .iter()
        .filter(|secs| **secs > 0)
        .count();
    assert_eq!(fired, 1);
    assert_eq!(harness.store.decision_count().await, 2);
}

#[tokio::test]
async fn test_engines_sharing_a_store_fire_action_once() {
    let store = Arc::new(MemoryStore::new());
    store.register_device(DEVICE);
    store.put_snapshot(snapshot(5.0, 700.0, 2.0));
    let clock = Arc::new(ManualClock::new(t0()));

    let engine = || {
        DecisionEngine::builder()
            .store(store.clone())
            .cooldowns(Arc::new(SlowCooldowns {
                inner: store.clone(),
                latency: Duration::from_millis(20),
            }))
            .clock(clock.clone())
            .build()
            .unwrap()
    };
    let (a, b) = (engine(), engine());

    let (first, second) = tokio::join!(
        a.invoke(DecisionRequest::auto(DEVICE)),
        b.invoke(DecisionRequest::auto(DEVICE))
    );
    let (first, second) = (first.unwrap(), second.unwrap());

    let mut doses = [first.actions.ph_up(), second.actions.ph_up()];
    doses.sort_unstable();
    assert_eq!(doses, [0, 4]);
    assert_eq!(store.decision_count().await, 2);

    let held = if first.actions.ph_up() == 0 { &first } else { &second };
    assert_eq!(held.suppressed, vec![ActionType::PhUp]);
}

#[tokio::test]
async fn test_exhausted_retries_surface_error_without_cooldown() {
    let harness = Harness::with(|b| b.decisions(Arc::new(ConflictingDecisions)));
    harness.store.put_snapshot(snapshot(5.0, 700.0, 2.0));

    let err = harness
        .engine
        .invoke(DecisionRequest::auto(DEVICE))
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        EngineError::Record(RecordError::Exhausted { attempts: 2, .. })
    ));
    // The window claimed before recording was handed back
    assert!(harness
        .store
        .cooldown(DEVICE, ActionType::PhUp)
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn test_value_s_matches_max_after_filtering() {
    let harness = Harness::new();
    let readings = [
        (5.0, 700.0, 2.0),
        (5.6, 600.0, 1.3),
        (6.0, 400.0, 2.0),
        (5.6, 600.0, 1.3),
        (7.2, 1300.0, 0.5),
        (6.0, 700.0, 2.0),
    ];

    for (ph, ppm, water_level) in readings {
        harness.clock.advance(Duration::from_secs(20));
        let outcome = harness.decide(ph, ppm, water_level).await;
        let max = ActionType::ALL
            .iter()
            .map(|a| outcome.actions.get(*a))
            .max()
            .unwrap_or(0);
        assert_eq!(outcome.actions.value_s(), max);
    }
}
