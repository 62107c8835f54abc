//! Core data models for the actuation engine

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Most recent telemetry reading for a device
///
/// Owned by the ingestion side; the engine only ever reads it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TelemetrySnapshot {
    pub device_id: String,
    pub ppm: f64,
    pub ph: f64,
    pub temp_c: f64,
    pub humidity: f64,
    pub water_temp: f64,
    pub water_level: f64,
    pub captured_at: DateTime<Utc>,
}

impl TelemetrySnapshot {
    /// Snapshot with every reading at zero, used when a device has no telemetry yet
    pub fn zeroed(device_id: impl Into<String>, captured_at: DateTime<Utc>) -> Self {
        Self {
            device_id: device_id.into(),
            ppm: 0.0,
            ph: 0.0,
            temp_c: 0.0,
            humidity: 0.0,
            water_temp: 0.0,
            water_level: 0.0,
            captured_at,
        }
    }
}

/// One of the four dosing/refill actuators on a kit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ActionType {
    PhUp,
    PhDown,
    NutrientAdd,
    Refill,
}

impl ActionType {
    pub const ALL: [ActionType; 4] = [
        ActionType::PhUp,
        ActionType::PhDown,
        ActionType::NutrientAdd,
        ActionType::Refill,
    ];

    /// Stable identifier used in storage and on the wire
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionType::PhUp => "phUp",
            ActionType::PhDown => "phDown",
            ActionType::NutrientAdd => "nutrientAdd",
            ActionType::Refill => "refill",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "phUp" => Some(ActionType::PhUp),
            "phDown" => Some(ActionType::PhDown),
            "nutrientAdd" => Some(ActionType::NutrientAdd),
            "refill" => Some(ActionType::Refill),
            _ => None,
        }
    }

    /// Human-readable label used in notifications
    pub fn label(&self) -> &'static str {
        match self {
            ActionType::PhUp => "pH Up",
            ActionType::PhDown => "pH Down",
            ActionType::NutrientAdd => "Nutrient",
            ActionType::Refill => "Refill",
        }
    }

    /// Upper bound on a single actuation, in seconds
    pub fn max_secs(&self) -> u32 {
        match self {
            ActionType::PhUp | ActionType::PhDown => 12,
            ActionType::NutrientAdd => 20,
            ActionType::Refill => 25,
        }
    }
}

impl fmt::Display for ActionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where an action set came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionSource {
    /// Priority-cascade rule engine
    Rule,
    /// External predictive model
    Ml,
    /// Durations supplied by a user
    Manual,
}

impl ActionSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionSource::Rule => "rule",
            ActionSource::Ml => "ml",
            ActionSource::Manual => "manual",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "rule" => Some(ActionSource::Rule),
            "ml" => Some(ActionSource::Ml),
            "manual" => Some(ActionSource::Manual),
            _ => None,
        }
    }
}

impl fmt::Display for ActionSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Convert a raw duration into whole actuator seconds.
///
/// Non-finite and non-positive values become 0; everything else is rounded
/// to the nearest second.
pub fn whole_seconds(raw: f64) -> u32 {
    if !raw.is_finite() || raw <= 0.0 {
        return 0;
    }
    raw.round() as u32
}

/// Durations for all four actuators plus their provenance.
///
/// Fields are only reachable through methods so that `value_s` always equals
/// the largest of the four durations and every duration stays within
/// [`ActionType::max_secs`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ActionSet {
    #[serde(rename = "phUp")]
    ph_up: u32,
    #[serde(rename = "phDown")]
    ph_down: u32,
    #[serde(rename = "nutrientAdd")]
    nutrient_add: u32,
    #[serde(rename = "refill")]
    refill: u32,
    #[serde(rename = "valueS")]
    value_s: u32,
    source: ActionSource,
}

impl ActionSet {
    /// Action set with nothing to actuate
    pub fn idle(source: ActionSource) -> Self {
        Self {
            ph_up: 0,
            ph_down: 0,
            nutrient_add: 0,
            refill: 0,
            value_s: 0,
            source,
        }
    }

    /// Builder-style variant of [`ActionSet::set`]
    pub fn with(mut self, action: ActionType, secs: u32) -> Self {
        self.set(action, secs);
        self
    }

    /// Set one duration, clamped to the actuator bound
    pub fn set(&mut self, action: ActionType, secs: u32) {
        let secs = secs.min(action.max_secs());
        match action {
            ActionType::PhUp => self.ph_up = secs,
            ActionType::PhDown => self.ph_down = secs,
            ActionType::NutrientAdd => self.nutrient_add = secs,
            ActionType::Refill => self.refill = secs,
        }
        self.value_s = self.ph_up.max(self.ph_down).max(self.nutrient_add).max(self.refill);
    }

    /// Zero out one action
    pub fn suppress(&mut self, action: ActionType) {
        self.set(action, 0);
    }

    pub fn get(&self, action: ActionType) -> u32 {
        match action {
            ActionType::PhUp => self.ph_up,
            ActionType::PhDown => self.ph_down,
            ActionType::NutrientAdd => self.nutrient_add,
            ActionType::Refill => self.refill,
        }
    }

    pub fn ph_up(&self) -> u32 {
        self.ph_up
    }

    pub fn ph_down(&self) -> u32 {
        self.ph_down
    }

    pub fn nutrient_add(&self) -> u32 {
        self.nutrient_add
    }

    pub fn refill(&self) -> u32 {
        self.refill
    }

    /// Longest duration in the set
    pub fn value_s(&self) -> u32 {
        self.value_s
    }

    pub fn source(&self) -> ActionSource {
        self.source
    }

    pub fn is_idle(&self) -> bool {
        self.value_s == 0
    }

    /// Non-zero actions in canonical order
    pub fn active(&self) -> impl Iterator<Item = (ActionType, u32)> + '_ {
        ActionType::ALL
            .into_iter()
            .map(|action| (action, self.get(action)))
            .filter(|(_, secs)| *secs > 0)
    }

    /// Short description such as `pH Up: 4s, Refill: 6s`
    pub fn summary(&self) -> String {
        self.active()
            .map(|(action, secs)| format!("{}: {}s", action.label(), secs))
            .collect::<Vec<_>>()
            .join(", ")
    }
}

/// Last accepted firing of one action type on one device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CooldownRecord {
    pub device_id: String,
    pub action: ActionType,
    pub last_fired_at: DateTime<Utc>,
    pub last_value: u32,
}

impl CooldownRecord {
    /// Whether the window this firing opened still covers `now`.
    ///
    /// A zero window never holds. A firing stamped after `now` holds
    /// until the clocks agree again.
    pub fn holds(&self, now: DateTime<Utc>, window: Duration) -> bool {
        if window.is_zero() {
            return false;
        }
        match (now - self.last_fired_at).to_std() {
            Ok(elapsed) => elapsed < window,
            Err(_) => true,
        }
    }
}

/// Decision about to be persisted
#[derive(Debug, Clone, PartialEq)]
pub struct NewDecision {
    pub device_id: String,
    pub recorded_at: DateTime<Utc>,
    pub actions: ActionSet,
    pub manual: bool,
    pub auto: bool,
}

/// Persisted, immutable decision
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DecisionEvent {
    pub id: i64,
    pub device_id: String,
    pub ingest_time: DateTime<Utc>,
    #[serde(flatten)]
    pub actions: ActionSet,
    pub manual: bool,
    pub auto: bool,
}

impl DecisionEvent {
    pub fn from_new(id: i64, decision: &NewDecision) -> Self {
        Self {
            id,
            device_id: decision.device_id.clone(),
            ingest_time: decision.recorded_at,
            actions: decision.actions,
            manual: decision.manual,
            auto: decision.auto,
        }
    }
}

/// A (user, device) pair with autonomous mode switched on
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AutoModeRegistration {
    pub user_id: String,
    pub device_id: String,
    pub enabled: bool,
}
