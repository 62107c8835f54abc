//! Rule-based actuation controller
//!
//! Deterministic, I/O-free fallback used whenever the predictor cannot be
//! trusted. Readings are matched against a priority cascade ([`RULES`]) that
//! runs from safety-critical corrections down to cosmetic fine tuning.

mod tiers;

pub use tiers::{Rule, Tier, RULES};

use crate::models::{ActionSet, TelemetrySnapshot};
use serde::Serialize;

/// Thresholds the cascade is evaluated against
#[derive(Debug, Clone, PartialEq)]
pub struct Setpoints {
    pub water_level_min: f64,
    pub water_level_max: f64,
    /// Below this the refill pulse applies
    pub water_level_micro: f64,
    pub ppm_min: f64,
    pub ppm_max: f64,
    /// Below this the nutrient pulse applies
    pub ppm_micro: f64,
    pub ph_min: f64,
    pub ph_max: f64,
    pub ph_micro_low: f64,
    pub ph_micro_high: f64,
}

impl Default for Setpoints {
    fn default() -> Self {
        Self {
            water_level_min: 1.2,
            water_level_max: 2.5,
            water_level_micro: 1.5,
            ppm_min: 560.0,
            ppm_max: 840.0,
            ppm_micro: 650.0,
            ph_min: 5.5,
            ph_max: 6.5,
            ph_micro_low: 5.7,
            ph_micro_high: 6.3,
        }
    }
}

/// Result of running the cascade
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RuleOutcome {
    /// Tier that fired
    pub tier: Tier,
    pub actions: ActionSet,
}

/// How a single tier fared during evaluation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TierVerdict {
    Fired,
    Passed,
    /// Not evaluated because an earlier tier fired
    Skipped,
}

impl TierVerdict {
    pub fn as_str(&self) -> &'static str {
        match self {
            TierVerdict::Fired => "fired",
            TierVerdict::Passed => "passed",
            TierVerdict::Skipped => "skipped",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TierTrace {
    pub tier: Tier,
    pub verdict: TierVerdict,
}

/// Evaluates snapshots against the cascade
#[derive(Debug, Clone, Default)]
pub struct RuleEngine {
    setpoints: Setpoints,
}

impl RuleEngine {
    pub fn new(setpoints: Setpoints) -> Self {
        Self { setpoints }
    }

    pub fn setpoints(&self) -> &Setpoints {
        &self.setpoints
    }

    /// Run the cascade and return the first tier that fires
    pub fn evaluate(&self, snapshot: &TelemetrySnapshot) -> RuleOutcome {
        for rule in RULES.iter() {
            if (rule.applies)(snapshot, &self.setpoints) {
                return RuleOutcome {
                    tier: rule.tier,
                    actions: (rule.build)(snapshot, &self.setpoints),
                };
            }
        }
        // The final tier is a catch-all, so this is unreachable in practice.
        let fallback = &RULES[RULES.len() - 1];
        RuleOutcome {
            tier: fallback.tier,
            actions: (fallback.build)(snapshot, &self.setpoints),
        }
    }

    /// Per-tier verdicts for the same evaluation [`RuleEngine::evaluate`] performs
    pub fn explain(&self, snapshot: &TelemetrySnapshot) -> Vec<TierTrace> {
        let mut fired = false;
        RULES
            .iter()
            .map(|rule| {
                let verdict = if fired {
                    TierVerdict::Skipped
                } else if (rule.applies)(snapshot, &self.setpoints) {
                    fired = true;
                    TierVerdict::Fired
                } else {
                    TierVerdict::Passed
                };
                TierTrace {
                    tier: rule.tier,
                    verdict,
                }
            })
            .collect()
    }
}
