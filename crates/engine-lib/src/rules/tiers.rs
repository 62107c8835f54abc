//! Ordered priority cascade
//!
//! Each [`Rule`] pairs a tier with a predicate and an action builder. The
//! cascade is evaluated top to bottom and the first matching rule fires
//! exclusively.

use super::Setpoints;
use crate::models::{whole_seconds, ActionSet, ActionSource, ActionType, TelemetrySnapshot};
use serde::Serialize;
use std::fmt;

/// Refill seconds per unit of water level below the minimum
const WATER_LEVEL_GAIN: f64 = 20.0;
/// ppm per second of dilution or nutrient dosing
const PPM_PER_SECOND: f64 = 20.0;
/// Dosing seconds per pH unit outside the band
const PH_GAIN: f64 = 8.0;
/// Dilution refills are capped below the actuator maximum
const DILUTION_MAX_SECS: u32 = 15;
/// Fixed duration of a fine-tuning pulse
const MICRO_PULSE_SECS: u32 = 1;

/// Priority level in the cascade, safety-critical first
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Tier {
    CriticalWaterLevel,
    Dilution,
    AcidityCorrection,
    NutrientAddition,
    MicroAdjustment,
}

impl Tier {
    /// 1-based position in the cascade
    pub fn rank(&self) -> u8 {
        match self {
            Tier::CriticalWaterLevel => 1,
            Tier::Dilution => 2,
            Tier::AcidityCorrection => 3,
            Tier::NutrientAddition => 4,
            Tier::MicroAdjustment => 5,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::CriticalWaterLevel => "critical-water-level",
            Tier::Dilution => "dilution",
            Tier::AcidityCorrection => "acidity-correction",
            Tier::NutrientAddition => "nutrient-addition",
            Tier::MicroAdjustment => "micro-adjustment",
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

type Predicate = fn(&TelemetrySnapshot, &Setpoints) -> bool;
type Builder = fn(&TelemetrySnapshot, &Setpoints) -> ActionSet;

/// One entry of the cascade
pub struct Rule {
    pub tier: Tier,
    pub applies: Predicate,
    pub build: Builder,
}

/// The cascade, in evaluation order
pub static RULES: [Rule; 5] = [
    Rule {
        tier: Tier::CriticalWaterLevel,
        applies: water_level_critical,
        build: refill_to_minimum,
    },
    Rule {
        tier: Tier::Dilution,
        applies: concentration_high,
        build: dilute,
    },
    Rule {
        tier: Tier::AcidityCorrection,
        applies: ph_out_of_band,
        build: correct_ph,
    },
    Rule {
        tier: Tier::NutrientAddition,
        applies: concentration_low,
        build: add_nutrient,
    },
    Rule {
        tier: Tier::MicroAdjustment,
        applies: always,
        build: fine_tune,
    },
];

fn seconds(raw: f64, cap: u32) -> u32 {
    whole_seconds(raw).min(cap)
}

fn rule_set() -> ActionSet {
    ActionSet::idle(ActionSource::Rule)
}

fn water_level_critical(s: &TelemetrySnapshot, p: &Setpoints) -> bool {
    s.water_level < p.water_level_min
}

fn refill_to_minimum(s: &TelemetrySnapshot, p: &Setpoints) -> ActionSet {
    let refill = seconds(
        (p.water_level_min - s.water_level) * WATER_LEVEL_GAIN,
        ActionType::Refill.max_secs(),
    );
    rule_set().with(ActionType::Refill, refill)
}

fn concentration_high(s: &TelemetrySnapshot, p: &Setpoints) -> bool {
    s.ppm > p.ppm_max && s.water_level < p.water_level_max
}

fn dilute(s: &TelemetrySnapshot, p: &Setpoints) -> ActionSet {
    let refill = seconds((s.ppm - p.ppm_max) / PPM_PER_SECOND, DILUTION_MAX_SECS);
    rule_set().with(ActionType::Refill, refill)
}

fn ph_out_of_band(s: &TelemetrySnapshot, p: &Setpoints) -> bool {
    s.ph < p.ph_min || s.ph > p.ph_max
}

fn correct_ph(s: &TelemetrySnapshot, p: &Setpoints) -> ActionSet {
    if s.ph < p.ph_min {
        let secs = seconds((p.ph_min - s.ph) * PH_GAIN, ActionType::PhUp.max_secs());
        rule_set().with(ActionType::PhUp, secs)
    } else {
        let secs = seconds((s.ph - p.ph_max) * PH_GAIN, ActionType::PhDown.max_secs());
        rule_set().with(ActionType::PhDown, secs)
    }
}

fn concentration_low(s: &TelemetrySnapshot, p: &Setpoints) -> bool {
    s.ppm < p.ppm_min
}

fn add_nutrient(s: &TelemetrySnapshot, p: &Setpoints) -> ActionSet {
    let secs = seconds(
        (p.ppm_min - s.ppm) / PPM_PER_SECOND,
        ActionType::NutrientAdd.max_secs(),
    );
    rule_set().with(ActionType::NutrientAdd, secs)
}

fn always(_: &TelemetrySnapshot, _: &Setpoints) -> bool {
    true
}

// At most one pulse per parameter; pulses on different parameters combine.
fn fine_tune(s: &TelemetrySnapshot, p: &Setpoints) -> ActionSet {
    let mut actions = rule_set();

    if s.ph >= p.ph_min && s.ph < p.ph_micro_low {
        actions.set(ActionType::PhUp, MICRO_PULSE_SECS);
    } else if s.ph > p.ph_micro_high && s.ph <= p.ph_max {
        actions.set(ActionType::PhDown, MICRO_PULSE_SECS);
    }

    if s.ppm >= p.ppm_min && s.ppm < p.ppm_micro {
        actions.set(ActionType::NutrientAdd, MICRO_PULSE_SECS);
    }

    if s.water_level >= p.water_level_min && s.water_level < p.water_level_micro {
        actions.set(ActionType::Refill, MICRO_PULSE_SECS);
    }

    actions
}
