//! Critical reading detection

use crate::models::TelemetrySnapshot;
use serde::Serialize;
use std::fmt;

/// A reading far enough outside the safe band that throttling must not apply
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum CriticalCondition {
    PhOutOfRange,
    PpmOutOfRange,
    WaterLevelLow,
}

impl fmt::Display for CriticalCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CriticalCondition::PhOutOfRange => "ph-out-of-range",
            CriticalCondition::PpmOutOfRange => "ppm-out-of-range",
            CriticalCondition::WaterLevelLow => "water-level-low",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CriticalThresholds {
    pub ph_min: f64,
    pub ph_max: f64,
    pub ppm_min: f64,
    pub ppm_max: f64,
    pub water_level_min: f64,
}

impl Default for CriticalThresholds {
    fn default() -> Self {
        Self {
            ph_min: 5.0,
            ph_max: 7.0,
            ppm_min: 400.0,
            ppm_max: 1200.0,
            water_level_min: 1.0,
        }
    }
}

impl CriticalThresholds {
    /// Every critical condition the snapshot triggers
    pub fn breaches(&self, snapshot: &TelemetrySnapshot) -> Vec<CriticalCondition> {
        let mut breaches = Vec::new();
        if snapshot.ph < self.ph_min || snapshot.ph > self.ph_max {
            breaches.push(CriticalCondition::PhOutOfRange);
        }
        if snapshot.ppm < self.ppm_min || snapshot.ppm > self.ppm_max {
            breaches.push(CriticalCondition::PpmOutOfRange);
        }
        if snapshot.water_level < self.water_level_min {
            breaches.push(CriticalCondition::WaterLevelLow);
        }
        breaches
    }

    pub fn is_critical(&self, snapshot: &TelemetrySnapshot) -> bool {
        !self.breaches(snapshot).is_empty()
    }
}
