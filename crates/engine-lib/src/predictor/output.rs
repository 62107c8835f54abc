//! Predictor output post-processing

use super::Prediction;
use crate::models::{whole_seconds, ActionSet, ActionSource, ActionType};
use serde::Deserialize;

/// Response body of the inference service, in seconds
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RawPrediction {
    #[serde(rename = "phUp")]
    pub ph_up: f64,
    #[serde(rename = "phDown")]
    pub ph_down: f64,
    #[serde(rename = "nutrientAdd")]
    pub nutrient_add: f64,
    pub refill: f64,
    #[serde(default, alias = "modelVersion")]
    pub model: Option<String>,
}

impl RawPrediction {
    fn get(&self, action: ActionType) -> f64 {
        match action {
            ActionType::PhUp => self.ph_up,
            ActionType::PhDown => self.ph_down,
            ActionType::NutrientAdd => self.nutrient_add,
            ActionType::Refill => self.refill,
        }
    }
}

/// Clamps raw model outputs to actuator bounds
#[derive(Debug, Clone, Copy, Default)]
pub struct PredictionFormatter;

impl PredictionFormatter {
    pub fn new() -> Self {
        Self
    }

    /// Convert a raw response into a bounded `ml` action set
    pub fn format(&self, raw: &RawPrediction) -> Prediction {
        let mut actions = ActionSet::idle(ActionSource::Ml);
        let mut clamped = Vec::new();

        for action in ActionType::ALL {
            let secs = whole_seconds(raw.get(action));
            if secs > action.max_secs() {
                clamped.push(action);
            }
            actions.set(action, secs);
        }

        Prediction {
            actions,
            model: raw.model.clone(),
            clamped,
        }
    }
}
