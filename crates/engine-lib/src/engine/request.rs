//! Invocation contract

use super::{DecisionOutcome, EngineError};
use crate::models::{ActionSet, ActionSource, ActionType};
use serde::{Deserialize, Serialize};

/// Durations requested by a user, in seconds
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManualOverrides {
    #[serde(default)]
    pub ph_up: u32,
    #[serde(default)]
    pub ph_down: u32,
    #[serde(default)]
    pub nutrient_add: u32,
    #[serde(default)]
    pub refill: u32,
}

impl ManualOverrides {
    /// Clamp to actuator bounds and tag as manual
    pub fn into_action_set(self) -> ActionSet {
        ActionSet::idle(ActionSource::Manual)
            .with(ActionType::PhUp, self.ph_up)
            .with(ActionType::PhDown, self.ph_down)
            .with(ActionType::NutrientAdd, self.nutrient_add)
            .with(ActionType::Refill, self.refill)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RequestMode {
    /// Let the predictor or rule engine decide
    Auto,
    Manual(ManualOverrides),
}

impl RequestMode {
    pub fn is_manual(&self) -> bool {
        matches!(self, RequestMode::Manual(_))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DecisionRequest {
    pub device_id: String,
    pub mode: RequestMode,
    pub requested_by: Option<String>,
}

impl DecisionRequest {
    pub fn auto(device_id: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            mode: RequestMode::Auto,
            requested_by: None,
        }
    }

    pub fn manual(device_id: impl Into<String>, overrides: ManualOverrides) -> Self {
        Self {
            device_id: device_id.into(),
            mode: RequestMode::Manual(overrides),
            requested_by: None,
        }
    }

    pub fn requested_by(mut self, user_id: impl Into<String>) -> Self {
        self.requested_by = Some(user_id.into());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseStatus {
    Ok,
    Error,
}

/// Wire form of an invocation result
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DecisionResponse {
    pub status: ResponseStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub decision_id: Option<i64>,
    #[serde(flatten)]
    pub actions: Option<ActionSet>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl From<&DecisionOutcome> for DecisionResponse {
    fn from(outcome: &DecisionOutcome) -> Self {
        Self {
            status: ResponseStatus::Ok,
            decision_id: Some(outcome.decision_id),
            actions: Some(outcome.actions),
            error: None,
        }
    }
}

impl From<&EngineError> for DecisionResponse {
    fn from(err: &EngineError) -> Self {
        Self {
            status: ResponseStatus::Error,
            decision_id: None,
            actions: None,
            error: Some(err.to_string()),
        }
    }
}

impl From<&Result<DecisionOutcome, EngineError>> for DecisionResponse {
    fn from(result: &Result<DecisionOutcome, EngineError>) -> Self {
        match result {
            Ok(outcome) => outcome.into(),
            Err(err) => err.into(),
        }
    }
}
