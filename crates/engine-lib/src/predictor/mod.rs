//! Predictive model client
//!
//! The predictor is an external inference service that proposes actuator
//! durations from a telemetry snapshot. Its output is untrusted: every
//! field is clamped by [`PredictionFormatter`] before it reaches the guard,
//! and any failure is soft so the caller can fall back to the rule engine.

mod http;
mod output;

pub use http::HttpPredictor;
pub use output::{PredictionFormatter, RawPrediction};

use crate::models::{ActionSet, ActionType, TelemetrySnapshot};
use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

/// Default upper bound on a predictor round trip
pub const DEFAULT_PREDICTOR_TIMEOUT: Duration = Duration::from_secs(2);

/// Soft failures from the predictor. None of these abort a decision.
#[derive(Debug, Error)]
pub enum PredictorError {
    #[error("predictor is not configured")]
    Disabled,

    #[error("predictor timed out after {0:?}")]
    Timeout(Duration),

    #[error("predictor unreachable: {0}")]
    Connect(String),

    #[error("predictor returned status {0}")]
    Status(u16),

    #[error("malformed predictor response: {0}")]
    Malformed(String),
}

impl PredictorError {
    /// Short label used for metrics
    pub fn reason(&self) -> &'static str {
        match self {
            PredictorError::Disabled => "disabled",
            PredictorError::Timeout(_) => "timeout",
            PredictorError::Connect(_) => "connect",
            PredictorError::Status(_) => "status",
            PredictorError::Malformed(_) => "malformed",
        }
    }
}

/// A clamped prediction
#[derive(Debug, Clone, PartialEq)]
pub struct Prediction {
    /// Durations with `source = ml`
    pub actions: ActionSet,
    pub model: Option<String>,
    /// Fields the model proposed outside safe limits
    pub clamped: Vec<ActionType>,
}

/// Source of model-driven action proposals
#[async_trait]
pub trait Predictor: Send + Sync {
    async fn predict(&self, snapshot: &TelemetrySnapshot) -> Result<Prediction, PredictorError>;

    /// Identifier for logs
    fn name(&self) -> &str;
}

/// Predictor used when no inference service is configured
#[derive(Debug, Clone, Copy, Default)]
pub struct DisabledPredictor;

#[async_trait]
impl Predictor for DisabledPredictor {
    async fn predict(&self, _snapshot: &TelemetrySnapshot) -> Result<Prediction, PredictorError> {
        Err(PredictorError::Disabled)
    }

    fn name(&self) -> &str {
        "disabled"
    }
}
