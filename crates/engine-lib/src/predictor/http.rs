//! HTTP client for the inference service

use super::{Prediction, PredictionFormatter, Predictor, PredictorError, RawPrediction};
use crate::models::TelemetrySnapshot;
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Serialize;
use std::time::Duration;
use tracing::debug;
use url::Url;

/// Request body sent to the inference service
#[derive(Debug, Serialize)]
struct PredictRequest {
    ppm: f64,
    ph: f64,
    #[serde(rename = "tempC")]
    temp_c: f64,
    humidity: f64,
    #[serde(rename = "waterTemp")]
    water_temp: f64,
    #[serde(rename = "waterLevel")]
    water_level: f64,
}

impl From<&TelemetrySnapshot> for PredictRequest {
    fn from(snapshot: &TelemetrySnapshot) -> Self {
        Self {
            ppm: snapshot.ppm,
            ph: snapshot.ph,
            temp_c: snapshot.temp_c,
            humidity: snapshot.humidity,
            water_temp: snapshot.water_temp,
            water_level: snapshot.water_level,
        }
    }
}

/// Predictor backed by a JSON-over-HTTP inference endpoint
pub struct HttpPredictor {
    client: reqwest::Client,
    endpoint: Url,
    timeout: Duration,
    formatter: PredictionFormatter,
}

impl HttpPredictor {
    /// `endpoint` is the full URL of the predict route
    pub fn new(endpoint: &str, timeout: Duration) -> Result<Self> {
        let endpoint = Url::parse(endpoint)
            .with_context(|| format!("Invalid predictor URL: {endpoint}"))?;
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build predictor HTTP client")?;

        Ok(Self {
            client,
            endpoint,
            timeout,
            formatter: PredictionFormatter::new(),
        })
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    fn classify(&self, err: reqwest::Error) -> PredictorError {
        if err.is_timeout() {
            PredictorError::Timeout(self.timeout)
        } else if err.is_decode() {
            PredictorError::Malformed(err.to_string())
        } else {
            PredictorError::Connect(err.to_string())
        }
    }
}

#[async_trait]
impl Predictor for HttpPredictor {
    async fn predict(&self, snapshot: &TelemetrySnapshot) -> Result<Prediction, PredictorError> {
        let response = self
            .client
            .post(self.endpoint.clone())
            .json(&PredictRequest::from(snapshot))
            .send()
            .await
            .map_err(|e| self.classify(e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(PredictorError::Status(status.as_u16()));
        }

        let body = response.bytes().await.map_err(|e| self.classify(e))?;
        let raw: RawPrediction = serde_json::from_slice(&body)
            .map_err(|e| PredictorError::Malformed(e.to_string()))?;

        debug!(
            device_id = %snapshot.device_id,
            model = ?raw.model,
            "Predictor responded"
        );

        Ok(self.formatter.format(&raw))
    }

    fn name(&self) -> &str {
        self.endpoint.as_str()
    }
}
