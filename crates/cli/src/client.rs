//! HTTP client for a running actuation engine

use anyhow::{Context, Result};
use engine_lib::health::{HealthResponse, ReadinessResponse};
use reqwest::Client;
use serde::de::DeserializeOwned;
use url::Url;

/// Client for the engine's operational endpoints
pub struct EngineClient {
    client: Client,
    base_url: Url,
}

/// A decoded body together with the HTTP status it came with
#[derive(Debug, Clone)]
pub struct Probe<T> {
    pub status: u16,
    pub body: T,
}

impl<T> Probe<T> {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

impl EngineClient {
    pub fn new(base_url: &str) -> Result<Self> {
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .context("Failed to create HTTP client")?;

        let base_url = Url::parse(base_url).context("Invalid engine URL")?;

        Ok(Self { client, base_url })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// GET a JSON body. Health endpoints answer 503 with a meaningful body,
    /// so non-2xx responses are decoded rather than rejected.
    async fn probe<T: DeserializeOwned>(&self, path: &str) -> Result<Probe<T>> {
        let url = self.base_url.join(path).context("Invalid path")?;

        let response = self
            .client
            .get(url)
            .send()
            .await
            .with_context(|| format!("Failed to reach engine at {}", self.base_url))?;

        let status = response.status().as_u16();
        let body = response
            .json()
            .await
            .with_context(|| format!("Failed to parse {path} response (HTTP {status})"))?;

        Ok(Probe { status, body })
    }

    pub async fn health(&self) -> Result<Probe<HealthResponse>> {
        self.probe("healthz").await
    }

    pub async fn readiness(&self) -> Result<Probe<ReadinessResponse>> {
        self.probe("readyz").await
    }
}
