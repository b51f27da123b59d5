//! Detection service client
//!
//! Thin client for the external object-detection API. Handles payload
//! encoding, bounded retries with increasing backoff, and a global
//! minimum-interval gate so bursts of concurrent frames cannot overwhelm
//! the upstream service. Detection failures never touch controller state.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, warn};

use crate::dispatch::RoadSnapshot;

/// Class-label substrings that mark a detection as an emergency vehicle
pub const EMERGENCY_CLASSES: &[&str] = &["ambulance", "fire", "police", "emergency"];

/// One detection returned by the inference service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Prediction {
    /// Detected class label
    #[serde(rename = "class")]
    pub class_name: String,
    /// Model confidence in [0, 1]
    pub confidence: f64,
    /// Bounding-box center x
    pub x: f64,
    /// Bounding-box center y
    pub y: f64,
    /// Bounding-box width
    pub width: f64,
    /// Bounding-box height
    pub height: f64,
}

impl Prediction {
    /// Whether this detection's class label marks an emergency vehicle
    pub fn is_emergency(&self) -> bool {
        let class = self.class_name.to_lowercase();
        EMERGENCY_CLASSES.iter().any(|c| class.contains(c))
    }
}

/// Wire shape of the inference response
#[derive(Debug, Deserialize)]
struct DetectResponse {
    #[serde(default)]
    predictions: Vec<Prediction>,
}

/// A completed detection call
#[derive(Debug, Clone)]
pub struct DetectionOutcome {
    /// Detections that passed the service-side thresholds
    pub predictions: Vec<Prediction>,
    /// Wall-clock time spent, including retries and the rate gate
    pub processing_time: Duration,
}

/// Detection client configuration
#[derive(Debug, Clone)]
pub struct DetectionConfig {
    /// Full inference endpoint URL (service base plus model id)
    pub endpoint: String,
    /// API key passed as a query parameter
    pub api_key: String,
    /// Default confidence threshold in [0, 1]
    pub confidence: f64,
    /// Default overlap threshold in [0, 1]
    pub overlap: f64,
    /// Per-request timeout; a call past this bound counts as a failed attempt
    pub request_timeout: Duration,
    /// Total attempts before giving up
    pub attempts: u32,
    /// Base backoff; the wait multiplies by the attempt index
    pub retry_backoff: Duration,
    /// Minimum spacing between calls across all callers
    pub min_call_interval: Duration,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            api_key: String::new(),
            confidence: 0.5,
            overlap: 0.5,
            request_timeout: Duration::from_secs(10),
            attempts: 3,
            retry_backoff: Duration::from_millis(500),
            min_call_interval: Duration::from_millis(250),
        }
    }
}

/// Detection client errors
#[derive(Error, Debug)]
pub enum DetectionError {
    /// Transport-level HTTP failure (connect, timeout, body read)
    #[error("detection request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// Service answered with a non-success status
    #[error("detection service returned status {0}")]
    Status(u16),

    /// Response body did not match the expected shape
    #[error("invalid detection response: {0}")]
    Decode(String),

    /// All attempts failed; carries the last error seen
    #[error("detection retries exhausted: {0}")]
    RetriesExhausted(String),
}

/// Async client for the external detection service
pub struct DetectionClient {
    config: DetectionConfig,
    client: reqwest::Client,
    /// Global rate gate: holds the instant of the last call start. Callers
    /// queue on the lock and each waits out the remaining interval.
    gate: tokio::sync::Mutex<Option<Instant>>,
}

impl DetectionClient {
    /// Create a client for the configured inference endpoint
    pub fn new(config: DetectionConfig) -> Self {
        let client = reqwest::Client::builder()
            .user_agent("signalbridge/0.1")
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());

        Self {
            config,
            client,
            gate: tokio::sync::Mutex::new(None),
        }
    }

    /// Run detection on one image with the configured thresholds
    pub async fn detect(&self, image: &[u8]) -> Result<DetectionOutcome, DetectionError> {
        self.detect_with(image, self.config.confidence, self.config.overlap)
            .await
    }

    /// Run detection on one image with explicit thresholds.
    ///
    /// Retries up to the configured attempt count, sleeping
    /// `retry_backoff * attempt` between tries, and surfaces the last error
    /// on exhaustion.
    pub async fn detect_with(
        &self,
        image: &[u8],
        confidence: f64,
        overlap: f64,
    ) -> Result<DetectionOutcome, DetectionError> {
        let started = Instant::now();
        self.wait_for_slot().await;

        let payload = BASE64.encode(image);
        let mut last_error = String::new();

        for attempt in 1..=self.config.attempts.max(1) {
            match self.attempt(&payload, confidence, overlap).await {
                Ok(predictions) => {
                    debug!(
                        count = predictions.len(),
                        attempt,
                        elapsed_ms = started.elapsed().as_millis() as u64,
                        "detection complete"
                    );
                    return Ok(DetectionOutcome {
                        predictions,
                        processing_time: started.elapsed(),
                    });
                }
                Err(e) => {
                    warn!(attempt, error = %e, "detection attempt failed");
                    last_error = e.to_string();
                    if attempt < self.config.attempts {
                        tokio::time::sleep(self.config.retry_backoff * attempt).await;
                    }
                }
            }
        }

        Err(DetectionError::RetriesExhausted(last_error))
    }

    async fn attempt(
        &self,
        payload: &str,
        confidence: f64,
        overlap: f64,
    ) -> Result<Vec<Prediction>, DetectionError> {
        let response = self
            .client
            .post(&self.config.endpoint)
            .query(&[
                ("api_key", self.config.api_key.as_str()),
                ("confidence", &confidence.to_string()),
                ("overlap", &overlap.to_string()),
            ])
            .header("Content-Type", "application/x-www-form-urlencoded")
            .body(payload.to_string())
            .timeout(self.config.request_timeout)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(DetectionError::Status(response.status().as_u16()));
        }

        let decoded: DetectResponse = response
            .json()
            .await
            .map_err(|e| DetectionError::Decode(e.to_string()))?;
        Ok(decoded.predictions)
    }

    /// Block until this caller's slot in the global call cadence arrives
    async fn wait_for_slot(&self) {
        let mut last_call = self.gate.lock().await;
        if let Some(previous) = *last_call {
            let since = previous.elapsed();
            if since < self.config.min_call_interval {
                tokio::time::sleep(self.config.min_call_interval - since).await;
            }
        }
        *last_call = Some(Instant::now());
    }
}

/// Collapse one road's predictions into the per-cycle snapshot the
/// dispatcher consumes
pub fn summarize(road_id: u32, predictions: &[Prediction]) -> RoadSnapshot {
    RoadSnapshot {
        road_id,
        vehicle_count: predictions.len() as u32,
        has_emergency_vehicle: predictions.iter().any(|p| p.is_emergency()),
    }
}
