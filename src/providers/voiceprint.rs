/*
 * Transcript Fusion Pipeline
 * Copyright (c) 2024 Meeting Assistant Contributors
 *
 * This work is licensed under the Creative Commons Attribution-NonCommercial 4.0 International License.
 * To view a copy of this license, visit http://creativecommons.org/licenses/by-nc/4.0/
 *
 * You are free to share and adapt this work for non-commercial purposes with attribution.
 * Commercial use is prohibited without explicit written permission.
 *
 * For commercial licensing inquiries, please contact the project maintainers.
 */

//! §4.4.5 Create voiceprint. The core treats voiceprints as read-only
//! inputs everywhere else (§3); this is the one place it can mint one,
//! mirrored here because it shares the diarization provider's job queue.

use crate::config::ProviderEndpoint;
use crate::errors::{ErrorKind, PipelineError};
use crate::rate_budget::RateBudget;
use crate::retry::{Attempt, RetryExecutor};
use crate::types::{MediaHandle, Provider, Voiceprint};
use serde::Deserialize;
use serde_json::json;
use tokio::time::{sleep, Duration};
use uuid::Uuid;

const POLL_INTERVAL: Duration = Duration::from_secs(5);
const POLL_MAX_ITERATIONS: u32 = 40;

const MIN_DURATION_SECONDS: f64 = 5.0;
const WARN_DURATION_SECONDS: f64 = 10.0;
const MAX_DURATION_SECONDS: f64 = 30.0;

pub struct VoiceprintProvider {
    client: reqwest::Client,
    endpoint: ProviderEndpoint,
}

#[derive(Deserialize)]
struct JobIdResponse {
    #[serde(rename = "jobId")]
    job_id: String,
}

#[derive(Deserialize)]
struct JobStatusResponse {
    status: crate::types::JobStatus,
    #[serde(default)]
    output: Option<serde_json::Value>,
}

#[derive(Deserialize)]
struct VoiceprintOutput {
    voiceprint: String,
}

impl VoiceprintProvider {
    pub fn new(endpoint: ProviderEndpoint) -> Self {
        Self { client: reqwest::Client::new(), endpoint }
    }

    /// Rejects samples under 5s, warns (but accepts) 5-10s, accepts 10-30s
    /// as optimal, and rejects anything past 30s outright.
    pub fn validate_duration(duration_seconds: f64) -> Result<(), PipelineError> {
        if duration_seconds < MIN_DURATION_SECONDS {
            return Err(PipelineError::Validation(format!(
                "voiceprint sample is {duration_seconds}s, below the 5s minimum"
            )));
        }
        if duration_seconds > MAX_DURATION_SECONDS {
            return Err(PipelineError::Validation(format!(
                "voiceprint sample is {duration_seconds}s, above the 30s maximum"
            )));
        }
        if duration_seconds < WARN_DURATION_SECONDS {
            tracing::warn!(
                "voiceprint sample is {duration_seconds}s; 10-30s samples produce better matches"
            );
        }
        Ok(())
    }

    pub async fn create(
        &self,
        media: &MediaHandle,
        label: &str,
        duration_seconds: f64,
        rate_budget: &RateBudget,
        retry: &RetryExecutor,
    ) -> Result<Voiceprint, PipelineError> {
        Self::validate_duration(duration_seconds)?;

        let body = json!({ "url": media });
        rate_budget.acquire(Provider::Diarization).await;
        let job = retry.run(Provider::Diarization, || self.submit(&body)).await?;

        let output = self.poll_until_terminal(&job.job_id, rate_budget, retry).await?;
        let parsed: VoiceprintOutput =
            serde_json::from_value(output).map_err(|e| PipelineError::Schema(e.to_string()))?;

        Ok(Voiceprint {
            id: Uuid::new_v4().to_string(),
            label: label.to_string(),
            payload: parsed.voiceprint,
            created_at: chrono::Utc::now(),
            duration_seconds,
        })
    }

    async fn poll_until_terminal(
        &self,
        job_id: &str,
        rate_budget: &RateBudget,
        retry: &RetryExecutor,
    ) -> Result<serde_json::Value, PipelineError> {
        for iteration in 0..POLL_MAX_ITERATIONS {
            rate_budget.acquire(Provider::Diarization).await;
            let status = retry.run(Provider::Diarization, || self.poll_once(job_id)).await?;

            match status.status {
                crate::types::JobStatus::Succeeded => {
                    return status
                        .output
                        .ok_or_else(|| PipelineError::Schema("succeeded job missing output".into()));
                }
                crate::types::JobStatus::Failed => {
                    return Err(PipelineError::Provider {
                        provider: Provider::Diarization,
                        attempt_count: iteration + 1,
                        message: "voiceprint job reported failed status".into(),
                    });
                }
                crate::types::JobStatus::Canceled => return Err(PipelineError::Cancelled),
                crate::types::JobStatus::Created | crate::types::JobStatus::Running => {
                    sleep(POLL_INTERVAL).await;
                }
            }
        }

        Err(PipelineError::Provider {
            provider: Provider::Diarization,
            attempt_count: POLL_MAX_ITERATIONS,
            message: "voiceprint job polling exceeded the 3 minute cap".into(),
        })
    }

    async fn submit(&self, body: &serde_json::Value) -> Attempt<JobIdResponse> {
        let response = match self
            .client
            .post(format!("{}/voiceprint", self.endpoint.base_url))
            .header("Authorization", format!("Bearer {}", self.endpoint.api_key))
            .json(body)
            .send()
            .await
        {
            Ok(r) => r,
            Err(e) => {
                return Attempt::Retryable(
                    ErrorKind::from_reqwest(&e),
                    PipelineError::TransientNetwork {
                        provider: Provider::Diarization,
                        attempt_count: 0,
                        message: e.to_string(),
                    },
                )
            }
        };

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let message = response.text().await.unwrap_or_default();
            let (kind, error) = crate::errors::classify_response_error(Provider::Diarization, status, message, 0);
            return Attempt::Retryable(kind, error);
        }

        match response.json::<JobIdResponse>().await {
            Ok(parsed) => Attempt::Ok(parsed),
            Err(e) => Attempt::Retryable(ErrorKind::Other, PipelineError::Schema(e.to_string())),
        }
    }

    async fn poll_once(&self, job_id: &str) -> Attempt<JobStatusResponse> {
        let response = match self
            .client
            .get(format!("{}/jobs/{}", self.endpoint.base_url, job_id))
            .header("Authorization", format!("Bearer {}", self.endpoint.api_key))
            .send()
            .await
        {
            Ok(r) => r,
            Err(e) => {
                return Attempt::Retryable(
                    ErrorKind::from_reqwest(&e),
                    PipelineError::TransientNetwork {
                        provider: Provider::Diarization,
                        attempt_count: 0,
                        message: e.to_string(),
                    },
                )
            }
        };

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let message = response.text().await.unwrap_or_default();
            let (kind, error) = crate::errors::classify_response_error(Provider::Diarization, status, message, 0);
            return Attempt::Retryable(kind, error);
        }

        match response.json::<JobStatusResponse>().await {
            Ok(parsed) => Attempt::Ok(parsed),
            Err(e) => Attempt::Retryable(ErrorKind::Other, PipelineError::Schema(e.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_too_short_sample() {
        assert!(VoiceprintProvider::validate_duration(3.0).is_err());
    }

    #[test]
    fn accepts_optimal_range_silently() {
        assert!(VoiceprintProvider::validate_duration(15.0).is_ok());
    }

    #[test]
    fn rejects_too_long_sample() {
        assert!(VoiceprintProvider::validate_duration(45.0).is_err());
    }
}
