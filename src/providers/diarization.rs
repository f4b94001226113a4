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

//! §4.4.1 Diarize and §4.4.2 Identify — the diarization provider family.

use super::StageOutcome;
use crate::config::ProviderEndpoint;
use crate::errors::{ErrorKind, PipelineError};
use crate::rate_budget::RateBudget;
use crate::retry::{Attempt, RetryExecutor};
use crate::types::{DiarizationSegment, IdentificationSegment, JobKind, JobStatus, MediaHandle, Provider, Voiceprint};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::time::{sleep, Duration};

const POLL_INTERVAL: Duration = Duration::from_secs(5);
const POLL_MAX_ITERATIONS: u32 = 40;

pub struct DiarizationProvider {
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
    status: JobStatus,
    #[serde(default)]
    output: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize)]
struct IdentifyVoiceprintRef {
    label: String,
    voiceprint: String,
}

impl DiarizationProvider {
    pub fn new(endpoint: ProviderEndpoint) -> Self {
        Self { client: reqwest::Client::new(), endpoint }
    }

    pub async fn diarize(
        &self,
        media: &MediaHandle,
        webhook_url: Option<&str>,
        rate_budget: &RateBudget,
        retry: &RetryExecutor,
    ) -> Result<StageOutcome<Vec<DiarizationSegment>>, PipelineError> {
        let body = json!({ "url": media, "webhook": webhook_url });

        rate_budget.acquire(Provider::Diarization).await;
        let job = retry
            .run(Provider::Diarization, || self.submit("/diarize", &body))
            .await?;

        if webhook_url.is_some() {
            return Ok(StageOutcome::Pending(crate::types::JobHandle {
                job_id: job.job_id,
                kind: JobKind::Diarize,
                submitted_at: chrono::Utc::now(),
                webhook_url: webhook_url.map(|s| s.to_string()),
            }));
        }

        let output = self.poll_until_terminal(&job.job_id, rate_budget, retry).await?;
        let segments: Vec<DiarizationSegment> = serde_json::from_value(output)
            .map_err(|e| PipelineError::Schema(e.to_string()))?;
        Ok(StageOutcome::Ready(segments))
    }

    pub async fn identify(
        &self,
        media: &MediaHandle,
        voiceprints: &[Voiceprint],
        matching_threshold: f64,
        exclusive: bool,
        webhook_url: Option<&str>,
        rate_budget: &RateBudget,
        retry: &RetryExecutor,
    ) -> Result<StageOutcome<Vec<IdentificationSegment>>, PipelineError> {
        let refs: Vec<IdentifyVoiceprintRef> = voiceprints
            .iter()
            .map(|v| IdentifyVoiceprintRef { label: v.label.clone(), voiceprint: v.payload.clone() })
            .collect();

        let body = json!({
            "url": media,
            "voiceprints": refs,
            "matching_threshold": matching_threshold,
            "exclusive": exclusive,
            "webhook": webhook_url,
        });

        rate_budget.acquire(Provider::Diarization).await;
        let job = retry
            .run(Provider::Diarization, || self.submit("/identify", &body))
            .await?;

        if webhook_url.is_some() {
            return Ok(StageOutcome::Pending(crate::types::JobHandle {
                job_id: job.job_id,
                kind: JobKind::Identify,
                submitted_at: chrono::Utc::now(),
                webhook_url: webhook_url.map(|s| s.to_string()),
            }));
        }

        let output = self.poll_until_terminal(&job.job_id, rate_budget, retry).await?;
        let segments: Vec<IdentificationSegment> = serde_json::from_value(output)
            .map_err(|e| PipelineError::Schema(e.to_string()))?;
        Ok(StageOutcome::Ready(segments))
    }

    /// Polls `GET /jobs/{id}` every 5s up to 40 times (~3 min cap). Each
    /// poll counts against the rate budget, same as any other call.
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
                JobStatus::Succeeded => {
                    return status
                        .output
                        .ok_or_else(|| PipelineError::Schema("succeeded job missing output".into()));
                }
                JobStatus::Failed => {
                    return Err(PipelineError::Provider {
                        provider: Provider::Diarization,
                        attempt_count: iteration + 1,
                        message: "job reported failed status".into(),
                    });
                }
                JobStatus::Canceled => return Err(PipelineError::Cancelled),
                JobStatus::Created | JobStatus::Running => {
                    sleep(POLL_INTERVAL).await;
                }
            }
        }

        Err(PipelineError::Provider {
            provider: Provider::Diarization,
            attempt_count: POLL_MAX_ITERATIONS,
            message: "job polling exceeded the 3 minute cap".into(),
        })
    }

    async fn submit(&self, path: &str, body: &serde_json::Value) -> Attempt<JobIdResponse> {
        let response = match self
            .client
            .post(format!("{}{}", self.endpoint.base_url, path))
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
