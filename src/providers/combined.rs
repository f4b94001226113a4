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

//! §4.4.4 Combined diarize+transcribe — a Replicate-compatible prediction
//! endpoint returning speakers and text in one pass.

use crate::config::ProviderEndpoint;
use crate::errors::{ErrorKind, PipelineError};
use crate::rate_budget::RateBudget;
use crate::retry::{Attempt, RetryExecutor};
use crate::types::{FusedSegment, Provider};
use serde::Deserialize;
use serde_json::json;
use tokio::time::{sleep, Duration};

const POLL_INTERVAL: Duration = Duration::from_secs(5);
const POLL_MAX_ITERATIONS: u32 = 120;

pub struct CombinedProvider {
    client: reqwest::Client,
    endpoint: ProviderEndpoint,
}

#[derive(Deserialize)]
struct PredictionResponse {
    id: String,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    output: Option<Vec<RawCombinedSegment>>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Deserialize)]
struct RawCombinedSegment {
    start: f64,
    end: f64,
    speaker: String,
    text: String,
}

impl CombinedProvider {
    pub fn new(endpoint: ProviderEndpoint) -> Self {
        Self { client: reqwest::Client::new(), endpoint }
    }

    pub async fn diarize_and_transcribe(
        &self,
        file_url: &str,
        language: Option<&str>,
        num_speakers: Option<u32>,
        rate_budget: &RateBudget,
        retry: &RetryExecutor,
    ) -> Result<Vec<FusedSegment>, PipelineError> {
        let body = json!({
            "input": {
                "file_url": file_url,
                "language": language,
                "num_speakers": num_speakers,
            }
        });

        rate_budget.acquire(Provider::Combined).await;
        let mut prediction = retry.run(Provider::Combined, || self.submit(&body)).await?;

        let mut iterations = 0;
        while !Self::is_terminal(&prediction) {
            if iterations >= POLL_MAX_ITERATIONS {
                return Err(PipelineError::Provider {
                    provider: Provider::Combined,
                    attempt_count: iterations,
                    message: "combined prediction polling exceeded its cap".into(),
                });
            }
            sleep(POLL_INTERVAL).await;
            rate_budget.acquire(Provider::Combined).await;
            prediction = retry.run(Provider::Combined, || self.poll(&prediction.id)).await?;
            iterations += 1;
        }

        match prediction.status.as_deref() {
            Some("succeeded") => {
                let output = prediction.output.unwrap_or_default();
                Ok(output
                    .into_iter()
                    .map(|s| FusedSegment {
                        start: s.start,
                        end: s.end,
                        speaker: s.speaker,
                        text: s.text,
                        confidence: None,
                        diarization_speaker: None,
                        identified_as: None,
                        match_score: None,
                    })
                    .collect())
            }
            _ => Err(PipelineError::Provider {
                provider: Provider::Combined,
                attempt_count: iterations,
                message: prediction.error.unwrap_or_else(|| "prediction failed".to_string()),
            }),
        }
    }

    fn is_terminal(prediction: &PredictionResponse) -> bool {
        matches!(prediction.status.as_deref(), Some("succeeded" | "failed" | "canceled"))
    }

    async fn submit(&self, body: &serde_json::Value) -> Attempt<PredictionResponse> {
        let response = match self
            .client
            .post(format!("{}/predictions", self.endpoint.base_url))
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
                        provider: Provider::Combined,
                        attempt_count: 0,
                        message: e.to_string(),
                    },
                )
            }
        };
        Self::finish(response).await
    }

    async fn poll(&self, prediction_id: &str) -> Attempt<PredictionResponse> {
        let response = match self
            .client
            .get(format!("{}/predictions/{}", self.endpoint.base_url, prediction_id))
            .header("Authorization", format!("Bearer {}", self.endpoint.api_key))
            .send()
            .await
        {
            Ok(r) => r,
            Err(e) => {
                return Attempt::Retryable(
                    ErrorKind::from_reqwest(&e),
                    PipelineError::TransientNetwork {
                        provider: Provider::Combined,
                        attempt_count: 0,
                        message: e.to_string(),
                    },
                )
            }
        };
        Self::finish(response).await
    }

    async fn finish(response: reqwest::Response) -> Attempt<PredictionResponse> {
        if !response.status().is_success() {
            let status = response.status().as_u16();
            let message = response.text().await.unwrap_or_default();
            let (kind, error) = crate::errors::classify_response_error(Provider::Combined, status, message, 0);
            return Attempt::Retryable(kind, error);
        }

        match response.json::<PredictionResponse>().await {
            Ok(parsed) => Attempt::Ok(parsed),
            Err(e) => Attempt::Retryable(ErrorKind::Other, PipelineError::Schema(e.to_string())),
        }
    }
}
