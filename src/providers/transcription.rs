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

//! §4.4.3 Transcribe — one audio chunk through the OpenAI-compatible
//! transcription endpoint. M_cheap returns timed segments; M_mid/M_high
//! return one blob of text that the caller must wrap into a single
//! whole-chunk segment. That asymmetry is load-bearing (§4.6 step 4
//! depends on it) and must not be smoothed over here.

use crate::errors::{ErrorKind, PipelineError};
use crate::rate_budget::RateBudget;
use crate::retry::{Attempt, RetryExecutor};
use crate::types::{ModelTier, Provider, TranscriptionSegment};
use serde::Deserialize;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

const TIMEOUT_BASE_SECONDS: f64 = 60.0;
const TIMEOUT_PER_MB_SECONDS: f64 = 10.0;
const TIMEOUT_CAP_SECONDS: f64 = 600.0;

pub struct TranscriptionProvider {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
}

#[derive(Deserialize)]
struct VerboseJsonResponse {
    segments: Vec<VerboseSegment>,
    #[serde(default)]
    language: Option<String>,
}

#[derive(Deserialize)]
struct VerboseSegment {
    start: f64,
    end: f64,
    text: String,
    #[serde(default)]
    avg_logprob: Option<f64>,
}

#[derive(Deserialize)]
struct TextResponse {
    text: String,
}

/// What a single `POST /audio/transcriptions` attempt returns, before the
/// response-format asymmetry (§4.4.3) is resolved into `TranscriptionSegment`s.
enum RawTranscription {
    Verbose(VerboseJsonResponse),
    Text(TextResponse),
}

pub fn adaptive_timeout(file_size_bytes: u64) -> Duration {
    let mb = file_size_bytes as f64 / (1024.0 * 1024.0);
    let seconds = (TIMEOUT_BASE_SECONDS + TIMEOUT_PER_MB_SECONDS * mb).min(TIMEOUT_CAP_SECONDS);
    Duration::from_secs_f64(seconds)
}

impl TranscriptionProvider {
    pub fn new(base_url: String, api_key: String) -> Self {
        Self { client: reqwest::Client::new(), base_url, api_key }
    }

    /// Transcribes a single chunk in chunk-local time. Caller is
    /// responsible for shifting results to absolute file time (C5). Goes
    /// through C1 (rate budget) then C2 (retry), same as every other
    /// provider call (§4.4 preamble).
    pub async fn transcribe_chunk(
        &self,
        path: &Path,
        tier: ModelTier,
        language: Option<&str>,
        prompt: Option<&str>,
        rate_budget: &RateBudget,
        retry: &RetryExecutor,
    ) -> Result<(Vec<TranscriptionSegment>, Duration), PipelineError> {
        let bytes = Arc::new(
            tokio::fs::read(path)
                .await
                .map_err(|e| PipelineError::Internal(format!("could not read chunk file: {e}")))?,
        );
        let timeout = adaptive_timeout(bytes.len() as u64);

        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("chunk.wav")
            .to_string();

        rate_budget.acquire(Provider::Transcription).await;
        let raw = retry
            .run(Provider::Transcription, || {
                self.attempt(bytes.clone(), &file_name, tier, language, prompt, timeout)
            })
            .await?;

        let segments = match raw {
            RawTranscription::Verbose(parsed) => parsed
                .segments
                .into_iter()
                .map(|s| TranscriptionSegment {
                    start: s.start,
                    end: s.end,
                    text: s.text,
                    confidence: s.avg_logprob,
                    language: parsed.language.clone(),
                })
                .collect(),
            // M_mid/M_high: single segment spanning the whole chunk; the
            // fuser redistributes this proportionally against diarization.
            RawTranscription::Text(parsed) => vec![TranscriptionSegment {
                start: 0.0,
                end: 0.0, // filled in by the caller, which knows chunk duration
                text: parsed.text,
                confidence: None,
                language: language.map(|s| s.to_string()),
            }],
        };

        Ok((segments, timeout))
    }

    async fn attempt(
        &self,
        bytes: Arc<Vec<u8>>,
        file_name: &str,
        tier: ModelTier,
        language: Option<&str>,
        prompt: Option<&str>,
        timeout: Duration,
    ) -> Attempt<RawTranscription> {
        let response_format = if tier.supports_segments() { "verbose_json" } else { "json" };

        let part = match reqwest::multipart::Part::bytes((*bytes).clone())
            .file_name(file_name.to_string())
            .mime_str("audio/wav")
        {
            Ok(part) => part,
            Err(e) => return Attempt::Retryable(ErrorKind::Fatal, PipelineError::Internal(e.to_string())),
        };

        let mut form = reqwest::multipart::Form::new()
            .part("file", part)
            .text("model", tier.provider_model_name())
            .text("response_format", response_format);

        if let Some(language) = language {
            form = form.text("language", language.to_string());
        }
        if let Some(prompt) = prompt {
            form = form.text("prompt", prompt.to_string());
        }

        let response = match self
            .client
            .post(format!("{}/audio/transcriptions", self.base_url))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .timeout(timeout)
            .multipart(form)
            .send()
            .await
        {
            Ok(r) => r,
            Err(e) => {
                return Attempt::Retryable(
                    ErrorKind::from_reqwest(&e),
                    PipelineError::TransientNetwork {
                        provider: Provider::Transcription,
                        attempt_count: 0,
                        message: e.to_string(),
                    },
                )
            }
        };

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let message = response.text().await.unwrap_or_default();
            let (kind, error) = crate::errors::classify_response_error(Provider::Transcription, status, message, 0);
            return Attempt::Retryable(kind, error);
        }

        if tier.supports_segments() {
            match response.json::<VerboseJsonResponse>().await {
                Ok(parsed) => Attempt::Ok(RawTranscription::Verbose(parsed)),
                Err(e) => Attempt::Retryable(ErrorKind::Other, PipelineError::Schema(e.to_string())),
            }
        } else {
            match response.json::<TextResponse>().await {
                Ok(parsed) => Attempt::Ok(RawTranscription::Text(parsed)),
                Err(e) => Attempt::Retryable(ErrorKind::Other, PipelineError::Schema(e.to_string())),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn adaptive_timeout_scales_with_size_and_caps() {
        assert_eq!(adaptive_timeout(0).as_secs_f64(), 60.0);
        assert_eq!(adaptive_timeout(1024 * 1024).as_secs_f64(), 70.0);
        assert_eq!(adaptive_timeout(1000 * 1024 * 1024).as_secs_f64(), 600.0);
    }
}
