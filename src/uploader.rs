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

//! C3 — media normalization and upload (§4.3).

use crate::config::ProviderEndpoint;
use crate::errors::{ErrorKind, PipelineError};
use crate::rate_budget::RateBudget;
use crate::retry::{Attempt, RetryExecutor};
use crate::types::{MediaHandle, Provider};
use anyhow::Result;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;

const MAX_FILE_SIZE_BYTES: u64 = 300 * 1024 * 1024;
const MAX_DURATION_SECONDS: f64 = 24.0 * 3600.0;

/// `(extension, mime type)` — both must be in this allow-list (§4.3
/// validation). Extension is the primary signal; the MIME type is derived
/// from it rather than sniffed, since the only thing that matters here is
/// rejecting obviously-wrong inputs before spending an upload round trip.
const ALLOWED_MEDIA_TYPES: &[(&str, &str)] = &[
    ("wav", "audio/wav"),
    ("mp3", "audio/mpeg"),
    ("m4a", "audio/mp4"),
    ("mp4", "video/mp4"),
    ("mov", "video/quicktime"),
    ("flac", "audio/flac"),
    ("ogg", "audio/ogg"),
    ("webm", "audio/webm"),
];

pub struct MediaUploader {
    client: reqwest::Client,
    endpoint: ProviderEndpoint,
}

#[derive(Deserialize)]
struct UploadUrlResponse {
    url: String,
    #[serde(rename = "media_url")]
    media_url: String,
}

impl MediaUploader {
    pub fn new(endpoint: ProviderEndpoint) -> Self {
        Self { client: reqwest::Client::new(), endpoint }
    }

    /// Normalizes `input` to 16kHz mono 16-bit PCM WAV and uploads it,
    /// returning the resulting `MediaHandle`. The normalized file is left
    /// on disk because the chunked transcriber (C5) needs it too.
    pub async fn upload(
        &self,
        input: &Path,
        rate_budget: &RateBudget,
        retry: &RetryExecutor,
    ) -> Result<(MediaHandle, PathBuf), PipelineError> {
        self.validate(input).await?;
        let normalized = self.normalize(input).await?;

        rate_budget.acquire(Provider::Diarization).await;
        let upload_urls = retry
            .run(Provider::Diarization, || self.request_upload_url())
            .await?;

        retry
            .run(Provider::Diarization, || self.put_file(&upload_urls.url, &normalized))
            .await?;

        Ok((upload_urls.media_url, normalized))
    }

    async fn validate(&self, input: &Path) -> Result<(), PipelineError> {
        if !input.exists() {
            return Err(PipelineError::Validation(format!("input file does not exist: {}", input.display())));
        }

        let metadata = tokio::fs::metadata(input)
            .await
            .map_err(|e| PipelineError::Validation(format!("cannot stat input file: {e}")))?;
        if metadata.len() > MAX_FILE_SIZE_BYTES {
            return Err(PipelineError::Validation(format!(
                "input file is {} bytes, exceeds the 300 MB limit",
                metadata.len()
            )));
        }

        let extension = input
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_lowercase())
            .unwrap_or_default();
        let mime = ALLOWED_MEDIA_TYPES
            .iter()
            .find(|(ext, _)| *ext == extension)
            .map(|(_, mime)| *mime)
            .ok_or_else(|| PipelineError::Validation(format!("unsupported file extension: .{extension}")))?;
        tracing::debug!("validated {:?} as extension .{extension} ({mime})", input);

        let duration = Self::probe_duration(input).await?;
        if duration > MAX_DURATION_SECONDS {
            return Err(PipelineError::Validation(format!(
                "input duration {duration}s exceeds the 24h limit"
            )));
        }

        Ok(())
    }

    async fn probe_duration(input: &Path) -> Result<f64, PipelineError> {
        let output = Command::new("ffprobe")
            .args([
                "-v", "error",
                "-show_entries", "format=duration",
                "-of", "default=noprint_wrappers=1:nokey=1",
            ])
            .arg(input)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| PipelineError::Validation(format!("ffprobe unavailable: {e}")))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(PipelineError::Validation(format!("ffprobe failed: {stderr}")));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        stdout
            .trim()
            .parse::<f64>()
            .map_err(|_| PipelineError::Validation("ffprobe returned a non-numeric duration".to_string()))
    }

    /// Normalize to 16kHz mono 16-bit PCM WAV — the minimum rate accepted
    /// by both the speech and diarization models, minimizing upload volume.
    async fn normalize(&self, input: &Path) -> Result<PathBuf, PipelineError> {
        let stem = input.file_stem().and_then(|s| s.to_str()).unwrap_or("input");
        let output = input.with_file_name(format!("{stem}_converted.wav"));

        let mut ffmpeg_cmd = Command::new("ffmpeg");
        ffmpeg_cmd
            .args(["-y", "-i"])
            .arg(input)
            .args(["-ac", "1", "-ar", "16000", "-sample_fmt", "s16"])
            .arg(&output)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        tracing::info!("normalizing {:?} -> {:?} (16kHz mono pcm_s16le)", input, output);

        let result = ffmpeg_cmd
            .output()
            .await
            .map_err(|e| PipelineError::Internal(format!("failed to spawn ffmpeg: {e}")))?;

        if !result.status.success() {
            let stderr = String::from_utf8_lossy(&result.stderr);
            tracing::error!("ffmpeg normalization failed: {stderr}");
            return Err(PipelineError::Validation(format!("audio normalization failed: {stderr}")));
        }

        Ok(output)
    }

    async fn request_upload_url(&self) -> Attempt<UploadUrlResponse> {
        let response = match self
            .client
            .post(format!("{}/media/input", self.endpoint.base_url))
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

        match response.json::<UploadUrlResponse>().await {
            Ok(parsed) => Attempt::Ok(parsed),
            Err(e) => Attempt::Retryable(ErrorKind::Other, PipelineError::Schema(e.to_string())),
        }
    }

    async fn put_file(&self, upload_url: &str, path: &Path) -> Attempt<()> {
        let body = match tokio::fs::read(path).await {
            Ok(bytes) => bytes,
            Err(e) => {
                return Attempt::Retryable(
                    ErrorKind::Fatal,
                    PipelineError::Internal(format!("could not read normalized file: {e}")),
                )
            }
        };

        let response = match self.client.put(upload_url).body(body).send().await {
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

        if response.status().is_success() {
            Attempt::Ok(())
        } else {
            let status = response.status().as_u16();
            let (kind, error) = crate::errors::classify_response_error(
                Provider::Diarization,
                status,
                format!("upload PUT returned {status}"),
                0,
            );
            Attempt::Retryable(kind, error)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn rejects_missing_file() {
        let endpoint = ProviderEndpoint { base_url: "http://localhost".into(), api_key: "x".into() };
        let uploader = MediaUploader::new(endpoint);
        let result = uploader.validate(Path::new("/nonexistent/file.wav")).await;
        assert!(matches!(result, Err(PipelineError::Validation(_))));
    }

    #[tokio::test]
    async fn rejects_disallowed_extension() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("clip.xyz");
        tokio::fs::write(&path, b"not audio").await.unwrap();

        let endpoint = ProviderEndpoint { base_url: "http://localhost".into(), api_key: "x".into() };
        let uploader = MediaUploader::new(endpoint);
        let result = uploader.validate(&path).await;
        assert!(matches!(result, Err(PipelineError::Validation(_))));
    }

    #[test]
    fn every_allowed_extension_maps_to_a_mime_type() {
        for (ext, mime) in ALLOWED_MEDIA_TYPES {
            assert!(!ext.is_empty());
            assert!(mime.contains('/'));
        }
    }
}
