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

//! C5 — splits oversized audio on silence, transcribes chunks under a
//! bounded worker pool, and stitches the segments back to absolute time
//! (§4.5).

use crate::errors::PipelineError;
use crate::providers::TranscriptionProvider;
use crate::rate_budget::RateBudget;
use crate::retry::RetryExecutor;
use crate::types::{Chunk, ModelTier, TranscriptionSegment};
use futures::stream::{FuturesUnordered, StreamExt};
use regex::Regex;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use tokio::process::Command;
use tokio::sync::Semaphore;
use tokio::time::{timeout, Duration};
use tokio_util::sync::CancellationToken;

const SINGLE_CALL_LIMIT_BYTES: u64 = 25 * 1024 * 1024;
const TARGET_CHUNK_BYTES: u64 = 20 * 1024 * 1024;
const SILENCE_THRESHOLD_DB: f64 = -16.0;
const SILENCE_MIN_DURATION_MS: u64 = 2000;
const SILENCE_PADDING_MS: u64 = 500;
const HARD_SPLIT_WINDOW_SECONDS: f64 = 15.0 * 60.0;
const MAX_IN_FLIGHT: usize = 3;
const PER_CHUNK_TIMEOUT: Duration = Duration::from_secs(30 * 60);

/// Removes its backing file on drop — success, failure, or cancellation
/// all take this path, so chunk cleanup can't be forgotten on any exit.
struct ChunkFileGuard {
    path: PathBuf,
}

impl Drop for ChunkFileGuard {
    fn drop(&mut self) {
        if self.path.exists() {
            if let Err(e) = std::fs::remove_file(&self.path) {
                tracing::warn!("failed to remove chunk file {:?}: {e}", self.path);
            }
        }
    }
}

pub struct ChunkedTranscriber {
    provider: Arc<TranscriptionProvider>,
}

impl ChunkedTranscriber {
    pub fn new(provider: Arc<TranscriptionProvider>) -> Self {
        Self { provider }
    }

    /// Returns one time-ordered list of segments in absolute file time.
    pub async fn transcribe(
        &self,
        normalized_wav: &Path,
        tier: ModelTier,
        language: Option<&str>,
        prompt: Option<&str>,
        work_dir: &Path,
        cancellation: &CancellationToken,
        rate_budget: &RateBudget,
        retry: &RetryExecutor,
    ) -> Result<Vec<TranscriptionSegment>, PipelineError> {
        let file_size = tokio::fs::metadata(normalized_wav)
            .await
            .map_err(|e| PipelineError::Internal(format!("cannot stat {normalized_wav:?}: {e}")))?
            .len();

        if file_size <= SINGLE_CALL_LIMIT_BYTES {
            let (mut segments, _) = self
                .provider
                .transcribe_chunk(normalized_wav, tier, language, prompt, rate_budget, retry)
                .await?;
            if !tier.supports_segments() {
                let duration = probe_duration(normalized_wav).await?;
                for segment in &mut segments {
                    segment.end = duration;
                }
            }
            return Ok(segments);
        }

        let chunks = self.split_on_silence(normalized_wav, work_dir).await?;
        self.transcribe_chunks_parallel(chunks, tier, language, prompt, cancellation, rate_budget, retry).await
    }

    async fn transcribe_chunks_parallel(
        &self,
        chunks: Vec<Chunk>,
        tier: ModelTier,
        language: Option<&str>,
        prompt: Option<&str>,
        cancellation: &CancellationToken,
        rate_budget: &RateBudget,
        retry: &RetryExecutor,
    ) -> Result<Vec<TranscriptionSegment>, PipelineError> {
        let semaphore = Arc::new(Semaphore::new(MAX_IN_FLIGHT));
        let mut in_flight = FuturesUnordered::new();

        for chunk in chunks {
            let semaphore = semaphore.clone();
            let provider = self.provider.clone();
            let language = language.map(|s| s.to_string());
            let prompt = prompt.map(|s| s.to_string());
            let cancellation = cancellation.clone();
            let _guard = ChunkFileGuard { path: chunk.path.clone() };

            in_flight.push(async move {
                let _permit = semaphore.acquire_owned().await.expect("semaphore not closed");
                let _keep_alive = _guard;

                let work = provider.transcribe_chunk(&chunk.path, tier, language.as_deref(), prompt.as_deref(), rate_budget, retry);

                tokio::select! {
                    _ = cancellation.cancelled() => Err((chunk.index, PipelineError::Cancelled)),
                    result = timeout(PER_CHUNK_TIMEOUT, work) => match result {
                        Ok(Ok((mut segments, _))) => {
                            if !tier.supports_segments() {
                                for segment in &mut segments {
                                    segment.end = chunk.duration_seconds;
                                }
                            }
                            for segment in &mut segments {
                                *segment = segment.shifted(chunk.offset_seconds);
                            }
                            Ok((chunk.index, segments))
                        }
                        Ok(Err(e)) => Err((chunk.index, e)),
                        Err(_) => Err((chunk.index, PipelineError::Internal(format!(
                            "chunk {} exceeded the 30 minute per-chunk timeout", chunk.index
                        )))),
                    },
                }
            });
        }

        let mut results: Vec<(usize, Vec<TranscriptionSegment>)> = Vec::new();
        while let Some(outcome) = in_flight.next().await {
            match outcome {
                Ok(pair) => results.push(pair),
                Err((index, err)) => {
                    tracing::error!("chunk {index} failed, cancelling remaining chunks: {err}");
                    cancellation.cancel();
                    // Drain remaining futures so their guards drop (cleanup)
                    // before surfacing the error.
                    while in_flight.next().await.is_some() {}
                    return Err(err);
                }
            }
        }

        results.sort_by_key(|(index, _)| *index);
        Ok(results.into_iter().flat_map(|(_, segments)| segments).collect())
    }

    /// Groups non-silent runs into ~20MB (~10min at 16kHz mono) chunks.
    /// Falls back to a hard split if no usable boundary appears within a
    /// 15-minute window.
    async fn split_on_silence(&self, input: &Path, work_dir: &Path) -> Result<Vec<Chunk>, PipelineError> {
        tokio::fs::create_dir_all(work_dir)
            .await
            .map_err(|e| PipelineError::Internal(format!("cannot create chunk work dir: {e}")))?;

        let total_duration = probe_duration(input).await?;
        let mut boundaries = detect_silence_boundaries(input).await?;
        boundaries.push(total_duration);

        let bytes_per_second = (tokio::fs::metadata(input).await.map(|m| m.len()).unwrap_or(0) as f64
            / total_duration.max(0.001)).max(1.0);
        let target_seconds = TARGET_CHUNK_BYTES as f64 / bytes_per_second;

        let mut cut_points = vec![0.0];
        let mut last_cut = 0.0;
        let mut last_boundary_seen = 0.0;
        // The latest boundary seen so far that still fits within
        // `target_seconds` of `last_cut` — the point we close the chunk at
        // once the *next* boundary would overrun the target, so a chunk
        // never grows past ~target_seconds even though boundaries arrive
        // at irregular spacing.
        let mut candidate: Option<f64> = None;

        for &boundary in &boundaries {
            if boundary - last_cut > target_seconds {
                if let Some(pending) = candidate.take() {
                    cut_points.push(pending);
                    last_cut = pending;
                } else {
                    // A single gap between silences already exceeds the
                    // target on its own; cut right here rather than growing
                    // the chunk further.
                    cut_points.push(boundary);
                    last_cut = boundary;
                }
            }

            if boundary - last_cut <= target_seconds {
                candidate = Some(boundary);
            }

            if boundary - last_boundary_seen > HARD_SPLIT_WINDOW_SECONDS {
                // No usable silence boundary within the window; force a cut.
                let forced = last_boundary_seen + HARD_SPLIT_WINDOW_SECONDS;
                cut_points.push(forced);
                last_cut = forced;
                candidate = None;
            }
            last_boundary_seen = boundary;
        }
        if *cut_points.last().unwrap() < total_duration {
            cut_points.push(total_duration);
        }
        cut_points.dedup_by(|a, b| (*a - *b).abs() < 0.01);

        let mut chunks = Vec::new();
        for (index, window) in cut_points.windows(2).enumerate() {
            let (start, end) = (window[0], window[1]);
            if end - start <= 0.01 {
                continue;
            }
            let chunk_path = work_dir.join(format!("chunk_{index:04}.wav"));
            extract_segment(input, &chunk_path, start, end).await?;
            chunks.push(Chunk {
                index,
                offset_seconds: start,
                path: chunk_path,
                duration_seconds: end - start,
            });
        }

        Ok(chunks)
    }
}

async fn probe_duration(input: &Path) -> Result<f64, PipelineError> {
    let output = Command::new("ffprobe")
        .args(["-v", "error", "-show_entries", "format=duration", "-of", "default=noprint_wrappers=1:nokey=1"])
        .arg(input)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await
        .map_err(|e| PipelineError::Internal(format!("ffprobe unavailable: {e}")))?;

    if !output.status.success() {
        return Err(PipelineError::Internal(format!(
            "ffprobe failed: {}",
            String::from_utf8_lossy(&output.stderr)
        )));
    }

    String::from_utf8_lossy(&output.stdout)
        .trim()
        .parse::<f64>()
        .map_err(|_| PipelineError::Internal("ffprobe returned a non-numeric duration".into()))
}

/// Runs `ffmpeg -af silencedetect` and parses the `silence_end` markers
/// out of its stderr — the same text-parsing shape the teacher uses for
/// whisper.cpp's stdout when no structured output is available.
async fn detect_silence_boundaries(input: &Path) -> Result<Vec<f64>, PipelineError> {
    let filter = format!(
        "silencedetect=noise={SILENCE_THRESHOLD_DB}dB:d={:.3}",
        SILENCE_MIN_DURATION_MS as f64 / 1000.0
    );

    let output = Command::new("ffmpeg")
        .args(["-i"])
        .arg(input)
        .args(["-af", &filter, "-f", "null", "-"])
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .output()
        .await
        .map_err(|e| PipelineError::Internal(format!("failed to spawn ffmpeg: {e}")))?;

    let stderr = String::from_utf8_lossy(&output.stderr);
    let re = Regex::new(r"silence_end:\s*([0-9.]+)").expect("static regex compiles");

    let padding = SILENCE_PADDING_MS as f64 / 1000.0;
    let boundaries: Vec<f64> = re
        .captures_iter(&stderr)
        .filter_map(|cap| cap.get(1)?.as_str().parse::<f64>().ok())
        .map(|end| (end - padding).max(0.0))
        .collect();

    Ok(boundaries)
}

async fn extract_segment(input: &Path, output: &Path, start: f64, end: f64) -> Result<(), PipelineError> {
    let duration = end - start;
    let result = Command::new("ffmpeg")
        .args(["-y", "-i"])
        .arg(input)
        .args(["-ss", &format!("{start:.3}"), "-t", &format!("{duration:.3}")])
        .args(["-ac", "1", "-ar", "16000", "-sample_fmt", "s16"])
        .arg(output)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await
        .map_err(|e| PipelineError::Internal(format!("failed to spawn ffmpeg: {e}")))?;

    if !result.status.success() {
        return Err(PipelineError::Internal(format!(
            "chunk extraction failed: {}",
            String::from_utf8_lossy(&result.stderr)
        )));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn silencedetect_parses_silence_end_markers() {
        let stderr = "[silencedetect @ 0x1] silence_start: 10.5\n\
                       [silencedetect @ 0x1] silence_end: 12.8 | silence_duration: 2.3\n\
                       [silencedetect @ 0x1] silence_end: 40.0 | silence_duration: 2.1\n";
        let re = Regex::new(r"silence_end:\s*([0-9.]+)").unwrap();
        let ends: Vec<f64> = re
            .captures_iter(stderr)
            .filter_map(|cap| cap.get(1)?.as_str().parse::<f64>().ok())
            .collect();
        assert_eq!(ends, vec![12.8, 40.0]);
    }
}
