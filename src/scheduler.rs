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

//! C7 — drives one input through UPLOAD -> DIARIZE ∥ TRANSCRIBE -> FUSE ->
//! EXPORT (§4.7), skipping any stage whose checkpoint is still valid.

use crate::checkpoint_store::CheckpointStore;
use crate::chunker::ChunkedTranscriber;
use crate::config::Config;
use crate::errors::{PipelineError, StagedError};
use crate::fuser;
use crate::providers::{DiarizationProvider, StageOutcome, TranscriptionProvider};
use crate::rate_budget::RateBudget;
use crate::retry::RetryExecutor;
use crate::types::{DiarizationSegment, FusedSegment, JobHandle, ModelTier, PipelineState, StageName, TranscriptionSegment};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

pub struct RunOptions {
    pub force_restart: bool,
    /// Bypasses the 24h auto-resume window (§4.7 criterion (c)) for an
    /// operator-requested resume of an older checkpoint. Has no effect on
    /// criteria (a)/(b)/(d), which still apply regardless.
    pub explicit_resume: bool,
    pub webhook_url: Option<String>,
    pub model_tier: ModelTier,
    pub language: Option<String>,
    pub prompt: Option<String>,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            force_restart: false,
            explicit_resume: false,
            webhook_url: None,
            model_tier: ModelTier::Cheap,
            language: None,
            prompt: None,
        }
    }
}

/// Result of one scheduler invocation: either the pipeline ran to
/// completion, or it is now waiting on an asynchronous provider job that
/// will complete via the webhook endpoint (§4.8, REDESIGN FLAGS in
/// spec.md §9).
pub enum PipelineOutcome {
    Complete(Vec<FusedSegment>),
    AwaitingWebhook(JobHandle),
}

pub struct PipelineScheduler {
    config: Config,
    rate_budget: RateBudget,
    retry: RetryExecutor,
    checkpoints: CheckpointStore,
    diarization: DiarizationProvider,
    transcription: Arc<TranscriptionProvider>,
}

impl PipelineScheduler {
    pub fn new(config: Config) -> Self {
        let rate_budget = RateBudget::new(&config.rate_limits);
        let retry = RetryExecutor::new();
        let checkpoints = CheckpointStore::new(config.data_root.clone());
        let diarization = DiarizationProvider::new(config.diarization.clone());
        let transcription = Arc::new(TranscriptionProvider::new(
            config.transcription.base_url.clone(),
            config.transcription.api_key.clone(),
        ));

        Self { config, rate_budget, retry, checkpoints, diarization, transcription }
    }

    pub fn pipeline_id(input: &Path, config: &Config) -> String {
        let mut hasher = Sha256::new();
        hasher.update(input.to_string_lossy().as_bytes());
        hasher.update(config.canonical().as_bytes());
        hex::encode(hasher.finalize())
    }

    pub async fn run(&self, input: &Path, options: RunOptions) -> Result<PipelineOutcome, StagedError> {
        let pipeline_id = Self::pipeline_id(input, &self.config);
        let _lock = self.checkpoints.lock(&pipeline_id).map_err(|e| e.stage_context(StageName::Upload))?;
        let input_hash = crate::checkpoint_store::hash_file(input).map_err(|e| e.stage_context(StageName::Upload))?;

        let mut state = if options.force_restart {
            PipelineState::new(pipeline_id.clone(), input_hash.clone(), self.config.canonical())
        } else {
            match self.checkpoints.load(&pipeline_id).map_err(|e| e.stage_context(StageName::Upload))? {
                // A checkpoint exists for this pipeline_id but the input's
                // content hash no longer matches (criterion (a), §4.7):
                // the file at this path changed, so none of its recorded
                // stages can be trusted. Start fresh rather than silently
                // reusing stale outputs.
                Some(existing) if existing.input_fingerprint != input_hash => {
                    tracing::warn!(
                        "input fingerprint changed for {pipeline_id}, discarding stale checkpoints"
                    );
                    PipelineState::new(pipeline_id.clone(), input_hash.clone(), self.config.canonical())
                }
                Some(existing) => existing,
                None => PipelineState::new(pipeline_id.clone(), input_hash.clone(), self.config.canonical()),
            }
        };

        let cancellation = CancellationToken::new();
        let work_dir = self.config.data_root.join("interim").join(&pipeline_id);

        // UPLOAD
        let (media_handle, normalized_path) = if self.stage_valid(&state, StageName::Upload, options.explicit_resume, input, &input_hash) {
            tracing::info!("skipping UPLOAD for {pipeline_id}, checkpoint still valid");
            let path = self.restore_interim_path(&state, StageName::Upload).map_err(|e| e.stage_context(StageName::Upload))?;
            (self.restore_media_handle(&state).map_err(|e| e.stage_context(StageName::Upload))?, path)
        } else {
            state.current_stage = Some(StageName::Upload);
            match self.run_upload(input).await {
                Ok((handle, path)) => {
                    state.record_success(StageName::Upload, input.display().to_string(), path.display().to_string());
                    self.persist_media_handle(&mut state, &handle);
                    self.checkpoints.save(&state).map_err(|e| e.stage_context(StageName::Upload))?;
                    (handle, path)
                }
                Err(e) => {
                    state.record_failure(StageName::Upload, input.display().to_string(), e.to_string());
                    self.checkpoints.save(&state).map_err(|e| e.stage_context(StageName::Upload))?;
                    return Err(e.stage_context(StageName::Upload));
                }
            }
        };

        // DIARIZE ∥ TRANSCRIBE
        let diarization_done = self.stage_valid(&state, StageName::Diarize, options.explicit_resume, input, &input_hash);
        let transcription_done = self.stage_valid(&state, StageName::Transcribe, options.explicit_resume, input, &input_hash);

        let (diarization_result, transcription_result) = if diarization_done && transcription_done {
            tracing::info!("skipping DIARIZE and TRANSCRIBE for {pipeline_id}, checkpoints still valid");
            (
                self.restore_diarization(&state).map_err(|e| e.stage_context(StageName::Diarize))?,
                self.restore_transcription(&state).map_err(|e| e.stage_context(StageName::Transcribe))?,
            )
        } else if let Some(job) = state.pending_job.clone() {
            // A prior invocation already dispatched DIARIZE asynchronously
            // and is still waiting on its webhook; don't submit a second
            // job for the same stage (§4.7's "picks up where it left off").
            tracing::info!("pipeline {pipeline_id} still awaiting webhook for job {}", job.job_id);
            return Ok(PipelineOutcome::AwaitingWebhook(job));
        } else {
            state.current_stage = Some(StageName::Diarize);
            self.checkpoints.save(&state).map_err(|e| e.stage_context(StageName::Diarize))?;

            let diarize_fut = self.run_diarize(&media_handle, options.webhook_url.as_deref());
            let transcribe_fut =
                self.run_transcribe(&normalized_path, options.model_tier, options.language.as_deref(), options.prompt.as_deref(), &work_dir, &cancellation);

            let (diarize_outcome, transcribe_outcome) = tokio::try_join!(diarize_fut, transcribe_fut).map_err(|e| {
                state.record_failure(StageName::Diarize, media_handle.clone(), e.to_string());
                e.stage_context(StageName::Diarize)
            })?;

            match diarize_outcome {
                StageOutcome::Pending(job) => {
                    // TRANSCRIBE already ran to completion in the join above
                    // even though DIARIZE went async; persist it now so the
                    // webhook-driven resume doesn't have to redo it.
                    let transcription_ref = self.store_transcription(&pipeline_id, &transcribe_outcome).map_err(|e| e.stage_context(StageName::Transcribe))?;
                    state.record_success(StageName::Transcribe, media_handle.clone(), transcription_ref);
                    state.set_pending(job.clone());
                    state.current_stage = Some(StageName::Diarize);
                    self.checkpoints.save(&state).map_err(|e| e.stage_context(StageName::Diarize))?;
                    return Ok(PipelineOutcome::AwaitingWebhook(job));
                }
                StageOutcome::Ready(segments) => {
                    let diarization_ref = self.store_diarization(&pipeline_id, &segments).map_err(|e| e.stage_context(StageName::Diarize))?;
                    state.record_success(StageName::Diarize, media_handle.clone(), diarization_ref);
                    let transcription_ref = self.store_transcription(&pipeline_id, &transcribe_outcome).map_err(|e| e.stage_context(StageName::Transcribe))?;
                    state.record_success(StageName::Transcribe, media_handle.clone(), transcription_ref);
                    self.checkpoints.save(&state).map_err(|e| e.stage_context(StageName::Diarize))?;
                    (segments, transcribe_outcome)
                }
            }
        };

        // FUSE
        let fused = if self.stage_valid(&state, StageName::Fuse, options.explicit_resume, input, &input_hash) {
            tracing::info!("skipping FUSE for {pipeline_id}, checkpoint still valid");
            self.restore_fused(&state).map_err(|e| e.stage_context(StageName::Fuse))?
        } else {
            state.current_stage = Some(StageName::Fuse);
            let fused = fuser::fuse(&diarization_result, &transcription_result);
            let fused_ref = self.store_fused(&pipeline_id, &fused).map_err(|e| e.stage_context(StageName::Fuse))?;
            state.record_success(StageName::Fuse, media_handle.clone(), fused_ref);
            self.checkpoints.save(&state).map_err(|e| e.stage_context(StageName::Fuse))?;
            fused
        };

        // EXPORT: the scheduler's job ends at a validated in-memory result;
        // the concrete on-disk export format is a caller-side concern
        // (Non-goal: "export formatters", spec.md §1).
        state.record_success(StageName::Export, media_handle, pipeline_id.clone());
        self.checkpoints.save(&state).map_err(|e| e.stage_context(StageName::Export))?;

        if let Err(e) = self.checkpoints.purge_expired(self.config.retention_hours) {
            tracing::warn!("retention purge failed: {e}");
        }

        Ok(PipelineOutcome::Complete(fused))
    }

    fn stage_valid(
        &self,
        state: &PipelineState,
        stage: StageName,
        explicit_resume: bool,
        input: &Path,
        input_hash: &str,
    ) -> bool {
        CheckpointStore::is_valid_checkpoint(
            state,
            stage,
            self.config.auto_resume_hours,
            explicit_resume,
            Some((input, input_hash)),
        )
    }

    async fn run_upload(&self, input: &Path) -> Result<(String, PathBuf), PipelineError> {
        let uploader = crate::uploader::MediaUploader::new(self.config.diarization.clone());
        uploader.upload(input, &self.rate_budget, &self.retry).await
    }

    async fn run_diarize(
        &self,
        media: &str,
        webhook_url: Option<&str>,
    ) -> Result<StageOutcome<Vec<DiarizationSegment>>, PipelineError> {
        self.diarization
            .diarize(&media.to_string(), webhook_url, &self.rate_budget, &self.retry)
            .await
    }

    async fn run_transcribe(
        &self,
        normalized_path: &Path,
        tier: ModelTier,
        language: Option<&str>,
        prompt: Option<&str>,
        work_dir: &Path,
        cancellation: &CancellationToken,
    ) -> Result<Vec<TranscriptionSegment>, PipelineError> {
        let chunker = ChunkedTranscriber::new(self.transcription.clone());
        chunker
            .transcribe(normalized_path, tier, language, prompt, work_dir, cancellation, &self.rate_budget, &self.retry)
            .await
    }

    fn store_diarization(&self, pipeline_id: &str, segments: &[DiarizationSegment]) -> Result<String, PipelineError> {
        self.store_json(pipeline_id, "diarization", segments)
    }

    fn store_transcription(&self, pipeline_id: &str, segments: &[TranscriptionSegment]) -> Result<String, PipelineError> {
        self.store_json(pipeline_id, "transcription", segments)
    }

    fn store_fused(&self, pipeline_id: &str, segments: &[FusedSegment]) -> Result<String, PipelineError> {
        self.store_json(pipeline_id, "fused", segments)
    }

    fn store_json<T: serde::Serialize>(&self, pipeline_id: &str, suffix: &str, value: &T) -> Result<String, PipelineError> {
        let path = self.config.interim_path(pipeline_id, suffix);
        let json = serde_json::to_string_pretty(value).map_err(|e| PipelineError::Schema(e.to_string()))?;
        std::fs::write(&path, json).map_err(|e| PipelineError::Internal(format!("cannot write interim file: {e}")))?;
        Ok(path.display().to_string())
    }

    fn restore_diarization(&self, state: &PipelineState) -> Result<Vec<DiarizationSegment>, PipelineError> {
        self.restore_json(state, StageName::Diarize)
    }

    fn restore_transcription(&self, state: &PipelineState) -> Result<Vec<TranscriptionSegment>, PipelineError> {
        self.restore_json(state, StageName::Transcribe)
    }

    fn restore_fused(&self, state: &PipelineState) -> Result<Vec<FusedSegment>, PipelineError> {
        self.restore_json(state, StageName::Fuse)
    }

    fn restore_json<T: serde::de::DeserializeOwned>(&self, state: &PipelineState, stage: StageName) -> Result<T, PipelineError> {
        let checkpoint = state
            .checkpoints
            .iter()
            .rev()
            .find(|c| c.stage == stage && c.success)
            .ok_or_else(|| PipelineError::Internal(format!("no valid checkpoint for stage {:?}", stage)))?;
        let output_ref = checkpoint
            .output_ref
            .as_ref()
            .ok_or_else(|| PipelineError::Internal("checkpoint missing output_ref".into()))?;
        let raw = std::fs::read_to_string(output_ref)
            .map_err(|e| PipelineError::Internal(format!("cannot read interim file {output_ref}: {e}")))?;
        serde_json::from_str(&raw).map_err(|e| PipelineError::Schema(e.to_string()))
    }

    fn restore_interim_path(&self, state: &PipelineState, stage: StageName) -> Result<PathBuf, PipelineError> {
        let checkpoint = state
            .checkpoints
            .iter()
            .rev()
            .find(|c| c.stage == stage && c.success)
            .ok_or_else(|| PipelineError::Internal(format!("no valid checkpoint for stage {:?}", stage)))?;
        Ok(PathBuf::from(
            checkpoint.output_ref.clone().ok_or_else(|| PipelineError::Internal("checkpoint missing output_ref".into()))?,
        ))
    }

    fn persist_media_handle(&self, state: &mut PipelineState, handle: &str) {
        state.metadata["media_handle"] = serde_json::Value::String(handle.to_string());
    }

    fn restore_media_handle(&self, state: &PipelineState) -> Result<String, PipelineError> {
        state
            .metadata
            .get("media_handle")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
            .ok_or_else(|| PipelineError::Internal("checkpointed state missing media_handle".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pipeline_id_is_stable_for_same_input_and_config() {
        let config = test_config();
        let input = PathBuf::from("/tmp/meeting.wav");
        assert_eq!(
            PipelineScheduler::pipeline_id(&input, &config),
            PipelineScheduler::pipeline_id(&input, &config)
        );
    }

    #[test]
    fn pipeline_id_differs_for_different_inputs() {
        let config = test_config();
        let a = PipelineScheduler::pipeline_id(&PathBuf::from("/tmp/a.wav"), &config);
        let b = PipelineScheduler::pipeline_id(&PathBuf::from("/tmp/b.wav"), &config);
        assert_ne!(a, b);
    }

    fn test_config() -> Config {
        use crate::config::{ProviderEndpoint, RateLimitConfig};
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("interim")).unwrap();
        std::fs::create_dir_all(dir.path().join("checkpoints")).unwrap();
        Config {
            diarization: ProviderEndpoint { base_url: "http://localhost".into(), api_key: "x".into() },
            transcription: ProviderEndpoint { base_url: "http://localhost".into(), api_key: "x".into() },
            combined: ProviderEndpoint { base_url: "http://localhost".into(), api_key: "x".into() },
            webhook_secret: "secret".into(),
            data_root: dir.into_path(),
            rate_limits: RateLimitConfig { diarization_per_minute: 20, transcription_per_minute: 50, combined_per_minute: 100 },
            retention_hours: 48,
            auto_resume_hours: 24,
        }
    }
}
