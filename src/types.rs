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

//! Data records shared across every component (§3 of the design).
//!
//! These are the only shapes that cross a persistence boundary; every
//! stage output and checkpoint payload is one of these types, validated
//! on read.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Opaque reference returned by the diarization provider after upload.
/// Scoped to the remote tenant, auto-expires after 24-48h out of band.
pub type MediaHandle = String;

/// A transcription model tier. The response-format asymmetry in §4.4.3
/// hinges on this: only `Cheap` gets timed segments back from the provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ModelTier {
    Cheap,
    Mid,
    High,
}

impl ModelTier {
    pub fn provider_model_name(&self) -> &'static str {
        match self {
            ModelTier::Cheap => "whisper-1",
            ModelTier::Mid => "gpt-4o-mini-transcribe",
            ModelTier::High => "gpt-4o-transcribe",
        }
    }

    /// Only the cheap tier supports `verbose_json` (timed segments).
    pub fn supports_segments(&self) -> bool {
        matches!(self, ModelTier::Cheap)
    }
}

/// A single speaker-attributed time interval from the diarization provider.
/// Segments may overlap when the provider detects cross-talk; downstream
/// components must tolerate that.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiarizationSegment {
    pub start: f64,
    pub end: f64,
    pub speaker: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
}

impl DiarizationSegment {
    pub fn duration(&self) -> f64 {
        self.end - self.start
    }
}

/// A single transcribed interval, in whatever time frame the producer used
/// (chunk-local until C5 stitches it to absolute file time).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptionSegment {
    pub start: f64,
    pub end: f64,
    pub text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
}

impl TranscriptionSegment {
    pub fn duration(&self) -> f64 {
        self.end - self.start
    }

    pub fn shifted(&self, offset: f64) -> Self {
        Self {
            start: self.start + offset,
            end: self.end + offset,
            ..self.clone()
        }
    }
}

/// The canonical output of the pipeline: one entry per transcription
/// segment after fusion with diarization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FusedSegment {
    pub start: f64,
    pub end: f64,
    pub speaker: String,
    pub text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub diarization_speaker: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub identified_as: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub match_score: Option<f64>,
}

/// Label used when overlap with any diarization segment is below threshold.
pub const UNKNOWN_SPEAKER: &str = "UNKNOWN";

/// A diarization segment additionally matched against a voiceprint (§4.4.2).
/// The identification endpoint is otherwise identical to diarize; this is
/// `DiarizationSegment` plus the two fields the provider adds when
/// `voiceprints` are supplied.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdentificationSegment {
    pub start: f64,
    pub end: f64,
    pub speaker: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub identified_as: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub match_score: Option<f64>,
}

/// A speaker voiceprint: an opaque embedding derived from a short sample.
/// Read-only from the core; created and stored externally.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Voiceprint {
    pub id: String,
    pub label: String,
    /// Base64-encoded opaque payload, as returned by the provider.
    pub payload: String,
    pub created_at: DateTime<Utc>,
    pub duration_seconds: f64,
}

/// A chunk of audio split out of an oversized file for parallel
/// transcription. Internal to C5; never persisted past a single call.
#[derive(Debug, Clone)]
pub struct Chunk {
    pub index: usize,
    pub offset_seconds: f64,
    pub path: PathBuf,
    pub duration_seconds: f64,
}

/// One node of the pipeline DAG.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StageName {
    Upload,
    Diarize,
    Transcribe,
    Fuse,
    Export,
}

impl StageName {
    pub fn as_str(&self) -> &'static str {
        match self {
            StageName::Upload => "UPLOAD",
            StageName::Diarize => "DIARIZE",
            StageName::Transcribe => "TRANSCRIBE",
            StageName::Fuse => "FUSE",
            StageName::Export => "EXPORT",
        }
    }

    /// The fixed, ordered stage sequence from §4.7. DIARIZE and TRANSCRIBE
    /// commute and may run concurrently, but both sort before FUSE.
    pub fn ordered() -> &'static [StageName] {
        &[
            StageName::Upload,
            StageName::Diarize,
            StageName::Transcribe,
            StageName::Fuse,
            StageName::Export,
        ]
    }
}

/// A single append-only record that a stage completed (or failed).
/// Checkpoints are appended monotonically; never rewritten in place.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub stage: StageName,
    pub timestamp: DateTime<Utc>,
    pub input_ref: String,
    pub output_ref: Option<String>,
    pub metadata: serde_json::Value,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Persisted state for one `(input, config)` pipeline run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineState {
    pub pipeline_id: String,
    pub input_fingerprint: String,
    pub config_fingerprint: String,
    pub created_at: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
    pub completed_stages: Vec<StageName>,
    pub current_stage: Option<StageName>,
    pub failed_stage: Option<StageName>,
    pub checkpoints: Vec<Checkpoint>,
    pub metadata: serde_json::Value,
    /// Set when a stage is dispatched with a webhook URL instead of run to
    /// completion (§4.7 "Async stage completion"). The webhook endpoint
    /// looks up the `PipelineState` awaiting a given `job_id` via this
    /// field, writes the stage output, and clears it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pending_job: Option<JobHandle>,
}

impl PipelineState {
    pub fn new(pipeline_id: String, input_fingerprint: String, config_fingerprint: String) -> Self {
        let now = Utc::now();
        Self {
            pipeline_id,
            input_fingerprint,
            config_fingerprint,
            created_at: now,
            last_updated: now,
            completed_stages: Vec::new(),
            current_stage: None,
            failed_stage: None,
            checkpoints: Vec::new(),
            metadata: serde_json::json!({}),
            pending_job: None,
        }
    }

    pub fn has_completed(&self, stage: StageName) -> bool {
        self.completed_stages.contains(&stage)
    }

    /// Records that `stage` was dispatched asynchronously and is now
    /// waiting on a webhook delivery for `job`.
    pub fn set_pending(&mut self, job: JobHandle) {
        self.pending_job = Some(job);
        self.last_updated = Utc::now();
    }

    pub fn record_success(&mut self, stage: StageName, input_ref: String, output_ref: String) {
        self.checkpoints.push(Checkpoint {
            stage,
            timestamp: Utc::now(),
            input_ref,
            output_ref: Some(output_ref),
            metadata: serde_json::json!({}),
            success: true,
            error: None,
        });
        if !self.completed_stages.contains(&stage) {
            self.completed_stages.push(stage);
        }
        self.current_stage = None;
        self.failed_stage = None;
        self.pending_job = None;
        self.last_updated = Utc::now();
    }

    pub fn record_failure(&mut self, stage: StageName, input_ref: String, error: String) {
        self.checkpoints.push(Checkpoint {
            stage,
            timestamp: Utc::now(),
            input_ref,
            output_ref: None,
            metadata: serde_json::json!({}),
            success: false,
            error: Some(error),
        });
        self.failed_stage = Some(stage);
        self.current_stage = None;
        self.pending_job = None;
        self.last_updated = Utc::now();
    }
}

/// The kind of asynchronous job a provider call may have been dispatched as.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobKind {
    Diarize,
    Identify,
    Voiceprint,
}

/// Handle to a provider-side asynchronous job, returned when a C4 call is
/// dispatched with a webhook URL instead of run to completion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobHandle {
    pub job_id: String,
    pub kind: JobKind,
    pub submitted_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub webhook_url: Option<String>,
}

/// Terminal or in-progress status reported by a provider's job endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Created,
    Running,
    Succeeded,
    Canceled,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Succeeded | JobStatus::Canceled | JobStatus::Failed)
    }
}

/// Payload delivered by a provider callback to the webhook endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookEvent {
    pub job_id: String,
    pub status: JobStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_num: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_reason: Option<String>,
}

/// Which remote provider family a call belongs to — the key for both the
/// rate budget (C1) and the retry executor's statistics (C2).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Provider {
    Diarization,
    Transcription,
    Combined,
}

impl Provider {
    /// Default sliding-window capacity, requests per 60s window (§4.1).
    pub fn default_capacity(&self) -> u32 {
        match self {
            Provider::Diarization => 20,
            Provider::Transcription => 50,
            Provider::Combined => 100,
        }
    }
}
