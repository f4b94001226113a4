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

//! C8 — verifies and dispatches provider webhook callbacks (§4.8, §6.2).
//! Pure logic lives here; `src/bin/webhook_server.rs` wires it to axum.

use crate::checkpoint_store::CheckpointStore;
use crate::errors::PipelineError;
use crate::types::{DiarizationSegment, JobKind, JobStatus, StageName, WebhookEvent};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

type HmacSha256 = Hmac<Sha256>;

/// Rejection reasons surfaced as HTTP status codes by the caller: a bad
/// signature is 403, everything else about the request shape is 400.
#[derive(Debug, PartialEq, Eq)]
pub enum VerificationError {
    BadSignature,
    MalformedPayload(String),
}

/// Verifies `HMAC-SHA256(secret, "v0:" + timestamp + ":" + body)` against
/// the hex-encoded signature header, using constant-time comparison via
/// `Mac::verify_slice` (internally constant-time, per the `hmac` crate).
pub fn verify_signature(secret: &str, timestamp: &str, body: &[u8], signature_hex: &str) -> Result<(), VerificationError> {
    let signature_bytes = hex::decode(signature_hex).map_err(|_| VerificationError::BadSignature)?;

    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).map_err(|_| VerificationError::BadSignature)?;
    mac.update(b"v0:");
    mac.update(timestamp.as_bytes());
    mac.update(b":");
    mac.update(body);

    mac.verify_slice(&signature_bytes).map_err(|_| VerificationError::BadSignature)
}

pub fn parse_event(body: &[u8]) -> Result<WebhookEvent, VerificationError> {
    serde_json::from_slice(body).map_err(|e| VerificationError::MalformedPayload(e.to_string()))
}

/// Which provider-call family an event's `output` belongs to, determined
/// by which key is present on it (§4.8: "Route on payload shape").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadKind {
    Diarization,
    Voiceprint,
    Identification,
    Unknown,
}

impl PayloadKind {
    fn as_str(&self) -> &'static str {
        match self {
            PayloadKind::Diarization => "diarization",
            PayloadKind::Voiceprint => "voiceprint",
            PayloadKind::Identification => "identification",
            PayloadKind::Unknown => "unknown",
        }
    }
}

pub fn classify_payload(output: Option<&serde_json::Value>) -> PayloadKind {
    let Some(obj) = output.and_then(|v| v.as_object()) else {
        return PayloadKind::Unknown;
    };
    if obj.contains_key("diarization") {
        PayloadKind::Diarization
    } else if obj.contains_key("voiceprint") {
        PayloadKind::Voiceprint
    } else if obj.contains_key("identification") {
        PayloadKind::Identification
    } else {
        PayloadKind::Unknown
    }
}

/// Pulls a `list<DiarizationSegment>` out of an event's `output`, whether
/// it's the bare array the synchronous polling path returns or wrapped
/// under a `diarization`/`identification` key as the dispatch shape above.
fn extract_segments(output: &serde_json::Value) -> Option<Vec<DiarizationSegment>> {
    if output.is_array() {
        return serde_json::from_value(output.clone()).ok();
    }
    let obj = output.as_object()?;
    for key in ["diarization", "identification"] {
        if let Some(inner) = obj.get(key) {
            return serde_json::from_value(inner.clone()).ok();
        }
    }
    None
}

/// Persists the raw event to the interim directory under a name derived
/// from `job_id` and `timestamp`, then resolves any pipeline run awaiting
/// this `job_id` (§4.7 "Async stage completion"): writes the stage output
/// to the expected path and flips the checkpoint, so the next scheduler
/// invocation picks up where it left off.
///
/// `Voiceprint` jobs are persisted but have no pipeline stage to resolve —
/// voiceprint creation isn't a node of the UPLOAD→...→EXPORT DAG (§3).
pub fn persist_and_resolve(
    checkpoints: &CheckpointStore,
    data_root: &Path,
    timestamp: &str,
    event: &WebhookEvent,
) -> Result<(), PipelineError> {
    let kind = classify_payload(event.output.as_ref());
    let interim_dir = data_root.join("interim");
    std::fs::create_dir_all(&interim_dir)
        .map_err(|e| PipelineError::Internal(format!("cannot create interim dir: {e}")))?;

    let raw_path = interim_dir.join(format!("{}_{}_{}.json", event.job_id, timestamp, kind.as_str()));
    let raw_json = serde_json::to_string_pretty(event).map_err(|e| PipelineError::Schema(e.to_string()))?;
    std::fs::write(&raw_path, raw_json)
        .map_err(|e| PipelineError::Internal(format!("cannot write webhook payload: {e}")))?;

    let Some(mut state) = checkpoints.find_by_job_id(&event.job_id)? else {
        tracing::warn!("received webhook for job {} with no pipeline awaiting it", event.job_id);
        return Ok(());
    };

    let stage = match state.pending_job.as_ref().map(|job| job.kind) {
        Some(JobKind::Diarize) | Some(JobKind::Identify) => StageName::Diarize,
        Some(JobKind::Voiceprint) | None => return Ok(()),
    };

    match event.status {
        JobStatus::Succeeded => {
            let output = event
                .output
                .as_ref()
                .ok_or_else(|| PipelineError::Schema("succeeded webhook event missing output".into()))?;
            let segments = extract_segments(output)
                .ok_or_else(|| PipelineError::Schema("webhook output did not parse as diarization segments".into()))?;

            let output_path = interim_dir.join(format!("{}_diarization.json", state.pipeline_id));
            let json = serde_json::to_string_pretty(&segments).map_err(|e| PipelineError::Schema(e.to_string()))?;
            std::fs::write(&output_path, json)
                .map_err(|e| PipelineError::Internal(format!("cannot write diarization output: {e}")))?;

            state.record_success(stage, event.job_id.clone(), output_path.display().to_string());
        }
        JobStatus::Failed | JobStatus::Canceled => {
            state.record_failure(stage, event.job_id.clone(), format!("webhook reported {:?}", event.status));
        }
        JobStatus::Created | JobStatus::Running => {
            // An intermediate status delivered out of band; nothing to
            // resolve yet, keep `pending_job` as-is.
            return Ok(());
        }
    }

    checkpoints.save(&state)
}

#[derive(Debug, Default)]
pub struct WebhookMetrics {
    pub processed: AtomicU64,
    pub failed_verifications: AtomicU64,
    pub successful_events: AtomicU64,
}

impl WebhookMetrics {
    pub fn verification_success_rate(&self) -> f64 {
        let processed = self.processed.load(Ordering::Relaxed);
        if processed == 0 {
            return 1.0;
        }
        let failed = self.failed_verifications.load(Ordering::Relaxed);
        (processed.saturating_sub(failed)) as f64 / processed as f64
    }
}

/// A redelivery (`X-Retry-Num` >= 1) of the same `job_id` must still be
/// verified, still overwrites the stored payload, and still re-runs
/// dispatch (§4.8 "Retry semantics") — it is not silently dropped. What
/// makes that safe is that dispatch itself is idempotent: writing the
/// same payload to the same `job_id`-derived path twice has no additional
/// effect, and `record_success`/`record_failure` just replace the prior
/// checkpoint-in-progress state for that job.
pub struct WebhookDispatcher {
    metrics: WebhookMetrics,
}

impl Default for WebhookDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl WebhookDispatcher {
    pub fn new() -> Self {
        Self { metrics: WebhookMetrics::default() }
    }

    pub fn metrics(&self) -> &WebhookMetrics {
        &self.metrics
    }

    /// Verifies and parses an inbound delivery. Returns `Err` for anything
    /// that must be rejected at the HTTP layer (403 on a bad signature,
    /// 400 on an unparseable body); the caller is responsible for running
    /// dispatch (`persist_and_resolve`) on the returned event, including
    /// for redeliveries.
    pub fn handle(
        &self,
        secret: &str,
        timestamp: &str,
        body: &[u8],
        signature_hex: &str,
    ) -> Result<WebhookEvent, VerificationError> {
        self.metrics.processed.fetch_add(1, Ordering::Relaxed);

        if let Err(e) = verify_signature(secret, timestamp, body, signature_hex) {
            self.metrics.failed_verifications.fetch_add(1, Ordering::Relaxed);
            return Err(e);
        }

        let event = parse_event(body)?;

        if event.status == JobStatus::Succeeded || event.status == JobStatus::Failed {
            self.metrics.successful_events.fetch_add(1, Ordering::Relaxed);
        }

        Ok(event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sign(secret: &str, timestamp: &str, body: &[u8]) -> String {
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(b"v0:");
        mac.update(timestamp.as_bytes());
        mac.update(b":");
        mac.update(body);
        hex::encode(mac.finalize().into_bytes())
    }

    #[test]
    fn accepts_a_correctly_signed_payload() {
        let body = br#"{"job_id":"j1","status":"succeeded"}"#;
        let signature = sign("shh", "1700000000", body);
        assert!(verify_signature("shh", "1700000000", body, &signature).is_ok());
    }

    #[test]
    fn rejects_a_tampered_body() {
        let body = br#"{"job_id":"j1","status":"succeeded"}"#;
        let signature = sign("shh", "1700000000", body);
        let tampered = br#"{"job_id":"j1","status":"failed"}"#;
        assert!(verify_signature("shh", "1700000000", tampered, &signature).is_err());
    }

    #[test]
    fn rejects_wrong_secret() {
        let body = br#"{"job_id":"j1","status":"succeeded"}"#;
        let signature = sign("shh", "1700000000", body);
        assert!(verify_signature("other", "1700000000", body, &signature).is_err());
    }

    #[test]
    fn redelivery_of_the_same_job_is_verified_and_parsed_again() {
        let dispatcher = WebhookDispatcher::new();
        let body = br#"{"job_id":"j1","status":"succeeded"}"#;
        let signature = sign("shh", "1700000000", body);

        let first = dispatcher.handle("shh", "1700000000", body, &signature).unwrap();
        let second = dispatcher.handle("shh", "1700000000", body, &signature).unwrap();

        assert_eq!(first.job_id, "j1");
        assert_eq!(second.job_id, "j1");
        assert_eq!(dispatcher.metrics().successful_events.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn classifies_payload_by_wrapper_key() {
        assert_eq!(
            classify_payload(Some(&serde_json::json!({"diarization": []}))),
            PayloadKind::Diarization
        );
        assert_eq!(
            classify_payload(Some(&serde_json::json!({"voiceprint": "abc"}))),
            PayloadKind::Voiceprint
        );
        assert_eq!(classify_payload(None), PayloadKind::Unknown);
    }

    #[test]
    fn persist_and_resolve_completes_a_pipeline_awaiting_its_job() {
        use crate::checkpoint_store::CheckpointStore;
        use crate::types::{JobHandle, JobKind, PipelineState};

        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path().to_path_buf());
        std::fs::create_dir_all(dir.path().join("checkpoints")).unwrap();

        let mut state = PipelineState::new("p1".into(), "inputhash".into(), "confighash".into());
        state.set_pending(JobHandle {
            job_id: "job-123".into(),
            kind: JobKind::Diarize,
            submitted_at: chrono::Utc::now(),
            webhook_url: Some("https://example.com/webhook".into()),
        });
        store.save(&state).unwrap();

        let event = WebhookEvent {
            job_id: "job-123".into(),
            status: JobStatus::Succeeded,
            output: Some(serde_json::json!([
                {"start": 0.0, "end": 2.0, "speaker": "S0"}
            ])),
            retry_num: None,
            retry_reason: None,
        };

        persist_and_resolve(&store, dir.path(), "1700000000", &event).unwrap();

        let resolved = store.load("p1").unwrap().unwrap();
        assert!(resolved.has_completed(StageName::Diarize));
        assert!(resolved.pending_job.is_none());
    }

    #[test]
    fn bad_signature_is_counted_in_metrics() {
        let dispatcher = WebhookDispatcher::new();
        let body = br#"{"job_id":"j1","status":"succeeded"}"#;
        let result = dispatcher.handle("shh", "1700000000", body, "deadbeef");
        assert!(result.is_err());
        assert_eq!(dispatcher.metrics().failed_verifications.load(Ordering::Relaxed), 1);
    }
}
