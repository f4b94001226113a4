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

//! Persists `PipelineState` between scheduler invocations (§4.7, §6.3).
//! Writes are atomic (temp file + rename); a per-pipeline advisory file
//! lock keeps two schedulers from racing on the same `pipeline_id`.

use crate::errors::PipelineError;
use crate::types::{PipelineState, StageName};
use chrono::{DateTime, Utc};
use fs2::FileExt;
use sha2::{Digest, Sha256};
use std::fs::File;
use std::path::{Path, PathBuf};

/// Content hash of the input file, used as `PipelineState::input_fingerprint`
/// (§3) and checked by `is_valid_checkpoint` criterion (a): a changed input
/// at the same path invalidates every completed stage.
pub fn hash_file(path: &Path) -> Result<String, PipelineError> {
    let mut file = File::open(path)
        .map_err(|e| PipelineError::Internal(format!("cannot open {path:?} for hashing: {e}")))?;
    let mut hasher = Sha256::new();
    std::io::copy(&mut file, &mut hasher)
        .map_err(|e| PipelineError::Internal(format!("cannot read {path:?} for hashing: {e}")))?;
    Ok(hex::encode(hasher.finalize()))
}

pub struct CheckpointStore {
    data_root: PathBuf,
}

/// Held for the lifetime of one scheduler run against a pipeline_id.
/// Dropping it releases the advisory lock even if the run panics.
pub struct PipelineLock {
    _file: File,
    lock_path: PathBuf,
}

impl Drop for PipelineLock {
    fn drop(&mut self) {
        let _ = fs2::FileExt::unlock(&self._file);
        let _ = std::fs::remove_file(&self.lock_path);
    }
}

impl CheckpointStore {
    pub fn new(data_root: PathBuf) -> Self {
        Self { data_root }
    }

    fn checkpoint_path(&self, pipeline_id: &str) -> PathBuf {
        self.data_root.join("checkpoints").join(format!("{pipeline_id}_state.json"))
    }

    fn lock_path(&self, pipeline_id: &str) -> PathBuf {
        self.data_root.join("checkpoints").join(format!("{pipeline_id}.lock"))
    }

    /// Acquires an exclusive, non-blocking lock for `pipeline_id`. Returns
    /// `PipelineError::AlreadyRunning` if another run already holds it.
    pub fn lock(&self, pipeline_id: &str) -> Result<PipelineLock, PipelineError> {
        let lock_path = self.lock_path(pipeline_id);
        let file = File::create(&lock_path)
            .map_err(|e| PipelineError::Internal(format!("cannot create lock file: {e}")))?;

        file.try_lock_exclusive().map_err(|_| PipelineError::AlreadyRunning)?;

        Ok(PipelineLock { _file: file, lock_path })
    }

    pub fn load(&self, pipeline_id: &str) -> Result<Option<PipelineState>, PipelineError> {
        let path = self.checkpoint_path(pipeline_id);
        if !path.exists() {
            return Ok(None);
        }

        let raw = std::fs::read_to_string(&path)
            .map_err(|e| PipelineError::Internal(format!("cannot read checkpoint: {e}")))?;
        let state: PipelineState =
            serde_json::from_str(&raw).map_err(|e| PipelineError::Schema(e.to_string()))?;
        Ok(Some(state))
    }

    /// Writes via a temp file in the same directory, then renames over the
    /// target — the rename is atomic on the same filesystem, so a crash
    /// mid-write never leaves a half-written checkpoint visible.
    pub fn save(&self, state: &PipelineState) -> Result<(), PipelineError> {
        let dir = self.data_root.join("checkpoints");
        std::fs::create_dir_all(&dir)
            .map_err(|e| PipelineError::Internal(format!("cannot create checkpoint dir: {e}")))?;

        let mut temp = tempfile::NamedTempFile::new_in(&dir)
            .map_err(|e| PipelineError::Internal(format!("cannot create temp checkpoint file: {e}")))?;

        let json = serde_json::to_string_pretty(state).map_err(|e| PipelineError::Schema(e.to_string()))?;
        use std::io::Write;
        temp.write_all(json.as_bytes())
            .map_err(|e| PipelineError::Internal(format!("cannot write temp checkpoint: {e}")))?;
        temp.flush().map_err(|e| PipelineError::Internal(e.to_string()))?;

        temp.persist(self.checkpoint_path(&state.pipeline_id))
            .map_err(|e| PipelineError::Internal(format!("cannot persist checkpoint: {e}")))?;

        Ok(())
    }

    /// Decides whether a stage's recorded checkpoint can be trusted as-is
    /// (§4.7's resume rules): the input file must still exist with an
    /// unchanged content hash, the stage must be marked complete, its
    /// output file must still exist, and the whole run must be within the
    /// auto-resume window unless the caller is an explicit resume.
    ///
    /// `input` and `current_input_hash` implement validation criterion (a);
    /// pass `None` to skip it (e.g. when the input path isn't available at
    /// the call site and a caller has already checked it once per run).
    pub fn is_valid_checkpoint(
        state: &PipelineState,
        stage: StageName,
        auto_resume_hours: u64,
        explicit_resume: bool,
        input_check: Option<(&Path, &str)>,
    ) -> bool {
        if let Some((input_path, current_hash)) = input_check {
            if !input_path.exists() || current_hash != state.input_fingerprint {
                return false;
            }
        }
        if !state.has_completed(stage) {
            return false;
        }
        let Some(checkpoint) = state.checkpoints.iter().rev().find(|c| c.stage == stage && c.success) else {
            return false;
        };
        if let Some(output_ref) = &checkpoint.output_ref {
            if !Path::new(output_ref).exists() {
                return false;
            }
        }
        if explicit_resume {
            return true;
        }
        age_hours(state.last_updated) <= auto_resume_hours as f64
    }

    pub fn data_root(&self) -> &Path {
        &self.data_root
    }

    /// Scans checkpoint files for the `PipelineState` whose `pending_job`
    /// matches `job_id` — how the webhook endpoint (§4.8) correlates an
    /// inbound event with the scheduler run awaiting it.
    pub fn find_by_job_id(&self, job_id: &str) -> Result<Option<PipelineState>, PipelineError> {
        let dir = self.data_root.join("checkpoints");
        if !dir.exists() {
            return Ok(None);
        }

        for entry in std::fs::read_dir(&dir)
            .map_err(|e| PipelineError::Internal(format!("cannot list checkpoint dir: {e}")))?
        {
            let entry = entry.map_err(|e| PipelineError::Internal(e.to_string()))?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let raw = match std::fs::read_to_string(&path) {
                Ok(raw) => raw,
                Err(_) => continue,
            };
            let state: PipelineState = match serde_json::from_str(&raw) {
                Ok(state) => state,
                Err(_) => continue,
            };
            if state.pending_job.as_ref().map(|j| j.job_id.as_str()) == Some(job_id) {
                return Ok(Some(state));
            }
        }

        Ok(None)
    }

    /// Removes checkpoint and interim files for pipelines whose last
    /// update predates `retention_hours` (§6.4's retention policy).
    pub fn purge_expired(&self, retention_hours: u64) -> Result<usize, PipelineError> {
        let dir = self.data_root.join("checkpoints");
        if !dir.exists() {
            return Ok(0);
        }

        let mut purged = 0;
        for entry in std::fs::read_dir(&dir)
            .map_err(|e| PipelineError::Internal(format!("cannot list checkpoint dir: {e}")))?
        {
            let entry = entry.map_err(|e| PipelineError::Internal(e.to_string()))?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }

            let raw = match std::fs::read_to_string(&path) {
                Ok(raw) => raw,
                Err(_) => continue,
            };
            let state: PipelineState = match serde_json::from_str(&raw) {
                Ok(state) => state,
                Err(_) => continue,
            };

            if age_hours(state.last_updated) > retention_hours as f64 {
                let _ = std::fs::remove_file(&path);
                purged += 1;
            }
        }

        Ok(purged)
    }
}

fn age_hours(timestamp: DateTime<Utc>) -> f64 {
    (Utc::now() - timestamp).num_seconds() as f64 / 3600.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::PipelineState;

    fn store() -> (CheckpointStore, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        (CheckpointStore::new(dir.path().to_path_buf()), dir)
    }

    #[test]
    fn save_then_load_round_trips() {
        let (store, _dir) = store();
        let state = PipelineState::new("p1".into(), "inputhash".into(), "confighash".into());
        store.save(&state).unwrap();

        let loaded = store.load("p1").unwrap().unwrap();
        assert_eq!(loaded.pipeline_id, "p1");
    }

    #[test]
    fn load_missing_pipeline_returns_none() {
        let (store, _dir) = store();
        assert!(store.load("does-not-exist").unwrap().is_none());
    }

    #[test]
    fn second_lock_on_same_pipeline_fails() {
        let (store, _dir) = store();
        std::fs::create_dir_all(store.data_root.join("checkpoints")).unwrap();
        let _first = store.lock("p1").unwrap();
        let second = store.lock("p1");
        assert!(matches!(second, Err(PipelineError::AlreadyRunning)));
    }

    #[test]
    fn checkpoint_invalid_when_output_file_missing() {
        let mut state = PipelineState::new("p1".into(), "i".into(), "c".into());
        state.record_success(StageName::Upload, "in".into(), "/no/such/file".into());
        assert!(!CheckpointStore::is_valid_checkpoint(&state, StageName::Upload, 24, false, None));
    }

    #[test]
    fn checkpoint_invalid_when_stage_not_completed() {
        let state = PipelineState::new("p1".into(), "i".into(), "c".into());
        assert!(!CheckpointStore::is_valid_checkpoint(&state, StageName::Upload, 24, false, None));
    }

    #[test]
    fn checkpoint_invalid_when_input_content_hash_changed() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("input.wav");
        std::fs::write(&input, b"original bytes").unwrap();
        let original_hash = hash_file(&input).unwrap();

        let mut state = PipelineState::new("p1".into(), original_hash, "c".into());
        state.record_success(StageName::Upload, input.display().to_string(), input.display().to_string());
        assert!(CheckpointStore::is_valid_checkpoint(
            &state,
            StageName::Upload,
            24,
            false,
            Some((&input, &hash_file(&input).unwrap()))
        ));

        std::fs::write(&input, b"different bytes, same path").unwrap();
        let changed_hash = hash_file(&input).unwrap();
        assert!(!CheckpointStore::is_valid_checkpoint(
            &state,
            StageName::Upload,
            24,
            false,
            Some((&input, &changed_hash))
        ));
    }
}
