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

//! The §7 error taxonomy, as a structured type the Retry Executor and
//! Stage Scheduler can match on instead of parsing error strings.

use crate::types::{Provider, StageName};
use thiserror::Error;

/// Classification used by the Retry Executor (C2) to pick a backoff policy.
/// This is deliberately separate from `PipelineError`: a single remote call
/// can produce several `ErrorKind`s over its retry attempts before settling
/// on a final `PipelineError`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    RateLimited,
    TransientNetwork,
    Other,
    Fatal,
}

impl ErrorKind {
    /// Classify an HTTP status code the way providers in §6.1 report errors.
    pub fn from_status(status: u16) -> Self {
        match status {
            429 => ErrorKind::RateLimited,
            502 | 503 | 504 => ErrorKind::TransientNetwork,
            400 | 401 | 403 => ErrorKind::Fatal,
            _ if (400..500).contains(&status) => ErrorKind::Fatal,
            _ if (500..600).contains(&status) => ErrorKind::Other,
            _ => ErrorKind::Other,
        }
    }

    /// Classify a `reqwest::Error` by its shape (timeout / connect vs. body).
    pub fn from_reqwest(err: &reqwest::Error) -> Self {
        if err.is_timeout() || err.is_connect() {
            ErrorKind::TransientNetwork
        } else if let Some(status) = err.status() {
            Self::from_status(status.as_u16())
        } else {
            ErrorKind::Other
        }
    }
}

/// The structured error returned to callers of the Stage Scheduler, per
/// §7's "user-visible behavior": `{kind, stage, provider?, attempt_count, cause}`.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("authentication rejected by provider {provider:?}: {message}")]
    Auth {
        provider: Provider,
        message: String,
    },

    #[error("rate limit exceeded on provider {provider:?} after {attempt_count} attempts")]
    RateLimited {
        provider: Provider,
        attempt_count: u32,
    },

    #[error("transient network failure calling provider {provider:?} after {attempt_count} attempts: {message}")]
    TransientNetwork {
        provider: Provider,
        attempt_count: u32,
        message: String,
    },

    #[error("provider {provider:?} returned an error after {attempt_count} attempts: {message}")]
    Provider {
        provider: Provider,
        attempt_count: u32,
        message: String,
    },

    #[error("could not parse provider response: {0}")]
    Schema(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("a second run for this pipeline is already in progress")]
    AlreadyRunning,

    #[error("internal invariant violated: {0}")]
    Internal(String),
}

impl PipelineError {
    pub fn stage_context(self, stage: StageName) -> StagedError {
        StagedError { stage, source: self }
    }
}

/// Turns a non-2xx provider response into the `(ErrorKind, PipelineError)`
/// pair a provider call site hands to the Retry Executor: the retry policy
/// keys off `ErrorKind`, while 401/403 additionally surface as
/// `PipelineError::Auth` and 429 as `PipelineError::RateLimited` rather than
/// a generic `Provider` error, per §7 ("AuthError — provider rejects
/// credentials. Surfaced immediately; pipeline aborts." and "RateLimited —
/// surfaced only after K_quota attempts"). Centralized here instead of
/// repeated per call site.
pub fn classify_response_error(
    provider: Provider,
    status: u16,
    message: String,
    attempt_count: u32,
) -> (ErrorKind, PipelineError) {
    let kind = ErrorKind::from_status(status);
    let error = if status == 401 || status == 403 {
        PipelineError::Auth { provider, message }
    } else if status == 429 {
        PipelineError::RateLimited { provider, attempt_count }
    } else {
        PipelineError::Provider { provider, attempt_count, message }
    };
    (kind, error)
}

/// A `PipelineError` annotated with the stage it occurred in, which is what
/// the Stage Scheduler actually records and surfaces.
#[derive(Debug, Error)]
#[error("stage {} failed: {source}", stage.as_str())]
pub struct StagedError {
    pub stage: StageName,
    #[source]
    pub source: PipelineError,
}
