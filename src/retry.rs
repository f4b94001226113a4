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

//! C2 — adaptive retry and rate-limit-aware backoff (§4.2).

use crate::errors::{ErrorKind, PipelineError};
use crate::types::Provider;
use parking_lot::Mutex;
use rand::Rng;
use std::collections::HashMap;
use std::time::Duration;

const QUOTA_BASE: Duration = Duration::from_secs(1);
const QUOTA_CAP: Duration = Duration::from_secs(30);
const K_QUOTA: u32 = 8;

const NET_WAITS: [Duration; 3] =
    [Duration::from_millis(500), Duration::from_secs(1), Duration::from_secs(2)];
const K_NET: u32 = 3;

const OTHER_WAITS: [Duration; 3] =
    [Duration::from_secs(2), Duration::from_secs(4), Duration::from_secs(8)];
const K_OTHER: u32 = 3;

/// What a single attempt of a wrapped call reported, before `run` decides
/// whether and how long to wait before retrying.
pub enum Attempt<T> {
    Ok(T),
    Retryable(ErrorKind, PipelineError),
}

#[derive(Debug, Default, Clone)]
pub struct RetryStats {
    pub attempts_total: u32,
    pub attempts_by_class: HashMap<&'static str, u32>,
    pub retry_wait_total_seconds: f64,
}

pub struct RetryExecutor {
    stats: Mutex<HashMap<Provider, RetryStats>>,
}

impl Default for RetryExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl RetryExecutor {
    pub fn new() -> Self {
        Self { stats: Mutex::new(HashMap::new()) }
    }

    pub fn stats_for(&self, provider: Provider) -> RetryStats {
        self.stats.lock().entry(provider).or_default().clone()
    }

    /// Runs `f`, retrying per the error-class policy in §4.2 until it
    /// succeeds, exhausts its attempt budget, or hits a `Fatal` error.
    /// `f` must be idempotent, as every remote call in §4.4 is either
    /// idempotent-by-design or provider-deduplicated.
    pub async fn run<F, Fut, T>(&self, provider: Provider, mut f: F) -> Result<T, PipelineError>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Attempt<T>>,
    {
        let mut attempt_count: u32 = 0;

        loop {
            attempt_count += 1;
            self.record_attempt(provider, None);

            match f().await {
                Attempt::Ok(value) => return Ok(value),
                Attempt::Retryable(ErrorKind::Fatal, err) => {
                    self.record_attempt(provider, Some("fatal"));
                    return Err(err);
                }
                Attempt::Retryable(kind, err) => {
                    self.record_attempt(provider, Some(class_label(kind)));

                    let (waits, cap): (Vec<Duration>, u32) = match kind {
                        ErrorKind::RateLimited => (quota_wait_table(), K_QUOTA),
                        ErrorKind::TransientNetwork => (NET_WAITS.to_vec(), K_NET),
                        ErrorKind::Other => (OTHER_WAITS.to_vec(), K_OTHER),
                        ErrorKind::Fatal => unreachable!("handled above"),
                    };

                    if attempt_count >= cap {
                        tracing::warn!(
                            "{:?} exhausted {} attempts on provider {:?}, surfacing error",
                            kind,
                            attempt_count,
                            provider
                        );
                        return Err(err);
                    }

                    let wait = waits
                        .get((attempt_count - 1) as usize)
                        .copied()
                        .unwrap_or_else(|| *waits.last().unwrap());

                    self.record_wait(provider, wait);
                    tracing::info!(
                        "retrying provider {:?} after {:?} ({:?}, attempt {}/{})",
                        provider,
                        wait,
                        kind,
                        attempt_count,
                        cap
                    );
                    tokio::time::sleep(wait).await;
                }
            }
        }
    }

    fn record_attempt(&self, provider: Provider, class: Option<&'static str>) {
        let mut stats = self.stats.lock();
        let entry = stats.entry(provider).or_default();
        entry.attempts_total += 1;
        if let Some(class) = class {
            *entry.attempts_by_class.entry(class).or_insert(0) += 1;
        }
    }

    fn record_wait(&self, provider: Provider, wait: Duration) {
        let mut stats = self.stats.lock();
        let entry = stats.entry(provider).or_default();
        entry.retry_wait_total_seconds += wait.as_secs_f64();
    }
}

fn class_label(kind: ErrorKind) -> &'static str {
    match kind {
        ErrorKind::RateLimited => "rate_limited",
        ErrorKind::TransientNetwork => "transient_network",
        ErrorKind::Other => "other",
        ErrorKind::Fatal => "fatal",
    }
}

/// `wait_k = min(base * 2^k, cap) + U(0, base)`.
fn quota_wait_table() -> Vec<Duration> {
    (0..K_QUOTA)
        .map(|k| {
            let exp = QUOTA_BASE.saturating_mul(1u32 << k.min(10));
            let capped = exp.min(QUOTA_CAP);
            let jitter_ms = rand::thread_rng().gen_range(0..QUOTA_BASE.as_millis() as u64);
            capped + Duration::from_millis(jitter_ms)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn succeeds_without_retry_on_first_try() {
        let executor = RetryExecutor::new();
        let result: Result<u32, PipelineError> = executor
            .run(Provider::Diarization, || async { Attempt::Ok(42) })
            .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(executor.stats_for(Provider::Diarization).attempts_total, 1);
    }

    #[tokio::test]
    async fn fatal_errors_are_not_retried() {
        let executor = RetryExecutor::new();
        let calls = Arc::new(AtomicU32::new(0));
        let calls2 = calls.clone();

        let result: Result<(), PipelineError> = executor
            .run(Provider::Transcription, move || {
                calls2.fetch_add(1, Ordering::SeqCst);
                async move {
                    Attempt::Retryable(
                        ErrorKind::Fatal,
                        PipelineError::Validation("bad request".into()),
                    )
                }
            })
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn transient_network_retries_up_to_k_net() {
        let executor = RetryExecutor::new();
        let calls = Arc::new(AtomicU32::new(0));
        let calls2 = calls.clone();

        let result: Result<(), PipelineError> = executor
            .run(Provider::Transcription, move || {
                calls2.fetch_add(1, Ordering::SeqCst);
                async move {
                    Attempt::Retryable(
                        ErrorKind::TransientNetwork,
                        PipelineError::TransientNetwork {
                            provider: Provider::Transcription,
                            attempt_count: 1,
                            message: "timeout".into(),
                        },
                    )
                }
            })
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), K_NET);
    }

    #[tokio::test]
    async fn recovers_after_retryable_failures() {
        let executor = RetryExecutor::new();
        let calls = Arc::new(AtomicU32::new(0));
        let calls2 = calls.clone();

        let result = executor
            .run(Provider::Diarization, move || {
                let n = calls2.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Attempt::Retryable(
                            ErrorKind::TransientNetwork,
                            PipelineError::TransientNetwork {
                                provider: Provider::Diarization,
                                attempt_count: n,
                                message: "reset".into(),
                            },
                        )
                    } else {
                        Attempt::Ok("done")
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), "done");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
