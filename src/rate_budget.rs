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

//! C1 — per-provider sliding-window request budget (§4.1).

use crate::config::RateLimitConfig;
use crate::types::Provider;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

const WINDOW: Duration = Duration::from_secs(60);

/// A ticket exists only to structure the call site; releasing it is a
/// no-op because the window self-expires timestamps rather than counting
/// concurrent holders.
pub struct Ticket;

struct ProviderWindow {
    capacity: u32,
    timestamps: VecDeque<Instant>,
}

pub struct RateBudget {
    windows: Mutex<HashMap<Provider, ProviderWindow>>,
    waited_millis_total: AtomicU64,
}

impl RateBudget {
    pub fn new(limits: &RateLimitConfig) -> Self {
        let mut windows = HashMap::new();
        windows.insert(
            Provider::Diarization,
            ProviderWindow { capacity: limits.diarization_per_minute, timestamps: VecDeque::new() },
        );
        windows.insert(
            Provider::Transcription,
            ProviderWindow { capacity: limits.transcription_per_minute, timestamps: VecDeque::new() },
        );
        windows.insert(
            Provider::Combined,
            ProviderWindow { capacity: limits.combined_per_minute, timestamps: VecDeque::new() },
        );
        Self { windows: Mutex::new(windows), waited_millis_total: AtomicU64::new(0) }
    }

    /// Blocks (async) until a call to `provider` is allowed, then records
    /// the ticket. Never fails — the only observable is wait time.
    pub async fn acquire(&self, provider: Provider) -> Ticket {
        loop {
            let wait = {
                let mut windows = self.windows.lock();
                let window = windows.get_mut(&provider).expect("provider window configured");
                Self::evict_stale(window);

                if (window.timestamps.len() as u32) < window.capacity {
                    window.timestamps.push_back(Instant::now());
                    None
                } else {
                    let oldest = *window.timestamps.front().expect("non-empty when at capacity");
                    Some(WINDOW.saturating_sub(oldest.elapsed()))
                }
            };

            match wait {
                None => return Ticket,
                Some(duration) if duration.is_zero() => continue,
                Some(duration) => {
                    self.waited_millis_total.fetch_add(duration.as_millis() as u64, Ordering::Relaxed);
                    tracing::debug!("rate budget for {:?} exhausted, waiting {:?}", provider, duration);
                    tokio::time::sleep(duration).await;
                }
            }
        }
    }

    /// Non-blocking variant: returns `true` and records a ticket if a call
    /// is currently allowed, `false` otherwise without touching the window.
    pub fn try_acquire(&self, provider: Provider) -> bool {
        let mut windows = self.windows.lock();
        let window = windows.get_mut(&provider).expect("provider window configured");
        Self::evict_stale(window);

        if (window.timestamps.len() as u32) < window.capacity {
            window.timestamps.push_back(Instant::now());
            true
        } else {
            false
        }
    }

    pub fn release(&self, _ticket: Ticket) {
        // Tickets exist only to structure call sites; the window expires
        // timestamps on its own, so release is intentionally a no-op.
    }

    pub fn waited_seconds_total(&self) -> f64 {
        self.waited_millis_total.load(Ordering::Relaxed) as f64 / 1000.0
    }

    fn evict_stale(window: &mut ProviderWindow) {
        let cutoff = Instant::now().checked_sub(WINDOW).unwrap_or_else(Instant::now);
        while let Some(&front) = window.timestamps.front() {
            if front < cutoff {
                window.timestamps.pop_front();
            } else {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limits() -> RateLimitConfig {
        RateLimitConfig {
            diarization_per_minute: 2,
            transcription_per_minute: 2,
            combined_per_minute: 2,
        }
    }

    #[tokio::test]
    async fn try_acquire_respects_capacity() {
        let budget = RateBudget::new(&limits());
        assert!(budget.try_acquire(Provider::Diarization));
        assert!(budget.try_acquire(Provider::Diarization));
        assert!(!budget.try_acquire(Provider::Diarization));
    }

    #[tokio::test]
    async fn acquire_never_exceeds_capacity_in_window() {
        let budget = RateBudget::new(&limits());
        let _t1 = budget.acquire(Provider::Combined).await;
        let _t2 = budget.acquire(Provider::Combined).await;

        // A third ticket within the same window must wait; we don't want
        // the test to actually sleep 60s, so just confirm try_acquire
        // agrees that the window is currently exhausted.
        assert!(!budget.try_acquire(Provider::Combined));
    }

    #[tokio::test]
    async fn providers_have_independent_windows() {
        let budget = RateBudget::new(&limits());
        assert!(budget.try_acquire(Provider::Diarization));
        assert!(budget.try_acquire(Provider::Diarization));
        assert!(budget.try_acquire(Provider::Transcription));
    }
}
