//! Scenario D (spec.md §8): a mock diarization provider that returns 429
//! for the first three calls then succeeds. C2 should perform 4 attempts
//! with inter-attempt waits drawn from `[1,2)`, `[2,3)`, `[4,5)` seconds
//! (`base * 2^k + U(0, base)`), landing a total wait in `[7, 10)` s.

use std::time::Instant;
use transcript_fusion_pipeline::config::ProviderEndpoint;
use transcript_fusion_pipeline::providers::{DiarizationProvider, StageOutcome};
use transcript_fusion_pipeline::rate_budget::RateBudget;
use transcript_fusion_pipeline::retry::RetryExecutor;

fn rate_limits() -> transcript_fusion_pipeline::config::RateLimitConfig {
    transcript_fusion_pipeline::config::RateLimitConfig {
        diarization_per_minute: 20,
        transcription_per_minute: 50,
        combined_per_minute: 100,
    }
}

#[tokio::test]
async fn diarize_retries_through_quota_backoff_then_succeeds() {
    let mut server = mockito::Server::new_async().await;

    let rate_limited = server
        .mock("POST", "/diarize")
        .with_status(429)
        .with_body("rate limited")
        .expect(3)
        .create_async()
        .await;
    let accepted = server
        .mock("POST", "/diarize")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(r#"{"jobId":"job-1"}"#)
        .expect(1)
        .create_async()
        .await;
    let job_done = server
        .mock("GET", "/jobs/job-1")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(r#"{"status":"succeeded","output":[{"start":0.0,"end":1.0,"speaker":"S0"}]}"#)
        .create_async()
        .await;

    let endpoint = ProviderEndpoint { base_url: server.url(), api_key: "test-key".into() };
    let provider = DiarizationProvider::new(endpoint);
    let rate_budget = RateBudget::new(&rate_limits());
    let retry = RetryExecutor::new();

    let started = Instant::now();
    let outcome = provider.diarize(&"media-ref".to_string(), None, &rate_budget, &retry).await.unwrap();
    let elapsed = started.elapsed();

    let segments = match outcome {
        StageOutcome::Ready(segments) => segments,
        StageOutcome::Pending(_) => panic!("expected a synchronous result, not a pending job"),
    };
    assert_eq!(segments.len(), 1);
    assert_eq!(segments[0].speaker, "S0");

    // 4 submit attempts total (3 retried 429s + 1 success).
    let stats = retry.stats_for(transcript_fusion_pipeline::types::Provider::Diarization);
    assert_eq!(*stats.attempts_by_class.get("rate_limited").unwrap_or(&0), 3);

    // base*2^0 + U(0,1) in [1,2), base*2^1 + U(0,1) in [2,3), base*2^2 + U(0,1) in [4,5):
    // total wait in [7, 10)s. Allow slack for scheduling jitter on a loaded CI box.
    assert!(elapsed.as_secs_f64() >= 7.0, "elapsed {:?} under the expected 7s floor", elapsed);
    assert!(elapsed.as_secs_f64() < 12.0, "elapsed {:?} blew past the expected backoff window", elapsed);

    rate_limited.assert_async().await;
    accepted.assert_async().await;
    job_done.assert_async().await;
}
