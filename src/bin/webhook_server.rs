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

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::json;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use transcript_fusion_pipeline::checkpoint_store::CheckpointStore;
use transcript_fusion_pipeline::config::Config;
use transcript_fusion_pipeline::webhook::{self, VerificationError, WebhookDispatcher};

struct AppState {
    secret: String,
    data_root: PathBuf,
    dispatcher: WebhookDispatcher,
    checkpoints: CheckpointStore,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = Config::load()?;
    let state = Arc::new(AppState {
        secret: config.webhook_secret,
        checkpoints: CheckpointStore::new(config.data_root.clone()),
        data_root: config.data_root,
        dispatcher: WebhookDispatcher::new(),
    });

    let app = Router::new()
        .route("/webhook", post(handle_webhook))
        .route("/health", get(handle_health))
        .route("/metrics", get(handle_metrics))
        .with_state(state);

    let addr: SocketAddr = std::env::var("WEBHOOK_BIND")
        .unwrap_or_else(|_| "0.0.0.0:8000".to_string())
        .parse()?;

    tracing::info!("webhook endpoint listening on {addr}");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

async fn handle_webhook(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: axum::body::Bytes,
) -> (StatusCode, Json<serde_json::Value>) {
    let signature = match headers.get("X-Signature").and_then(|v| v.to_str().ok()) {
        Some(value) => value.to_string(),
        None => return (StatusCode::BAD_REQUEST, Json(json!({"error": "missing X-Signature header"}))),
    };
    let timestamp = match headers.get("X-Request-Timestamp").and_then(|v| v.to_str().ok()) {
        Some(value) => value.to_string(),
        None => {
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({"error": "missing X-Request-Timestamp header"})),
            )
        }
    };
    let retry_num = headers.get("X-Retry-Num").and_then(|v| v.to_str().ok());
    let retry_reason = headers.get("X-Retry-Reason").and_then(|v| v.to_str().ok());

    match state.dispatcher.handle(&state.secret, &timestamp, &body, &signature) {
        Ok(event) => {
            tracing::info!(
                "webhook delivered job {} status {:?} (retry_num={:?}, retry_reason={:?})",
                event.job_id,
                event.status,
                retry_num,
                retry_reason
            );
            // §4.8: accept and record status=failed/canceled too; the
            // payload is still valid and must be persisted either way.
            if let Err(e) = webhook::persist_and_resolve(&state.checkpoints, &state.data_root, &timestamp, &event) {
                tracing::error!("failed to persist/resolve webhook for job {}: {e}", event.job_id);
            }
            (StatusCode::OK, Json(json!({"status": "accepted", "job_id": event.job_id})))
        }
        Err(VerificationError::BadSignature) => {
            (StatusCode::FORBIDDEN, Json(json!({"error": "signature verification failed"})))
        }
        Err(VerificationError::MalformedPayload(message)) => {
            (StatusCode::BAD_REQUEST, Json(json!({"error": message})))
        }
    }
}

async fn handle_health() -> Json<serde_json::Value> {
    Json(json!({"status": "ok"}))
}

async fn handle_metrics(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let metrics = state.dispatcher.metrics();
    Json(json!({
        "processed_webhooks": metrics.processed.load(Ordering::Relaxed),
        "failed_verifications": metrics.failed_verifications.load(Ordering::Relaxed),
        "successful_events": metrics.successful_events.load(Ordering::Relaxed),
        "verification_success_rate": metrics.verification_success_rate(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use hmac::{Hmac, Mac};
    use sha2::Sha256;
    use tower::ServiceExt;

    fn app(secret: &str) -> (Router, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let data_root = dir.path().to_path_buf();
        let state = Arc::new(AppState {
            secret: secret.to_string(),
            checkpoints: CheckpointStore::new(data_root.clone()),
            data_root,
            dispatcher: WebhookDispatcher::new(),
        });
        let router = Router::new()
            .route("/webhook", post(handle_webhook))
            .route("/health", get(handle_health))
            .route("/metrics", get(handle_metrics))
            .with_state(state);
        (router, dir)
    }

    fn sign(secret: &str, timestamp: &str, body: &[u8]) -> String {
        let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(b"v0:");
        mac.update(timestamp.as_bytes());
        mac.update(b":");
        mac.update(body);
        hex::encode(mac.finalize().into_bytes())
    }

    #[tokio::test]
    async fn rejects_request_with_wrong_signature() {
        let body = br#"{"job_id":"j1","status":"succeeded"}"#;
        let request = Request::builder()
            .method("POST")
            .uri("/webhook")
            .header("X-Signature", "0000")
            .header("X-Request-Timestamp", "1700000000")
            .header("content-type", "application/json")
            .body(Body::from(body.to_vec()))
            .unwrap();

        let (router, _dir) = app("shh");
        let response = router.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn accepts_correctly_signed_request() {
        let body = br#"{"job_id":"j1","status":"succeeded"}"#;
        let signature = sign("shh", "1700000000", body);
        let request = Request::builder()
            .method("POST")
            .uri("/webhook")
            .header("X-Signature", signature)
            .header("X-Request-Timestamp", "1700000000")
            .header("content-type", "application/json")
            .body(Body::from(body.to_vec()))
            .unwrap();

        let (router, _dir) = app("shh");
        let response = router.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn health_endpoint_reports_ok() {
        let request = Request::builder().uri("/health").body(Body::empty()).unwrap();
        let (router, _dir) = app("shh");
        let response = router.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
