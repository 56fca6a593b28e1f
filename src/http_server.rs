use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::channels::{ChannelLifecycleManager, ChannelStatus};
use crate::health::{HealthMonitor, HealthSnapshot};
use crate::ingest::{IngestOutcome, Ingestor};
use crate::queue::{LeaseQueue, QueueStats};

#[derive(Clone)]
pub struct AppState {
    pub ingestor: Arc<Ingestor>,
    pub health: Arc<HealthMonitor>,
    pub queue: LeaseQueue,
    pub channels: ChannelLifecycleManager,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    #[serde(flatten)]
    pub health: HealthSnapshot,
    pub queue: QueueStats,
    pub channels: Vec<ChannelStatus>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/webhooks/gmail", post(handle_gmail))
        .route("/webhooks/calendar", post(handle_calendar))
        .route("/healthz", get(healthz))
        .with_state(state)
}

/// Serve until `shutdown` is cancelled.
pub async fn serve(
    listener: TcpListener,
    state: AppState,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    if let Ok(addr) = listener.local_addr() {
        info!(%addr, "HTTP server listening");
    }
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
}

/// Providers retry anything but a fast 2xx, so only authentication failures
/// are surfaced. The body is always empty.
fn status_for(outcome: &IngestOutcome) -> StatusCode {
    match outcome {
        IngestOutcome::Rejected(_) => StatusCode::UNAUTHORIZED,
        _ => StatusCode::OK,
    }
}

async fn handle_gmail(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> StatusCode {
    let outcome = state.ingestor.handle_gmail_push(&headers, &body).await;
    status_for(&outcome)
}

async fn handle_calendar(State(state): State<AppState>, headers: HeaderMap) -> StatusCode {
    let outcome = state.ingestor.handle_calendar_push(&headers).await;
    status_for(&outcome)
}

async fn healthz(State(state): State<AppState>) -> Result<Json<HealthReport>, StatusCode> {
    let queue = state.queue.stats().await.map_err(|e| {
        warn!(error = %e, "queue stats unavailable");
        StatusCode::SERVICE_UNAVAILABLE
    })?;
    Ok(Json(HealthReport {
        health: state.health.snapshot(),
        queue,
        channels: state.channels.statuses().await,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channels::ChannelSettings;
    use crate::clock::{Clock, ManualClock};
    use crate::config::IngestConfig;
    use crate::idempotency::{IdempotencyGuard, DEFAULT_RETENTION};
    use crate::provider::ProviderSet;
    use crate::schedule::ManualScheduler;
    use crate::store::{ChannelStore, JsonChannelStore, JsonQueueStore};
    use crate::verification::{
        compute_signature, WebhookValidator, CHANNEL_ID_HEADER, CHANNEL_TOKEN_HEADER,
        SIGNATURE_HEADER,
    };
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use serde_json::Value;
    use std::time::Duration;
    use tower::ServiceExt;

    const SECRET: &str = "route-secret";

    fn state() -> AppState {
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::at_epoch());
        let registry: Arc<dyn ChannelStore> = Arc::new(JsonChannelStore::in_memory());
        let queue = LeaseQueue::new(Arc::new(JsonQueueStore::in_memory()), clock.clone());
        let health = Arc::new(HealthMonitor::new(Duration::from_secs(600), clock.clone()));
        let ingestor = Arc::new(Ingestor::new(
            WebhookValidator::new(Some(SECRET), Duration::from_secs(300), clock.clone()),
            Arc::new(IdempotencyGuard::new(100, DEFAULT_RETENTION, clock.clone())),
            queue.clone(),
            health.clone(),
            registry.clone(),
            clock.clone(),
        ));
        let channels = ChannelLifecycleManager::new(
            ProviderSet::new(),
            registry,
            Arc::new(ManualScheduler::new()),
            clock,
            ChannelSettings::from_config(&IngestConfig::default()),
        );
        AppState {
            ingestor,
            health,
            queue,
            channels,
        }
    }

    fn gmail_body() -> Vec<u8> {
        let data = STANDARD.encode(r#"{"emailAddress":"a@x.com","historyId":"100"}"#);
        format!(r#"{{"messageId":"m-1","data":"{data}"}}"#).into_bytes()
    }

    fn gmail_request(body: Vec<u8>, signature: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/webhooks/gmail")
            .header("content-type", "application/json")
            .header(SIGNATURE_HEADER, signature)
            .body(Body::from(body))
            .unwrap()
    }

    #[tokio::test]
    async fn signed_gmail_push_is_accepted_with_empty_body() {
        let state = state();
        let body = gmail_body();
        let sig = compute_signature(SECRET.as_bytes(), &body).unwrap();

        let response = router(state.clone())
            .oneshot(gmail_request(body, &sig))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert!(bytes.is_empty());
        assert_eq!(state.queue.stats().await.unwrap().pending, 1);
    }

    #[tokio::test]
    async fn forged_gmail_push_is_unauthorized() {
        let state = state();
        let response = router(state.clone())
            .oneshot(gmail_request(gmail_body(), "deadbeef"))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert!(bytes.is_empty());
        assert_eq!(state.queue.stats().await.unwrap().pending, 0);
    }

    #[tokio::test]
    async fn authenticated_garbage_still_gets_200() {
        let body = b"not json".to_vec();
        let sig = compute_signature(SECRET.as_bytes(), &body).unwrap();
        let response = router(state()).oneshot(gmail_request(body, &sig)).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn calendar_push_for_unknown_channel_is_unauthorized() {
        let request = Request::builder()
            .method("POST")
            .uri("/webhooks/calendar")
            .header(CHANNEL_ID_HEADER, "nope")
            .header(CHANNEL_TOKEN_HEADER, "nope")
            .header("x-goog-resource-state", "exists")
            .header("x-goog-message-number", "1")
            .body(Body::empty())
            .unwrap();
        let response = router(state()).oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn healthz_reports_fallback_queue_and_channels() {
        let request = Request::builder()
            .uri("/healthz")
            .body(Body::empty())
            .unwrap();
        let response = router(state()).oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let json: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(json["pollingFallbackActive"], false);
        assert!(json["lastSuccessfulCallback"].is_string());
        assert_eq!(json["queue"]["pending"], 0);
        assert!(json["channels"].as_array().unwrap().is_empty());
    }
}
