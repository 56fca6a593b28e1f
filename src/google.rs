//! reqwest clients for the Gmail and Google Calendar push APIs.
//!
//! Only the calls the ingestion core needs are implemented: watch, stop and
//! an incremental change listing driven by history ids / sync tokens.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, RequestBuilder, Response, StatusCode, Url};
use serde_json::{json, Value};
use tracing::{debug, instrument};

use crate::error::ProviderError;
use crate::provider::{ChangeBatch, ChannelSpec, RawChange, SubscriptionProvider, WatchResponse};
use crate::types::WatchResource;

const GMAIL_BASE: &str = "https://gmail.googleapis.com/gmail/v1";
const CALENDAR_BASE: &str = "https://www.googleapis.com/calendar/v3";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);
const MAX_PAGES: usize = 50;
const MAX_ERROR_BODY: usize = 512;

/// Supplies bearer tokens. Refresh is the implementor's concern.
#[async_trait]
pub trait TokenSource: Send + Sync {
    async fn access_token(&self) -> Result<String, ProviderError>;
}

/// A fixed token from configuration.
pub struct StaticTokenSource {
    token: Option<String>,
}

impl StaticTokenSource {
    pub fn new(token: Option<String>) -> Self {
        Self { token }
    }
}

#[async_trait]
impl TokenSource for StaticTokenSource {
    async fn access_token(&self) -> Result<String, ProviderError> {
        self.token
            .clone()
            .ok_or_else(|| ProviderError::Credentials("no access token configured".to_string()))
    }
}

#[derive(Clone)]
struct ApiClient {
    http: Client,
    tokens: Arc<dyn TokenSource>,
    base: Url,
}

impl ApiClient {
    fn new(base: &str, tokens: Arc<dyn TokenSource>) -> Result<Self, ProviderError> {
        let base = Url::parse(base)
            .map_err(|e| ProviderError::Malformed(format!("invalid base url {base}: {e}")))?;
        let http = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .unwrap_or_else(|_| Client::new());
        Ok(Self { http, tokens, base })
    }

    /// `base` plus `segments`, each percent-encoded as a single path segment.
    fn url(&self, segments: &[&str]) -> Result<Url, ProviderError> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|_| ProviderError::Malformed(format!("base url {} has no path", self.base)))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    async fn send(&self, request: RequestBuilder) -> Result<Response, ProviderError> {
        let token = self.tokens.access_token().await?;
        let response = request.bearer_auth(token).send().await?;
        let status = response.status();
        if status == StatusCode::GONE {
            return Err(ProviderError::CheckpointExpired);
        }
        if !status.is_success() {
            let mut body = response.text().await.unwrap_or_default();
            if body.len() > MAX_ERROR_BODY {
                let mut cut = MAX_ERROR_BODY;
                while !body.is_char_boundary(cut) {
                    cut -= 1;
                }
                body.truncate(cut);
            }
            return Err(ProviderError::Status {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response)
    }

    async fn send_json(&self, request: RequestBuilder) -> Result<Value, ProviderError> {
        Ok(self.send(request).await?.json().await?)
    }
}

/// Google encodes int64 fields as JSON strings; accept either form.
fn int_field(value: &Value, key: &str) -> Option<i64> {
    match value.get(key)? {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

fn str_field(value: &Value, key: &str) -> Option<String> {
    match value.get(key)? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn millis_to_datetime(ms: i64) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms)
}

/// Gmail `users.watch` / `users.stop` / `users.history.list`.
///
/// Gmail has no per-channel resource id; the mailbox address is used, so
/// `stop` knows which mailbox to stop.
pub struct GmailProvider {
    api: ApiClient,
    topic: Option<String>,
}

impl GmailProvider {
    pub fn new(topic: Option<String>, tokens: Arc<dyn TokenSource>) -> Result<Self, ProviderError> {
        Self::with_base_url(GMAIL_BASE, topic, tokens)
    }

    pub fn with_base_url(
        base: &str,
        topic: Option<String>,
        tokens: Arc<dyn TokenSource>,
    ) -> Result<Self, ProviderError> {
        Ok(Self {
            api: ApiClient::new(base, tokens)?,
            topic,
        })
    }

    async fn current_history_id(&self, mailbox: &str) -> Result<String, ProviderError> {
        let url = self.api.url(&["users", mailbox, "profile"])?;
        let profile = self.api.send_json(self.api.http.get(url)).await?;
        str_field(&profile, "historyId")
            .ok_or_else(|| ProviderError::Malformed("profile without historyId".to_string()))
    }
}

#[async_trait]
impl SubscriptionProvider for GmailProvider {
    #[instrument(skip(self, resource, spec), fields(resource = %resource))]
    async fn watch(
        &self,
        resource: &WatchResource,
        spec: &ChannelSpec,
    ) -> Result<WatchResponse, ProviderError> {
        let topic = self
            .topic
            .as_deref()
            .ok_or_else(|| ProviderError::NotConfigured("gmail pub/sub topic".to_string()))?;
        let url = self.api.url(&["users", &resource.name, "watch"])?;
        let body = json!({ "topicName": topic, "labelFilterBehavior": "include", "labelIds": ["INBOX"] });
        let response = self.api.send_json(self.api.http.post(url).json(&body)).await?;

        debug!(channel = %crate::telemetry::redact(&spec.id), "gmail watch registered");
        Ok(WatchResponse {
            resource_id: resource.name.clone(),
            resource_uri: None,
            expiration: int_field(&response, "expiration").and_then(millis_to_datetime),
        })
    }

    async fn stop(&self, _channel_id: &str, resource_id: &str) -> Result<(), ProviderError> {
        let url = self.api.url(&["users", resource_id, "stop"])?;
        self.api.send(self.api.http.post(url).json(&json!({}))).await?;
        Ok(())
    }

    fn stop_is_channel_scoped(&self) -> bool {
        false
    }

    #[instrument(skip(self, resource), fields(resource = %resource))]
    async fn list_changes(
        &self,
        resource: &WatchResource,
        since: Option<&str>,
    ) -> Result<ChangeBatch, ProviderError> {
        let mailbox = resource.name.as_str();
        let Some(start) = since else {
            let baseline = self.current_history_id(mailbox).await?;
            return Ok(ChangeBatch {
                changes: Vec::new(),
                checkpoint: Some(baseline),
            });
        };

        let url = self.api.url(&["users", mailbox, "history"])?;
        let mut latest = start.to_string();
        let mut saw_history = false;
        let mut page_token: Option<String> = None;

        for _ in 0..MAX_PAGES {
            let mut query = vec![("startHistoryId", start.to_string())];
            if let Some(token) = &page_token {
                query.push(("pageToken", token.clone()));
            }
            let page = match self
                .api
                .send_json(self.api.http.get(url.clone()).query(&query))
                .await
            {
                // Gmail answers 404 when startHistoryId is too old.
                Err(ProviderError::Status { status: 404, .. }) => {
                    return Err(ProviderError::CheckpointExpired)
                }
                other => other?,
            };

            saw_history |= page
                .get("history")
                .and_then(Value::as_array)
                .is_some_and(|h| !h.is_empty());
            if let Some(id) = str_field(&page, "historyId") {
                latest = id;
            }
            page_token = str_field(&page, "nextPageToken");
            if page_token.is_none() {
                break;
            }
        }

        let changes = if saw_history {
            vec![RawChange {
                id: latest.clone(),
                data: json!({ "emailAddress": mailbox, "historyId": latest }),
            }]
        } else {
            Vec::new()
        };
        Ok(ChangeBatch {
            changes,
            checkpoint: Some(latest),
        })
    }
}

/// Calendar `events.watch` / `channels.stop` / `events.list` with sync tokens.
pub struct CalendarProvider {
    api: ApiClient,
}

impl CalendarProvider {
    pub fn new(tokens: Arc<dyn TokenSource>) -> Result<Self, ProviderError> {
        Self::with_base_url(CALENDAR_BASE, tokens)
    }

    pub fn with_base_url(base: &str, tokens: Arc<dyn TokenSource>) -> Result<Self, ProviderError> {
        Ok(Self {
            api: ApiClient::new(base, tokens)?,
        })
    }
}

#[async_trait]
impl SubscriptionProvider for CalendarProvider {
    #[instrument(skip(self, resource, spec), fields(resource = %resource))]
    async fn watch(
        &self,
        resource: &WatchResource,
        spec: &ChannelSpec,
    ) -> Result<WatchResponse, ProviderError> {
        let url = self.api.url(&["calendars", &resource.name, "events", "watch"])?;
        let body = json!({
            "id": spec.id,
            "type": "web_hook",
            "address": spec.address,
            "token": spec.token,
            "expiration": spec.expiration.timestamp_millis(),
        });
        let response = self.api.send_json(self.api.http.post(url).json(&body)).await?;

        let resource_id = str_field(&response, "resourceId")
            .ok_or_else(|| ProviderError::Malformed("watch response without resourceId".to_string()))?;
        Ok(WatchResponse {
            resource_id,
            resource_uri: str_field(&response, "resourceUri"),
            expiration: int_field(&response, "expiration").and_then(millis_to_datetime),
        })
    }

    async fn stop(&self, channel_id: &str, resource_id: &str) -> Result<(), ProviderError> {
        let url = self.api.url(&["channels", "stop"])?;
        let body = json!({ "id": channel_id, "resourceId": resource_id });
        self.api.send(self.api.http.post(url).json(&body)).await?;
        Ok(())
    }

    #[instrument(skip(self, resource, since), fields(resource = %resource))]
    async fn list_changes(
        &self,
        resource: &WatchResource,
        since: Option<&str>,
    ) -> Result<ChangeBatch, ProviderError> {
        let calendar_id = resource.name.as_str();
        let url = self.api.url(&["calendars", calendar_id, "events"])?;
        let mut changes = Vec::new();
        let mut page_token: Option<String> = None;

        for _ in 0..MAX_PAGES {
            let mut query = vec![("showDeleted", "true".to_string())];
            if let Some(token) = since {
                query.push(("syncToken", token.to_string()));
            }
            if let Some(token) = &page_token {
                query.push(("pageToken", token.clone()));
            }
            let page = self
                .api
                .send_json(self.api.http.get(url.clone()).query(&query))
                .await?;

            // Without a sync token this is the baseline listing; its items are
            // existing state, not changes.
            if since.is_some() {
                let items = page.get("items").and_then(Value::as_array);
                for item in items.into_iter().flatten() {
                    let (Some(event_id), Some(updated)) =
                        (str_field(item, "id"), str_field(item, "updated"))
                    else {
                        continue;
                    };
                    changes.push(RawChange {
                        id: format!("{event_id}:{updated}"),
                        data: json!({
                            "calendarId": calendar_id,
                            "eventId": event_id,
                            "updated": updated,
                            "status": item.get("status").cloned().unwrap_or(Value::Null),
                        }),
                    });
                }
            }

            if let Some(sync_token) = str_field(&page, "nextSyncToken") {
                return Ok(ChangeBatch {
                    changes,
                    checkpoint: Some(sync_token),
                });
            }
            page_token = str_field(&page, "nextPageToken");
            if page_token.is_none() {
                break;
            }
        }

        Ok(ChangeBatch {
            changes,
            checkpoint: since.map(str::to_string),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{
        extract::Query,
        http::StatusCode as AxumStatus,
        routing::{get, post},
        Json, Router,
    };
    use chrono::Duration as ChronoDuration;
    use parking_lot::Mutex;
    use std::collections::HashMap;
    use tokio::net::TcpListener;

    async fn fake_api(router: Router) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{addr}")
    }

    fn tokens() -> Arc<dyn TokenSource> {
        Arc::new(StaticTokenSource::new(Some("test-token".to_string())))
    }

    fn spec(expiration: DateTime<Utc>) -> ChannelSpec {
        ChannelSpec {
            id: "chan-1".to_string(),
            token: "tok-1".to_string(),
            address: "https://hooks.example.com/webhooks/calendar".to_string(),
            expiration,
        }
    }

    #[tokio::test]
    async fn calendar_watch_sends_channel_and_parses_response() {
        let seen = Arc::new(Mutex::new(None::<Value>));
        let captured = seen.clone();
        let router = Router::new().route(
            "/calendars/{id}/events/watch",
            post(move |Json(body): Json<Value>| {
                let captured = captured.clone();
                async move {
                    *captured.lock() = Some(body);
                    Json(json!({
                        "id": "chan-1",
                        "resourceId": "res-42",
                        "resourceUri": "https://www.googleapis.com/calendar/v3/calendars/primary/events",
                        "expiration": "1736294400000",
                    }))
                }
            }),
        );
        let base = fake_api(router).await;
        let provider = CalendarProvider::with_base_url(&base, tokens()).unwrap();

        let expiration = Utc::now() + ChronoDuration::days(7);
        let response = provider
            .watch(&WatchResource::calendar("primary"), &spec(expiration))
            .await
            .unwrap();

        assert_eq!(response.resource_id, "res-42");
        assert_eq!(response.expiration.map(|e| e.timestamp_millis()), Some(1_736_294_400_000));
        let body = seen.lock().clone().unwrap();
        assert_eq!(body["type"], "web_hook");
        assert_eq!(body["token"], "tok-1");
        assert_eq!(body["expiration"], expiration.timestamp_millis());
    }

    #[tokio::test]
    async fn calendar_gone_sync_token_is_checkpoint_expired() {
        let router = Router::new().route(
            "/calendars/{id}/events",
            get(|| async { (AxumStatus::GONE, "sync token invalid") }),
        );
        let base = fake_api(router).await;
        let provider = CalendarProvider::with_base_url(&base, tokens()).unwrap();

        let err = provider
            .list_changes(&WatchResource::calendar("primary"), Some("stale"))
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::CheckpointExpired));
    }

    #[tokio::test]
    async fn calendar_incremental_listing_emits_changes() {
        let router = Router::new().route(
            "/calendars/{id}/events",
            get(|Query(q): Query<HashMap<String, String>>| async move {
                assert_eq!(q.get("syncToken").map(String::as_str), Some("sync-1"));
                Json(json!({
                    "items": [
                        {"id": "evt-1", "updated": "2025-01-01T00:00:00Z", "status": "confirmed"},
                        {"id": "evt-2", "updated": "2025-01-01T00:01:00Z", "status": "cancelled"},
                    ],
                    "nextSyncToken": "sync-2",
                }))
            }),
        );
        let base = fake_api(router).await;
        let provider = CalendarProvider::with_base_url(&base, tokens()).unwrap();

        let batch = provider
            .list_changes(&WatchResource::calendar("primary"), Some("sync-1"))
            .await
            .unwrap();
        assert_eq!(batch.checkpoint.as_deref(), Some("sync-2"));
        assert_eq!(batch.changes.len(), 2);
        assert_eq!(batch.changes[0].id, "evt-1:2025-01-01T00:00:00Z");
        assert_eq!(batch.changes[1].data["status"], "cancelled");
    }

    #[tokio::test]
    async fn gmail_baseline_then_history() {
        let router = Router::new()
            .route(
                "/users/{mailbox}/profile",
                get(|| async { Json(json!({ "emailAddress": "a@x.com", "historyId": "100" })) }),
            )
            .route(
                "/users/{mailbox}/history",
                get(|| async {
                    Json(json!({
                        "history": [{ "id": "101" }, { "id": "105" }],
                        "historyId": "105",
                    }))
                }),
            );
        let base = fake_api(router).await;
        let provider = GmailProvider::with_base_url(&base, Some("topic".to_string()), tokens()).unwrap();
        let mailbox = WatchResource::gmail("a@x.com");

        let baseline = provider.list_changes(&mailbox, None).await.unwrap();
        assert!(baseline.changes.is_empty());
        assert_eq!(baseline.checkpoint.as_deref(), Some("100"));

        let batch = provider.list_changes(&mailbox, Some("100")).await.unwrap();
        assert_eq!(batch.checkpoint.as_deref(), Some("105"));
        assert_eq!(batch.changes.len(), 1);
        assert_eq!(batch.changes[0].data["historyId"], "105");
        assert_eq!(batch.changes[0].data["emailAddress"], "a@x.com");
    }

    #[tokio::test]
    async fn gmail_watch_requires_topic() {
        let provider = GmailProvider::new(None, tokens()).unwrap();
        let err = provider
            .watch(&WatchResource::gmail("a@x.com"), &spec(Utc::now()))
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::NotConfigured(_)));
    }

    #[tokio::test]
    async fn missing_access_token_fails_before_any_request() {
        let provider = CalendarProvider::with_base_url(
            "http://127.0.0.1:9",
            Arc::new(StaticTokenSource::new(None)),
        )
        .unwrap();
        let err = provider.stop("chan-1", "res-1").await.unwrap_err();
        assert!(matches!(err, ProviderError::Credentials(_)));
    }

    #[test]
    fn int64_fields_accept_strings() {
        let v = json!({ "a": "12", "b": 7, "c": true });
        assert_eq!(int_field(&v, "a"), Some(12));
        assert_eq!(int_field(&v, "b"), Some(7));
        assert_eq!(int_field(&v, "c"), None);
    }

    #[test]
    fn only_calendar_stops_are_channel_scoped() {
        let gmail = GmailProvider::new(Some("topic".to_string()), tokens()).unwrap();
        let calendar = CalendarProvider::new(tokens()).unwrap();
        assert!(!gmail.stop_is_channel_scoped());
        assert!(calendar.stop_is_channel_scoped());
    }
}
