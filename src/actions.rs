//! Default downstream handler: forwards each payload to an HTTP action
//! endpoint as `{"action", "parameters"}`.

use std::time::Duration;

use anyhow::{bail, Context};
use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};
use tracing::debug;
use uuid::Uuid;

use crate::dispatcher::EventHandler;

pub const TRACE_ID_HEADER: &str = "X-Trace-Id";
pub const SHARED_SECRET_HEADER: &str = "X-Shared-Secret";
const ACTION_TIMEOUT: Duration = Duration::from_secs(30);

pub struct HttpActionHandler {
    http: Client,
    url: String,
    action: String,
    secret: Option<String>,
}

impl HttpActionHandler {
    pub fn new(url: impl Into<String>, action: impl Into<String>, secret: Option<String>) -> Self {
        Self {
            http: Client::builder()
                .timeout(ACTION_TIMEOUT)
                .build()
                .unwrap_or_else(|_| Client::new()),
            url: url.into(),
            action: action.into(),
            secret,
        }
    }
}

#[async_trait]
impl EventHandler for HttpActionHandler {
    async fn handle(&self, payload: &Value) -> anyhow::Result<()> {
        let trace_id = Uuid::new_v4().simple().to_string()[..16].to_string();
        let mut request = self
            .http
            .post(&self.url)
            .header(TRACE_ID_HEADER, &trace_id)
            .json(&json!({ "action": self.action, "parameters": payload }));
        if let Some(secret) = &self.secret {
            request = request.header(SHARED_SECRET_HEADER, secret);
        }

        let response = request
            .send()
            .await
            .with_context(|| format!("action {} (trace {trace_id}) request failed", self.action))?;
        let status = response.status();
        let body: Value = response.json().await.unwrap_or(Value::Null);

        if !status.is_success() {
            bail!("action {} (trace {trace_id}) returned {status}", self.action);
        }
        if body.get("success") == Some(&Value::Bool(false)) {
            let reason = body
                .get("error")
                .and_then(Value::as_str)
                .unwrap_or("no error message");
            bail!("action {} (trace {trace_id}) reported failure: {reason}", self.action);
        }
        debug!(action = %self.action, trace = %trace_id, "action completed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{http::HeaderMap, http::StatusCode, routing::post, Json, Router};
    use parking_lot::Mutex;
    use std::sync::Arc;
    use tokio::net::TcpListener;

    async fn serve(router: Router) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{addr}/action")
    }

    #[tokio::test]
    async fn forwards_action_with_trace_and_secret() {
        let seen = Arc::new(Mutex::new(None::<(HeaderMap, Value)>));
        let captured = seen.clone();
        let url = serve(Router::new().route(
            "/action",
            post(move |headers: HeaderMap, Json(body): Json<Value>| {
                let captured = captured.clone();
                async move {
                    *captured.lock() = Some((headers, body));
                    Json(json!({ "success": true }))
                }
            }),
        ))
        .await;

        let handler = HttpActionHandler::new(url, "gmail_history", Some("s3cret".to_string()));
        handler
            .handle(&json!({ "emailAddress": "a@x.com", "historyId": "100" }))
            .await
            .unwrap();

        let (headers, body) = seen.lock().clone().unwrap();
        assert_eq!(body["action"], "gmail_history");
        assert_eq!(body["parameters"]["historyId"], "100");
        assert_eq!(headers["x-shared-secret"], "s3cret");
        assert_eq!(headers["x-trace-id"].len(), 16);
    }

    #[tokio::test]
    async fn success_false_is_an_error() {
        let url = serve(Router::new().route(
            "/action",
            post(|| async { Json(json!({ "success": false, "error": "quota" })) }),
        ))
        .await;

        let err = HttpActionHandler::new(url, "calendar_change", None)
            .handle(&json!({}))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("quota"));
    }

    #[tokio::test]
    async fn non_success_status_is_an_error() {
        let url = serve(Router::new().route(
            "/action",
            post(|| async { (StatusCode::BAD_GATEWAY, "upstream down") }),
        ))
        .await;

        let err = HttpActionHandler::new(url, "calendar_change", None)
            .handle(&json!({}))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("502"));
    }
}
