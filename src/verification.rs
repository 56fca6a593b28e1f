use std::sync::Arc;
use std::time::Duration;

use axum::http::HeaderMap;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;
use subtle::ConstantTimeEq;
use tracing::{debug, warn};

use crate::clock::Clock;
use crate::error::AuthError;
use crate::store::ChannelStore;
use crate::telemetry::redact;
use crate::types::WatchChannel;

type HmacSha256 = Hmac<Sha256>;

pub const SIGNATURE_HEADER: &str = "x-webhook-signature";
pub const TIMESTAMP_HEADER: &str = "x-webhook-timestamp";
pub const CHANNEL_ID_HEADER: &str = "x-goog-channel-id";
pub const CHANNEL_TOKEN_HEADER: &str = "x-goog-channel-token";
pub const RESOURCE_STATE_HEADER: &str = "x-goog-resource-state";
pub const MESSAGE_NUMBER_HEADER: &str = "x-goog-message-number";
pub const RESOURCE_ID_HEADER: &str = "x-goog-resource-id";

/// Result of authenticating one inbound notification.
#[derive(Debug, Clone)]
pub struct Validation {
    pub valid: bool,
    /// The channel the notification was delivered on (channel-token mode only).
    pub channel: Option<WatchChannel>,
    pub rejection: Option<AuthError>,
}

impl Validation {
    fn accept(channel: Option<WatchChannel>) -> Self {
        Self {
            valid: true,
            channel,
            rejection: None,
        }
    }

    fn reject(reason: AuthError) -> Self {
        Self {
            valid: false,
            channel: None,
            rejection: Some(reason),
        }
    }
}

fn keyed_mac(secret: &[u8]) -> Result<HmacSha256, AuthError> {
    HmacSha256::new_from_slice(secret).map_err(|_| AuthError::SecretNotConfigured)
}

/// Hex HMAC-SHA256 of `body` under `secret`.
pub fn compute_signature(secret: &[u8], body: &[u8]) -> Result<String, AuthError> {
    let mut mac = keyed_mac(secret)?;
    mac.update(body);
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Token embedded in a channel when a token secret is configured.
pub fn derive_channel_token(secret: &[u8], channel_id: &str) -> Result<String, AuthError> {
    compute_signature(secret, channel_id.as_bytes())
}

/// Checks signatures, channel tokens and the replay window. Holds no
/// mutable state; the channel registry is passed in per call.
#[derive(Clone)]
pub struct WebhookValidator {
    webhook_secret: Option<Vec<u8>>,
    tolerance: Duration,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for WebhookValidator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebhookValidator")
            .field("webhook_secret", &self.webhook_secret.as_ref().map(|_| "[REDACTED]"))
            .field("tolerance", &self.tolerance)
            .finish()
    }
}

impl WebhookValidator {
    pub fn new(webhook_secret: Option<&str>, tolerance: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            webhook_secret: webhook_secret.map(|s| s.as_bytes().to_vec()),
            tolerance,
            clock,
        }
    }

    /// Channel-token mode when a channel id header is present, signed mode
    /// otherwise.
    pub async fn validate(
        &self,
        headers: &HeaderMap,
        raw_body: &[u8],
        registry: &dyn ChannelStore,
    ) -> Validation {
        if headers.contains_key(CHANNEL_ID_HEADER) {
            self.validate_channel(headers, registry).await
        } else {
            self.validate_signed(headers, raw_body)
        }
    }

    /// HMAC over the raw body, then the replay window.
    pub fn validate_signed(&self, headers: &HeaderMap, raw_body: &[u8]) -> Validation {
        let Some(secret) = &self.webhook_secret else {
            warn!("signed notification received but no webhook secret is configured");
            return Validation::reject(AuthError::SecretNotConfigured);
        };
        let Some(header) = header_str(headers, SIGNATURE_HEADER) else {
            return Validation::reject(AuthError::MissingHeader(SIGNATURE_HEADER));
        };

        let sig_hex = header.strip_prefix("sha256=").unwrap_or(header);
        let Ok(expected) = hex::decode(sig_hex) else {
            return Validation::reject(AuthError::InvalidSignature);
        };
        let mut mac = match keyed_mac(secret) {
            Ok(mac) => mac,
            Err(e) => return Validation::reject(e),
        };
        mac.update(raw_body);
        // verify_slice compares in constant time
        if mac.verify_slice(&expected).is_err() {
            debug!("signature mismatch on signed notification");
            return Validation::reject(AuthError::InvalidSignature);
        }

        let asserted = match signed_timestamp(headers, raw_body) {
            Ok(ts) => ts,
            Err(e) => return Validation::reject(e),
        };
        if let Err(e) = self.check_window(asserted) {
            return Validation::reject(e);
        }
        Validation::accept(None)
    }

    /// Channel lookup + token equality, then the replay window.
    pub async fn validate_channel(
        &self,
        headers: &HeaderMap,
        registry: &dyn ChannelStore,
    ) -> Validation {
        let Some(channel_id) = header_str(headers, CHANNEL_ID_HEADER) else {
            return Validation::reject(AuthError::MissingHeader(CHANNEL_ID_HEADER));
        };
        let Some(token) = header_str(headers, CHANNEL_TOKEN_HEADER) else {
            return Validation::reject(AuthError::MissingHeader(CHANNEL_TOKEN_HEADER));
        };

        let channel = match registry.get(channel_id).await {
            Ok(Some(c)) => c,
            Ok(None) => {
                debug!(channel = %redact(channel_id), "notification for unknown channel");
                return Validation::reject(AuthError::UnknownChannel);
            }
            Err(e) => {
                warn!(channel = %redact(channel_id), error = %e, "channel lookup failed, rejecting");
                return Validation::reject(AuthError::UnknownChannel);
            }
        };
        if !channel.is_active(self.clock.now()) {
            debug!(channel = %redact(channel_id), "notification for expired channel");
            return Validation::reject(AuthError::UnknownChannel);
        }
        if !constant_time_eq(channel.token.as_bytes(), token.as_bytes()) {
            warn!(channel = %redact(channel_id), "channel token mismatch");
            return Validation::reject(AuthError::TokenMismatch);
        }

        let asserted = match header_timestamp(headers) {
            Ok(ts) => ts,
            Err(e) => return Validation::reject(e),
        };
        if let Err(e) = self.check_window(asserted) {
            return Validation::reject(e);
        }
        Validation::accept(Some(channel))
    }

    fn check_window(&self, asserted: Option<DateTime<Utc>>) -> Result<(), AuthError> {
        let Some(asserted) = asserted else {
            return Ok(());
        };
        let skew = (self.clock.now() - asserted).num_seconds();
        let tolerance = i64::try_from(self.tolerance.as_secs()).unwrap_or(i64::MAX);
        if skew.abs() > tolerance {
            return Err(AuthError::StaleTimestamp {
                skew_secs: skew,
                tolerance: self.tolerance,
            });
        }
        Ok(())
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

/// `x-webhook-timestamp` (unix seconds), else the HTTP `date` header.
fn header_timestamp(headers: &HeaderMap) -> Result<Option<DateTime<Utc>>, AuthError> {
    if let Some(raw) = header_str(headers, TIMESTAMP_HEADER) {
        let secs: i64 = raw
            .parse()
            .map_err(|_| AuthError::BadTimestamp(raw.to_string()))?;
        return DateTime::from_timestamp(secs, 0)
            .map(Some)
            .ok_or_else(|| AuthError::BadTimestamp(raw.to_string()));
    }
    if let Some(raw) = header_str(headers, "date") {
        return DateTime::parse_from_rfc2822(raw)
            .map(|d| Some(d.with_timezone(&Utc)))
            .map_err(|_| AuthError::BadTimestamp(raw.to_string()));
    }
    Ok(None)
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PublishTimes {
    publish_time: Option<String>,
    message: Option<InnerPublishTime>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct InnerPublishTime {
    publish_time: Option<String>,
}

/// `publishTime` from the push body (flat or enveloped), else the headers.
fn signed_timestamp(
    headers: &HeaderMap,
    raw_body: &[u8],
) -> Result<Option<DateTime<Utc>>, AuthError> {
    let published = serde_json::from_slice::<PublishTimes>(raw_body)
        .ok()
        .and_then(|p| p.message.and_then(|m| m.publish_time).or(p.publish_time));
    match published {
        Some(raw) => DateTime::parse_from_rfc3339(&raw)
            .map(|d| Some(d.with_timezone(&Utc)))
            .map_err(|_| AuthError::BadTimestamp(raw)),
        None => header_timestamp(headers),
    }
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    a.ct_eq(b).into()
}
