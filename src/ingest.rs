//! The webhook-receiving path: validate, consult the idempotency ledger,
//! enqueue, record. Runs once per inbound call and never returns an error to
//! the caller; every result is an [`IngestOutcome`].

use std::sync::Arc;
use std::time::Instant;

use axum::http::HeaderMap;
use base64::engine::general_purpose::{STANDARD, STANDARD_NO_PAD, URL_SAFE, URL_SAFE_NO_PAD};
use base64::Engine as _;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::error::{AuthError, IngestError};
use crate::health::HealthMonitor;
use crate::idempotency::{derive_key, IdempotencyGuard};
use crate::queue::LeaseQueue;
use crate::store::ChannelStore;
use crate::telemetry::redact;
use crate::types::{
    DeliverySource, NotificationEvent, ProcessedEventRecord, WorkRequest, CALENDAR_CHANGE,
    GMAIL_HISTORY,
};
use crate::verification::{
    WebhookValidator, MESSAGE_NUMBER_HEADER, RESOURCE_ID_HEADER, RESOURCE_STATE_HEADER,
};

#[derive(Debug, Clone, PartialEq)]
pub enum IngestOutcome {
    /// First handling of this delivery; the record is now in the ledger.
    Processed(ProcessedEventRecord),
    /// Already handled; carries the first handling's record verbatim.
    Duplicate(ProcessedEventRecord),
    Rejected(AuthError),
    /// Authenticated but unparseable. Nothing was recorded.
    Malformed(String),
}

impl IngestOutcome {
    pub fn record(&self) -> Option<&ProcessedEventRecord> {
        match self {
            Self::Processed(r) | Self::Duplicate(r) => Some(r),
            _ => None,
        }
    }
}

/// Decoded mail-provider push.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MailPush {
    pub message_id: String,
    pub delivery_attempt: u64,
    pub email_address: String,
    pub history_id: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PushMessage {
    #[serde(alias = "message_id")]
    message_id: Option<String>,
    data: Option<String>,
    delivery_attempt: Option<u64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PushBody {
    message: Option<PushMessage>,
    #[serde(flatten)]
    flat: PushMessage,
    delivery_attempt: Option<u64>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum HistoryId {
    Number(u64),
    Text(String),
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MailNotification {
    email_address: String,
    history_id: HistoryId,
}

fn decode_data(data: &str) -> Option<Vec<u8>> {
    let data = data.trim();
    [&STANDARD, &URL_SAFE, &STANDARD_NO_PAD, &URL_SAFE_NO_PAD]
        .into_iter()
        .find_map(|engine| engine.decode(data).ok())
}

/// Parse a flat `{messageId, data}` body or a Pub/Sub push envelope.
pub fn parse_mail_push(raw_body: &[u8]) -> Result<MailPush, IngestError> {
    let body: PushBody = serde_json::from_slice(raw_body)
        .map_err(|e| IngestError::Malformed(format!("body is not a push message: {e}")))?;
    let outer_attempt = body.delivery_attempt;
    let message = body.message.unwrap_or(body.flat);

    let message_id = message
        .message_id
        .filter(|id| !id.is_empty())
        .ok_or_else(|| IngestError::Malformed("missing messageId".to_string()))?;
    let data = message
        .data
        .ok_or_else(|| IngestError::Malformed("missing data".to_string()))?;
    let decoded = decode_data(&data)
        .ok_or_else(|| IngestError::Malformed("data is not base64".to_string()))?;
    let notification: MailNotification = serde_json::from_slice(&decoded)
        .map_err(|e| IngestError::Malformed(format!("data is not a mail notification: {e}")))?;

    Ok(MailPush {
        message_id,
        delivery_attempt: outer_attempt.or(message.delivery_attempt).unwrap_or(1),
        email_address: notification.email_address,
        history_id: match notification.history_id {
            HistoryId::Number(n) => n.to_string(),
            HistoryId::Text(s) => s,
        },
    })
}

fn header<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

pub struct Ingestor {
    validator: WebhookValidator,
    guard: Arc<IdempotencyGuard>,
    queue: LeaseQueue,
    health: Arc<HealthMonitor>,
    registry: Arc<dyn ChannelStore>,
    clock: Arc<dyn Clock>,
}

impl Ingestor {
    pub fn new(
        validator: WebhookValidator,
        guard: Arc<IdempotencyGuard>,
        queue: LeaseQueue,
        health: Arc<HealthMonitor>,
        registry: Arc<dyn ChannelStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            validator,
            guard,
            queue,
            health,
            registry,
            clock,
        }
    }

    pub async fn handle_gmail_push(&self, headers: &HeaderMap, raw_body: &[u8]) -> IngestOutcome {
        let validation = self.validator.validate_signed(headers, raw_body);
        if let Some(reason) = validation.rejection {
            warn!(reason = %reason, "rejected mail push");
            return IngestOutcome::Rejected(reason);
        }

        let push = match parse_mail_push(raw_body) {
            Ok(push) => push,
            Err(e) => {
                warn!(error = %e, "authenticated mail push could not be parsed");
                return IngestOutcome::Malformed(e.to_string());
            }
        };
        debug!(
            message = %redact(&push.message_id),
            mailbox = %redact(&push.email_address),
            attempt = push.delivery_attempt,
            "mail push"
        );

        let dedup_key = format!("gmail:{}:{}", push.email_address, push.history_id);
        self.accept(NotificationEvent {
            event_id: push.message_id,
            delivery_attempt: push.delivery_attempt,
            source: DeliverySource::Push,
            work: Some(WorkRequest {
                item_type: GMAIL_HISTORY.to_string(),
                payload: json!({
                    "emailAddress": push.email_address,
                    "historyId": push.history_id,
                }),
                dedup_key: Some(dedup_key),
            }),
        })
        .await
    }

    pub async fn handle_calendar_push(&self, headers: &HeaderMap) -> IngestOutcome {
        let validation = self.validator.validate_channel(headers, self.registry.as_ref()).await;
        if let Some(reason) = validation.rejection {
            warn!(reason = %reason, "rejected calendar push");
            return IngestOutcome::Rejected(reason);
        }
        let Some(channel) = validation.channel else {
            return IngestOutcome::Rejected(AuthError::UnknownChannel);
        };

        let Some(message_number) =
            header(headers, MESSAGE_NUMBER_HEADER).and_then(|n| n.parse::<u64>().ok())
        else {
            warn!(channel = %redact(&channel.id), "calendar push without a usable message number");
            return IngestOutcome::Malformed("missing or invalid message number".to_string());
        };
        let resource_state = header(headers, RESOURCE_STATE_HEADER).unwrap_or("exists");

        // `sync` is the handshake sent when a channel starts; nothing changed.
        let work = (resource_state != "sync").then(|| WorkRequest {
            item_type: CALENDAR_CHANGE.to_string(),
            payload: json!({
                "channelId": channel.id,
                "calendarId": channel.resource.name,
                "resourceId": header(headers, RESOURCE_ID_HEADER).unwrap_or(&channel.resource_id),
                "resourceState": resource_state,
                "messageNumber": message_number,
            }),
            dedup_key: Some(format!("calendar:{}:{}", channel.id, message_number)),
        });

        self.accept(NotificationEvent {
            event_id: channel.id,
            delivery_attempt: message_number,
            source: DeliverySource::Push,
            work,
        })
        .await
    }

    /// Guard, enqueue, record. Shared by push and poll deliveries; only push
    /// deliveries count as successful callbacks for the health monitor.
    pub async fn accept(&self, event: NotificationEvent) -> IngestOutcome {
        let key = derive_key(&event.event_id, event.delivery_attempt);
        if let Some(prior) = self.guard.get_result(&key) {
            debug!(key = %redact(&key), "duplicate delivery, returning recorded outcome");
            return IngestOutcome::Duplicate(prior);
        }

        let started = Instant::now();
        let enqueued = match &event.work {
            Some(work) => self
                .queue
                .enqueue(&work.item_type, work.payload.clone(), work.dedup_key.as_deref())
                .await
                .map(Some),
            None => Ok(None),
        };

        let record = ProcessedEventRecord {
            idempotency_key: key,
            processed_at: self.clock.now(),
            success: enqueued.is_ok(),
            error_message: enqueued.as_ref().err().map(ToString::to_string),
            processing_time_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
            queue_item_id: enqueued.as_ref().ok().cloned().flatten(),
        };
        self.guard.record(record.clone());

        match &enqueued {
            Ok(item) => {
                if event.source == DeliverySource::Push {
                    self.health.record_success();
                }
                info!(
                    key = %redact(&record.idempotency_key),
                    source = ?event.source,
                    queued = item.is_some(),
                    "notification accepted"
                );
            }
            Err(e) => warn!(key = %redact(&record.idempotency_key), error = %e, "enqueue failed"),
        }
        IngestOutcome::Processed(record)
    }
}
