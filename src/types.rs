use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Queue item type for mail-provider history notifications.
pub const GMAIL_HISTORY: &str = "gmail_history";
/// Queue item type for calendar change notifications.
pub const CALENDAR_CHANGE: &str = "calendar_change";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Provider {
    Gmail,
    Calendar,
}

impl Provider {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Gmail => "gmail",
            Self::Calendar => "calendar",
        }
    }
}

impl std::fmt::Display for Provider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Something that can be watched: a mailbox or a calendar.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WatchResource {
    pub provider: Provider,
    /// Mailbox address for gmail, calendar id for calendar.
    pub name: String,
}

impl WatchResource {
    pub fn gmail(address: impl Into<String>) -> Self {
        Self {
            provider: Provider::Gmail,
            name: address.into(),
        }
    }

    pub fn calendar(calendar_id: impl Into<String>) -> Self {
        Self {
            provider: Provider::Calendar,
            name: calendar_id.into(),
        }
    }
}

impl std::fmt::Display for WatchResource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.provider, crate::telemetry::redact(&self.name))
    }
}

/// One active subscription to a provider resource.
#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WatchChannel {
    pub id: String,
    pub resource: WatchResource,
    /// Provider-assigned id of the watched resource (needed to stop the channel).
    pub resource_id: String,
    pub resource_uri: Option<String>,
    pub token: String,
    pub expiration: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl WatchChannel {
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        self.expiration > now
    }
}

impl std::fmt::Debug for WatchChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WatchChannel")
            .field("id", &self.id)
            .field("resource", &self.resource)
            .field("resource_id", &self.resource_id)
            .field("token", &"[REDACTED]")
            .field("expiration", &self.expiration)
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ChannelState {
    PendingCreate,
    Active,
    Renewing,
    Expired,
    Stopped,
}

/// Idempotency ledger entry for one inbound delivery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessedEventRecord {
    pub idempotency_key: String,
    pub processed_at: DateTime<Utc>,
    pub success: bool,
    pub error_message: Option<String>,
    pub processing_time_ms: u64,
    /// Queue item produced by the delivery, if any.
    pub queue_item_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueStatus {
    Pending,
    Leased,
    Done,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueItem {
    pub id: String,
    #[serde(rename = "type")]
    pub item_type: String,
    pub status: QueueStatus,
    pub payload: serde_json::Value,
    pub attempts: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub lease_until: Option<DateTime<Utc>>,
    pub dedup_key: Option<String>,
    pub last_error: Option<String>,
    /// Bumped on every write; conditional updates compare against it.
    #[serde(default)]
    pub version: u64,
}

/// How a notification reached us.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliverySource {
    Push,
    Poll,
}

/// A validated notification, normalised for the idempotency guard and queue.
#[derive(Debug, Clone, PartialEq)]
pub struct NotificationEvent {
    pub event_id: String,
    pub delivery_attempt: u64,
    pub source: DeliverySource,
    /// `None` for notifications that are acknowledged but produce no work
    /// (calendar `sync` handshakes).
    pub work: Option<WorkRequest>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct WorkRequest {
    pub item_type: String,
    pub payload: serde_json::Value,
    pub dedup_key: Option<String>,
}
