//! The minimal provider surface the ingestion core needs: create and stop a
//! push subscription, and list changes since a checkpoint.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::error::ProviderError;
use crate::types::{Provider, WatchResource};

/// What we ask the provider to create.
#[derive(Clone)]
pub struct ChannelSpec {
    pub id: String,
    pub token: String,
    /// Callback URL the provider will deliver to.
    pub address: String,
    pub expiration: DateTime<Utc>,
}

impl std::fmt::Debug for ChannelSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelSpec")
            .field("id", &self.id)
            .field("token", &"[REDACTED]")
            .field("address", &self.address)
            .field("expiration", &self.expiration)
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchResponse {
    pub resource_id: String,
    pub resource_uri: Option<String>,
    /// Expiration granted by the provider, which may be earlier than requested.
    pub expiration: Option<DateTime<Utc>>,
}

/// One provider-side change, normalised to an id plus the payload that will
/// be enqueued for it.
#[derive(Debug, Clone, PartialEq)]
pub struct RawChange {
    pub id: String,
    pub data: Value,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChangeBatch {
    pub changes: Vec<RawChange>,
    /// Checkpoint to pass as `since` on the next call.
    pub checkpoint: Option<String>,
}

#[async_trait]
pub trait SubscriptionProvider: Send + Sync {
    async fn watch(
        &self,
        resource: &WatchResource,
        spec: &ChannelSpec,
    ) -> Result<WatchResponse, ProviderError>;

    async fn stop(&self, channel_id: &str, resource_id: &str) -> Result<(), ProviderError>;

    /// Whether `stop` ends only the named channel. Mailbox-wide stops return
    /// `false` and are never sent for a channel that was already superseded.
    fn stop_is_channel_scoped(&self) -> bool {
        true
    }

    /// Changes after `since`. With no checkpoint, establishes a baseline and
    /// returns no changes.
    async fn list_changes(
        &self,
        resource: &WatchResource,
        since: Option<&str>,
    ) -> Result<ChangeBatch, ProviderError>;
}

/// Provider clients keyed by [`Provider`].
#[derive(Clone, Default)]
pub struct ProviderSet {
    providers: HashMap<Provider, Arc<dyn SubscriptionProvider>>,
}

impl ProviderSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, provider: Provider, client: Arc<dyn SubscriptionProvider>) -> Self {
        self.providers.insert(provider, client);
        self
    }

    pub fn get(&self, provider: Provider) -> Result<&Arc<dyn SubscriptionProvider>, ProviderError> {
        self.providers
            .get(&provider)
            .ok_or_else(|| ProviderError::NotConfigured(provider.to_string()))
    }
}

impl std::fmt::Debug for ProviderSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.providers.keys()).finish()
    }
}
