//! Channel Lifecycle Manager.
//!
//! Owns one push subscription per watched resource. Every timer (renewal at
//! `expiration - renewal_advance`, retry after a failed create) fires the same
//! reconcile step, which inspects the persisted channel and decides whether to
//! adopt, renew or re-create it. Failures never escape: they schedule a retry.
//!
//! Work on one resource is serialized by a per-resource async lock, so a
//! renewal timer and a sweep that overlap never both replace the channel.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::clock::Clock;
use crate::config::IngestConfig;
use crate::error::ChannelError;
use crate::provider::{ChannelSpec, ProviderSet};
use crate::schedule::{ScheduledTask, Scheduler};
use crate::store::ChannelStore;
use crate::telemetry::redact;
use crate::types::{ChannelState, Provider, WatchChannel, WatchResource};
use crate::verification::derive_channel_token;

#[derive(Debug, Clone)]
pub struct ChannelSettings {
    pub ttl: Duration,
    pub renewal_advance: Duration,
    pub renewal_retry: Duration,
    pub token_secret: Option<String>,
    pub gmail_callback: String,
    pub calendar_callback: String,
}

impl ChannelSettings {
    pub fn from_config(config: &IngestConfig) -> Self {
        Self {
            ttl: config.channel_ttl,
            renewal_advance: config.renewal_advance,
            renewal_retry: config.renewal_retry,
            token_secret: config.channel_token_secret.clone(),
            gmail_callback: config.gmail_callback_url(),
            calendar_callback: config.calendar_callback_url(),
        }
    }

    fn callback_for(&self, provider: Provider) -> &str {
        match provider {
            Provider::Gmail => &self.gmail_callback,
            Provider::Calendar => &self.calendar_callback,
        }
    }
}

fn chrono_duration(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or(chrono::TimeDelta::MAX)
}

#[derive(Debug, Clone)]
pub enum RenewalOutcome {
    Renewed(WatchChannel),
    RetryScheduled { at: DateTime<Utc> },
}

/// What one reconcile step did for a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reconciled {
    /// Channel outside the renewal window; kept, timer ensured.
    Healthy,
    Created,
    Renewed,
    /// An expired channel was dropped and replaced.
    Recreated,
    RetryScheduled { at: DateTime<Utc> },
    /// Manager is shutting down.
    Skipped,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub healthy: usize,
    pub created: usize,
    pub renewed: usize,
    pub recreated: usize,
    pub retrying: usize,
}

impl SweepReport {
    pub fn took_action(&self) -> bool {
        self.created + self.renewed + self.recreated + self.retrying > 0
    }

    fn add(&mut self, outcome: Reconciled) {
        match outcome {
            Reconciled::Healthy => self.healthy += 1,
            Reconciled::Created => self.created += 1,
            Reconciled::Renewed => self.renewed += 1,
            Reconciled::Recreated => self.recreated += 1,
            Reconciled::RetryScheduled { .. } => self.retrying += 1,
            Reconciled::Skipped => {}
        }
    }
}

/// One row of `/healthz`.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ChannelStatus {
    pub provider: Provider,
    pub resource: String,
    pub state: ChannelState,
    pub expiration: Option<DateTime<Utc>>,
}

struct Inner {
    providers: ProviderSet,
    store: Arc<dyn ChannelStore>,
    scheduler: Arc<dyn Scheduler>,
    clock: Arc<dyn Clock>,
    settings: ChannelSettings,
    desired: Mutex<Vec<WatchResource>>,
    timers: Mutex<HashMap<WatchResource, ScheduledTask>>,
    states: Mutex<HashMap<WatchResource, ChannelState>>,
    locks: Mutex<HashMap<WatchResource, Arc<AsyncMutex<()>>>>,
    shutdown: CancellationToken,
}

#[derive(Clone)]
pub struct ChannelLifecycleManager {
    inner: Arc<Inner>,
}

impl ChannelLifecycleManager {
    pub fn new(
        providers: ProviderSet,
        store: Arc<dyn ChannelStore>,
        scheduler: Arc<dyn Scheduler>,
        clock: Arc<dyn Clock>,
        settings: ChannelSettings,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                providers,
                store,
                scheduler,
                clock,
                settings,
                desired: Mutex::new(Vec::new()),
                timers: Mutex::new(HashMap::new()),
                states: Mutex::new(HashMap::new()),
                locks: Mutex::new(HashMap::new()),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    pub fn watched_resources(&self) -> Vec<WatchResource> {
        self.inner.desired.lock().clone()
    }

    /// Startup: adopt, renew or re-create the persisted channel of every
    /// resource in `resources`, create missing ones, and stop persisted
    /// channels for resources no longer configured.
    pub async fn ensure_watching(&self, resources: Vec<WatchResource>) -> SweepReport {
        {
            let mut desired = self.inner.desired.lock();
            for resource in resources {
                if !desired.contains(&resource) {
                    desired.push(resource);
                }
            }
        }

        match self.inner.store.list().await {
            Ok(persisted) => {
                let desired = self.watched_resources();
                for orphan in persisted.into_iter().filter(|c| !desired.contains(&c.resource)) {
                    info!(resource = %orphan.resource, "stopping channel for unconfigured resource");
                    self.stop_and_forget(&orphan).await;
                }
            }
            Err(e) => warn!(error = %e, "could not list persisted channels, skipping orphan cleanup"),
        }

        self.sweep().await
    }

    /// Reconcile every watched resource once.
    pub async fn sweep(&self) -> SweepReport {
        let mut report = SweepReport::default();
        for resource in self.watched_resources() {
            report.add(self.reconcile(&resource).await);
        }
        report
    }

    pub async fn create_watch_channel(
        &self,
        resource: &WatchResource,
    ) -> Result<WatchChannel, ChannelError> {
        let _guard = self.lock_resource(resource).await;
        self.create_locked(resource).await
    }

    #[instrument(skip(self, resource), fields(resource = %resource))]
    async fn create_locked(&self, resource: &WatchResource) -> Result<WatchChannel, ChannelError> {
        if self.inner.shutdown.is_cancelled() {
            return Err(ChannelError::ShuttingDown);
        }
        self.set_state(resource, ChannelState::PendingCreate);
        let settings = &self.inner.settings;
        let now = self.inner.clock.now();

        let id = Uuid::new_v4().to_string();
        let token = match &settings.token_secret {
            Some(secret) => derive_channel_token(secret.as_bytes(), &id)?,
            None => Uuid::new_v4().simple().to_string(),
        };
        let requested = now + chrono_duration(settings.ttl);
        let spec = ChannelSpec {
            id: id.clone(),
            token: token.clone(),
            address: settings.callback_for(resource.provider).to_string(),
            expiration: requested,
        };

        let provider = self.inner.providers.get(resource.provider)?;
        let granted = provider.watch(resource, &spec).await?;

        let channel = WatchChannel {
            id,
            resource: resource.clone(),
            resource_id: granted.resource_id,
            resource_uri: granted.resource_uri,
            token,
            expiration: granted.expiration.unwrap_or(requested),
            created_at: now,
        };
        if let Some(replaced) = self.inner.store.put(channel.clone()).await? {
            if replaced.id != channel.id {
                self.stop_superseded(&replaced).await;
            }
        }

        self.set_state(resource, ChannelState::Active);
        let renew_at = self.renewal_time(&channel);
        self.schedule(resource, renew_at);
        info!(
            channel = %redact(&channel.id),
            expiration = %channel.expiration,
            renew_at = %renew_at,
            "watch channel created"
        );
        Ok(channel)
    }

    /// Stop `channel` (best-effort) and create its replacement. A failed
    /// create schedules a retry after the renewal backoff.
    pub async fn renew_channel(&self, channel: WatchChannel) -> RenewalOutcome {
        let _guard = self.lock_resource(&channel.resource).await;
        self.renew_locked(channel).await
    }

    #[instrument(skip(self, channel), fields(resource = %channel.resource, channel = %redact(&channel.id)))]
    async fn renew_locked(&self, channel: WatchChannel) -> RenewalOutcome {
        let resource = channel.resource.clone();
        self.set_state(&resource, ChannelState::Renewing);
        self.stop_and_forget(&channel).await;

        match self.create_locked(&resource).await {
            Ok(replacement) => RenewalOutcome::Renewed(replacement),
            Err(e) => RenewalOutcome::RetryScheduled {
                at: self.retry_after_failure(&resource, &e, "channel renewal failed"),
            },
        }
    }

    /// Best-effort stop of every channel on shutdown. Timers are cancelled and
    /// local records removed whatever the provider answers.
    pub async fn stop_all_channels(&self) -> usize {
        self.inner.shutdown.cancel();
        for (_, timer) in self.inner.timers.lock().drain() {
            timer.cancel();
        }
        // Wait out in-flight creates so their channels are listed below.
        let locks: Vec<_> = self.inner.locks.lock().values().cloned().collect();
        for lock in locks {
            drop(lock.lock().await);
        }

        let channels = match self.inner.store.list().await {
            Ok(channels) => channels,
            Err(e) => {
                warn!(error = %e, "could not list channels to stop");
                return 0;
            }
        };
        let count = channels.len();
        for channel in &channels {
            self.stop_and_forget(channel).await;
            self.set_state(&channel.resource, ChannelState::Stopped);
        }
        info!(count, "all watch channels stopped");
        count
    }

    pub async fn statuses(&self) -> Vec<ChannelStatus> {
        let mut out = Vec::new();
        for resource in self.watched_resources() {
            let expiration = match self.inner.store.find_by_resource(&resource).await {
                Ok(channel) => channel.map(|c| c.expiration),
                Err(_) => None,
            };
            let state = self
                .inner
                .states
                .lock()
                .get(&resource)
                .copied()
                .unwrap_or(ChannelState::PendingCreate);
            out.push(ChannelStatus {
                provider: resource.provider,
                resource: redact(&resource.name),
                state,
                expiration,
            });
        }
        out
    }

    pub fn state_of(&self, resource: &WatchResource) -> Option<ChannelState> {
        self.inner.states.lock().get(resource).copied()
    }

    /// Run [`ChannelLifecycleManager::sweep`] every `interval` until cancelled.
    pub fn spawn_sweeper(&self, interval: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        let manager = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let report = manager.sweep().await;
                        if report.took_action() {
                            info!(?report, "channel sweep took action");
                        } else {
                            debug!(healthy = report.healthy, "channel sweep");
                        }
                    }
                }
            }
        })
    }

    async fn reconcile(&self, resource: &WatchResource) -> Reconciled {
        let _guard = self.lock_resource(resource).await;
        if self.inner.shutdown.is_cancelled() {
            return Reconciled::Skipped;
        }
        let now = self.inner.clock.now();

        let existing = match self.inner.store.find_by_resource(resource).await {
            Ok(existing) => existing,
            Err(e) => {
                let at = self.retry_later(resource);
                warn!(resource = %resource, error = %e, "channel lookup failed, retry scheduled");
                return Reconciled::RetryScheduled { at };
            }
        };

        match existing {
            Some(channel) if self.renewal_time(&channel) > now => {
                self.set_state(resource, ChannelState::Active);
                let renew_at = self.renewal_time(&channel);
                let scheduled = self
                    .inner
                    .timers
                    .lock()
                    .get(resource)
                    .is_some_and(|t| !t.is_cancelled() && t.fire_at() == renew_at);
                if !scheduled {
                    debug!(resource = %resource, renew_at = %renew_at, "adopted channel");
                    self.schedule(resource, renew_at);
                }
                Reconciled::Healthy
            }
            Some(channel) if channel.is_active(now) => match self.renew_locked(channel).await {
                RenewalOutcome::Renewed(_) => Reconciled::Renewed,
                RenewalOutcome::RetryScheduled { at } => Reconciled::RetryScheduled { at },
            },
            Some(channel) => {
                warn!(
                    resource = %resource,
                    channel = %redact(&channel.id),
                    expired = %channel.expiration,
                    "channel expired without renewal, re-creating"
                );
                self.set_state(resource, ChannelState::Expired);
                if let Err(e) = self.inner.store.remove(&channel.id).await {
                    warn!(error = %e, "could not drop expired channel record, continuing");
                }
                self.create_or_retry(resource, Reconciled::Recreated).await
            }
            None => self.create_or_retry(resource, Reconciled::Created).await,
        }
    }

    async fn create_or_retry(&self, resource: &WatchResource, on_success: Reconciled) -> Reconciled {
        match self.create_locked(resource).await {
            Ok(_) => on_success,
            Err(e) => Reconciled::RetryScheduled {
                at: self.retry_after_failure(resource, &e, "channel create failed"),
            },
        }
    }

    /// Permanent failures (bad credentials, missing provider) still retry so
    /// a watched resource is never abandoned, but they log at error level.
    fn retry_after_failure(
        &self,
        resource: &WatchResource,
        e: &ChannelError,
        what: &str,
    ) -> DateTime<Utc> {
        let at = self.retry_later(resource);
        if e.is_transient() {
            warn!(resource = %resource, error = %e, retry_at = %at, "{what}, retry scheduled");
        } else {
            error!(resource = %resource, error = %e, retry_at = %at, "{what} permanently, retrying anyway");
        }
        at
    }

    async fn lock_resource(&self, resource: &WatchResource) -> OwnedMutexGuard<()> {
        let lock = self
            .inner
            .locks
            .lock()
            .entry(resource.clone())
            .or_default()
            .clone();
        lock.lock_owned().await
    }

    /// A replaced record whose channel is still live at the provider. Only
    /// channel-scoped stops are sent: a mailbox-wide stop would also end the
    /// watch that superseded it.
    async fn stop_superseded(&self, replaced: &WatchChannel) {
        let Ok(provider) = self.inner.providers.get(replaced.resource.provider) else {
            return;
        };
        if !provider.stop_is_channel_scoped() {
            debug!(old = %redact(&replaced.id), "superseded by the new mailbox watch");
            return;
        }
        info!(old = %redact(&replaced.id), "stopping superseded channel");
        if let Err(e) = provider.stop(&replaced.id, &replaced.resource_id).await {
            warn!(old = %redact(&replaced.id), error = %e, "superseded channel stop failed");
        }
    }

    /// Remote stop is best-effort; the local record goes either way.
    async fn stop_and_forget(&self, channel: &WatchChannel) {
        match self.inner.providers.get(channel.resource.provider) {
            Ok(provider) => {
                if let Err(e) = provider.stop(&channel.id, &channel.resource_id).await {
                    warn!(
                        channel = %redact(&channel.id),
                        error = %e,
                        "remote channel stop failed, dropping local record anyway"
                    );
                }
            }
            Err(e) => warn!(error = %e, "no provider to stop channel, dropping local record"),
        }
        if let Err(e) = self.inner.store.remove(&channel.id).await {
            warn!(channel = %redact(&channel.id), error = %e, "could not remove channel record");
        }
    }

    /// `expiration - renewal_advance`, but never earlier than halfway through
    /// the channel's life so a short grant does not renew in a tight loop.
    fn renewal_time(&self, channel: &WatchChannel) -> DateTime<Utc> {
        let advance = chrono_duration(self.inner.settings.renewal_advance);
        let midpoint = channel.created_at + (channel.expiration - channel.created_at) / 2;
        (channel.expiration - advance).max(midpoint)
    }

    fn retry_later(&self, resource: &WatchResource) -> DateTime<Utc> {
        let at = self.inner.clock.now() + chrono_duration(self.inner.settings.renewal_retry);
        self.schedule(resource, at);
        at
    }

    fn schedule(&self, resource: &WatchResource, at: DateTime<Utc>) {
        if self.inner.shutdown.is_cancelled() {
            return;
        }
        let task = self
            .inner
            .scheduler
            .schedule_at(at, self.reconcile_task(resource.clone()));
        if let Some(previous) = self.inner.timers.lock().insert(resource.clone(), task) {
            previous.cancel();
        }
    }

    fn reconcile_task(&self, resource: WatchResource) -> BoxFuture<'static, ()> {
        let manager = self.clone();
        Box::pin(async move {
            let outcome = manager.reconcile(&resource).await;
            debug!(resource = %resource, ?outcome, "scheduled reconcile finished");
        })
    }

    fn set_state(&self, resource: &WatchResource, state: ChannelState) {
        self.inner.states.lock().insert(resource.clone(), state);
    }
}
