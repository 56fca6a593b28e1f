//! Polling fallback: while push delivery is considered stale, list provider
//! changes on a fixed interval and feed them through the same ingestion path
//! as webhooks.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::ProviderError;
use crate::ingest::{IngestOutcome, Ingestor};
use crate::provider::{ProviderSet, RawChange};
use crate::types::{
    DeliverySource, NotificationEvent, Provider, WatchResource, WorkRequest, CALENDAR_CHANGE,
    GMAIL_HISTORY,
};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PollReport {
    pub accepted: usize,
    pub duplicates: usize,
    pub failed: usize,
    pub errors: usize,
}

/// Synthesize the event a webhook would have delivered for `change`.
pub fn poll_event(resource: &WatchResource, change: RawChange) -> NotificationEvent {
    let (prefix, item_type) = match resource.provider {
        Provider::Gmail => ("gmail", GMAIL_HISTORY),
        Provider::Calendar => ("calendar", CALENDAR_CHANGE),
    };
    NotificationEvent {
        event_id: format!("poll:{prefix}:{}:{}", resource.name, change.id),
        delivery_attempt: 0,
        source: DeliverySource::Poll,
        work: Some(WorkRequest {
            item_type: item_type.to_string(),
            payload: change.data,
            dedup_key: Some(format!("{prefix}:{}:{}", resource.name, change.id)),
        }),
    }
}

pub struct PollingFallback {
    providers: ProviderSet,
    resources: Vec<WatchResource>,
    checkpoints: Mutex<HashMap<WatchResource, String>>,
    ingestor: Arc<Ingestor>,
}

impl PollingFallback {
    pub fn new(providers: ProviderSet, resources: Vec<WatchResource>, ingestor: Arc<Ingestor>) -> Self {
        Self {
            providers,
            resources,
            checkpoints: Mutex::new(HashMap::new()),
            ingestor,
        }
    }

    pub fn checkpoint(&self, resource: &WatchResource) -> Option<String> {
        self.checkpoints.lock().get(resource).cloned()
    }

    /// Establish a baseline checkpoint for every resource that lacks one, so
    /// a later fallback sees changes made since startup.
    pub async fn prime(&self) {
        for resource in &self.resources {
            if self.checkpoint(resource).is_some() {
                continue;
            }
            if let Err(e) = self.poll_resource(resource, &mut PollReport::default()).await {
                warn!(resource = %resource, error = %e, "could not establish polling baseline");
            }
        }
    }

    /// One pass over every resource.
    pub async fn poll_once(&self) -> PollReport {
        let mut report = PollReport::default();
        for resource in &self.resources {
            match self.poll_resource(resource, &mut report).await {
                Ok(()) => {}
                Err(ProviderError::CheckpointExpired) => {
                    warn!(resource = %resource, "checkpoint expired, re-baselining on next poll");
                    self.checkpoints.lock().remove(resource);
                    report.errors += 1;
                }
                Err(e) => {
                    warn!(resource = %resource, error = %e, "change listing failed");
                    report.errors += 1;
                }
            }
        }
        report
    }

    async fn poll_resource(
        &self,
        resource: &WatchResource,
        report: &mut PollReport,
    ) -> Result<(), ProviderError> {
        let provider = self.providers.get(resource.provider)?;
        let since = self.checkpoint(resource);
        let batch = provider.list_changes(resource, since.as_deref()).await?;

        for change in batch.changes {
            match self.ingestor.accept(poll_event(resource, change)).await {
                IngestOutcome::Processed(record) if record.success => report.accepted += 1,
                IngestOutcome::Duplicate(_) => report.duplicates += 1,
                _ => report.failed += 1,
            }
        }
        if let Some(checkpoint) = batch.checkpoint {
            self.checkpoints.lock().insert(resource.clone(), checkpoint);
        }
        Ok(())
    }

    /// Poll every `interval` while `active` reads true; idle otherwise.
    pub async fn run(
        &self,
        mut active: watch::Receiver<bool>,
        interval: Duration,
        cancel: CancellationToken,
    ) {
        loop {
            loop {
                let on = *active.borrow_and_update();
                if on {
                    break;
                }
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    changed = active.changed() => if changed.is_err() { return },
                }
            }

            info!(interval_secs = interval.as_secs(), "polling fallback running");
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    changed = active.changed() => {
                        if changed.is_err() {
                            return;
                        }
                        let on = *active.borrow_and_update();
                        if !on {
                            info!("polling fallback stopped");
                            break;
                        }
                    }
                    _ = ticker.tick() => {
                        let report = self.poll_once().await;
                        debug!(?report, "fallback poll");
                    }
                }
            }
        }
    }

    pub fn spawn(
        self: &Arc<Self>,
        active: watch::Receiver<bool>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let fallback = Arc::clone(self);
        tokio::spawn(async move { fallback.run(active, interval, cancel).await })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, ManualClock};
    use crate::health::HealthMonitor;
    use crate::idempotency::{IdempotencyGuard, DEFAULT_RETENTION};
    use crate::provider::{ChangeBatch, ChannelSpec, SubscriptionProvider, WatchResponse};
    use crate::queue::LeaseQueue;
    use crate::store::{JsonChannelStore, JsonQueueStore};
    use crate::verification::WebhookValidator;
    use async_trait::async_trait;
    use serde_json::json;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Replays scripted `list_changes` results, then returns empty batches.
    #[derive(Default)]
    struct ScriptedProvider {
        script: Mutex<VecDeque<Result<ChangeBatch, ProviderError>>>,
        seen_since: Mutex<Vec<Option<String>>>,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl SubscriptionProvider for ScriptedProvider {
        async fn watch(
            &self,
            _resource: &WatchResource,
            _spec: &ChannelSpec,
        ) -> Result<WatchResponse, ProviderError> {
            Err(ProviderError::NotConfigured("watch".to_string()))
        }

        async fn stop(&self, _channel_id: &str, _resource_id: &str) -> Result<(), ProviderError> {
            Ok(())
        }

        async fn list_changes(
            &self,
            _resource: &WatchResource,
            since: Option<&str>,
        ) -> Result<ChangeBatch, ProviderError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.seen_since.lock().push(since.map(str::to_string));
            self.script.lock().pop_front().unwrap_or_else(|| {
                Ok(ChangeBatch {
                    changes: Vec::new(),
                    checkpoint: since.map(str::to_string),
                })
            })
        }
    }

    fn batch(ids: &[&str], checkpoint: &str) -> Result<ChangeBatch, ProviderError> {
        Ok(ChangeBatch {
            changes: ids
                .iter()
                .map(|id| RawChange {
                    id: id.to_string(),
                    data: json!({ "eventId": id }),
                })
                .collect(),
            checkpoint: Some(checkpoint.to_string()),
        })
    }

    fn fallback(provider: Arc<ScriptedProvider>) -> (Arc<PollingFallback>, LeaseQueue, Arc<HealthMonitor>) {
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::at_epoch());
        let queue = LeaseQueue::new(Arc::new(JsonQueueStore::in_memory()), clock.clone());
        let health = Arc::new(HealthMonitor::new(Duration::from_secs(600), clock.clone()));
        let ingestor = Arc::new(Ingestor::new(
            WebhookValidator::new(None, Duration::from_secs(300), clock.clone()),
            Arc::new(IdempotencyGuard::new(100, DEFAULT_RETENTION, clock.clone())),
            queue.clone(),
            health.clone(),
            Arc::new(JsonChannelStore::in_memory()),
            clock,
        ));
        let fallback = Arc::new(PollingFallback::new(
            ProviderSet::new().with(Provider::Calendar, provider),
            vec![WatchResource::calendar("primary")],
            ingestor,
        ));
        (fallback, queue, health)
    }

    #[tokio::test]
    async fn polled_changes_are_enqueued_once() {
        let provider = Arc::new(ScriptedProvider::default());
        provider.script.lock().extend([
            batch(&[], "sync-1"),
            batch(&["evt-1:t1", "evt-2:t1"], "sync-2"),
            batch(&["evt-1:t1"], "sync-3"),
        ]);
        let (fallback, queue, _) = fallback(provider.clone());

        fallback.prime().await;
        let first = fallback.poll_once().await;
        let second = fallback.poll_once().await;

        assert_eq!(first.accepted, 2);
        assert_eq!(second.duplicates, 1);
        assert_eq!(queue.stats().await.unwrap().pending, 2);
        assert_eq!(
            *provider.seen_since.lock(),
            vec![None, Some("sync-1".to_string()), Some("sync-2".to_string())]
        );
        let item = queue
            .get("calendar_change:calendar:primary:evt-1:t1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(item.payload["eventId"], "evt-1:t1");
    }

    #[tokio::test]
    async fn expired_checkpoint_is_dropped_for_rebaseline() {
        let provider = Arc::new(ScriptedProvider::default());
        provider
            .script
            .lock()
            .extend([batch(&[], "sync-1"), Err(ProviderError::CheckpointExpired)]);
        let (fallback, _, _) = fallback(provider);
        let primary = WatchResource::calendar("primary");

        fallback.prime().await;
        assert_eq!(fallback.checkpoint(&primary).as_deref(), Some("sync-1"));

        let report = fallback.poll_once().await;
        assert_eq!(report.errors, 1);
        assert!(fallback.checkpoint(&primary).is_none());
    }

    #[tokio::test]
    async fn polls_only_while_fallback_is_active() {
        let provider = Arc::new(ScriptedProvider::default());
        let (fallback, _, _) = fallback(provider.clone());
        let (tx, rx) = watch::channel(false);
        let cancel = CancellationToken::new();
        let handle = fallback.spawn(rx, Duration::from_millis(10), cancel.clone());

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(provider.calls.load(Ordering::SeqCst), 0);

        tx.send_replace(true);
        tokio::time::timeout(Duration::from_secs(2), async {
            while provider.calls.load(Ordering::SeqCst) < 2 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("fallback should poll while active");

        tx.send_replace(false);
        tokio::time::sleep(Duration::from_millis(30)).await;
        let settled = provider.calls.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(provider.calls.load(Ordering::SeqCst), settled);

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn polled_events_leave_health_untouched() {
        let provider = Arc::new(ScriptedProvider::default());
        provider.script.lock().push_back(batch(&["evt-1:t1"], "sync-1"));
        let (fallback, _, health) = fallback(provider);
        let before = health.snapshot();

        fallback.poll_once().await;
        assert_eq!(health.snapshot(), before);
    }
}
