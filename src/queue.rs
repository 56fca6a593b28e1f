//! Lease-based work queue over a [`QueueStore`].
//!
//! Every transition is a read followed by a version-checked write of one
//! document. A worker that loses that race simply does not get the item.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::clock::Clock;
use crate::error::StoreError;
use crate::store::QueueStore;
use crate::types::{QueueItem, QueueStatus};

/// Read-modify-write attempts before giving up on a contended item.
const MAX_CAS_RETRIES: usize = 3;
const MAX_ID_BYTES: usize = 1500;

/// Deterministic, store-safe document id.
pub fn sanitize_id(raw: &str) -> String {
    let mut id: String = raw
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | ':' | '.' | '@') {
                c
            } else {
                '_'
            }
        })
        .collect();
    if id.len() > MAX_ID_BYTES {
        let mut cut = MAX_ID_BYTES;
        while !id.is_char_boundary(cut) {
            cut -= 1;
        }
        id.truncate(cut);
    }
    id
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub pending: usize,
    pub leased: usize,
    pub done: usize,
    pub failed: usize,
}

#[derive(Clone)]
pub struct LeaseQueue {
    store: Arc<dyn QueueStore>,
    clock: Arc<dyn Clock>,
}

impl LeaseQueue {
    pub fn new(store: Arc<dyn QueueStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Add work. With a `dedup_key` the id is derived from `type:dedup_key`
    /// and a repeat enqueue returns the existing id without touching it.
    #[instrument(skip(self, payload))]
    pub async fn enqueue(
        &self,
        item_type: &str,
        payload: Value,
        dedup_key: Option<&str>,
    ) -> Result<String, StoreError> {
        let now = self.clock.now();
        let id = match dedup_key {
            Some(key) => sanitize_id(&format!("{item_type}:{key}")),
            None => Uuid::new_v4().to_string(),
        };
        let item = QueueItem {
            id: id.clone(),
            item_type: item_type.to_string(),
            status: QueueStatus::Pending,
            payload,
            attempts: 0,
            created_at: now,
            updated_at: now,
            lease_until: None,
            dedup_key: dedup_key.map(str::to_string),
            last_error: None,
            version: 0,
        };

        if self.store.insert_if_absent(item).await? {
            debug!(id = %id, "enqueued");
        } else {
            debug!(id = %id, "duplicate enqueue ignored");
        }
        Ok(id)
    }

    /// Lease up to `max` pending items for `lease`. Never waits for work.
    #[instrument(skip(self))]
    pub async fn lease_next(
        &self,
        max: usize,
        lease: Duration,
    ) -> Result<Vec<QueueItem>, StoreError> {
        if max == 0 {
            return Ok(Vec::new());
        }
        let now = self.clock.now();
        let lease_until = now + chrono::Duration::from_std(lease).unwrap_or(chrono::TimeDelta::MAX);
        let candidates = self.store.find_by_status(QueueStatus::Pending, max).await?;

        let mut leased = Vec::with_capacity(candidates.len());
        for item in candidates {
            let expected = item.version;
            let mut next = item;
            next.status = QueueStatus::Leased;
            next.lease_until = Some(lease_until);
            next.updated_at = now;

            match self.store.update_if_version(next.clone(), expected).await {
                Ok(true) => {
                    next.version = expected + 1;
                    leased.push(next);
                }
                Ok(false) => debug!(id = %next.id, "lost lease race, skipping"),
                Err(e) => warn!(id = %next.id, error = %e, "lease update failed, skipping"),
            }
        }
        Ok(leased)
    }

    /// `leased -> done`. An item whose lease lapsed and was requeued is no
    /// longer ours: that is a [`StoreError::Conflict`].
    pub async fn mark_done(&self, id: &str) -> Result<QueueItem, StoreError> {
        self.update_with(id, |item| {
            require_leased(item)?;
            item.status = QueueStatus::Done;
            item.lease_until = None;
            Ok(())
        })
        .await
    }

    /// `leased -> failed`: bumps `attempts`, clears the lease, records `error`.
    pub async fn mark_failed(&self, id: &str, error: Option<&str>) -> Result<QueueItem, StoreError> {
        let error = error.map(str::to_string);
        self.update_with(id, move |item| {
            require_leased(item)?;
            item.status = QueueStatus::Failed;
            item.attempts = item.attempts.saturating_add(1);
            item.lease_until = None;
            item.last_error.clone_from(&error);
            Ok(())
        })
        .await
    }

    /// Move leased items whose lease has lapsed back to pending.
    pub async fn requeue_expired_leases(&self) -> Result<usize, StoreError> {
        let now = self.clock.now();
        let leased = self
            .store
            .find_by_status(QueueStatus::Leased, usize::MAX)
            .await?;

        let mut requeued = 0;
        for item in leased {
            if item.lease_until.is_some_and(|until| until > now) {
                continue;
            }
            let expected = item.version;
            let mut next = item;
            next.status = QueueStatus::Pending;
            next.lease_until = None;
            next.updated_at = now;
            match self.store.update_if_version(next, expected).await {
                Ok(true) => requeued += 1,
                Ok(false) => {}
                Err(e) => warn!(error = %e, "could not requeue expired lease"),
            }
        }
        Ok(requeued)
    }

    /// Put failed items with fewer than `max_attempts` attempts back to pending.
    pub async fn retry_failed(&self, max_attempts: u32) -> Result<usize, StoreError> {
        let now = self.clock.now();
        let failed = self
            .store
            .find_by_status(QueueStatus::Failed, usize::MAX)
            .await?;

        let mut retried = 0;
        for item in failed.into_iter().filter(|i| i.attempts < max_attempts) {
            let expected = item.version;
            let mut next = item;
            next.status = QueueStatus::Pending;
            next.updated_at = now;
            match self.store.update_if_version(next, expected).await {
                Ok(true) => retried += 1,
                Ok(false) => {}
                Err(e) => warn!(error = %e, "could not re-queue failed item"),
            }
        }
        Ok(retried)
    }

    pub async fn get(&self, id: &str) -> Result<Option<QueueItem>, StoreError> {
        self.store.get(id).await
    }

    pub async fn stats(&self) -> Result<QueueStats, StoreError> {
        let counts = self.store.count_by_status().await?;
        let count = |s| counts.get(&s).copied().unwrap_or(0);
        Ok(QueueStats {
            pending: count(QueueStatus::Pending),
            leased: count(QueueStatus::Leased),
            done: count(QueueStatus::Done),
            failed: count(QueueStatus::Failed),
        })
    }

    /// Periodically requeue lapsed leases and retry failed items below
    /// `max_attempts`, until cancelled.
    pub fn spawn_maintenance(
        &self,
        interval: Duration,
        max_attempts: u32,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let queue = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let expired = queue.requeue_expired_leases().await;
                        let retried = queue.retry_failed(max_attempts).await;
                        match (expired, retried) {
                            (Ok(0), Ok(0)) => {}
                            (Ok(expired), Ok(retried)) => {
                                info!(expired, retried, "queue maintenance requeued items");
                            }
                            (Err(e), _) | (_, Err(e)) => warn!(error = %e, "queue maintenance failed"),
                        }
                    }
                }
            }
        })
    }

    async fn update_with<F>(&self, id: &str, mutate: F) -> Result<QueueItem, StoreError>
    where
        F: Fn(&mut QueueItem) -> Result<(), StoreError> + Send + Sync,
    {
        for _ in 0..MAX_CAS_RETRIES {
            let current = self
                .store
                .get(id)
                .await?
                .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
            let expected = current.version;
            let mut next = current;
            mutate(&mut next)?;
            next.updated_at = self.clock.now();

            if self.store.update_if_version(next.clone(), expected).await? {
                next.version = expected + 1;
                return Ok(next);
            }
            debug!(id = %id, "conditional update lost, re-reading");
        }
        Err(StoreError::Conflict(id.to_string()))
    }
}

fn require_leased(item: &QueueItem) -> Result<(), StoreError> {
    if item.status == QueueStatus::Leased {
        return Ok(());
    }
    debug!(id = %item.id, status = ?item.status, "item is no longer leased");
    Err(StoreError::Conflict(item.id.clone()))
}
