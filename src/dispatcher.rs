//! Event Dispatcher: leases queue items and routes each to the handler
//! registered for its type.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::error::StoreError;
use crate::queue::LeaseQueue;
use crate::types::QueueItem;

/// Downstream action for one queue item type. Errors mark the item failed.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, payload: &Value) -> anyhow::Result<()>;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchReport {
    pub leased: usize,
    pub done: usize,
    pub failed: usize,
}

pub struct EventDispatcher {
    queue: LeaseQueue,
    handlers: HashMap<String, Arc<dyn EventHandler>>,
    max_batch: usize,
    lease: Duration,
}

impl EventDispatcher {
    pub fn new(queue: LeaseQueue, max_batch: usize, lease: Duration) -> Self {
        Self {
            queue,
            handlers: HashMap::new(),
            max_batch,
            lease,
        }
    }

    pub fn register(mut self, item_type: impl Into<String>, handler: Arc<dyn EventHandler>) -> Self {
        self.handlers.insert(item_type.into(), handler);
        self
    }

    /// Process up to `max_batch` items. Each is leased just before its
    /// handler runs, so a slow item never eats into the next one's lease. A
    /// failing item never stops the rest.
    #[instrument(skip(self))]
    pub async fn run_once(&self) -> Result<DispatchReport, StoreError> {
        let mut report = DispatchReport::default();
        while report.leased < self.max_batch {
            let Some(item) = self.queue.lease_next(1, self.lease).await?.pop() else {
                break;
            };
            report.leased += 1;

            match self.dispatch(&item).await {
                Ok(()) => match self.queue.mark_done(&item.id).await {
                    Ok(_) => report.done += 1,
                    Err(e) => warn!(id = %item.id, error = %e, "could not mark item done, lease lapsed or will lapse"),
                },
                Err(reason) => {
                    warn!(id = %item.id, item_type = %item.item_type, error = %reason, "handler failed");
                    match self.queue.mark_failed(&item.id, Some(&reason)).await {
                        Ok(_) => report.failed += 1,
                        Err(e) => warn!(id = %item.id, error = %e, "could not mark item failed, lease lapsed or will lapse"),
                    }
                }
            }
        }
        Ok(report)
    }

    async fn dispatch(&self, item: &QueueItem) -> Result<(), String> {
        let Some(handler) = self.handlers.get(&item.item_type) else {
            return Err(format!("no handler registered for type {}", item.item_type));
        };
        handler
            .handle(&item.payload)
            .await
            .map_err(|e| format!("{e:#}"))
    }

    /// Drain continuously while there is work; wait `idle_interval` when the
    /// queue is empty or unreachable.
    pub async fn run(&self, idle_interval: Duration, cancel: CancellationToken) {
        info!(types = ?self.handlers.keys().collect::<Vec<_>>(), "dispatcher started");
        loop {
            let busy = match self.run_once().await {
                Ok(report) if report.leased > 0 => {
                    debug!(?report, "dispatched batch");
                    true
                }
                Ok(_) => false,
                Err(e) => {
                    warn!(error = %e, "lease failed, backing off");
                    false
                }
            };
            if busy {
                if cancel.is_cancelled() {
                    break;
                }
                continue;
            }
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(idle_interval) => {}
            }
        }
        info!("dispatcher stopped");
    }

    pub fn spawn(self: Arc<Self>, idle_interval: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move { self.run(idle_interval, cancel).await })
    }
}
