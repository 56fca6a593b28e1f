//! Idempotency ledger for the ingestion edge.
//!
//! Keys are `"{event_id}:{delivery_attempt}"`. A key present in the ledger
//! means the delivery was already handled; callers return the recorded
//! outcome instead of repeating side effects. The ledger is bounded by
//! capacity (oldest insert evicted first) and by age (periodic sweep).

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::clock::Clock;
use crate::types::ProcessedEventRecord;

pub const DEFAULT_CAPACITY: usize = 10_000;
pub const DEFAULT_RETENTION: Duration = Duration::from_secs(24 * 3600);

pub fn derive_key(event_id: &str, delivery_attempt: u64) -> String {
    format!("{event_id}:{delivery_attempt}")
}

#[derive(Default)]
struct Ledger {
    records: HashMap<String, ProcessedEventRecord>,
    /// Insertion order; may hold keys already removed by a sweep.
    order: VecDeque<String>,
}

#[derive(Debug)]
pub struct IdempotencyGuard {
    ledger: Mutex<Ledger>,
    capacity: usize,
    retention: chrono::Duration,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for Ledger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ledger")
            .field("len", &self.records.len())
            .finish()
    }
}

impl IdempotencyGuard {
    pub fn new(capacity: usize, retention: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            ledger: Mutex::new(Ledger::default()),
            capacity: capacity.max(1),
            retention: chrono::Duration::from_std(retention).unwrap_or(chrono::TimeDelta::MAX),
            clock,
        }
    }

    pub fn is_processed(&self, key: &str) -> bool {
        self.ledger.lock().records.contains_key(key)
    }

    pub fn get_result(&self, key: &str) -> Option<ProcessedEventRecord> {
        self.ledger.lock().records.get(key).cloned()
    }

    /// Insert or overwrite the outcome for `record.idempotency_key`.
    pub fn record(&self, record: ProcessedEventRecord) {
        let mut ledger = self.ledger.lock();
        let key = record.idempotency_key.clone();
        if ledger.records.insert(key.clone(), record).is_none() {
            ledger.order.push_back(key);
        }
        while ledger.records.len() > self.capacity {
            let Some(oldest) = ledger.order.pop_front() else {
                break;
            };
            if ledger.records.remove(&oldest).is_some() {
                debug!(key = %crate::telemetry::redact(&oldest), "evicted idempotency record at capacity");
            }
        }
    }

    /// Drop records older than the retention window. Returns how many went.
    pub fn purge_expired(&self) -> usize {
        let cutoff: DateTime<Utc> = self.clock.now() - self.retention;
        let mut ledger = self.ledger.lock();
        let before = ledger.records.len();
        ledger.records.retain(|_, r| r.processed_at >= cutoff);
        let Ledger { records, order } = &mut *ledger;
        order.retain(|k| records.contains_key(k));
        before - ledger.records.len()
    }

    pub fn len(&self) -> usize {
        self.ledger.lock().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Run [`IdempotencyGuard::purge_expired`] every `interval` until cancelled.
    pub fn spawn_sweeper(
        self: &Arc<Self>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let guard = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let purged = guard.purge_expired();
                        if purged > 0 {
                            info!(purged, remaining = guard.len(), "idempotency sweep");
                        }
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn record(key: &str, at: DateTime<Utc>) -> ProcessedEventRecord {
        ProcessedEventRecord {
            idempotency_key: key.to_string(),
            processed_at: at,
            success: true,
            error_message: None,
            processing_time_ms: 3,
            queue_item_id: Some(format!("q-{key}")),
        }
    }

    #[test]
    fn key_includes_delivery_attempt() {
        assert_eq!(derive_key("msg-1", 2), "msg-1:2");
        assert_ne!(derive_key("msg-1", 1), derive_key("msg-1", 2));
    }

    #[test]
    fn recorded_result_is_returned_verbatim() {
        let clock = ManualClock::at_epoch();
        let guard = IdempotencyGuard::new(10, DEFAULT_RETENTION, Arc::new(clock.clone()));
        let key = derive_key("msg-1", 1);

        assert!(!guard.is_processed(&key));
        assert!(guard.get_result(&key).is_none());

        let first = record(&key, clock.now());
        guard.record(first.clone());
        assert!(guard.is_processed(&key));
        assert_eq!(guard.get_result(&key), Some(first));
    }

    #[test]
    fn evicts_oldest_when_over_capacity() {
        let clock = ManualClock::at_epoch();
        let guard = IdempotencyGuard::new(2, DEFAULT_RETENTION, Arc::new(clock.clone()));
        guard.record(record("a", clock.now()));
        guard.record(record("b", clock.now()));
        guard.record(record("c", clock.now()));

        assert_eq!(guard.len(), 2);
        assert!(!guard.is_processed("a"));
        assert!(guard.is_processed("b"));
        assert!(guard.is_processed("c"));
    }

    #[test]
    fn overwriting_a_key_does_not_double_count_order() {
        let clock = ManualClock::at_epoch();
        let guard = IdempotencyGuard::new(2, DEFAULT_RETENTION, Arc::new(clock.clone()));
        guard.record(record("a", clock.now()));
        guard.record(record("a", clock.now()));
        guard.record(record("b", clock.now()));
        assert!(guard.is_processed("a"));
        assert!(guard.is_processed("b"));
    }

    #[test]
    fn purge_drops_entries_past_retention() {
        let clock = ManualClock::at_epoch();
        let guard = IdempotencyGuard::new(
            100,
            Duration::from_secs(3600),
            Arc::new(clock.clone()),
        );
        guard.record(record("old", clock.now()));
        clock.advance(chrono::Duration::minutes(90));
        guard.record(record("new", clock.now()));

        assert_eq!(guard.purge_expired(), 1);
        assert!(!guard.is_processed("old"));
        assert!(guard.is_processed("new"));
    }
}
