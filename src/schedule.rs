//! Cancellable tasks that fire at an absolute wall-clock instant.
//!
//! Renewal timers and retry backoffs are expressed against this trait rather
//! than against `tokio::time` directly. Production uses [`TokioScheduler`];
//! tests use [`ManualScheduler`] together with [`crate::clock::ManualClock`]
//! and decide exactly when due tasks run.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use crate::clock::Clock;

/// Handle to a scheduled task. Dropping it does not cancel the task.
#[derive(Debug, Clone)]
pub struct ScheduledTask {
    fire_at: DateTime<Utc>,
    token: CancellationToken,
}

impl ScheduledTask {
    pub fn fire_at(&self) -> DateTime<Utc> {
        self.fire_at
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

pub trait Scheduler: Send + Sync + std::fmt::Debug {
    /// Run `task` once `at` has been reached. An instant in the past fires as
    /// soon as possible.
    fn schedule_at(&self, at: DateTime<Utc>, task: BoxFuture<'static, ()>) -> ScheduledTask;
}

/// Spawns one tokio task per scheduled item, sleeping until the deadline.
#[derive(Debug, Clone)]
pub struct TokioScheduler {
    clock: Arc<dyn Clock>,
}

impl TokioScheduler {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self { clock }
    }
}

impl Scheduler for TokioScheduler {
    fn schedule_at(&self, at: DateTime<Utc>, task: BoxFuture<'static, ()>) -> ScheduledTask {
        let token = CancellationToken::new();
        let delay = (at - self.clock.now())
            .to_std()
            .unwrap_or(std::time::Duration::ZERO);

        let cancelled = token.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = cancelled.cancelled() => {}
                _ = tokio::time::sleep(delay) => task.await,
            }
        });

        ScheduledTask { fire_at: at, token }
    }
}

struct Entry {
    seq: u64,
    fire_at: DateTime<Utc>,
    token: CancellationToken,
    task: BoxFuture<'static, ()>,
}

/// Holds tasks until [`ManualScheduler::run_due`] is called.
#[derive(Default)]
pub struct ManualScheduler {
    entries: Mutex<Vec<Entry>>,
    seq: AtomicU64,
}

impl ManualScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fire instants of every live (not cancelled, not yet run) task, earliest first.
    pub fn pending(&self) -> Vec<DateTime<Utc>> {
        let entries = self.entries.lock();
        let mut at: Vec<_> = entries
            .iter()
            .filter(|e| !e.token.is_cancelled())
            .map(|e| e.fire_at)
            .collect();
        at.sort();
        at
    }

    /// Runs every task due at or before `now`, in deadline order, including
    /// tasks scheduled by the tasks being run. Returns how many ran.
    pub async fn run_due(&self, now: DateTime<Utc>) -> usize {
        let mut ran = 0;
        loop {
            let next = {
                let mut entries = self.entries.lock();
                entries.retain(|e| !e.token.is_cancelled());
                entries
                    .iter()
                    .enumerate()
                    .filter(|(_, e)| e.fire_at <= now)
                    .min_by_key(|(_, e)| (e.fire_at, e.seq))
                    .map(|(i, _)| i)
                    .map(|i| entries.remove(i))
            };
            match next {
                Some(entry) => {
                    entry.task.await;
                    ran += 1;
                }
                None => return ran,
            }
        }
    }
}

impl std::fmt::Debug for ManualScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManualScheduler")
            .field("pending", &self.pending())
            .finish()
    }
}

impl Scheduler for ManualScheduler {
    fn schedule_at(&self, at: DateTime<Utc>, task: BoxFuture<'static, ()>) -> ScheduledTask {
        let token = CancellationToken::new();
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        self.entries.lock().push(Entry {
            seq,
            fire_at: at,
            token: token.clone(),
            task,
        });
        ScheduledTask { fire_at: at, token }
    }
}
