//! Push-delivery health.
//!
//! Silence is the only symptom of a dead push channel, so the monitor tracks
//! the time since the last successful push callback and flips the polling
//! fallback on when it exceeds the stale threshold. The flag is published on
//! a `watch` channel that the polling loop follows.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::clock::Clock;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthTransition {
    Enabled,
    Disabled,
    Unchanged,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthSnapshot {
    pub polling_fallback_active: bool,
    pub last_successful_callback: DateTime<Utc>,
}

#[derive(Debug)]
struct State {
    last_success: DateTime<Utc>,
    fallback_active: bool,
}

#[derive(Debug)]
pub struct HealthMonitor {
    state: Mutex<State>,
    stale_threshold: chrono::Duration,
    clock: Arc<dyn Clock>,
    tx: watch::Sender<bool>,
}

impl HealthMonitor {
    /// Startup counts as a successful callback, so a fresh process gets one
    /// full threshold before falling back to polling.
    pub fn new(stale_threshold: Duration, clock: Arc<dyn Clock>) -> Self {
        let (tx, _) = watch::channel(false);
        Self {
            state: Mutex::new(State {
                last_success: clock.now(),
                fallback_active: false,
            }),
            stale_threshold: chrono::Duration::from_std(stale_threshold)
                .unwrap_or(chrono::TimeDelta::MAX),
            clock,
            tx,
        }
    }

    /// Follow `pollingFallbackActive`.
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }

    /// A push-delivered event made it through validation and enqueue.
    pub fn record_success(&self) -> HealthTransition {
        let now = self.clock.now();
        let mut state = self.state.lock();
        state.last_success = now;
        if state.fallback_active {
            state.fallback_active = false;
            self.tx.send_replace(false);
            info!("push delivery resumed, polling fallback disabled");
            return HealthTransition::Disabled;
        }
        HealthTransition::Unchanged
    }

    /// Periodic health check.
    pub fn tick(&self) -> HealthTransition {
        let now = self.clock.now();
        let mut state = self.state.lock();
        let silence = now - state.last_success;
        let stale = silence > self.stale_threshold;

        match (stale, state.fallback_active) {
            (true, false) => {
                state.fallback_active = true;
                self.tx.send_replace(true);
                warn!(
                    silence_secs = silence.num_seconds(),
                    "no successful push callback within threshold, polling fallback enabled"
                );
                HealthTransition::Enabled
            }
            (false, true) => {
                state.fallback_active = false;
                self.tx.send_replace(false);
                info!("push delivery healthy again, polling fallback disabled");
                HealthTransition::Disabled
            }
            _ => {
                debug!(silence_secs = silence.num_seconds(), "health tick");
                HealthTransition::Unchanged
            }
        }
    }

    pub fn is_fallback_active(&self) -> bool {
        self.state.lock().fallback_active
    }

    pub fn snapshot(&self) -> HealthSnapshot {
        let state = self.state.lock();
        HealthSnapshot {
            polling_fallback_active: state.fallback_active,
            last_successful_callback: state.last_success,
        }
    }

    pub fn spawn_ticker(self: &Arc<Self>, interval: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        let monitor = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        monitor.tick();
                    }
                }
            }
        })
    }
}
