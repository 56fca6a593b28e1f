//! Push-notification ingestion for mail and calendar providers.
//!
//! Webhook deliveries are authenticated, de-duplicated and turned into leased
//! work items; watch channels are renewed before they expire, and a polling
//! fallback takes over when push delivery goes quiet.

pub mod actions;
pub mod channels;
pub mod clock;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod google;
pub mod health;
pub mod http_server;
pub mod idempotency;
pub mod ingest;
pub mod polling;
pub mod provider;
pub mod queue;
pub mod schedule;
pub mod store;
pub mod telemetry;
pub mod types;
pub mod verification;

pub use channels::ChannelLifecycleManager;
pub use config::IngestConfig;
pub use dispatcher::{EventDispatcher, EventHandler};
pub use health::HealthMonitor;
pub use idempotency::IdempotencyGuard;
pub use ingest::{IngestOutcome, Ingestor};
pub use polling::PollingFallback;
pub use queue::LeaseQueue;
pub use verification::WebhookValidator;
