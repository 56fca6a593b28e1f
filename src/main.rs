use std::sync::Arc;

use anyhow::Context;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use push_ingest::actions::HttpActionHandler;
use push_ingest::channels::{ChannelLifecycleManager, ChannelSettings};
use push_ingest::clock::{Clock, SystemClock};
use push_ingest::config::IngestConfig;
use push_ingest::dispatcher::EventDispatcher;
use push_ingest::google::{CalendarProvider, GmailProvider, StaticTokenSource, TokenSource};
use push_ingest::health::HealthMonitor;
use push_ingest::http_server::{self, AppState};
use push_ingest::idempotency::IdempotencyGuard;
use push_ingest::ingest::Ingestor;
use push_ingest::polling::PollingFallback;
use push_ingest::provider::ProviderSet;
use push_ingest::queue::LeaseQueue;
use push_ingest::schedule::TokioScheduler;
use push_ingest::store::{ChannelStore, JsonChannelStore, JsonQueueStore};
use push_ingest::telemetry;
use push_ingest::types::{Provider, WatchResource, CALENDAR_CHANGE, GMAIL_HISTORY};
use push_ingest::verification::WebhookValidator;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = IngestConfig::from_env()?;
    telemetry::init_logging(&config.log_level, config.log_json).map_err(anyhow::Error::msg)?;

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let channel_store: Arc<dyn ChannelStore> = Arc::new(
        JsonChannelStore::open(&config.data_dir).context("opening channel registry")?,
    );
    let queue_store =
        Arc::new(JsonQueueStore::open(&config.data_dir).context("opening work queue")?);
    let queue = LeaseQueue::new(queue_store, clock.clone());

    let tokens: Arc<dyn TokenSource> = Arc::new(StaticTokenSource::new(config.access_token.clone()));
    let providers = ProviderSet::new()
        .with(
            Provider::Gmail,
            Arc::new(GmailProvider::new(config.gmail_topic.clone(), tokens.clone())?),
        )
        .with(Provider::Calendar, Arc::new(CalendarProvider::new(tokens)?));

    let resources: Vec<WatchResource> = config
        .gmail_accounts
        .iter()
        .map(WatchResource::gmail)
        .chain(config.calendar_ids.iter().map(WatchResource::calendar))
        .collect();
    if resources.is_empty() {
        warn!("no mailboxes or calendars configured, only inbound webhooks will be handled");
    }

    let guard = Arc::new(IdempotencyGuard::new(
        config.idempotency_capacity,
        config.idempotency_ttl,
        clock.clone(),
    ));
    let health = Arc::new(HealthMonitor::new(config.stale_threshold, clock.clone()));
    let ingestor = Arc::new(Ingestor::new(
        WebhookValidator::new(
            config.webhook_secret.as_deref(),
            config.replay_tolerance,
            clock.clone(),
        ),
        guard.clone(),
        queue.clone(),
        health.clone(),
        channel_store.clone(),
        clock.clone(),
    ));
    let channels = ChannelLifecycleManager::new(
        providers.clone(),
        channel_store,
        Arc::new(TokioScheduler::new(clock.clone())),
        clock,
        ChannelSettings::from_config(&config),
    );
    let polling = Arc::new(PollingFallback::new(
        providers,
        resources.clone(),
        ingestor.clone(),
    ));

    let mut dispatcher =
        EventDispatcher::new(queue.clone(), config.max_batch, config.lease_duration);
    match &config.action_url {
        Some(url) => {
            for item_type in [GMAIL_HISTORY, CALENDAR_CHANGE] {
                dispatcher = dispatcher.register(
                    item_type,
                    Arc::new(HttpActionHandler::new(
                        url.clone(),
                        item_type,
                        config.action_secret.clone(),
                    )),
                );
            }
        }
        None => warn!("INGEST_ACTION_URL not set, queued items will fail until it is configured"),
    }

    let cancel = CancellationToken::new();

    // Serve before creating channels: providers send a `sync` handshake to the
    // callback as soon as a channel exists.
    let listener = TcpListener::bind(&config.bind_addr)
        .await
        .with_context(|| format!("binding {}", config.bind_addr))?;
    let state = AppState {
        ingestor,
        health: health.clone(),
        queue: queue.clone(),
        channels: channels.clone(),
    };
    let server = tokio::spawn(http_server::serve(listener, state, cancel.clone()));

    let report = channels.ensure_watching(resources).await;
    info!(?report, "watch channels reconciled");
    polling.prime().await;

    let workers = vec![
        guard.spawn_sweeper(config.idempotency_sweep_interval, cancel.clone()),
        queue.spawn_maintenance(
            config.maintenance_interval,
            config.max_attempts,
            cancel.clone(),
        ),
        channels.spawn_sweeper(config.channel_sweep_interval, cancel.clone()),
        health.spawn_ticker(config.health_tick, cancel.clone()),
        polling.spawn(health.subscribe(), config.poll_interval, cancel.clone()),
        Arc::new(dispatcher).spawn(config.dispatch_interval, cancel.clone()),
    ];

    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;
    info!("shutdown requested");

    cancel.cancel();
    channels.stop_all_channels().await;
    match server.await {
        Ok(Err(e)) => warn!(error = %e, "HTTP server exited with error"),
        Err(e) => warn!(error = %e, "HTTP server task panicked"),
        Ok(Ok(())) => {}
    }
    for worker in workers {
        if let Err(e) = worker.await {
            warn!(error = %e, "background task ended abnormally");
        }
    }
    info!("stopped");
    Ok(())
}
