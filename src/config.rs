//! Runtime configuration, read from `INGEST_*` environment variables.

use std::env;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::ConfigError;

#[derive(Debug, Clone)]
pub struct IngestConfig {
    pub bind_addr: String,
    pub data_dir: PathBuf,
    /// HMAC secret for signed mail-provider pushes.
    pub webhook_secret: Option<String>,
    /// Secret used to derive per-channel tokens.
    pub channel_token_secret: Option<String>,
    pub callback_base_url: String,
    pub gmail_topic: Option<String>,
    pub gmail_accounts: Vec<String>,
    pub calendar_ids: Vec<String>,
    pub access_token: Option<String>,

    pub channel_ttl: Duration,
    pub renewal_advance: Duration,
    pub renewal_retry: Duration,
    pub channel_sweep_interval: Duration,

    pub replay_tolerance: Duration,

    pub stale_threshold: Duration,
    pub health_tick: Duration,
    pub poll_interval: Duration,

    pub lease_duration: Duration,
    pub max_batch: usize,
    pub dispatch_interval: Duration,
    pub max_attempts: u32,
    pub maintenance_interval: Duration,

    pub idempotency_capacity: usize,
    pub idempotency_ttl: Duration,
    pub idempotency_sweep_interval: Duration,

    pub action_url: Option<String>,
    pub action_secret: Option<String>,

    pub log_level: String,
    pub log_json: bool,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:8080".to_string(),
            data_dir: PathBuf::from("./data"),
            webhook_secret: None,
            channel_token_secret: None,
            callback_base_url: "http://localhost:8080".to_string(),
            gmail_topic: None,
            gmail_accounts: Vec::new(),
            calendar_ids: Vec::new(),
            access_token: None,
            channel_ttl: Duration::from_secs(7 * 24 * 3600),
            renewal_advance: Duration::from_secs(3600),
            renewal_retry: Duration::from_secs(300),
            channel_sweep_interval: Duration::from_secs(600),
            replay_tolerance: Duration::from_secs(300),
            stale_threshold: Duration::from_secs(600),
            health_tick: Duration::from_secs(300),
            poll_interval: Duration::from_secs(120),
            lease_duration: Duration::from_millis(60_000),
            max_batch: 10,
            dispatch_interval: Duration::from_millis(1000),
            max_attempts: 5,
            maintenance_interval: Duration::from_secs(60),
            idempotency_capacity: 10_000,
            idempotency_ttl: Duration::from_secs(24 * 3600),
            idempotency_sweep_interval: Duration::from_secs(3600),
            action_url: None,
            action_secret: None,
            log_level: "info".to_string(),
            log_json: false,
        }
    }
}

impl IngestConfig {
    /// Load configuration from the process environment. Unset variables keep
    /// their defaults; set-but-invalid ones are an error.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Same as [`IngestConfig::from_env`] over an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let vars = Vars(&lookup);
        let d = Self::default();

        Ok(Self {
            bind_addr: vars.string("INGEST_BIND_ADDR").unwrap_or(d.bind_addr),
            data_dir: vars
                .string("INGEST_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or(d.data_dir),
            webhook_secret: vars.string("INGEST_WEBHOOK_SECRET"),
            channel_token_secret: vars.string("INGEST_CHANNEL_TOKEN_SECRET"),
            callback_base_url: vars
                .string("INGEST_CALLBACK_BASE_URL")
                .map(|u| u.trim_end_matches('/').to_string())
                .unwrap_or(d.callback_base_url),
            gmail_topic: vars.string("INGEST_GMAIL_TOPIC"),
            gmail_accounts: vars.list("INGEST_GMAIL_ACCOUNTS"),
            calendar_ids: vars.list("INGEST_CALENDAR_IDS"),
            access_token: vars.string("INGEST_ACCESS_TOKEN"),
            channel_ttl: vars.secs("INGEST_CHANNEL_TTL_SECS", d.channel_ttl)?,
            renewal_advance: vars.secs("INGEST_RENEWAL_ADVANCE_SECS", d.renewal_advance)?,
            renewal_retry: vars.secs("INGEST_RENEWAL_RETRY_SECS", d.renewal_retry)?,
            channel_sweep_interval: vars
                .secs("INGEST_CHANNEL_SWEEP_SECS", d.channel_sweep_interval)?,
            replay_tolerance: vars.secs("INGEST_REPLAY_TOLERANCE_SECS", d.replay_tolerance)?,
            stale_threshold: vars.secs("INGEST_STALE_THRESHOLD_SECS", d.stale_threshold)?,
            health_tick: vars.secs("INGEST_HEALTH_TICK_SECS", d.health_tick)?,
            poll_interval: vars.secs("INGEST_POLL_INTERVAL_SECS", d.poll_interval)?,
            lease_duration: vars.millis("INGEST_LEASE_MS", d.lease_duration)?,
            max_batch: vars.number("INGEST_MAX_BATCH", d.max_batch)?,
            dispatch_interval: vars.millis("INGEST_DISPATCH_INTERVAL_MS", d.dispatch_interval)?,
            max_attempts: vars.number("INGEST_MAX_ATTEMPTS", d.max_attempts)?,
            maintenance_interval: vars
                .secs("INGEST_MAINTENANCE_SECS", d.maintenance_interval)?,
            idempotency_capacity: vars
                .number("INGEST_IDEMPOTENCY_CAPACITY", d.idempotency_capacity)?,
            idempotency_ttl: vars.secs("INGEST_IDEMPOTENCY_TTL_SECS", d.idempotency_ttl)?,
            idempotency_sweep_interval: vars
                .secs("INGEST_IDEMPOTENCY_SWEEP_SECS", d.idempotency_sweep_interval)?,
            action_url: vars.string("INGEST_ACTION_URL"),
            action_secret: vars.string("INGEST_ACTION_SECRET"),
            log_level: vars.string("INGEST_LOG_LEVEL").unwrap_or(d.log_level),
            log_json: vars.flag("INGEST_LOG_JSON", d.log_json)?,
        })
    }

    pub fn gmail_callback_url(&self) -> String {
        format!("{}/webhooks/gmail", self.callback_base_url)
    }

    pub fn calendar_callback_url(&self) -> String {
        format!("{}/webhooks/calendar", self.callback_base_url)
    }
}

struct Vars<'a, F>(&'a F);

impl<F> Vars<'_, F>
where
    F: Fn(&str) -> Option<String>,
{
    fn string(&self, var: &str) -> Option<String> {
        (self.0)(var)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn list(&self, var: &str) -> Vec<String> {
        self.string(var)
            .map(|v| {
                v.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }

    fn number<T>(&self, var: &str, default: T) -> Result<T, ConfigError>
    where
        T: std::str::FromStr,
        T::Err: std::fmt::Display,
    {
        match self.string(var) {
            None => Ok(default),
            Some(v) => v.parse().map_err(|e: T::Err| ConfigError::Invalid {
                var: var.to_string(),
                reason: e.to_string(),
            }),
        }
    }

    fn secs(&self, var: &str, default: Duration) -> Result<Duration, ConfigError> {
        self.number(var, default.as_secs()).map(Duration::from_secs)
    }

    fn millis(&self, var: &str, default: Duration) -> Result<Duration, ConfigError> {
        let ms = u64::try_from(default.as_millis()).unwrap_or(u64::MAX);
        self.number(var, ms).map(Duration::from_millis)
    }

    fn flag(&self, var: &str, default: bool) -> Result<bool, ConfigError> {
        match self.string(var).as_deref().map(str::to_ascii_lowercase).as_deref() {
            None => Ok(default),
            Some("1" | "true" | "yes" | "on") => Ok(true),
            Some("0" | "false" | "no" | "off") => Ok(false),
            Some(other) => Err(ConfigError::Invalid {
                var: var.to_string(),
                reason: format!("expected a boolean, got {other:?}"),
            }),
        }
    }
}
