//! Logging setup and helpers for keeping identifiers out of logs.

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Install the global subscriber. `RUST_LOG` wins over `level` when set.
pub fn init_logging(level: &str, json: bool) -> Result<(), String> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let subscriber = tracing_subscriber::registry().with(env_filter);

    if json {
        subscriber
            .with(
                fmt::layer()
                    .json()
                    .with_current_span(true)
                    .with_target(true),
            )
            .try_init()
            .map_err(|e| format!("failed to install json subscriber: {e}"))
    } else {
        subscriber
            .with(fmt::layer().with_target(true))
            .try_init()
            .map_err(|e| format!("failed to install subscriber: {e}"))
    }
}

const VISIBLE_PREFIX: usize = 8;

/// First few characters of an identifier followed by an ellipsis.
///
/// Email addresses keep their domain and lose most of the local part.
pub fn redact(id: &str) -> String {
    if let Some((local, domain)) = id.split_once('@') {
        let shown: String = local.chars().take(2).collect();
        return format!("{shown}…@{domain}");
    }
    if id.chars().count() <= VISIBLE_PREFIX {
        return id.to_string();
    }
    let shown: String = id.chars().take(VISIBLE_PREFIX).collect();
    format!("{shown}…")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn redacts_long_ids() {
        assert_eq!(redact("0123456789abcdef"), "01234567…");
        assert_eq!(redact("short"), "short");
    }

    #[test]
    fn redacts_email_local_part() {
        assert_eq!(redact("alice@example.com"), "al…@example.com");
    }
}
