//! Logging setup and time helpers.

use crate::config::LoggingConfig;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::{EnvFilter, Layer, fmt, layer::SubscriberExt, util::SubscriberInitExt};

static LAST_MILLIS: AtomicU64 = AtomicU64::new(0);

/// Wall clock milliseconds that never go backwards within this process.
pub fn monotonic_millis() -> u64 {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0);
    let prev = LAST_MILLIS.fetch_max(now, Ordering::SeqCst);
    prev.max(now)
}

/// Install a global `tracing` subscriber for the given configuration.
///
/// `RUST_LOG` overrides the configured level when set. Returns `false` when a
/// subscriber was already installed, which makes repeated calls harmless.
pub fn init_tracing(config: &LoggingConfig) -> bool {
    let level: tracing::Level = config.level.into();
    let filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::from_level(level).into())
        .from_env_lossy();

    let layer = match (config.json_format, config.include_timestamps) {
        (true, true) => fmt::layer()
            .json()
            .with_target(config.include_targets)
            .boxed(),
        (true, false) => fmt::layer()
            .json()
            .without_time()
            .with_target(config.include_targets)
            .boxed(),
        (false, true) => fmt::layer()
            .with_ansi(config.colored)
            .with_target(config.include_targets)
            .boxed(),
        (false, false) => fmt::layer()
            .without_time()
            .with_ansi(config.colored)
            .with_target(config.include_targets)
            .boxed(),
    };

    tracing_subscriber::registry()
        .with(layer)
        .with(filter)
        .try_init()
        .is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_monotonic_millis() {
        let mut last = monotonic_millis();
        for _ in 0..1000 {
            let now = monotonic_millis();
            assert!(now >= last);
            last = now;
        }
    }

    #[test]
    fn test_init_tracing_is_idempotent() {
        let config = LoggingConfig::default();
        init_tracing(&config);
        assert!(!init_tracing(&config));
    }
}
