//! Logging initialization and scrubbing helpers
//!
//! Console output plus a daily-rotated JSON file in the configured log
//! directory. Credential-bearing call sites must log cookie NAMES only,
//! via [`cookie_names`].

use std::collections::BTreeMap;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::config::HarvesterConfig;
use crate::error::{HarvestError, Result};

/// Install the global subscriber.
///
/// Returns the appender guard; dropping it flushes and stops the background
/// writer, so the binary holds it for its whole lifetime.
pub fn init(config: &HarvesterConfig) -> Result<WorkerGuard> {
    std::fs::create_dir_all(&config.log_dir)
        .map_err(|e| HarvestError::Serialization(format!("create log dir: {e}")))?;

    let file_appender = tracing_appender::rolling::daily(&config.log_dir, "harvester.log");
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level.clone()));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(true))
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_writer(file_writer),
        )
        .init();

    Ok(guard)
}

/// Render a cookie set as its sorted names, for log output.
///
/// Values never reach the log sink.
#[must_use]
pub fn cookie_names(cookies: &BTreeMap<String, String>) -> String {
    cookies
        .keys()
        .map(String::as_str)
        .collect::<Vec<_>>()
        .join(",")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cookie_names_hides_values() {
        let mut cookies = BTreeMap::new();
        cookies.insert("SUB".to_string(), "secret-token".to_string());
        cookies.insert("SUBP".to_string(), "secret-pair".to_string());

        let rendered = cookie_names(&cookies);
        assert_eq!(rendered, "SUB,SUBP");
        assert!(!rendered.contains("secret"));
    }
}
