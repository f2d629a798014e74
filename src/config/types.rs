//! Core configuration types
//!
//! `HarvesterConfig` carries everything the process needs to reach its
//! collaborators: the Redis data plane, the browser-automation sidecar, and
//! the on-disk log/export directories.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::{HarvestError, Result};

const ENV_REDIS_URL: &str = "WEIBO_HARVESTER_REDIS_URL";
const ENV_NAMESPACE: &str = "WEIBO_HARVESTER_NAMESPACE";
const ENV_SIDECAR_CMD: &str = "WEIBO_HARVESTER_SIDECAR_CMD";
const ENV_SIDECAR_WS_URL: &str = "WEIBO_HARVESTER_SIDECAR_WS_URL";
const ENV_SIDECAR_HEALTH_URL: &str = "WEIBO_HARVESTER_SIDECAR_HEALTH_URL";
const ENV_LOG_DIR: &str = "WEIBO_HARVESTER_LOG_DIR";
const ENV_EXPORT_DIR: &str = "WEIBO_HARVESTER_EXPORT_DIR";
const ENV_LOG_LEVEL: &str = "WEIBO_HARVESTER_LOG_LEVEL";

/// Process-level configuration, sourced from the environment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HarvesterConfig {
    /// Connection string for the Redis data plane
    pub redis_url: String,
    /// Key namespace prefix for every persisted record
    pub namespace: String,
    /// Launcher command for the browser-automation sidecar
    pub sidecar_command: String,
    /// Extra arguments passed to the launcher
    pub sidecar_args: Vec<String>,
    /// WebSocket endpoint of the sidecar control channel
    pub sidecar_ws_url: String,
    /// Local HTTP health endpoint exposed by the sidecar
    pub sidecar_health_url: String,
    /// Directory receiving daily-rotated JSON log files
    pub log_dir: PathBuf,
    /// Directory receiving export files
    pub export_dir: PathBuf,
    /// Log filter (overridden by `RUST_LOG` when set)
    pub log_level: String,
    /// Size of the shared Redis connection pool
    pub redis_pool_size: usize,
}

impl Default for HarvesterConfig {
    fn default() -> Self {
        Self {
            redis_url: "redis://127.0.0.1:6379".to_string(),
            namespace: "weibo".to_string(),
            sidecar_command: "playwright-sidecar".to_string(),
            sidecar_args: Vec::new(),
            sidecar_ws_url: "ws://127.0.0.1:9223/control".to_string(),
            sidecar_health_url: "http://127.0.0.1:9224/health".to_string(),
            log_dir: PathBuf::from("logs"),
            export_dir: PathBuf::from("exports"),
            log_level: "info".to_string(),
            redis_pool_size: 10,
        }
    }
}

impl HarvesterConfig {
    /// Load configuration from the environment, falling back to defaults.
    ///
    /// Endpoint URLs are validated eagerly so a typo fails at startup rather
    /// than on first use.
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();

        let config = Self {
            redis_url: env_or(ENV_REDIS_URL, defaults.redis_url),
            namespace: env_or(ENV_NAMESPACE, defaults.namespace),
            sidecar_command: env_or(ENV_SIDECAR_CMD, defaults.sidecar_command),
            sidecar_args: Vec::new(),
            sidecar_ws_url: env_or(ENV_SIDECAR_WS_URL, defaults.sidecar_ws_url),
            sidecar_health_url: env_or(ENV_SIDECAR_HEALTH_URL, defaults.sidecar_health_url),
            log_dir: env_or(ENV_LOG_DIR, defaults.log_dir.display().to_string()).into(),
            export_dir: env_or(ENV_EXPORT_DIR, defaults.export_dir.display().to_string()).into(),
            log_level: env_or(ENV_LOG_LEVEL, defaults.log_level),
            redis_pool_size: defaults.redis_pool_size,
        };

        config.validate()?;
        Ok(config)
    }

    /// Structural validation of endpoint URLs and the namespace.
    pub fn validate(&self) -> Result<()> {
        for (label, value, schemes) in [
            ("redis url", &self.redis_url, &["redis", "rediss"][..]),
            ("sidecar ws url", &self.sidecar_ws_url, &["ws", "wss"][..]),
            (
                "sidecar health url",
                &self.sidecar_health_url,
                &["http", "https"][..],
            ),
        ] {
            let parsed = url::Url::parse(value)
                .map_err(|e| HarvestError::InvalidResponse(format!("{label}: {e}")))?;
            if !schemes.contains(&parsed.scheme()) {
                return Err(HarvestError::InvalidResponse(format!(
                    "{label}: unsupported scheme {}",
                    parsed.scheme()
                )));
            }
        }

        if self.namespace.is_empty() || self.namespace.contains(':') {
            return Err(HarvestError::InvalidResponse(
                "namespace must be non-empty and contain no ':'".to_string(),
            ));
        }

        Ok(())
    }

    /// Replace the namespace (test isolation).
    #[must_use]
    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    /// Replace the export directory (test isolation).
    #[must_use]
    pub fn with_export_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.export_dir = dir.into();
        self
    }
}

fn env_or(key: &str, default: String) -> String {
    match std::env::var(key) {
        Ok(value) if !value.trim().is_empty() => value,
        _ => default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_validates() {
        HarvesterConfig::default().validate().unwrap();
    }

    #[test]
    fn bad_scheme_rejected() {
        let config = HarvesterConfig {
            sidecar_ws_url: "http://127.0.0.1:9223".to_string(),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn namespace_with_separator_rejected() {
        let config = HarvesterConfig::default().with_namespace("a:b");
        assert!(config.validate().is_err());
    }
}
