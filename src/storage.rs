//! Shared Redis plumbing
//!
//! One pool serves the credential and post stores. Operations run with a
//! 5 s deadline; transient connection failures are retried up to three
//! times inside a single logical operation before surfacing.

use std::future::Future;
use std::time::Duration;

use deadpool_redis::{Config, PoolConfig, Runtime, Timeouts};
use tracing::warn;

use crate::config::HarvesterConfig;
use crate::error::{HarvestError, Result};

const OP_TIMEOUT: Duration = Duration::from_secs(5);
const TRANSIENT_ATTEMPTS: u32 = 3;

/// Build the shared connection pool (size from config, 5 s timeouts).
pub fn create_pool(config: &HarvesterConfig) -> Result<deadpool_redis::Pool> {
    let mut pool_config = Config::from_url(&config.redis_url);
    pool_config.pool = Some(PoolConfig {
        max_size: config.redis_pool_size,
        timeouts: Timeouts {
            wait: Some(OP_TIMEOUT),
            create: Some(OP_TIMEOUT),
            recycle: Some(OP_TIMEOUT),
        },
        ..Default::default()
    });

    pool_config
        .create_pool(Some(Runtime::Tokio1))
        .map_err(|e| HarvestError::RedisConnection(format!("create pool: {e}")))
}

/// Run `op` with retry on transient connection errors.
///
/// Non-connection errors (serialization, domain) pass through on the first
/// attempt; each retry backs off briefly to let a flapping connection
/// settle.
pub async fn retrying<T, F, Fut>(operation: &'static str, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut last: Option<HarvestError> = None;
    for attempt in 1..=TRANSIENT_ATTEMPTS {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err @ HarvestError::RedisConnection(_)) => {
                warn!(operation, attempt, error = %err, "transient redis failure");
                last = Some(err);
                tokio::time::sleep(Duration::from_millis(100 * u64::from(attempt))).await;
            }
            Err(other) => return Err(other),
        }
    }
    Err(last.unwrap_or_else(|| {
        HarvestError::RedisConnection(format!("{operation}: retries exhausted"))
    }))
}
