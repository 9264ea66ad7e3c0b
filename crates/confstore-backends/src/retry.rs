use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use confstore_common::{Result, StoreError, WatchConfig};

/// Backoff policy for the watch retry driver.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    /// `None` retries transient failures until cancelled.
    pub max_retries: Option<u32>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
            max_retries: None,
        }
    }
}

impl From<&WatchConfig> for RetryPolicy {
    fn from(cfg: &WatchConfig) -> Self {
        Self {
            initial_delay: Duration::from_millis(cfg.initial_backoff_ms),
            max_delay: Duration::from_millis(cfg.max_backoff_ms),
            max_retries: cfg.max_retries,
        }
    }
}

/// Drive one native watch primitive until it yields a change, the stop
/// token fires, or an unrecoverable error occurs.
///
/// `op` is invoked with the wait index to watch from. On a retryable
/// (connectivity) failure the driver sleeps an exponentially doubling
/// delay, capped at `policy.max_delay`, then calls `op` again with the
/// same index. A stale-index failure resets the index to 0, meaning
/// "current state", and retries once before propagating. Cancellation
/// returns the original `wait_index` with no error, whether it lands
/// before a call, mid-backoff, or inside `op` itself (an interrupted
/// `op` hands back the possibly-reset index it was called with, which
/// is not what the caller passed us).
///
/// The driver keeps no state across invocations; callers re-enter it
/// through `watch_prefix` to form their reactive loop.
pub async fn watch_with_backoff<F, Fut>(
    policy: &RetryPolicy,
    stop: &CancellationToken,
    wait_index: u64,
    mut op: F,
) -> Result<u64>
where
    F: FnMut(u64) -> Fut,
    Fut: Future<Output = Result<u64>>,
{
    let mut index = wait_index;
    let mut delay = policy.initial_delay;
    let mut retries = 0u32;
    let mut reset_once = false;

    loop {
        if stop.is_cancelled() {
            return Ok(wait_index);
        }

        match op(index).await {
            Ok(next) => {
                if stop.is_cancelled() {
                    return Ok(wait_index);
                }
                return Ok(next);
            }
            Err(err @ StoreError::StaleIndex { .. }) => {
                if reset_once {
                    return Err(err);
                }
                debug!("watch index stale, resetting to current state: {err}");
                reset_once = true;
                index = 0;
            }
            Err(err) if err.is_retryable() => {
                retries += 1;
                if let Some(cap) = policy.max_retries {
                    if retries > cap {
                        return Err(err);
                    }
                }
                warn!("watch attempt failed, retrying in {delay:?}: {err}");
                tokio::select! {
                    _ = stop.cancelled() => return Ok(wait_index),
                    _ = tokio::time::sleep(delay) => {}
                }
                delay = (delay * 2).min(policy.max_delay);
            }
            Err(err) => return Err(err),
        }
    }
}
