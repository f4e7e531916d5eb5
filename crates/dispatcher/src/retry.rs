use std::future::Future;

use bulksend_core::config::StoreRetryConfig;
use bulksend_core::error::{StoreError, StoreResult};
use tracing::warn;

/// Run a store operation, retrying `Unavailable` failures with exponential
/// backoff. Any other error is returned immediately.
pub(crate) async fn with_retry<T, F, Fut>(
    policy: &StoreRetryConfig,
    operation: &'static str,
    mut op: F,
) -> StoreResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = StoreResult<T>>,
{
    let mut attempt = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(StoreError::Unavailable(reason)) if attempt < policy.max_retries => {
                let backoff = policy.backoff_for_attempt(attempt);
                warn!(
                    operation,
                    attempt = attempt + 1,
                    backoff_ms = backoff.as_millis() as u64,
                    error = %reason,
                    "Store write failed, retrying"
                );
                metrics::counter!("dispatch.store_retries", "operation" => operation).increment(1);
                tokio::time::sleep(backoff).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}
