//! Bounded retry with per-call timeout and exponential backoff.

use std::future::Future;

use tracing::warn;

use hackcrawl_shared::{HackCrawlError, Result, RetryPolicy};

/// Run `call` until it succeeds, fails with a non-retryable error, or
/// `policy.max_attempts` attempts have been made.
///
/// Each attempt is bounded by `policy.call_timeout`; an elapsed timeout
/// counts as a transient failure.
pub async fn with_retry<T, F, Fut>(policy: &RetryPolicy, operation: &str, mut call: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0;
    loop {
        attempt += 1;
        let result = match tokio::time::timeout(policy.call_timeout, call()).await {
            Ok(result) => result,
            Err(_) => Err(HackCrawlError::transient(format!(
                "{operation} timed out after {:?}",
                policy.call_timeout
            ))),
        };

        match result {
            Ok(value) => return Ok(value),
            Err(e) if e.is_retryable() && attempt < policy.max_attempts => {
                let delay = policy.backoff(attempt);
                warn!(operation, attempt, ?delay, error = %e, "call failed, retrying");
                tokio::time::sleep(delay).await;
            }
            Err(e) => return Err(e),
        }
    }
}
