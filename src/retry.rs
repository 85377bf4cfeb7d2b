//! Whole-flow retry.
//!
//! Re-runs an entire generation (upload, submit, poll) after a retryable
//! failure. Business outcomes and caller errors propagate on the first
//! occurrence; see [`JimengError::is_retryable`].

use std::future::Future;

use crate::config::RetryPolicy;
use crate::error::Result;

/// Run `flow` up to `1 + policy.max_retries` times.
///
/// `flow` receives the zero-based run number. The last error is returned
/// unchanged once runs are exhausted.
pub async fn with_retry<T, F, Fut>(policy: &RetryPolicy, label: &str, mut flow: F) -> Result<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut run = 0u32;
    loop {
        match flow(run).await {
            Ok(value) => return Ok(value),
            Err(err) if !err.is_retryable() => return Err(err),
            Err(err) if run >= policy.max_retries => {
                tracing::error!(label, runs = run + 1, error = %err, "giving up");
                return Err(err);
            },
            Err(err) => {
                run += 1;
                tracing::warn!(
                    label,
                    retry = run,
                    max_retries = policy.max_retries,
                    correlation_id = err.correlation_id().unwrap_or("-"),
                    error = %err,
                    "flow failed, retrying"
                );
                tokio::time::sleep(policy.delay()).await;
            },
        }
    }
}
