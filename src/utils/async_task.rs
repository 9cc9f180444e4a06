use std::future::Future;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::error;
use tracing::warn;

use crate::BackoffPolicy;
use crate::Error;
use crate::Result;

/// Runs `task` until it succeeds or `policy.max_retries` attempts failed.
///
/// The delay doubles after each failure, capped at `policy.max_delay_ms`.
/// The last error is returned once attempts are exhausted.
pub(crate) async fn task_with_exponential_backoff<F, T, P>(
    name: &str,
    task: F,
    policy: BackoffPolicy,
) -> Result<P>
where
    F: Fn() -> T,
    T: Future<Output = Result<P>>,
{
    let attempts = policy.max_retries.max(1);
    let mut last_err = Error::Fatal(format!("{name}: no attempt made"));
    for attempt in 0..attempts {
        match task().await {
            Ok(r) => return Ok(r),
            Err(e) => {
                warn!(task = name, attempt, "failed with error: {:?}", e);
                last_err = e;
            }
        }
        if attempt + 1 < attempts {
            sleep(policy.delay_for(attempt)).await;
        }
    }
    warn!("{name} failed after {attempts} attempts");
    Err(last_err)
}

/// Sleeps for `d` unless `token` is cancelled first.
///
/// Returns `true` if the full duration elapsed.
pub(crate) async fn sleep_or_cancel(
    d: Duration,
    token: &CancellationToken,
) -> bool {
    tokio::select! {
        _ = token.cancelled() => false,
        _ = sleep(d) => true,
    }
}

// Helper function to spawn tasks and track their JoinHandles
pub(crate) fn spawn_task<F, Fut>(
    name: &str,
    task_fn: F,
    handles: Option<&mut Vec<JoinHandle<()>>>,
) where
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    let name = name.to_string();
    let handle = tokio::spawn(async move {
        if let Err(e) = task_fn().await {
            error!("spawned task: {name} stopped or encountered an error: {:?}", e);
        }
    });

    if let Some(h) = handles {
        h.push(handle);
    }
}
