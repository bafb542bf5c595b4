use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

/// Retry decision returned by the error classifier callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryAction {
    Retry,
    Abort,
}

/// Per-operation retry budget: a bounded number of attempts separated by a
/// fixed delay. Not persisted anywhere; each operation starts a fresh budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryConfig {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    pub wait_secs: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            wait_secs: 5,
        }
    }
}

impl RetryConfig {
    pub fn delay(&self) -> Duration {
        Duration::from_secs(self.wait_secs)
    }
}

/// Retry an async operation with a fixed delay between attempts.
///
/// - `classifier` inspects an error and returns `Retry` or `Abort`
/// - `shutdown` is checked before every sleep; a cancelled token ends the
///   loop with the most recent error
///
/// Returns the first `Ok` result, or the last error once the budget is spent,
/// the classifier aborts, or shutdown is requested.
pub async fn retry_fixed<F, Fut, T, E, C>(
    config: &RetryConfig,
    shutdown: &CancellationToken,
    classifier: C,
    operation: F,
) -> Result<T, E>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    C: Fn(&E) -> RetryAction,
    E: std::fmt::Display,
{
    let total_attempts = config.max_attempts.max(1);
    let mut attempt = 1;

    loop {
        let err = match operation().await {
            Ok(val) => return Ok(val),
            Err(e) => e,
        };
        if classifier(&err) == RetryAction::Abort
            || attempt >= total_attempts
            || shutdown.is_cancelled()
        {
            return Err(err);
        }
        tracing::warn!(
            "Connection failed, retrying after {} seconds (attempt {}/{}): {}",
            config.wait_secs,
            attempt,
            total_attempts,
            err
        );
        tokio::select! {
            _ = tokio::time::sleep(config.delay()) => {}
            _ = shutdown.cancelled() => return Err(err),
        }
        attempt += 1;
    }
}
