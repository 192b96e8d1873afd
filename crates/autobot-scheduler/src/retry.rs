//! Bounded retries for store calls

use autobot_core::AutobotResult;
use std::future::Future;
use std::time::Duration;
use tracing::warn;

/// Retry policy for transient store failures
#[derive(Debug, Clone, Copy)]
pub struct StoreRetry {
    pub retries: u32,
    pub backoff: Duration,
}

impl StoreRetry {
    pub fn new(retries: u32, backoff: Duration) -> Self {
        Self { retries, backoff }
    }

    /// No retries
    pub fn none() -> Self {
        Self::new(0, Duration::ZERO)
    }

    /// Run `op`, retrying transient errors with linear backoff. Any other
    /// error, or the last transient one, is returned as is.
    pub async fn run<T, F, Fut>(&self, name: &str, mut op: F) -> AutobotResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = AutobotResult<T>>,
    {
        let mut attempt = 0;
        loop {
            match op().await {
                Err(e) if e.is_transient() && attempt < self.retries => {
                    attempt += 1;
                    warn!(op = name, attempt = attempt, error = %e, "Store unavailable, retrying");
                    tokio::time::sleep(self.backoff * attempt).await;
                }
                other => return other,
            }
        }
    }
}
