use std::future::Future;
use std::time::Duration;

use tracing::warn;

use trail_core::PipelineError;

/// Bounded retry for server errors. Delays are indexed by attempt; the last
/// delay repeats when `max_retries` exceeds the table.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub backoff: Vec<Duration>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_secs(3, &[4, 9, 16])
    }
}

impl RetryPolicy {
    pub fn from_secs(max_retries: u32, backoff_secs: &[u64]) -> Self {
        Self {
            max_retries,
            backoff: backoff_secs.iter().copied().map(Duration::from_secs).collect(),
        }
    }

    pub fn none() -> Self {
        Self {
            max_retries: 0,
            backoff: Vec::new(),
        }
    }

    pub fn delay(&self, attempt: u32) -> Duration {
        self.backoff
            .get(attempt as usize)
            .or_else(|| self.backoff.last())
            .copied()
            .unwrap_or_default()
    }

    /// Whether this error is eligible for a backoff retry. Auth failures take
    /// the reauthentication path instead.
    pub fn should_retry(&self, error: &PipelineError, attempt: u32) -> bool {
        error.is_server_error() && attempt < self.max_retries
    }

    /// Run `op` until it succeeds, fails with a non-retryable error, or the
    /// budget is spent.
    pub async fn run<T, F, Fut>(&self, mut op: F) -> Result<T, PipelineError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, PipelineError>>,
    {
        let mut attempt = 0;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if self.should_retry(&e, attempt) => {
                    let delay = self.delay(attempt);
                    warn!(
                        attempt = attempt + 1,
                        max_retries = self.max_retries,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "retrying after error"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn server_error() -> PipelineError {
        PipelineError::InternalServerError {
            status: 500,
            body: "boom".into(),
        }
    }

    #[test]
    fn delay_indexes_table() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay(0), Duration::from_secs(4));
        assert_eq!(policy.delay(2), Duration::from_secs(16));
        assert_eq!(policy.delay(7), Duration::from_secs(16));
        assert_eq!(RetryPolicy::none().delay(0), Duration::ZERO);
    }

    #[test]
    fn only_server_errors_are_retried() {
        let policy = RetryPolicy::default();
        assert!(policy.should_retry(&server_error(), 0));
        assert!(!policy.should_retry(&server_error(), 3));
        assert!(!policy.should_retry(&PipelineError::AuthorizationFailed("x".into()), 0));
        assert!(!policy.should_retry(&PipelineError::Timeout(Duration::from_secs(1)), 0));
    }

    #[tokio::test(start_paused = true)]
    async fn exhausts_after_three_retries() {
        let calls = AtomicU32::new(0);
        let start = tokio::time::Instant::now();
        let result: Result<(), _> = RetryPolicy::default()
            .run(|| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(server_error()) }
            })
            .await;

        assert_eq!(result, Err(server_error()));
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert_eq!(start.elapsed(), Duration::from_secs(4 + 9 + 16));
    }

    #[tokio::test(start_paused = true)]
    async fn recovers_mid_budget() {
        let calls = AtomicU32::new(0);
        let result = RetryPolicy::default()
            .run(|| {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err(server_error())
                    } else {
                        Ok(n)
                    }
                }
            })
            .await;
        assert_eq!(result, Ok(2));
    }
}
