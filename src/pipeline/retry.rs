use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;

use super::llm::LlmError;
use crate::config::RetryConfig;

/// Suspends between retry attempts. Injected so tests can observe the
/// backoff schedule without waiting.
#[async_trait]
pub trait Sleeper: Send + Sync {
    async fn sleep(&self, duration: Duration);
}

pub struct TokioSleeper;

#[async_trait]
impl Sleeper for TokioSleeper {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Records requested delays and returns immediately.
#[derive(Default)]
pub struct RecordingSleeper {
    delays: Mutex<Vec<Duration>>,
}

impl RecordingSleeper {
    pub fn delays(&self) -> Vec<Duration> {
        self.delays
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl Sleeper for RecordingSleeper {
    async fn sleep(&self, duration: Duration) {
        self.delays
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(duration);
    }
}

/// Bounded exponential backoff for LLM calls.
///
/// Delay before attempt `n + 1` is `min(base * 2^(n-1), cap)`. Only errors
/// accepted by `retryable` are retried; everything else returns at once.
#[derive(Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub retryable: fn(&LlmError) -> bool,
    sleeper: Arc<dyn Sleeper>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

impl RetryPolicy {
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base_delay: Duration::from_millis(config.base_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
            retryable: LlmError::is_transient,
            sleeper: Arc::new(TokioSleeper),
        }
    }

    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    pub fn with_predicate(mut self, retryable: fn(&LlmError) -> bool) -> Self {
        self.retryable = retryable;
        self
    }

    /// Delay after the `failed_attempt`-th failure (1-based).
    pub fn delay_for(&self, failed_attempt: u32) -> Duration {
        let exp = failed_attempt.saturating_sub(1).min(31);
        self.base_delay
            .saturating_mul(1u32 << exp)
            .min(self.max_delay)
    }

    pub async fn run<F, Fut, T>(&self, mut op: F) -> Result<T, LlmError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, LlmError>>,
    {
        let mut attempt = 1;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if (self.retryable)(&e) && attempt < self.max_attempts => {
                    let delay = self.delay_for(attempt);
                    tracing::warn!(
                        attempt,
                        max_attempts = self.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "LLM call failed, retrying"
                    );
                    self.sleeper.sleep(delay).await;
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
    use crate::pipeline::llm::{LlmClient, MockLlmClient};

    fn policy(sleeper: Arc<RecordingSleeper>) -> RetryPolicy {
        RetryPolicy::default().with_sleeper(sleeper)
    }

    #[test]
    fn backoff_doubles_then_caps() {
        let p = RetryPolicy::default();
        assert_eq!(p.delay_for(1), Duration::from_secs(2));
        assert_eq!(p.delay_for(2), Duration::from_secs(4));
        assert_eq!(p.delay_for(3), Duration::from_secs(8));
        assert_eq!(p.delay_for(4), Duration::from_secs(10));
        assert_eq!(p.delay_for(40), Duration::from_secs(10));
    }

    #[tokio::test]
    async fn transient_errors_retried_until_success() {
        let sleeper = Arc::new(RecordingSleeper::default());
        let client = MockLlmClient::scripted(vec![
            Err(LlmError::Timeout("t".into())),
            Err(LlmError::Connection("c".into())),
            Ok("done".into()),
        ]);

        let out = policy(sleeper.clone())
            .run(|| client.invoke("p"))
            .await
            .unwrap();
        assert_eq!(out, "done");
        assert_eq!(client.calls(), 3);
        assert_eq!(
            sleeper.delays(),
            vec![Duration::from_secs(2), Duration::from_secs(4)]
        );
    }

    #[tokio::test]
    async fn exhaustion_returns_last_error() {
        let sleeper = Arc::new(RecordingSleeper::default());
        let client = MockLlmClient::scripted(vec![
            Err(LlmError::Network("1".into())),
            Err(LlmError::Network("2".into())),
            Err(LlmError::Network("3".into())),
            Ok("never".into()),
        ]);

        let err = policy(sleeper.clone())
            .run(|| client.invoke("p"))
            .await
            .unwrap_err();
        assert_eq!(err, LlmError::Network("3".into()));
        assert_eq!(client.calls(), 3);
        assert_eq!(sleeper.delays().len(), 2);
    }

    #[tokio::test]
    async fn non_transient_errors_not_retried() {
        let sleeper = Arc::new(RecordingSleeper::default());
        let client = MockLlmClient::scripted(vec![
            Err(LlmError::MalformedResponse("bad body".into())),
            Ok("never".into()),
        ]);

        let err = policy(sleeper.clone())
            .run(|| client.invoke("p"))
            .await
            .unwrap_err();
        assert!(matches!(err, LlmError::MalformedResponse(_)));
        assert_eq!(client.calls(), 1);
        assert!(sleeper.delays().is_empty());
    }

    #[tokio::test]
    async fn custom_predicate_is_honoured() {
        let sleeper = Arc::new(RecordingSleeper::default());
        let client = MockLlmClient::scripted(vec![Err(LlmError::Timeout("t".into()))]);
        let err = policy(sleeper)
            .with_predicate(|_| false)
            .run(|| client.invoke("p"))
            .await
            .unwrap_err();
        assert!(err.is_transient());
        assert_eq!(client.calls(), 1);
    }
}
