use std::future::Future;
use std::time::Duration;

use rand::Rng;

use super::StoreError;
use crate::config::RetrievalConfig;

/// Timeout and retry budget applied to every accessor call.
#[derive(Debug, Clone, Copy)]
pub struct CallPolicy {
    pub timeout: Duration,
    /// Retries after the first attempt.
    pub max_retries: u32,
    pub base_backoff: Duration,
}

impl CallPolicy {
    pub fn from_config(config: &RetrievalConfig) -> Self {
        Self {
            timeout: config.call_timeout(),
            max_retries: config.max_retries,
            base_backoff: config.retry_backoff(),
        }
    }

    /// `base * 2^attempt` plus up to 50% random jitter.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let base = self.base_backoff.saturating_mul(1u32 << attempt.min(16));
        let jitter_cap = (base.as_millis() as u64 / 2).max(1);
        let jitter = rand::thread_rng().gen_range(0..=jitter_cap);
        base + Duration::from_millis(jitter)
    }
}

impl Default for CallPolicy {
    fn default() -> Self {
        Self::from_config(&RetrievalConfig::default())
    }
}

/// Run `call` under the policy's timeout, retrying transient failures.
/// Non-transient errors propagate immediately.
pub async fn call_with_retry<T, F, Fut>(
    policy: &CallPolicy,
    operation: &'static str,
    mut call: F,
) -> Result<T, StoreError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, StoreError>>,
{
    let mut attempt = 0;
    loop {
        let result = match tokio::time::timeout(policy.timeout, call()).await {
            Ok(result) => result,
            Err(_) => Err(StoreError::Timeout(policy.timeout)),
        };

        match result {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() && attempt < policy.max_retries => {
                let delay = policy.backoff(attempt);
                tracing::warn!(
                    operation,
                    attempt = attempt + 1,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Store call failed, retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}
