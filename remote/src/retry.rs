use common::Backoff;

/// Bounded retry of an async operation with a fixed or exponentially growing wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Attempts in total, including the first one; values below 1 mean 1.
    pub max_attempts: u32,
    pub interval: std::time::Duration,
    pub backoff: Backoff,
}

impl RetryPolicy {
    pub fn from_config(config: &common::RunConfig) -> Self {
        Self {
            max_attempts: config.connect_retry,
            interval: config.retry_interval,
            backoff: config.retry_backoff,
        }
    }

    /// Single attempt, no waiting.
    pub fn once() -> Self {
        Self {
            max_attempts: 1,
            interval: std::time::Duration::ZERO,
            backoff: Backoff::Fixed,
        }
    }

    /// Wait after the failed attempt number `attempt` (1-based).
    pub fn delay(&self, attempt: u32) -> std::time::Duration {
        match self.backoff {
            Backoff::Fixed => self.interval,
            Backoff::Exponential => {
                let factor = 1u32 << attempt.saturating_sub(1).min(16);
                self.interval.saturating_mul(factor)
            }
        }
    }

    /// Runs `op` until it succeeds or the attempts are used up, returning the last error.
    ///
    /// `op` receives the 1-based attempt number. Every failure is logged under `what`.
    pub async fn run<T, E, F, Fut>(&self, what: &str, mut op: F) -> Result<T, E>
    where
        E: std::fmt::Display,
        F: FnMut(u32) -> Fut,
        Fut: std::future::Future<Output = Result<T, E>>,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match op(attempt).await {
                Ok(value) => {
                    if attempt > 1 {
                        tracing::info!("{}: succeeded on attempt {}", what, attempt);
                    }
                    return Ok(value);
                }
                Err(error) if attempt >= max_attempts => {
                    tracing::error!(
                        "{}: attempt {}/{} failed, giving up: {:#}",
                        what,
                        attempt,
                        max_attempts,
                        error
                    );
                    return Err(error);
                }
                Err(error) => {
                    let delay = self.delay(attempt);
                    tracing::warn!(
                        "{}: attempt {}/{} failed: {:#}, retrying in {}",
                        what,
                        attempt,
                        max_attempts,
                        error,
                        humantime::format_duration(delay)
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}
