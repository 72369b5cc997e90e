use std::{future::Future, time::Duration};

use tracing::{debug, warn};

use crate::shared::{
    Shutdown,
    config::{BackoffKind, TransportConfig},
};

/// Bounded retry with fixed or doubling backoff.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub backoff: BackoffKind,
    /// Cap applied to exponential growth.
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_transport(&TransportConfig::default())
    }
}

/// Why a retried operation gave up.
#[derive(Debug)]
pub enum RetryError<E> {
    /// Every attempt failed with a retryable error.
    Exhausted { attempts: u32, last: E },
    /// The predicate classified the error as permanent.
    Fatal { attempt: u32, error: E },
    /// The shutdown signal fired between attempts.
    Cancelled { attempts: u32 },
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration, backoff: BackoffKind) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            backoff,
            max_delay: Duration::from_secs(5),
        }
    }

    pub fn from_transport(config: &TransportConfig) -> Self {
        Self::new(
            config.max_attempts,
            Duration::from_millis(config.base_delay_ms),
            config.backoff,
        )
    }

    /// Delay to wait after the `attempt`-th failure (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let delay = match self.backoff {
            BackoffKind::Fixed => self.base_delay,
            BackoffKind::Exponential => {
                let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
                self.base_delay.saturating_mul(factor)
            }
        };
        delay.min(self.max_delay)
    }

    /// Runs `op` until it succeeds, fails permanently, or attempts run out.
    ///
    /// `op` receives the 1-based attempt number. Only errors accepted by
    /// `is_retryable` are retried.
    pub async fn run<T, E, F, Fut, P>(&self, op: F, is_retryable: P) -> Result<T, RetryError<E>>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        P: Fn(&E) -> bool,
        E: std::fmt::Display,
    {
        self.run_until(op, is_retryable, &Shutdown::never()).await
    }

    /// Same as [`RetryPolicy::run`], abandoning the backoff sleep on shutdown.
    pub async fn run_until<T, E, F, Fut, P>(
        &self,
        mut op: F,
        is_retryable: P,
        shutdown: &Shutdown,
    ) -> Result<T, RetryError<E>>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        P: Fn(&E) -> bool,
        E: std::fmt::Display,
    {
        let mut shutdown = shutdown.clone();
        let mut attempt = 0;

        loop {
            if shutdown.is_triggered() {
                return Err(RetryError::Cancelled { attempts: attempt });
            }
            attempt += 1;

            match op(attempt).await {
                Ok(value) => {
                    if attempt > 1 {
                        debug!("Succeeded on attempt {}/{}", attempt, self.max_attempts);
                    }
                    return Ok(value);
                }
                Err(error) if !is_retryable(&error) => {
                    return Err(RetryError::Fatal { attempt, error });
                }
                Err(error) if attempt >= self.max_attempts => {
                    warn!("Giving up after {} attempt(s): {}", attempt, error);
                    return Err(RetryError::Exhausted {
                        attempts: attempt,
                        last: error,
                    });
                }
                Err(error) => {
                    let delay = self.delay_for(attempt);
                    debug!(
                        "Attempt {}/{} failed: {}; retrying in {:?}",
                        attempt, self.max_attempts, error, delay
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = shutdown.cancelled() => {
                            return Err(RetryError::Cancelled { attempts: attempt });
                        }
                    }
                }
            }
        }
    }
}
