use std::future::Future;
use std::time::Duration;

use chrono::Utc;
use rand::Rng;
use serde_json::Value as JsonValue;
use tracing::{debug, error, warn};

use super::dlq::DeadLetterQueue;
use crate::store::DeadLetterEntry;
use crate::{Error, ErrorKind, Result};

#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Retries after the initial attempt.
    pub max_retries: u32,
    /// Delay before the first retry.
    pub base_delay: Duration,
    /// Cap applied before jitter.
    pub max_delay: Duration,
    /// Growth factor between consecutive delays.
    pub exponential_base: f64,
    /// Random spread applied to each delay, as a fraction of the delay.
    pub jitter: f64,
    /// Error kinds worth retrying; anything else fails immediately.
    pub retryable: Vec<ErrorKind>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            exponential_base: 2.0,
            jitter: 0.1,
            retryable: vec![
                ErrorKind::Transient,
                ErrorKind::Storage,
                ErrorKind::CircuitOpen,
            ],
        }
    }
}

/// Delay before the given attempt number, where attempt 2 is the first retry.
/// Grows by `exponential_base` per attempt and is capped at `max_delay`.
pub fn backoff_delay(config: &RetryConfig, attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(2) as i32;
    let raw = config.base_delay.as_secs_f64() * config.exponential_base.powi(exponent);
    let capped = raw.min(config.max_delay.as_secs_f64());
    Duration::from_secs_f64(capped)
}

/// Spread `delay` by up to ±`jitter` using a uniform sample from [0, 1).
pub fn apply_jitter(delay: Duration, jitter: f64, sample: f64) -> Duration {
    let factor = 1.0 + jitter * (2.0 * sample - 1.0);
    delay.mul_f64(factor.max(0.0))
}

/// What happened to one job after the retry loop finished with it.
#[derive(Debug)]
pub struct RetryOutcome<T> {
    /// Present on success.
    pub value: Option<T>,
    /// Attempts actually made, including the first.
    pub attempts: u32,
    pub error: Option<String>,
    /// True when the job was parked on the dead letter queue.
    pub dead_lettered: bool,
}

impl<T> RetryOutcome<T> {
    pub fn succeeded(&self) -> bool {
        self.value.is_some()
    }
}

/// Runs jobs with exponential backoff and parks exhausted ones on the dead
/// letter queue.
pub struct RetryHandler {
    config: RetryConfig,
    dlq: DeadLetterQueue,
}

impl RetryHandler {
    pub fn new(config: RetryConfig, dlq: DeadLetterQueue) -> Self {
        Self { config, dlq }
    }

    pub fn dlq(&self) -> &DeadLetterQueue {
        &self.dlq
    }

    /// Run `op` up to `1 + max_retries` times. Non-retryable errors fail the
    /// job on the spot; exhaustion dead-letters `job_data` on `queue`.
    pub async fn run<T, F, Fut>(&self, queue: &str, job_data: JsonValue, mut op: F) -> RetryOutcome<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let total_attempts = self.config.max_retries + 1;
        let mut last_error: Option<Error> = None;

        for attempt in 1..=total_attempts {
            if attempt > 1 {
                let delay = apply_jitter(
                    backoff_delay(&self.config, attempt),
                    self.config.jitter,
                    rand::thread_rng().gen::<f64>(),
                );
                debug!(
                    "Retrying '{}' job in {:?} (attempt {}/{})",
                    queue, delay, attempt, total_attempts
                );
                tokio::time::sleep(delay).await;
            }

            match op().await {
                Ok(value) => {
                    return RetryOutcome {
                        value: Some(value),
                        attempts: attempt,
                        error: None,
                        dead_lettered: false,
                    };
                }
                Err(e) if !self.config.retryable.contains(&e.kind()) => {
                    warn!("'{}' job failed with non-retryable error: {}", queue, e);
                    return RetryOutcome {
                        value: None,
                        attempts: attempt,
                        error: Some(e.to_string()),
                        dead_lettered: false,
                    };
                }
                Err(e) => {
                    warn!(
                        "'{}' job attempt {}/{} failed: {}",
                        queue, attempt, total_attempts, e
                    );
                    last_error = Some(e);
                }
            }
        }

        let error = last_error
            .map(|e| e.to_string())
            .unwrap_or_else(|| "retries exhausted".to_string());
        let entry = DeadLetterEntry {
            original_job: job_data,
            error: error.clone(),
            attempts: total_attempts,
            failed_at: Utc::now(),
        };

        // A failed push is reported but does not turn into a second failure
        // path for the caller; the job outcome is already a failure.
        let dead_lettered = match self.dlq.push(queue, &entry).await {
            Ok(_) => true,
            Err(push_err) => {
                error!("Failed to dead-letter '{}' job: {}", queue, push_err);
                false
            }
        };

        RetryOutcome {
            value: None,
            attempts: total_attempts,
            error: Some(error),
            dead_lettered,
        }
    }
}
