// ABOUTME: Bounded exponential backoff shared by the sync loop, joins and sends.
// ABOUTME: Delays grow 500ms, 1s, 2s... up to a cap; exhaustion is reported to the caller.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;

/// Backoff configuration for transient transport failures
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    /// Starting delay between retries
    #[serde(with = "millis", rename = "initial_delay_ms")]
    pub initial_delay: Duration,
    /// Maximum delay between retries
    #[serde(with = "millis", rename = "max_delay_ms")]
    pub max_delay: Duration,
    /// Multiplier applied to delay after each failure
    pub multiplier: u32,
    /// Consecutive failures tolerated before giving up
    pub max_retries: u32,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            multiplier: 2,
            max_retries: 5,
        }
    }
}

impl BackoffConfig {
    /// Sum of every delay a full retry run can sleep
    pub fn total_delay(&self) -> Duration {
        Backoff::new(self).remaining()
    }
}

/// Retry budget for one operation, or for one run of the sync loop.
///
/// Iterating yields the delays still allowed; `None` means the budget is spent.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    cap: Duration,
    multiplier: u32,
    max_retries: u32,
    failures: u32,
    next: Duration,
}

impl Backoff {
    pub fn new(config: &BackoffConfig) -> Self {
        Self {
            initial: config.initial_delay,
            cap: config.max_delay,
            multiplier: config.multiplier,
            max_retries: config.max_retries,
            failures: 0,
            next: config.initial_delay,
        }
    }

    /// Forget earlier failures after a success
    pub fn reset(&mut self) {
        self.failures = 0;
        self.next = self.initial;
    }

    /// Count a failure; the delay before the next attempt, or `None` once spent
    pub fn fail(&mut self) -> Option<Duration> {
        self.failures = self.failures.saturating_add(1);
        if self.failures > self.max_retries {
            return None;
        }
        let delay = self.next;
        self.next = self.next.saturating_mul(self.multiplier).min(self.cap);
        Some(delay)
    }

    /// Failures counted since the last reset
    pub fn failures(&self) -> u32 {
        self.failures
    }

    /// Total sleep left in the budget
    pub fn remaining(&self) -> Duration {
        self.clone().sum()
    }

    /// Run `op` until it succeeds, fails permanently, or the budget runs out.
    ///
    /// Only [`Error::is_transient`] failures are retried. Exhaustion is reported as
    /// [`Error::Network`] naming the operation.
    pub async fn retry<T, F, Fut>(mut self, operation: &str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        loop {
            let err = match op().await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_transient() => err,
                Err(err) => return Err(err),
            };
            let Some(delay) = self.fail() else {
                tracing::error!(operation, error = %err, "Retries exhausted");
                return Err(Error::Network(format!(
                    "{} failed after {} attempts: {}",
                    operation, self.failures, err
                )));
            };
            tracing::warn!(
                operation,
                attempt = self.failures,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "Transient failure, retrying"
            );
            tokio::time::sleep(delay).await;
        }
    }
}

impl Iterator for Backoff {
    type Item = Duration;

    fn next(&mut self) -> Option<Duration> {
        self.fail()
    }
}

pub(crate) mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}
