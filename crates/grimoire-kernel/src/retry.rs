//! Bounded retry with backoff.
//!
//! Shared by every self-healing call site: critical directory creation at
//! mount, driver probes during heal.

use serde::{Deserialize, Serialize};
use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use crate::events::{EventBus, KernelEvent};

/// How the delay grows between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Backoff {
    Fixed,
    Linear,
    #[default]
    Exponential,
}

/// Retry budget for one operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, the first one included. Zero behaves as one.
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub backoff: Backoff,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(50),
            max_delay: Duration::from_secs(2),
            backoff: Backoff::Exponential,
        }
    }
}

impl RetryPolicy {
    /// Try once, never sleep.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    pub fn with_max_attempts(mut self, n: u32) -> Self {
        self.max_attempts = n;
        self
    }

    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    /// Delay after failed attempt number `attempt` (0-based), capped at
    /// `max_delay`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let delay = match self.backoff {
            Backoff::Fixed => self.initial_delay,
            Backoff::Linear => self.initial_delay.saturating_mul(attempt.saturating_add(1)),
            Backoff::Exponential => self
                .initial_delay
                .saturating_mul(2u32.saturating_pow(attempt.min(16))),
        };
        delay.min(self.max_delay)
    }

    /// Run `op` until it succeeds or the attempts run out. Returns the last
    /// error. Each failed attempt is logged and, with a bus, emitted as
    /// `retry.attempt`.
    pub async fn retry<T, E, F, Fut>(&self, name: &str, bus: Option<&EventBus>, mut op: F) -> Result<T, E>
    where
        E: Display,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let attempts = self.max_attempts.max(1);
        let mut attempt = 0;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) => {
                    attempt += 1;
                    tracing::warn!(operation = name, attempt, max = attempts, error = %e, "attempt failed");
                    if let Some(bus) = bus {
                        bus.emit(KernelEvent::RetryAttempt {
                            operation: name.to_string(),
                            attempt,
                            reason: e.to_string(),
                        });
                    }
                    if attempt >= attempts {
                        return Err(e);
                    }
                    tokio::time::sleep(self.delay_for(attempt - 1)).await;
                }
            }
        }
    }
}
