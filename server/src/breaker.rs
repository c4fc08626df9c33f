//! Circuit breaker for upstream provider calls.
//!
//! One instance guards one upstream endpoint for the whole process.
//! State is not persisted; a restart enters CLOSED.

use std::future::Future;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::config::BreakerConfig;

/// Circuit breaker states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operation.
    Closed,

    /// Failing; calls are rejected without reaching upstream.
    Open,

    /// A single probe call is allowed through.
    HalfOpen,
}

/// Outcome of a call placed through the breaker.
#[derive(Debug)]
pub enum BreakerError<E> {
    /// The circuit is open; upstream was not called.
    Open {
        /// Seconds until the next probe is allowed.
        retry_after: u64,
    },

    /// The call went through and failed.
    Inner(E),
}

/// Snapshot of the breaker state for monitoring.
#[derive(Debug, Clone, Serialize)]
pub struct BreakerSnapshot {
    pub state: CircuitState,
    pub failure_count: u32,
    pub failure_threshold: u32,
    pub open_timeout_secs: u64,
    pub retry_after_secs: u64,
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    failure_count: u32,
    last_failure: Option<Instant>,
}

/// A circuit breaker.
///
/// The mutex is only held for state inspection and bookkeeping; it is
/// never held across the guarded call itself.
#[derive(Debug)]
pub struct CircuitBreaker {
    failure_threshold: u32,
    open_timeout: Duration,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(config: &BreakerConfig) -> Self {
        Self {
            failure_threshold: config.failure_threshold,
            open_timeout: config.open_timeout,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                failure_count: 0,
                last_failure: None,
            }),
        }
    }

    /// Places a call through the breaker.
    ///
    /// When the circuit is open the future is never constructed and
    /// upstream is not contacted.
    pub async fn call<F, Fut, T, E>(&self, f: F) -> Result<T, BreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.check()?;

        match f().await {
            Ok(value) => {
                self.on_success();
                Ok(value)
            }
            Err(error) => {
                self.on_failure();
                Err(BreakerError::Inner(error))
            }
        }
    }

    /// Returns the current state for monitoring.
    pub fn snapshot(&self) -> BreakerSnapshot {
        let inner = self.inner.lock().unwrap();

        BreakerSnapshot {
            state: inner.state,
            failure_count: inner.failure_count,
            failure_threshold: self.failure_threshold,
            open_timeout_secs: self.open_timeout.as_secs(),
            retry_after_secs: self.retry_after(&inner),
        }
    }

    fn check<E>(&self) -> Result<(), BreakerError<E>> {
        let mut inner = self.inner.lock().unwrap();

        if inner.state == CircuitState::Open {
            if self.should_attempt_reset(&inner) {
                tracing::info!("Upstream circuit attempting reset (half-open)");
                inner.state = CircuitState::HalfOpen;
            } else {
                return Err(BreakerError::Open {
                    retry_after: self.retry_after(&inner),
                });
            }
        }

        Ok(())
    }

    fn on_success(&self) {
        let mut inner = self.inner.lock().unwrap();

        match inner.state {
            CircuitState::HalfOpen => {
                tracing::info!("Upstream recovered, closing circuit");
                inner.state = CircuitState::Closed;
                inner.failure_count = 0;
            }
            CircuitState::Closed => {
                inner.failure_count = 0;
            }
            CircuitState::Open => {}
        }
    }

    fn on_failure(&self) {
        let mut inner = self.inner.lock().unwrap();

        inner.failure_count += 1;
        inner.last_failure = Some(Instant::now());

        match inner.state {
            CircuitState::HalfOpen => {
                tracing::warn!("Upstream probe failed, opening circuit again");
                inner.state = CircuitState::Open;
            }
            CircuitState::Closed => {
                if inner.failure_count >= self.failure_threshold {
                    tracing::warn!(
                        failure_count = inner.failure_count,
                        failure_threshold = self.failure_threshold,
                        "Upstream failure threshold reached, opening circuit"
                    );
                    inner.state = CircuitState::Open;
                }
            }
            CircuitState::Open => {}
        }
    }

    fn should_attempt_reset(&self, inner: &BreakerInner) -> bool {
        match inner.last_failure {
            Some(last_failure) => last_failure.elapsed() >= self.open_timeout,
            None => true,
        }
    }

    fn retry_after(&self, inner: &BreakerInner) -> u64 {
        match inner.last_failure {
            Some(last_failure) => {
                let elapsed = last_failure.elapsed();
                self.open_timeout.saturating_sub(elapsed).as_secs()
            }
            None => 0,
        }
    }
}
