use serde::Serialize;
use std::{
    future::Future,
    time::{Duration, Instant},
};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone, Copy)]
pub struct CircuitOptions {
    pub failure_threshold: u32,
    pub success_threshold: u32,
    pub open_timeout: Duration,
}

impl Default for CircuitOptions {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            open_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, Error)]
#[error("Circuit breaker is OPEN: request blocked")]
pub struct CircuitOpen {
    pub breaker: &'static str,
}

#[derive(Debug, Error)]
pub enum CircuitError<E> {
    #[error(transparent)]
    Open(CircuitOpen),
    #[error(transparent)]
    Inner(E),
}

struct Inner {
    state: CircuitState,
    failures: u32,
    successes: u32,
    last_failure: Option<Instant>,
}

pub struct CircuitBreaker {
    name: &'static str,
    options: CircuitOptions,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(name: &'static str, options: CircuitOptions) -> Self {
        Self {
            name,
            options,
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                failures: 0,
                successes: 0,
                last_failure: None,
            }),
        }
    }

    #[cfg(test)]
    pub async fn state(&self) -> CircuitState {
        self.inner.lock().await.state
    }

    /// Runs `call` unless the circuit is open. The lock is not held while `call` runs.
    pub async fn execute<T, E, F, Fut>(&self, call: F) -> Result<T, CircuitError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.before_call().await.map_err(CircuitError::Open)?;
        match call().await {
            Ok(value) => {
                self.on_success().await;
                Ok(value)
            }
            Err(err) => {
                self.on_failure().await;
                Err(CircuitError::Inner(err))
            }
        }
    }

    async fn before_call(&self) -> Result<(), CircuitOpen> {
        let mut inner = self.inner.lock().await;
        if inner.state != CircuitState::Open {
            return Ok(());
        }
        let elapsed = inner
            .last_failure
            .map(|at| at.elapsed())
            .unwrap_or(Duration::MAX);
        if elapsed >= self.options.open_timeout {
            inner.state = CircuitState::HalfOpen;
            inner.successes = 0;
            info!(target = "syncsellr.circuit", breaker = self.name, "circuit half-open");
            Ok(())
        } else {
            Err(CircuitOpen { breaker: self.name })
        }
    }

    async fn on_success(&self) {
        let mut inner = self.inner.lock().await;
        if inner.state == CircuitState::HalfOpen {
            inner.successes += 1;
            if inner.successes >= self.options.success_threshold {
                inner.state = CircuitState::Closed;
                inner.failures = 0;
                inner.successes = 0;
                info!(target = "syncsellr.circuit", breaker = self.name, "circuit closed");
            }
        } else {
            inner.failures = 0;
        }
    }

    async fn on_failure(&self) {
        let mut inner = self.inner.lock().await;
        inner.last_failure = Some(Instant::now());
        if inner.state == CircuitState::HalfOpen {
            inner.state = CircuitState::Open;
            inner.successes = 0;
            warn!(target = "syncsellr.circuit", breaker = self.name, "probe failed; circuit re-opened");
            return;
        }
        inner.failures += 1;
        if inner.failures >= self.options.failure_threshold && inner.state != CircuitState::Open {
            inner.state = CircuitState::Open;
            warn!(
                target = "syncsellr.circuit",
                breaker = self.name,
                failures = inner.failures,
                "circuit opened"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker(timeout_ms: u64) -> CircuitBreaker {
        CircuitBreaker::new(
            "test",
            CircuitOptions {
                failure_threshold: 2,
                success_threshold: 2,
                open_timeout: Duration::from_millis(timeout_ms),
            },
        )
    }

    async fn fail(b: &CircuitBreaker) -> Result<(), CircuitError<&'static str>> {
        b.execute(|| async { Err::<(), _>("boom") }).await
    }

    async fn pass(b: &CircuitBreaker) -> Result<u8, CircuitError<&'static str>> {
        b.execute(|| async { Ok::<_, &'static str>(7) }).await
    }

    #[tokio::test]
    async fn opens_after_threshold_and_blocks() {
        let b = breaker(10_000);
        assert!(matches!(fail(&b).await, Err(CircuitError::Inner("boom"))));
        assert_eq!(b.state().await, CircuitState::Closed);
        fail(&b).await.ok();
        assert_eq!(b.state().await, CircuitState::Open);
        let blocked = pass(&b).await.expect_err("blocked");
        assert!(matches!(blocked, CircuitError::Open(_)));
        assert_eq!(blocked.to_string(), "Circuit breaker is OPEN: request blocked");
    }

    #[tokio::test]
    async fn success_in_closed_resets_failures() {
        let b = breaker(10_000);
        fail(&b).await.ok();
        pass(&b).await.expect("pass");
        fail(&b).await.ok();
        assert_eq!(b.state().await, CircuitState::Closed);
    }

    #[tokio::test]
    async fn half_open_closes_after_successes() {
        let b = breaker(20);
        fail(&b).await.ok();
        fail(&b).await.ok();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(pass(&b).await.expect("probe"), 7);
        assert_eq!(b.state().await, CircuitState::HalfOpen);
        pass(&b).await.expect("second");
        assert_eq!(b.state().await, CircuitState::Closed);
    }

    #[tokio::test]
    async fn failure_in_half_open_reopens() {
        let b = breaker(20);
        fail(&b).await.ok();
        fail(&b).await.ok();
        tokio::time::sleep(Duration::from_millis(30)).await;
        fail(&b).await.ok();
        assert_eq!(b.state().await, CircuitState::Open);
        assert!(matches!(pass(&b).await, Err(CircuitError::Open(_))));
    }
}
