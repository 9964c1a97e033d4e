//! Named circuit breakers (C2). One breaker instance guards one external
//! dependency (feed fetch, LLM call, DB statement); each tracks its own
//! consecutive-failure count and open/half-open timing independently.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::errors::{ErrorKind, ErrorStats};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone, Copy)]
pub struct BreakerConfig {
    pub failure_threshold: u32,
    pub success_threshold: u32,
    pub timeout: Duration,
}

impl BreakerConfig {
    pub fn new(failure_threshold: u32, success_threshold: u32, timeout_secs: u64) -> Self {
        Self {
            failure_threshold,
            success_threshold,
            timeout: Duration::from_secs(timeout_secs),
        }
    }

    /// `feed_fetch` breaker default: 5/2/60s per §4.2.
    pub fn feed_fetch() -> Self {
        Self::new(5, 2, 60)
    }

    /// `llm_call` breaker: same thresholds, same 60s timeout per §4.2.
    pub fn llm_call() -> Self {
        Self::new(5, 2, 60)
    }

    /// `db` breaker: 30s timeout per §4.2.
    pub fn db() -> Self {
        Self::new(5, 2, 30)
    }
}

struct Inner {
    state: CircuitState,
    consecutive_failures: u32,
    half_open_successes: u32,
    opened_at: Option<Instant>,
    stats: ErrorStats,
}

/// A single named breaker. Cloning shares the underlying state (it wraps an
/// `Arc<Mutex<_>>`), so a breaker handle can be freely passed into spawned
/// tasks.
#[derive(Clone)]
pub struct CircuitBreaker {
    name: &'static str,
    config: BreakerConfig,
    inner: Arc<Mutex<Inner>>,
}

/// Returned by `CircuitBreaker::guard` before a call is attempted.
pub enum Admission {
    Proceed,
    Rejected,
}

impl CircuitBreaker {
    pub fn new(name: &'static str, config: BreakerConfig) -> Self {
        Self {
            name,
            config,
            inner: Arc::new(Mutex::new(Inner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                half_open_successes: 0,
                opened_at: None,
                stats: ErrorStats::default(),
            })),
        }
    }

    pub async fn state(&self) -> CircuitState {
        self.inner.lock().await.state
    }

    pub async fn stats(&self) -> ErrorStats {
        self.inner.lock().await.stats.clone()
    }

    /// Check whether a call may proceed, flipping OPEN -> HALF_OPEN if the
    /// timeout has elapsed.
    pub async fn admit(&self) -> Admission {
        let mut inner = self.inner.lock().await;
        match inner.state {
            CircuitState::Closed => Admission::Proceed,
            CircuitState::HalfOpen => Admission::Proceed,
            CircuitState::Open => {
                let elapsed = inner.opened_at.map(|t| t.elapsed()).unwrap_or_default();
                if elapsed >= self.config.timeout {
                    info!(breaker = self.name, "circuit half-opening after timeout");
                    inner.state = CircuitState::HalfOpen;
                    inner.half_open_successes = 0;
                    Admission::Proceed
                } else {
                    Admission::Rejected
                }
            }
        }
    }

    pub async fn record_success(&self) {
        let mut inner = self.inner.lock().await;
        inner.stats.record_success();
        match inner.state {
            CircuitState::Closed => {
                inner.consecutive_failures = 0;
            }
            CircuitState::HalfOpen => {
                inner.half_open_successes += 1;
                if inner.half_open_successes >= self.config.success_threshold {
                    info!(breaker = self.name, "circuit closing after successful probes");
                    inner.state = CircuitState::Closed;
                    inner.consecutive_failures = 0;
                    inner.opened_at = None;
                }
            }
            CircuitState::Open => {}
        }
    }

    pub async fn record_failure(&self, kind: ErrorKind) {
        let mut inner = self.inner.lock().await;
        inner.stats.record_error(kind);
        match inner.state {
            CircuitState::Closed => {
                inner.consecutive_failures += 1;
                if inner.consecutive_failures >= self.config.failure_threshold {
                    warn!(breaker = self.name, failures = inner.consecutive_failures, "circuit opening");
                    inner.state = CircuitState::Open;
                    inner.opened_at = Some(Instant::now());
                }
            }
            CircuitState::HalfOpen => {
                warn!(breaker = self.name, "probe failed, circuit re-opening");
                inner.state = CircuitState::Open;
                inner.opened_at = Some(Instant::now());
                inner.half_open_successes = 0;
            }
            CircuitState::Open => {
                inner.opened_at = Some(Instant::now());
            }
        }
    }

    /// Run `f` under this breaker: rejects immediately if OPEN, otherwise
    /// records the outcome and classifies failures via [`ErrorKind`].
    pub async fn call<F, Fut, T>(&self, f: F) -> anyhow::Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = anyhow::Result<T>>,
    {
        match self.admit().await {
            Admission::Rejected => {
                anyhow::bail!("circuit breaker '{}' is open", self.name);
            }
            Admission::Proceed => match f().await {
                Ok(v) => {
                    self.record_success().await;
                    Ok(v)
                }
                Err(e) => {
                    let kind = ErrorKind::classify(&e);
                    self.record_failure(kind).await;
                    Err(e)
                }
            },
        }
    }
}

/// Process-wide registry of named breakers, constructed once in `main` and
/// injected as a value (§9 design note: no module-level singletons).
pub struct BreakerRegistry {
    breakers: Mutex<HashMap<&'static str, CircuitBreaker>>,
}

impl BreakerRegistry {
    pub fn new() -> Self {
        Self {
            breakers: Mutex::new(HashMap::new()),
        }
    }

    pub async fn get_or_create(&self, name: &'static str, config: BreakerConfig) -> CircuitBreaker {
        let mut map = self.breakers.lock().await;
        map.entry(name)
            .or_insert_with(|| CircuitBreaker::new(name, config))
            .clone()
    }

    pub async fn snapshot(&self) -> Vec<(&'static str, CircuitState, ErrorStats)> {
        let map = self.breakers.lock().await;
        let mut out = Vec::with_capacity(map.len());
        for (name, breaker) in map.iter() {
            out.push((*name, breaker.state().await, breaker.stats().await));
        }
        out
    }
}

impl Default for BreakerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn opens_after_threshold_consecutive_failures() {
        let breaker = CircuitBreaker::new("test", BreakerConfig::new(3, 2, 60));
        for _ in 0..3 {
            breaker.record_failure(ErrorKind::Timeout).await;
        }
        assert_eq!(breaker.state().await, CircuitState::Open);
        assert!(matches!(breaker.admit().await, Admission::Rejected));
    }

    #[tokio::test]
    async fn half_open_closes_after_success_threshold() {
        let breaker = CircuitBreaker::new("test", BreakerConfig::new(1, 2, 0));
        breaker.record_failure(ErrorKind::Timeout).await;
        assert_eq!(breaker.state().await, CircuitState::Open);
        // timeout is 0s, so the next admit() flips to half-open immediately
        assert!(matches!(breaker.admit().await, Admission::Proceed));
        assert_eq!(breaker.state().await, CircuitState::HalfOpen);
        breaker.record_success().await;
        assert_eq!(breaker.state().await, CircuitState::HalfOpen);
        breaker.record_success().await;
        assert_eq!(breaker.state().await, CircuitState::Closed);
    }

    #[tokio::test]
    async fn half_open_failure_reopens() {
        let breaker = CircuitBreaker::new("test", BreakerConfig::new(1, 2, 0));
        breaker.record_failure(ErrorKind::Network).await;
        let _ = breaker.admit().await;
        assert_eq!(breaker.state().await, CircuitState::HalfOpen);
        breaker.record_failure(ErrorKind::Network).await;
        assert_eq!(breaker.state().await, CircuitState::Open);
    }
}
