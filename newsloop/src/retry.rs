//! Exponential backoff retry (C2). Each attempt invokes a fresh closure —
//! the source this spec is distilled from occasionally passed an
//! already-awaited future into its retry helper and silently retried on the
//! same (already-consumed) result. `f` here is `FnMut() -> Future`, so every
//! attempt builds its own future from scratch.

use rand::Rng;
use std::time::Duration;
use tracing::warn;

use crate::errors::ErrorKind;

#[derive(Debug, Clone, Copy)]
pub struct RetryConfig {
    pub base: Duration,
    pub max_delay: Duration,
    pub attempts: u32,
}

impl RetryConfig {
    pub fn new(base: Duration, max_delay: Duration, attempts: u32) -> Self {
        Self { base, max_delay, attempts }
    }

    pub fn default_config() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(60), 3)
    }

    /// Recovery strategy for `server_error`: base=5s, max=120s, 5 attempts.
    pub fn server_error() -> Self {
        Self::new(Duration::from_secs(5), Duration::from_secs(120), 5)
    }

    /// Recovery strategy for `timeout`: 3 attempts at base=2s.
    pub fn timeout() -> Self {
        Self::new(Duration::from_secs(2), Duration::from_secs(60), 3)
    }

    /// Recovery strategy for `database`: base=1s, 3 attempts.
    pub fn database() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(30), 3)
    }

    /// Delay for the given (0-indexed) attempt, with multiplicative jitter
    /// in [0.5, 1.5).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exp = self.base.as_secs_f64() * 2f64.powi(attempt as i32);
        let capped = exp.min(self.max_delay.as_secs_f64());
        let jitter = rand::thread_rng().gen_range(0.5..1.5);
        Duration::from_secs_f64(capped * jitter)
    }
}

/// Run `f` up to `config.attempts` times, retrying only errors classified
/// into `recoverable`. Returns the last error if all attempts are exhausted.
pub async fn retry_with_backoff<F, Fut, T>(
    config: RetryConfig,
    recoverable: &[ErrorKind],
    mut f: F,
) -> anyhow::Result<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = anyhow::Result<T>>,
{
    let mut last_err = None;
    for attempt in 0..config.attempts {
        match f().await {
            Ok(v) => return Ok(v),
            Err(e) => {
                let kind = ErrorKind::classify(&e);
                if !kind.is_recoverable(recoverable) {
                    return Err(e);
                }
                if attempt + 1 < config.attempts {
                    let delay = config.delay_for_attempt(attempt);
                    warn!(attempt = attempt + 1, ?delay, kind = %kind, "retrying after recoverable error");
                    tokio::time::sleep(delay).await;
                }
                last_err = Some(e);
            }
        }
    }
    Err(last_err.unwrap_or_else(|| anyhow::anyhow!("retry loop exhausted with no recorded error")))
}

/// Recovery strategy honoring a `Retry-After` header (seconds) for
/// `rate_limit` errors: wait the indicated duration (or 60s if absent/
/// unparseable), then perform a single retry.
pub async fn retry_rate_limited<F, Fut, T>(retry_after_secs: Option<u64>, f: F) -> anyhow::Result<T>
where
    F: FnOnce() -> Fut,
    Fut: std::future::Future<Output = anyhow::Result<T>>,
{
    let wait = Duration::from_secs(retry_after_secs.unwrap_or(60));
    tokio::time::sleep(wait).await;
    f().await
}

/// Best-effort extraction of a `Retry-After: N` hint from a rendered error
/// chain. The LLM/HTTP clients don't expose a structured header here, so
/// this looks for the convention of the header name followed by a number
/// appearing anywhere in the error's `{:#}` rendering.
fn retry_after_hint(err: &anyhow::Error) -> Option<u64> {
    let text = format!("{:#}", err).to_lowercase();
    let idx = text.find("retry-after")?;
    text[idx..]
        .chars()
        .skip_while(|c| !c.is_ascii_digit())
        .take_while(|c| c.is_ascii_digit())
        .collect::<String>()
        .parse()
        .ok()
}

/// Dispatch to the per-kind recovery strategy of §4.2 after an initial
/// attempt fails, rather than retrying every error the same way. Each kind
/// carries its own wait-then-backoff shape:
/// - `rate_limit`: honor `Retry-After` (else 60s), single retry.
/// - `server_error`: wait 30s, then base=5s/max=120s/5 attempts.
/// - `timeout`: base=2s/3 attempts, no initial wait.
/// - `database`: wait 2s, then base=1s/3 attempts (the caller is expected to
///   have disposed/recycled its own connection before calling this).
/// - `auth_error`: no retry, surfaced immediately.
/// - anything else (`network`, `parse_error`, `unknown`): generic
///   `default_config` backoff over just that kind.
pub async fn retry_with_recovery_strategy<F, Fut, T>(mut f: F) -> anyhow::Result<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = anyhow::Result<T>>,
{
    let first_err = match f().await {
        Ok(v) => return Ok(v),
        Err(e) => e,
    };

    let kind = ErrorKind::classify(&first_err);
    match kind {
        ErrorKind::AuthError => Err(first_err),
        ErrorKind::RateLimit => {
            let wait_secs = retry_after_hint(&first_err).unwrap_or(60);
            warn!(wait_secs, "rate limited, waiting before a single retry");
            retry_rate_limited(Some(wait_secs), f).await
        }
        ErrorKind::ServerError => {
            tokio::time::sleep(Duration::from_secs(30)).await;
            retry_with_backoff(RetryConfig::server_error(), &[ErrorKind::ServerError], f).await
        }
        ErrorKind::Timeout => retry_with_backoff(RetryConfig::timeout(), &[ErrorKind::Timeout], f).await,
        ErrorKind::Database => {
            tokio::time::sleep(Duration::from_secs(2)).await;
            retry_with_backoff(RetryConfig::database(), &[ErrorKind::Database], f).await
        }
        other => retry_with_backoff(RetryConfig::default_config(), &[other], f).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn retries_recoverable_errors_until_success() {
        let attempts = AtomicU32::new(0);
        let config = RetryConfig::new(Duration::from_millis(1), Duration::from_millis(5), 3);
        let result = retry_with_backoff(config, &[ErrorKind::Timeout], || {
            let n = attempts.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(anyhow::anyhow!("request timed out"))
                } else {
                    Ok(42)
                }
            }
        })
        .await
        .unwrap();

        assert_eq!(result, 42);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn does_not_retry_unrecoverable_kinds() {
        let attempts = AtomicU32::new(0);
        let config = RetryConfig::default_config();
        let result: anyhow::Result<()> = retry_with_backoff(config, &[ErrorKind::Timeout], || {
            attempts.fetch_add(1, Ordering::SeqCst);
            async { Err(anyhow::anyhow!("401 unauthorized")) }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }
}
