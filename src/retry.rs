//! Fixed-delay retry for network-shaped operations.
//!
//! Sync traffic here is low-frequency and user-initiated, so the policy is
//! deliberately plain: a fixed pause between attempts, no jitter, no
//! exponential growth. The last error is returned unchanged so callers can
//! still classify it (HTTP status, libgit2 error class) after the budget is
//! spent.
//!
//! # Example
//! ```rust,ignore
//! use arcadia_sync::retry::{retry_fixed, RetryConfig};
//!
//! let result = retry_fixed(&RetryConfig::network(), || async {
//!     push_to_remote().await
//! })
//! .await;
//! ```

use std::time::Duration;
use tracing::{debug, warn};

/// Configuration for [`retry_fixed`].
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Additional attempts after the first one. `max_retries: 3` means the
    /// operation runs at most 4 times.
    pub max_retries: u32,
    /// Pause between attempts.
    ///
    /// Default: 1000 ms
    pub delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::network()
    }
}

impl RetryConfig {
    /// Policy for API calls and Git push/fetch/clone: 3 retries, 1 s apart.
    pub fn network() -> Self {
        Self {
            max_retries: 3,
            delay: Duration::from_millis(1000),
        }
    }

    /// Policy for WebDAV file transfers: 5 retries, 1 s apart.
    pub fn transfer() -> Self {
        Self {
            max_retries: 5,
            delay: Duration::from_millis(1000),
        }
    }

    /// Create a config suitable for quick unit tests (no real waiting).
    pub fn instant() -> Self {
        Self {
            max_retries: 3,
            delay: Duration::from_millis(1),
        }
    }
}

/// Retry an async operation with a fixed delay between attempts.
///
/// Calls `f()` up to `config.max_retries + 1` times, sleeping
/// `config.delay` after each failure while budget remains. Returns
/// `Ok(value)` on the first success, or the final error untouched once the
/// budget is exhausted.
///
/// Local filesystem and Git index operations are assumed deterministic and
/// must not be routed through here — only network-shaped calls are.
pub async fn retry_fixed<F, Fut, T, E>(config: &RetryConfig, mut f: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: std::fmt::Debug,
{
    let mut attempt: u32 = 1;
    loop {
        match f().await {
            Ok(value) => {
                if attempt > 1 {
                    debug!(attempt, "retry succeeded");
                }
                return Ok(value);
            }
            Err(e) if attempt <= config.max_retries => {
                warn!(
                    attempt,
                    remaining = config.max_retries - attempt + 1,
                    delay_ms = config.delay.as_millis() as u64,
                    err = ?e,
                    "attempt failed — retrying"
                );
                tokio::time::sleep(config.delay).await;
                attempt += 1;
            }
            Err(e) => {
                warn!(attempt, err = ?e, "all retry attempts exhausted");
                return Err(e);
            }
        }
    }
}

/// Convenience wrapper: retry with `n` additional attempts at the default
/// 1 s spacing.
pub async fn retry<F, Fut, T, E>(f: F, n: u32) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: std::fmt::Debug,
{
    let config = RetryConfig {
        max_retries: n,
        ..RetryConfig::network()
    };
    retry_fixed(&config, f).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn succeeds_on_first_attempt() {
        let cfg = RetryConfig::instant();
        let calls = Arc::new(AtomicU32::new(0));
        let calls2 = calls.clone();

        let result: Result<u32, String> = retry_fixed(&cfg, || {
            let c = calls2.clone();
            async move {
                c.fetch_add(1, Ordering::Relaxed);
                Ok(42)
            }
        })
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn invokes_exactly_budget_plus_one_on_permanent_failure() {
        let cfg = RetryConfig {
            max_retries: 3,
            ..RetryConfig::instant()
        };
        let calls = Arc::new(AtomicU32::new(0));
        let calls2 = calls.clone();

        let result: Result<u32, String> = retry_fixed(&cfg, || {
            let c = calls2.clone();
            async move {
                c.fetch_add(1, Ordering::Relaxed);
                Err("permanent error".to_string())
            }
        })
        .await;

        assert_eq!(result.unwrap_err(), "permanent error");
        assert_eq!(calls.load(Ordering::Relaxed), 4);
    }

    #[tokio::test]
    async fn succeeds_after_transient_failures() {
        let cfg = RetryConfig::instant();
        let calls = Arc::new(AtomicU32::new(0));
        let calls2 = calls.clone();

        let result: Result<u32, String> = retry_fixed(&cfg, || {
            let c = calls2.clone();
            async move {
                let n = c.fetch_add(1, Ordering::Relaxed) + 1;
                if n < 3 {
                    Err(format!("attempt {n} failed"))
                } else {
                    Ok(n)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 3);
        assert_eq!(calls.load(Ordering::Relaxed), 3);
    }

    #[tokio::test]
    async fn zero_budget_means_single_attempt() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls2 = calls.clone();

        let result: Result<(), String> = retry_fixed(
            &RetryConfig {
                max_retries: 0,
                delay: Duration::from_millis(1),
            },
            || {
                let c = calls2.clone();
                async move {
                    c.fetch_add(1, Ordering::Relaxed);
                    Err("fail".to_string())
                }
            },
        )
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn last_error_is_returned_unchanged() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls2 = calls.clone();

        let result: Result<(), String> = retry_fixed(&RetryConfig::instant(), || {
            let c = calls2.clone();
            async move {
                let n = c.fetch_add(1, Ordering::Relaxed) + 1;
                Err(format!("error #{n}"))
            }
        })
        .await;

        // The error of the final attempt, not the first.
        assert_eq!(result.unwrap_err(), "error #4");
    }
}
