//! Transient failure classification and retry with backoff

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::error::{RbacError, Result};
use crate::types::AuditContext;

/// Message fragments that mark a store failure as transient
const TRANSIENT_MARKERS: &[&str] = &[
    "connection",
    "timeout",
    "timed out",
    "deadlock",
    "lock wait",
    "reset",
    "broken pipe",
    "temporary",
    "temporarily",
    "try again",
    "retry",
    "too many connections",
    "serialization failure",
];

/// Retry policy for the `*_with_retry` operations
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// Attempts including the first one
    pub max_attempts: u32,

    /// Delay after attempt `n` is `base_delay * 2^n`
    pub base_delay: Duration,

    /// Relative jitter applied to each delay (0.1 = ±10%)
    pub jitter: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            jitter: 0.1,
        }
    }
}

impl RetryConfig {
    /// Backoff before the attempt following `attempt` (1-based)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);

        if self.jitter <= 0.0 {
            return delay;
        }
        let spread = rand::thread_rng().gen_range(-self.jitter..=self.jitter);
        delay.mul_f64((1.0 + spread).max(0.0))
    }
}

/// Whether retrying the failed call may succeed
///
/// Caller cancellation and deadlines count as transient. Store errors are
/// transient when the store classified them as retryable or their message
/// carries a known marker. Validation and authorization errors never are.
pub fn is_transient(err: &RbacError) -> bool {
    match err {
        RbacError::Cancelled | RbacError::DeadlineExceeded => true,
        RbacError::Database { source, .. } => {
            if source.is_retryable() {
                return true;
            }
            let text = err.to_string().to_lowercase();
            TRANSIENT_MARKERS.iter().any(|marker| text.contains(marker))
        }
        _ => false,
    }
}

/// Run `call` until it succeeds, fails permanently, or attempts run out
pub(crate) async fn run<T, F, Fut>(
    config: &RetryConfig,
    ctx: &AuditContext,
    operation: &'static str,
    mut call: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let max_attempts = config.max_attempts.max(1);
    let mut attempt = 0;

    loop {
        attempt += 1;

        let err = match call().await {
            Ok(value) => {
                if attempt > 1 {
                    info!(operation, attempt, "Succeeded after retry");
                }
                return Ok(value);
            }
            Err(err) => err,
        };

        if !is_transient(&err) {
            return Err(err);
        }
        if attempt >= max_attempts {
            warn!(operation, attempts = attempt, error = %err, "Retries exhausted");
            return Err(err);
        }

        let delay = config.delay_for(attempt);
        warn!(operation, attempt, ?delay, error = %err, "Transient failure, retrying");
        pause(ctx, delay).await?;
    }
}

/// Sleep for `delay` unless the caller cancels or its deadline passes first
async fn pause(ctx: &AuditContext, delay: Duration) -> Result<()> {
    let wake = Instant::now() + delay;
    let (until, expires) = match ctx.deadline() {
        Some(deadline) if deadline < wake => (deadline, true),
        _ => (wake, false),
    };

    tokio::select! {
        _ = ctx.cancellation().cancelled() => Err(RbacError::Cancelled),
        _ = tokio::time::sleep_until(until) => {
            if expires {
                Err(RbacError::DeadlineExceeded)
            } else {
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StoreError;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio_util::sync::CancellationToken;

    fn fast() -> RetryConfig {
        RetryConfig {
            max_attempts: 3,
            base_delay: Duration::from_millis(1),
            jitter: 0.1,
        }
    }

    #[test]
    fn test_transient_classification() {
        assert!(is_transient(&RbacError::Cancelled));
        assert!(is_transient(&RbacError::DeadlineExceeded));
        assert!(is_transient(&RbacError::database("insert", StoreError::Timeout("pool".into()))));
        assert!(is_transient(&RbacError::database(
            "insert",
            StoreError::Other("server closed the connection unexpectedly".into())
        )));
        assert!(is_transient(&RbacError::database(
            "insert",
            StoreError::Other("Lock wait timeout exceeded".into())
        )));
        assert!(!is_transient(&RbacError::database("insert", StoreError::Duplicate("k".into()))));
        assert!(!is_transient(&RbacError::NoActorId));
        assert!(!is_transient(&RbacError::CannotAssign {
            actor_id: "reset-bot".into(),
            role: "admin".into(),
            scope: "organization:org1".into(),
        }));
    }

    #[test]
    fn test_delay_grows_exponentially_with_jitter() {
        let config = RetryConfig::default();

        for _ in 0..50 {
            let first = config.delay_for(1);
            assert!(first >= Duration::from_millis(1800) && first <= Duration::from_millis(2200));

            let second = config.delay_for(2);
            assert!(second >= Duration::from_millis(3600) && second <= Duration::from_millis(4400));
        }

        let exact = RetryConfig { jitter: 0.0, ..RetryConfig::default() };
        assert_eq!(exact.delay_for(3), Duration::from_secs(8));
    }

    #[tokio::test]
    async fn test_retries_transient_until_success() {
        let calls = AtomicU32::new(0);
        let ctx = AuditContext::for_actor("root");

        let result = run(&fast(), &ctx, "test", || async {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(RbacError::database("insert", StoreError::Connection("reset".into())))
            } else {
                Ok(7)
            }
        })
        .await;

        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_attempts() {
        let calls = AtomicU32::new(0);
        let ctx = AuditContext::for_actor("root");

        let result: Result<()> = run(&fast(), &ctx, "test", || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(RbacError::database("insert", StoreError::Deadlock("40P01".into())))
        })
        .await;

        assert!(result.unwrap_err().is_database());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_permanent_error_not_retried() {
        let calls = AtomicU32::new(0);
        let ctx = AuditContext::for_actor("root");

        let result: Result<()> = run(&fast(), &ctx, "test", || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(RbacError::InvalidScope { scope_type: "team".into() })
        })
        .await;

        assert!(result.unwrap_err().is_invalid_scope());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cancellation_interrupts_backoff() {
        let token = CancellationToken::new();
        let ctx = AuditContext::for_actor("root").with_cancellation(token.clone());
        let slow = RetryConfig {
            base_delay: Duration::from_secs(60),
            ..fast()
        };

        token.cancel();
        let result: Result<()> = run(&slow, &ctx, "test", || async {
            Err(RbacError::database("insert", StoreError::Connection("refused".into())))
        })
        .await;

        assert!(matches!(result, Err(RbacError::Cancelled)));
    }

    #[tokio::test]
    async fn test_deadline_cuts_backoff_short() {
        let ctx = AuditContext::for_actor("root")
            .with_deadline(Instant::now() + Duration::from_millis(20));
        let slow = RetryConfig {
            base_delay: Duration::from_secs(60),
            ..fast()
        };

        let started = Instant::now();
        let result: Result<()> = run(&slow, &ctx, "test", || async {
            Err(RbacError::database("insert", StoreError::Timeout("statement".into())))
        })
        .await;

        assert!(matches!(result, Err(RbacError::DeadlineExceeded)));
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}
