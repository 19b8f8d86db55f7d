//! Bounded-backoff retry for fallible file operations.
//!
//! The live watcher can hand a processor a file that is still being written
//! (a large copy in progress) or briefly locked by another process. Those
//! failures are transient: the operation is retried on a fixed backoff
//! ladder, and if every attempt fails the error is reported for that single
//! file only - the surrounding batch keeps going, and the next
//! reconciliation tick will try again.

use std::io::ErrorKind;
use std::path::Path;
use std::time::Duration;

use tracing::warn;

use crate::error::{Result, SyncError};

/// Retry schedule: how many attempts, and how long to wait after each
/// failed attempt before the next one.
#[derive(Clone, Debug)]
pub struct RetryPolicy {
    max_attempts: u32,
    backoff: Vec<Duration>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            backoff: vec![
                Duration::from_millis(100),
                Duration::from_millis(250),
                Duration::from_millis(500),
                Duration::from_millis(1000),
                Duration::from_millis(1500),
            ],
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, backoff: Vec<Duration>) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff,
        }
    }

    /// A policy that never retries, useful in tests.
    pub fn none() -> Self {
        Self::new(1, Vec::new())
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Delay to sleep after the given 1-based failed attempt. The ladder is
    /// clamped at its last rung.
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let idx = (attempt.max(1) as usize - 1).min(self.backoff.len().saturating_sub(1));
        self.backoff.get(idx).copied().unwrap_or(Duration::ZERO)
    }
}

/// Whether an error is worth retrying: I/O contention and permission denial
/// are treated as transient (the file may still be mid-copy or briefly
/// locked); everything else is fatal for that single file.
pub fn is_transient(err: &SyncError) -> bool {
    match err {
        SyncError::Io(io) => is_transient_kind(io.kind()),
        SyncError::Image(image::ImageError::IoError(io)) => is_transient_kind(io.kind()),
        _ => false,
    }
}

fn is_transient_kind(kind: ErrorKind) -> bool {
    matches!(
        kind,
        ErrorKind::PermissionDenied
            | ErrorKind::WouldBlock
            | ErrorKind::TimedOut
            | ErrorKind::Interrupted
            | ErrorKind::UnexpectedEof
    )
}

/// Run `op`, retrying transient failures per `policy`. On exhaustion the
/// last error is wrapped with the operation name, path, and attempt count;
/// non-transient errors fail immediately.
pub async fn execute_with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    operation: &str,
    path: &Path,
    mut op: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0;
    loop {
        attempt += 1;
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if is_transient(&err) => {
                if attempt >= policy.max_attempts() {
                    return Err(SyncError::RetryExhausted {
                        operation: operation.to_string(),
                        path: path.to_path_buf(),
                        attempts: attempt,
                        source: Box::new(err),
                    });
                }
                warn!(
                    operation,
                    path = %path.display(),
                    attempt,
                    error = %err,
                    "transient failure, retrying"
                );
                tokio::time::sleep(policy.delay_after(attempt)).await;
            }
            Err(err) => return Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io;
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    fn transient_error() -> SyncError {
        SyncError::Io(io::Error::new(ErrorKind::PermissionDenied, "locked"))
    }

    fn test_policy() -> RetryPolicy {
        RetryPolicy::new(5, vec![Duration::from_millis(1)])
    }

    #[tokio::test]
    async fn success_returns_immediately() {
        let calls = AtomicU32::new(0);
        let result = execute_with_retry(&test_policy(), "noop", Path::new("/p"), || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Ok(42u32) }
        })
        .await;
        assert_eq!(result.ok(), Some(42));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn transient_failure_is_attempted_exactly_max_times() {
        let calls = AtomicU32::new(0);
        let result: Result<()> = execute_with_retry(&test_policy(), "build", Path::new("/p"), || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(transient_error()) }
        })
        .await;
        assert_eq!(calls.load(Ordering::SeqCst), 5);
        match result {
            Err(SyncError::RetryExhausted {
                attempts,
                operation,
                ..
            }) => {
                assert_eq!(attempts, 5);
                assert_eq!(operation, "build");
            }
            other => panic!("expected RetryExhausted, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn fatal_errors_do_not_retry() {
        let calls = AtomicU32::new(0);
        let result: Result<()> = execute_with_retry(&test_policy(), "build", Path::new("/p"), || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(SyncError::InvalidMedia("corrupt".into())) }
        })
        .await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(matches!(result, Err(SyncError::InvalidMedia(_))));
    }

    #[tokio::test]
    async fn recovery_mid_ladder_stops_retrying() {
        let calls = AtomicU32::new(0);
        let result = execute_with_retry(&test_policy(), "build", Path::new("/p"), || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(transient_error())
                } else {
                    Ok(n)
                }
            }
        })
        .await;
        assert_eq!(result.ok(), Some(2));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn ladder_follows_documented_delays() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_after(1), Duration::from_millis(100));
        assert_eq!(policy.delay_after(2), Duration::from_millis(250));
        assert_eq!(policy.delay_after(3), Duration::from_millis(500));
        assert_eq!(policy.delay_after(4), Duration::from_millis(1000));
        assert_eq!(policy.delay_after(5), Duration::from_millis(1500));
        // Past the ladder the last rung repeats.
        assert_eq!(policy.delay_after(9), Duration::from_millis(1500));
    }
}
