//! Bounded retries for transient I/O.
//!
//! Repository reads and writes can hit short-lived failures on networked
//! filesystems. A bounded number of retries with exponential backoff and
//! jitter smooths those over; everything else (integrity, security,
//! logic errors) is returned immediately, and exhaustion promotes the
//! last transient error to the caller, whose transaction then rolls back.

use std::time::Duration;

use tracing::warn;

use cairn_types::error::{CairnError, Result};

#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub retry_delay_ms: u64,
    pub retry_max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_delay_ms: 100,
            retry_max_delay_ms: 2_000,
        }
    }
}

/// Retry a closure on transient errors with exponential backoff + jitter.
pub fn with_retries<T>(
    config: &RetryConfig,
    op_name: &str,
    f: impl Fn() -> Result<T>,
) -> Result<T> {
    let mut delay_ms = config.retry_delay_ms;
    let mut last_err = None;

    for attempt in 0..=config.max_retries {
        if attempt > 0 {
            let jitter = rand::random::<u64>() % delay_ms.max(1);
            std::thread::sleep(Duration::from_millis(delay_ms + jitter));
            delay_ms = (delay_ms * 2).min(config.retry_max_delay_ms);
        }
        match f() {
            Ok(val) => return Ok(val),
            Err(e) if e.is_transient() && attempt < config.max_retries => {
                warn!(
                    "{op_name}: transient error (attempt {}/{}), retrying: {e}",
                    attempt + 1,
                    config.max_retries,
                );
                last_err = Some(e);
            }
            Err(e) => return Err(e),
        }
    }
    Err(last_err.unwrap_or_else(|| CairnError::Other(format!("{op_name}: retries exhausted"))))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn quick() -> RetryConfig {
        RetryConfig {
            max_retries: 3,
            retry_delay_ms: 1,
            retry_max_delay_ms: 2,
        }
    }

    #[test]
    fn succeeds_after_transient_failures() {
        let attempts = AtomicU32::new(0);
        let result = with_retries(&quick(), "test-op", || {
            if attempts.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(CairnError::Io(std::io::Error::other("blip")))
            } else {
                Ok(42)
            }
        });
        assert_eq!(result.unwrap(), 42);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn exhaustion_returns_the_last_error() {
        let attempts = AtomicU32::new(0);
        let result: Result<()> = with_retries(&quick(), "test-op", || {
            attempts.fetch_add(1, Ordering::SeqCst);
            Err(CairnError::Io(std::io::Error::other("still down")))
        });
        assert!(matches!(result, Err(CairnError::Io(_))));
        assert_eq!(attempts.load(Ordering::SeqCst), 4); // initial + 3 retries
    }

    #[test]
    fn permanent_errors_are_not_retried() {
        let attempts = AtomicU32::new(0);
        let result: Result<()> = with_retries(&quick(), "test-op", || {
            attempts.fetch_add(1, Ordering::SeqCst);
            Err(CairnError::DecryptionFailed)
        });
        assert!(matches!(result, Err(CairnError::DecryptionFailed)));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }
}
