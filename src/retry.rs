//! Exponential-backoff harness wrapped around every persistence commit and
//! chain-node call.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::warn;

/// Attempts used for ledger commits before the failure is treated as fatal.
pub const DB_COMMIT_ATTEMPTS: u32 = 10;

/// Attempts used for the connect-time chain-node probe.
pub const DIAL_ATTEMPTS: u32 = 5;

/// Exponential backoff strategy.
#[derive(Debug, Clone)]
pub struct Backoff {
    /// First delay.
    pub min: Duration,
    /// Delay ceiling.
    pub max: Duration,
    /// Upper bound of the random jitter added to every delay.
    pub max_jitter: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            min: Duration::from_millis(1_000),
            max: Duration::from_millis(20_000),
            max_jitter: Duration::from_millis(250),
        }
    }
}

impl Backoff {
    /// Delay before retrying `attempt` (0-indexed): `min * 2^attempt`,
    /// capped at `max`, plus jitter.
    pub fn duration(&self, attempt: u32) -> Duration {
        let base = self
            .min
            .saturating_mul(2u32.saturating_pow(attempt))
            .min(self.max);
        let jitter_ms = self.max_jitter.as_millis() as u64;
        if jitter_ms == 0 {
            return base;
        }
        base + Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms))
    }
}

/// Run `op` until it succeeds or `max_attempts` is exhausted, sleeping the
/// backoff delay between attempts. The final error is returned unchanged.
pub async fn with_retry<T, E, F, Fut>(
    max_attempts: u32,
    backoff: &Backoff,
    label: &str,
    mut op: F,
) -> Result<T, E>
where
    E: std::fmt::Display,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut attempt = 0u32;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) => {
                attempt += 1;
                if attempt >= max_attempts {
                    return Err(e);
                }
                let delay = backoff.duration(attempt - 1);
                warn!(
                    op = label,
                    attempt,
                    max = max_attempts,
                    ?delay,
                    error = %e,
                    "Operation failed, retrying after backoff"
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}

/// True when a broadcast rejection means the node already holds the
/// transaction, so the send can be treated as a success.
pub fn is_known_transaction(error: &str) -> bool {
    let error_lower = error.to_lowercase();
    error_lower.contains("already known")
        || error_lower.contains("known transaction")
        || error_lower.contains("nonce too low")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_jitter() -> Backoff {
        Backoff {
            min: Duration::from_millis(1_000),
            max: Duration::from_millis(20_000),
            max_jitter: Duration::ZERO,
        }
    }

    #[test]
    fn test_backoff_growth_and_cap() {
        let b = no_jitter();
        assert_eq!(b.duration(0), Duration::from_secs(1));
        assert_eq!(b.duration(1), Duration::from_secs(2));
        assert_eq!(b.duration(2), Duration::from_secs(4));
        assert_eq!(b.duration(3), Duration::from_secs(8));
        assert_eq!(b.duration(4), Duration::from_secs(16));
        assert_eq!(b.duration(5), Duration::from_secs(20)); // capped
        assert_eq!(b.duration(30), Duration::from_secs(20));
    }

    #[test]
    fn test_backoff_jitter_bounds() {
        let b = Backoff::default();
        for attempt in 0..6 {
            let d = b.duration(attempt);
            let base = no_jitter().duration(attempt);
            assert!(d >= base);
            assert!(d <= base + Duration::from_millis(250));
        }
    }

    #[tokio::test]
    async fn test_with_retry_eventually_succeeds() {
        let backoff = Backoff {
            min: Duration::from_millis(1),
            max: Duration::from_millis(2),
            max_jitter: Duration::ZERO,
        };
        let mut calls = 0u32;
        let result: Result<u32, String> = with_retry(5, &backoff, "test", || {
            calls += 1;
            let n = calls;
            async move {
                if n < 3 {
                    Err("transient".to_string())
                } else {
                    Ok(n)
                }
            }
        })
        .await;
        assert_eq!(result, Ok(3));
        assert_eq!(calls, 3);
    }

    #[tokio::test]
    async fn test_with_retry_exhausts() {
        let backoff = Backoff {
            min: Duration::from_millis(1),
            max: Duration::from_millis(1),
            max_jitter: Duration::ZERO,
        };
        let mut calls = 0u32;
        let result: Result<(), String> = with_retry(3, &backoff, "test", || {
            calls += 1;
            async { Err("down".to_string()) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls, 3);
    }

    #[test]
    fn test_known_transaction_classification() {
        assert!(is_known_transaction("already known"));
        assert!(is_known_transaction("ALREADY KNOWN"));
        assert!(is_known_transaction("nonce too low"));
        assert!(!is_known_transaction("insufficient funds"));
        assert!(!is_known_transaction("connection refused"));
    }
}
