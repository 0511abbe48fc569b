//! Reconnection backoff primitives.
//!
//! The retry loop itself lives in [`crate::tunnel`]; this module holds the
//! two pieces it is built from: the pure delay schedule and a cancellable
//! sleep.

use portico_common::{ReconnectConfig, Result, TunnelError};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Delay to wait after the given zero-based failed attempt:
/// `initial_delay * multiplier^attempt`, capped at `max_delay`.
pub fn delay_for_attempt(cfg: &ReconnectConfig, attempt: u32) -> Duration {
    let exponent: i32 = attempt.min(i32::MAX as u32).try_into().unwrap_or(i32::MAX);
    let raw = cfg.initial_delay.as_secs_f64() * cfg.multiplier.powi(exponent);
    let capped = raw.min(cfg.max_delay.as_secs_f64()).max(0.0);
    Duration::from_secs_f64(capped)
}

/// Sleep for `delay`, returning [`TunnelError::Cancelled`] immediately when
/// the token fires first. Cancellation wins over a scheduled retry.
pub async fn sleep_cancellable(delay: Duration, cancel: &CancellationToken) -> Result<()> {
    tokio::select! {
        biased;
        () = cancel.cancelled() => Err(TunnelError::Cancelled),
        () = tokio::time::sleep(delay) => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(initial_ms: u64, max_ms: u64, multiplier: f64) -> ReconnectConfig {
        ReconnectConfig {
            initial_delay: Duration::from_millis(initial_ms),
            max_delay: Duration::from_millis(max_ms),
            multiplier,
            max_attempts: 0,
        }
    }

    #[test]
    fn test_delay_growth() {
        let cfg = policy(1000, 60_000, 2.0);
        assert_eq!(delay_for_attempt(&cfg, 0), Duration::from_secs(1));
        assert_eq!(delay_for_attempt(&cfg, 1), Duration::from_secs(2));
        assert_eq!(delay_for_attempt(&cfg, 2), Duration::from_secs(4));
        assert_eq!(delay_for_attempt(&cfg, 5), Duration::from_secs(32));
    }

    #[test]
    fn test_delay_capped_at_max() {
        let cfg = policy(1000, 60_000, 2.0);
        assert_eq!(delay_for_attempt(&cfg, 6), Duration::from_secs(60));
        assert_eq!(delay_for_attempt(&cfg, 7), Duration::from_secs(60));
        // Far past the cap the exponent overflows into infinity; still capped.
        assert_eq!(delay_for_attempt(&cfg, 10_000), Duration::from_secs(60));
    }

    #[test]
    fn test_flat_multiplier() {
        let cfg = policy(10, 50, 1.0);
        for attempt in 0..20 {
            assert_eq!(delay_for_attempt(&cfg, attempt), Duration::from_millis(10));
        }
    }

    #[test]
    fn test_fractional_multiplier_never_negative() {
        let cfg = policy(100, 1000, 0.5);
        assert_eq!(delay_for_attempt(&cfg, 0), Duration::from_millis(100));
        assert_eq!(delay_for_attempt(&cfg, 1), Duration::from_millis(50));
        assert!(delay_for_attempt(&cfg, 60) >= Duration::ZERO);
    }

    #[tokio::test]
    async fn test_sleep_completes() {
        let cancel = CancellationToken::new();
        let result = sleep_cancellable(Duration::from_millis(5), &cancel).await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_sleep_cancelled() {
        let cancel = CancellationToken::new();
        let child = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            child.cancel();
        });

        let start = std::time::Instant::now();
        let result = sleep_cancellable(Duration::from_secs(60), &cancel).await;
        assert!(matches!(result, Err(TunnelError::Cancelled)));
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_cancellation_beats_elapsed_sleep() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        // Even a zero-length sleep loses to an already-fired token.
        let result = sleep_cancellable(Duration::ZERO, &cancel).await;
        assert!(matches!(result, Err(TunnelError::Cancelled)));
    }
}
