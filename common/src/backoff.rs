use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// `base * 2^attempt`, clamped at `cap`. `attempt` is zero-based (the first
/// retry sleep uses `attempt = 0`).
pub fn backoff_delay(base: Duration, cap: Duration, attempt: u32) -> Duration {
    let base_ms = base.as_millis() as u64;
    let cap_ms = cap.as_millis() as u64;

    let pow = if attempt >= 63 {
        u64::MAX
    } else {
        1u64 << attempt
    };

    let exp_ms = base_ms.saturating_mul(pow);
    Duration::from_millis(exp_ms.min(cap_ms))
}

/// Sleeps for `duration`, returning early if `cancel` fires. `Ok(())` means
/// the sleep completed; `Err(())` means the token was cancelled first.
pub async fn cancellable_sleep(cancel: &CancellationToken, duration: Duration) -> Result<(), ()> {
    tokio::select! {
        _ = cancel.cancelled() => Err(()),
        _ = tokio::time::sleep(duration) => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_and_clamps() {
        let base = Duration::from_millis(500);
        let cap = Duration::from_secs(10);
        assert_eq!(backoff_delay(base, cap, 0), Duration::from_millis(500));
        assert_eq!(backoff_delay(base, cap, 1), Duration::from_millis(1000));
        assert_eq!(backoff_delay(base, cap, 2), Duration::from_millis(2000));
        // 500ms * 2^8 = 128s, clamped to the 10s cap.
        assert_eq!(backoff_delay(base, cap, 8), cap);
    }

    #[tokio::test]
    async fn cancellable_sleep_completes_without_cancellation() {
        let cancel = CancellationToken::new();
        let result = cancellable_sleep(&cancel, Duration::from_millis(1)).await;
        assert_eq!(result, Ok(()));
    }

    #[tokio::test]
    async fn cancellable_sleep_returns_early_on_cancellation() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = cancellable_sleep(&cancel, Duration::from_secs(30)).await;
        assert_eq!(result, Err(()));
    }
}
