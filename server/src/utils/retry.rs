//! Async retry with exponential backoff
//!
//! Used on the broker I/O paths for transient failures. Delays are jittered
//! so a herd of consumers does not retry in lockstep.

use std::time::Duration;

use rand::Rng;

/// Default maximum retry attempts for broker operations
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Default base delay in milliseconds for exponential backoff
pub const DEFAULT_BASE_DELAY_MS: u64 = 100;

/// Retry an async operation with exponential backoff and jitter.
///
/// Returns the operation's value on success, or the last error once
/// `max_attempts` is exhausted.
pub async fn retry_with_backoff<F, Fut, T, E>(
    max_attempts: u32,
    base_delay_ms: u64,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut attempts = 0u32;

    loop {
        attempts += 1;
        match operation().await {
            Ok(value) => return Ok(value),
            Err(e) => {
                if attempts >= max_attempts {
                    return Err(e);
                }
                let backoff = base_delay_ms * 2_u64.pow(attempts - 1);
                let jitter = rand::thread_rng().gen_range(0..=backoff / 2);
                let delay = Duration::from_millis(backoff + jitter);
                tracing::warn!(
                    error = %e,
                    attempt = attempts,
                    delay_ms = delay.as_millis() as u64,
                    "Retrying after transient error"
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    #[tokio::test]
    async fn test_success_on_first_try() {
        let result: Result<u32, &str> = retry_with_backoff(3, 1, || async { Ok(42) }).await;
        assert_eq!(result, Ok(42));
    }

    #[tokio::test]
    async fn test_success_after_retry() {
        let attempts = RefCell::new(0);
        let result: Result<u32, &str> = retry_with_backoff(3, 1, || {
            let n = {
                *attempts.borrow_mut() += 1;
                *attempts.borrow()
            };
            async move { if n < 2 { Err("transient") } else { Ok(n) } }
        })
        .await;
        assert_eq!(result, Ok(2));
    }

    #[tokio::test]
    async fn test_failure_after_max_attempts() {
        let attempts = RefCell::new(0);
        let result: Result<(), &str> = retry_with_backoff(3, 1, || {
            *attempts.borrow_mut() += 1;
            async { Err("persistent") }
        })
        .await;
        assert_eq!(result, Err("persistent"));
        assert_eq!(*attempts.borrow(), 3);
    }
}
