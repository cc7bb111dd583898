//! Retry logic with exponential backoff for transient provider errors.

use std::thread;
use std::time::Instant;

use crate::error::ProviderError;
use crate::types::RetryConfig;

/// Execute a provider operation with retry logic.
///
/// Retries only errors classified as transient. No retry is started if its
/// backoff would end past `deadline`; the last error is returned instead.
pub fn with_retry<T, F>(
    config: &RetryConfig,
    label: &str,
    deadline: Option<Instant>,
    mut operation: F,
) -> Result<T, ProviderError>
where
    F: FnMut() -> Result<T, ProviderError>,
{
    let max_attempts = config.max_attempts.max(1);
    let mut attempt = 0;

    loop {
        match operation() {
            Ok(result) => return Ok(result),
            Err(e) if !e.is_retryable() || attempt + 1 >= max_attempts => return Err(e),
            Err(e) => {
                let delay = config.delay_for_attempt(attempt);
                if deadline.is_some_and(|d| Instant::now() + delay >= d) {
                    return Err(e);
                }
                log::warn!(
                    "{label}: attempt {}/{} failed: {e}. Retrying in {:.1}s",
                    attempt + 1,
                    max_attempts,
                    delay.as_secs_f64()
                );
                thread::sleep(delay);
                attempt += 1;
            }
        }
    }
}
