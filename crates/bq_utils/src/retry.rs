use std::{fmt::Display, future::Future};

use crate::decay::ExpDecay;

/// Runs `operation` until it succeeds or `max_attempts` attempts have failed, sleeping between
/// attempts for as long as `backoff` says. The attempt number, starting at 1, is passed to
/// `operation`.
pub async fn async_retry_n<O, R, E, F>(
    max_attempts: usize,
    mut backoff: ExpDecay,
    operation: O,
) -> Result<R, E>
where
    F: Future<Output = Result<R, E>>,
    O: Fn(usize) -> F,
    E: Display,
{
    let mut attempt = 0;

    loop {
        attempt += 1;

        match operation(attempt).await {
            Ok(value) => return Ok(value),
            Err(e) => {
                if attempt >= max_attempts {
                    return Err(e);
                }
                let delay = backoff.next_duration();
                tracing::debug!(attempt, ?delay, error = %e, "retrying failed operation");
                tokio::time::sleep(delay).await;
            }
        }
    }
}
