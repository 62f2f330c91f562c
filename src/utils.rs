//! Small shared helpers.

use std::future::Future;

use tokio::time::{sleep, Duration};
use tracing::warn;

const RETRY_ATTEMPTS: u32 = 10;
const RETRY_PAUSE: Duration = Duration::from_secs(5);

/// Retry an idempotent async operation up to ten times, pausing five
/// seconds between failed attempts. Returns the first success or the last
/// error.
pub async fn with_retry<T, E, F, Fut>(mut f: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    for attempt in 1..RETRY_ATTEMPTS {
        match f().await {
            Ok(value) => return Ok(value),
            Err(e) => {
                warn!(attempt, error = %e, "call failed, retrying");
                sleep(RETRY_PAUSE).await;
            }
        }
    }
    f().await
}
