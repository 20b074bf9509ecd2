use std::future::Future;
use std::time::Duration;

use anyhow::{Context as _, Result};
use tokio::time::Instant;

const POLL_INTERVAL: Duration = Duration::from_millis(25);

/// Polls `check` until it yields a value. The check runs once more after the
/// deadline so a late state change is still observed.
pub async fn wait_for<T, F, Fut>(what: &str, timeout: Duration, mut check: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Option<T>>>,
{
    let deadline = Instant::now() + timeout;
    loop {
        let expired = Instant::now() >= deadline;
        if let Some(found) = check().await.with_context(|| format!("check {what}"))? {
            return Ok(found);
        }
        if expired {
            anyhow::bail!("gave up waiting for {what} after {timeout:?}");
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}
