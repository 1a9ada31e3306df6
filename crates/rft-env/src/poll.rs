use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;

/// Spacing between probes of every bounded wait.
pub const POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Probe until it reports `true` or `timeout` elapses.
///
/// The deadline is fixed before the first probe. The probe runs immediately,
/// then once per [`POLL_INTERVAL`]. Returns whether the probe succeeded.
pub(crate) async fn poll_until<F, Fut>(timeout: Duration, mut probe: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = Instant::now() + timeout;
    loop {
        if probe().await {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}
