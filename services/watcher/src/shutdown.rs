//! Process-wide cancellation, carried as a `watch<bool>` that flips to `true` once.

use tokio::sync::watch;

/// Resolve once shutdown has been requested (or the sender is gone).
pub async fn requested(rx: &mut watch::Receiver<bool>) {
    let _ = rx.wait_for(|stop| *stop).await;
}
