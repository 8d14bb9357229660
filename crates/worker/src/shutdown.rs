//! Shutdown signalling shared by every worker loop.

use std::time::Duration;
use tokio::sync::watch;

/// Sender side, owned by the binary.
pub fn channel() -> (watch::Sender<bool>, watch::Receiver<bool>) {
    watch::channel(false)
}

pub fn is_shutdown(rx: &watch::Receiver<bool>) -> bool {
    *rx.borrow()
}

/// Sleeps for `duration` unless shutdown is signalled first.
/// Returns true if the full duration elapsed.
pub async fn sleep_or_shutdown(duration: Duration, rx: &mut watch::Receiver<bool>) -> bool {
    if is_shutdown(rx) {
        return false;
    }
    tokio::select! {
        _ = tokio::time::sleep(duration) => true,
        _ = rx.wait_for(|stop| *stop) => false,
    }
}
