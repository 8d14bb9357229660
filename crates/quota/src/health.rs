//! Quota store health checks.

use crate::store::QuotaStore;
use tracing::{debug, error};

/// Check quota store connection health.
pub async fn check_connection(store: &dyn QuotaStore) -> bool {
    match store.ping().await {
        Ok(()) => {
            debug!("Quota store connection healthy");
            true
        }
        Err(e) => {
            error!("Quota store ping failed: {}", e);
            false
        }
    }
}
