//! API responses.

use chrono::{DateTime, Utc};
use quota::UsageReport;
use serde::Serialize;
use telemetry::{ComponentHealthReport, HealthStatus};

/// Health check response.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: HealthStatus,
    pub broker_connected: bool,
    pub store_connected: bool,
    pub components: Vec<ComponentHealthReport>,
    /// Today's quota usage; empty while the store is unreachable
    pub usage: Vec<UsageReport>,
    pub version: &'static str,
    pub timestamp: DateTime<Utc>,
}
