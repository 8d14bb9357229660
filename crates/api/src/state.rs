//! Application state shared across handlers.

use quota::RateGate;
use std::sync::Arc;
use telemetry::{health, HealthRegistry};

#[derive(Clone)]
pub struct AppState {
    /// Dependency health, normally the process-wide registry
    pub health: &'static HealthRegistry,
    /// Reports today's usage per configured kind
    pub gate: Arc<RateGate>,
}

impl AppState {
    pub fn new(gate: Arc<RateGate>) -> Self {
        Self {
            health: health(),
            gate,
        }
    }

    /// State over a registry other than the global one.
    pub fn with_health(gate: Arc<RateGate>, health: &'static HealthRegistry) -> Self {
        Self { health, gate }
    }
}
