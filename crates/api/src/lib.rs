//! Health HTTP surface for the enrichment worker.

pub mod response;
pub mod routes;
pub mod state;

pub use routes::router;
pub use state::AppState;
