//! The HTTP surface: the ingestion endpoint, the authenticated dashboard
//! API, quota enforcement, and the error envelope.

pub mod api_error;
pub mod auth;
pub mod http_api;
pub mod quota_middleware;
pub mod state;

mod analytics_api;
mod deployments_api;
mod errors_api;
mod health_api;
mod ingest_api;
mod projects_api;
mod reports_api;
mod rules_api;
mod team_api;

pub use api_error::ApiError;
pub use http_api::api_router;
pub use state::ApiState;
