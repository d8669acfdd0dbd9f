//! HTTP surface: the webhook endpoint plus the authenticated entitlement
//! endpoints.

pub mod response;
pub mod routes;

pub use response::ApiResponse;
pub use routes::{router, AppState};
