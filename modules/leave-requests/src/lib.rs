pub mod config;
pub mod consumer;
pub mod contracts;
pub mod db;
pub mod health;
pub mod idempotency;
pub mod models;
pub mod producer;
pub mod repos;
pub mod routes;
pub mod services;

use axum::{
    routing::{get, post},
    Router,
};
use event_bus::QueueTopology;

pub use consumer::leave_request_consumer::start_leave_request_consumer;
pub use routes::leave_requests::AppState;

/// Primary work queue for `leave.requested` events
pub const LEAVE_REQUESTS_QUEUE: &str = "leave_requests";
/// Dead-letter exchange attached to the primary queue
pub const LEAVE_REQUESTS_DLX: &str = "leave_requests_dlx";
/// Quarantine queue for events that exhausted their retries
pub const LEAVE_REQUESTS_DLQ: &str = "leave_requests_failed";

/// Broker topology for the leave-request pipeline (24h message TTL)
pub fn leave_request_topology() -> QueueTopology {
    QueueTopology::new(LEAVE_REQUESTS_QUEUE, LEAVE_REQUESTS_DLX, LEAVE_REQUESTS_DLQ)
}

/// HTTP routes served by the module
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/health", get(health::health))
        .route(
            "/api/leave-requests",
            post(routes::leave_requests::create_leave_request),
        )
        .route(
            "/api/leave-requests/{id}",
            get(routes::leave_requests::get_leave_request),
        )
        .route(
            "/api/employees/{employee_id}/leave-requests",
            get(routes::leave_requests::get_employee_leave_history),
        )
        .with_state(state)
}
