//! Leave Request API Routes
//!
//! Creation persists a `pending` row and publishes `leave.requested`; the
//! queue consumer decides the status asynchronously.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use event_bus::BusError;
use serde::Serialize;
use std::sync::Arc;
use uuid::Uuid;

use crate::models::{LeaveRequest, NewLeaveRequest};
use crate::producer::LeaveRequestProducer;
use crate::repos::{LeaveRequestStore, StoreError};

/// Shared state for the leave request handlers
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn LeaveRequestStore>,
    pub producer: LeaveRequestProducer,
}

/// An employee's leave history
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LeaveHistoryResponse {
    pub employee_id: Uuid,
    pub leave_history: Vec<LeaveRequest>,
}

/// Error response body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    Validation(String),

    #[error("Leave request not found: {0}")]
    NotFound(Uuid),

    #[error("Database error: {0}")]
    Store(StoreError),

    #[error("Leave request saved but could not be queued: {0}")]
    Publish(#[from] BusError),
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(id) => ApiError::NotFound(id),
            other => ApiError::Store(other),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::Validation(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::Publish(_) => StatusCode::BAD_GATEWAY,
        };

        if status.is_server_error() {
            tracing::error!(error = %self, "Leave request API error");
        }

        (
            status,
            Json(ErrorResponse {
                error: self.to_string(),
            }),
        )
            .into_response()
    }
}

/// Handler for POST /api/leave-requests
pub async fn create_leave_request(
    State(state): State<AppState>,
    Json(body): Json<NewLeaveRequest>,
) -> Result<(StatusCode, Json<LeaveRequest>), ApiError> {
    if body.start_date >= body.end_date {
        return Err(ApiError::Validation(
            "End date must be after start date".to_string(),
        ));
    }

    let leave = state.store.create_leave_request(&body).await?;

    // The row stays `pending` if publishing fails; the caller sees the failure
    state.producer.publish(&leave).await?;

    Ok((StatusCode::CREATED, Json(leave)))
}

/// Handler for GET /api/leave-requests/{id}
pub async fn get_leave_request(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<LeaveRequest>, ApiError> {
    let leave = state.store.load_leave_request(id).await?;
    Ok(Json(leave))
}

/// Handler for GET /api/employees/{employee_id}/leave-requests
///
/// An employee without leave requests gets an empty history.
pub async fn get_employee_leave_history(
    State(state): State<AppState>,
    Path(employee_id): Path<Uuid>,
) -> Result<Json<LeaveHistoryResponse>, ApiError> {
    let leave_history = state.store.list_by_employee(employee_id).await?;
    Ok(Json(LeaveHistoryResponse {
        employee_id,
        leave_history,
    }))
}
