//! Persistence collaborators for leave requests

pub mod leave_request_repo;

use async_trait::async_trait;
use uuid::Uuid;

use crate::models::{LeaveRequest, LeaveStatus, NewLeaveRequest};

pub use leave_request_repo::PgLeaveRequestRepo;

/// Errors surfaced by a leave-request store
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Leave request not found: {0}")]
    NotFound(Uuid),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Corrupt row: {0}")]
    Corrupt(String),
}

/// Data-access interface the pipeline depends on
///
/// The consumer only loads and updates; creation and listing serve the API.
#[async_trait]
pub trait LeaveRequestStore: Send + Sync {
    async fn create_leave_request(&self, new: &NewLeaveRequest) -> Result<LeaveRequest, StoreError>;

    async fn load_leave_request(&self, id: Uuid) -> Result<LeaveRequest, StoreError>;

    /// Every leave request of one employee, oldest start date first
    async fn list_by_employee(&self, employee_id: Uuid) -> Result<Vec<LeaveRequest>, StoreError>;

    async fn update_status(&self, id: Uuid, status: LeaveStatus) -> Result<(), StoreError>;
}
