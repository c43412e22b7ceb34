use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use super::{LeaveRequestStore, StoreError};
use crate::models::{LeaveRequest, LeaveStatus, NewLeaveRequest};

type LeaveRow = (Uuid, Uuid, DateTime<Utc>, DateTime<Utc>, String, DateTime<Utc>);

/// Postgres-backed leave-request store
#[derive(Clone)]
pub struct PgLeaveRequestRepo {
    pool: PgPool,
}

impl PgLeaveRequestRepo {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn from_row(row: LeaveRow) -> Result<LeaveRequest, StoreError> {
    let status = row
        .4
        .parse::<LeaveStatus>()
        .map_err(StoreError::Corrupt)?;

    Ok(LeaveRequest {
        id: row.0,
        employee_id: row.1,
        start_date: row.2,
        end_date: row.3,
        status,
        created_at: row.5,
    })
}

#[async_trait]
impl LeaveRequestStore for PgLeaveRequestRepo {
    /// Insert a new leave request in `pending` status
    async fn create_leave_request(&self, new: &NewLeaveRequest) -> Result<LeaveRequest, StoreError> {
        let row = sqlx::query_as::<_, LeaveRow>(
            r#"
            INSERT INTO leave_requests (id, employee_id, start_date, end_date, status)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING id, employee_id, start_date, end_date, status, created_at
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(new.employee_id)
        .bind(new.start_date)
        .bind(new.end_date)
        .bind(LeaveStatus::Pending.as_str())
        .fetch_one(&self.pool)
        .await?;

        from_row(row)
    }

    async fn load_leave_request(&self, id: Uuid) -> Result<LeaveRequest, StoreError> {
        let row = sqlx::query_as::<_, LeaveRow>(
            r#"
            SELECT id, employee_id, start_date, end_date, status, created_at
            FROM leave_requests
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => from_row(row),
            None => Err(StoreError::NotFound(id)),
        }
    }

    async fn list_by_employee(&self, employee_id: Uuid) -> Result<Vec<LeaveRequest>, StoreError> {
        let rows = sqlx::query_as::<_, LeaveRow>(
            r#"
            SELECT id, employee_id, start_date, end_date, status, created_at
            FROM leave_requests
            WHERE employee_id = $1
            ORDER BY start_date ASC, created_at ASC
            "#,
        )
        .bind(employee_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(from_row).collect()
    }

    async fn update_status(&self, id: Uuid, status: LeaveStatus) -> Result<(), StoreError> {
        let result = sqlx::query("UPDATE leave_requests SET status = $1 WHERE id = $2")
            .bind(status.as_str())
            .bind(id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(id));
        }

        Ok(())
    }
}
