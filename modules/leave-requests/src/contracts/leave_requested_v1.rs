//! Leave Requested V1 Contract Types

use chrono::{DateTime, Utc};
use event_bus::EventEnvelope;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::{LeaveRequest, LeaveStatus};

/// Event type discriminator carried in the envelope's `type` field
pub const LEAVE_REQUESTED_EVENT_TYPE: &str = "leave.requested";

/// Payload for the leave requested event
///
/// This is the payload type used with `EventEnvelope<LeaveRequestedV1>`.
/// It snapshots the leave request at publish time.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LeaveRequestedV1 {
    /// Primary key of the persisted leave request
    pub id: Uuid,

    pub employee_id: Uuid,

    pub start_date: DateTime<Utc>,

    pub end_date: DateTime<Utc>,

    /// Status at publish time (normally `pending`)
    pub status: LeaveStatus,

    pub created_at: DateTime<Utc>,
}

impl From<&LeaveRequest> for LeaveRequestedV1 {
    fn from(leave: &LeaveRequest) -> Self {
        Self {
            id: leave.id,
            employee_id: leave.employee_id,
            start_date: leave.start_date,
            end_date: leave.end_date,
            status: leave.status,
            created_at: leave.created_at,
        }
    }
}

/// Build the envelope published for a newly created leave request
///
/// The envelope id is the leave request's primary key, which keeps
/// `envelope.id == data.id`.
pub fn create_leave_requested_envelope(leave: &LeaveRequest) -> EventEnvelope<LeaveRequestedV1> {
    EventEnvelope::new(
        leave.id.to_string(),
        LEAVE_REQUESTED_EVENT_TYPE.to_string(),
        LeaveRequestedV1::from(leave),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_matches_wire_format() {
        let leave = LeaveRequest {
            id: Uuid::new_v4(),
            employee_id: Uuid::new_v4(),
            start_date: "2024-03-01T00:00:00Z".parse().unwrap(),
            end_date: "2024-03-02T00:00:00Z".parse().unwrap(),
            status: LeaveStatus::Pending,
            created_at: Utc::now(),
        };

        let envelope = create_leave_requested_envelope(&leave);
        let value = serde_json::to_value(&envelope).unwrap();

        assert_eq!(value["id"], leave.id.to_string());
        assert_eq!(value["type"], "leave.requested");
        assert_eq!(value["data"]["id"], leave.id.to_string());
        assert_eq!(value["data"]["employeeId"], leave.employee_id.to_string());
        assert_eq!(value["data"]["status"], "pending");
        assert!(value["timestamp"].is_string());
        assert!(event_bus::validate_envelope_fields(&value).is_ok());
    }
}
