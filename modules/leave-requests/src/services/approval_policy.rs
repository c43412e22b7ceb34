//! Auto-approval rule applied by the leave-request consumer

use chrono::{DateTime, Utc};

use crate::models::LeaveStatus;

/// Leaves up to this many whole days are approved without a manager
pub const DEFAULT_MAX_AUTO_APPROVE_DAYS: i64 = 2;

/// Maps a leave's duration to its initial status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AutoApprovalPolicy {
    pub max_auto_approve_days: i64,
}

impl Default for AutoApprovalPolicy {
    fn default() -> Self {
        Self {
            max_auto_approve_days: DEFAULT_MAX_AUTO_APPROVE_DAYS,
        }
    }
}

impl AutoApprovalPolicy {
    pub fn new(max_auto_approve_days: i64) -> Self {
        Self {
            max_auto_approve_days,
        }
    }

    /// `approved` when the leave fits the threshold, else `pending_approval`
    pub fn decide(&self, start_date: DateTime<Utc>, end_date: DateTime<Utc>) -> LeaveStatus {
        if leave_duration_days(start_date, end_date) <= self.max_auto_approve_days {
            LeaveStatus::Approved
        } else {
            LeaveStatus::PendingApproval
        }
    }
}

/// Whole days between the two dates; partial days are truncated
pub fn leave_duration_days(start_date: DateTime<Utc>, end_date: DateTime<Utc>) -> i64 {
    (end_date - start_date).num_days()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn day0() -> DateTime<Utc> {
        "2024-06-03T09:00:00Z".parse().unwrap()
    }

    #[test]
    fn test_one_day_is_approved() {
        let policy = AutoApprovalPolicy::default();
        assert_eq!(policy.decide(day0(), day0() + Duration::days(1)), LeaveStatus::Approved);
    }

    #[test]
    fn test_boundary_two_days_approved_three_pending() {
        let policy = AutoApprovalPolicy::default();

        assert_eq!(policy.decide(day0(), day0() + Duration::days(2)), LeaveStatus::Approved);
        assert_eq!(
            policy.decide(day0(), day0() + Duration::days(3)),
            LeaveStatus::PendingApproval
        );
    }

    #[test]
    fn test_five_days_needs_approval() {
        let policy = AutoApprovalPolicy::default();
        assert_eq!(
            policy.decide(day0(), day0() + Duration::days(5)),
            LeaveStatus::PendingApproval
        );
    }

    #[test]
    fn test_partial_days_are_truncated() {
        // 2 days 23 hours counts as 2 whole days
        let end = day0() + Duration::days(2) + Duration::hours(23);
        assert_eq!(leave_duration_days(day0(), end), 2);
        assert_eq!(AutoApprovalPolicy::default().decide(day0(), end), LeaveStatus::Approved);
    }

    #[test]
    fn test_threshold_is_injectable() {
        let strict = AutoApprovalPolicy::new(0);
        assert_eq!(
            strict.decide(day0(), day0() + Duration::days(1)),
            LeaveStatus::PendingApproval
        );

        let lenient = AutoApprovalPolicy::new(5);
        assert_eq!(lenient.decide(day0(), day0() + Duration::days(5)), LeaveStatus::Approved);
    }
}
