//! Contract types for leave-request events
//!
//! Field names are the JSON wire names (camelCase) shared with other
//! producers of the `leave.requested` event.

pub mod leave_requested_v1;

pub use leave_requested_v1::*;
