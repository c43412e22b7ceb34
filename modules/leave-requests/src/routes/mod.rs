pub mod leave_requests;
