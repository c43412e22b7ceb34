pub mod leave_request_consumer;

pub use leave_request_consumer::{
    start_leave_request_consumer, DeliveryOutcome, LeaveRequestConsumer, ProcessingError,
};
