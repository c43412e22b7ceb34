//! Publishes `leave.requested` events to the leave-request queue

use event_bus::{BusError, BusMessage, BusResult, EventBus};
use std::sync::Arc;

use crate::contracts::create_leave_requested_envelope;
use crate::models::LeaveRequest;

/// Publishes leave-request events through the process-wide event bus
#[derive(Clone)]
pub struct LeaveRequestProducer {
    bus: Arc<dyn EventBus>,
    queue: String,
}

impl LeaveRequestProducer {
    pub fn new(bus: Arc<dyn EventBus>, queue: impl Into<String>) -> Self {
        Self {
            bus,
            queue: queue.into(),
        }
    }

    /// Publish a durable event for a freshly persisted leave request
    ///
    /// The message id is the leave request's primary key and the retry count
    /// starts at zero. Broker failures are returned unchanged; nothing is
    /// retried here and consumer-side processing is not awaited.
    pub async fn publish(&self, leave: &LeaveRequest) -> BusResult<()> {
        let envelope = create_leave_requested_envelope(leave);
        let payload = envelope
            .to_bytes()
            .map_err(|e| BusError::SerializationError(e.to_string()))?;

        let message = BusMessage::new(self.queue.clone(), payload)
            .with_message_id(envelope.id.clone())
            .with_retry_count(0);

        match self.bus.publish(message).await {
            Ok(()) => {
                tracing::info!(
                    leave_request_id = %leave.id,
                    queue = %self.queue,
                    "Published leave request"
                );
                Ok(())
            }
            Err(e) => {
                tracing::error!(
                    leave_request_id = %leave.id,
                    queue = %self.queue,
                    error = %e,
                    "Failed to publish leave request"
                );
                Err(e)
            }
        }
    }
}
