//! Queue topology: a durable work queue plus its dead-letter route

use std::time::Duration;

/// Default time a message may sit in the primary queue (24 hours)
pub const DEFAULT_MESSAGE_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Declaration of a work queue and where its rejected messages go
///
/// Rejected or expired messages on `queue` are routed through
/// `dead_letter_exchange` (direct) to `dead_letter_queue`, which is bound with
/// `dead_letter_routing_key`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueTopology {
    pub queue: String,
    pub message_ttl: Duration,
    pub dead_letter_exchange: String,
    pub dead_letter_queue: String,
    pub dead_letter_routing_key: String,
}

impl QueueTopology {
    pub fn new(
        queue: impl Into<String>,
        dead_letter_exchange: impl Into<String>,
        dead_letter_queue: impl Into<String>,
    ) -> Self {
        Self {
            queue: queue.into(),
            message_ttl: DEFAULT_MESSAGE_TTL,
            dead_letter_exchange: dead_letter_exchange.into(),
            dead_letter_queue: dead_letter_queue.into(),
            dead_letter_routing_key: String::new(),
        }
    }

    pub fn with_message_ttl(mut self, ttl: Duration) -> Self {
        self.message_ttl = ttl;
        self
    }

    /// TTL in whole milliseconds, as carried by `x-message-ttl`
    pub fn message_ttl_millis(&self) -> u32 {
        u32::try_from(self.message_ttl.as_millis()).unwrap_or(u32::MAX)
    }
}
