//! # EventBus Abstraction
//!
//! Queue-oriented messaging for modules that hand work to background
//! consumers through a durable broker.
//!
//! ## Implementations
//!
//! - **AmqpBus**: Production implementation over RabbitMQ (one connection, one channel)
//! - **InMemoryBus**: Test/dev implementation that models queues, TTL and dead-lettering
//!
//! ## Usage
//!
//! ```rust,no_run
//! use event_bus::{AmqpBus, BusMessage, EventBus, InMemoryBus, QueueTopology};
//! use futures::StreamExt;
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let topology = QueueTopology::new("work", "work_dlx", "work_failed");
//!
//! // Production: RabbitMQ
//! let bus: Arc<dyn EventBus> =
//!     Arc::new(AmqpBus::initialize("amqp://localhost:5672", &topology).await?);
//!
//! // Dev/Test: In-Memory
//! let bus: Arc<dyn EventBus> = Arc::new(InMemoryBus::new());
//! bus.declare_topology(&topology).await?;
//!
//! bus.publish(BusMessage::new("work", b"hello".to_vec()).with_message_id("job-1"))
//!     .await?;
//!
//! let mut deliveries = bus.consume("work", 10).await?;
//! while let Some(delivery) = deliveries.next().await {
//!     println!("Received {} bytes", delivery.message().payload.len());
//!     delivery.ack().await?;
//! }
//! # Ok(())
//! # }
//! ```

mod amqp_bus;
pub mod consumer_retry;
mod envelope;
mod inmemory_bus;
mod topology;

pub use amqp_bus::{AmqpBus, DEFAULT_DRAIN_TIMEOUT};
pub use consumer_retry::{RetryDecision, RetryPolicy};
pub use envelope::{validate_envelope_fields, EventEnvelope};
pub use inmemory_bus::InMemoryBus;
pub use topology::QueueTopology;

use async_trait::async_trait;
use futures::stream::BoxStream;
use std::collections::HashMap;
use std::fmt;

/// Header carrying the number of times a message has been requeued
pub const RETRY_COUNT_HEADER: &str = "x-retry-count";

/// A message published to, or received from, the event bus
#[derive(Debug, Clone, PartialEq)]
pub struct BusMessage {
    /// The queue this message is routed to
    pub queue: String,
    /// The message payload (raw bytes)
    pub payload: Vec<u8>,
    /// Deduplication key assigned by the producer
    pub message_id: Option<String>,
    /// Number of requeues so far (`x-retry-count`)
    pub retry_count: u32,
    /// Whether the broker must write the message to disk
    pub persistent: bool,
    /// Additional string headers, carried unchanged across requeues
    pub headers: Option<HashMap<String, String>>,
    /// Broker properties of a received message, reused verbatim when it is republished
    pub(crate) broker_properties: Option<lapin::BasicProperties>,
}

impl BusMessage {
    /// Create a new persistent message with a retry count of zero
    pub fn new(queue: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            queue: queue.into(),
            payload,
            message_id: None,
            retry_count: 0,
            persistent: true,
            headers: None,
            broker_properties: None,
        }
    }

    /// Set the message id
    pub fn with_message_id(mut self, message_id: impl Into<String>) -> Self {
        self.message_id = Some(message_id.into());
        self
    }

    /// Set the retry count
    pub fn with_retry_count(mut self, retry_count: u32) -> Self {
        self.retry_count = retry_count;
        self
    }

    /// Add headers to the message
    pub fn with_headers(mut self, headers: HashMap<String, String>) -> Self {
        self.headers = Some(headers);
        self
    }

    /// Copy of this message for the next attempt, identical apart from the retry count
    ///
    /// Broker properties of a received message (content type, correlation id,
    /// non-string headers) travel with the copy.
    pub fn requeued(&self, retry_count: u32) -> Self {
        Self {
            retry_count,
            ..self.clone()
        }
    }
}

/// Errors that can occur when using the event bus
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("broker unavailable: {0}")]
    BrokerUnavailable(String),

    #[error("event bus not initialized")]
    NotInitialized,

    #[error("failed to declare topology: {0}")]
    TopologyError(String),

    #[error("failed to publish message: {0}")]
    PublishError(String),

    #[error("failed to consume from queue: {0}")]
    ConsumeError(String),

    #[error("failed to settle delivery: {0}")]
    AckError(String),

    #[error("serialization error: {0}")]
    SerializationError(String),
}

/// Result type for event bus operations
pub type BusResult<T> = Result<T, BusError>;

/// Settles a single delivery with the broker
#[async_trait]
pub trait Acknowledger: Send + Sync {
    /// Positively acknowledge; the broker forgets the message
    async fn ack(&self) -> BusResult<()>;

    /// Reject without requeue; the broker dead-letters the message
    async fn reject(&self) -> BusResult<()>;
}

/// A message handed to a consumer, to be settled exactly once
pub struct Delivery {
    message: BusMessage,
    acker: Box<dyn Acknowledger>,
}

impl Delivery {
    pub fn new(message: BusMessage, acker: Box<dyn Acknowledger>) -> Self {
        Self { message, acker }
    }

    pub fn message(&self) -> &BusMessage {
        &self.message
    }

    /// Acknowledge the delivery, consuming it
    pub async fn ack(self) -> BusResult<()> {
        self.acker.ack().await
    }

    /// Reject the delivery without requeue, consuming it
    pub async fn reject(self) -> BusResult<()> {
        self.acker.reject().await
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("message", &self.message)
            .finish_non_exhaustive()
    }
}

/// Core event bus abstraction for durable queue messaging
///
/// Implementations own the broker connection. Callers share one instance per
/// process (usually as `Arc<dyn EventBus>`) instead of opening their own.
#[async_trait]
pub trait EventBus: Send + Sync {
    /// Declare the queue, its dead-letter exchange and the dead-letter queue
    ///
    /// Declaring the same topology again is a no-op.
    async fn declare_topology(&self, topology: &QueueTopology) -> BusResult<()>;

    /// Publish a message to `message.queue`
    ///
    /// # Returns
    /// * `Ok(())` once the broker accepted the message
    /// * `Err(BusError::NotInitialized)` if the bus is closed or the queue was never declared
    async fn publish(&self, message: BusMessage) -> BusResult<()>;

    /// Start consuming from a queue
    ///
    /// `prefetch` bounds the number of unsettled deliveries the broker hands out.
    /// The stream ends when the bus is closed.
    async fn consume(&self, queue: &str, prefetch: u16) -> BusResult<BoxStream<'static, Delivery>>;

    /// Stop delivering, let in-flight deliveries settle, then release broker resources
    ///
    /// Idempotent.
    async fn close(&self) -> BusResult<()>;
}

impl fmt::Debug for dyn EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EventBus")
    }
}
