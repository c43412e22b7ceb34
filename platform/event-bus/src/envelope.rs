//! # Event Envelope
//!
//! The serialized unit of transport published to a queue.
//!
//! ## Envelope Fields
//!
//! - `id`: Identifier of the domain record the event refers to
//! - `type`: Event discriminator (e.g., `leave.requested`)
//! - `data`: Event-specific payload (generic type parameter)
//! - `timestamp`: ISO 8601 publish time, informational only
//!
//! Broker-level metadata (message id, retry count) travels as message
//! properties, never inside the envelope.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Standard event envelope
///
/// # Examples
///
/// ```rust
/// use event_bus::EventEnvelope;
/// use serde::{Deserialize, Serialize};
///
/// #[derive(Debug, Serialize, Deserialize)]
/// struct OrderPlaced {
///     order_id: String,
///     amount: i64,
/// }
///
/// let envelope = EventEnvelope::new(
///     "ord_123".to_string(),
///     "order.placed".to_string(),
///     OrderPlaced {
///         order_id: "ord_123".to_string(),
///         amount: 1000,
///     },
/// );
/// assert_eq!(envelope.event_type, "order.placed");
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope<T> {
    /// Identifier of the underlying domain record
    pub id: String,

    /// Event discriminator
    #[serde(rename = "type")]
    pub event_type: String,

    /// Event-specific payload
    pub data: T,

    /// ISO 8601 publish time
    pub timestamp: DateTime<Utc>,
}

impl<T> EventEnvelope<T> {
    /// Create a new envelope stamped with the current time
    pub fn new(id: String, event_type: String, data: T) -> Self {
        Self {
            id,
            event_type,
            data,
            timestamp: Utc::now(),
        }
    }

    /// Override the publish timestamp (useful for testing)
    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }
}

impl<T: Serialize> EventEnvelope<T> {
    /// Serialize to the JSON wire format
    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }
}

/// Validate a raw JSON envelope before typed decoding
///
/// # Validation Rules
///
/// - `id`: non-empty string
/// - `type`: non-empty string
/// - `data`: must be a JSON object
/// - `timestamp`: must be present as a string
///
/// # Errors
///
/// Returns a descriptive error string if validation fails
pub fn validate_envelope_fields(envelope: &serde_json::Value) -> Result<(), String> {
    let id = envelope
        .get("id")
        .and_then(|v| v.as_str())
        .ok_or("Missing or invalid id")?;

    if id.is_empty() {
        return Err("id cannot be empty".to_string());
    }

    let event_type = envelope
        .get("type")
        .and_then(|v| v.as_str())
        .ok_or("Missing or invalid type")?;

    if event_type.is_empty() {
        return Err("type cannot be empty".to_string());
    }

    envelope
        .get("data")
        .and_then(|v| v.as_object())
        .ok_or("Missing or invalid data")?;

    envelope
        .get("timestamp")
        .and_then(|v| v.as_str())
        .ok_or("Missing or invalid timestamp")?;

    Ok(())
}
