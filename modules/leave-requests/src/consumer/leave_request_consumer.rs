//! Leave Request Consumer
//!
//! Consumes `leave.requested` events from the leave-request queue, classifies
//! each leave with the auto-approval policy and persists the resulting status.
//!
//! Per delivery:
//! 1. Duplicate check against the idempotency store (duplicates are acked untouched)
//! 2. Parse envelope, apply policy, update the record
//! 3. On success: record the message id, ack
//! 4. On failure: requeue a copy with `x-retry-count + 1` and ack the original,
//!    or reject once the retry budget is spent so the broker dead-letters it
//!
//! Requeued copies go to the tail of the queue, so ordering across retries is
//! not preserved.

use event_bus::{BusResult, Delivery, EventBus, EventEnvelope, RetryDecision, RetryPolicy};
use futures::StreamExt;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::Instrument;

use crate::contracts::{LeaveRequestedV1, LEAVE_REQUESTED_EVENT_TYPE};
use crate::idempotency::{Claim, IdempotencyStore};
use crate::models::LeaveStatus;
use crate::repos::{LeaveRequestStore, StoreError};
use crate::services::approval_policy::AutoApprovalPolicy;

/// Terminal result of handling one delivery
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// Policy applied and status written
    Processed(LeaveStatus),
    /// Record had already left `pending`; nothing written
    AlreadyClassified(LeaveStatus),
    /// Message id seen within the idempotency window; acked untouched
    Duplicate,
    /// Processing failed; a copy with this retry count was queued
    Requeued { retry_count: u32 },
    /// Processing failed with the retry budget spent; rejected to the DLQ
    DeadLettered,
}

/// Errors that make a delivery fail processing (and enter retry)
#[derive(Debug, thiserror::Error)]
pub enum ProcessingError {
    #[error("Invalid envelope: {0}")]
    InvalidEnvelope(String),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

pub struct LeaveRequestConsumer {
    bus: Arc<dyn EventBus>,
    store: Arc<dyn LeaveRequestStore>,
    idempotency: Arc<IdempotencyStore>,
    policy: AutoApprovalPolicy,
    retry_policy: RetryPolicy,
    queue: String,
}

impl LeaveRequestConsumer {
    pub fn new(
        bus: Arc<dyn EventBus>,
        store: Arc<dyn LeaveRequestStore>,
        idempotency: Arc<IdempotencyStore>,
        queue: impl Into<String>,
    ) -> Self {
        Self {
            bus,
            store,
            idempotency,
            policy: AutoApprovalPolicy::default(),
            retry_policy: RetryPolicy::default(),
            queue: queue.into(),
        }
    }

    pub fn with_policy(mut self, policy: AutoApprovalPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_retry_policy(mut self, retry_policy: RetryPolicy) -> Self {
        self.retry_policy = retry_policy;
        self
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// Drive one delivery to a terminal state (acked or rejected)
    ///
    /// Only settlement failures are returned as errors; processing failures
    /// are handled by the retry policy.
    pub async fn handle_delivery(&self, delivery: Delivery) -> BusResult<DeliveryOutcome> {
        let message_id = delivery.message().message_id.clone();
        let retry_count = delivery.message().retry_count;

        match &message_id {
            Some(id) => match self.idempotency.try_claim(id) {
                Claim::Claimed => {}
                Claim::Duplicate | Claim::InFlight => {
                    tracing::debug!(message_id = %id, "Duplicate delivery acknowledged without processing");
                    delivery.ack().await?;
                    return Ok(DeliveryOutcome::Duplicate);
                }
            },
            None => {
                tracing::warn!("Delivery has no message id, processing without deduplication");
            }
        }

        match self.process(&delivery.message().payload).await {
            Ok(outcome) => {
                if let Some(id) = &message_id {
                    self.idempotency.mark_processed(id);
                }
                delivery.ack().await?;
                Ok(outcome)
            }
            Err(e) => {
                if let Some(id) = &message_id {
                    self.idempotency.release(id);
                }
                tracing::error!(
                    message_id = %message_id.as_deref().unwrap_or("none"),
                    retry_count,
                    error = %e,
                    "Failed to process leave request event"
                );
                self.escalate(delivery).await
            }
        }
    }

    async fn process(&self, payload: &[u8]) -> Result<DeliveryOutcome, ProcessingError> {
        let envelope: EventEnvelope<LeaveRequestedV1> = serde_json::from_slice(payload)
            .map_err(|e| ProcessingError::InvalidEnvelope(format!("Failed to parse envelope: {}", e)))?;

        if envelope.event_type != LEAVE_REQUESTED_EVENT_TYPE {
            return Err(ProcessingError::InvalidEnvelope(format!(
                "unexpected event type {}",
                envelope.event_type
            )));
        }
        if envelope.id != envelope.data.id.to_string() {
            return Err(ProcessingError::InvalidEnvelope(format!(
                "envelope id {} does not match data.id {}",
                envelope.id, envelope.data.id
            )));
        }

        let leave_id = envelope.data.id;
        let current = self.store.load_leave_request(leave_id).await?;
        if current.status != LeaveStatus::Pending {
            tracing::info!(
                leave_request_id = %leave_id,
                status = %current.status,
                "Leave request already classified, skipping update"
            );
            return Ok(DeliveryOutcome::AlreadyClassified(current.status));
        }

        let status = self
            .policy
            .decide(envelope.data.start_date, envelope.data.end_date);
        self.store.update_status(leave_id, status).await?;

        tracing::info!(
            leave_request_id = %leave_id,
            status = %status,
            "Leave request classified"
        );

        Ok(DeliveryOutcome::Processed(status))
    }

    async fn escalate(&self, delivery: Delivery) -> BusResult<DeliveryOutcome> {
        let retry_count = delivery.message().retry_count;

        match self.retry_policy.decide(retry_count) {
            RetryDecision::Requeue {
                next_retry_count,
                delay,
            } => {
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }

                let copy = delivery.message().requeued(next_retry_count);
                if let Err(e) = self.bus.publish(copy).await {
                    // Without a live copy the original must not be acked; quarantine it instead
                    tracing::error!(
                        retry_count,
                        error = %e,
                        "Failed to requeue leave request event, rejecting to DLQ"
                    );
                    delivery.reject().await?;
                    return Ok(DeliveryOutcome::DeadLettered);
                }

                delivery.ack().await?;
                tracing::warn!(
                    retry_count = next_retry_count,
                    max_retries = self.retry_policy.max_retries,
                    "Leave request event requeued"
                );
                Ok(DeliveryOutcome::Requeued {
                    retry_count: next_retry_count,
                })
            }
            RetryDecision::DeadLetter => {
                delivery.reject().await?;
                tracing::error!(
                    retry_count,
                    "Leave request event moved to DLQ after retries exhausted"
                );
                Ok(DeliveryOutcome::DeadLettered)
            }
        }
    }
}

/// Start the leave request consumer task
///
/// Subscribes before spawning so a broken subscription fails startup. Up to
/// `prefetch` deliveries are handled concurrently. The task ends when the bus
/// is closed; in-flight handlers run to completion.
pub async fn start_leave_request_consumer(
    consumer: Arc<LeaveRequestConsumer>,
    prefetch: u16,
) -> BusResult<JoinHandle<()>> {
    let stream = consumer.bus.consume(&consumer.queue, prefetch).await?;

    tracing::info!(queue = %consumer.queue, prefetch, "Leave request consumer started");

    Ok(tokio::spawn(async move {
        let concurrency = usize::from(prefetch.max(1));

        stream
            .for_each_concurrent(concurrency, |delivery| {
                let consumer = consumer.clone();
                async move {
                    let span = tracing::info_span!(
                        "process_leave_request",
                        message_id = %delivery.message().message_id.as_deref().unwrap_or("none"),
                        retry_count = delivery.message().retry_count,
                    );

                    async {
                        match consumer.handle_delivery(delivery).await {
                            Ok(outcome) => tracing::debug!(?outcome, "Delivery settled"),
                            Err(e) => tracing::error!(error = %e, "Failed to settle delivery"),
                        }
                    }
                    .instrument(span)
                    .await;
                }
            })
            .await;

        tracing::warn!("Leave request consumer stopped");
    }))
}
