//! Common test utilities for leave request pipeline tests
//!
//! `InMemoryLeaveStore` stands in for Postgres so the consumer can be driven
//! deterministically against `InMemoryBus`.

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use event_bus::{BusError, Delivery, EventBus, InMemoryBus, RetryPolicy};
use futures::stream::BoxStream;
use futures::StreamExt;
use leave_requests_rs::consumer::LeaveRequestConsumer;
use leave_requests_rs::idempotency::IdempotencyStore;
use leave_requests_rs::models::{LeaveRequest, LeaveStatus, NewLeaveRequest};
use leave_requests_rs::producer::LeaveRequestProducer;
use leave_requests_rs::repos::{LeaveRequestStore, StoreError};
use leave_requests_rs::{leave_request_topology, LEAVE_REQUESTS_QUEUE};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use uuid::Uuid;

/// Failure count that never runs out
pub const ALWAYS: usize = usize::MAX;

#[derive(Default)]
pub struct InMemoryLeaveStore {
    rows: Mutex<HashMap<Uuid, LeaveRequest>>,
    failures: Mutex<HashMap<Uuid, usize>>,
    update_calls: AtomicUsize,
}

impl InMemoryLeaveStore {
    pub fn insert(&self, leave: LeaveRequest) {
        self.rows.lock().unwrap().insert(leave.id, leave);
    }

    pub fn get(&self, id: Uuid) -> Option<LeaveRequest> {
        self.rows.lock().unwrap().get(&id).cloned()
    }

    pub fn status(&self, id: Uuid) -> Option<LeaveStatus> {
        self.get(id).map(|l| l.status)
    }

    /// Make the next `times` updates of `id` fail with a database error
    pub fn fail_updates(&self, id: Uuid, times: usize) {
        self.failures.lock().unwrap().insert(id, times);
    }

    /// Number of `update_status` calls, including failed ones
    pub fn update_calls(&self) -> usize {
        self.update_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LeaveRequestStore for InMemoryLeaveStore {
    async fn create_leave_request(&self, new: &NewLeaveRequest) -> Result<LeaveRequest, StoreError> {
        let leave = LeaveRequest {
            id: Uuid::new_v4(),
            employee_id: new.employee_id,
            start_date: new.start_date,
            end_date: new.end_date,
            status: LeaveStatus::Pending,
            created_at: Utc::now(),
        };
        self.insert(leave.clone());
        Ok(leave)
    }

    async fn load_leave_request(&self, id: Uuid) -> Result<LeaveRequest, StoreError> {
        self.get(id).ok_or(StoreError::NotFound(id))
    }

    async fn list_by_employee(&self, employee_id: Uuid) -> Result<Vec<LeaveRequest>, StoreError> {
        let mut leaves: Vec<LeaveRequest> = self
            .rows
            .lock()
            .unwrap()
            .values()
            .filter(|l| l.employee_id == employee_id)
            .cloned()
            .collect();
        leaves.sort_by_key(|l| (l.start_date, l.created_at));
        Ok(leaves)
    }

    async fn update_status(&self, id: Uuid, status: LeaveStatus) -> Result<(), StoreError> {
        self.update_calls.fetch_add(1, Ordering::SeqCst);

        {
            let mut failures = self.failures.lock().unwrap();
            if let Some(remaining) = failures.get_mut(&id) {
                if *remaining > 0 {
                    if *remaining != ALWAYS {
                        *remaining -= 1;
                    }
                    return Err(StoreError::Database(sqlx::Error::PoolTimedOut));
                }
            }
        }

        let mut rows = self.rows.lock().unwrap();
        let row = rows.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        row.status = status;
        Ok(())
    }
}

/// A pending leave of `days` whole days starting at a fixed date
pub fn pending_leave(days: i64) -> LeaveRequest {
    let start: DateTime<Utc> = "2024-06-03T00:00:00Z".parse().unwrap();
    LeaveRequest {
        id: Uuid::new_v4(),
        employee_id: Uuid::new_v4(),
        start_date: start,
        end_date: start + Duration::days(days),
        status: LeaveStatus::Pending,
        created_at: start,
    }
}

/// Everything a pipeline test needs, wired against the in-memory broker
pub struct Pipeline {
    pub bus: InMemoryBus,
    pub store: Arc<InMemoryLeaveStore>,
    pub idempotency: Arc<IdempotencyStore>,
    pub producer: LeaveRequestProducer,
    pub consumer: Arc<LeaveRequestConsumer>,
}

impl Pipeline {
    pub async fn new() -> Self {
        let bus = InMemoryBus::new();
        bus.declare_topology(&leave_request_topology())
            .await
            .expect("declare topology");

        let shared: Arc<dyn EventBus> = Arc::new(bus.clone());
        let store = Arc::new(InMemoryLeaveStore::default());
        let idempotency = Arc::new(IdempotencyStore::default());

        let consumer = LeaveRequestConsumer::new(
            shared.clone(),
            store.clone(),
            idempotency.clone(),
            LEAVE_REQUESTS_QUEUE,
        )
        .with_retry_policy(RetryPolicy::without_backoff(3));

        Self {
            bus,
            store,
            idempotency,
            producer: LeaveRequestProducer::new(shared, LEAVE_REQUESTS_QUEUE),
            consumer: Arc::new(consumer),
        }
    }

    /// Subscribe to the primary queue without starting the background task
    pub async fn deliveries(&self) -> Result<BoxStream<'static, Delivery>, BusError> {
        self.bus.consume(LEAVE_REQUESTS_QUEUE, 1).await
    }
}

/// Next delivery, failing the test after one second
pub async fn next_delivery(stream: &mut BoxStream<'static, Delivery>) -> Delivery {
    tokio::time::timeout(std::time::Duration::from_secs(1), stream.next())
        .await
        .expect("timeout waiting for delivery")
        .expect("delivery stream ended")
}
