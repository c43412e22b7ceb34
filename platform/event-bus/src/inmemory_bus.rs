//! In-memory implementation of the EventBus trait for testing and development

use crate::{Acknowledger, BusError, BusMessage, BusResult, Delivery, EventBus, QueueTopology};
use async_trait::async_trait;
use futures::stream::{BoxStream, StreamExt};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

/// EventBus implementation that behaves like a single-node broker
///
/// This implementation is suitable for:
/// - Unit tests (no external dependencies)
/// - Local development without Docker
/// - Integration tests that exercise retry and dead-letter routing
///
/// Queues are FIFO. A message rejected (or expired past the queue TTL) is
/// routed through the queue's dead-letter exchange to every queue bound with
/// the matching routing key. Prefetch is enforced per queue rather than per
/// consumer.
///
/// # Example
/// ```rust
/// use event_bus::{BusMessage, EventBus, InMemoryBus, QueueTopology};
/// use futures::StreamExt;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let bus = InMemoryBus::new();
/// bus.declare_topology(&QueueTopology::new("jobs", "jobs_dlx", "jobs_failed")).await?;
///
/// let mut deliveries = bus.consume("jobs", 1).await?;
/// bus.publish(BusMessage::new("jobs", b"hello".to_vec())).await?;
///
/// let delivery = deliveries.next().await.unwrap();
/// assert_eq!(delivery.message().payload, b"hello");
/// delivery.reject().await?;
///
/// assert_eq!(bus.depth("jobs_failed"), 1);
/// # Ok(())
/// # }
/// ```
#[derive(Clone, Default)]
pub struct InMemoryBus {
    state: Arc<Mutex<BrokerState>>,
}

#[derive(Default)]
struct BrokerState {
    queues: HashMap<String, QueueState>,
    exchanges: HashMap<String, Vec<Binding>>,
    closed: bool,
}

struct QueueState {
    messages: VecDeque<Enqueued>,
    message_ttl: Option<Duration>,
    dead_letter_exchange: Option<String>,
    dead_letter_routing_key: Option<String>,
    unacked: usize,
    notify: Arc<Notify>,
}

struct Enqueued {
    message: BusMessage,
    enqueued_at: Instant,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Binding {
    routing_key: String,
    queue: String,
}

enum Next {
    Ready(BusMessage),
    Wait(Arc<Notify>),
    Closed,
}

impl QueueState {
    fn new(
        message_ttl: Option<Duration>,
        dead_letter_exchange: Option<String>,
        dead_letter_routing_key: Option<String>,
    ) -> Self {
        Self {
            messages: VecDeque::new(),
            message_ttl,
            dead_letter_exchange,
            dead_letter_routing_key,
            unacked: 0,
            notify: Arc::new(Notify::new()),
        }
    }

    fn push(&mut self, message: BusMessage) {
        self.messages.push_back(Enqueued {
            message,
            enqueued_at: Instant::now(),
        });
        self.notify.notify_one();
    }
}

impl BrokerState {
    fn declare_queue(
        &mut self,
        name: &str,
        message_ttl: Option<Duration>,
        dead_letter_exchange: Option<String>,
        dead_letter_routing_key: Option<String>,
    ) -> BusResult<()> {
        match self.queues.get(name) {
            Some(existing) => {
                // Redeclaring with different arguments is a precondition failure on a real broker
                if existing.message_ttl != message_ttl
                    || existing.dead_letter_exchange != dead_letter_exchange
                    || existing.dead_letter_routing_key != dead_letter_routing_key
                {
                    return Err(BusError::TopologyError(format!(
                        "queue {} already declared with different arguments",
                        name
                    )));
                }
            }
            None => {
                self.queues.insert(
                    name.to_string(),
                    QueueState::new(message_ttl, dead_letter_exchange, dead_letter_routing_key),
                );
            }
        }
        Ok(())
    }

    fn next_message(&mut self, queue: &str, prefetch: u16) -> Next {
        if self.closed {
            return Next::Closed;
        }

        loop {
            let Some(q) = self.queues.get_mut(queue) else {
                return Next::Closed;
            };

            if prefetch > 0 && q.unacked >= usize::from(prefetch) {
                return Next::Wait(q.notify.clone());
            }

            let Some(front) = q.messages.pop_front() else {
                return Next::Wait(q.notify.clone());
            };

            let expired = q
                .message_ttl
                .is_some_and(|ttl| front.enqueued_at.elapsed() > ttl);
            if expired {
                self.dead_letter(queue, front.message);
                continue;
            }

            q.unacked += 1;
            return Next::Ready(front.message);
        }
    }

    fn settle(&mut self, queue: &str) {
        if let Some(q) = self.queues.get_mut(queue) {
            q.unacked = q.unacked.saturating_sub(1);
            q.notify.notify_one();
        }
    }

    fn dead_letter(&mut self, from_queue: &str, message: BusMessage) {
        let Some(source) = self.queues.get(from_queue) else {
            return;
        };
        let Some(exchange) = source.dead_letter_exchange.clone() else {
            tracing::debug!(queue = %from_queue, "No dead-letter exchange, message discarded");
            return;
        };
        // Without an explicit dead-letter routing key the original routing key (queue name) is kept
        let routing_key = source
            .dead_letter_routing_key
            .clone()
            .unwrap_or_else(|| from_queue.to_string());

        let targets: Vec<String> = self
            .exchanges
            .get(&exchange)
            .map(|bindings| {
                bindings
                    .iter()
                    .filter(|b| b.routing_key == routing_key)
                    .map(|b| b.queue.clone())
                    .collect()
            })
            .unwrap_or_default();

        if targets.is_empty() {
            tracing::warn!(
                queue = %from_queue,
                exchange = %exchange,
                routing_key = %routing_key,
                "Dead-lettered message matched no binding and was discarded"
            );
            return;
        }

        for target in targets {
            if let Some(q) = self.queues.get_mut(&target) {
                q.push(message.clone());
            }
        }
    }
}

impl InMemoryBus {
    /// Create a new in-memory broker with no queues declared
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        // A panic while holding the lock leaves the maps consistent, so keep going
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Number of messages ready for delivery in `queue`
    pub fn depth(&self, queue: &str) -> usize {
        self.lock()
            .queues
            .get(queue)
            .map_or(0, |q| q.messages.len())
    }

    /// Number of delivered but unsettled messages in `queue`
    pub fn unacked(&self, queue: &str) -> usize {
        self.lock().queues.get(queue).map_or(0, |q| q.unacked)
    }

    /// Snapshot of the messages ready in `queue`, head first
    pub fn messages(&self, queue: &str) -> Vec<BusMessage> {
        self.lock()
            .queues
            .get(queue)
            .map(|q| q.messages.iter().map(|e| e.message.clone()).collect())
            .unwrap_or_default()
    }

    /// Names of all declared queues, sorted
    pub fn queue_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.lock().queues.keys().cloned().collect();
        names.sort();
        names
    }

    /// Number of bindings on `exchange`, or `None` if it was never declared
    pub fn binding_count(&self, exchange: &str) -> Option<usize> {
        self.lock().exchanges.get(exchange).map(Vec::len)
    }
}

#[async_trait]
impl EventBus for InMemoryBus {
    async fn declare_topology(&self, topology: &QueueTopology) -> BusResult<()> {
        let mut state = self.lock();
        if state.closed {
            return Err(BusError::NotInitialized);
        }

        state.declare_queue(
            &topology.queue,
            Some(topology.message_ttl),
            Some(topology.dead_letter_exchange.clone()),
            Some(topology.dead_letter_routing_key.clone()),
        )?;
        state.declare_queue(&topology.dead_letter_queue, None, None, None)?;

        let binding = Binding {
            routing_key: topology.dead_letter_routing_key.clone(),
            queue: topology.dead_letter_queue.clone(),
        };
        let bindings = state
            .exchanges
            .entry(topology.dead_letter_exchange.clone())
            .or_default();
        if !bindings.contains(&binding) {
            bindings.push(binding);
        }

        Ok(())
    }

    async fn publish(&self, message: BusMessage) -> BusResult<()> {
        let mut state = self.lock();
        if state.closed {
            return Err(BusError::NotInitialized);
        }

        // Unlike a real broker (which silently drops), an undeclared queue is a setup bug
        let queue = state
            .queues
            .get_mut(&message.queue)
            .ok_or(BusError::NotInitialized)?;
        queue.push(message);

        Ok(())
    }

    async fn consume(&self, queue: &str, prefetch: u16) -> BusResult<BoxStream<'static, Delivery>> {
        {
            let state = self.lock();
            if state.closed || !state.queues.contains_key(queue) {
                return Err(BusError::NotInitialized);
            }
        }

        let bus = self.clone();
        let queue = queue.to_string();

        let stream = async_stream::stream! {
            loop {
                let next = bus.lock().next_message(&queue, prefetch);
                match next {
                    Next::Ready(message) => {
                        let acker = InMemoryAcker {
                            bus: bus.clone(),
                            queue: queue.clone(),
                            message: message.clone(),
                            settled: AtomicBool::new(false),
                        };
                        yield Delivery::new(message, Box::new(acker));
                    }
                    Next::Wait(notify) => notify.notified().await,
                    Next::Closed => break,
                }
            }
        };

        Ok(stream.boxed())
    }

    async fn close(&self) -> BusResult<()> {
        let mut state = self.lock();
        if state.closed {
            return Ok(());
        }
        state.closed = true;

        for q in state.queues.values() {
            q.notify.notify_waiters();
            q.notify.notify_one();
        }

        Ok(())
    }
}

struct InMemoryAcker {
    bus: InMemoryBus,
    queue: String,
    message: BusMessage,
    settled: AtomicBool,
}

impl InMemoryAcker {
    fn settle_once(&self) -> BusResult<()> {
        if self.settled.swap(true, Ordering::SeqCst) {
            return Err(BusError::AckError("delivery already settled".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl Acknowledger for InMemoryAcker {
    async fn ack(&self) -> BusResult<()> {
        self.settle_once()?;
        self.bus.lock().settle(&self.queue);
        Ok(())
    }

    async fn reject(&self) -> BusResult<()> {
        self.settle_once()?;
        let mut state = self.bus.lock();
        state.settle(&self.queue);
        state.dead_letter(&self.queue, self.message.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn topology() -> QueueTopology {
        QueueTopology::new("work", "work_dlx", "work_failed")
    }

    async fn next(stream: &mut BoxStream<'static, Delivery>) -> Delivery {
        tokio::time::timeout(Duration::from_secs(1), stream.next())
            .await
            .expect("timeout")
            .expect("stream ended")
    }

    #[tokio::test]
    async fn test_publish_and_consume() {
        let bus = InMemoryBus::new();
        bus.declare_topology(&topology()).await.unwrap();

        let mut stream = bus.consume("work", 10).await.unwrap();
        bus.publish(BusMessage::new("work", b"test message".to_vec()).with_message_id("m-1"))
            .await
            .unwrap();

        let delivery = next(&mut stream).await;
        assert_eq!(delivery.message().payload, b"test message");
        assert_eq!(delivery.message().message_id.as_deref(), Some("m-1"));
        assert_eq!(bus.unacked("work"), 1);

        delivery.ack().await.unwrap();
        assert_eq!(bus.unacked("work"), 0);
        assert_eq!(bus.depth("work_failed"), 0);
    }

    #[tokio::test]
    async fn test_messages_delivered_in_order() {
        let bus = InMemoryBus::new();
        bus.declare_topology(&topology()).await.unwrap();
        let mut stream = bus.consume("work", 0).await.unwrap();

        for i in 0..5 {
            bus.publish(BusMessage::new("work", format!("message {}", i).into_bytes()))
                .await
                .unwrap();
        }

        for i in 0..5 {
            let delivery = next(&mut stream).await;
            assert_eq!(delivery.message().payload, format!("message {}", i).into_bytes());
            delivery.ack().await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_declare_topology_twice_is_noop() {
        let bus = InMemoryBus::new();
        bus.declare_topology(&topology()).await.unwrap();
        bus.declare_topology(&topology()).await.unwrap();

        assert_eq!(bus.queue_names(), vec!["work".to_string(), "work_failed".to_string()]);
        assert_eq!(bus.binding_count("work_dlx"), Some(1));
    }

    #[tokio::test]
    async fn test_redeclare_with_different_ttl_fails() {
        let bus = InMemoryBus::new();
        bus.declare_topology(&topology()).await.unwrap();

        let changed = topology().with_message_ttl(Duration::from_secs(5));
        let result = bus.declare_topology(&changed).await;
        assert!(matches!(result, Err(BusError::TopologyError(_))));
    }

    #[tokio::test]
    async fn test_publish_before_declare_is_not_initialized() {
        let bus = InMemoryBus::new();

        let result = bus.publish(BusMessage::new("work", Vec::new())).await;
        assert!(matches!(result, Err(BusError::NotInitialized)));
    }

    #[tokio::test]
    async fn test_reject_routes_to_dead_letter_queue() {
        let bus = InMemoryBus::new();
        bus.declare_topology(&topology()).await.unwrap();
        let mut stream = bus.consume("work", 1).await.unwrap();

        bus.publish(BusMessage::new("work", b"poison".to_vec()).with_retry_count(3))
            .await
            .unwrap();
        next(&mut stream).await.reject().await.unwrap();

        let failed = bus.messages("work_failed");
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].payload, b"poison");
        assert_eq!(failed[0].retry_count, 3);
        assert_eq!(bus.depth("work"), 0);
        assert_eq!(bus.unacked("work"), 0);
    }

    #[tokio::test]
    async fn test_settling_twice_fails() {
        let bus = InMemoryBus::new();
        bus.declare_topology(&topology()).await.unwrap();
        let mut stream = bus.consume("work", 1).await.unwrap();
        bus.publish(BusMessage::new("work", Vec::new())).await.unwrap();

        let delivery = next(&mut stream).await;
        let acker = InMemoryAcker {
            bus: bus.clone(),
            queue: "work".to_string(),
            message: delivery.message().clone(),
            settled: AtomicBool::new(false),
        };
        acker.ack().await.unwrap();
        assert!(matches!(acker.reject().await, Err(BusError::AckError(_))));
    }

    #[tokio::test]
    async fn test_prefetch_limits_unsettled_deliveries() {
        let bus = InMemoryBus::new();
        bus.declare_topology(&topology()).await.unwrap();
        let mut stream = bus.consume("work", 1).await.unwrap();

        bus.publish(BusMessage::new("work", b"a".to_vec())).await.unwrap();
        bus.publish(BusMessage::new("work", b"b".to_vec())).await.unwrap();

        let first = next(&mut stream).await;
        let blocked = tokio::time::timeout(Duration::from_millis(50), stream.next()).await;
        assert!(blocked.is_err(), "second delivery must wait for the first to settle");

        first.ack().await.unwrap();
        let second = next(&mut stream).await;
        assert_eq!(second.message().payload, b"b");
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_message_is_dead_lettered() {
        let bus = InMemoryBus::new();
        let short = topology().with_message_ttl(Duration::from_secs(60));
        bus.declare_topology(&short).await.unwrap();

        bus.publish(BusMessage::new("work", b"stale".to_vec())).await.unwrap();
        tokio::time::advance(Duration::from_secs(61)).await;
        bus.publish(BusMessage::new("work", b"fresh".to_vec())).await.unwrap();

        let mut stream = bus.consume("work", 1).await.unwrap();
        let delivery = next(&mut stream).await;
        assert_eq!(delivery.message().payload, b"fresh");
        assert_eq!(bus.messages("work_failed")[0].payload, b"stale");
    }

    #[tokio::test]
    async fn test_dead_letter_without_matching_binding_is_dropped() {
        let bus = InMemoryBus::new();
        {
            let mut state = bus.lock();
            state
                .declare_queue("orphan", None, Some("dlx".to_string()), None)
                .unwrap();
            state.declare_queue("sink", None, None, None).unwrap();
            state.exchanges.insert(
                "dlx".to_string(),
                vec![Binding {
                    routing_key: String::new(),
                    queue: "sink".to_string(),
                }],
            );
        }

        let mut stream = bus.consume("orphan", 1).await.unwrap();
        bus.publish(BusMessage::new("orphan", Vec::new())).await.unwrap();
        next(&mut stream).await.reject().await.unwrap();

        // Routing key defaults to the queue name, which does not match the "" binding
        assert_eq!(bus.depth("sink"), 0);
    }

    #[tokio::test]
    async fn test_close_ends_stream_and_blocks_publish() {
        let bus = InMemoryBus::new();
        bus.declare_topology(&topology()).await.unwrap();
        let mut stream = bus.consume("work", 1).await.unwrap();

        bus.close().await.unwrap();
        bus.close().await.unwrap();

        let ended = tokio::time::timeout(Duration::from_secs(1), stream.next())
            .await
            .expect("timeout");
        assert!(ended.is_none());

        let result = bus.publish(BusMessage::new("work", Vec::new())).await;
        assert!(matches!(result, Err(BusError::NotInitialized)));
    }
}
