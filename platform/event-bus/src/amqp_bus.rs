//! AMQP (RabbitMQ) implementation of the EventBus trait

use crate::{
    Acknowledger, BusError, BusMessage, BusResult, Delivery, EventBus, QueueTopology,
    RETRY_COUNT_HEADER,
};
use async_trait::async_trait;
use futures::stream::{BoxStream, StreamExt};
use lapin::{
    acker::Acker,
    options::{
        BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicPublishOptions,
        BasicQosOptions, BasicRejectOptions, ConfirmSelectOptions, ExchangeDeclareOptions,
        QueueBindOptions, QueueDeclareOptions,
    },
    publisher_confirm::Confirmation,
    types::{AMQPValue, FieldTable, LongString, ShortString},
    BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify};

const PERSISTENT_DELIVERY_MODE: u8 = 2;
const REPLY_SUCCESS: u16 = 200;

/// How long `close` waits for delivered messages to be settled
pub const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

struct AmqpState {
    connection: Connection,
    channel: Channel,
    consumer_tags: Vec<String>,
}

/// Count of deliveries handed out but not yet settled or dropped
#[derive(Default)]
struct InFlight {
    count: AtomicUsize,
    idle: Notify,
}

impl InFlight {
    fn track(self: &Arc<Self>) -> InFlightGuard {
        self.count.fetch_add(1, Ordering::SeqCst);
        InFlightGuard {
            in_flight: self.clone(),
        }
    }

    fn len(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }

    /// Wait until nothing is in flight; false if `timeout` ran out first
    async fn wait_idle(&self, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, async {
            while self.len() > 0 {
                self.idle.notified().await;
            }
        })
        .await
        .is_ok()
    }
}

struct InFlightGuard {
    in_flight: Arc<InFlight>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        if self.in_flight.count.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.in_flight.idle.notify_one();
        }
    }
}

/// EventBus implementation over a single AMQP connection and channel
///
/// This is the production implementation. One instance is created at startup
/// and shared by every producer and consumer in the process.
///
/// # Example
/// ```rust,no_run
/// use event_bus::{AmqpBus, BusMessage, EventBus, QueueTopology};
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let topology = QueueTopology::new("work", "work_dlx", "work_failed");
/// let bus = AmqpBus::initialize("amqp://localhost:5672", &topology).await?;
///
/// bus.publish(BusMessage::new("work", b"hello".to_vec()).with_message_id("job-1"))
///     .await?;
/// bus.close().await?;
/// # Ok(())
/// # }
/// ```
pub struct AmqpBus {
    state: Mutex<Option<AmqpState>>,
    in_flight: Arc<InFlight>,
    next_consumer: AtomicUsize,
    drain_timeout: Duration,
}

impl AmqpBus {
    /// Open the connection and its one channel (with publisher confirms)
    ///
    /// # Errors
    /// * `BusError::BrokerUnavailable` if the connection or channel cannot be created
    pub async fn connect(url: &str) -> BusResult<Self> {
        let connection = Connection::connect(url, ConnectionProperties::default())
            .await
            .map_err(|e| BusError::BrokerUnavailable(format!("connect to broker: {}", e)))?;

        let channel = connection
            .create_channel()
            .await
            .map_err(|e| BusError::BrokerUnavailable(format!("create channel: {}", e)))?;

        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(|e| BusError::BrokerUnavailable(format!("enable publisher confirms: {}", e)))?;

        tracing::info!("AMQP connection and channel established");

        Ok(Self {
            state: Mutex::new(Some(AmqpState {
                connection,
                channel,
                consumer_tags: Vec::new(),
            })),
            in_flight: Arc::new(InFlight::default()),
            next_consumer: AtomicUsize::new(0),
            drain_timeout: DEFAULT_DRAIN_TIMEOUT,
        })
    }

    /// Bound how long `close` waits for in-flight deliveries to be settled
    pub fn with_drain_timeout(mut self, drain_timeout: Duration) -> Self {
        self.drain_timeout = drain_timeout;
        self
    }

    /// Connect and declare `topology`; failure here is fatal at process start
    pub async fn initialize(url: &str, topology: &QueueTopology) -> BusResult<Self> {
        let bus = Self::connect(url).await?;
        bus.declare_topology(topology).await?;

        tracing::info!(
            queue = %topology.queue,
            dead_letter_exchange = %topology.dead_letter_exchange,
            dead_letter_queue = %topology.dead_letter_queue,
            "AMQP topology declared"
        );

        Ok(bus)
    }

    async fn channel(&self) -> BusResult<Channel> {
        let state = self.state.lock().await;
        state
            .as_ref()
            .map(|s| s.channel.clone())
            .ok_or(BusError::NotInitialized)
    }
}

#[async_trait]
impl EventBus for AmqpBus {
    async fn declare_topology(&self, topology: &QueueTopology) -> BusResult<()> {
        let channel = self.channel().await?;

        let mut queue_args = FieldTable::default();
        queue_args.insert(
            "x-message-ttl".into(),
            AMQPValue::LongUInt(topology.message_ttl_millis()),
        );
        queue_args.insert(
            "x-dead-letter-exchange".into(),
            AMQPValue::LongString(topology.dead_letter_exchange.clone().into()),
        );
        queue_args.insert(
            "x-dead-letter-routing-key".into(),
            AMQPValue::LongString(topology.dead_letter_routing_key.clone().into()),
        );

        let durable = QueueDeclareOptions {
            durable: true,
            ..Default::default()
        };

        channel
            .queue_declare(&topology.queue, durable, queue_args)
            .await
            .map_err(|e| BusError::TopologyError(format!("queue {}: {}", topology.queue, e)))?;

        channel
            .exchange_declare(
                &topology.dead_letter_exchange,
                ExchangeKind::Direct,
                ExchangeDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| {
                BusError::TopologyError(format!(
                    "exchange {}: {}",
                    topology.dead_letter_exchange, e
                ))
            })?;

        channel
            .queue_declare(&topology.dead_letter_queue, durable, FieldTable::default())
            .await
            .map_err(|e| {
                BusError::TopologyError(format!("queue {}: {}", topology.dead_letter_queue, e))
            })?;

        channel
            .queue_bind(
                &topology.dead_letter_queue,
                &topology.dead_letter_exchange,
                &topology.dead_letter_routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| BusError::TopologyError(format!("bind dead-letter queue: {}", e)))?;

        Ok(())
    }

    async fn publish(&self, message: BusMessage) -> BusResult<()> {
        let channel = self.channel().await?;

        let confirm = channel
            .basic_publish(
                "",
                &message.queue,
                BasicPublishOptions::default(),
                &message.payload,
                to_properties(&message),
            )
            .await
            .map_err(|e| BusError::PublishError(e.to_string()))?
            .await
            .map_err(|e| BusError::PublishError(e.to_string()))?;

        if let Confirmation::Nack(_) = confirm {
            return Err(BusError::PublishError(format!(
                "broker nacked message {}",
                message.message_id.as_deref().unwrap_or("<none>")
            )));
        }

        Ok(())
    }

    async fn consume(&self, queue: &str, prefetch: u16) -> BusResult<BoxStream<'static, Delivery>> {
        let channel = self.channel().await?;

        channel
            .basic_qos(prefetch, BasicQosOptions::default())
            .await
            .map_err(|e| BusError::ConsumeError(format!("set prefetch: {}", e)))?;

        let consumer_tag = format!(
            "{}-consumer-{}-{}",
            queue,
            std::process::id(),
            self.next_consumer.fetch_add(1, Ordering::SeqCst)
        );
        let consumer = channel
            .basic_consume(
                queue,
                &consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| BusError::ConsumeError(e.to_string()))?;

        if let Some(state) = self.state.lock().await.as_mut() {
            state.consumer_tags.push(consumer_tag);
        }

        let queue = queue.to_string();
        let in_flight = self.in_flight.clone();
        let stream = consumer.filter_map(move |delivery| {
            let queue = queue.clone();
            let in_flight = in_flight.clone();
            async move {
                match delivery {
                    Ok(delivery) => {
                        let message = from_delivery(&queue, delivery.properties, delivery.data);
                        let acker = AmqpAcker {
                            acker: delivery.acker,
                            _in_flight: in_flight.track(),
                        };
                        Some(Delivery::new(message, Box::new(acker)))
                    }
                    Err(e) => {
                        tracing::warn!(queue = %queue, error = %e, "AMQP consumer error");
                        None
                    }
                }
            }
        });

        Ok(stream.boxed())
    }

    async fn close(&self) -> BusResult<()> {
        let (channel, consumer_tags) = {
            let state = self.state.lock().await;
            let Some(state) = state.as_ref() else {
                return Ok(());
            };
            (state.channel.clone(), state.consumer_tags.clone())
        };

        // Stop new deliveries; handlers still settle and requeue over the open channel
        for tag in &consumer_tags {
            if let Err(e) = channel
                .basic_cancel(tag, BasicCancelOptions::default())
                .await
            {
                tracing::debug!(consumer_tag = %tag, error = %e, "AMQP consumer already cancelled");
            }
        }

        if !self.in_flight.wait_idle(self.drain_timeout).await {
            tracing::warn!(
                in_flight = self.in_flight.len(),
                "Closing AMQP channel with unsettled deliveries; the broker will redeliver them"
            );
        }

        let Some(state) = self.state.lock().await.take() else {
            return Ok(());
        };

        if let Err(e) = state.channel.close(REPLY_SUCCESS, "closing").await {
            tracing::debug!(error = %e, "AMQP channel already closed");
        }
        if let Err(e) = state.connection.close(REPLY_SUCCESS, "closing").await {
            tracing::debug!(error = %e, "AMQP connection already closed");
        }

        tracing::info!("AMQP connection closed");
        Ok(())
    }
}

struct AmqpAcker {
    acker: Acker,
    _in_flight: InFlightGuard,
}

#[async_trait]
impl Acknowledger for AmqpAcker {
    async fn ack(&self) -> BusResult<()> {
        self.acker
            .ack(BasicAckOptions::default())
            .await
            .map_err(|e| BusError::AckError(e.to_string()))
    }

    async fn reject(&self) -> BusResult<()> {
        self.acker
            .reject(BasicRejectOptions { requeue: false })
            .await
            .map_err(|e| BusError::AckError(e.to_string()))
    }
}

fn to_properties(message: &BusMessage) -> BasicProperties {
    // A received message keeps every property and header it arrived with
    let mut properties = message.broker_properties.clone().unwrap_or_default();

    let mut headers = properties.headers().clone().unwrap_or_default();
    if let Some(extra) = &message.headers {
        for (key, value) in extra {
            headers.insert(
                ShortString::from(key.clone()),
                AMQPValue::LongString(LongString::from(value.clone())),
            );
        }
    }
    headers.insert(
        RETRY_COUNT_HEADER.into(),
        AMQPValue::LongLongInt(i64::from(message.retry_count)),
    );

    properties = properties.with_headers(headers);
    if message.persistent {
        properties = properties.with_delivery_mode(PERSISTENT_DELIVERY_MODE);
    }
    if let Some(id) = &message.message_id {
        properties = properties.with_message_id(ShortString::from(id.clone()));
    }
    properties
}

fn from_delivery(queue: &str, properties: BasicProperties, payload: Vec<u8>) -> BusMessage {
    let mut retry_count = 0;
    let mut headers = HashMap::new();

    if let Some(table) = properties.headers() {
        for (key, value) in table.inner() {
            if key.as_str() == RETRY_COUNT_HEADER {
                retry_count = header_as_u32(value).unwrap_or(0);
            } else if let Some(text) = header_as_string(value) {
                headers.insert(key.as_str().to_string(), text);
            }
        }
    }

    BusMessage {
        queue: queue.to_string(),
        payload,
        message_id: properties
            .message_id()
            .as_ref()
            .map(|id| id.as_str().to_string()),
        retry_count,
        persistent: *properties.delivery_mode() == Some(PERSISTENT_DELIVERY_MODE),
        headers: (!headers.is_empty()).then_some(headers),
        broker_properties: Some(properties),
    }
}

/// Integer headers arrive in whatever width the publishing client chose
fn header_as_u32(value: &AMQPValue) -> Option<u32> {
    let n: i64 = match value {
        AMQPValue::ShortShortInt(v) => i64::from(*v),
        AMQPValue::ShortShortUInt(v) => i64::from(*v),
        AMQPValue::ShortInt(v) => i64::from(*v),
        AMQPValue::ShortUInt(v) => i64::from(*v),
        AMQPValue::LongInt(v) => i64::from(*v),
        AMQPValue::LongUInt(v) => i64::from(*v),
        AMQPValue::LongLongInt(v) => *v,
        AMQPValue::Double(v) => *v as i64,
        AMQPValue::Float(v) => *v as i64,
        AMQPValue::LongString(s) => String::from_utf8_lossy(s.as_bytes()).trim().parse().ok()?,
        _ => return None,
    };
    u32::try_from(n).ok()
}

fn header_as_string(value: &AMQPValue) -> Option<String> {
    match value {
        AMQPValue::LongString(s) => Some(String::from_utf8_lossy(s.as_bytes()).into_owned()),
        AMQPValue::ShortString(s) => Some(s.as_str().to_string()),
        _ => None,
    }
}
