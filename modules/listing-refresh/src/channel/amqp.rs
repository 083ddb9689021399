use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions, BasicQosOptions,
    ConfirmSelectOptions, ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
};
use lapin::types::{AMQPValue, FieldTable, ShortString};
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties, Consumer, ExchangeKind};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use listing_common::{Config, ScrapeRequest};

use super::{ChannelError, Delivery, MessageChannel, Redelivery, ATTEMPT_HEADER, DEFERRALS_HEADER};

const CONSUMER_TAG: &str = "listing-refresh";
const PERSISTENT: u8 = 2;
/// Longest a message is parked before redelivery.
const MAX_DELAY_SECS: u64 = 24 * 60 * 60;
/// How long an idle delay queue outlives its message TTL.
const DELAY_QUEUE_IDLE_MS: u32 = 60_000;

/// Broker topology and connection settings.
#[derive(Debug, Clone)]
pub struct AmqpSettings {
    pub uri: String,
    pub exchange: String,
    pub queue: String,
    pub routing_key: String,
    pub connect_retries: u32,
    pub prefetch: u16,
}

impl AmqpSettings {
    pub fn from_config(config: &Config) -> Self {
        let prefetch = (config.max_concurrency * 2).clamp(1, u16::MAX as usize) as u16;
        Self {
            uri: config.amqp_uri(),
            exchange: config.rabbitmq_exchange.clone(),
            queue: config.rabbitmq_queue.clone(),
            routing_key: config.rabbitmq_routing_key.clone(),
            connect_retries: config.rabbitmq_connect_retries,
            prefetch,
        }
    }
}

/// Durable topic exchange + durable queue on RabbitMQ.
///
/// One connection and one AMQP channel are shared by every consumer slot;
/// the consumer stream sits behind an async mutex so slots take turns
/// pulling the next message.
pub struct AmqpChannel {
    connection: Connection,
    shared: Arc<Shared>,
    consumer: Mutex<Option<Consumer>>,
}

struct Shared {
    channel: Channel,
    exchange: String,
    queue: String,
    routing_key: String,
}

impl AmqpChannel {
    /// Connect with exponential backoff, declare the topology and start a
    /// publisher-only session (no consumer).
    pub async fn connect(settings: &AmqpSettings) -> Result<Self, ChannelError> {
        let connection = connect_with_retry(&settings.uri, settings.connect_retries).await?;
        let channel = connection.create_channel().await?;
        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await?;

        channel
            .exchange_declare(
                &settings.exchange,
                ExchangeKind::Topic,
                ExchangeDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await?;
        channel
            .queue_declare(
                &settings.queue,
                QueueDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await?;
        channel
            .queue_bind(
                &settings.queue,
                &settings.exchange,
                &settings.routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await?;

        info!(
            exchange = settings.exchange.as_str(),
            queue = settings.queue.as_str(),
            routing_key = settings.routing_key.as_str(),
            "Declared broker topology"
        );

        Ok(Self {
            connection,
            shared: Arc::new(Shared {
                channel,
                exchange: settings.exchange.clone(),
                queue: settings.queue.clone(),
                routing_key: settings.routing_key.clone(),
            }),
            consumer: Mutex::new(None),
        })
    }

    /// Set the prefetch window and start consuming the queue.
    pub async fn start_consuming(self, settings: &AmqpSettings) -> Result<Self, ChannelError> {
        self.shared
            .channel
            .basic_qos(settings.prefetch, BasicQosOptions::default())
            .await?;
        let consumer = self
            .shared
            .channel
            .basic_consume(
                &settings.queue,
                CONSUMER_TAG,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await?;
        info!(
            queue = settings.queue.as_str(),
            prefetch = settings.prefetch,
            "Consuming scrape requests"
        );
        *self.consumer.lock().await = Some(consumer);
        Ok(self)
    }
}

async fn connect_with_retry(uri: &str, retries: u32) -> Result<Connection, ChannelError> {
    let retries = retries.max(1);
    let mut attempt = 0;
    loop {
        attempt += 1;
        match Connection::connect(uri, ConnectionProperties::default()).await {
            Ok(connection) => {
                info!(attempt, "Connected to message broker");
                return Ok(connection);
            }
            Err(e) if attempt < retries => {
                let wait = Duration::from_secs(1u64 << attempt.min(6));
                warn!(
                    attempt,
                    retries,
                    wait_secs = wait.as_secs(),
                    error = %e,
                    "Broker connection failed, retrying"
                );
                tokio::time::sleep(wait).await;
            }
            Err(e) => {
                return Err(ChannelError::Connection(format!(
                    "giving up after {attempt} attempts: {e}"
                )));
            }
        }
    }
}

fn header_u32(headers: Option<&FieldTable>, key: &str) -> Option<u32> {
    let value = headers?.inner().get(&ShortString::from(key))?;
    match value {
        AMQPValue::LongUInt(v) => Some(*v),
        AMQPValue::LongInt(v) => u32::try_from(*v).ok(),
        AMQPValue::LongLongInt(v) => u32::try_from(*v).ok(),
        AMQPValue::ShortUInt(v) => Some(u32::from(*v)),
        AMQPValue::ShortShortUInt(v) => Some(u32::from(*v)),
        _ => None,
    }
}

fn counter_headers(attempt: u32, deferrals: u32) -> FieldTable {
    let mut headers = FieldTable::default();
    headers.insert(ShortString::from(ATTEMPT_HEADER), AMQPValue::LongUInt(attempt));
    headers.insert(ShortString::from(DEFERRALS_HEADER), AMQPValue::LongUInt(deferrals));
    headers
}

/// Holding queue for messages redelivered after `delay`, and its arguments.
///
/// Messages sit in the holding queue until their TTL runs out, then the
/// broker dead-letters them back to the work queue. Delays round up to
/// whole seconds so one holding queue serves every message with that
/// delay. Idle holding queues expire on their own.
fn delay_queue(
    queue: &str,
    exchange: &str,
    routing_key: &str,
    delay: Duration,
) -> (String, FieldTable) {
    let secs = delay
        .as_millis()
        .div_ceil(1000)
        .clamp(1, u128::from(MAX_DELAY_SECS)) as u32;
    let ttl_ms = secs * 1000;

    let mut arguments = FieldTable::default();
    arguments.insert(ShortString::from("x-message-ttl"), AMQPValue::LongUInt(ttl_ms));
    arguments.insert(
        ShortString::from("x-dead-letter-exchange"),
        AMQPValue::LongString(exchange.into()),
    );
    arguments.insert(
        ShortString::from("x-dead-letter-routing-key"),
        AMQPValue::LongString(routing_key.into()),
    );
    arguments.insert(
        ShortString::from("x-expires"),
        AMQPValue::LongUInt(ttl_ms.saturating_mul(2).saturating_add(DELAY_QUEUE_IDLE_MS)),
    );
    (format!("{queue}.delay.{secs}s"), arguments)
}

impl Shared {
    async fn publish(
        &self,
        payload: &[u8],
        attempt: u32,
        deferrals: u32,
    ) -> Result<(), ChannelError> {
        self.send(&self.exchange, &self.routing_key, payload, attempt, deferrals)
            .await
    }

    /// Park a copy of `payload` in the holding queue for `delay`.
    async fn publish_delayed(
        &self,
        payload: &[u8],
        attempt: u32,
        deferrals: u32,
        delay: Duration,
    ) -> Result<(), ChannelError> {
        let (queue, arguments) = delay_queue(&self.queue, &self.exchange, &self.routing_key, delay);
        // Declared on every use; an expired holding queue comes back.
        self.channel
            .queue_declare(
                &queue,
                QueueDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                arguments,
            )
            .await
            .map_err(|e| ChannelError::Publish(e.to_string()))?;
        self.send("", &queue, payload, attempt, deferrals).await
    }

    /// Publish persistently and wait for the broker's confirm.
    async fn send(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        attempt: u32,
        deferrals: u32,
    ) -> Result<(), ChannelError> {
        let properties = BasicProperties::default()
            .with_delivery_mode(PERSISTENT)
            .with_content_type(ShortString::from("application/json"))
            .with_headers(counter_headers(attempt, deferrals));

        let confirmation = self
            .channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions::default(),
                payload,
                properties,
            )
            .await
            .map_err(|e| ChannelError::Publish(e.to_string()))?
            .await
            .map_err(|e| ChannelError::Publish(e.to_string()))?;
        if confirmation.is_nack() {
            return Err(ChannelError::Publish(format!(
                "broker refused message for {routing_key}"
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl MessageChannel for AmqpChannel {
    async fn next(&self) -> Result<Option<Box<dyn Delivery>>, ChannelError> {
        let mut guard = self.consumer.lock().await;
        let Some(consumer) = guard.as_mut() else {
            return Ok(None);
        };
        match consumer.next().await {
            Some(Ok(inner)) => {
                let headers = inner.properties.headers().as_ref();
                let attempt = header_u32(headers, ATTEMPT_HEADER).unwrap_or(1).max(1);
                let deferrals = header_u32(headers, DEFERRALS_HEADER).unwrap_or(0);
                Ok(Some(Box::new(AmqpDelivery {
                    inner,
                    attempt,
                    deferrals,
                    shared: Arc::clone(&self.shared),
                })))
            }
            Some(Err(e)) => Err(ChannelError::Connection(e.to_string())),
            None => Ok(None),
        }
    }

    async fn publish(&self, request: &ScrapeRequest) -> Result<(), ChannelError> {
        let payload = request
            .to_payload()
            .map_err(|e| ChannelError::Publish(e.to_string()))?;
        self.shared.publish(&payload, 1, 0).await
    }

    async fn close(&self) -> Result<(), ChannelError> {
        self.consumer.lock().await.take();
        self.shared.channel.close(200, "shutdown").await?;
        self.connection.close(200, "shutdown").await?;
        info!("Message channel closed");
        Ok(())
    }
}

struct AmqpDelivery {
    inner: lapin::message::Delivery,
    attempt: u32,
    deferrals: u32,
    shared: Arc<Shared>,
}

#[async_trait]
impl Delivery for AmqpDelivery {
    fn payload(&self) -> &[u8] {
        &self.inner.data
    }

    fn attempt(&self) -> u32 {
        self.attempt
    }

    fn deferrals(&self) -> u32 {
        self.deferrals
    }

    async fn ack(self: Box<Self>) -> Result<(), ChannelError> {
        self.inner
            .ack(BasicAckOptions::default())
            .await
            .map_err(|e| ChannelError::Settle(e.to_string()))
    }

    async fn nack(self: Box<Self>, redelivery: Redelivery) -> Result<(), ChannelError> {
        let (delay, attempt, deferrals) = match redelivery {
            Redelivery::Requeue => {
                return self
                    .inner
                    .nack(BasicNackOptions {
                        requeue: true,
                        ..Default::default()
                    })
                    .await
                    .map_err(|e| ChannelError::Settle(e.to_string()));
            }
            Redelivery::Retry { delay } => (delay, self.attempt + 1, self.deferrals),
            Redelivery::Defer { delay } => (delay, self.attempt, self.deferrals + 1),
        };

        // The copy with the new counters is confirmed before the original
        // is acked, so a crash in between duplicates rather than loses it.
        match self
            .shared
            .publish_delayed(&self.inner.data, attempt, deferrals, delay)
            .await
        {
            Ok(()) => {
                debug!(
                    attempt,
                    deferrals,
                    delay_ms = delay.as_millis() as u64,
                    "Parked message for delayed redelivery"
                );
                self.inner
                    .ack(BasicAckOptions::default())
                    .await
                    .map_err(|e| ChannelError::Settle(e.to_string()))
            }
            Err(e) => {
                warn!(error = %e, "Could not park message, returning it to the queue");
                self.inner
                    .nack(BasicNackOptions {
                        requeue: true,
                        ..Default::default()
                    })
                    .await
                    .map_err(|e| ChannelError::Settle(e.to_string()))?;
                Err(e)
            }
        }
    }
}
