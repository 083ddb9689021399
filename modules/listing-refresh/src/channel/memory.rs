use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use tokio::sync::Notify;

use listing_common::{PropertyId, ScrapeRequest};

use super::{ChannelError, Delivery, MessageChannel, Redelivery};

/// Process-local FIFO channel with the same settle semantics as the broker.
/// Used by tests and for local runs; every settlement is recorded.
#[derive(Clone, Default)]
pub struct MemoryChannel {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    queue: Mutex<VecDeque<Message>>,
    settlements: Mutex<Vec<Settlement>>,
    available: Notify,
    settled: Notify,
    closed: AtomicBool,
}

#[derive(Debug, Clone)]
struct Message {
    payload: Vec<u8>,
    attempt: u32,
    deferrals: u32,
}

/// Record of how one delivery was settled. `redelivery` is `None` for an ack.
#[derive(Debug, Clone, PartialEq)]
pub struct Settlement {
    pub payload: Vec<u8>,
    pub attempt: u32,
    pub deferrals: u32,
    pub redelivery: Option<Redelivery>,
}

impl Settlement {
    pub fn is_ack(&self) -> bool {
        self.redelivery.is_none()
    }

    pub fn property_id(&self) -> Option<PropertyId> {
        ScrapeRequest::from_slice(&self.payload)
            .ok()
            .map(|r| r.property_id)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl Inner {
    fn push(&self, message: Message) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        lock(&self.queue).push_back(message);
        self.available.notify_waiters();
    }

    fn record(&self, settlement: Settlement) {
        lock(&self.settlements).push(settlement);
        self.settled.notify_waiters();
    }
}

impl MemoryChannel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueue a raw payload, e.g. one that is not valid JSON.
    pub fn push_raw(&self, payload: impl Into<Vec<u8>>) {
        self.inner.push(Message {
            payload: payload.into(),
            attempt: 1,
            deferrals: 0,
        });
    }

    pub fn settlements(&self) -> Vec<Settlement> {
        lock(&self.inner.settlements).clone()
    }

    pub fn acks(&self) -> Vec<Settlement> {
        self.settlements().into_iter().filter(Settlement::is_ack).collect()
    }

    /// Messages waiting for delivery (delayed redeliveries not included).
    pub fn queued(&self) -> usize {
        lock(&self.inner.queue).len()
    }

    /// Resolve once at least `count` deliveries were acknowledged.
    pub async fn wait_for_acks(&self, count: usize) {
        loop {
            let notified = self.inner.settled.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.acks().len() >= count {
                return;
            }
            notified.await;
        }
    }
}

#[async_trait]
impl MessageChannel for MemoryChannel {
    async fn next(&self) -> Result<Option<Box<dyn Delivery>>, ChannelError> {
        loop {
            let notified = self.inner.available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.inner.closed.load(Ordering::Acquire) {
                return Ok(None);
            }
            let message = lock(&self.inner.queue).pop_front();
            if let Some(message) = message {
                return Ok(Some(Box::new(MemoryDelivery {
                    message,
                    inner: Arc::clone(&self.inner),
                })));
            }
            notified.await;
        }
    }

    async fn publish(&self, request: &ScrapeRequest) -> Result<(), ChannelError> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(ChannelError::Closed);
        }
        let payload = request
            .to_payload()
            .map_err(|e| ChannelError::Publish(e.to_string()))?;
        self.push_raw(payload);
        Ok(())
    }

    async fn close(&self) -> Result<(), ChannelError> {
        self.inner.closed.store(true, Ordering::Release);
        self.inner.available.notify_waiters();
        Ok(())
    }
}

struct MemoryDelivery {
    message: Message,
    inner: Arc<Inner>,
}

impl MemoryDelivery {
    fn settlement(&self, redelivery: Option<Redelivery>) -> Settlement {
        Settlement {
            payload: self.message.payload.clone(),
            attempt: self.message.attempt,
            deferrals: self.message.deferrals,
            redelivery,
        }
    }
}

#[async_trait]
impl Delivery for MemoryDelivery {
    fn payload(&self) -> &[u8] {
        &self.message.payload
    }

    fn attempt(&self) -> u32 {
        self.message.attempt
    }

    fn deferrals(&self) -> u32 {
        self.message.deferrals
    }

    async fn ack(self: Box<Self>) -> Result<(), ChannelError> {
        self.inner.record(self.settlement(None));
        Ok(())
    }

    async fn nack(self: Box<Self>, redelivery: Redelivery) -> Result<(), ChannelError> {
        self.inner.record(self.settlement(Some(redelivery)));

        let mut next = self.message.clone();
        let delay = match redelivery {
            Redelivery::Retry { delay } => {
                next.attempt += 1;
                delay
            }
            Redelivery::Defer { delay } => {
                next.deferrals += 1;
                delay
            }
            Redelivery::Requeue => {
                self.inner.push(next);
                return Ok(());
            }
        };

        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            inner.push(next);
        });
        Ok(())
    }
}
