//! Queue transport between the record-store host and the worker.
//!
//! A [`MessageChannel`] hands out [`Delivery`] values one at a time. Every
//! delivery must be settled exactly once, either acknowledged (terminal) or
//! handed back for redelivery.

pub mod amqp;
pub mod memory;

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use listing_common::ScrapeRequest;

pub use amqp::{AmqpChannel, AmqpSettings};
pub use memory::{MemoryChannel, Settlement};

/// Header carrying the 1-based attempt number of a redelivered message.
pub const ATTEMPT_HEADER: &str = "x-refresh-attempt";
/// Header carrying how many times a message was deferred behind an
/// in-flight reconciliation of the same property.
pub const DEFERRALS_HEADER: &str = "x-refresh-deferrals";

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("channel connection failed: {0}")]
    Connection(String),

    #[error("publish failed: {0}")]
    Publish(String),

    #[error("settling delivery failed: {0}")]
    Settle(String),

    #[error("channel is closed")]
    Closed,
}

impl From<lapin::Error> for ChannelError {
    fn from(e: lapin::Error) -> Self {
        ChannelError::Connection(e.to_string())
    }
}

/// How a delivery goes back to the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Redelivery {
    /// Deliver again after `delay` as the next attempt.
    Retry { delay: Duration },
    /// Deliver again after `delay` without counting an attempt; the
    /// deferral count goes up instead.
    Defer { delay: Duration },
    /// Hand back immediately with counters unchanged.
    Requeue,
}

/// One received message.
#[async_trait]
pub trait Delivery: Send {
    fn payload(&self) -> &[u8];

    /// 1-based attempt number.
    fn attempt(&self) -> u32;

    fn deferrals(&self) -> u32;

    /// Settle as done. The message is never delivered again.
    async fn ack(self: Box<Self>) -> Result<(), ChannelError>;

    /// Settle as not done.
    async fn nack(self: Box<Self>, redelivery: Redelivery) -> Result<(), ChannelError>;
}

#[async_trait]
pub trait MessageChannel: Send + Sync {
    /// Wait for the next delivery. `Ok(None)` once the channel is closed.
    async fn next(&self) -> Result<Option<Box<dyn Delivery>>, ChannelError>;

    /// Publish a fresh request (attempt 1, no deferrals).
    async fn publish(&self, request: &ScrapeRequest) -> Result<(), ChannelError>;

    /// Stop delivering. Pending delayed redeliveries are flushed first.
    async fn close(&self) -> Result<(), ChannelError>;
}
