// src/rabbitmq/transport.rs
//
// Broker-facing seam. The client only talks to these traits; `connection.rs`
// implements them on top of lapin and `crate::testing` provides an in-memory broker.

use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;

use super::errors::Result;

pub const JSON_CONTENT_TYPE: &str = "application/json";

/// AMQP delivery-mode value for persistent messages.
pub const PERSISTENT: u8 = 2;

/// A delivery as handed over by the broker driver, before any decoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawDelivery {
    pub delivery_tag: u64,
    pub routing_key: String,
    pub body: Vec<u8>,
}

pub type DeliveryStream = BoxStream<'static, Result<RawDelivery>>;

/// Result of a passive queue declaration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueInfo {
    pub name: String,
    pub message_count: u32,
    pub consumer_count: u32,
}

/// Everything needed for a single basic.publish.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Publishing {
    pub exchange: String,
    pub routing_key: String,
    pub mandatory: bool,
    pub immediate: bool,
    pub content_type: String,
    pub delivery_mode: u8,
    pub body: Vec<u8>,
}

impl Publishing {
    /// A persistent JSON message for `queue` through the default exchange.
    pub fn json(queue: &str, body: Vec<u8>) -> Self {
        Self {
            exchange: String::new(),
            routing_key: queue.to_string(),
            mandatory: false,
            immediate: false,
            content_type: JSON_CONTENT_TYPE.to_string(),
            delivery_mode: PERSISTENT,
            body,
        }
    }
}

/// Dials a broker.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn dial(&self, url: &str) -> Result<Arc<dyn AmqpConnection>>;
}

#[async_trait]
pub trait AmqpConnection: Send + Sync {
    async fn open_channel(&self) -> Result<Arc<dyn AmqpChannel>>;

    /// Resolves once the connection is gone, whether the broker dropped it or it
    /// was closed locally.
    async fn closed(&self);

    async fn close(&self) -> Result<()>;
}

#[async_trait]
pub trait AmqpChannel: Send + Sync {
    async fn qos(&self, prefetch_count: u16, prefetch_size: u32, global: bool) -> Result<()>;

    /// Passive declare: fails if the queue does not exist.
    async fn inspect_queue(&self, queue: &str) -> Result<QueueInfo>;

    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream>;

    async fn cancel(&self, consumer_tag: &str) -> Result<()>;

    async fn publish(&self, publishing: Publishing) -> Result<()>;

    async fn ack(&self, delivery_tag: u64, multiple: bool) -> Result<()>;

    async fn nack(&self, delivery_tag: u64, multiple: bool, requeue: bool) -> Result<()>;

    async fn close(&self) -> Result<()>;
}
