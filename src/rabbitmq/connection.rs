// src/rabbitmq/connection.rs
//
// lapin-backed implementation of the transport traits.

use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use lapin::{
    options::*, types::FieldTable, BasicProperties, Channel, Connection, ConnectionProperties,
};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::errors::{RabbitMQError, Result};
use super::transport::{
    AmqpChannel, AmqpConnection, Connector, DeliveryStream, Publishing, QueueInfo, RawDelivery,
};

const REPLY_SUCCESS: u16 = 200;

/// Dials RabbitMQ with lapin.
#[derive(Debug, Default, Clone)]
pub struct LapinConnector;

#[async_trait]
impl Connector for LapinConnector {
    async fn dial(&self, url: &str) -> Result<Arc<dyn AmqpConnection>> {
        debug!("Connecting to RabbitMQ");
        let connection = Connection::connect(url, ConnectionProperties::default())
            .await
            .map_err(|e| RabbitMQError::ConnectionError(e.to_string()))?;

        let (closed, _) = watch::channel(false);
        let closed = Arc::new(closed);
        let notifier = closed.clone();
        connection.on_error(move |err| {
            warn!(error = %err, "RabbitMQ connection error");
            notifier.send_replace(true);
        });

        info!("Successfully connected to RabbitMQ");
        Ok(Arc::new(LapinConnection { connection, closed }))
    }
}

pub struct LapinConnection {
    connection: Connection,
    closed: Arc<watch::Sender<bool>>,
}

#[async_trait]
impl AmqpConnection for LapinConnection {
    async fn open_channel(&self) -> Result<Arc<dyn AmqpChannel>> {
        let channel = self
            .connection
            .create_channel()
            .await
            .map_err(|e| RabbitMQError::ChannelError(e.to_string()))?;
        debug!(channel_id = channel.id(), "Channel created");
        Ok(Arc::new(LapinChannel { channel }))
    }

    async fn closed(&self) {
        let mut rx = self.closed.subscribe();
        // The sender lives as long as `self`, so this only returns once flagged.
        let _ = rx.wait_for(|closed| *closed).await;
    }

    async fn close(&self) -> Result<()> {
        let result = self
            .connection
            .close(REPLY_SUCCESS, "closed by client")
            .await
            .map_err(|e| RabbitMQError::CloseError {
                target: "connection",
                reason: e.to_string(),
            });
        self.closed.send_replace(true);
        result
    }
}

pub struct LapinChannel {
    channel: Channel,
}

#[async_trait]
impl AmqpChannel for LapinChannel {
    async fn qos(&self, prefetch_count: u16, prefetch_size: u32, global: bool) -> Result<()> {
        // lapin always sends prefetch-size 0
        if prefetch_size != 0 {
            warn!(prefetch_size, "Ignoring non-zero prefetch size");
        }
        self.channel
            .basic_qos(prefetch_count, BasicQosOptions { global })
            .await
            .map_err(|e| RabbitMQError::QosError(e.to_string()))
    }

    async fn inspect_queue(&self, queue: &str) -> Result<QueueInfo> {
        let declared = self
            .channel
            .queue_declare(
                queue,
                QueueDeclareOptions {
                    passive: true,
                    ..QueueDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| RabbitMQError::QueueNotFound {
                queue: queue.to_string(),
                reason: e.to_string(),
            })?;

        Ok(QueueInfo {
            name: declared.name().as_str().to_string(),
            message_count: declared.message_count(),
            consumer_count: declared.consumer_count(),
        })
    }

    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream> {
        let consumer = self
            .channel
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions {
                    no_local: false,
                    no_ack: false,
                    exclusive: false,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| RabbitMQError::ConsumeError {
                queue: queue.to_string(),
                reason: e.to_string(),
            })?;

        let queue = queue.to_string();
        let deliveries = consumer.map(move |delivery| {
            delivery
                .map(|d| RawDelivery {
                    delivery_tag: d.delivery_tag,
                    routing_key: d.routing_key.as_str().to_string(),
                    body: d.data,
                })
                .map_err(|e| RabbitMQError::ConsumeError {
                    queue: queue.clone(),
                    reason: e.to_string(),
                })
        });
        Ok(deliveries.boxed())
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<()> {
        self.channel
            .basic_cancel(consumer_tag, BasicCancelOptions::default())
            .await
            .map_err(|e| RabbitMQError::CancelError {
                tag: consumer_tag.to_string(),
                reason: e.to_string(),
            })
    }

    async fn publish(&self, publishing: Publishing) -> Result<()> {
        let properties = BasicProperties::default()
            .with_content_type(publishing.content_type.into())
            .with_delivery_mode(publishing.delivery_mode);

        // The returned confirm is dropped: confirm mode is never enabled on this channel.
        self.channel
            .basic_publish(
                &publishing.exchange,
                &publishing.routing_key,
                BasicPublishOptions {
                    mandatory: publishing.mandatory,
                    immediate: publishing.immediate,
                },
                &publishing.body,
                properties,
            )
            .await
            .map_err(|e| RabbitMQError::PublishError(e.to_string()))?;
        Ok(())
    }

    async fn ack(&self, delivery_tag: u64, multiple: bool) -> Result<()> {
        self.channel
            .basic_ack(delivery_tag, BasicAckOptions { multiple })
            .await
            .map_err(|e| RabbitMQError::AckError {
                op: "success",
                reason: e.to_string(),
            })
    }

    async fn nack(&self, delivery_tag: u64, multiple: bool, requeue: bool) -> Result<()> {
        self.channel
            .basic_nack(delivery_tag, BasicNackOptions { multiple, requeue })
            .await
            .map_err(|e| RabbitMQError::AckError {
                op: if requeue { "requeue" } else { "fail" },
                reason: e.to_string(),
            })
    }

    async fn close(&self) -> Result<()> {
        self.channel
            .close(REPLY_SUCCESS, "closed by client")
            .await
            .map_err(|e| RabbitMQError::CloseError {
                target: "channel",
                reason: e.to_string(),
            })
    }
}
