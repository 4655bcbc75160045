// src/rabbitmq/publisher.rs

use serde_json::{Map, Value};
use tracing::{debug, warn};

use super::client::RabbitmqClient;
use super::errors::{RabbitMQError, Result};
use super::transport::Publishing;

impl RabbitmqClient {
    /// Publish `payload` as a persistent JSON message to `queue` through the
    /// default exchange. The queue must exist; no publisher confirm is awaited.
    pub async fn send(&self, queue: &str, payload: &Map<String, Value>) -> Result<()> {
        if self.shared.is_closed() {
            return Err(RabbitMQError::Closed);
        }
        if !self.shared.registry.is_outbound(queue) {
            warn!(queue = %queue, "Publishing to a queue that was not registered as outbound");
        }

        let channel = self.shared.channel().await;
        let target = channel.inspect_queue(queue).await?;

        let body = serde_json::to_vec(payload)?;
        let size = body.len();
        channel.publish(Publishing::json(&target.name, body)).await?;

        debug!(queue = %target.name, bytes = size, "Published message");
        Ok(())
    }
}
