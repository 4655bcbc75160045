use std::fmt;
use std::sync::Arc;

use serde_json::{Map, Value};

use crate::rabbitmq::errors::{RabbitMQError, Result};
use crate::rabbitmq::transport::{AmqpChannel, RawDelivery};

/// Decodes a message body into a JSON object.
///
/// Anything other than a UTF-8 encoded JSON object (arrays, scalars, invalid
/// JSON, invalid UTF-8) is rejected.
pub fn decode_body(body: &[u8]) -> Result<Map<String, Value>> {
    serde_json::from_slice::<Map<String, Value>>(body)
        .map_err(|e| RabbitMQError::DeserializationError(e.to_string()))
}

/// A delivery from one of the client's inbound queues together with its decoded
/// JSON payload.
///
/// Settle it with exactly one of [`success`](Envelope::success),
/// [`fail`](Envelope::fail) or [`requeue`](Envelope::requeue). The acknowledgement
/// goes out on the channel the delivery arrived on.
pub struct Envelope {
    queue: String,
    delivery: RawDelivery,
    data: Map<String, Value>,
    channel: Arc<dyn AmqpChannel>,
    responded: bool,
}

impl Envelope {
    pub(crate) fn new(
        queue: String,
        delivery: RawDelivery,
        data: Map<String, Value>,
        channel: Arc<dyn AmqpChannel>,
    ) -> Self {
        Self {
            queue,
            delivery,
            data,
            channel,
            responded: false,
        }
    }

    /// The inbound queue this message was consumed from.
    pub fn queue_name(&self) -> &str {
        &self.queue
    }

    pub fn routing_key(&self) -> &str {
        &self.delivery.routing_key
    }

    pub fn delivery_tag(&self) -> u64 {
        self.delivery.delivery_tag
    }

    pub fn body(&self) -> &[u8] {
        &self.delivery.body
    }

    pub fn data(&self) -> &Map<String, Value> {
        &self.data
    }

    pub fn into_data(self) -> Map<String, Value> {
        self.data
    }

    /// Acknowledge the message.
    pub async fn success(&mut self) -> Result<()> {
        self.channel.ack(self.delivery.delivery_tag, false).await?;
        self.responded = true;
        Ok(())
    }

    /// Reject the message without requeueing; the broker drops or dead-letters it.
    pub async fn fail(&mut self) -> Result<()> {
        self.channel
            .nack(self.delivery.delivery_tag, false, false)
            .await?;
        self.responded = true;
        Ok(())
    }

    /// Reject the message and put it back on its queue.
    pub async fn requeue(&mut self) -> Result<()> {
        self.channel
            .nack(self.delivery.delivery_tag, false, true)
            .await?;
        self.responded = true;
        Ok(())
    }

    pub fn is_responded(&self) -> bool {
        self.responded
    }
}

impl fmt::Debug for Envelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Envelope")
            .field("queue", &self.queue)
            .field("delivery_tag", &self.delivery.delivery_tag)
            .field("data", &self.data)
            .field("responded", &self.responded)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rabbitmq::ErrorKind;
    use serde_json::json;

    #[test]
    fn test_decode_object() {
        let data = decode_body(br#"{"x":1,"nested":{"list":[true,null]}}"#).unwrap();
        assert_eq!(
            Value::Object(data),
            json!({"x": 1, "nested": {"list": [true, null]}})
        );
    }

    #[test]
    fn test_decode_rejects_non_objects() {
        let bodies: [&[u8]; 8] = [
            b"not json",
            b"[1,2,3]",
            b"42",
            b"\"text\"",
            b"null",
            b"",
            b"{\"x\":",
            &[0xff, 0xfe, 0x7b, 0x7d],
        ];
        for body in bodies {
            let err = decode_body(body).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::Decode, "body {:?}", body);
        }
    }
}
