//! In-memory broker implementing the transport traits
//!
//! Models the parts of RabbitMQ the client relies on: named queues, one channel
//! per connection, consumers with prefetch accounting, ack/nack with requeue,
//! default-exchange publishing and broker-side connection drops. Every channel
//! operation is recorded as a [`BrokerEvent`] for assertions.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use futures::channel::mpsc;
use futures::StreamExt;
use tokio::sync::watch;

use crate::rabbitmq::errors::{RabbitMQError, Result};
use crate::rabbitmq::transport::{
    AmqpChannel, AmqpConnection, Connector, DeliveryStream, Publishing, QueueInfo, RawDelivery,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrokerEvent {
    Qos {
        prefetch_count: u16,
        prefetch_size: u32,
        global: bool,
    },
    Consume {
        queue: String,
        consumer_tag: String,
    },
    Cancel {
        consumer_tag: String,
    },
    Ack {
        delivery_tag: u64,
        multiple: bool,
    },
    Nack {
        delivery_tag: u64,
        multiple: bool,
        requeue: bool,
    },
    Publish(Publishing),
}

struct ConsumerSlot {
    connection_id: u64,
    tag: String,
    queue: String,
    sender: mpsc::UnboundedSender<Result<RawDelivery>>,
    in_flight: usize,
}

struct Unacked {
    connection_id: u64,
    consumer_tag: String,
    queue: String,
    body: Vec<u8>,
}

struct ConnectionState {
    open: bool,
    channel_open: bool,
    prefetch: u16,
    closed: Arc<watch::Sender<bool>>,
}

#[derive(Default)]
struct BrokerState {
    queues: BTreeMap<String, VecDeque<Vec<u8>>>,
    consumers: Vec<ConsumerSlot>,
    unacked: HashMap<u64, Unacked>,
    connections: HashMap<u64, ConnectionState>,
    events: Vec<BrokerEvent>,
    failing_consumes: HashSet<String>,
    next_delivery_tag: u64,
    next_connection_id: u64,
    dial_attempts: usize,
    failing_dials: usize,
}

impl BrokerState {
    fn ensure_open(&self, connection_id: u64) -> std::result::Result<(), String> {
        match self.connections.get(&connection_id) {
            Some(conn) if conn.open && conn.channel_open => Ok(()),
            _ => Err("channel is closed".to_string()),
        }
    }

    /// Hand queued messages to consumers that have prefetch room left.
    fn dispatch(&mut self) {
        let mut index = 0;
        while index < self.consumers.len() {
            let slot = &self.consumers[index];
            let prefetch = self
                .connections
                .get(&slot.connection_id)
                .map(|conn| conn.prefetch as usize)
                .unwrap_or(0);
            let has_room = prefetch == 0 || slot.in_flight < prefetch;
            let queue = slot.queue.clone();

            let body = match self.queues.get_mut(&queue) {
                Some(messages) if has_room => messages.pop_front(),
                _ => None,
            };
            let Some(body) = body else {
                index += 1;
                continue;
            };

            self.next_delivery_tag += 1;
            let delivery_tag = self.next_delivery_tag;
            let delivery = RawDelivery {
                delivery_tag,
                routing_key: queue.clone(),
                body: body.clone(),
            };

            let slot = &mut self.consumers[index];
            if slot.sender.unbounded_send(Ok(delivery)).is_err() {
                // Nobody reads this consumer any more; forget it and keep the message.
                let slot = self.consumers.remove(index);
                if let Some(messages) = self.queues.get_mut(&slot.queue) {
                    messages.push_front(body);
                }
                continue;
            }
            slot.in_flight += 1;
            let unacked = Unacked {
                connection_id: slot.connection_id,
                consumer_tag: slot.tag.clone(),
                queue,
                body,
            };
            self.unacked.insert(delivery_tag, unacked);
        }
    }

    fn settle(&mut self, connection_id: u64, delivery_tag: u64) -> Option<Unacked> {
        let owned = matches!(
            self.unacked.get(&delivery_tag),
            Some(unacked) if unacked.connection_id == connection_id
        );
        if !owned {
            return None;
        }
        let unacked = self.unacked.remove(&delivery_tag)?;
        if let Some(slot) = self
            .consumers
            .iter_mut()
            .find(|slot| slot.connection_id == connection_id && slot.tag == unacked.consumer_tag)
        {
            slot.in_flight = slot.in_flight.saturating_sub(1);
        }
        Some(unacked)
    }

    /// Close the channel of a connection: consumers go away and unacked
    /// messages return to the head of their queues.
    fn close_channel(&mut self, connection_id: u64) {
        if let Some(conn) = self.connections.get_mut(&connection_id) {
            conn.channel_open = false;
        }
        self.consumers.retain(|slot| slot.connection_id != connection_id);

        let mut returned: Vec<(u64, Unacked)> = Vec::new();
        let tags: Vec<u64> = self
            .unacked
            .iter()
            .filter(|(_, unacked)| unacked.connection_id == connection_id)
            .map(|(tag, _)| *tag)
            .collect();
        for tag in tags {
            if let Some(unacked) = self.unacked.remove(&tag) {
                returned.push((tag, unacked));
            }
        }
        // Highest tag first so the oldest delivery ends up at the front.
        returned.sort_by(|a, b| b.0.cmp(&a.0));
        for (_, unacked) in returned {
            if let Some(messages) = self.queues.get_mut(&unacked.queue) {
                messages.push_front(unacked.body);
            }
        }
    }

    fn close_connection(&mut self, connection_id: u64) {
        self.close_channel(connection_id);
        if let Some(conn) = self.connections.get_mut(&connection_id) {
            conn.open = false;
            conn.closed.send_replace(true);
        }
    }
}

/// Shared in-memory broker. Hand [`MockBroker::connector`] to
/// `RabbitmqClient::builder(..).connector(..)`.
#[derive(Default)]
pub struct MockBroker {
    state: Mutex<BrokerState>,
}

impl MockBroker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// A broker with the given queues already declared.
    pub fn with_queues<I, S>(queues: I) -> Arc<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let broker = Self::new();
        for queue in queues {
            broker.declare_queue(queue);
        }
        broker
    }

    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn connector(self: &Arc<Self>) -> Arc<dyn Connector> {
        Arc::new(MockConnector {
            broker: self.clone(),
        })
    }

    pub fn declare_queue(&self, queue: impl Into<String>) {
        self.lock().queues.entry(queue.into()).or_default();
    }

    /// Put a message on `queue` as if a producer had published it.
    pub fn deliver(&self, queue: &str, body: impl Into<Vec<u8>>) {
        let mut state = self.lock();
        let messages = state
            .queues
            .get_mut(queue)
            .unwrap_or_else(|| panic!("queue {queue} is not declared"));
        messages.push_back(body.into());
        state.dispatch();
    }

    /// Drop every open connection from the broker side.
    pub fn drop_connections(&self) {
        let mut state = self.lock();
        let open: Vec<u64> = state
            .connections
            .iter()
            .filter(|(_, conn)| conn.open)
            .map(|(id, _)| *id)
            .collect();
        for id in open {
            state.close_connection(id);
        }
    }

    /// Make the next `count` dial attempts fail.
    pub fn fail_next_dials(&self, count: usize) {
        self.lock().failing_dials = count;
    }

    /// Make every subscription to `queue` fail until [`allow_consume`](Self::allow_consume).
    pub fn fail_consume(&self, queue: &str) {
        self.lock().failing_consumes.insert(queue.to_string());
    }

    pub fn allow_consume(&self, queue: &str) {
        self.lock().failing_consumes.remove(queue);
    }

    pub fn events(&self) -> Vec<BrokerEvent> {
        self.lock().events.clone()
    }

    pub fn acks(&self) -> Vec<u64> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                BrokerEvent::Ack { delivery_tag, .. } => Some(delivery_tag),
                _ => None,
            })
            .collect()
    }

    /// `(delivery_tag, requeue)` for every nack seen.
    pub fn nacks(&self) -> Vec<(u64, bool)> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                BrokerEvent::Nack {
                    delivery_tag,
                    requeue,
                    ..
                } => Some((delivery_tag, requeue)),
                _ => None,
            })
            .collect()
    }

    pub fn published(&self) -> Vec<Publishing> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                BrokerEvent::Publish(publishing) => Some(publishing),
                _ => None,
            })
            .collect()
    }

    pub fn queue_depth(&self, queue: &str) -> usize {
        self.lock().queues.get(queue).map_or(0, VecDeque::len)
    }

    /// Tags of consumers currently attached, in subscription order.
    pub fn consumer_tags(&self) -> Vec<String> {
        self.lock()
            .consumers
            .iter()
            .map(|slot| slot.tag.clone())
            .collect()
    }

    pub fn unacked_for(&self, consumer_tag: &str) -> usize {
        self.lock()
            .unacked
            .values()
            .filter(|unacked| unacked.consumer_tag == consumer_tag)
            .count()
    }

    pub fn dial_attempts(&self) -> usize {
        self.lock().dial_attempts
    }

    pub fn open_connections(&self) -> usize {
        self.lock()
            .connections
            .values()
            .filter(|conn| conn.open)
            .count()
    }

    /// Poll `condition` until it holds, panicking after `limit`.
    pub async fn wait_until<F>(&self, limit: Duration, condition: F)
    where
        F: Fn(&MockBroker) -> bool,
    {
        let deadline = tokio::time::Instant::now() + limit;
        while !condition(self) {
            if tokio::time::Instant::now() >= deadline {
                panic!("condition not met within {:?}", limit);
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}

struct MockConnector {
    broker: Arc<MockBroker>,
}

#[async_trait]
impl Connector for MockConnector {
    async fn dial(&self, _url: &str) -> Result<Arc<dyn AmqpConnection>> {
        let mut state = self.broker.lock();
        state.dial_attempts += 1;
        if state.failing_dials > 0 {
            state.failing_dials -= 1;
            return Err(RabbitMQError::ConnectionError(
                "connection refused".to_string(),
            ));
        }

        state.next_connection_id += 1;
        let id = state.next_connection_id;
        let (closed, _) = watch::channel(false);
        state.connections.insert(
            id,
            ConnectionState {
                open: true,
                channel_open: false,
                prefetch: 0,
                closed: Arc::new(closed),
            },
        );
        Ok(Arc::new(MockConnection {
            broker: self.broker.clone(),
            id,
        }))
    }
}

struct MockConnection {
    broker: Arc<MockBroker>,
    id: u64,
}

#[async_trait]
impl AmqpConnection for MockConnection {
    async fn open_channel(&self) -> Result<Arc<dyn AmqpChannel>> {
        let mut state = self.broker.lock();
        match state.connections.get_mut(&self.id) {
            Some(conn) if conn.open => conn.channel_open = true,
            _ => {
                return Err(RabbitMQError::ChannelError(
                    "connection is closed".to_string(),
                ))
            }
        }
        Ok(Arc::new(MockChannel {
            broker: self.broker.clone(),
            connection_id: self.id,
        }))
    }

    async fn closed(&self) {
        let closed = self
            .broker
            .lock()
            .connections
            .get(&self.id)
            .map(|conn| conn.closed.clone());
        if let Some(closed) = closed {
            let mut rx = closed.subscribe();
            let _ = rx.wait_for(|closed| *closed).await;
        }
    }

    async fn close(&self) -> Result<()> {
        let mut state = self.broker.lock();
        let open = state
            .connections
            .get(&self.id)
            .map_or(false, |conn| conn.open);
        if !open {
            return Err(RabbitMQError::CloseError {
                target: "connection",
                reason: "connection already closed".to_string(),
            });
        }
        state.close_connection(self.id);
        Ok(())
    }
}

struct MockChannel {
    broker: Arc<MockBroker>,
    connection_id: u64,
}

#[async_trait]
impl AmqpChannel for MockChannel {
    async fn qos(&self, prefetch_count: u16, prefetch_size: u32, global: bool) -> Result<()> {
        let mut state = self.broker.lock();
        state
            .ensure_open(self.connection_id)
            .map_err(RabbitMQError::QosError)?;
        state.events.push(BrokerEvent::Qos {
            prefetch_count,
            prefetch_size,
            global,
        });
        if let Some(conn) = state.connections.get_mut(&self.connection_id) {
            conn.prefetch = prefetch_count;
        }
        Ok(())
    }

    async fn inspect_queue(&self, queue: &str) -> Result<QueueInfo> {
        let state = self.broker.lock();
        state
            .ensure_open(self.connection_id)
            .map_err(|reason| RabbitMQError::QueueNotFound {
                queue: queue.to_string(),
                reason,
            })?;
        let messages = state
            .queues
            .get(queue)
            .ok_or_else(|| RabbitMQError::QueueNotFound {
                queue: queue.to_string(),
                reason: format!("NOT_FOUND - no queue '{queue}'"),
            })?;
        let consumer_count = state
            .consumers
            .iter()
            .filter(|slot| slot.queue == queue)
            .count();
        Ok(QueueInfo {
            name: queue.to_string(),
            message_count: messages.len() as u32,
            consumer_count: consumer_count as u32,
        })
    }

    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream> {
        let mut state = self.broker.lock();
        let fail = |reason: String| RabbitMQError::ConsumeError {
            queue: queue.to_string(),
            reason,
        };
        state.ensure_open(self.connection_id).map_err(fail)?;
        if state.failing_consumes.contains(queue) {
            return Err(fail("consume refused".to_string()));
        }
        if !state.queues.contains_key(queue) {
            return Err(fail(format!("NOT_FOUND - no queue '{queue}'")));
        }
        if state
            .consumers
            .iter()
            .any(|slot| slot.connection_id == self.connection_id && slot.tag == consumer_tag)
        {
            return Err(fail(format!("NOT_ALLOWED - reused consumer tag '{consumer_tag}'")));
        }

        state.events.push(BrokerEvent::Consume {
            queue: queue.to_string(),
            consumer_tag: consumer_tag.to_string(),
        });
        let (sender, receiver) = mpsc::unbounded();
        state.consumers.push(ConsumerSlot {
            connection_id: self.connection_id,
            tag: consumer_tag.to_string(),
            queue: queue.to_string(),
            sender,
            in_flight: 0,
        });
        state.dispatch();
        Ok(receiver.boxed())
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<()> {
        let mut state = self.broker.lock();
        state
            .ensure_open(self.connection_id)
            .map_err(|reason| RabbitMQError::CancelError {
                tag: consumer_tag.to_string(),
                reason,
            })?;
        state.events.push(BrokerEvent::Cancel {
            consumer_tag: consumer_tag.to_string(),
        });
        let connection_id = self.connection_id;
        state
            .consumers
            .retain(|slot| !(slot.connection_id == connection_id && slot.tag == consumer_tag));
        Ok(())
    }

    async fn publish(&self, publishing: Publishing) -> Result<()> {
        let mut state = self.broker.lock();
        state
            .ensure_open(self.connection_id)
            .map_err(RabbitMQError::PublishError)?;
        state.events.push(BrokerEvent::Publish(publishing.clone()));
        if publishing.exchange.is_empty() {
            if let Some(messages) = state.queues.get_mut(&publishing.routing_key) {
                messages.push_back(publishing.body);
            }
            state.dispatch();
        }
        Ok(())
    }

    async fn ack(&self, delivery_tag: u64, multiple: bool) -> Result<()> {
        let mut state = self.broker.lock();
        let fail = |reason: String| RabbitMQError::AckError {
            op: "success",
            reason,
        };
        state.ensure_open(self.connection_id).map_err(fail)?;
        state.events.push(BrokerEvent::Ack {
            delivery_tag,
            multiple,
        });
        if state.settle(self.connection_id, delivery_tag).is_none() {
            return Err(fail(format!("PRECONDITION_FAILED - unknown delivery tag {delivery_tag}")));
        }
        state.dispatch();
        Ok(())
    }

    async fn nack(&self, delivery_tag: u64, multiple: bool, requeue: bool) -> Result<()> {
        let mut state = self.broker.lock();
        let op = if requeue { "requeue" } else { "fail" };
        let fail = |reason: String| RabbitMQError::AckError { op, reason };
        state.ensure_open(self.connection_id).map_err(fail)?;
        state.events.push(BrokerEvent::Nack {
            delivery_tag,
            multiple,
            requeue,
        });
        let Some(unacked) = state.settle(self.connection_id, delivery_tag) else {
            return Err(fail(format!("PRECONDITION_FAILED - unknown delivery tag {delivery_tag}")));
        };
        if requeue {
            if let Some(messages) = state.queues.get_mut(&unacked.queue) {
                messages.push_front(unacked.body);
            }
        }
        state.dispatch();
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        let mut state = self.broker.lock();
        state
            .ensure_open(self.connection_id)
            .map_err(|reason| RabbitMQError::CloseError {
                target: "channel",
                reason,
            })?;
        state.close_channel(self.connection_id);
        Ok(())
    }
}
