// src/rabbitmq/client.rs

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::connection::LapinConnector;
use super::consumer::{EnvelopeStream, Forwarder, Output};
use super::errors::{RabbitMQError, Result};
use super::registry::QueueRegistry;
use super::supervisor;
use super::transport::{AmqpChannel, AmqpConnection, Connector};

/// Unacknowledged deliveries allowed per consumer.
pub const PREFETCH_COUNT: u16 = 1;

pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// Wait between a lost connection and each redial attempt.
    pub reconnect_delay: Duration,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            reconnect_delay: DEFAULT_RECONNECT_DELAY,
        }
    }
}

/// The live connection and its single channel.
#[derive(Clone)]
pub(crate) struct Link {
    pub(crate) connection: Arc<dyn AmqpConnection>,
    pub(crate) channel: Arc<dyn AmqpChannel>,
}

impl Link {
    /// Dial, open a channel and set the prefetch. The connection is released
    /// again if a later step fails.
    pub(crate) async fn establish(connector: &dyn Connector, url: &str) -> Result<Link> {
        let connection = connector.dial(url).await?;

        let channel = match connection.open_channel().await {
            Ok(channel) => channel,
            Err(e) => {
                release(connection.as_ref()).await;
                return Err(e);
            }
        };

        if let Err(e) = channel.qos(PREFETCH_COUNT, 0, false).await {
            release(connection.as_ref()).await;
            return Err(e);
        }

        Ok(Link {
            connection,
            channel,
        })
    }

    pub(crate) async fn release(&self) {
        release(self.connection.as_ref()).await;
    }
}

async fn release(connection: &dyn AmqpConnection) {
    if let Err(e) = connection.close().await {
        debug!(error = %e, "Failed to release connection");
    }
}

/// Consumer session bookkeeping. Guarded by one async mutex so iteration start,
/// stop and the supervisor's resubscription never interleave.
#[derive(Default)]
pub(crate) struct ConsumerState {
    counter: u64,
    tags: Vec<String>,
    /// Channel the current tags were registered on.
    session_channel: Option<Arc<dyn AmqpChannel>>,
    cancel: Option<watch::Sender<bool>>,
    forwarders: Vec<JoinHandle<()>>,
    output: Option<Output>,
}

impl ConsumerState {
    fn next_tag(&mut self) -> String {
        self.counter += 1;
        format!("tag{}", self.counter)
    }

    pub(crate) fn is_active(&self) -> bool {
        self.cancel.is_some()
    }
}

pub(crate) struct Shared {
    pub(crate) url: String,
    pub(crate) options: ClientOptions,
    pub(crate) connector: Arc<dyn Connector>,
    pub(crate) registry: QueueRegistry,
    pub(crate) link: RwLock<Link>,
    pub(crate) consumer: Mutex<ConsumerState>,
    pub(crate) closed: AtomicBool,
}

impl Shared {
    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub(crate) async fn channel(&self) -> Arc<dyn AmqpChannel> {
        self.link.read().await.channel.clone()
    }

    pub(crate) async fn connection(&self) -> Arc<dyn AmqpConnection> {
        self.link.read().await.connection.clone()
    }

    /// Subscribe to every inbound queue and start forwarding into the cached
    /// output stream, creating it on first use.
    pub(crate) async fn start_session(&self, state: &mut ConsumerState) -> Result<EnvelopeStream> {
        if state.is_active() {
            return Err(RabbitMQError::AlreadyIterating);
        }

        let output = state.output.get_or_insert_with(Output::new);
        let stream = output.stream();
        let sender = output.sender();

        let channel = self.channel().await;
        let (cancel, cancel_rx) = watch::channel(false);
        state.cancel = Some(cancel);
        state.session_channel = Some(channel.clone());

        for queue in self.registry.inbound() {
            let tag = state.next_tag();
            state.tags.push(tag.clone());

            let source = match channel.consume(queue, &tag).await {
                Ok(source) => source,
                Err(e) => {
                    if let Err(stop_err) = self.stop_session(state).await {
                        warn!(error = %stop_err, "Failed to stop after consume error");
                    }
                    return Err(e);
                }
            };

            debug!(queue = %queue, tag = %tag, "Consumer subscribed");
            let forwarder = Forwarder {
                queue: queue.to_string(),
                consumer_tag: tag,
                source,
                channel: channel.clone(),
                output: sender.clone(),
                cancel: cancel_rx.clone(),
            }
            .spawn();
            state.forwarders.push(forwarder);
        }

        Ok(stream)
    }

    /// Cancel every registered consumer, signal the forwarders and wait for them
    /// to exit. The output stream is left in place. Cancel errors are collected,
    /// not short-circuited.
    pub(crate) async fn stop_session(&self, state: &mut ConsumerState) -> Result<()> {
        let mut errors = Vec::new();

        if let Some(channel) = state.session_channel.take() {
            for tag in state.tags.drain(..) {
                if let Err(e) = channel.cancel(&tag).await {
                    errors.push(e);
                }
            }
        }
        state.tags.clear();

        if let Some(cancel) = state.cancel.take() {
            let _ = cancel.send(true);
        }
        for forwarder in state.forwarders.drain(..) {
            if let Err(e) = forwarder.await {
                warn!(error = %e, "Forwarder task failed");
            }
        }

        match RabbitMQError::combine(errors) {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

/// Builder for [`RabbitmqClient`].
pub struct ClientBuilder {
    url: String,
    inbound: Vec<String>,
    outbound: Vec<String>,
    options: ClientOptions,
    connector: Option<Arc<dyn Connector>>,
}

impl ClientBuilder {
    pub fn inbound<I, S>(mut self, queues: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.inbound.extend(queues.into_iter().map(Into::into));
        self
    }

    pub fn outbound<I, S>(mut self, queues: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.outbound.extend(queues.into_iter().map(Into::into));
        self
    }

    pub fn reconnect_delay(mut self, delay: Duration) -> Self {
        self.options.reconnect_delay = delay;
        self
    }

    pub fn options(mut self, options: ClientOptions) -> Self {
        self.options = options;
        self
    }

    /// Use something other than lapin to reach the broker.
    pub fn connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = Some(connector);
        self
    }

    pub async fn connect(self) -> Result<RabbitmqClient> {
        let connector = self
            .connector
            .unwrap_or_else(|| Arc::new(LapinConnector) as Arc<dyn Connector>);

        let link = Link::establish(connector.as_ref(), &self.url).await?;

        let registry = QueueRegistry::new(self.inbound, self.outbound);
        for queue in registry.all() {
            if let Err(e) = link.channel.inspect_queue(queue).await {
                link.release().await;
                return Err(e);
            }
        }

        let shared = Arc::new(Shared {
            url: self.url,
            options: self.options,
            connector,
            registry,
            link: RwLock::new(link),
            consumer: Mutex::new(ConsumerState::default()),
            closed: AtomicBool::new(false),
        });

        supervisor::spawn(Arc::downgrade(&shared));

        info!(
            inbound = shared.registry.inbound().count(),
            outbound = shared.registry.outbound().count(),
            "RabbitMQ client connected"
        );
        Ok(RabbitmqClient { shared })
    }
}

/// JSON-over-AMQP client: one connection, one channel with prefetch 1, a fan-in
/// consumer over every inbound queue and a publisher for outbound queues.
///
/// Lost connections are re-established in the background and consumers are
/// resubscribed onto the same [`EnvelopeStream`]. Call [`close`](Self::close)
/// when done; dropping the client leaves the connection open.
#[derive(Clone)]
pub struct RabbitmqClient {
    pub(crate) shared: Arc<Shared>,
}

impl RabbitmqClient {
    /// Connect to `url` and verify that every named queue exists.
    pub async fn new<I, O, S, T>(url: &str, inbound: I, outbound: O) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        O: IntoIterator<Item = T>,
        S: Into<String>,
        T: Into<String>,
    {
        Self::builder(url)
            .inbound(inbound)
            .outbound(outbound)
            .connect()
            .await
    }

    pub fn builder(url: &str) -> ClientBuilder {
        ClientBuilder {
            url: url.to_string(),
            inbound: Vec::new(),
            outbound: Vec::new(),
            options: ClientOptions::default(),
            connector: None,
        }
    }

    /// Start consuming every inbound queue. Fails with
    /// [`RabbitMQError::AlreadyIterating`] while a session is active.
    pub async fn iterator(&self) -> Result<EnvelopeStream> {
        if self.shared.is_closed() {
            return Err(RabbitMQError::Closed);
        }
        let mut state = self.shared.consumer.lock().await;
        let stream = self.shared.start_session(&mut state).await?;
        info!(tags = ?state.tags, "Iteration started");
        Ok(stream)
    }

    /// End the consumer session and close the output stream. The connection
    /// stays open and publishing keeps working. A no-op when not iterating.
    pub async fn stop(&self) -> Result<()> {
        let mut state = self.shared.consumer.lock().await;
        let Some(output) = state.output.take() else {
            return Ok(());
        };
        output.close();

        let result = self.shared.stop_session(&mut state).await;
        output.discard().await;
        debug!("Iteration stopped");
        result
    }

    /// Stop, close the channel and the connection. Terminal: the supervisor
    /// will not reconnect afterwards. Every stage runs even if an earlier one
    /// fails; all errors are returned together.
    pub async fn close(&self) -> Result<()> {
        if self.shared.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let mut errors = Vec::new();
        if let Err(e) = self.stop().await {
            errors.push(e);
        }

        // The write guard orders this against the supervisor installing a new link.
        let link = self.shared.link.write().await.clone();
        if let Err(e) = link.channel.close().await {
            errors.push(e);
        }
        if let Err(e) = link.connection.close().await {
            errors.push(e);
        }

        info!("RabbitMQ client closed");
        match RabbitMQError::combine(errors) {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    pub async fn is_iterating(&self) -> bool {
        self.shared.consumer.lock().await.is_active()
    }

    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }

    pub fn inbound_queues(&self) -> Vec<String> {
        self.shared.registry.inbound().map(str::to_string).collect()
    }

    pub fn outbound_queues(&self) -> Vec<String> {
        self.shared.registry.outbound().map(str::to_string).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_consumer_tags_increment() {
        let mut state = ConsumerState::default();
        assert_eq!(state.next_tag(), "tag1");
        assert_eq!(state.next_tag(), "tag2");
        assert_eq!(state.next_tag(), "tag3");
        assert!(!state.is_active());
    }

    #[test]
    fn test_default_options() {
        let options = ClientOptions::default();
        assert_eq!(options.reconnect_delay, Duration::from_secs(5));
        assert_eq!(PREFETCH_COUNT, 1);
    }
}
