// src/rabbitmq/consumer.rs
//
// Fan-in of per-queue consumers into the single stream handed to the caller.

use std::sync::Arc;

use futures::{FutureExt, Stream, StreamExt};
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::transport::{AmqpChannel, DeliveryStream};
use crate::message::{decode_body, Envelope};

/// Capacity of the output channel. tokio has no rendezvous channel, so a single
/// slot is the closest to an unbuffered hand-off.
const OUTPUT_CAPACITY: usize = 1;

/// The caller's end of the consumer fan-in.
///
/// Clones share the same underlying receiver, and each envelope is handed to
/// exactly one `recv` call. The handle survives reconnects: after the connection
/// is restored, deliveries resume on the same stream. It ends (yields `None`)
/// once the client is stopped or closed, even for a reader already waiting.
#[derive(Clone, Debug)]
pub struct EnvelopeStream {
    receiver: Arc<Mutex<mpsc::Receiver<Envelope>>>,
    closed: watch::Receiver<bool>,
}

impl EnvelopeStream {
    /// Wait for the next envelope.
    pub async fn recv(&self) -> Option<Envelope> {
        if *self.closed.borrow() {
            return None;
        }
        let mut receiver = self.receiver.lock().await;
        tokio::select! {
            biased;
            _ = wait_closed(self.closed.clone()) => None,
            envelope = receiver.recv() => envelope,
        }
    }

    /// Whether both handles refer to the same output stream.
    pub fn same_stream(&self, other: &EnvelopeStream) -> bool {
        Arc::ptr_eq(&self.receiver, &other.receiver)
    }

    pub fn into_stream(self) -> impl Stream<Item = Envelope> + Send + 'static {
        futures::stream::unfold(self, |stream| async move {
            let next = stream.recv().await;
            next.map(|envelope| (envelope, stream))
        })
    }

    /// Close the receiving side and take whatever is still buffered. Readers
    /// give up the receiver as soon as the stream is marked closed.
    async fn close_and_drain(&self) -> Vec<Envelope> {
        let mut receiver = self.receiver.lock().await;
        receiver.close();
        let mut leftovers = Vec::new();
        while let Ok(envelope) = receiver.try_recv() {
            leftovers.push(envelope);
        }
        leftovers
    }
}

async fn wait_closed(mut closed: watch::Receiver<bool>) {
    let _ = closed.wait_for(|closed| *closed).await;
}

/// Producer side of the output stream, cached on the client between sessions.
pub(crate) struct Output {
    sender: mpsc::Sender<Envelope>,
    closed: watch::Sender<bool>,
    stream: EnvelopeStream,
}

impl Output {
    pub(crate) fn new() -> Self {
        let (sender, receiver) = mpsc::channel(OUTPUT_CAPACITY);
        let (closed, closed_rx) = watch::channel(false);
        Self {
            sender,
            closed,
            stream: EnvelopeStream {
                receiver: Arc::new(Mutex::new(receiver)),
                closed: closed_rx,
            },
        }
    }

    pub(crate) fn sender(&self) -> mpsc::Sender<Envelope> {
        self.sender.clone()
    }

    pub(crate) fn stream(&self) -> EnvelopeStream {
        self.stream.clone()
    }

    /// Stop handing envelopes to readers. Waiting `recv` calls return `None`.
    pub(crate) fn close(&self) {
        self.closed.send_replace(true);
    }

    /// Close the stream. Envelopes that were forwarded but never read are
    /// requeued so the broker redelivers them.
    pub(crate) async fn discard(self) {
        let Output {
            sender,
            closed,
            stream,
        } = self;
        closed.send_replace(true);
        drop(sender);
        for mut envelope in stream.close_and_drain().await {
            if let Err(e) = envelope.requeue().await {
                debug!(error = %e, "Failed to requeue unread envelope");
            }
        }
    }
}

/// Moves deliveries from one queue's consumer into the shared output stream.
pub(crate) struct Forwarder {
    pub(crate) queue: String,
    pub(crate) consumer_tag: String,
    pub(crate) source: DeliveryStream,
    pub(crate) channel: Arc<dyn AmqpChannel>,
    pub(crate) output: mpsc::Sender<Envelope>,
    pub(crate) cancel: watch::Receiver<bool>,
}

impl Forwarder {
    pub(crate) fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) {
        debug!(queue = %self.queue, tag = %self.consumer_tag, "Forwarder started");
        loop {
            let delivery = tokio::select! {
                biased;
                _ = self.cancel.changed() => {
                    self.release_pending().await;
                    break;
                }
                next = self.source.next() => match next {
                    Some(Ok(delivery)) => delivery,
                    Some(Err(e)) => {
                        warn!(queue = %self.queue, error = %e, "Consumer stream failed");
                        break;
                    }
                    None => {
                        debug!(queue = %self.queue, "Consumer stream ended");
                        break;
                    }
                },
            };

            let data = match decode_body(&delivery.body) {
                Ok(data) => data,
                Err(e) => {
                    warn!(
                        queue = %self.queue,
                        delivery_tag = delivery.delivery_tag,
                        error = %e,
                        "Failed to parse message as JSON, rejecting it"
                    );
                    if let Err(e) = self.channel.nack(delivery.delivery_tag, false, false).await {
                        warn!(queue = %self.queue, error = %e, "Failed to reject message");
                    }
                    break;
                }
            };

            let envelope = Envelope::new(self.queue.clone(), delivery, data, self.channel.clone());
            let cancelled = tokio::select! {
                biased;
                _ = self.cancel.changed() => {
                    Self::give_back(envelope).await;
                    true
                }
                permit = self.output.reserve() => match permit {
                    Ok(permit) => {
                        permit.send(envelope);
                        false
                    }
                    Err(_) => {
                        Self::give_back(envelope).await;
                        break;
                    }
                },
            };
            if cancelled {
                self.release_pending().await;
                break;
            }
        }
        debug!(queue = %self.queue, tag = %self.consumer_tag, "Forwarder stopped");
    }

    /// Requeue deliveries the broker already pushed but nobody read yet, so
    /// they do not sit unacknowledged on the channel.
    async fn release_pending(&mut self) {
        while let Some(Some(Ok(delivery))) = self.source.next().now_or_never() {
            if let Err(e) = self.channel.nack(delivery.delivery_tag, false, true).await {
                debug!(
                    queue = %self.queue,
                    delivery_tag = delivery.delivery_tag,
                    error = %e,
                    "Failed to requeue pending delivery"
                );
            }
        }
    }

    async fn give_back(mut envelope: Envelope) {
        if let Err(e) = envelope.requeue().await {
            debug!(queue = %envelope.queue_name(), error = %e, "Failed to requeue undelivered envelope");
        }
    }
}
