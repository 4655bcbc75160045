// src/rabbitmq/mod.rs
// RabbitMQ client: connection supervision, consumer fan-in and JSON publishing

pub mod connection;
pub mod errors;
pub mod transport;

mod client;
mod consumer;
mod publisher;
mod registry;
mod supervisor;

// Re-export specific items to simplify imports elsewhere
pub use client::{
    ClientBuilder, ClientOptions, RabbitmqClient, DEFAULT_RECONNECT_DELAY, PREFETCH_COUNT,
};
pub use connection::LapinConnector;
pub use consumer::EnvelopeStream;
pub use errors::{ErrorKind, RabbitMQError, Result};
pub use registry::QueueRegistry;
