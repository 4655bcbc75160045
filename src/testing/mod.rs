//! Test support
//!
//! An in-memory broker so the client can be exercised without RabbitMQ.

pub mod mock;

pub use mock::{BrokerEvent, MockBroker};
