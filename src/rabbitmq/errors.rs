// src/rabbitmq/errors.rs

use serde_json::Error as SerdeError;
use thiserror::Error;

/// Broad classification of a [`RabbitMQError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Dialing, channel setup, prefetch or a missing queue.
    Config,
    /// A broker operation on an established channel failed.
    Protocol,
    /// The call is not valid in the client's current state.
    State,
    /// A message body could not be decoded or encoded.
    Decode,
}

#[derive(Debug, Error)]
pub enum RabbitMQError {
    #[error("connection with rabbitmq error: {0}")]
    ConnectionError(String),

    #[error("create channel error: {0}")]
    ChannelError(String),

    #[error("failed to set prefetch count: {0}")]
    QosError(String),

    #[error("queue does not exist: {queue}: {reason}")]
    QueueNotFound { queue: String, reason: String },

    #[error("consume error on queue {queue}: {reason}")]
    ConsumeError { queue: String, reason: String },

    #[error("failed to cancel consumer {tag}: {reason}")]
    CancelError { tag: String, reason: String },

    #[error("failed to publish a message: {0}")]
    PublishError(String),

    #[error("json marshal error: {0}")]
    SerializationError(#[from] SerdeError),

    #[error("JSON decode error: {0}")]
    DeserializationError(String),

    #[error("{op} error: {reason}")]
    AckError { op: &'static str, reason: String },

    #[error("close {target} error: {reason}")]
    CloseError { target: &'static str, reason: String },

    #[error("already iterating")]
    AlreadyIterating,

    #[error("client is closed")]
    Closed,

    #[error("{}", join_errors(.0))]
    Multiple(Vec<RabbitMQError>),
}

// Custom Result type for RabbitMQ operations
pub type Result<T> = std::result::Result<T, RabbitMQError>;

fn join_errors(errors: &[RabbitMQError]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

impl RabbitMQError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            RabbitMQError::ConnectionError(_)
            | RabbitMQError::ChannelError(_)
            | RabbitMQError::QosError(_)
            | RabbitMQError::QueueNotFound { .. } => ErrorKind::Config,
            RabbitMQError::ConsumeError { .. }
            | RabbitMQError::CancelError { .. }
            | RabbitMQError::PublishError(_)
            | RabbitMQError::AckError { .. }
            | RabbitMQError::CloseError { .. } => ErrorKind::Protocol,
            RabbitMQError::SerializationError(_) | RabbitMQError::DeserializationError(_) => {
                ErrorKind::Decode
            }
            RabbitMQError::AlreadyIterating | RabbitMQError::Closed => ErrorKind::State,
            RabbitMQError::Multiple(errors) => errors
                .first()
                .map(RabbitMQError::kind)
                .unwrap_or(ErrorKind::Protocol),
        }
    }

    /// Collapse a list of collected errors: `None` when empty, the error itself when
    /// there is exactly one, `Multiple` otherwise. Nested `Multiple`s are flattened.
    pub(crate) fn combine(errors: Vec<RabbitMQError>) -> Option<RabbitMQError> {
        let mut errors: Vec<RabbitMQError> = errors
            .into_iter()
            .flat_map(|e| match e {
                RabbitMQError::Multiple(inner) => inner,
                other => vec![other],
            })
            .collect();
        match errors.len() {
            0 => None,
            1 => errors.pop(),
            _ => Some(RabbitMQError::Multiple(errors)),
        }
    }
}
