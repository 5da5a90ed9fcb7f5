use thiserror::Error;

use crate::message::Message;

/// Result type for broker operations
pub type BrokerResult<T> = Result<T, BrokerError>;

/// Errors raised by the message router
#[derive(Error, Debug, Clone, PartialEq)]
pub enum BrokerError {
    /// Publish or bind against an exchange that was never declared
    #[error("Exchange not found: {0}")]
    ExchangeNotFound(String),

    /// Bind, consume or send against a queue that was never declared
    #[error("Queue not found: {0}")]
    QueueNotFound(String),

    /// Binding pattern could not be tokenized
    #[error("Invalid binding pattern '{pattern}': {reason}")]
    InvalidPattern {
        /// Offending pattern
        pattern: String,
        /// Why it was rejected
        reason: String,
    },

    /// A mandatory message matched no binding and no return handler was set
    #[error("Unroutable mandatory message {routing_key} on exchange {exchange}")]
    Unroutable {
        /// Exchange the message was published to
        exchange: String,
        /// Routing key of the message
        routing_key: String,
        /// The returned message
        message: Box<Message>,
    },

    /// A consumer handler failed while processing a message
    #[error("Consumer {consumer_tag} rejected {routing_key}: {reason}")]
    ConsumerFailed {
        /// Tag of the failing consumer
        consumer_tag: String,
        /// Routing key of the message being handled
        routing_key: String,
        /// Failure description
        reason: String,
    },

    /// Exclusive queue already has a consumer
    #[error("Queue {0} is exclusively consumed")]
    ExclusiveQueue(String),

    /// Snapshot was produced by an incompatible schema version
    #[error("Unsupported snapshot version {found}, expected at most {supported}")]
    UnsupportedSnapshot {
        /// Version found in the snapshot
        found: u32,
        /// Highest version this build understands
        supported: u32,
    },

    /// Generic handler failure raised from outside the router
    #[error("{0}")]
    Handler(String),
}

impl BrokerError {
    /// The returned message, if this error is a mandatory return
    pub fn returned_message(&self) -> Option<&Message> {
        match self {
            BrokerError::Unroutable { message, .. } => Some(message),
            _ => None,
        }
    }
}

impl From<String> for BrokerError {
    fn from(err: String) -> Self {
        BrokerError::Handler(err)
    }
}

impl From<&str> for BrokerError {
    fn from(err: &str) -> Self {
        BrokerError::Handler(err.to_string())
    }
}
