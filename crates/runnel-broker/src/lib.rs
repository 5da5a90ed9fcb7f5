//!
//! Runnel Broker - in-process message router
//!
//! Topic exchanges route published messages to bound queues; queues deliver
//! to consumers synchronously and in FIFO order. Durable topology and pending
//! messages can be snapshotted and restored, with restored messages flagged
//! as redelivered.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

/// The router itself
pub mod broker;

/// Error types
pub mod error;

/// Exchanges and bindings
pub mod exchange;

/// Message envelope types
pub mod message;

/// Topic pattern tokenizer
pub mod pattern;

/// Queues and consumers
pub mod queue;

/// Snapshot and restore
pub mod snapshot;

pub use broker::{Broker, MessageHandler, SubscribeOptions};
pub use error::{BrokerError, BrokerResult};
pub use exchange::{ExchangeOptions, ExchangeType};
pub use message::{content_from, Content, Message, MessageFields, MessageProperties};
pub use pattern::TopicPattern;
pub use queue::{ConsumeOptions, QueueOptions};
pub use snapshot::{BindingSnapshot, BrokerSnapshot, ExchangeSnapshot, QueueSnapshot, SNAPSHOT_VERSION};

use std::sync::Arc;

/// Wrap a closure as a [`MessageHandler`]
pub fn handler<F>(f: F) -> MessageHandler
where
    F: Fn(&Broker, &Message) -> BrokerResult<()> + Send + Sync + 'static,
{
    Arc::new(f)
}
