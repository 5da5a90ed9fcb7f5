//! Broker topology and pending message snapshots
//!
//! Only durable exchanges, durable queues and persistent messages are
//! captured. Consumers are never part of a snapshot.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::broker::Broker;
use crate::error::{BrokerError, BrokerResult};
use crate::exchange::{Exchange, ExchangeOptions, ExchangeType};
use crate::message::Message;
use crate::queue::{Queue, QueueOptions};

/// Current snapshot schema version
pub const SNAPSHOT_VERSION: u32 = 1;

/// Exchange declaration in a snapshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExchangeSnapshot {
    /// Exchange name
    pub name: String,
    /// Routing type
    #[serde(rename = "type", default)]
    pub exchange_type: ExchangeType,
    /// Durability flag
    #[serde(default = "default_true")]
    pub durable: bool,
}

/// Queue declaration and pending messages in a snapshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueSnapshot {
    /// Queue name
    pub name: String,
    /// Declaration options
    #[serde(default)]
    pub options: QueueOptions,
    /// Pending messages in FIFO order
    #[serde(default)]
    pub messages: Vec<Message>,
}

/// Binding in a snapshot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BindingSnapshot {
    /// Source exchange
    pub exchange: String,
    /// Destination queue
    pub queue: String,
    /// Topic pattern
    pub pattern: String,
}

/// Serializable broker state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BrokerSnapshot {
    /// Schema version
    #[serde(default = "default_version")]
    pub version: u32,
    /// Durable exchanges
    #[serde(default)]
    pub exchanges: Vec<ExchangeSnapshot>,
    /// Durable queues with persistent messages
    #[serde(default)]
    pub queues: Vec<QueueSnapshot>,
    /// Bindings between durable exchanges and durable queues
    #[serde(default)]
    pub bindings: Vec<BindingSnapshot>,
}

fn default_true() -> bool {
    true
}

fn default_version() -> u32 {
    SNAPSHOT_VERSION
}

impl BrokerSnapshot {
    /// Find a queue snapshot by name
    pub fn queue(&self, name: &str) -> Option<&QueueSnapshot> {
        self.queues.iter().find(|q| q.name == name)
    }

    /// Topology without messages, for comparisons
    pub fn topology(&self) -> (Vec<ExchangeSnapshot>, Vec<(String, QueueOptions)>, Vec<BindingSnapshot>) {
        (
            self.exchanges.clone(),
            self.queues.iter().map(|q| (q.name.clone(), q.options)).collect(),
            self.bindings.clone(),
        )
    }
}

impl Broker {
    /// Capture durable topology and pending messages
    pub fn snapshot(&self) -> BrokerSnapshot {
        self.with_state(|state| {
            let exchanges: Vec<ExchangeSnapshot> = state
                .exchanges
                .iter()
                .filter(|e| e.options.durable)
                .map(|e| ExchangeSnapshot {
                    name: e.name.clone(),
                    exchange_type: e.exchange_type,
                    durable: e.options.durable,
                })
                .collect();

            let queues: Vec<QueueSnapshot> = state
                .queues
                .iter()
                .filter(|q| q.options.durable)
                .map(|q| QueueSnapshot {
                    name: q.name.clone(),
                    options: q.options,
                    messages: q
                        .messages
                        .iter()
                        .filter(|e| e.message.properties.persistent)
                        .map(|e| {
                            let mut message = e.message.clone();
                            message.fields.consumer_tag = None;
                            message.fields.delivery_tag = None;
                            message.fields.queue = None;
                            message
                        })
                        .collect(),
                })
                .collect();

            let bindings = state
                .exchanges
                .iter()
                .filter(|e| e.options.durable)
                .flat_map(|e| {
                    e.bindings.iter().map(move |b| BindingSnapshot {
                        exchange: e.name.clone(),
                        queue: b.queue.clone(),
                        pattern: b.pattern.as_str().to_string(),
                    })
                })
                .filter(|b| queues.iter().any(|q| q.name == b.queue))
                .collect();

            BrokerSnapshot {
                version: SNAPSHOT_VERSION,
                exchanges,
                queues,
                bindings,
            }
        })
    }

    /// Rebuild topology and re-enqueue messages marked as redelivered
    pub fn restore(&self, snapshot: &BrokerSnapshot) -> BrokerResult<()> {
        if snapshot.version > SNAPSHOT_VERSION {
            return Err(BrokerError::UnsupportedSnapshot {
                found: snapshot.version,
                supported: SNAPSHOT_VERSION,
            });
        }

        let _dispatch = self.dispatch_guard();
        self.with_state(|state| {
            for exchange in &snapshot.exchanges {
                if state.exchange(&exchange.name).is_none() {
                    state.exchanges.push(Exchange::new(
                        &exchange.name,
                        ExchangeOptions {
                            durable: exchange.durable,
                        },
                    ));
                }
            }

            for queue_snapshot in &snapshot.queues {
                if state.queue(&queue_snapshot.name).is_none() {
                    state
                        .queues
                        .push(Queue::new(&queue_snapshot.name, queue_snapshot.options));
                }
                if let Some(queue) = state.queue_mut(&queue_snapshot.name) {
                    queue.messages.clear();
                    for message in &queue_snapshot.messages {
                        let mut message = message.clone();
                        message.fields.redelivered = true;
                        queue.enqueue(message);
                    }
                }
            }
            Ok::<(), BrokerError>(())
        })?;

        for binding in &snapshot.bindings {
            self.bind_queue(&binding.queue, &binding.exchange, &binding.pattern)?;
        }

        debug!(
            owner = %self.owner(),
            queues = snapshot.queues.len(),
            exchanges = snapshot.exchanges.len(),
            "broker restored"
        );

        self.drain_all()
    }
}
