use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

use crate::broker::MessageHandler;
use crate::message::Message;

/// Queue declaration options
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueOptions {
    /// Durable queues and their persistent messages are snapshotted
    pub durable: bool,
    /// Delete the queue when its last consumer is cancelled
    pub auto_delete: bool,
    /// Allow a single consumer only
    pub exclusive: bool,
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self {
            durable: true,
            auto_delete: false,
            exclusive: false,
        }
    }
}

impl QueueOptions {
    /// Options for a temporary subscription queue
    pub fn temporary() -> Self {
        Self {
            durable: false,
            auto_delete: true,
            exclusive: true,
        }
    }
}

/// Consumer options
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumeOptions {
    /// Messages are removed from the queue on delivery
    pub no_ack: bool,
    /// Max unacknowledged messages held by the consumer
    pub prefetch: usize,
    /// Explicit consumer tag, generated when absent
    pub consumer_tag: Option<String>,
    /// Cancel the consumer after its first delivery
    pub once: bool,
}

impl Default for ConsumeOptions {
    fn default() -> Self {
        Self {
            no_ack: false,
            prefetch: 1,
            consumer_tag: None,
            once: false,
        }
    }
}

impl ConsumeOptions {
    /// Auto-acknowledging consumer
    pub fn no_ack() -> Self {
        Self {
            no_ack: true,
            ..Self::default()
        }
    }

    /// Set prefetch
    pub fn with_prefetch(mut self, prefetch: usize) -> Self {
        self.prefetch = prefetch.max(1);
        self
    }

    /// Set consumer tag
    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.consumer_tag = Some(tag.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Holder {
    Consumer(String),
    Get,
}

#[derive(Debug, Clone)]
pub(crate) struct Envelope {
    pub(crate) tag: u64,
    pub(crate) message: Message,
    pub(crate) held_by: Option<Holder>,
}

pub(crate) struct Consumer {
    pub(crate) tag: String,
    pub(crate) handler: MessageHandler,
    pub(crate) options: ConsumeOptions,
}

/// A message ready to be handed to a consumer handler
pub(crate) struct Delivery {
    pub(crate) handler: MessageHandler,
    pub(crate) message: Message,
}

/// FIFO message buffer with its active consumers
pub(crate) struct Queue {
    pub(crate) name: String,
    pub(crate) options: QueueOptions,
    pub(crate) messages: VecDeque<Envelope>,
    pub(crate) consumers: Vec<Consumer>,
    pub(crate) delivering: bool,
    next_tag: u64,
}

impl Queue {
    pub(crate) fn new(name: &str, options: QueueOptions) -> Self {
        Self {
            name: name.to_string(),
            options,
            messages: VecDeque::new(),
            consumers: Vec::new(),
            delivering: false,
            next_tag: 0,
        }
    }

    pub(crate) fn enqueue(&mut self, mut message: Message) {
        self.next_tag += 1;
        message.fields.consumer_tag = None;
        message.fields.delivery_tag = Some(self.next_tag);
        message.fields.queue = Some(self.name.clone());
        self.messages.push_back(Envelope {
            tag: self.next_tag,
            message,
            held_by: None,
        });
    }

    fn held_count(&self, consumer_tag: &str) -> usize {
        self.messages
            .iter()
            .filter(|e| matches!(&e.held_by, Some(Holder::Consumer(tag)) if tag == consumer_tag))
            .count()
    }

    /// Number of messages not currently held by anyone
    pub(crate) fn ready_count(&self) -> usize {
        self.messages.iter().filter(|e| e.held_by.is_none()).count()
    }

    /// Pick the oldest ready message and a consumer with capacity for it
    pub(crate) fn next_delivery(&mut self) -> Option<Delivery> {
        let position = self.messages.iter().position(|e| e.held_by.is_none())?;

        let consumer_index = self.consumers.iter().position(|c| {
            c.options.no_ack || self.held_count(&c.tag) < c.options.prefetch
        })?;

        let (tag, handler, no_ack, once) = {
            let consumer = &self.consumers[consumer_index];
            (
                consumer.tag.clone(),
                consumer.handler.clone(),
                consumer.options.no_ack,
                consumer.options.once,
            )
        };

        if once {
            self.consumers.remove(consumer_index);
        }

        let mut message = if no_ack {
            self.messages.remove(position)?.message
        } else {
            let envelope = &mut self.messages[position];
            envelope.held_by = Some(Holder::Consumer(tag.clone()));
            envelope.message.clone()
        };
        message.fields.consumer_tag = Some(tag);

        Some(Delivery { handler, message })
    }

    /// Pull the oldest ready message without a consumer
    pub(crate) fn get(&mut self) -> Option<Message> {
        let envelope = self.messages.iter_mut().find(|e| e.held_by.is_none())?;
        envelope.held_by = Some(Holder::Get);
        Some(envelope.message.clone())
    }

    pub(crate) fn peek(&self) -> Option<Message> {
        self.messages
            .iter()
            .find(|e| e.held_by.is_none())
            .map(|e| e.message.clone())
    }

    /// Remove a held message; returns false if the tag is not held
    pub(crate) fn ack(&mut self, delivery_tag: u64) -> bool {
        match self
            .messages
            .iter()
            .position(|e| e.tag == delivery_tag && e.held_by.is_some())
        {
            Some(position) => {
                self.messages.remove(position);
                true
            }
            None => false,
        }
    }

    pub(crate) fn nack(&mut self, delivery_tag: u64, requeue: bool) -> bool {
        let Some(position) = self
            .messages
            .iter()
            .position(|e| e.tag == delivery_tag && e.held_by.is_some())
        else {
            return false;
        };

        if requeue {
            let envelope = &mut self.messages[position];
            envelope.held_by = None;
            envelope.message.fields.redelivered = true;
        } else {
            self.messages.remove(position);
        }
        true
    }

    /// Return every message held by a consumer to the ready state
    pub(crate) fn release_consumer(&mut self, consumer_tag: &str) -> usize {
        let mut released = 0;
        for envelope in self.messages.iter_mut() {
            if matches!(&envelope.held_by, Some(Holder::Consumer(tag)) if tag == consumer_tag) {
                envelope.held_by = None;
                envelope.message.fields.redelivered = true;
                released += 1;
            }
        }
        released
    }

    pub(crate) fn remove_consumer(&mut self, consumer_tag: &str) -> bool {
        let before = self.consumers.len();
        self.consumers.retain(|c| c.tag != consumer_tag);
        before != self.consumers.len()
    }

    pub(crate) fn purge(&mut self) -> usize {
        let before = self.messages.len();
        self.messages.retain(|e| e.held_by.is_some());
        before - self.messages.len()
    }
}
