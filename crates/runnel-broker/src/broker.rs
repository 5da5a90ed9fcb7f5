//! The message router
//!
//! Publishing, delivery and acknowledgement all happen synchronously in the
//! caller's stack. A queue is never delivered re-entrantly: when a handler
//! publishes to the queue it is being served from, the message is appended
//! and picked up by the delivery loop once the handler returns.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, ReentrantMutex};
use tracing::{debug, trace, warn};

use crate::error::{BrokerError, BrokerResult};
use crate::exchange::{Exchange, ExchangeOptions};
use crate::message::{Content, Message, MessageProperties};
use crate::pattern::TopicPattern;
use crate::queue::{ConsumeOptions, Consumer, Queue, QueueOptions};

/// Consumer callback; receives the broker so it can acknowledge or publish
pub type MessageHandler = Arc<dyn Fn(&Broker, &Message) -> BrokerResult<()> + Send + Sync>;

/// Options for [`Broker::subscribe`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscribeOptions {
    /// Cancel after the first delivery
    pub once: bool,
    /// Auto-acknowledge deliveries
    pub no_ack: bool,
    /// Explicit consumer tag
    pub consumer_tag: Option<String>,
    /// Declare the subscription queue durable
    pub durable: bool,
    /// Explicit subscription queue name
    pub queue_name: Option<String>,
    /// Prefetch for acknowledging subscriptions
    pub prefetch: usize,
}

impl Default for SubscribeOptions {
    fn default() -> Self {
        Self {
            once: false,
            no_ack: true,
            consumer_tag: None,
            durable: false,
            queue_name: None,
            prefetch: 1,
        }
    }
}

impl SubscribeOptions {
    /// Single delivery subscription
    pub fn once() -> Self {
        Self {
            once: true,
            ..Self::default()
        }
    }

    /// Set consumer tag
    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.consumer_tag = Some(tag.into());
        self
    }
}

#[derive(Default)]
pub(crate) struct BrokerState {
    pub(crate) exchanges: Vec<Exchange>,
    pub(crate) queues: Vec<Queue>,
    return_handler: Option<MessageHandler>,
}

impl BrokerState {
    pub(crate) fn exchange(&self, name: &str) -> Option<&Exchange> {
        self.exchanges.iter().find(|e| e.name == name)
    }

    pub(crate) fn exchange_mut(&mut self, name: &str) -> Option<&mut Exchange> {
        self.exchanges.iter_mut().find(|e| e.name == name)
    }

    pub(crate) fn queue(&self, name: &str) -> Option<&Queue> {
        self.queues.iter().find(|q| q.name == name)
    }

    pub(crate) fn queue_mut(&mut self, name: &str) -> Option<&mut Queue> {
        self.queues.iter_mut().find(|q| q.name == name)
    }

    pub(crate) fn remove_queue(&mut self, name: &str) -> bool {
        let before = self.queues.len();
        self.queues.retain(|q| q.name != name);
        for exchange in self.exchanges.iter_mut() {
            exchange.unbind_queue(name);
        }
        before != self.queues.len()
    }
}

struct BrokerInner {
    owner: String,
    state: Mutex<BrokerState>,
    dispatch: ReentrantMutex<()>,
    sequence: AtomicU64,
}

/// Topic exchange / queue router owned by a single activity or flow
#[derive(Clone)]
pub struct Broker {
    inner: Arc<BrokerInner>,
}

impl fmt::Debug for Broker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Broker")
            .field("owner", &self.inner.owner)
            .finish()
    }
}

impl Broker {
    /// Create an empty broker
    pub fn new(owner: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(BrokerInner {
                owner: owner.into(),
                state: Mutex::new(BrokerState::default()),
                dispatch: ReentrantMutex::new(()),
                sequence: AtomicU64::new(0),
            }),
        }
    }

    /// Name of the broker owner
    pub fn owner(&self) -> &str {
        &self.inner.owner
    }

    /// True if both handles point at the same broker
    pub fn same(&self, other: &Broker) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    fn next_sequence(&self) -> u64 {
        self.inner.sequence.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub(crate) fn with_state<R>(&self, f: impl FnOnce(&mut BrokerState) -> R) -> R {
        let mut state = self.inner.state.lock();
        f(&mut state)
    }

    /// Declare an exchange; existing exchanges are left untouched
    pub fn assert_exchange(&self, name: &str, options: ExchangeOptions) {
        self.with_state(|state| {
            if state.exchange(name).is_none() {
                state.exchanges.push(Exchange::new(name, options));
            }
        });
    }

    /// Declare a queue; existing queues are left untouched
    pub fn assert_queue(&self, name: &str, options: QueueOptions) {
        self.with_state(|state| {
            if state.queue(name).is_none() {
                state.queues.push(Queue::new(name, options));
            }
        });
    }

    /// True if the exchange is declared
    pub fn has_exchange(&self, name: &str) -> bool {
        self.with_state(|state| state.exchange(name).is_some())
    }

    /// True if the queue is declared
    pub fn has_queue(&self, name: &str) -> bool {
        self.with_state(|state| state.queue(name).is_some())
    }

    /// Bind a declared queue to a declared exchange
    pub fn bind_queue(&self, queue: &str, exchange: &str, pattern: &str) -> BrokerResult<()> {
        let pattern = TopicPattern::parse(pattern)?;
        self.with_state(|state| {
            if state.queue(queue).is_none() {
                return Err(BrokerError::QueueNotFound(queue.to_string()));
            }
            let target = state
                .exchange_mut(exchange)
                .ok_or_else(|| BrokerError::ExchangeNotFound(exchange.to_string()))?;
            target.bind(queue, pattern);
            Ok(())
        })
    }

    /// Remove a binding
    pub fn unbind_queue(&self, queue: &str, exchange: &str, pattern: &str) {
        self.with_state(|state| {
            if let Some(target) = state.exchange_mut(exchange) {
                target.unbind(queue, pattern);
            }
        });
    }

    /// Delete a queue together with its bindings and consumers
    pub fn delete_queue(&self, name: &str) -> bool {
        self.with_state(|state| state.remove_queue(name))
    }

    /// Drop every message not currently held by a consumer
    pub fn purge_queue(&self, name: &str) -> BrokerResult<usize> {
        self.with_state(|state| {
            state
                .queue_mut(name)
                .map(Queue::purge)
                .ok_or_else(|| BrokerError::QueueNotFound(name.to_string()))
        })
    }

    /// Number of messages in the queue, held ones included
    pub fn message_count(&self, name: &str) -> usize {
        self.with_state(|state| state.queue(name).map_or(0, |q| q.messages.len()))
    }

    /// Number of consumers attached to the queue
    pub fn consumer_count(&self, name: &str) -> usize {
        self.with_state(|state| state.queue(name).map_or(0, |q| q.consumers.len()))
    }

    /// True if a consumer with the tag is attached anywhere
    pub fn has_consumer(&self, consumer_tag: &str) -> bool {
        self.with_state(|state| {
            state
                .queues
                .iter()
                .any(|q| q.consumers.iter().any(|c| c.tag == consumer_tag))
        })
    }

    /// Bindings of an exchange as `(queue, pattern)` pairs
    pub fn bindings(&self, exchange: &str) -> Vec<(String, String)> {
        self.with_state(|state| {
            state.exchange(exchange).map_or_else(Vec::new, |e| {
                e.bindings
                    .iter()
                    .map(|b| (b.queue.clone(), b.pattern.as_str().to_string()))
                    .collect()
            })
        })
    }

    /// Install the handler receiving unroutable mandatory messages
    pub fn on_return(&self, handler: MessageHandler) {
        self.with_state(|state| state.return_handler = Some(handler));
    }

    /// Publish to an exchange
    pub fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        content: Content,
        properties: MessageProperties,
    ) -> BrokerResult<()> {
        let _dispatch = self.inner.dispatch.lock();
        let message = Message::new(exchange, routing_key, content, properties);

        let queues = self.with_state(|state| {
            state
                .exchange(exchange)
                .map(|e| e.matching_queues(routing_key))
                .ok_or_else(|| BrokerError::ExchangeNotFound(exchange.to_string()))
        })?;

        if queues.is_empty() {
            if message.properties.mandatory {
                return self.return_message(message);
            }
            trace!(owner = %self.inner.owner, exchange, routing_key, "no route for message");
            return Ok(());
        }

        self.with_state(|state| {
            for name in &queues {
                if let Some(queue) = state.queue_mut(name) {
                    queue.enqueue(message.clone());
                }
            }
        });

        for name in &queues {
            self.drain(name)?;
        }
        Ok(())
    }

    /// Enqueue directly on a queue, bypassing exchanges
    pub fn send_to_queue(
        &self,
        queue: &str,
        routing_key: &str,
        content: Content,
        properties: MessageProperties,
    ) -> BrokerResult<()> {
        let _dispatch = self.inner.dispatch.lock();
        let message = Message::new("", routing_key, content, properties);
        self.with_state(|state| {
            state
                .queue_mut(queue)
                .map(|q| q.enqueue(message))
                .ok_or_else(|| BrokerError::QueueNotFound(queue.to_string()))
        })?;
        self.drain(queue)
    }

    fn return_message(&self, message: Message) -> BrokerResult<()> {
        let handler = self.with_state(|state| state.return_handler.clone());
        debug!(
            owner = %self.inner.owner,
            routing_key = %message.fields.routing_key,
            "returning unroutable mandatory message"
        );
        match handler {
            Some(handler) => handler(self, &message),
            None => Err(BrokerError::Unroutable {
                exchange: message.fields.exchange.clone(),
                routing_key: message.fields.routing_key.clone(),
                message: Box::new(message),
            }),
        }
    }

    /// Deliver ready messages of a queue until no consumer can take more
    fn drain(&self, name: &str) -> BrokerResult<()> {
        loop {
            let delivery = self.with_state(|state| {
                let queue = state.queue_mut(name)?;
                if queue.delivering {
                    return None;
                }
                let delivery = queue.next_delivery()?;
                queue.delivering = true;
                Some(delivery)
            });

            let Some(delivery) = delivery else {
                return Ok(());
            };

            trace!(
                owner = %self.inner.owner,
                queue = name,
                routing_key = %delivery.message.fields.routing_key,
                "delivering"
            );

            let result = (delivery.handler)(self, &delivery.message);

            self.with_state(|state| {
                let auto_delete = match state.queue_mut(name) {
                    Some(queue) => {
                        queue.delivering = false;
                        queue.options.auto_delete && queue.consumers.is_empty()
                    }
                    None => false,
                };
                if auto_delete {
                    state.remove_queue(name);
                }
            });

            result?;
        }
    }

    /// Attach a consumer to a queue and deliver what is ready
    pub fn consume(
        &self,
        queue: &str,
        handler: MessageHandler,
        options: ConsumeOptions,
    ) -> BrokerResult<String> {
        let _dispatch = self.inner.dispatch.lock();
        let tag = options
            .consumer_tag
            .clone()
            .unwrap_or_else(|| format!("smq.ctag-{}", self.next_sequence()));

        self.with_state(|state| {
            let target = state
                .queue_mut(queue)
                .ok_or_else(|| BrokerError::QueueNotFound(queue.to_string()))?;
            if target.consumers.iter().any(|c| c.tag == tag) {
                return Ok(());
            }
            if target.options.exclusive && !target.consumers.is_empty() {
                return Err(BrokerError::ExclusiveQueue(queue.to_string()));
            }
            target.consumers.push(Consumer {
                tag: tag.clone(),
                handler,
                options,
            });
            Ok(())
        })?;

        debug!(owner = %self.inner.owner, queue, consumer_tag = %tag, "consumer attached");
        self.drain(queue)?;
        Ok(tag)
    }

    /// Subscribe a handler to an exchange pattern through a dedicated queue
    pub fn subscribe(
        &self,
        exchange: &str,
        pattern: &str,
        handler: MessageHandler,
        options: SubscribeOptions,
    ) -> BrokerResult<String> {
        let _dispatch = self.inner.dispatch.lock();
        if !self.has_exchange(exchange) {
            return Err(BrokerError::ExchangeNotFound(exchange.to_string()));
        }

        let queue_name = options
            .queue_name
            .clone()
            .unwrap_or_else(|| format!("{}-{}-q{}", exchange, pattern, self.next_sequence()));
        let queue_options = if options.durable {
            QueueOptions::default()
        } else {
            QueueOptions::temporary()
        };

        self.assert_queue(&queue_name, queue_options);
        self.bind_queue(&queue_name, exchange, pattern)?;

        let consume_options = ConsumeOptions {
            no_ack: options.no_ack,
            prefetch: options.prefetch.max(1),
            consumer_tag: options.consumer_tag.clone(),
            once: options.once,
        };
        self.consume(&queue_name, handler, consume_options)
    }

    /// Cancel a consumer; its unacknowledged messages become ready again
    pub fn cancel(&self, consumer_tag: &str) -> BrokerResult<bool> {
        let _dispatch = self.inner.dispatch.lock();
        let cancelled = self.with_state(|state| {
            let queue = state
                .queues
                .iter_mut()
                .find(|q| q.consumers.iter().any(|c| c.tag == consumer_tag))?;
            queue.remove_consumer(consumer_tag);
            let released = queue.release_consumer(consumer_tag);
            let name = queue.name.clone();
            let delete = queue.options.auto_delete && queue.consumers.is_empty() && !queue.delivering;
            if delete {
                state.remove_queue(&name);
            }
            Some((name, released, delete))
        });

        match cancelled {
            Some((queue, released, deleted)) => {
                debug!(owner = %self.inner.owner, %queue, consumer_tag, released, "consumer cancelled");
                if released > 0 && !deleted {
                    self.drain(&queue)?;
                }
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Pull the next ready message; it must be acked or nacked
    pub fn get(&self, queue: &str) -> BrokerResult<Option<Message>> {
        self.with_state(|state| {
            state
                .queue_mut(queue)
                .map(Queue::get)
                .ok_or_else(|| BrokerError::QueueNotFound(queue.to_string()))
        })
    }

    /// Look at the next ready message without taking it
    pub fn peek(&self, queue: &str) -> Option<Message> {
        self.with_state(|state| state.queue(queue).and_then(Queue::peek))
    }

    /// Acknowledge a delivered message
    pub fn ack(&self, message: &Message) -> BrokerResult<()> {
        self.settle(message, |queue, tag| queue.ack(tag))
    }

    /// Reject a delivered message, optionally returning it to the queue
    pub fn nack(&self, message: &Message, requeue: bool) -> BrokerResult<()> {
        self.settle(message, |queue, tag| queue.nack(tag, requeue))
    }

    fn settle(&self, message: &Message, op: impl FnOnce(&mut Queue, u64) -> bool) -> BrokerResult<()> {
        let (Some(queue), Some(tag)) = (&message.fields.queue, message.fields.delivery_tag) else {
            return Ok(());
        };
        let _dispatch = self.inner.dispatch.lock();
        let settled = self.with_state(|state| state.queue_mut(queue).map(|q| op(q, tag)));
        match settled {
            Some(true) => self.drain(queue),
            Some(false) => {
                trace!(owner = %self.inner.owner, %queue, tag, "message already settled");
                Ok(())
            }
            None => {
                warn!(owner = %self.inner.owner, %queue, "settle on deleted queue");
                Ok(())
            }
        }
    }

    /// Re-run delivery on every queue with ready messages and consumers
    pub(crate) fn drain_all(&self) -> BrokerResult<()> {
        let names: Vec<String> =
            self.with_state(|state| state.queues.iter().map(|q| q.name.clone()).collect());
        for name in names {
            self.drain(&name)?;
        }
        Ok(())
    }

    pub(crate) fn dispatch_guard(&self) -> parking_lot::ReentrantMutexGuard<'_, ()> {
        self.inner.dispatch.lock()
    }
}
