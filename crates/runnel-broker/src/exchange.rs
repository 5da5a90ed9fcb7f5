use serde::{Deserialize, Serialize};

use crate::pattern::TopicPattern;

/// Exchange routing type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ExchangeType {
    /// Route by topic pattern
    #[default]
    Topic,
}

/// Exchange declaration options
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExchangeOptions {
    /// Durable exchanges survive snapshot and restore
    pub durable: bool,
}

impl Default for ExchangeOptions {
    fn default() -> Self {
        Self { durable: true }
    }
}

/// A queue bound to an exchange by pattern
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Binding {
    /// Destination queue
    pub queue: String,
    /// Pattern matched against routing keys
    pub pattern: TopicPattern,
}

/// Named topic exchange holding an ordered list of bindings
#[derive(Debug, Clone)]
pub struct Exchange {
    /// Exchange name
    pub name: String,
    /// Routing type
    pub exchange_type: ExchangeType,
    /// Declaration options
    pub options: ExchangeOptions,
    /// Bindings in declaration order
    pub bindings: Vec<Binding>,
}

impl Exchange {
    pub(crate) fn new(name: &str, options: ExchangeOptions) -> Self {
        Self {
            name: name.to_string(),
            exchange_type: ExchangeType::Topic,
            options,
            bindings: Vec::new(),
        }
    }

    /// Add a binding unless the same queue/pattern pair already exists
    pub(crate) fn bind(&mut self, queue: &str, pattern: TopicPattern) -> bool {
        let exists = self
            .bindings
            .iter()
            .any(|b| b.queue == queue && b.pattern == pattern);
        if !exists {
            self.bindings.push(Binding {
                queue: queue.to_string(),
                pattern,
            });
        }
        !exists
    }

    pub(crate) fn unbind(&mut self, queue: &str, pattern: &str) {
        self.bindings
            .retain(|b| !(b.queue == queue && b.pattern.as_str() == pattern));
    }

    pub(crate) fn unbind_queue(&mut self, queue: &str) {
        self.bindings.retain(|b| b.queue != queue);
    }

    /// Queues receiving a routing key, in binding order, each at most once
    pub fn matching_queues(&self, routing_key: &str) -> Vec<String> {
        let mut queues: Vec<String> = Vec::new();
        for binding in &self.bindings {
            if binding.pattern.matches(routing_key) && !queues.contains(&binding.queue) {
                queues.push(binding.queue.clone());
            }
        }
        queues
    }
}
