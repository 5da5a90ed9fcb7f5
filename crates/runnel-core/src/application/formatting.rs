//! Format request bookkeeping between `run.start` and `run.execute`
//!
//! A format message carrying `endRoutingKey` opens a request that stays
//! outstanding until a message with that routing key arrives. Content of
//! every format message is merged in arrival order, so the last completed
//! request wins on overlapping keys.

use runnel_broker::{Content, Message};

/// Keys a format message may never overwrite
const PROTECTED_KEYS: [&str; 4] = ["id", "type", "executionId", "parent"];

#[derive(Debug)]
pub(crate) struct Formatting {
    outstanding: Vec<String>,
    held: Vec<Message>,
    content: Content,
}

impl Formatting {
    pub(crate) fn new(content: Content) -> Self {
        Self {
            outstanding: Vec::new(),
            held: Vec::new(),
            content,
        }
    }

    /// Register a format message; returns true once nothing is outstanding
    pub(crate) fn on_message(&mut self, message: &Message) -> bool {
        let routing_key = message.routing_key();
        if let Some(end_key) = message.get_str("endRoutingKey") {
            self.outstanding.push(end_key.to_string());
        } else if let Some(position) = self.outstanding.iter().position(|k| k == routing_key) {
            self.outstanding.remove(position);
        }

        for (key, value) in &message.content {
            if key == "endRoutingKey" || PROTECTED_KEYS.contains(&key.as_str()) {
                continue;
            }
            self.content.insert(key.clone(), value.clone());
        }
        self.held.push(message.clone());
        self.outstanding.is_empty()
    }

    pub(crate) fn outstanding(&self) -> usize {
        self.outstanding.len()
    }

    /// Merged content and the messages to acknowledge
    pub(crate) fn finish(self) -> (Content, Vec<Message>) {
        (self.content, self.held)
    }
}
