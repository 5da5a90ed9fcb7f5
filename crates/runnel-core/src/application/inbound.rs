//! Inbound token accumulation and join resolution
//!
//! Flow and association events seen on inbound brokers are turned into
//! token messages on `inbound-q`. Tokens stay unacknowledged until a run
//! consumes them, so tokens received while running are kept for later runs.

use runnel_broker::{BrokerResult, Content, Message, MessageProperties};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, trace, warn};

use crate::application::activity::Activity;
use crate::domain::events::{
    ASSOCIATION_TAKE, FLOW_DISCARD, FLOW_SHAKE, FLOW_SHAKE_LOOP, FLOW_TAKE, INBOUND_QUEUE,
};
use crate::error::EngineResult;
use crate::types::{TokenAction, SEQUENCE_FLOW};

/// A take or discard signal received from an inbound flow
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InboundToken {
    /// Flow or association id
    pub id: String,
    /// Flow kind
    #[serde(rename = "type", default = "default_kind")]
    pub kind: String,
    /// Take or discard
    pub action: TokenAction,
    /// Source activity id
    #[serde(default)]
    pub source_id: String,
    /// Sequence id assigned when the flow was taken
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sequence_id: Option<String>,
    /// Nodes already visited on the discard path
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub discard_sequence: Vec<String>,
}

fn default_kind() -> String {
    SEQUENCE_FLOW.to_string()
}

impl InboundToken {
    /// Build a token from a flow event
    pub fn from_flow_event(content: &Content, action: TokenAction) -> Option<Self> {
        let mut value = Value::Object(content.clone());
        value["action"] = Value::String(action.as_str().to_string());
        serde_json::from_value(value).ok()
    }

    /// Token carried by a queued inbound message
    pub fn from_message(message: &Message) -> Option<Self> {
        serde_json::from_value(Value::Object(message.content.clone())).ok()
    }
}

/// Aggregate action: take if any source's latest token was a take
pub fn aggregate_action(tokens: &[InboundToken]) -> TokenAction {
    let mut latest: Vec<(&str, TokenAction)> = Vec::new();
    for token in tokens {
        match latest.iter_mut().find(|(id, _)| *id == token.id) {
            Some(entry) => entry.1 = token.action,
            None => latest.push((&token.id, token.action)),
        }
    }
    if latest.iter().any(|(_, action)| *action == TokenAction::Take) {
        TokenAction::Take
    } else {
        TokenAction::Discard
    }
}

/// Union of the discard sequences of the tokens, first seen order
pub fn merged_discard_sequence(tokens: &[InboundToken]) -> Vec<String> {
    let mut merged: Vec<String> = Vec::new();
    for id in tokens.iter().flat_map(|t| t.discard_sequence.iter()) {
        if !merged.contains(id) {
            merged.push(id.clone());
        }
    }
    merged
}

/// Tokens received but not yet consumed by a run
#[derive(Debug, Default)]
pub(crate) struct InboundTracker {
    pending: Vec<Message>,
}

impl InboundTracker {
    pub(crate) fn push(&mut self, message: Message) {
        self.pending.push(message);
    }

    pub(crate) fn clear(&mut self) {
        self.pending.clear();
    }

    pub(crate) fn len(&self) -> usize {
        self.pending.len()
    }

    /// Remove and return the tokens of the next run
    ///
    /// Without join sources the oldest token runs alone. With join sources
    /// every token up to the one completing the set of sources is drained,
    /// repeats from the same source included.
    pub(crate) fn take_ready(&mut self, join_sources: Option<&[String]>) -> Option<Vec<Message>> {
        let Some(sources) = join_sources else {
            if self.pending.is_empty() {
                return None;
            }
            return Some(vec![self.pending.remove(0)]);
        };

        let mut seen: Vec<&str> = Vec::new();
        let mut complete_at = None;
        for (index, message) in self.pending.iter().enumerate() {
            if let Some(id) = message.get_str("id") {
                if sources.iter().any(|s| s == id) && !seen.contains(&id) {
                    seen.push(id);
                }
            }
            if sources.iter().all(|s| seen.contains(&s.as_str())) {
                complete_at = Some(index);
                break;
            }
        }

        let end = complete_at?;
        Some(self.pending.drain(..=end).collect())
    }
}

impl Activity {
    pub(crate) fn on_flow_event(&self, message: &Message) -> BrokerResult<()> {
        match message.routing_key() {
            FLOW_TAKE => self.queue_token(message, TokenAction::Take),
            FLOW_DISCARD => self.queue_token(message, TokenAction::Discard),
            FLOW_SHAKE => self.continue_shake(message.content.clone()),
            FLOW_SHAKE_LOOP => {
                let mut content = message.content.clone();
                self.stamp_shake(&mut content);
                content.insert("looped".to_string(), json!(true));
                self.publish_event("shake.end", content, false)
            }
            routing_key => {
                trace!(activity = %self.id(), routing_key, "flow event ignored");
                Ok(())
            }
        }
    }

    pub(crate) fn on_association_event(&self, message: &Message) -> BrokerResult<()> {
        match message.routing_key() {
            ASSOCIATION_TAKE => self.queue_token(message, TokenAction::Take),
            routing_key => {
                trace!(activity = %self.id(), routing_key, "association event ignored");
                Ok(())
            }
        }
    }

    fn queue_token(&self, message: &Message, action: TokenAction) -> BrokerResult<()> {
        if InboundToken::from_flow_event(&message.content, action).is_none() {
            warn!(activity = %self.id(), routing_key = %message.routing_key(), "malformed inbound token");
            return Ok(());
        }
        let mut content = message.content.clone();
        content.insert("action".to_string(), json!(action.as_str()));
        self.broker().send_to_queue(
            INBOUND_QUEUE,
            message.routing_key(),
            content,
            MessageProperties::default(),
        )
    }

    pub(crate) fn on_inbound_message(&self, message: &Message) -> BrokerResult<()> {
        let pending = self.with_state(|state| {
            state.inbound.push(message.clone());
            state.inbound.len()
        });
        trace!(activity = %self.id(), pending, "inbound token");
        if self.settings().step {
            return Ok(());
        }
        self.run_from_inbound()?;
        Ok(())
    }

    /// Start a run if the activity is idle and enough tokens arrived
    pub(crate) fn run_from_inbound(&self) -> EngineResult<()> {
        let join_sources: Option<Vec<String>> = self
            .is_join()
            .then(|| self.inbound().iter().map(|f| f.id().to_string()).collect());
        let ready = self.with_state(|state| {
            if state.status.is_some() || state.stopped {
                return None;
            }
            state.inbound.take_ready(join_sources.as_deref())
        });
        let Some(messages) = ready else {
            return Ok(());
        };

        for message in &messages {
            self.broker().ack(message).map_err(|e| self.lift(e))?;
        }
        let tokens: Vec<InboundToken> = messages.iter().filter_map(InboundToken::from_message).collect();
        let action = aggregate_action(&tokens);
        debug!(activity = %self.id(), tokens = tokens.len(), action = %action, "inbound ready");
        self.start_run(Content::new(), tokens, action)
    }

    /// Walk the outbound graph without running anything
    ///
    /// Publishes `activity.shake.start` here and `activity.shake.end` on
    /// every activity where the walk ends, flagged `looped` at a cycle.
    pub fn shake(&self) -> EngineResult<()> {
        let mut content = Content::new();
        content.insert("sequence".to_string(), json!([]));
        self.stamp_shake(&mut content);
        self.publish_event("shake.start", content.clone(), false)
            .map_err(|e| self.lift(e))?;
        self.continue_shake(content).map_err(|e| self.lift(e))
    }

    pub(crate) fn continue_shake(&self, mut content: Content) -> BrokerResult<()> {
        let mut sequence = content
            .get("sequence")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        sequence.push(json!({ "id": self.id(), "type": self.kind() }));
        content.insert("sequence".to_string(), Value::Array(sequence));
        self.stamp_shake(&mut content);

        if self.outbound().is_empty() {
            return self.publish_event("shake.end", content, false);
        }
        for flow in self.outbound() {
            flow.shake(content.clone())?;
        }
        Ok(())
    }

    fn stamp_shake(&self, content: &mut Content) {
        content.insert("id".to_string(), json!(self.id()));
        content.insert("type".to_string(), json!(self.kind()));
        for key in ["action", "sourceId", "targetId", "isDefault"] {
            content.remove(key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use runnel_broker::{content_from, MessageProperties};
    use serde_json::json;

    fn token(flow: &str, action: &str) -> Message {
        Message::new(
            "",
            &format!("activity.{}", action),
            content_from(json!({"id": flow, "action": action, "sourceId": "src"})),
            MessageProperties::default(),
        )
    }

    fn tokens(messages: &[Message]) -> Vec<InboundToken> {
        messages.iter().filter_map(InboundToken::from_message).collect()
    }

    #[test]
    fn test_non_join_runs_each_token() {
        let mut tracker = InboundTracker::default();
        tracker.push(token("f1", "take"));
        tracker.push(token("f2", "take"));

        assert_eq!(tracker.take_ready(None).unwrap()[0].get_str("id"), Some("f1"));
        assert_eq!(tracker.take_ready(None).unwrap()[0].get_str("id"), Some("f2"));
        assert!(tracker.take_ready(None).is_none());
    }

    #[test]
    fn test_join_waits_for_every_source() {
        let sources = vec!["f1".to_string(), "f2".to_string()];
        let mut tracker = InboundTracker::default();
        tracker.push(token("f1", "take"));
        assert!(tracker.take_ready(Some(&sources)).is_none());

        tracker.push(token("f1", "discard"));
        assert!(tracker.take_ready(Some(&sources)).is_none());

        tracker.push(token("f2", "discard"));
        tracker.push(token("f2", "take"));
        let ready = tracker.take_ready(Some(&sources)).unwrap();
        assert_eq!(ready.len(), 3);
        assert_eq!(tracker.len(), 1);

        // f1 latest is discard, f2 latest is discard
        assert_eq!(aggregate_action(&tokens(&ready)), TokenAction::Discard);
    }

    #[test]
    fn test_join_drains_repeated_tokens_before_the_completing_one() {
        let sources = vec!["f1".to_string(), "f2".to_string()];
        let mut tracker = InboundTracker::default();
        tracker.push(token("f1", "discard"));
        tracker.push(token("f1", "take"));
        tracker.push(token("f2", "discard"));
        tracker.push(token("f1", "discard"));

        let ready = tracker.take_ready(Some(&sources)).unwrap();
        let ids: Vec<&str> = ready.iter().filter_map(|m| m.get_str("id")).collect();
        assert_eq!(ids, vec!["f1", "f1", "f2"]);
        assert_eq!(aggregate_action(&tokens(&ready)), TokenAction::Take);

        assert_eq!(tracker.len(), 1);
        assert!(tracker.take_ready(Some(&sources)).is_none());
    }

    #[test]
    fn test_aggregate_take_if_any_latest_take() {
        let ready = vec![token("f1", "discard"), token("f2", "take")];
        assert_eq!(aggregate_action(&tokens(&ready)), TokenAction::Take);

        let ready = vec![token("f1", "take"), token("f1", "discard"), token("f2", "discard")];
        assert_eq!(aggregate_action(&tokens(&ready)), TokenAction::Discard);
    }

    #[test]
    fn test_merged_discard_sequence() {
        let first = InboundToken {
            id: "f1".to_string(),
            kind: SEQUENCE_FLOW.to_string(),
            action: TokenAction::Discard,
            source_id: "a".to_string(),
            sequence_id: None,
            discard_sequence: vec!["start".to_string(), "a".to_string()],
        };
        let second = InboundToken {
            id: "f2".to_string(),
            discard_sequence: vec!["start".to_string(), "b".to_string()],
            ..first.clone()
        };
        assert_eq!(merged_discard_sequence(&[first, second]), vec!["start", "a", "b"]);
    }
}
