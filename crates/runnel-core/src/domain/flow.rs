//! Sequence flows and associations
//!
//! A flow owns a small broker with an `event` exchange. Activities subscribe
//! to the flows they are the target of and turn `flow.take` and
//! `flow.discard` events into inbound tokens.

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use runnel_broker::{Broker, Content, ExchangeOptions, Message, MessageProperties};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::debug;
use uuid::Uuid;

use crate::domain::counters::{AssociationCounters, FlowCounters};
use crate::domain::events::{
    ASSOCIATION_COMPLETE, ASSOCIATION_TAKE, EVENT_EXCHANGE, FLOW_DISCARD, FLOW_LOOPED, FLOW_SHAKE,
    FLOW_SHAKE_LOOP, FLOW_TAKE,
};
use crate::environment::{is_truthy, Environment};
use crate::error::{EngineError, EngineResult};
use crate::types::{TokenAction, ASSOCIATION, SEQUENCE_FLOW};

/// Condition guarding a sequence flow
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FlowCondition {
    /// `${...}` expression resolved by the environment
    Expression(String),
    /// Script looked up in the script registry by flow id
    Script {
        /// Script language
        language: String,
        /// Script source
        body: String,
    },
}

/// Static definition of a sequence flow
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowDefinition {
    /// Flow id
    pub id: String,
    /// Source activity id
    pub source_id: String,
    /// Target activity id
    pub target_id: String,
    /// Optional condition
    #[serde(default)]
    pub condition: Option<FlowCondition>,
    /// Default flow of its source
    #[serde(default)]
    pub is_default: bool,
}

impl FlowDefinition {
    /// Unconditional flow
    pub fn new(id: impl Into<String>, source_id: impl Into<String>, target_id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            source_id: source_id.into(),
            target_id: target_id.into(),
            condition: None,
            is_default: false,
        }
    }

    /// Guard the flow with a condition
    pub fn with_condition(mut self, condition: FlowCondition) -> Self {
        self.condition = Some(condition);
        self
    }

    /// Mark as default flow
    pub fn as_default(mut self) -> Self {
        self.is_default = true;
        self
    }
}

/// Persisted flow state
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowState {
    /// Flow id
    pub id: String,
    /// Flow kind
    #[serde(rename = "type")]
    pub kind: String,
    /// Counters
    pub counters: FlowCounters,
}

/// Callback receiving the outcome of a condition evaluation
pub type EvaluateCallback = Box<dyn FnOnce(EngineResult<bool>) + Send>;

struct FlowInner {
    definition: FlowDefinition,
    broker: Broker,
    counters: Mutex<FlowCounters>,
    environment: Arc<Environment>,
}

/// A sequence flow between two activities
#[derive(Clone)]
pub struct SequenceFlow {
    inner: Arc<FlowInner>,
}

impl fmt::Debug for SequenceFlow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SequenceFlow")
            .field("definition", &self.inner.definition)
            .field("counters", &*self.inner.counters.lock())
            .finish()
    }
}

fn flow_broker(owner: &str) -> Broker {
    let broker = Broker::new(owner);
    broker.assert_exchange(EVENT_EXCHANGE, ExchangeOptions::default());
    broker
}

fn string_list(content: &Content, key: &str) -> Vec<String> {
    content
        .get(key)
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default()
}

impl SequenceFlow {
    /// Create a flow bound to an environment
    pub fn new(definition: FlowDefinition, environment: Arc<Environment>) -> Self {
        Self {
            inner: Arc::new(FlowInner {
                broker: flow_broker(&definition.id),
                definition,
                counters: Mutex::new(FlowCounters::default()),
                environment,
            }),
        }
    }

    /// Flow id
    pub fn id(&self) -> &str {
        &self.inner.definition.id
    }

    /// Source activity id
    pub fn source_id(&self) -> &str {
        &self.inner.definition.source_id
    }

    /// Target activity id
    pub fn target_id(&self) -> &str {
        &self.inner.definition.target_id
    }

    /// Default flow of its source
    pub fn is_default(&self) -> bool {
        self.inner.definition.is_default
    }

    /// Condition, if any
    pub fn condition(&self) -> Option<&FlowCondition> {
        self.inner.definition.condition.as_ref()
    }

    /// Definition
    pub fn definition(&self) -> &FlowDefinition {
        &self.inner.definition
    }

    /// Broker carrying the flow events
    pub fn broker(&self) -> &Broker {
        &self.inner.broker
    }

    /// Counter snapshot
    pub fn counters(&self) -> FlowCounters {
        *self.inner.counters.lock()
    }

    /// True if both handles refer to the same flow
    pub fn same(&self, other: &SequenceFlow) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    fn stamp(&self, mut content: Content, action: &str) -> Content {
        let definition = &self.inner.definition;
        content.insert("id".to_string(), json!(definition.id));
        content.insert("type".to_string(), json!(SEQUENCE_FLOW));
        content.insert("sourceId".to_string(), json!(definition.source_id));
        content.insert("targetId".to_string(), json!(definition.target_id));
        content.insert("action".to_string(), json!(action));
        if definition.is_default {
            content.insert("isDefault".to_string(), json!(true));
        }
        content
    }

    fn publish(&self, routing_key: &str, content: Content) -> EngineResult<()> {
        self.inner
            .broker
            .publish(EVENT_EXCHANGE, routing_key, content, MessageProperties::default())
            .map_err(|e| crate::error::from_broker(self.id(), e))
    }

    /// Take the flow towards its target
    pub fn take(&self, content: Content) -> EngineResult<()> {
        self.inner.counters.lock().taken += 1;

        let mut content = self.stamp(content, TokenAction::Take.as_str());
        if !content.get("sequenceId").map_or(false, Value::is_string) {
            let sequence_id = format!("{}_{}", self.id(), &Uuid::new_v4().simple().to_string()[..8]);
            content.insert("sequenceId".to_string(), json!(sequence_id));
        }

        debug!(flow = %self.id(), target = %self.target_id(), "flow taken");
        self.publish(FLOW_TAKE, content)
    }

    /// Discard the flow; stops with `flow.looped` if the target was already visited
    pub fn discard(&self, content: Content) -> EngineResult<()> {
        let mut discard_sequence = string_list(&content, "discardSequence");

        if discard_sequence.iter().any(|id| id == self.target_id()) {
            self.inner.counters.lock().looped += 1;
            debug!(
                flow = %self.id(),
                target = %self.target_id(),
                sequence = ?discard_sequence,
                "discard looped"
            );
            let mut content = self.stamp(content, "looped");
            content.insert("discardSequence".to_string(), json!(discard_sequence));
            return self.publish(FLOW_LOOPED, content);
        }

        discard_sequence.push(self.source_id().to_string());
        self.inner.counters.lock().discarded += 1;

        let mut content = self.stamp(content, TokenAction::Discard.as_str());
        content.insert("discardSequence".to_string(), json!(discard_sequence));
        debug!(flow = %self.id(), target = %self.target_id(), "flow discarded");
        self.publish(FLOW_DISCARD, content)
    }

    /// Evaluate the flow condition against a message
    pub fn evaluate(&self, message: &Message, callback: EvaluateCallback) {
        let definition = &self.inner.definition;
        if definition.is_default {
            return callback(Ok(true));
        }

        let context = json!({
            "content": Value::Object(message.content.clone()),
            "properties": { "type": message.properties.message_type },
        });

        match &definition.condition {
            None => callback(Ok(true)),
            Some(FlowCondition::Expression(expression)) => {
                let result = self
                    .inner
                    .environment
                    .resolve_expression(expression, &context)
                    .map(|value| is_truthy(&value));
                callback(result)
            }
            Some(FlowCondition::Script { language, .. }) => {
                match self.inner.environment.scripts().get_script(&definition.id) {
                    Some(script) => {
                        let mut scope = context;
                        scope["environment"] = json!({ "variables": self.inner.environment.variables() });
                        script.execute(&scope, Box::new(move |result| callback(result.map(|v| is_truthy(&v)))))
                    }
                    None => callback(Err(EngineError::ScriptError(format!(
                        "No {} script registered for flow {}",
                        language, definition.id
                    )))),
                }
            }
        }
    }

    /// Dry structural walk; emits `flow.shake.loop` when a node reappears
    pub fn shake(&self, content: Content) -> EngineResult<()> {
        let mut sequence = content
            .get("sequence")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        let visited = |id: &str| sequence.iter().any(|entry| entry["id"] == id);
        let looped = visited(self.target_id()) || visited(self.id());

        let mut content = self.stamp(content, "shake");
        if looped {
            content.insert("sequence".to_string(), Value::Array(sequence));
            debug!(flow = %self.id(), "shake loop detected");
            return self.publish(FLOW_SHAKE_LOOP, content);
        }

        sequence.push(json!({ "id": self.id(), "type": SEQUENCE_FLOW }));
        content.insert("sequence".to_string(), Value::Array(sequence));
        self.publish(FLOW_SHAKE, content)
    }

    /// Persisted state
    pub fn get_state(&self) -> FlowState {
        FlowState {
            id: self.id().to_string(),
            kind: SEQUENCE_FLOW.to_string(),
            counters: self.counters(),
        }
    }

    /// Restore counters
    pub fn recover(&self, state: &FlowState) {
        *self.inner.counters.lock() = state.counters;
    }
}

/// Persisted association state
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssociationState {
    /// Association id
    pub id: String,
    /// Counters
    pub counters: AssociationCounters,
}

struct AssociationInner {
    id: String,
    source_id: String,
    target_id: String,
    broker: Broker,
    counters: Mutex<AssociationCounters>,
}

/// Association between an activity and an artifact or compensation handler
#[derive(Clone)]
pub struct Association {
    inner: Arc<AssociationInner>,
}

impl fmt::Debug for Association {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Association")
            .field("id", &self.inner.id)
            .field("source_id", &self.inner.source_id)
            .field("target_id", &self.inner.target_id)
            .finish()
    }
}

impl Association {
    /// Create an association
    pub fn new(id: impl Into<String>, source_id: impl Into<String>, target_id: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            inner: Arc::new(AssociationInner {
                broker: flow_broker(&id),
                id,
                source_id: source_id.into(),
                target_id: target_id.into(),
                counters: Mutex::new(AssociationCounters::default()),
            }),
        }
    }

    /// Association id
    pub fn id(&self) -> &str {
        &self.inner.id
    }

    /// Source id
    pub fn source_id(&self) -> &str {
        &self.inner.source_id
    }

    /// Target id
    pub fn target_id(&self) -> &str {
        &self.inner.target_id
    }

    /// Broker carrying association events
    pub fn broker(&self) -> &Broker {
        &self.inner.broker
    }

    /// Counter snapshot
    pub fn counters(&self) -> AssociationCounters {
        *self.inner.counters.lock()
    }

    fn publish(&self, routing_key: &str, action: &str, mut content: Content) -> EngineResult<()> {
        content.insert("id".to_string(), json!(self.inner.id));
        content.insert("type".to_string(), json!(ASSOCIATION));
        content.insert("sourceId".to_string(), json!(self.inner.source_id));
        content.insert("targetId".to_string(), json!(self.inner.target_id));
        content.insert("action".to_string(), json!(action));
        self.inner
            .broker
            .publish(EVENT_EXCHANGE, routing_key, content, MessageProperties::default())
            .map_err(|e| crate::error::from_broker(self.id(), e))
    }

    /// Take the association
    pub fn take(&self, content: Content) -> EngineResult<()> {
        self.inner.counters.lock().taken += 1;
        debug!(association = %self.inner.id, "association taken");
        self.publish(ASSOCIATION_TAKE, "take", content)
    }

    /// Signal that the associated work completed
    pub fn complete(&self, content: Content) -> EngineResult<()> {
        self.inner.counters.lock().completed += 1;
        debug!(association = %self.inner.id, "association completed");
        self.publish(ASSOCIATION_COMPLETE, "complete", content)
    }

    /// Persisted state
    pub fn get_state(&self) -> AssociationState {
        AssociationState {
            id: self.inner.id.clone(),
            counters: self.counters(),
        }
    }

    /// Restore counters
    pub fn recover(&self, state: &AssociationState) {
        *self.inner.counters.lock() = state.counters;
    }
}
