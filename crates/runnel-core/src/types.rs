use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// Kind of a parallel gateway; implies join semantics
pub const PARALLEL_GATEWAY: &str = "bpmn:ParallelGateway";

/// Kind recorded on sequence flows
pub const SEQUENCE_FLOW: &str = "bpmn:SequenceFlow";

/// Kind recorded on associations
pub const ASSOCIATION: &str = "bpmn:Association";

/// Action carried by an inbound token
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TokenAction {
    /// The source completed and took the flow
    Take,
    /// The source discarded the flow
    Discard,
}

impl TokenAction {
    /// String form used in message content
    pub fn as_str(&self) -> &'static str {
        match self {
            TokenAction::Take => "take",
            TokenAction::Discard => "discard",
        }
    }

    /// Parse from message content
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "take" => Some(TokenAction::Take),
            "discard" => Some(TokenAction::Discard),
            _ => None,
        }
    }
}

impl fmt::Display for TokenAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle status of an activity run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActivityStatus {
    /// Run entered
    Entered,
    /// Run started
    Started,
    /// Waiting for outstanding format requests
    Formatting,
    /// Behaviour executing
    Executing,
    /// Run ended, resolving outbound flows
    End,
    /// Run discarded
    Discard,
    /// Execution failed
    Error,
    /// Leaving
    Leave,
}

impl fmt::Display for ActivityStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ActivityStatus::Entered => "entered",
            ActivityStatus::Started => "started",
            ActivityStatus::Formatting => "formatting",
            ActivityStatus::Executing => "executing",
            ActivityStatus::End => "end",
            ActivityStatus::Discard => "discard",
            ActivityStatus::Error => "error",
            ActivityStatus::Leave => "leave",
        };
        f.write_str(name)
    }
}

/// Reference to the scope an execution runs in
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParentRef {
    /// Scope id
    pub id: String,
    /// Scope kind
    #[serde(rename = "type")]
    pub kind: String,
    /// Execution id of the scope run
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_id: Option<String>,
    /// Ancestors of the scope, innermost first
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub path: Vec<ParentRef>,
}

impl ParentRef {
    /// New parent reference without ancestors
    pub fn new(id: impl Into<String>, kind: impl Into<String>, execution_id: Option<String>) -> Self {
        Self {
            id: id.into(),
            kind: kind.into(),
            execution_id,
            path: Vec::new(),
        }
    }

    /// Nest a child scope under this one
    pub fn child(&self, id: &str, kind: &str, execution_id: &str) -> ParentRef {
        let mut path = vec![ParentRef {
            path: Vec::new(),
            ..self.clone()
        }];
        path.extend(self.path.iter().cloned());
        ParentRef {
            id: id.to_string(),
            kind: kind.to_string(),
            execution_id: Some(execution_id.to_string()),
            path,
        }
    }
}

/// How many iterations a multi-instance activity runs
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Cardinality {
    /// Fixed number of iterations
    Fixed(usize),
    /// Expression resolving to a number
    Expression(String),
}

/// Multi-instance loop definition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoopCharacteristics {
    /// Run iterations one after another
    #[serde(default)]
    pub is_sequential: bool,
    /// Iteration count
    #[serde(default)]
    pub cardinality: Option<Cardinality>,
    /// Expression resolving to an array to iterate
    #[serde(default)]
    pub collection: Option<String>,
    /// Content key receiving the current element
    #[serde(default = "default_element_variable")]
    pub element_variable: String,
    /// Expression ending the loop early when truthy
    #[serde(default)]
    pub completion_condition: Option<String>,
}

fn default_element_variable() -> String {
    "item".to_string()
}

impl LoopCharacteristics {
    /// Sequential loop with a fixed cardinality
    pub fn sequential(cardinality: usize) -> Self {
        Self {
            is_sequential: true,
            cardinality: Some(Cardinality::Fixed(cardinality)),
            collection: None,
            element_variable: default_element_variable(),
            completion_condition: None,
        }
    }

    /// Parallel loop with a fixed cardinality
    pub fn parallel(cardinality: usize) -> Self {
        Self {
            is_sequential: false,
            ..Self::sequential(cardinality)
        }
    }

    /// Iterate a collection expression instead of a fixed count
    pub fn over_collection(mut self, collection: impl Into<String>, element_variable: impl Into<String>) -> Self {
        self.cardinality = None;
        self.collection = Some(collection.into());
        self.element_variable = element_variable.into();
        self
    }

    /// Set the completion condition
    pub fn with_completion_condition(mut self, condition: impl Into<String>) -> Self {
        self.completion_condition = Some(condition.into());
        self
    }
}

/// Static definition of an activity
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivityDefinition {
    /// Activity id
    pub id: String,
    /// Activity kind, e.g. `bpmn:Task`
    #[serde(rename = "type")]
    pub kind: String,
    /// Display name
    #[serde(default)]
    pub name: Option<String>,
    /// Wait for every inbound flow before running
    #[serde(default)]
    pub parallel_join: bool,
    /// Multi-instance loop
    #[serde(default)]
    pub loop_characteristics: Option<LoopCharacteristics>,
    /// Host activity id for boundary events
    #[serde(default)]
    pub attached_to: Option<String>,
    /// Enclosing scope
    #[serde(default)]
    pub parent: Option<ParentRef>,
}

impl ActivityDefinition {
    /// New definition; parallel gateways join by default
    pub fn new(id: impl Into<String>, kind: impl Into<String>) -> Self {
        let kind = kind.into();
        Self {
            id: id.into(),
            parallel_join: kind == PARALLEL_GATEWAY,
            kind,
            name: None,
            loop_characteristics: None,
            attached_to: None,
            parent: None,
        }
    }

    /// Set the display name
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Require every inbound flow before running
    pub fn with_parallel_join(mut self) -> Self {
        self.parallel_join = true;
        self
    }

    /// Attach multi-instance loop characteristics
    pub fn with_loop(mut self, characteristics: LoopCharacteristics) -> Self {
        self.loop_characteristics = Some(characteristics);
        self
    }

    /// Set the enclosing scope
    pub fn with_parent(mut self, parent: ParentRef) -> Self {
        self.parent = Some(parent);
        self
    }

    /// Mark as attached to a host activity
    pub fn attached_to(mut self, host_id: impl Into<String>) -> Self {
        self.attached_to = Some(host_id.into());
        self
    }
}

/// Convert a value into a content map; non-objects land under `value`
pub fn into_content(value: Value) -> Map<String, Value> {
    runnel_broker::content_from(value)
}
