//! Activity context: graph lookups, extensions and the environment
//!
//! [`ProcessGraph`] is the in-memory context used by tests and embedders that
//! wire activities by hand.

use std::fmt;
use std::sync::Arc;

use dashmap::DashMap;
use runnel_broker::Message;

use crate::application::activity::Activity;
use crate::domain::flow::{Association, FlowCondition, FlowDefinition, SequenceFlow};
use crate::environment::Environment;

/// Activity extension activated for the duration of a run
pub trait Extension: Send + Sync {
    /// Called when a run enters
    fn activate(&self, message: &Message);

    /// Called when a run leaves or the activity stops
    fn deactivate(&self, message: &Message);
}

/// Builds the extension of an activity
pub type ExtensionFactory = Arc<dyn Fn(&Activity) -> Option<Arc<dyn Extension>> + Send + Sync>;

/// What an activity needs to know about its surroundings
pub trait ActivityContext: Send + Sync {
    /// Shared environment
    fn environment(&self) -> Arc<Environment>;

    /// Flows targeting the activity
    fn inbound_sequence_flows(&self, activity_id: &str) -> Vec<SequenceFlow>;

    /// Flows leaving the activity
    fn outbound_sequence_flows(&self, activity_id: &str) -> Vec<SequenceFlow>;

    /// Associations targeting the activity
    fn inbound_associations(&self, activity_id: &str) -> Vec<Association>;

    /// Associations leaving the activity
    fn outbound_associations(&self, activity_id: &str) -> Vec<Association>;

    /// Extension for the activity, if any
    fn load_extensions(&self, activity: &Activity) -> Option<Arc<dyn Extension>>;
}

/// In-memory process graph
pub struct ProcessGraph {
    environment: Arc<Environment>,
    outbound: DashMap<String, Vec<SequenceFlow>>,
    inbound: DashMap<String, Vec<SequenceFlow>>,
    outbound_associations: DashMap<String, Vec<Association>>,
    inbound_associations: DashMap<String, Vec<Association>>,
    extensions: DashMap<String, ExtensionFactory>,
}

impl fmt::Debug for ProcessGraph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessGraph")
            .field("flows", &self.flow_ids())
            .finish()
    }
}

impl ProcessGraph {
    /// Empty graph
    pub fn new(environment: Arc<Environment>) -> Self {
        Self {
            environment,
            outbound: DashMap::new(),
            inbound: DashMap::new(),
            outbound_associations: DashMap::new(),
            inbound_associations: DashMap::new(),
            extensions: DashMap::new(),
        }
    }

    /// Start a builder
    pub fn builder(environment: Arc<Environment>) -> ProcessGraphBuilder {
        ProcessGraphBuilder {
            graph: ProcessGraph::new(environment),
        }
    }

    /// Add a sequence flow; activities created afterwards see it
    pub fn add_flow(&self, definition: FlowDefinition) -> SequenceFlow {
        let flow = SequenceFlow::new(definition, self.environment.clone());
        self.outbound
            .entry(flow.source_id().to_string())
            .or_default()
            .push(flow.clone());
        self.inbound
            .entry(flow.target_id().to_string())
            .or_default()
            .push(flow.clone());
        flow
    }

    /// Add an association
    pub fn add_association(&self, association: Association) -> Association {
        self.outbound_associations
            .entry(association.source_id().to_string())
            .or_default()
            .push(association.clone());
        self.inbound_associations
            .entry(association.target_id().to_string())
            .or_default()
            .push(association.clone());
        association
    }

    /// Register an extension factory for an activity
    pub fn add_extension(&self, activity_id: impl Into<String>, factory: ExtensionFactory) {
        self.extensions.insert(activity_id.into(), factory);
    }

    /// Look up a flow by id
    pub fn flow(&self, flow_id: &str) -> Option<SequenceFlow> {
        self.outbound
            .iter()
            .find_map(|entry| entry.value().iter().find(|f| f.id() == flow_id).cloned())
    }

    /// Ids of every flow, sorted
    pub fn flow_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .outbound
            .iter()
            .flat_map(|entry| entry.value().iter().map(|f| f.id().to_string()).collect::<Vec<_>>())
            .collect();
        ids.sort();
        ids
    }
}

impl ActivityContext for ProcessGraph {
    fn environment(&self) -> Arc<Environment> {
        self.environment.clone()
    }

    fn inbound_sequence_flows(&self, activity_id: &str) -> Vec<SequenceFlow> {
        self.inbound
            .get(activity_id)
            .map(|flows| flows.value().clone())
            .unwrap_or_default()
    }

    fn outbound_sequence_flows(&self, activity_id: &str) -> Vec<SequenceFlow> {
        self.outbound
            .get(activity_id)
            .map(|flows| flows.value().clone())
            .unwrap_or_default()
    }

    fn inbound_associations(&self, activity_id: &str) -> Vec<Association> {
        self.inbound_associations
            .get(activity_id)
            .map(|a| a.value().clone())
            .unwrap_or_default()
    }

    fn outbound_associations(&self, activity_id: &str) -> Vec<Association> {
        self.outbound_associations
            .get(activity_id)
            .map(|a| a.value().clone())
            .unwrap_or_default()
    }

    fn load_extensions(&self, activity: &Activity) -> Option<Arc<dyn Extension>> {
        let factory = self.extensions.get(activity.id()).map(|f| f.value().clone())?;
        factory(activity)
    }
}

/// Builder for [`ProcessGraph`]
pub struct ProcessGraphBuilder {
    graph: ProcessGraph,
}

impl ProcessGraphBuilder {
    /// Unconditional flow
    pub fn flow(self, id: &str, source_id: &str, target_id: &str) -> Self {
        self.graph.add_flow(FlowDefinition::new(id, source_id, target_id));
        self
    }

    /// Flow guarded by an expression
    pub fn conditional_flow(self, id: &str, source_id: &str, target_id: &str, expression: &str) -> Self {
        self.graph.add_flow(
            FlowDefinition::new(id, source_id, target_id)
                .with_condition(FlowCondition::Expression(expression.to_string())),
        );
        self
    }

    /// Default flow of the source
    pub fn default_flow(self, id: &str, source_id: &str, target_id: &str) -> Self {
        self.graph
            .add_flow(FlowDefinition::new(id, source_id, target_id).as_default());
        self
    }

    /// Flow from a full definition
    pub fn flow_definition(self, definition: FlowDefinition) -> Self {
        self.graph.add_flow(definition);
        self
    }

    /// Association
    pub fn association(self, id: &str, source_id: &str, target_id: &str) -> Self {
        self.graph
            .add_association(Association::new(id, source_id, target_id));
        self
    }

    /// Extension factory for an activity
    pub fn extension(self, activity_id: &str, factory: ExtensionFactory) -> Self {
        self.graph.add_extension(activity_id, factory);
        self
    }

    /// Finish
    pub fn build(self) -> Arc<ProcessGraph> {
        Arc::new(self.graph)
    }
}
