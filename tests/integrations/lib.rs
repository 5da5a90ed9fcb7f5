// Runnel Integration Tests
//
// End-to-end scenarios wiring several activities into one process graph

use std::collections::BTreeMap;
use std::sync::Arc;

use runnel_core::{
    Activity, ActivityDefinition, ActivityState, BehaviourFactory, EngineError, EngineResult, Environment,
    ProcessGraph,
};
use runnel_test_utils::EventRecorder;
use tracing::debug;

/// Activities of one process sharing a graph and a recorder
pub struct Process {
    graph: Arc<ProcessGraph>,
    activities: Vec<Activity>,
    recorder: EventRecorder,
}

impl Process {
    /// Process over a built graph; activities are added afterwards
    pub fn new(graph: Arc<ProcessGraph>) -> Self {
        runnel_test_utils::init_test_logging();
        Self {
            graph,
            activities: Vec::new(),
            recorder: EventRecorder::new(),
        }
    }

    /// Create an activity in the graph and record its events
    pub fn add(&mut self, definition: ActivityDefinition, behaviour: BehaviourFactory) -> EngineResult<&Activity> {
        let activity = Activity::new(definition, self.graph.clone(), behaviour)?;
        self.recorder.attach(&activity)?;
        debug!(activity = %activity.id(), "added to process");
        self.activities.push(activity);
        Ok(&self.activities[self.activities.len() - 1])
    }

    /// Activity by id
    pub fn activity(&self, id: &str) -> &Activity {
        self.activities
            .iter()
            .find(|a| a.id() == id)
            .unwrap_or_else(|| panic!("no activity {}", id))
    }

    /// Shared environment
    pub fn environment(&self) -> Arc<Environment> {
        runnel_core::ActivityContext::environment(self.graph.as_ref())
    }

    /// Recorded events of every activity
    pub fn recorder(&self) -> &EventRecorder {
        &self.recorder
    }

    /// Ids of activities currently running
    pub fn running(&self) -> Vec<String> {
        self.activities
            .iter()
            .filter(|a| a.is_running())
            .map(|a| a.id().to_string())
            .collect()
    }

    /// State of every activity keyed by id
    pub fn get_state(&self) -> BTreeMap<String, ActivityState> {
        self.activities
            .iter()
            .filter_map(|a| a.get_state().map(|s| (a.id().to_string(), s)))
            .collect()
    }

    /// Recover every activity with a saved state, then resume them
    pub fn recover(&self, states: &BTreeMap<String, ActivityState>) -> EngineResult<()> {
        for activity in &self.activities {
            if let Some(state) = states.get(activity.id()) {
                activity.recover(state)?;
            }
        }
        for activity in &self.activities {
            activity.resume()?;
        }
        Ok(())
    }

    /// Times an activity left taken and discarded
    pub fn counters(&self, id: &str) -> (u64, u64) {
        let counters = self.activity(id).counters();
        (counters.taken, counters.discarded)
    }
}

/// Serialize process state the way a store would persist it
pub fn to_json(states: &BTreeMap<String, ActivityState>) -> Result<String, EngineError> {
    Ok(serde_json::to_string(states)?)
}

/// Parse persisted process state
pub fn from_json(json: &str) -> Result<BTreeMap<String, ActivityState>, EngineError> {
    Ok(serde_json::from_str(json)?)
}
