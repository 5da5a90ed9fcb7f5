//! Builders for test environments, graphs and activities

use std::sync::Arc;

use once_cell::sync::OnceCell;
use runnel_core::{
    Activity, ActivityContext, ActivityDefinition, BehaviourFactory, EngineResult, EngineSettings, Environment,
};

static LOGGING: OnceCell<()> = OnceCell::new();

/// Install a test-writer subscriber once per process; honours `RUST_LOG`
pub fn init_test_logging() {
    LOGGING.get_or_init(|| {
        let filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init();
    });
}

/// Default environment
pub fn environment() -> Arc<Environment> {
    Arc::new(Environment::default())
}

/// Environment in single-step mode
pub fn step_environment() -> Arc<Environment> {
    Arc::new(Environment::new(EngineSettings::default().with_step(true)))
}

/// Plain task definition
pub fn task(id: &str) -> ActivityDefinition {
    ActivityDefinition::new(id, "bpmn:Task")
}

/// Create an activity
pub fn activity(
    definition: ActivityDefinition,
    context: Arc<dyn ActivityContext>,
    behaviour: BehaviourFactory,
) -> EngineResult<Activity> {
    Activity::new(definition, context, behaviour)
}

/// Builder collecting the pieces of a test activity
pub struct TestActivity {
    definition: ActivityDefinition,
    context: Option<Arc<dyn ActivityContext>>,
    behaviour: Option<BehaviourFactory>,
}

impl TestActivity {
    /// Start from a definition
    pub fn new(definition: ActivityDefinition) -> Self {
        Self {
            definition,
            context: None,
            behaviour: None,
        }
    }

    /// Context the activity lives in; an empty graph when unset
    pub fn context(mut self, context: Arc<dyn ActivityContext>) -> Self {
        self.context = Some(context);
        self
    }

    /// Behaviour factory; completes with `null` when unset
    pub fn behaviour(mut self, behaviour: BehaviourFactory) -> Self {
        self.behaviour = Some(behaviour);
        self
    }

    /// Build the activity
    pub fn build(self) -> EngineResult<Activity> {
        let context = self
            .context
            .unwrap_or_else(|| Arc::new(runnel_core::ProcessGraph::new(environment())));
        let behaviour = self
            .behaviour
            .unwrap_or_else(|| crate::behaviours::CompleteBehaviour::with_output(serde_json::Value::Null).factory());
        Activity::new(self.definition, context, behaviour)
    }
}
