//! Behaviours for driving activities in tests
//!
//! Each behaviour can be handed to an activity through
//! [`runnel_core::shared_behaviour`]; they keep track of what they executed
//! so tests can inspect it afterwards.

use std::collections::HashSet;
use std::sync::Arc;

use mockall::mock;
use parking_lot::Mutex;
use runnel_broker::{handler, Message};
use runnel_core::{
    shared_behaviour, Behaviour, BehaviourFactory, Content, EngineError, EngineResult, ExecutionHandle,
    OutboundDecision,
};
use serde_json::{json, Value};
use tracing::debug;

mock! {
    /// Mockall behaviour for expectation-style tests
    pub Behaviour {}

    impl runnel_core::Behaviour for Behaviour {
        fn execute(&self, message: &Message, execution: ExecutionHandle) -> EngineResult<()>;
        fn get_state(&self) -> Option<Value>;
        fn recover(&self, state: &Value) -> EngineResult<()>;
    }
}

type OutputFn = Arc<dyn Fn(&Message) -> Value + Send + Sync>;

/// Completes every execution immediately
pub struct CompleteBehaviour {
    output: OutputFn,
    executions: Mutex<Vec<Message>>,
}

impl CompleteBehaviour {
    /// Complete with a fixed output
    pub fn with_output(output: Value) -> Arc<Self> {
        Self::with(move |_| output.clone())
    }

    /// Complete with an output computed from the start message
    pub fn with<F>(output: F) -> Arc<Self>
    where
        F: Fn(&Message) -> Value + Send + Sync + 'static,
    {
        Arc::new(Self {
            output: Arc::new(output),
            executions: Mutex::new(Vec::new()),
        })
    }

    /// Complete iterations with `<prefix><index>`
    pub fn indexed(prefix: &str) -> Arc<Self> {
        let prefix = prefix.to_string();
        Self::with(move |message| {
            let index = message.get("index").and_then(Value::as_u64).unwrap_or_default();
            json!(format!("{}{}", prefix, index))
        })
    }

    /// Start messages executed so far
    pub fn executions(&self) -> Vec<Message> {
        self.executions.lock().clone()
    }

    /// Number of executions
    pub fn execution_count(&self) -> usize {
        self.executions.lock().len()
    }

    /// Factory handing this behaviour to an activity
    pub fn factory(self: &Arc<Self>) -> BehaviourFactory {
        shared_behaviour(self.clone())
    }
}

impl Behaviour for CompleteBehaviour {
    fn execute(&self, message: &Message, execution: ExecutionHandle) -> EngineResult<()> {
        self.executions.lock().push(message.clone());
        execution.complete((self.output)(message))
    }
}

/// Completes with an explicit outbound flow list
pub struct DecisionBehaviour {
    output: Value,
    decisions: Vec<OutboundDecision>,
}

impl DecisionBehaviour {
    /// Decide the outbound flows
    pub fn new(output: Value, decisions: Vec<OutboundDecision>) -> Arc<Self> {
        Arc::new(Self { output, decisions })
    }

    /// Factory handing this behaviour to an activity
    pub fn factory(self: &Arc<Self>) -> BehaviourFactory {
        shared_behaviour(self.clone())
    }
}

impl Behaviour for DecisionBehaviour {
    fn execute(&self, _message: &Message, execution: ExecutionHandle) -> EngineResult<()> {
        execution.complete_with_outbound(self.output.clone(), self.decisions.clone())
    }
}

/// Fails every execution
pub struct FailingBehaviour {
    message: String,
    thrown: bool,
}

impl FailingBehaviour {
    /// Fail through the execution handle
    pub fn new(message: &str) -> Arc<Self> {
        Arc::new(Self {
            message: message.to_string(),
            thrown: false,
        })
    }

    /// Fail by returning an error from `execute`
    pub fn throwing(message: &str) -> Arc<Self> {
        Arc::new(Self {
            message: message.to_string(),
            thrown: true,
        })
    }

    /// Factory handing this behaviour to an activity
    pub fn factory(self: &Arc<Self>) -> BehaviourFactory {
        shared_behaviour(self.clone())
    }
}

impl Behaviour for FailingBehaviour {
    fn execute(&self, _message: &Message, execution: ExecutionHandle) -> EngineResult<()> {
        let err = EngineError::ExecutionError(self.message.clone());
        if self.thrown {
            return Err(err);
        }
        execution.error(err)
    }
}

/// Holds executions until the test settles them
#[derive(Default)]
pub struct ManualBehaviour {
    pending: Mutex<Vec<(Message, ExecutionHandle)>>,
    state: Mutex<Option<Value>>,
}

impl ManualBehaviour {
    /// Empty behaviour
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Factory handing this behaviour to an activity
    pub fn factory(self: &Arc<Self>) -> BehaviourFactory {
        shared_behaviour(self.clone())
    }

    /// Execution ids waiting to be settled, in start order
    pub fn pending_ids(&self) -> Vec<String> {
        self.pending
            .lock()
            .iter()
            .map(|(_, handle)| handle.execution_id().to_string())
            .collect()
    }

    /// Start message of a pending execution
    pub fn message(&self, execution_id: &str) -> Option<Message> {
        self.pending
            .lock()
            .iter()
            .find(|(_, handle)| handle.execution_id() == execution_id)
            .map(|(message, _)| message.clone())
    }

    fn take(&self, execution_id: &str) -> Option<ExecutionHandle> {
        let mut pending = self.pending.lock();
        let position = pending
            .iter()
            .position(|(_, handle)| handle.execution_id() == execution_id)?;
        Some(pending.remove(position).1)
    }

    /// Complete a pending execution; false when it is not pending
    pub fn complete(&self, execution_id: &str, output: Value) -> EngineResult<bool> {
        match self.take(execution_id) {
            Some(handle) => handle.complete(output).map(|_| true),
            None => Ok(false),
        }
    }

    /// Complete the oldest pending execution and return its id
    pub fn complete_next(&self, output: Value) -> EngineResult<Option<String>> {
        let next = self.pending_ids().into_iter().next();
        match next {
            Some(execution_id) => {
                self.complete(&execution_id, output)?;
                Ok(Some(execution_id))
            }
            None => Ok(None),
        }
    }

    /// Fail a pending execution
    pub fn error(&self, execution_id: &str, err: EngineError) -> EngineResult<bool> {
        match self.take(execution_id) {
            Some(handle) => handle.error(err).map(|_| true),
            None => Ok(false),
        }
    }

    /// Discard a pending execution
    pub fn discard(&self, execution_id: &str) -> EngineResult<bool> {
        match self.take(execution_id) {
            Some(handle) => handle.discard().map(|_| true),
            None => Ok(false),
        }
    }

    /// Forget every pending execution
    pub fn clear(&self) {
        self.pending.lock().clear();
    }

    /// Behaviour state persisted with the activity
    pub fn set_state(&self, state: Value) {
        *self.state.lock() = Some(state);
    }

    /// Last state handed to `recover`
    pub fn state(&self) -> Option<Value> {
        self.state.lock().clone()
    }
}

impl Behaviour for ManualBehaviour {
    fn execute(&self, message: &Message, execution: ExecutionHandle) -> EngineResult<()> {
        let mut pending = self.pending.lock();
        pending.retain(|(_, handle)| handle.execution_id() != execution.execution_id());
        pending.push((message.clone(), execution));
        Ok(())
    }

    fn get_state(&self) -> Option<Value> {
        self.state.lock().clone()
    }

    fn recover(&self, state: &Value) -> EngineResult<()> {
        *self.state.lock() = Some(state.clone());
        Ok(())
    }
}

/// Publishes a `wait` event and completes when signalled through the api
///
/// The signal content's `output` becomes the execution output. Redelivered
/// start messages resubscribe without publishing `wait` again.
#[derive(Default)]
pub struct WaitingBehaviour {
    listening: Mutex<HashSet<String>>,
}

impl WaitingBehaviour {
    /// New behaviour
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Factory handing this behaviour to an activity
    pub fn factory(self: &Arc<Self>) -> BehaviourFactory {
        shared_behaviour(self.clone())
    }
}

impl Behaviour for WaitingBehaviour {
    fn execute(&self, message: &Message, execution: ExecutionHandle) -> EngineResult<()> {
        let execution_id = execution.execution_id().to_string();
        if self.listening.lock().insert(execution_id.clone()) {
            let handle = execution.clone();
            execution.on_api(handler(move |broker, api_message| {
                let routing_key = api_message.routing_key();
                if routing_key.starts_with("activity.signal.") {
                    let output = api_message.get("output").cloned().unwrap_or(Value::Null);
                    if let Some(tag) = &api_message.fields.consumer_tag {
                        broker.cancel(tag)?;
                    }
                    handle.complete(output)?;
                } else if routing_key.starts_with("activity.discard.") {
                    if let Some(tag) = &api_message.fields.consumer_tag {
                        broker.cancel(tag)?;
                    }
                }
                Ok(())
            }))?;
        }

        if !message.redelivered() {
            debug!(execution_id = %execution_id, "waiting for signal");
            let mut content = Content::new();
            content.insert("state".to_string(), json!("wait"));
            execution.publish_event("wait", content)?;
        }
        Ok(())
    }
}
