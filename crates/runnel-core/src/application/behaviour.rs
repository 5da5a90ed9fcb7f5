//! Execution behaviour seam
//!
//! A behaviour performs the actual work of an activity. It receives the
//! execution start message and an [`ExecutionHandle`] and answers, now or
//! later, with `complete`, `error` or `discard`.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use runnel_broker::{Broker, Content, Message, MessageHandler, MessageProperties, SubscribeOptions};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, error};

use crate::application::activity::Activity;
use crate::domain::events::{
    activity_event, API_EXCHANGE, EVENT_EXCHANGE, EXECUTION_COMPLETED, EXECUTION_DISCARD,
    EXECUTION_ERROR, EXECUTION_EXCHANGE,
};
use crate::error::{from_broker, EngineError, EngineResult};
use crate::types::TokenAction;

/// Explicit decision for one outbound flow
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboundDecision {
    /// Outbound flow id
    pub id: String,
    /// Take or discard
    pub action: TokenAction,
}

impl OutboundDecision {
    /// Take the flow
    pub fn take(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            action: TokenAction::Take,
        }
    }

    /// Discard the flow
    pub fn discard(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            action: TokenAction::Discard,
        }
    }
}

/// The work an activity performs once executing
pub trait Behaviour: Send + Sync {
    /// Start executing; answer through the handle
    fn execute(&self, message: &Message, execution: ExecutionHandle) -> EngineResult<()>;

    /// Behaviour state to persist with the activity
    fn get_state(&self) -> Option<Value> {
        None
    }

    /// Restore persisted behaviour state
    fn recover(&self, _state: &Value) -> EngineResult<()> {
        Ok(())
    }
}

/// Builds the behaviour of an activity
pub type BehaviourFactory = Arc<dyn Fn(&Activity) -> Arc<dyn Behaviour> + Send + Sync>;

/// Factory handing out the same behaviour instance to every activity
pub fn shared_behaviour(behaviour: Arc<dyn Behaviour>) -> BehaviourFactory {
    Arc::new(move |_| behaviour.clone())
}

/// Reply channel of one execution
#[derive(Clone)]
pub struct ExecutionHandle {
    activity_id: String,
    execution_id: String,
    root_execution_id: String,
    broker: Broker,
}

impl fmt::Debug for ExecutionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionHandle")
            .field("activity_id", &self.activity_id)
            .field("execution_id", &self.execution_id)
            .finish()
    }
}

impl ExecutionHandle {
    pub(crate) fn new(activity_id: &str, execution_id: &str, root_execution_id: &str, broker: Broker) -> Self {
        Self {
            activity_id: activity_id.to_string(),
            execution_id: execution_id.to_string(),
            root_execution_id: root_execution_id.to_string(),
            broker,
        }
    }

    /// Activity id
    pub fn activity_id(&self) -> &str {
        &self.activity_id
    }

    /// Execution id this handle answers for
    pub fn execution_id(&self) -> &str {
        &self.execution_id
    }

    /// True for the root execution of a run
    pub fn is_root(&self) -> bool {
        self.execution_id == self.root_execution_id
    }

    /// Broker of the owning activity
    pub fn broker(&self) -> &Broker {
        &self.broker
    }

    fn publish(&self, routing_key: &str, mut content: Content) -> EngineResult<()> {
        content.insert("id".to_string(), json!(self.activity_id));
        content.insert("executionId".to_string(), json!(self.execution_id));
        content.insert("isRootScope".to_string(), json!(self.is_root()));
        self.broker
            .publish(EXECUTION_EXCHANGE, routing_key, content, MessageProperties::default())
            .map_err(|e| from_broker(&self.activity_id, e))
    }

    /// Complete with output
    pub fn complete(&self, output: Value) -> EngineResult<()> {
        debug!(activity = %self.activity_id, execution_id = %self.execution_id, "execution completed");
        let mut content = Content::new();
        content.insert("output".to_string(), output);
        self.publish(EXECUTION_COMPLETED, content)
    }

    /// Complete with output and an explicit outbound flow list
    pub fn complete_with_outbound(&self, output: Value, outbound: Vec<OutboundDecision>) -> EngineResult<()> {
        let mut content = Content::new();
        content.insert("output".to_string(), output);
        content.insert("outbound".to_string(), serde_json::to_value(outbound)?);
        self.publish(EXECUTION_COMPLETED, content)
    }

    /// Fail the execution
    pub fn error(&self, err: EngineError) -> EngineResult<()> {
        debug!(activity = %self.activity_id, execution_id = %self.execution_id, error = %err, "execution failed");
        let mut content = Content::new();
        content.insert("error".to_string(), err.to_content());
        self.publish(EXECUTION_ERROR, content)
    }

    /// Discard the execution
    pub fn discard(&self) -> EngineResult<()> {
        self.publish(EXECUTION_DISCARD, Content::new())
    }

    /// Publish an activity event such as `wait`
    pub fn publish_event(&self, name: &str, mut content: Content) -> EngineResult<()> {
        content.insert("id".to_string(), json!(self.activity_id));
        content.insert("executionId".to_string(), json!(self.execution_id));
        self.broker
            .publish(EVENT_EXCHANGE, &activity_event(name), content, MessageProperties::default())
            .map_err(|e| from_broker(&self.activity_id, e))
    }

    /// Listen to api messages addressed to this execution
    pub fn on_api(&self, handler: MessageHandler) -> EngineResult<String> {
        let pattern = format!("activity.*.{}", self.execution_id);
        Ok(self
            .broker
            .subscribe(API_EXCHANGE, &pattern, handler, SubscribeOptions::default())?)
    }

    /// Stop listening to api messages
    pub fn cancel(&self, consumer_tag: &str) -> EngineResult<()> {
        self.broker.cancel(consumer_tag)?;
        Ok(())
    }
}

/// Behaviour running on an async runtime
#[async_trait]
pub trait AsyncBehaviour: Send + Sync + 'static {
    /// Execute and resolve with the output
    async fn execute(&self, message: Message) -> EngineResult<Value>;
}

/// Adapter running an [`AsyncBehaviour`] on the Tokio runtime
pub struct TokioBehaviour<B: AsyncBehaviour> {
    inner: Arc<B>,
    runtime: tokio::runtime::Handle,
}

impl<B: AsyncBehaviour> TokioBehaviour<B> {
    /// Wrap a behaviour; must be called within a Tokio runtime
    pub fn new(inner: B) -> EngineResult<Self> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| EngineError::ConfigurationError(format!("no tokio runtime: {}", e)))?;
        Ok(Self::with_handle(inner, runtime))
    }

    /// Wrap a behaviour with an explicit runtime handle
    pub fn with_handle(inner: B, runtime: tokio::runtime::Handle) -> Self {
        Self {
            inner: Arc::new(inner),
            runtime,
        }
    }
}

impl<B: AsyncBehaviour> Behaviour for TokioBehaviour<B> {
    fn execute(&self, message: &Message, execution: ExecutionHandle) -> EngineResult<()> {
        let inner = self.inner.clone();
        let message = message.clone();
        self.runtime.spawn(async move {
            let result = match inner.execute(message).await {
                Ok(output) => execution.complete(output),
                Err(err) => execution.error(err),
            };
            if let Err(err) = result {
                error!(
                    activity = %execution.activity_id(),
                    execution_id = %execution.execution_id(),
                    error = %err,
                    "async execution settled with error"
                );
            }
        });
        Ok(())
    }
}
