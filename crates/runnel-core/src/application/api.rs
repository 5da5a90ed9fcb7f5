//! Api handed to listeners and behaviours

use runnel_broker::{Broker, Content, MessageProperties};
use serde_json::json;

use crate::domain::events::{api_routing_key, API_EXCHANGE, FORMAT_EXCHANGE, FORMAT_START};
use crate::error::{from_broker, EngineError, EngineResult};

/// Commands addressed to one execution of an activity
#[derive(Debug, Clone)]
pub struct ActivityApi {
    broker: Broker,
    activity_id: String,
    execution_id: String,
    content: Content,
}

impl ActivityApi {
    pub(crate) fn new(broker: Broker, activity_id: &str, execution_id: &str, content: Content) -> Self {
        Self {
            broker,
            activity_id: activity_id.to_string(),
            execution_id: execution_id.to_string(),
            content,
        }
    }

    /// Activity id
    pub fn id(&self) -> &str {
        &self.activity_id
    }

    /// Execution the api is bound to
    pub fn execution_id(&self) -> &str {
        &self.execution_id
    }

    /// Content of the message the api was created from
    pub fn content(&self) -> &Content {
        &self.content
    }

    /// Publish `activity.<action>.<executionId>` on the api exchange
    pub fn send(&self, action: &str, mut content: Content) -> EngineResult<()> {
        content.insert("id".to_string(), json!(self.activity_id));
        content.insert("executionId".to_string(), json!(self.execution_id));
        self.broker
            .publish(
                API_EXCHANGE,
                &api_routing_key(action, &self.execution_id),
                content,
                MessageProperties::default().with_type(action),
            )
            .map_err(|e| from_broker(&self.activity_id, e))
    }

    /// Signal a waiting behaviour
    pub fn signal(&self, content: Content) -> EngineResult<()> {
        self.send("signal", content)
    }

    /// Discard the execution
    pub fn discard(&self) -> EngineResult<()> {
        self.send("discard", Content::new())
    }

    /// Stop the activity
    pub fn stop(&self) -> EngineResult<()> {
        self.send("stop", Content::new())
    }

    /// Open a format request; the run waits for a message on `end_routing_key`
    pub fn format_start(&self, end_routing_key: &str, mut content: Content) -> EngineResult<()> {
        check_format_key(end_routing_key)?;
        content.insert("endRoutingKey".to_string(), json!(end_routing_key));
        self.publish_format(FORMAT_START, content)
    }

    /// Close a format request with its result
    pub fn format_end(&self, end_routing_key: &str, content: Content) -> EngineResult<()> {
        check_format_key(end_routing_key)?;
        self.publish_format(end_routing_key, content)
    }

    fn publish_format(&self, routing_key: &str, content: Content) -> EngineResult<()> {
        self.broker
            .publish(FORMAT_EXCHANGE, routing_key, content, MessageProperties::default())
            .map_err(|e| from_broker(&self.activity_id, e))
    }
}

fn check_format_key(routing_key: &str) -> EngineResult<()> {
    if routing_key.starts_with("run.") && routing_key != FORMAT_START {
        return Ok(());
    }
    Err(EngineError::ConfigurationError(format!(
        "Format routing key {} must start with run. and differ from {}",
        routing_key, FORMAT_START
    )))
}
