use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Flat, serialization-safe message payload
pub type Content = Map<String, Value>;

/// Delivery metadata set by the router
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageFields {
    /// Topic of the message
    pub routing_key: String,

    /// Exchange the message was published to, empty for direct queue sends
    #[serde(default)]
    pub exchange: String,

    /// Set when the message was requeued or restored from a snapshot
    #[serde(default)]
    pub redelivered: bool,

    /// Consumer currently holding the message
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub consumer_tag: Option<String>,

    /// Queue-local delivery tag, only meaningful while delivered
    #[serde(skip)]
    pub delivery_tag: Option<u64>,

    /// Queue the message was delivered from
    #[serde(skip)]
    pub queue: Option<String>,
}

/// Publisher supplied message properties
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageProperties {
    /// Unique message id
    #[serde(default)]
    pub message_id: String,

    /// Persistent messages are part of queue snapshots
    #[serde(default = "default_persistent")]
    pub persistent: bool,

    /// Unroutable mandatory messages are returned instead of dropped
    #[serde(default)]
    pub mandatory: bool,

    /// Optional message type
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub message_type: Option<String>,

    /// Tag of the consumer that originated the message
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub consumer_tag: Option<String>,

    /// Correlation id set by the publisher
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,

    /// Publish time in milliseconds since the epoch
    #[serde(default)]
    pub timestamp: i64,
}

fn default_persistent() -> bool {
    true
}

impl Default for MessageProperties {
    fn default() -> Self {
        Self {
            message_id: String::new(),
            persistent: true,
            mandatory: false,
            message_type: None,
            consumer_tag: None,
            correlation_id: None,
            timestamp: 0,
        }
    }
}

impl MessageProperties {
    /// Mark the message as mandatory
    pub fn mandatory(mut self) -> Self {
        self.mandatory = true;
        self
    }

    /// Exclude the message from snapshots
    pub fn transient(mut self) -> Self {
        self.persistent = false;
        self
    }

    /// Set the message type
    pub fn with_type(mut self, message_type: impl Into<String>) -> Self {
        self.message_type = Some(message_type.into());
        self
    }

    /// Set the correlation id
    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }
}

/// A routed message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Router metadata
    pub fields: MessageFields,

    /// Payload
    pub content: Content,

    /// Publisher metadata
    pub properties: MessageProperties,
}

impl Message {
    /// Create a message addressed to an exchange
    pub fn new(
        exchange: &str,
        routing_key: &str,
        content: Content,
        mut properties: MessageProperties,
    ) -> Self {
        if properties.message_id.is_empty() {
            properties.message_id = format!("smq.mid-{}", uuid::Uuid::new_v4().simple());
        }
        if properties.timestamp == 0 {
            properties.timestamp = chrono::Utc::now().timestamp_millis();
        }

        Self {
            fields: MessageFields {
                routing_key: routing_key.to_string(),
                exchange: exchange.to_string(),
                redelivered: false,
                consumer_tag: None,
                delivery_tag: None,
                queue: None,
            },
            content,
            properties,
        }
    }

    /// Topic of the message
    #[inline]
    pub fn routing_key(&self) -> &str {
        &self.fields.routing_key
    }

    /// True if the message was restored or requeued
    #[inline]
    pub fn redelivered(&self) -> bool {
        self.fields.redelivered
    }

    /// Get a content value
    #[inline]
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.content.get(key)
    }

    /// Get a string content value
    #[inline]
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.content.get(key).and_then(Value::as_str)
    }

    /// Message type property
    pub fn message_type(&self) -> Option<&str> {
        self.properties.message_type.as_deref()
    }
}

/// Convert any JSON object into message content; other values are wrapped
/// under a `value` key.
pub fn content_from(value: Value) -> Content {
    match value {
        Value::Object(map) => map,
        Value::Null => Content::new(),
        other => {
            let mut map = Content::new();
            map.insert("value".to_string(), other);
            map
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_new_message_assigns_id_and_timestamp() {
        let message = Message::new(
            "run",
            "run.enter",
            content_from(json!({"id": "task"})),
            MessageProperties::default(),
        );

        assert!(message.properties.message_id.starts_with("smq.mid-"));
        assert!(message.properties.timestamp > 0);
        assert!(message.properties.persistent);
        assert_eq!(message.routing_key(), "run.enter");
        assert_eq!(message.get_str("id"), Some("task"));
        assert!(!message.redelivered());
    }

    #[test]
    fn test_properties_type_is_renamed() {
        let properties = MessageProperties::default().with_type("enter").mandatory();
        let json = serde_json::to_value(&properties).unwrap();
        assert_eq!(json["type"], "enter");
        assert_eq!(json["mandatory"], true);
    }

    #[test]
    fn test_content_from_wraps_scalars() {
        assert_eq!(content_from(json!(3))["value"], 3);
        assert!(content_from(Value::Null).is_empty());
    }
}
