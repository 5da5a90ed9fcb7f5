use runnel_broker::{content_from, BrokerError, Message, MessageProperties};
use serde_json::Value;
use thiserror::Error;

/// Core error type for the Runnel engine
#[derive(Error, Debug, Clone, PartialEq)]
pub enum EngineError {
    /// `run()` called while a run is in progress
    #[error("Activity {0} is already running")]
    AlreadyRunning(String),

    /// `resume()` called while the activity is running and not stopped
    #[error("Cannot resume activity {0} while it is running")]
    ResumeWhileRunning(String),

    /// `recover()` called while the activity is running
    #[error("Cannot recover activity {0} while it is running")]
    RecoverWhileRunning(String),

    /// An execution error nobody handled
    #[error("Unhandled error in activity {activity_id}: {message}")]
    UnhandledError {
        /// Failing activity
        activity_id: String,
        /// Error description
        message: String,
        /// Error payload as published
        error: Value,
    },

    /// Message router failure
    #[error("Broker error: {0}")]
    Broker(#[from] BrokerError),

    /// Expression evaluation error
    #[error("Expression evaluation error: {0}")]
    ExpressionError(String),

    /// Script evaluation error
    #[error("Script error: {0}")]
    ScriptError(String),

    /// Behaviour reported an execution failure
    #[error("Execution error: {0}")]
    ExecutionError(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl EngineError {
    /// Error payload published on error events
    pub fn to_content(&self) -> Value {
        match self {
            EngineError::UnhandledError { error, .. } => error.clone(),
            other => serde_json::json!({
                "type": other.kind(),
                "message": other.to_string(),
            }),
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            EngineError::AlreadyRunning(_) => "AlreadyRunning",
            EngineError::ResumeWhileRunning(_) => "ResumeWhileRunning",
            EngineError::RecoverWhileRunning(_) => "RecoverWhileRunning",
            EngineError::UnhandledError { .. } => "UnhandledError",
            EngineError::Broker(_) => "BrokerError",
            EngineError::ExpressionError(_) => "ExpressionError",
            EngineError::ScriptError(_) => "ScriptError",
            EngineError::ExecutionError(_) => "ExecutionError",
            EngineError::ConfigurationError(_) => "ConfigurationError",
            EngineError::SerializationError(_) => "SerializationError",
            EngineError::Other(_) => "Error",
        }
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(err: serde_json::Error) -> Self {
        EngineError::SerializationError(err.to_string())
    }
}

impl From<String> for EngineError {
    fn from(err: String) -> Self {
        EngineError::Other(err)
    }
}

impl From<&str> for EngineError {
    fn from(err: &str) -> Self {
        EngineError::Other(err.to_string())
    }
}

/// Engine errors raised inside a message handler travel back through the
/// router as handler failures; unhandled errors keep their payload.
impl From<EngineError> for BrokerError {
    fn from(err: EngineError) -> Self {
        match err {
            EngineError::Broker(inner) => inner,
            EngineError::UnhandledError {
                activity_id, error, ..
            } => {
                let content = content_from(serde_json::json!({ "id": activity_id, "error": error }));
                let message = Message::new(
                    "event",
                    "activity.error",
                    content,
                    MessageProperties::default().mandatory(),
                );
                BrokerError::Unroutable {
                    exchange: "event".to_string(),
                    routing_key: "activity.error".to_string(),
                    message: Box::new(message),
                }
            }
            other => BrokerError::Handler(other.to_string()),
        }
    }
}

/// Result type for engine operations
pub type EngineResult<T> = Result<T, EngineError>;

/// Lift a router error; a returned `activity.error` becomes [`EngineError::UnhandledError`]
pub fn from_broker(source_id: &str, err: BrokerError) -> EngineError {
    match err {
        BrokerError::Unroutable {
            routing_key,
            message,
            ..
        } if routing_key == "activity.error" => {
            let error = message.content.get("error").cloned().unwrap_or(Value::Null);
            let description = error
                .get("message")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| error.to_string());
            EngineError::UnhandledError {
                activity_id: message
                    .get_str("id")
                    .unwrap_or(source_id)
                    .to_string(),
                message: description,
                error,
            }
        }
        other => EngineError::Broker(other),
    }
}
