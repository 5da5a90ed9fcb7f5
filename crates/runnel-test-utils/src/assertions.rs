//! Assertion utilities for activity runs.

use runnel_core::{Activity, ActivityCounters, ActivityStatus};
use serde_json::Value;
use thiserror::Error;

use crate::recorder::EventRecorder;

/// Error type for activity assertion failures
#[derive(Debug, Error)]
pub enum AssertionError {
    #[error("Unexpected status of {activity}: expected {expected:?}, got {actual:?}")]
    Status {
        activity: String,
        expected: Option<ActivityStatus>,
        actual: Option<ActivityStatus>,
    },

    #[error("Unexpected counters of {activity}: expected {expected:?}, got {actual:?}")]
    Counters {
        activity: String,
        expected: ActivityCounters,
        actual: ActivityCounters,
    },

    #[error("Event sequence mismatch: expected {expected:?}, got {actual:?}")]
    Sequence { expected: Vec<String>, actual: Vec<String> },

    #[error("No {0} event recorded")]
    MissingEvent(String),

    #[error("Unexpected value at {path}: expected {expected}, got {actual}")]
    Value {
        path: String,
        expected: Value,
        actual: Value,
    },
}

/// Asserts the run status of an activity; `None` means idle.
pub fn assert_status(activity: &Activity, expected: Option<ActivityStatus>) -> Result<(), AssertionError> {
    let actual = activity.status();
    if actual != expected {
        return Err(AssertionError::Status {
            activity: activity.id().to_string(),
            expected,
            actual,
        });
    }
    Ok(())
}

/// Asserts the taken and discarded counters of an activity.
pub fn assert_counters(activity: &Activity, taken: u64, discarded: u64) -> Result<(), AssertionError> {
    let expected = ActivityCounters { taken, discarded };
    let actual = activity.counters();
    if actual != expected {
        return Err(AssertionError::Counters {
            activity: activity.id().to_string(),
            expected,
            actual,
        });
    }
    Ok(())
}

/// Asserts that the recorded routing keys of an activity equal `expected`.
pub fn assert_event_sequence(
    recorder: &EventRecorder,
    activity_id: &str,
    expected: &[&str],
) -> Result<(), AssertionError> {
    let actual = recorder.keys_of(activity_id);
    if actual != expected {
        return Err(AssertionError::Sequence {
            expected: expected.iter().map(|k| k.to_string()).collect(),
            actual,
        });
    }
    Ok(())
}

/// Asserts a value in the content of the last event with `routing_key`.
///
/// `path` is a dot separated list of object keys.
pub fn assert_last_content(
    recorder: &EventRecorder,
    routing_key: &str,
    path: &str,
    expected: Value,
) -> Result<(), AssertionError> {
    let message = recorder
        .last(routing_key)
        .ok_or_else(|| AssertionError::MissingEvent(routing_key.to_string()))?;
    let mut actual = Value::Object(message.content);
    for key in path.split('.') {
        actual = actual.get(key).cloned().unwrap_or(Value::Null);
    }
    if actual != expected {
        return Err(AssertionError::Value {
            path: path.to_string(),
            expected,
            actual,
        });
    }
    Ok(())
}
