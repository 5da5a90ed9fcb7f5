//! Records activity events in publish order

use std::sync::Arc;

use parking_lot::Mutex;
use runnel_core::{Activity, EngineResult, Message};

/// One recorded event
#[derive(Debug, Clone)]
pub struct RecordedEvent {
    /// Activity the event was published by
    pub activity_id: String,
    /// Event routing key, e.g. `activity.end`
    pub routing_key: String,
    /// Full message
    pub message: Message,
}

/// Shared event log across one or more activities
#[derive(Clone, Default)]
pub struct EventRecorder {
    events: Arc<Mutex<Vec<RecordedEvent>>>,
}

impl EventRecorder {
    /// Empty recorder
    pub fn new() -> Self {
        Self::default()
    }

    /// Record every event of the activity; returns the listener tag
    pub fn attach(&self, activity: &Activity) -> EngineResult<String> {
        let events = self.events.clone();
        activity.on("#", move |activity, message| {
            events.lock().push(RecordedEvent {
                activity_id: activity.id().to_string(),
                routing_key: message.routing_key().to_string(),
                message: message.clone(),
            });
            Ok(())
        })
    }

    /// Record several activities into the same log
    pub fn attach_all(&self, activities: &[&Activity]) -> EngineResult<()> {
        for activity in activities {
            self.attach(activity)?;
        }
        Ok(())
    }

    /// Every recorded event
    pub fn events(&self) -> Vec<RecordedEvent> {
        self.events.lock().clone()
    }

    /// Routing keys in order
    pub fn routing_keys(&self) -> Vec<String> {
        self.events.lock().iter().map(|e| e.routing_key.clone()).collect()
    }

    /// `<activity id>:<routing key>` entries in order
    pub fn entries(&self) -> Vec<String> {
        self.events
            .lock()
            .iter()
            .map(|e| format!("{}:{}", e.activity_id, e.routing_key))
            .collect()
    }

    /// Routing keys published by one activity
    pub fn keys_of(&self, activity_id: &str) -> Vec<String> {
        self.events
            .lock()
            .iter()
            .filter(|e| e.activity_id == activity_id)
            .map(|e| e.routing_key.clone())
            .collect()
    }

    /// Messages with a routing key
    pub fn messages(&self, routing_key: &str) -> Vec<Message> {
        self.events
            .lock()
            .iter()
            .filter(|e| e.routing_key == routing_key)
            .map(|e| e.message.clone())
            .collect()
    }

    /// Last message with a routing key
    pub fn last(&self, routing_key: &str) -> Option<Message> {
        self.messages(routing_key).pop()
    }

    /// Number of events with a routing key
    pub fn count(&self, routing_key: &str) -> usize {
        self.messages(routing_key).len()
    }

    /// Forget recorded events
    pub fn clear(&self) {
        self.events.lock().clear();
    }
}
