//! Engine configuration
//!
//! Settings start from serde defaults and are overridden by `RUNNEL_*`
//! environment variables.

use serde::{Deserialize, Serialize};
use std::env;
use std::str::FromStr;
use tracing::warn;

use crate::error::{EngineError, EngineResult};

/// Settings shared by every activity of an environment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineSettings {
    /// Single-step mode; run messages are only handled through `next()`
    #[serde(default)]
    pub step: bool,

    /// Skip state snapshots for idle activities
    #[serde(default)]
    pub disable_track_state: bool,

    /// Max unacknowledged inbound tokens held by an activity
    #[serde(default = "default_prefetch")]
    pub inbound_prefetch: usize,

    /// Max unacknowledged execution messages held by a single-instance activity;
    /// multi-instance activities hold every running iteration
    #[serde(default = "default_prefetch")]
    pub execution_prefetch: usize,
}

fn default_prefetch() -> usize {
    1000
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            step: false,
            disable_track_state: false,
            inbound_prefetch: default_prefetch(),
            execution_prefetch: default_prefetch(),
        }
    }
}

impl EngineSettings {
    /// Load settings from environment variables over defaults
    pub fn load() -> Self {
        let mut settings = Self::default();

        if let Some(step) = parse_var::<bool>("RUNNEL_STEP") {
            settings.step = step;
        }

        if let Some(disable) = parse_var::<bool>("RUNNEL_DISABLE_TRACK_STATE") {
            settings.disable_track_state = disable;
        }

        if let Some(prefetch) = parse_var::<usize>("RUNNEL_INBOUND_PREFETCH") {
            settings.inbound_prefetch = prefetch.max(1);
        }

        if let Some(prefetch) = parse_var::<usize>("RUNNEL_EXECUTION_PREFETCH") {
            settings.execution_prefetch = prefetch.max(1);
        }

        settings
    }

    /// Parse settings from a JSON document
    pub fn from_json(json: &str) -> EngineResult<Self> {
        serde_json::from_str(json)
            .map_err(|e| EngineError::ConfigurationError(format!("invalid engine settings: {}", e)))
    }

    /// Enable single-step mode
    pub fn with_step(mut self, step: bool) -> Self {
        self.step = step;
        self
    }

    /// Disable state tracking for idle activities
    pub fn with_disable_track_state(mut self, disable: bool) -> Self {
        self.disable_track_state = disable;
        self
    }
}

/// Read and parse an environment variable, warning on garbage
pub(crate) fn parse_var<T: FromStr>(name: &str) -> Option<T> {
    let value = env::var(name).ok()?;
    match value.trim().parse::<T>() {
        Ok(parsed) => Some(parsed),
        Err(_) => {
            warn!("Invalid {} value: {}", name, value);
            None
        }
    }
}
