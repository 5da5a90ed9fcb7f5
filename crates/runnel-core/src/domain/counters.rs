use serde::{Deserialize, Serialize};

/// Activity run counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivityCounters {
    /// Runs that left after a normal end
    #[serde(default)]
    pub taken: u64,
    /// Runs that left discarded
    #[serde(default)]
    pub discarded: u64,
}

/// Sequence flow counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowCounters {
    /// Take events
    #[serde(default)]
    pub taken: u64,
    /// Forwarded discards
    #[serde(default)]
    pub discarded: u64,
    /// Discards stopped at a revisited target
    #[serde(default)]
    pub looped: u64,
}

/// Association counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssociationCounters {
    /// Take events
    #[serde(default)]
    pub taken: u64,
    /// Complete events
    #[serde(default)]
    pub completed: u64,
}
