/// Run and flow counters
pub mod counters;

/// Exchange, queue and routing key names
pub mod events;

/// Sequence flows and associations
pub mod flow;
