/// The activity and its public api
pub mod activity;

/// Api commands addressed to an execution
pub mod api;

/// Behaviour seam and execution handles
pub mod behaviour;

/// Activity context and extensions
pub mod context;

/// Execution phase handling
pub mod execution;

/// Format request bookkeeping
pub(crate) mod formatting;

/// Inbound tokens, joins and the shake walk
pub mod inbound;

/// Run step handlers
mod lifecycle;

/// Multi-instance iteration scheduling
pub mod multi_instance;
