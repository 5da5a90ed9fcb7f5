//! Exchange, queue and routing key names used on activity and flow brokers

/// Run lifecycle exchange
pub const RUN_EXCHANGE: &str = "run";
/// Format request exchange
pub const FORMAT_EXCHANGE: &str = "format";
/// Private execution exchange
pub const EXECUTION_EXCHANGE: &str = "execution";
/// Api exchange
pub const API_EXCHANGE: &str = "api";
/// Public event exchange
pub const EVENT_EXCHANGE: &str = "event";

/// Run queue
pub const RUN_QUEUE: &str = "run-q";
/// Format queue
pub const FORMAT_QUEUE: &str = "format-run-q";
/// Execution queue
pub const EXECUTE_QUEUE: &str = "execute-q";
/// Inbound token queue
pub const INBOUND_QUEUE: &str = "inbound-q";

/// Execution start
pub const EXECUTION_START: &str = "execution.start";
/// Execution completed
pub const EXECUTION_COMPLETED: &str = "execution.completed";
/// Execution failed
pub const EXECUTION_ERROR: &str = "execution.error";
/// Execution discarded
pub const EXECUTION_DISCARD: &str = "execution.discard";

/// Format start requests
pub const FORMAT_START: &str = "run.format.start";

/// Flow take
pub const FLOW_TAKE: &str = "flow.take";
/// Flow discard
pub const FLOW_DISCARD: &str = "flow.discard";
/// Discard stopped at a revisited target
pub const FLOW_LOOPED: &str = "flow.looped";
/// Structural walk continues
pub const FLOW_SHAKE: &str = "flow.shake";
/// Structural walk found a cycle
pub const FLOW_SHAKE_LOOP: &str = "flow.shake.loop";

/// Association take
pub const ASSOCIATION_TAKE: &str = "association.take";
/// Association complete
pub const ASSOCIATION_COMPLETE: &str = "association.complete";

/// Steps of a run, each a message on the run queue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStep {
    /// `run.enter`
    Enter,
    /// `run.start`
    Start,
    /// `run.execute`
    Execute,
    /// `run.end`
    End,
    /// `run.discard`
    Discard,
    /// `run.error`
    Error,
    /// `run.leave`
    Leave,
}

impl RunStep {
    /// Routing key on the run exchange
    pub fn routing_key(&self) -> &'static str {
        match self {
            RunStep::Enter => "run.enter",
            RunStep::Start => "run.start",
            RunStep::Execute => "run.execute",
            RunStep::End => "run.end",
            RunStep::Discard => "run.discard",
            RunStep::Error => "run.error",
            RunStep::Leave => "run.leave",
        }
    }

    /// Parse a run routing key
    pub fn from_routing_key(routing_key: &str) -> Option<Self> {
        let step = match routing_key {
            "run.enter" => RunStep::Enter,
            "run.start" => RunStep::Start,
            "run.execute" => RunStep::Execute,
            "run.end" => RunStep::End,
            "run.discard" => RunStep::Discard,
            "run.error" => RunStep::Error,
            "run.leave" => RunStep::Leave,
            _ => return None,
        };
        Some(step)
    }
}

/// Routing key of an activity event, e.g. `activity.end`
pub fn activity_event(name: &str) -> String {
    format!("activity.{}", name)
}

/// Api routing key addressed to an execution
pub fn api_routing_key(action: &str, execution_id: &str) -> String {
    format!("activity.{}.{}", action, execution_id)
}

/// Split an api routing key into action and execution id
pub fn parse_api_routing_key(routing_key: &str) -> Option<(&str, &str)> {
    let rest = routing_key.strip_prefix("activity.")?;
    let (action, execution_id) = rest.split_once('.')?;
    if action.is_empty() || execution_id.is_empty() {
        return None;
    }
    Some((action, execution_id))
}

/// Event pattern for a listener name; bare names are prefixed with `activity.`
pub fn event_pattern(name: &str) -> String {
    if name.starts_with("activity.") || name.starts_with("flow.") || name == "#" {
        name.to_string()
    } else {
        activity_event(name)
    }
}
