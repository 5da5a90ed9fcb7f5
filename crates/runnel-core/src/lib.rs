//!
//! Runnel Core - activity execution engine
//!
//! An activity is one node of a process. It is driven through its run
//! lifecycle by messages on a private broker, receives tokens from inbound
//! sequence flows and hands its outcome to outbound flows. Behaviours plug
//! in the actual work; multi-instance activities run the behaviour once per
//! iteration. Activity state can be captured at any point and recovered in
//! a fresh instance.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

/// Activities, behaviours and the run lifecycle
pub mod application;

/// Engine settings
pub mod config;

/// Counters, flows and event names
pub mod domain;

/// Expressions, scripts and the shared environment
pub mod environment;

/// Error types
pub mod error;

/// Logging setup
pub mod logging;

/// Definitions and shared value types
pub mod types;

pub use application::activity::{Activity, ActivityState, EventHandler, EventWait, STATE_VERSION};
pub use application::api::ActivityApi;
pub use application::behaviour::{
    shared_behaviour, AsyncBehaviour, Behaviour, BehaviourFactory, ExecutionHandle, OutboundDecision,
    TokioBehaviour,
};
pub use application::context::{ActivityContext, Extension, ExtensionFactory, ProcessGraph, ProcessGraphBuilder};
pub use application::execution::ExecutionSnapshot;
pub use application::inbound::InboundToken;
pub use application::multi_instance::MultiInstanceProgress;
pub use config::EngineSettings;
pub use domain::counters::{ActivityCounters, AssociationCounters, FlowCounters};
pub use domain::flow::{Association, FlowCondition, FlowDefinition, SequenceFlow};
pub use environment::{
    Environment, ExpressionResolver, JmesPathResolver, Logger, MemoryScriptRegistry, Script, ScriptRegistry,
};
pub use error::{EngineError, EngineResult};
pub use logging::{init_logging, LoggingConfig};
pub use types::{
    ActivityDefinition, ActivityStatus, Cardinality, LoopCharacteristics, ParentRef, TokenAction,
};

pub use runnel_broker::{content_from, Broker, Content, Message};
