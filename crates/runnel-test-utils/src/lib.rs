//! Testing utilities for the Runnel engine.
//!
//! Ready-made behaviours, activity and graph builders, an event recorder and
//! assertion helpers shared by the core and integration test suites.

pub mod assertions;
pub mod behaviours;
pub mod builders;
pub mod recorder;

/// Re-export commonly used types for convenience
pub use mockall;

pub use assertions::AssertionError;
pub use behaviours::{
    CompleteBehaviour, DecisionBehaviour, FailingBehaviour, ManualBehaviour, MockBehaviour, WaitingBehaviour,
};
pub use builders::{activity, environment, init_test_logging, step_environment, task, TestActivity};
pub use recorder::EventRecorder;
