//! Execution phase: `execute-q` handling between `run.execute` and the end of a run
//!
//! Every `execution.start` stays unacknowledged until the execution
//! completes, fails or is discarded. On resume the held starts come back
//! redelivered and are handed to the behaviour again once the queue drained.

use runnel_broker::{BrokerResult, ConsumeOptions, Content, Message, MessageProperties};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, trace, warn};

use crate::application::activity::{Activity, EXECUTION_CONSUMER};
use crate::application::behaviour::ExecutionHandle;
use crate::application::multi_instance::{iteration_id, iteration_index, MultiInstanceProgress, Progress};
use crate::domain::events::{
    RunStep, EXECUTE_QUEUE, EXECUTION_COMPLETED, EXECUTION_DISCARD, EXECUTION_ERROR,
    EXECUTION_EXCHANGE, EXECUTION_START,
};
use crate::error::EngineError;
use crate::types::{LoopCharacteristics, ParentRef};

/// Persisted execution state of a run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionSnapshot {
    /// Root execution id
    pub execution_id: String,
    /// Root execution settled
    #[serde(default)]
    pub completed: bool,
    /// Behaviour state
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub behaviour: Option<Value>,
    /// Multi-instance progress
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub multi_instance: Option<MultiInstanceProgress>,
}

#[derive(Debug)]
pub(crate) struct ExecutionState {
    pub(crate) execution_id: String,
    starts: Vec<(String, Message)>,
    reexecute: Vec<Message>,
    multi_instance: Option<MultiInstanceProgress>,
    completed: bool,
}

impl ExecutionState {
    pub(crate) fn new(execution_id: &str) -> Self {
        Self {
            execution_id: execution_id.to_string(),
            starts: Vec::new(),
            reexecute: Vec::new(),
            multi_instance: None,
            completed: false,
        }
    }

    pub(crate) fn recovered(snapshot: &ExecutionSnapshot) -> Self {
        Self {
            multi_instance: snapshot.multi_instance.clone(),
            completed: snapshot.completed,
            ..Self::new(&snapshot.execution_id)
        }
    }

    pub(crate) fn snapshot(&self) -> ExecutionSnapshot {
        ExecutionSnapshot {
            execution_id: self.execution_id.clone(),
            completed: self.completed,
            behaviour: None,
            multi_instance: self.multi_instance.clone(),
        }
    }

    /// Forget held starts; the broker releases them on cancel
    pub(crate) fn release(&mut self) {
        self.starts.clear();
        self.reexecute.clear();
    }

    fn hold(&mut self, execution_id: &str, message: &Message) {
        self.starts.retain(|(id, _)| id != execution_id);
        self.starts.push((execution_id.to_string(), message.clone()));
    }

    fn is_held(&self, execution_id: &str) -> bool {
        self.starts.iter().any(|(id, _)| id == execution_id)
    }

    fn root_start(&self) -> Option<&Message> {
        self.starts
            .iter()
            .find(|(id, _)| *id == self.execution_id)
            .map(|(_, message)| message)
    }

    fn take_start(&mut self, execution_id: &str) -> Option<Message> {
        let position = self.starts.iter().position(|(id, _)| id == execution_id)?;
        Some(self.starts.remove(position).1)
    }

    fn drain_starts(&mut self) -> Vec<Message> {
        self.starts.drain(..).map(|(_, message)| message).collect()
    }
}

/// How the root execution settled
#[derive(Debug)]
pub(crate) enum ExecutionOutcome {
    Completed(Content),
    Error(Value),
    Discarded,
}

#[derive(Debug, Clone, Copy)]
enum Settled {
    Completed,
    Error,
    Discarded,
}

impl Activity {
    /// Handle `run.execute`: attach the execution consumer and start or resume the root
    pub(crate) fn begin_execution(&self, message: &Message) -> BrokerResult<()> {
        let root = message
            .get_str("executionId")
            .map(str::to_string)
            .or_else(|| self.execution_id())
            .unwrap_or_default();

        self.with_state(|state| {
            let reuse = message.redelivered()
                && state.execution.as_ref().map_or(false, |e| e.execution_id == root);
            if !reuse {
                state.execution = Some(ExecutionState::new(&root));
            }
        });

        // iteration starts stay held until they settle
        let prefetch = match self.definition().loop_characteristics {
            Some(_) => usize::MAX,
            None => self.settings().execution_prefetch,
        };
        self.broker().consume(
            EXECUTE_QUEUE,
            self.weak_handler(Activity::on_execution_message),
            ConsumeOptions::default()
                .with_prefetch(prefetch)
                .with_tag(EXECUTION_CONSUMER),
        )?;

        if !message.redelivered() {
            return self.publish_root_start(message, &root);
        }
        if !self.is_current(message) {
            return Ok(());
        }

        let (pending, held) = self.with_state(|state| match state.execution.as_mut() {
            Some(execution) => (std::mem::take(&mut execution.reexecute), execution.starts.len()),
            None => (Vec::new(), 0),
        });
        if held == 0 {
            debug!(activity = %self.id(), execution_id = %root, "no pending execution, starting over");
            return self.publish_root_start(message, &root);
        }

        debug!(activity = %self.id(), execution_id = %root, resumed = pending.len(), "resume execution");
        for start in pending {
            let execution_id = start.get_str("executionId").unwrap_or_default().to_string();
            let still_held = self.with_state(|state| {
                state.execution.as_ref().map_or(false, |e| e.is_held(&execution_id))
            });
            if still_held {
                self.dispatch_start(&start)?;
            }
        }
        Ok(())
    }

    fn publish_root_start(&self, message: &Message, root: &str) -> BrokerResult<()> {
        let mut content = message.content.clone();
        content.insert("executionId".to_string(), json!(root));
        content.insert("isRootScope".to_string(), json!(true));
        self.broker().publish(
            EXECUTION_EXCHANGE,
            EXECUTION_START,
            content,
            MessageProperties::default().with_type(EXECUTION_START),
        )
    }

    pub(crate) fn on_execution_message(&self, message: &Message) -> BrokerResult<()> {
        match message.routing_key() {
            EXECUTION_START => self.on_execution_start(message),
            EXECUTION_COMPLETED => self.on_execution_settled(message, Settled::Completed),
            EXECUTION_ERROR => self.on_execution_settled(message, Settled::Error),
            EXECUTION_DISCARD => self.on_execution_settled(message, Settled::Discarded),
            routing_key => {
                warn!(activity = %self.id(), routing_key, "unexpected execution message");
                self.broker().ack(message)
            }
        }
    }

    fn on_execution_start(&self, message: &Message) -> BrokerResult<()> {
        let Some(execution_id) = message.get_str("executionId").map(str::to_string) else {
            warn!(activity = %self.id(), "execution start without execution id");
            return self.broker().ack(message);
        };

        let tracked = self.with_state(|state| {
            let execution = state.execution.as_mut()?;
            execution.hold(&execution_id, message);
            if message.redelivered() {
                execution.reexecute.push(message.clone());
                return Some(false);
            }
            Some(true)
        });

        match tracked {
            Some(true) => self.dispatch_start(message),
            Some(false) => {
                trace!(activity = %self.id(), %execution_id, "redelivered start deferred");
                Ok(())
            }
            None => {
                warn!(activity = %self.id(), %execution_id, "execution start outside of a run");
                self.broker().ack(message)
            }
        }
    }

    fn dispatch_start(&self, message: &Message) -> BrokerResult<()> {
        let execution_id = message.get_str("executionId").unwrap_or_default().to_string();
        let Some(root) = self.with_state(|state| state.execution.as_ref().map(|e| e.execution_id.clone())) else {
            return Ok(());
        };

        if execution_id == root {
            if let Some(characteristics) = &self.definition().loop_characteristics {
                return self.start_multi_instance(message, characteristics);
            }
        }

        let handle = ExecutionHandle::new(self.id(), &execution_id, &root, self.broker().clone());
        let Some(behaviour) = self.behaviour() else {
            handle.error(EngineError::ConfigurationError(format!("Activity {} has no behaviour", self.id())))?;
            return Ok(());
        };

        trace!(activity = %self.id(), %execution_id, redelivered = message.redelivered(), "execute");
        if let Err(err) = behaviour.execute(message, handle.clone()) {
            debug!(activity = %self.id(), %execution_id, error = %err, "behaviour failed to execute");
            handle.error(err)?;
        }
        Ok(())
    }

    fn start_multi_instance(&self, message: &Message, characteristics: &LoopCharacteristics) -> BrokerResult<()> {
        let resumed = self.with_state(|state| {
            state
                .execution
                .as_ref()
                .map_or(false, |e| e.multi_instance.is_some())
        });
        if resumed {
            trace!(activity = %self.id(), "multi-instance resumed, iterations continue on their own");
            return Ok(());
        }

        match MultiInstanceProgress::begin(characteristics, &message.content, self.environment()) {
            Ok((progress, step)) => {
                self.with_state(|state| {
                    if let Some(execution) = state.execution.as_mut() {
                        execution.multi_instance = Some(progress);
                    }
                });
                self.apply_progress(step)
            }
            Err(err) => {
                let root = message.get_str("executionId").unwrap_or_default();
                ExecutionHandle::new(self.id(), root, root, self.broker().clone()).error(err)?;
                Ok(())
            }
        }
    }

    fn iteration_parent(&self, root: &str) -> ParentRef {
        match &self.definition().parent {
            Some(parent) => parent.child(self.id(), self.kind(), root),
            None => ParentRef::new(self.id(), self.kind(), Some(root.to_string())),
        }
    }

    fn apply_progress(&self, step: Progress) -> BrokerResult<()> {
        match step {
            Progress::Wait => Ok(()),
            Progress::Start(indices) => {
                let Some(characteristics) = self.definition().loop_characteristics.clone() else {
                    return Ok(());
                };
                let prepared = self.with_state(|state| {
                    let execution = state.execution.as_ref()?;
                    let root_content = execution.root_start()?.content.clone();
                    let progress = execution.multi_instance.clone()?;
                    Some((execution.execution_id.clone(), root_content, progress))
                });
                let Some((root, root_content, progress)) = prepared else {
                    warn!(activity = %self.id(), "iterations requested without a root execution");
                    return Ok(());
                };

                let parent = self.iteration_parent(&root);
                for index in indices {
                    let content = progress.iteration_content(index, &root_content, &characteristics, &parent);
                    trace!(activity = %self.id(), index, "start iteration");
                    self.broker().publish(
                        EXECUTION_EXCHANGE,
                        EXECUTION_START,
                        content,
                        MessageProperties::default().with_type(EXECUTION_START),
                    )?;
                }
                Ok(())
            }
            Progress::Complete { output, halted } => {
                let (root, halted_starts) = self.with_state(|state| match state.execution.as_mut() {
                    Some(execution) => {
                        let root = execution.execution_id.clone();
                        let starts: Vec<Message> = halted
                            .iter()
                            .filter_map(|index| execution.take_start(&iteration_id(&root, *index)))
                            .collect();
                        (root, starts)
                    }
                    None => (String::new(), Vec::new()),
                });
                for start in &halted_starts {
                    self.broker().ack(start)?;
                }
                for index in &halted {
                    self.api(&iteration_id(&root, *index), Content::new()).discard()?;
                }

                let mut content = Content::new();
                content.insert("output".to_string(), output);
                self.finish_execution(ExecutionOutcome::Completed(content))
            }
        }
    }

    fn on_execution_settled(&self, message: &Message, settled: Settled) -> BrokerResult<()> {
        self.broker().ack(message)?;
        let Some(execution_id) = message.get_str("executionId").map(str::to_string) else {
            warn!(activity = %self.id(), routing_key = %message.routing_key(), "execution message without execution id");
            return Ok(());
        };

        let found = self.with_state(|state| {
            let execution = state.execution.as_mut()?;
            let start = execution.take_start(&execution_id)?;
            Some((execution.execution_id.clone(), start))
        });
        let Some((root, start)) = found else {
            warn!(
                activity = %self.id(),
                %execution_id,
                routing_key = %message.routing_key(),
                "execution message for unknown execution"
            );
            return Ok(());
        };
        self.broker().ack(&start)?;

        let error = || message.get("error").cloned().unwrap_or(Value::Null);
        if execution_id == root {
            let outcome = match settled {
                Settled::Completed => ExecutionOutcome::Completed(message.content.clone()),
                Settled::Error => ExecutionOutcome::Error(error()),
                Settled::Discarded => ExecutionOutcome::Discarded,
            };
            return self.finish_execution(outcome);
        }

        let Some(index) = iteration_index(&root, &execution_id) else {
            warn!(activity = %self.id(), %execution_id, "unknown sub execution");
            return Ok(());
        };
        let Some(characteristics) = self.definition().loop_characteristics.clone() else {
            return Ok(());
        };

        match settled {
            Settled::Error => {
                debug!(activity = %self.id(), index, "iteration failed");
                self.finish_execution(ExecutionOutcome::Error(error()))
            }
            Settled::Completed => {
                let output = message.get("output").cloned().unwrap_or(Value::Null);
                let environment = self.environment().clone();
                let step = self.with_state(|state| {
                    let progress = state.execution.as_mut()?.multi_instance.as_mut()?;
                    Some(progress.on_completed(index, output, &start.content, &characteristics, &environment))
                });
                match step {
                    Some(Ok(step)) => self.apply_progress(step),
                    Some(Err(err)) => self.finish_execution(ExecutionOutcome::Error(err.to_content())),
                    None => Ok(()),
                }
            }
            Settled::Discarded => {
                let step = self.with_state(|state| {
                    let progress = state.execution.as_mut()?.multi_instance.as_mut()?;
                    Some(progress.on_discarded(index))
                });
                match step {
                    Some(step) => self.apply_progress(step),
                    None => Ok(()),
                }
            }
        }
    }

    /// Settle the root: acknowledge leftovers and continue the run
    pub(crate) fn finish_execution(&self, outcome: ExecutionOutcome) -> BrokerResult<()> {
        let (run_message, leftovers) = self.with_state(|state| {
            let leftovers = match state.execution.as_mut() {
                Some(execution) => {
                    execution.completed = true;
                    execution.drain_starts()
                }
                None => Vec::new(),
            };
            (state.run_message.clone(), leftovers)
        });
        for start in &leftovers {
            self.broker().ack(start)?;
        }

        let Some(run_message) = run_message.filter(|m| m.routing_key() == RunStep::Execute.routing_key()) else {
            warn!(activity = %self.id(), "execution settled outside of run.execute");
            return Ok(());
        };

        let mut content = run_message.content.clone();
        let step = match outcome {
            ExecutionOutcome::Completed(completion) => {
                for key in ["output", "outbound"] {
                    if let Some(value) = completion.get(key) {
                        content.insert(key.to_string(), value.clone());
                    }
                }
                RunStep::End
            }
            ExecutionOutcome::Error(error) => {
                content.insert("error".to_string(), error);
                RunStep::Error
            }
            ExecutionOutcome::Discarded => RunStep::Discard,
        };

        debug!(activity = %self.id(), next = step.routing_key(), "execution settled");
        self.publish_run(step, content)?;
        self.ack_run(&run_message)
    }

    /// Discard a held execution through its handle
    pub(crate) fn discard_execution(&self, execution_id: &str) -> BrokerResult<()> {
        let root = self.with_state(|state| {
            state
                .execution
                .as_ref()
                .filter(|e| e.is_held(execution_id))
                .map(|e| e.execution_id.clone())
        });
        let Some(root) = root else {
            trace!(activity = %self.id(), execution_id, "discard of settled execution ignored");
            return Ok(());
        };
        ExecutionHandle::new(self.id(), execution_id, &root, self.broker().clone()).discard()?;
        Ok(())
    }
}
