//! Run step handlers
//!
//! A take run moves through `run.enter`, `run.start`, `run.execute`,
//! `run.end` and `run.leave`; a discard run goes from enter straight to
//! `run.discard` and leave. Each handler publishes the next step before
//! acknowledging its own message. Redelivered steps skip their events.

use std::sync::Arc;

use parking_lot::Mutex;
use runnel_broker::{BrokerResult, ConsumeOptions, Content, Message};
use serde_json::{json, Value};
use tracing::{debug, error, trace, warn};

use crate::application::activity::{
    string_list, Activity, API_CONSUMER, EXECUTION_CONSUMER, FORMAT_CONSUMER,
};
use crate::application::behaviour::OutboundDecision;
use crate::application::formatting::Formatting;
use crate::application::multi_instance::iteration_index;
use crate::domain::events::{parse_api_routing_key, RunStep, FORMAT_QUEUE, RUN_QUEUE};
use crate::domain::flow::SequenceFlow;
use crate::error::{EngineError, EngineResult};
use crate::types::{ActivityStatus, TokenAction};

struct Evaluation {
    remaining: usize,
    results: Vec<Option<EngineResult<bool>>>,
    deferred: bool,
}

fn same_delivery(a: &Message, b: &Message) -> bool {
    a.fields.delivery_tag == b.fields.delivery_tag && a.fields.queue == b.fields.queue
}

fn flag(message: &Message, key: &str) -> bool {
    message.get(key).and_then(Value::as_bool).unwrap_or(false)
}

impl Activity {
    /// True while the message is the held step of a run that was not stopped
    pub(crate) fn is_current(&self, message: &Message) -> bool {
        self.with_state(|state| {
            !state.stopped
                && state
                    .run_message
                    .as_ref()
                    .map_or(false, |held| same_delivery(held, message))
        })
    }

    /// Acknowledge a run step, forgetting it as the held step
    pub(crate) fn ack_run(&self, message: &Message) -> BrokerResult<()> {
        self.with_state(|state| {
            if state.run_message.as_ref().map_or(false, |held| same_delivery(held, message)) {
                state.run_message = None;
            }
        });
        self.broker().ack(message)
    }

    fn set_status(&self, status: ActivityStatus) {
        self.with_state(|state| state.status = Some(status));
    }

    pub(crate) fn on_run_message(&self, message: &Message) -> BrokerResult<()> {
        let Some(step) = RunStep::from_routing_key(message.routing_key()) else {
            warn!(activity = %self.id(), routing_key = %message.routing_key(), "unknown run message");
            return self.broker().ack(message);
        };
        self.with_state(|state| state.run_message = Some(message.clone()));
        trace!(
            activity = %self.id(),
            routing_key = %message.routing_key(),
            redelivered = message.redelivered(),
            "run step"
        );

        match step {
            RunStep::Enter => self.on_enter(message),
            RunStep::Start => self.on_start(message),
            RunStep::Execute => {
                self.set_status(ActivityStatus::Executing);
                self.begin_execution(message)
            }
            RunStep::End => self.on_end(message),
            RunStep::Discard => self.on_discard(message),
            RunStep::Error => self.on_error(message),
            RunStep::Leave => self.on_leave(message),
        }
    }

    fn on_enter(&self, message: &Message) -> BrokerResult<()> {
        self.set_status(ActivityStatus::Entered);
        self.with_state(|state| {
            if state.execution_id.is_none() {
                state.execution_id = message.get_str("executionId").map(str::to_string);
            }
        });
        self.subscribe_api()?;
        self.activate_extensions(message);

        if !message.redelivered() {
            self.broker().purge_queue(FORMAT_QUEUE)?;
            self.publish_event("enter", message.content.clone(), false)?;
            if !self.is_current(message) {
                return Ok(());
            }
        }

        let next = if flag(message, "discard") {
            RunStep::Discard
        } else {
            RunStep::Start
        };
        self.publish_run(next, message.content.clone())?;
        self.ack_run(message)
    }

    fn on_start(&self, message: &Message) -> BrokerResult<()> {
        self.set_status(ActivityStatus::Started);
        if !message.redelivered() {
            self.publish_event("start", message.content.clone(), false)?;
            if !self.is_current(message) {
                return Ok(());
            }
        }

        if self.broker().message_count(FORMAT_QUEUE) == 0 {
            self.publish_run(RunStep::Execute, message.content.clone())?;
            return self.ack_run(message);
        }

        debug!(activity = %self.id(), "formatting");
        self.with_state(|state| {
            state.status = Some(ActivityStatus::Formatting);
            state.formatting = Some(Formatting::new(message.content.clone()));
        });
        self.broker().consume(
            FORMAT_QUEUE,
            self.weak_handler(Activity::on_format_message),
            ConsumeOptions::default()
                .with_prefetch(self.settings().execution_prefetch)
                .with_tag(FORMAT_CONSUMER),
        )?;
        Ok(())
    }

    fn on_format_message(&self, message: &Message) -> BrokerResult<()> {
        let done = self.with_state(|state| state.formatting.as_mut().map(|f| f.on_message(message)));
        match done {
            Some(true) => self.finish_formatting(),
            Some(false) => {
                trace!(activity = %self.id(), routing_key = %message.routing_key(), "format pending");
                Ok(())
            }
            None => {
                warn!(activity = %self.id(), routing_key = %message.routing_key(), "format message outside of formatting");
                self.broker().ack(message)
            }
        }
    }

    fn finish_formatting(&self) -> BrokerResult<()> {
        let (formatting, run_message) = self.with_state(|state| {
            if state.formatting.is_some() {
                state.status = Some(ActivityStatus::Started);
            }
            (state.formatting.take(), state.run_message.clone())
        });
        let Some(formatting) = formatting else {
            return Ok(());
        };

        let (content, held) = formatting.finish();
        for message in &held {
            self.broker().ack(message)?;
        }
        self.broker().cancel(FORMAT_CONSUMER)?;

        let Some(run_message) = run_message else {
            return Ok(());
        };
        debug!(activity = %self.id(), "formatted");
        self.publish_run(RunStep::Execute, content)?;
        self.ack_run(&run_message)
    }

    fn on_end(&self, message: &Message) -> BrokerResult<()> {
        self.set_status(ActivityStatus::End);
        if !message.redelivered() {
            self.publish_event("end", message.content.clone(), false)?;
            if !self.is_current(message) {
                return Ok(());
            }
        }
        self.resolve_outbound(message)
    }

    /// Decide take or discard for every outbound flow
    ///
    /// An explicit `outbound` list on the message wins; otherwise flow
    /// conditions are evaluated and the default flow is taken only when no
    /// other flow was.
    fn resolve_outbound(&self, message: &Message) -> BrokerResult<()> {
        let flows: Vec<SequenceFlow> = self.outbound().to_vec();

        if let Some(explicit) = message.get("outbound") {
            let decisions: Vec<OutboundDecision> = match serde_json::from_value(explicit.clone()) {
                Ok(decisions) => decisions,
                Err(err) => return self.fail_outbound(message, err.into()),
            };
            let resolved = flows
                .iter()
                .map(|flow| {
                    let action = decisions
                        .iter()
                        .rev()
                        .find(|d| d.id == flow.id())
                        .map_or(TokenAction::Discard, |d| d.action);
                    (flow.clone(), action)
                })
                .collect();
            return self.complete_outbound(message, resolved);
        }

        if flows.is_empty() {
            return self.complete_outbound(message, Vec::new());
        }

        let evaluation = Arc::new(Mutex::new(Evaluation {
            remaining: flows.len(),
            results: (0..flows.len()).map(|_| None).collect(),
            deferred: false,
        }));

        for (index, flow) in flows.iter().enumerate() {
            let evaluation = evaluation.clone();
            let weak = Arc::downgrade(&self.inner);
            let owned = message.clone();
            let all_flows = flows.clone();
            flow.evaluate(
                message,
                Box::new(move |result| {
                    let finished = {
                        let mut state = evaluation.lock();
                        state.results[index] = Some(result);
                        state.remaining -= 1;
                        (state.remaining == 0 && state.deferred).then(|| std::mem::take(&mut state.results))
                    };
                    let (Some(results), Some(inner)) = (finished, weak.upgrade()) else {
                        return;
                    };
                    let activity = Activity { inner };
                    if let Err(err) = activity.on_outbound_evaluated(&owned, &all_flows, results) {
                        error!(activity = %activity.id(), error = %err, "outbound resolution failed");
                    }
                }),
            );
        }

        let finished = {
            let mut state = evaluation.lock();
            state.deferred = true;
            (state.remaining == 0).then(|| std::mem::take(&mut state.results))
        };
        match finished {
            Some(results) => self.on_outbound_evaluated(message, &flows, results),
            None => {
                debug!(activity = %self.id(), "waiting for flow evaluation");
                Ok(())
            }
        }
    }

    fn on_outbound_evaluated(
        &self,
        message: &Message,
        flows: &[SequenceFlow],
        results: Vec<Option<EngineResult<bool>>>,
    ) -> BrokerResult<()> {
        if let Some(err) = results.iter().find_map(|r| match r {
            Some(Err(err)) => Some(err.clone()),
            _ => None,
        }) {
            return self.fail_outbound(message, err);
        }

        let passed = |result: &Option<EngineResult<bool>>| matches!(result, Some(Ok(true)));
        let conditional_taken = flows
            .iter()
            .zip(&results)
            .any(|(flow, result)| !flow.is_default() && passed(result));

        let resolved = flows
            .iter()
            .zip(&results)
            .map(|(flow, result)| {
                let take = if flow.is_default() {
                    !conditional_taken
                } else {
                    passed(result)
                };
                let action = if take { TokenAction::Take } else { TokenAction::Discard };
                (flow.clone(), action)
            })
            .collect();
        self.complete_outbound(message, resolved)
    }

    fn fail_outbound(&self, message: &Message, err: EngineError) -> BrokerResult<()> {
        if !self.is_current(message) {
            return Ok(());
        }
        warn!(activity = %self.id(), error = %err, "outbound evaluation failed");
        let mut content = message.content.clone();
        content.insert("error".to_string(), err.to_content());
        self.publish_run(RunStep::Error, content)?;
        self.ack_run(message)
    }

    fn complete_outbound(&self, message: &Message, resolved: Vec<(SequenceFlow, TokenAction)>) -> BrokerResult<()> {
        if !self.is_current(message) {
            return Ok(());
        }

        let source = self.flow_content(message);
        for (flow, action) in &resolved {
            match action {
                TokenAction::Take => flow.take(source.clone())?,
                TokenAction::Discard => flow.discard(self.discard_content(message))?,
            }
        }
        for association in &self.inner.outbound_associations {
            association.take(source.clone())?;
        }

        let decisions: Vec<Value> = resolved
            .iter()
            .map(|(flow, action)| json!({ "id": flow.id(), "action": action.as_str() }))
            .collect();
        debug!(activity = %self.id(), outbound = ?decisions, "outbound resolved");

        let mut content = message.content.clone();
        content.insert("outbound".to_string(), Value::Array(decisions));
        self.publish_run(RunStep::Leave, content)?;
        self.ack_run(message)
    }

    fn flow_content(&self, message: &Message) -> Content {
        let mut content = Content::new();
        if let Some(execution_id) = message.get("executionId") {
            content.insert("sourceExecutionId".to_string(), execution_id.clone());
        }
        content
    }

    fn discard_content(&self, message: &Message) -> Content {
        let mut content = self.flow_content(message);
        content.insert(
            "discardSequence".to_string(),
            json!(string_list(message.get("discardSequence"))),
        );
        content
    }

    fn discard_outbound(&self, message: &Message) -> BrokerResult<()> {
        for flow in self.outbound() {
            flow.discard(self.discard_content(message))?;
        }
        Ok(())
    }

    fn on_discard(&self, message: &Message) -> BrokerResult<()> {
        self.set_status(ActivityStatus::Discard);
        if !message.redelivered() {
            self.publish_event("discard", message.content.clone(), false)?;
            if !self.is_current(message) {
                return Ok(());
            }
        }
        self.discard_outbound(message)?;
        self.leave_discarded(message)
    }

    fn on_error(&self, message: &Message) -> BrokerResult<()> {
        self.set_status(ActivityStatus::Error);
        if !message.redelivered() {
            // nobody listening on activity.error turns into an unhandled error
            self.publish_event("error", message.content.clone(), true)?;
            if !self.is_current(message) {
                return Ok(());
            }
        }
        debug!(activity = %self.id(), "error handled");
        self.discard_outbound(message)?;
        self.leave_discarded(message)
    }

    fn leave_discarded(&self, message: &Message) -> BrokerResult<()> {
        let mut content = message.content.clone();
        content.insert("discarded".to_string(), json!(true));
        self.publish_run(RunStep::Leave, content)?;
        self.ack_run(message)
    }

    fn on_leave(&self, message: &Message) -> BrokerResult<()> {
        let redelivered = message.redelivered();
        let discarded = flag(message, "discarded");
        let counters = self.with_state(|state| {
            if !redelivered {
                if discarded {
                    state.counters.discarded += 1;
                } else {
                    state.counters.taken += 1;
                }
            }
            state.status = None;
            state.formatting = None;
            state.execution = None;
            state.counters
        });

        self.deactivate_extensions(message);
        for tag in [API_CONSUMER, EXECUTION_CONSUMER, FORMAT_CONSUMER] {
            self.broker().cancel(tag)?;
        }

        if !redelivered {
            let mut content = message.content.clone();
            content.insert("counters".to_string(), json!(counters));
            self.publish_event("leave", content, false)?;
        }
        if self.is_stopped() {
            return Ok(());
        }
        self.ack_run(message)?;

        if !self.settings().step {
            self.run_from_inbound()?;
        }
        Ok(())
    }

    pub(crate) fn on_api_message(&self, message: &Message) -> BrokerResult<()> {
        let Some((action, execution_id)) = parse_api_routing_key(message.routing_key()) else {
            return Ok(());
        };
        let Some(root) = self.execution_id() else {
            return Ok(());
        };
        let is_root = execution_id == root;
        if !is_root && iteration_index(&root, execution_id).is_none() {
            trace!(activity = %self.id(), execution_id, "api message for another execution");
            return Ok(());
        }

        match action {
            "discard" if is_root => self.discard_run(),
            "discard" => self.discard_execution(execution_id),
            "stop" if is_root => {
                self.stop()?;
                Ok(())
            }
            _ => {
                trace!(activity = %self.id(), action, execution_id, "api message left to the behaviour");
                Ok(())
            }
        }
    }

    /// Discard the current run from whatever step it is in
    fn discard_run(&self) -> BrokerResult<()> {
        match self.status() {
            Some(ActivityStatus::Executing) => {
                let root = self.execution_id().unwrap_or_default();
                self.discard_execution(&root)
            }
            Some(ActivityStatus::Entered | ActivityStatus::Started | ActivityStatus::Formatting) => {
                let (run_message, formatting) =
                    self.with_state(|state| (state.run_message.take(), state.formatting.take()));
                if let Some(formatting) = formatting {
                    let (_, held) = formatting.finish();
                    for message in &held {
                        self.broker().ack(message)?;
                    }
                    self.broker().cancel(FORMAT_CONSUMER)?;
                }

                let queued = self.broker().peek(RUN_QUEUE);
                let mut content = run_message
                    .as_ref()
                    .or(queued.as_ref())
                    .map(|m| m.content.clone())
                    .unwrap_or_else(|| self.state_content());
                content.insert("discard".to_string(), json!(true));

                self.broker().purge_queue(RUN_QUEUE)?;
                if let Some(run_message) = &run_message {
                    self.broker().ack(run_message)?;
                }
                debug!(activity = %self.id(), "discard run");
                self.publish_run(RunStep::Discard, content)
            }
            status => {
                trace!(activity = %self.id(), status = ?status, "discard ignored");
                Ok(())
            }
        }
    }
}
