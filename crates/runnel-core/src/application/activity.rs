//! The activity: one process node driven through its run lifecycle
//!
//! Every activity owns a private broker. Run steps travel as messages on the
//! `run` exchange and are consumed one at a time from `run-q`; the message of
//! the current step stays unacknowledged until the step finished, which is
//! what makes stop, resume and recover work. Behaviours answer on the
//! `execution` exchange, format requests arrive on `format`, api commands on
//! `api` and everything observable is published on `event`.
//!
//! Handlers registered on brokers only hold a weak reference to the activity,
//! and the run state lock is never held while publishing.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Weak};
use std::task::{Context as TaskContext, Poll};

use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use runnel_broker::{
    Broker, BrokerError, BrokerResult, BrokerSnapshot, ConsumeOptions, Content, ExchangeOptions,
    Message, MessageHandler, MessageProperties, QueueOptions, SubscribeOptions,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::oneshot;
use tracing::{debug, trace};
use uuid::Uuid;

use crate::application::api::ActivityApi;
use crate::application::behaviour::{Behaviour, BehaviourFactory};
use crate::application::context::{ActivityContext, Extension};
use crate::application::execution::{ExecutionSnapshot, ExecutionState};
use crate::application::formatting::Formatting;
use crate::application::inbound::{merged_discard_sequence, InboundToken, InboundTracker};
use crate::config::EngineSettings;
use crate::domain::counters::ActivityCounters;
use crate::domain::events::{
    activity_event, event_pattern, RunStep, API_EXCHANGE, EVENT_EXCHANGE, EXECUTE_QUEUE,
    EXECUTION_EXCHANGE, FORMAT_EXCHANGE, FORMAT_QUEUE, INBOUND_QUEUE, RUN_EXCHANGE, RUN_QUEUE,
};
use crate::domain::flow::{Association, SequenceFlow};
use crate::environment::{Environment, Logger};
use crate::error::{from_broker, EngineError, EngineResult};
use crate::types::{ActivityDefinition, ActivityStatus, TokenAction};

pub(crate) const RUN_CONSUMER: &str = "_activity-run";
pub(crate) const FORMAT_CONSUMER: &str = "_activity-format";
pub(crate) const EXECUTION_CONSUMER: &str = "_activity-execution";
pub(crate) const INBOUND_CONSUMER: &str = "_activity-inbound";
pub(crate) const API_CONSUMER: &str = "_activity-api";
const API_QUEUE: &str = "_activity-api-q";

const INTERNAL_CONSUMERS: [&str; 5] = [
    RUN_CONSUMER,
    FORMAT_CONSUMER,
    EXECUTION_CONSUMER,
    INBOUND_CONSUMER,
    API_CONSUMER,
];

/// Schema version of [`ActivityState`]
pub const STATE_VERSION: u32 = 1;

/// Serializable activity state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivityState {
    /// Schema version
    pub version: u32,
    /// Activity id
    pub id: String,
    /// Activity kind
    #[serde(rename = "type")]
    pub kind: String,
    /// Lifecycle status, absent when idle
    #[serde(default)]
    pub status: Option<ActivityStatus>,
    /// Stopped mid-run
    #[serde(default)]
    pub stopped: bool,
    /// Execution id of the current or last run
    #[serde(default)]
    pub execution_id: Option<String>,
    /// Run counters
    #[serde(default)]
    pub counters: ActivityCounters,
    /// Broker snapshot with pending and unacknowledged messages
    pub router: BrokerSnapshot,
    /// Execution state of the current run
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution: Option<ExecutionSnapshot>,
}

/// Listener callback for activity events
pub type EventHandler = Arc<dyn Fn(&Activity, &Message) -> EngineResult<()> + Send + Sync>;

/// Mutable run state guarded by the activity lock
#[derive(Debug, Default)]
pub(crate) struct RunState {
    pub(crate) status: Option<ActivityStatus>,
    pub(crate) stopped: bool,
    pub(crate) execution_id: Option<String>,
    pub(crate) counters: ActivityCounters,
    /// Unacknowledged message of the current run step
    pub(crate) run_message: Option<Message>,
    pub(crate) inbound: InboundTracker,
    pub(crate) formatting: Option<Formatting>,
    pub(crate) execution: Option<ExecutionState>,
}

pub(crate) struct ActivityInner {
    pub(crate) definition: ActivityDefinition,
    pub(crate) context: Arc<dyn ActivityContext>,
    pub(crate) environment: Arc<Environment>,
    pub(crate) broker: Broker,
    pub(crate) logger: Logger,
    pub(crate) behaviour: OnceCell<Arc<dyn Behaviour>>,
    pub(crate) extension: OnceCell<Option<Arc<dyn Extension>>>,
    pub(crate) inbound_flows: Vec<SequenceFlow>,
    pub(crate) outbound_flows: Vec<SequenceFlow>,
    pub(crate) inbound_associations: Vec<Association>,
    pub(crate) outbound_associations: Vec<Association>,
    pub(crate) state: Mutex<RunState>,
}

/// A process activity
#[derive(Clone)]
pub struct Activity {
    pub(crate) inner: Arc<ActivityInner>,
}

impl fmt::Debug for Activity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Activity")
            .field("id", &self.id())
            .field("type", &self.kind())
            .field("status", &self.status())
            .finish()
    }
}

impl Activity {
    /// Create an activity, wire its inbound flows and attach its consumers
    pub fn new(
        definition: ActivityDefinition,
        context: Arc<dyn ActivityContext>,
        behaviour: BehaviourFactory,
    ) -> EngineResult<Self> {
        let id = definition.id.clone();
        let environment = context.environment();
        let inner = ActivityInner {
            broker: Broker::new(id.clone()),
            logger: environment.logger(id.clone()),
            inbound_flows: context.inbound_sequence_flows(&id),
            outbound_flows: context.outbound_sequence_flows(&id),
            inbound_associations: context.inbound_associations(&id),
            outbound_associations: context.outbound_associations(&id),
            behaviour: OnceCell::new(),
            extension: OnceCell::new(),
            state: Mutex::new(RunState::default()),
            environment,
            context,
            definition,
        };
        let activity = Activity { inner: Arc::new(inner) };

        activity.setup_topology().map_err(|e| activity.lift(e))?;

        let behaviour = behaviour(&activity);
        let _ = activity.inner.behaviour.set(behaviour);
        let extension = activity.inner.context.load_extensions(&activity);
        let _ = activity.inner.extension.set(extension);

        activity.subscribe_inbound().map_err(|e| activity.lift(e))?;
        activity.activate_consumers().map_err(|e| activity.lift(e))?;

        debug!(
            activity = %activity.id(),
            kind = %activity.kind(),
            inbound = activity.inner.inbound_flows.len(),
            outbound = activity.inner.outbound_flows.len(),
            "activity created"
        );
        Ok(activity)
    }

    fn setup_topology(&self) -> BrokerResult<()> {
        let broker = self.broker();
        for exchange in [RUN_EXCHANGE, FORMAT_EXCHANGE, EXECUTION_EXCHANGE, API_EXCHANGE, EVENT_EXCHANGE] {
            broker.assert_exchange(exchange, ExchangeOptions::default());
        }
        for queue in [RUN_QUEUE, FORMAT_QUEUE, EXECUTE_QUEUE, INBOUND_QUEUE] {
            broker.assert_queue(queue, QueueOptions::default());
        }
        broker.bind_queue(RUN_QUEUE, RUN_EXCHANGE, "run.#")?;
        broker.bind_queue(FORMAT_QUEUE, FORMAT_EXCHANGE, "run.#")?;
        broker.bind_queue(EXECUTE_QUEUE, EXECUTION_EXCHANGE, "execution.#")?;
        Ok(())
    }

    fn subscribe_inbound(&self) -> BrokerResult<()> {
        let tag = format!("_inbound-{}", self.id());
        for flow in &self.inner.inbound_flows {
            flow.broker().subscribe(
                EVENT_EXCHANGE,
                "flow.#",
                self.weak_handler(Activity::on_flow_event),
                SubscribeOptions::default().with_tag(tag.clone()),
            )?;
        }
        for association in &self.inner.inbound_associations {
            association.broker().subscribe(
                EVENT_EXCHANGE,
                "association.#",
                self.weak_handler(Activity::on_association_event),
                SubscribeOptions::default().with_tag(tag.clone()),
            )?;
        }
        Ok(())
    }

    /// Activity id
    pub fn id(&self) -> &str {
        &self.inner.definition.id
    }

    /// Activity kind
    pub fn kind(&self) -> &str {
        &self.inner.definition.kind
    }

    /// Display name
    pub fn name(&self) -> Option<&str> {
        self.inner.definition.name.as_deref()
    }

    /// Static definition
    pub fn definition(&self) -> &ActivityDefinition {
        &self.inner.definition
    }

    /// Private broker
    pub fn broker(&self) -> &Broker {
        &self.inner.broker
    }

    /// Shared environment
    pub fn environment(&self) -> &Arc<Environment> {
        &self.inner.environment
    }

    /// Scoped logger
    pub fn logger(&self) -> &Logger {
        &self.inner.logger
    }

    /// Engine settings of the environment
    pub fn settings(&self) -> &EngineSettings {
        self.inner.environment.settings()
    }

    /// Behaviour built for this activity
    pub fn behaviour(&self) -> Option<Arc<dyn Behaviour>> {
        self.inner.behaviour.get().cloned()
    }

    /// Flows targeting the activity
    pub fn inbound(&self) -> &[SequenceFlow] {
        &self.inner.inbound_flows
    }

    /// Flows leaving the activity
    pub fn outbound(&self) -> &[SequenceFlow] {
        &self.inner.outbound_flows
    }

    /// Waits for every inbound flow before running
    pub fn is_join(&self) -> bool {
        self.inner.definition.parallel_join && self.inner.inbound_flows.len() > 1
    }

    /// Current lifecycle status, `None` when idle
    pub fn status(&self) -> Option<ActivityStatus> {
        self.with_state(|state| state.status)
    }

    /// A run is in progress
    pub fn is_running(&self) -> bool {
        self.status().is_some()
    }

    /// Stopped through [`Activity::stop`]
    pub fn is_stopped(&self) -> bool {
        self.with_state(|state| state.stopped)
    }

    /// Execution id of the current or last run
    pub fn execution_id(&self) -> Option<String> {
        self.with_state(|state| state.execution_id.clone())
    }

    /// Run counters
    pub fn counters(&self) -> ActivityCounters {
        self.with_state(|state| state.counters)
    }

    /// Start a run
    pub fn run(&self, content: Content) -> EngineResult<()> {
        self.start_run(content, Vec::new(), TokenAction::Take)
    }

    /// Discard the activity
    ///
    /// An idle activity runs a discard run started with `content` that
    /// discards every outbound flow; a running activity is told to discard
    /// through the api.
    pub fn discard(&self, content: Content) -> EngineResult<()> {
        match self.with_state(|state| (state.status, state.execution_id.clone())) {
            (None, _) => self.start_run(content, Vec::new(), TokenAction::Discard),
            (Some(_), Some(execution_id)) => self.api(&execution_id, Content::new()).send("discard", content),
            (Some(_), None) => Ok(()),
        }
    }

    /// Stop consuming; pending messages stay in the broker for resume or recover
    pub fn stop(&self) -> EngineResult<()> {
        let run_message = self.with_state(|state| {
            if state.stopped {
                return None;
            }
            state.stopped = true;
            state.inbound.clear();
            state.formatting = None;
            if let Some(execution) = state.execution.as_mut() {
                execution.release();
            }
            Some(state.run_message.take())
        });
        let Some(run_message) = run_message else {
            return Ok(());
        };

        for tag in INTERNAL_CONSUMERS {
            self.broker().cancel(tag).map_err(|e| self.lift(e))?;
        }
        // a step pulled by next() has no consumer to release it
        if let (true, Some(step)) = (self.settings().step, &run_message) {
            self.broker().nack(step, true).map_err(|e| self.lift(e))?;
        }

        let content = self.state_content();
        let message = run_message.unwrap_or_else(|| self.synthetic_message("run.stop", &content));
        self.deactivate_extensions(&message);

        debug!(activity = %self.id(), "stopped");
        self.publish_event("stop", content, false).map_err(|e| self.lift(e))
    }

    /// Resume a stopped activity
    pub fn resume(&self) -> EngineResult<()> {
        let status = self.with_state(|state| {
            if state.status.is_some() && !state.stopped {
                return Err(EngineError::ResumeWhileRunning(self.inner.definition.id.clone()));
            }
            state.stopped = false;
            Ok(state.status)
        })?;

        debug!(activity = %self.id(), status = ?status, "resume");
        if status.is_some() {
            self.subscribe_api().map_err(|e| self.lift(e))?;
        }
        self.activate_consumers().map_err(|e| self.lift(e))?;
        if status.is_none() && !self.settings().step {
            self.run_from_inbound()?;
        }
        Ok(())
    }

    /// Restore state captured by [`Activity::get_state`]
    ///
    /// A recovered mid-run activity is left stopped; call
    /// [`Activity::resume`] to continue.
    pub fn recover(&self, state: &ActivityState) -> EngineResult<()> {
        if state.id != self.id() {
            return Err(EngineError::ConfigurationError(format!(
                "State of {} cannot recover activity {}",
                state.id,
                self.id()
            )));
        }
        self.with_state(|current| {
            if current.status.is_some() && !current.stopped {
                return Err(EngineError::RecoverWhileRunning(self.inner.definition.id.clone()));
            }
            Ok(())
        })?;

        for tag in INTERNAL_CONSUMERS {
            self.broker().cancel(tag).map_err(|e| self.lift(e))?;
        }

        let stopped = state.status.is_some();
        self.with_state(|current| {
            current.status = state.status;
            current.stopped = stopped;
            current.execution_id = state.execution_id.clone();
            current.counters = state.counters;
            current.run_message = None;
            current.formatting = None;
            current.inbound.clear();
            current.execution = state.execution.as_ref().map(ExecutionState::recovered);
        });

        self.broker().restore(&state.router).map_err(|e| self.lift(e))?;

        if let (Some(behaviour), Some(behaviour_state)) = (
            self.behaviour(),
            state.execution.as_ref().and_then(|e| e.behaviour.as_ref()),
        ) {
            behaviour.recover(behaviour_state)?;
        }

        debug!(activity = %self.id(), status = ?state.status, "recovered");
        if !stopped {
            self.activate_consumers().map_err(|e| self.lift(e))?;
        }
        Ok(())
    }

    /// Serializable state; `None` for an idle activity when state tracking is disabled
    pub fn get_state(&self) -> Option<ActivityState> {
        let (status, stopped, execution_id, counters, execution) = self.with_state(|state| {
            (
                state.status,
                state.stopped,
                state.execution_id.clone(),
                state.counters,
                state.execution.as_ref().map(ExecutionState::snapshot),
            )
        });
        if self.settings().disable_track_state && status.is_none() {
            return None;
        }

        let behaviour_state = self.behaviour().and_then(|b| b.get_state());
        let execution = match (execution, behaviour_state) {
            (Some(mut snapshot), behaviour) => {
                snapshot.behaviour = behaviour;
                Some(snapshot)
            }
            (None, Some(behaviour)) => Some(ExecutionSnapshot {
                execution_id: execution_id.clone().unwrap_or_default(),
                completed: false,
                behaviour: Some(behaviour),
                multi_instance: None,
            }),
            (None, None) => None,
        };

        Some(ActivityState {
            version: STATE_VERSION,
            id: self.id().to_string(),
            kind: self.kind().to_string(),
            status,
            stopped,
            execution_id,
            counters,
            router: self.broker().snapshot(),
            execution,
        })
    }

    /// Handle the next run message in step mode
    ///
    /// Returns the handled message, or `None` when nothing is ready or a
    /// step is still waiting for its execution or format requests.
    pub fn next(&self) -> EngineResult<Option<Message>> {
        if !self.settings().step {
            return Ok(None);
        }
        let (idle, busy) = self.with_state(|state| (state.status.is_none(), state.run_message.is_some()));
        if busy {
            return Ok(None);
        }
        if idle {
            self.run_from_inbound()?;
        }

        let Some(message) = self.broker().get(RUN_QUEUE).map_err(|e| self.lift(e))? else {
            return Ok(None);
        };
        trace!(activity = %self.id(), routing_key = %message.routing_key(), "step");
        self.on_run_message(&message).map_err(|e| self.lift(e))?;
        Ok(Some(message))
    }

    /// Listen to an activity event; bare names are prefixed with `activity.`
    pub fn on<F>(&self, event: &str, handler: F) -> EngineResult<String>
    where
        F: Fn(&Activity, &Message) -> EngineResult<()> + Send + Sync + 'static,
    {
        self.listen(event, Arc::new(handler), SubscribeOptions::default())
    }

    /// Listen to the next occurrence of an activity event
    pub fn once<F>(&self, event: &str, handler: F) -> EngineResult<String>
    where
        F: Fn(&Activity, &Message) -> EngineResult<()> + Send + Sync + 'static,
    {
        self.listen(event, Arc::new(handler), SubscribeOptions::once())
    }

    /// Remove a listener
    pub fn off(&self, consumer_tag: &str) -> EngineResult<bool> {
        self.broker().cancel(consumer_tag).map_err(|e| self.lift(e))
    }

    fn listen(&self, event: &str, handler: EventHandler, options: SubscribeOptions) -> EngineResult<String> {
        let wrapped = self.weak_handler(move |activity, message| {
            handler(activity, message).map_err(BrokerError::from)
        });
        self.broker()
            .subscribe(EVENT_EXCHANGE, &event_pattern(event), wrapped, options)
            .map_err(|e| self.lift(e))
    }

    /// Future resolving with the next occurrence of an event
    pub fn wait_for(&self, event: &str) -> EngineResult<EventWait> {
        self.wait_for_matching(event, |_| true)
    }

    /// Future resolving with the first occurrence of an event matching a predicate
    pub fn wait_for_matching<P>(&self, event: &str, predicate: P) -> EngineResult<EventWait>
    where
        P: Fn(&Message) -> bool + Send + Sync + 'static,
    {
        let (sender, receiver) = oneshot::channel();
        let sender = Mutex::new(Some(sender));
        let tag = format!("_wait-{}", Uuid::new_v4().simple());
        let own_tag = tag.clone();

        let handler: MessageHandler = Arc::new(move |broker, message| {
            if !predicate(message) {
                return Ok(());
            }
            if let Some(sender) = sender.lock().take() {
                let _ = sender.send(message.clone());
            }
            broker.cancel(&own_tag)?;
            Ok(())
        });

        self.broker()
            .subscribe(
                EVENT_EXCHANGE,
                &event_pattern(event),
                handler,
                SubscribeOptions::default().with_tag(tag),
            )
            .map_err(|e| self.lift(e))?;

        Ok(EventWait {
            event: event.to_string(),
            receiver,
        })
    }

    /// Api bound to the execution of a message, or to the current run
    pub fn get_api(&self, message: Option<&Message>) -> ActivityApi {
        let execution_id = message
            .and_then(|m| m.get_str("executionId").map(str::to_string))
            .or_else(|| self.execution_id())
            .unwrap_or_else(|| self.id().to_string());
        let content = message.map(|m| m.content.clone()).unwrap_or_default();
        self.api(&execution_id, content)
    }

    pub(crate) fn api(&self, execution_id: &str, content: Content) -> ActivityApi {
        ActivityApi::new(self.broker().clone(), self.id(), execution_id, content)
    }

    pub(crate) fn with_state<R>(&self, f: impl FnOnce(&mut RunState) -> R) -> R {
        let mut state = self.inner.state.lock();
        f(&mut state)
    }

    pub(crate) fn lift(&self, err: BrokerError) -> EngineError {
        from_broker(self.id(), err)
    }

    /// Handler holding a weak reference; deliveries after drop are ignored
    pub(crate) fn weak_handler<F>(&self, f: F) -> MessageHandler
    where
        F: Fn(&Activity, &Message) -> BrokerResult<()> + Send + Sync + 'static,
    {
        let weak: Weak<ActivityInner> = Arc::downgrade(&self.inner);
        Arc::new(move |_, message| match weak.upgrade() {
            Some(inner) => f(&Activity { inner }, message),
            None => Ok(()),
        })
    }

    pub(crate) fn activate_consumers(&self) -> BrokerResult<()> {
        if !self.settings().step {
            self.broker().consume(
                RUN_QUEUE,
                self.weak_handler(Activity::on_run_message),
                ConsumeOptions::default().with_tag(RUN_CONSUMER),
            )?;
        }
        self.broker().consume(
            INBOUND_QUEUE,
            self.weak_handler(Activity::on_inbound_message),
            ConsumeOptions::default()
                .with_prefetch(self.settings().inbound_prefetch)
                .with_tag(INBOUND_CONSUMER),
        )?;
        Ok(())
    }

    pub(crate) fn subscribe_api(&self) -> BrokerResult<()> {
        if self.broker().has_consumer(API_CONSUMER) {
            return Ok(());
        }
        let options = SubscribeOptions {
            queue_name: Some(API_QUEUE.to_string()),
            ..SubscribeOptions::default().with_tag(API_CONSUMER)
        };
        self.broker().subscribe(
            API_EXCHANGE,
            "activity.#",
            self.weak_handler(Activity::on_api_message),
            options,
        )?;
        Ok(())
    }

    pub(crate) fn start_run(
        &self,
        mut content: Content,
        tokens: Vec<InboundToken>,
        action: TokenAction,
    ) -> EngineResult<()> {
        let execution_id = format!("{}_{}", self.id(), Uuid::new_v4().simple());
        let was_stopped = self.with_state(|state| {
            if state.status.is_some() {
                return Err(EngineError::AlreadyRunning(self.inner.definition.id.clone()));
            }
            let was_stopped = state.stopped;
            state.status = Some(ActivityStatus::Entered);
            state.stopped = false;
            state.execution_id = Some(execution_id.clone());
            state.execution = None;
            state.formatting = None;
            Ok(was_stopped)
        })?;
        if was_stopped {
            self.activate_consumers().map_err(|e| self.lift(e))?;
        }

        self.stamp(&mut content, &execution_id);
        match action {
            TokenAction::Take => {
                content.remove("discard");
            }
            TokenAction::Discard => {
                let mut sequence = string_list(content.get("discardSequence"));
                for id in merged_discard_sequence(&tokens) {
                    if !sequence.contains(&id) {
                        sequence.push(id);
                    }
                }
                content.insert("discard".to_string(), json!(true));
                content.insert("discardSequence".to_string(), json!(sequence));
            }
        }
        if !tokens.is_empty() {
            content.insert("inbound".to_string(), serde_json::to_value(&tokens)?);
        }

        debug!(activity = %self.id(), %execution_id, action = %action, "run");
        self.publish_run(RunStep::Enter, content).map_err(|e| self.lift(e))
    }

    /// Identity keys callers cannot override
    fn stamp(&self, content: &mut Content, execution_id: &str) {
        let definition = &self.inner.definition;
        content.insert("id".to_string(), json!(definition.id));
        content.insert("type".to_string(), json!(definition.kind));
        content.insert("executionId".to_string(), json!(execution_id));
        match &definition.name {
            Some(name) => content.insert("name".to_string(), json!(name)),
            None => content.remove("name"),
        };
        match &definition.parent {
            Some(parent) => content.insert("parent".to_string(), json!(parent)),
            None => content.remove("parent"),
        };
        if let Some(host) = &definition.attached_to {
            content.insert("attachedTo".to_string(), json!(host));
        }
        if definition.loop_characteristics.is_some() {
            content.insert("isMultiInstance".to_string(), json!(true));
        }
    }

    /// Content describing the activity outside of a run step
    pub(crate) fn state_content(&self) -> Content {
        let (status, execution_id) = self.with_state(|state| (state.status, state.execution_id.clone()));
        let mut content = Content::new();
        content.insert("id".to_string(), json!(self.id()));
        content.insert("type".to_string(), json!(self.kind()));
        if let Some(execution_id) = execution_id {
            content.insert("executionId".to_string(), json!(execution_id));
        }
        if let Some(status) = status {
            content.insert("status".to_string(), json!(status));
        }
        content
    }

    pub(crate) fn synthetic_message(&self, routing_key: &str, content: &Content) -> Message {
        Message::new(RUN_EXCHANGE, routing_key, content.clone(), MessageProperties::default())
    }

    pub(crate) fn publish_run(&self, step: RunStep, content: Content) -> BrokerResult<()> {
        self.broker().publish(
            RUN_EXCHANGE,
            step.routing_key(),
            content,
            MessageProperties::default().with_type(step.routing_key()),
        )
    }

    /// Publish `activity.<name>`; mandatory events fail when nobody listens
    pub(crate) fn publish_event(&self, name: &str, content: Content, mandatory: bool) -> BrokerResult<()> {
        let mut properties = MessageProperties::default().with_type(name);
        if mandatory {
            properties = properties.mandatory();
        }
        self.broker()
            .publish(EVENT_EXCHANGE, &activity_event(name), content, properties)
    }

    pub(crate) fn activate_extensions(&self, message: &Message) {
        if let Some(Some(extension)) = self.inner.extension.get() {
            extension.activate(message);
        }
    }

    pub(crate) fn deactivate_extensions(&self, message: &Message) {
        if let Some(Some(extension)) = self.inner.extension.get() {
            extension.deactivate(message);
        }
    }
}

/// Pending [`Activity::wait_for`] listener
#[derive(Debug)]
pub struct EventWait {
    event: String,
    receiver: oneshot::Receiver<Message>,
}

impl Future for EventWait {
    type Output = EngineResult<Message>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.receiver).poll(cx) {
            Poll::Ready(Ok(message)) => Poll::Ready(Ok(message)),
            Poll::Ready(Err(_)) => Poll::Ready(Err(EngineError::Other(format!(
                "Listener for {} dropped before the event fired",
                self.event
            )))),
            Poll::Pending => Poll::Pending,
        }
    }
}

/// Value of a content key as a string list
pub(crate) fn string_list(value: Option<&Value>) -> Vec<String> {
    value
        .and_then(Value::as_array)
        .map(|items| items.iter().filter_map(|v| v.as_str().map(str::to_string)).collect())
        .unwrap_or_default()
}
