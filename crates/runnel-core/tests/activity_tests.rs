use std::sync::Arc;

use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use runnel_core::{
    content_from, Activity, ActivityContext, ActivityState, ActivityStatus, Content, EngineError, EngineSettings,
    Environment, Extension, ExtensionFactory, Message, ProcessGraph,
};
use runnel_test_utils::assertions::{assert_counters, assert_event_sequence, assert_status};
use runnel_test_utils::{
    environment, init_test_logging, step_environment, task, CompleteBehaviour, EventRecorder, FailingBehaviour,
    ManualBehaviour, MockBehaviour, TestActivity, WaitingBehaviour,
};
use serde_json::json;

fn empty_graph(environment: Arc<Environment>) -> Arc<dyn ActivityContext> {
    ProcessGraph::builder(environment).build()
}

fn recorded(activity: &Activity) -> EventRecorder {
    let recorder = EventRecorder::new();
    recorder.attach(activity).unwrap();
    recorder
}

#[test]
fn test_run_publishes_lifecycle_events_in_order() {
    init_test_logging();
    let behaviour = CompleteBehaviour::with_output(json!("done"));
    let activity = TestActivity::new(task("task"))
        .behaviour(behaviour.factory())
        .build()
        .unwrap();
    let recorder = recorded(&activity);

    activity.run(Content::new()).unwrap();

    assert_event_sequence(
        &recorder,
        "task",
        &["activity.enter", "activity.start", "activity.end", "activity.leave"],
    )
    .unwrap();
    assert_counters(&activity, 1, 0).unwrap();
    assert_status(&activity, None).unwrap();
    assert_eq!(behaviour.execution_count(), 1);

    let leave = recorder.last("activity.leave").unwrap();
    assert_eq!(leave.get("output"), Some(&json!("done")));
    assert_eq!(leave.get("counters"), Some(&json!({"taken": 1, "discarded": 0})));
    assert_eq!(leave.get_str("executionId"), activity.execution_id().as_deref());
}

#[test]
fn test_run_content_is_stamped_with_identity() {
    let behaviour = CompleteBehaviour::with_output(json!(null));
    let activity = TestActivity::new(task("task").with_name("Task"))
        .behaviour(behaviour.factory())
        .build()
        .unwrap();

    activity
        .run(content_from(json!({"id": "other", "input": 1})))
        .unwrap();

    let start = &behaviour.executions()[0];
    assert_eq!(start.get_str("id"), Some("task"));
    assert_eq!(start.get_str("type"), Some("bpmn:Task"));
    assert_eq!(start.get_str("name"), Some("Task"));
    assert_eq!(start.get("input"), Some(&json!(1)));
    assert_eq!(start.get("isRootScope"), Some(&json!(true)));
    assert!(start.get_str("executionId").unwrap().starts_with("task_"));
}

#[test]
fn test_run_while_running_is_rejected() {
    let behaviour = ManualBehaviour::new();
    let activity = TestActivity::new(task("task"))
        .behaviour(behaviour.factory())
        .build()
        .unwrap();

    activity.run(Content::new()).unwrap();
    assert_status(&activity, Some(ActivityStatus::Executing)).unwrap();
    assert!(matches!(
        activity.run(Content::new()),
        Err(EngineError::AlreadyRunning(id)) if id == "task"
    ));

    behaviour.complete_next(json!(1)).unwrap();
    assert_status(&activity, None).unwrap();
    assert_counters(&activity, 1, 0).unwrap();
}

#[test]
fn test_each_run_gets_a_new_execution_id() {
    let activity = TestActivity::new(task("task")).build().unwrap();

    activity.run(Content::new()).unwrap();
    let first = activity.execution_id().unwrap();
    activity.run(Content::new()).unwrap();
    let second = activity.execution_id().unwrap();

    assert_ne!(first, second);
    assert_counters(&activity, 2, 0).unwrap();
}

#[test]
fn test_discard_idle_activity_skips_execution() {
    let behaviour = CompleteBehaviour::with_output(json!(null));
    let activity = TestActivity::new(task("task"))
        .behaviour(behaviour.factory())
        .build()
        .unwrap();
    let recorder = recorded(&activity);

    activity.discard(Content::new()).unwrap();

    assert_event_sequence(&recorder, "task", &["activity.enter", "activity.discard", "activity.leave"]).unwrap();
    assert_counters(&activity, 0, 1).unwrap();
    assert_eq!(behaviour.execution_count(), 0);
}

#[test]
fn test_discard_content_starts_the_discard_run() {
    let activity = TestActivity::new(task("task")).build().unwrap();
    let recorder = recorded(&activity);

    activity
        .discard(content_from(json!({"reason": "skipped", "discardSequence": ["upstream"]})))
        .unwrap();

    let discard = recorder.last("activity.discard").unwrap();
    assert_eq!(discard.get_str("reason"), Some("skipped"));
    assert_eq!(discard.get("discardSequence"), Some(&json!(["upstream"])));
    assert_counters(&activity, 0, 1).unwrap();
}

#[test]
fn test_discard_while_executing_discards_the_run() {
    let behaviour = ManualBehaviour::new();
    let activity = TestActivity::new(task("task"))
        .behaviour(behaviour.factory())
        .build()
        .unwrap();
    let recorder = recorded(&activity);

    activity.run(Content::new()).unwrap();
    activity.discard(Content::new()).unwrap();

    assert_event_sequence(
        &recorder,
        "task",
        &["activity.enter", "activity.start", "activity.discard", "activity.leave"],
    )
    .unwrap();
    assert_counters(&activity, 0, 1).unwrap();
    assert_eq!(
        recorder.last("activity.leave").unwrap().get("discarded"),
        Some(&json!(true))
    );
}

#[test]
fn test_discard_from_enter_listener_skips_start() {
    let activity = TestActivity::new(task("task")).build().unwrap();
    let recorder = recorded(&activity);
    activity
        .once("enter", |activity, message| {
            activity.get_api(Some(message)).discard()
        })
        .unwrap();

    activity.run(Content::new()).unwrap();

    assert_event_sequence(&recorder, "task", &["activity.enter", "activity.discard", "activity.leave"]).unwrap();
    assert_counters(&activity, 0, 1).unwrap();
}

#[test]
fn test_unhandled_execution_error_is_returned_from_run() {
    let activity = TestActivity::new(task("task"))
        .behaviour(FailingBehaviour::new("boom").factory())
        .build()
        .unwrap();

    match activity.run(Content::new()) {
        Err(EngineError::UnhandledError {
            activity_id,
            message,
            error,
        }) => {
            assert_eq!(activity_id, "task");
            assert_eq!(message, "Execution error: boom");
            assert_eq!(error["type"], json!("ExecutionError"));
        }
        other => panic!("expected unhandled error, got {:?}", other),
    }
}

#[test]
fn test_thrown_behaviour_error_is_an_execution_error() {
    let activity = TestActivity::new(task("task"))
        .behaviour(FailingBehaviour::throwing("thrown").factory())
        .build()
        .unwrap();

    let err = activity.run(Content::new()).unwrap_err();
    assert!(matches!(err, EngineError::UnhandledError { ref message, .. } if message == "Execution error: thrown"));
}

#[test]
fn test_handled_error_leaves_discarded() {
    let activity = TestActivity::new(task("task"))
        .behaviour(FailingBehaviour::new("boom").factory())
        .build()
        .unwrap();
    let errors = Arc::new(Mutex::new(Vec::new()));
    let seen = errors.clone();
    activity
        .on("error", move |_, message| {
            seen.lock().push(message.get("error").cloned());
            Ok(())
        })
        .unwrap();
    let recorder = recorded(&activity);

    activity.run(Content::new()).unwrap();

    assert_eq!(errors.lock().len(), 1);
    assert_event_sequence(
        &recorder,
        "task",
        &["activity.enter", "activity.start", "activity.error", "activity.leave"],
    )
    .unwrap();
    assert_counters(&activity, 0, 1).unwrap();
    assert_status(&activity, None).unwrap();
}

#[test]
fn test_mock_behaviour_receives_start_message() {
    let mut mock = MockBehaviour::new();
    mock.expect_execute()
        .times(1)
        .returning(|message: &Message, execution| {
            assert_eq!(message.get_str("id"), Some("task"));
            assert!(execution.is_root());
            execution.complete(json!("mocked"))
        });
    mock.expect_get_state().returning(|| None);
    let activity = TestActivity::new(task("task"))
        .behaviour(runnel_core::shared_behaviour(Arc::new(mock)))
        .build()
        .unwrap();
    let recorder = recorded(&activity);

    activity.run(Content::new()).unwrap();

    assert_eq!(
        recorder.last("activity.end").unwrap().get("output"),
        Some(&json!("mocked"))
    );
}

#[tokio::test]
async fn test_wait_for_resolves_with_event() {
    let activity = TestActivity::new(task("task")).build().unwrap();
    let leave = activity.wait_for("leave").unwrap();
    let end = activity
        .wait_for_matching("end", |message| message.get("output").is_some())
        .unwrap();

    activity.run(content_from(json!({"input": "x"}))).unwrap();

    let leave = leave.await.unwrap();
    assert_eq!(leave.routing_key(), "activity.leave");
    assert_eq!(leave.get("input"), Some(&json!("x")));
    assert_eq!(end.await.unwrap().routing_key(), "activity.end");
}

#[test]
fn test_once_listener_fires_a_single_time() {
    let activity = TestActivity::new(task("task")).build().unwrap();
    let count = Arc::new(Mutex::new(0));
    let counter = count.clone();
    activity
        .once("leave", move |_, _| {
            *counter.lock() += 1;
            Ok(())
        })
        .unwrap();

    activity.run(Content::new()).unwrap();
    activity.run(Content::new()).unwrap();

    assert_eq!(*count.lock(), 1);
}

#[test]
fn test_off_removes_listener() {
    let activity = TestActivity::new(task("task")).build().unwrap();
    let count = Arc::new(Mutex::new(0));
    let counter = count.clone();
    let tag = activity
        .on("leave", move |_, _| {
            *counter.lock() += 1;
            Ok(())
        })
        .unwrap();

    activity.run(Content::new()).unwrap();
    assert!(activity.off(&tag).unwrap());
    activity.run(Content::new()).unwrap();

    assert_eq!(*count.lock(), 1);
}

#[test]
fn test_stop_and_resume_matches_uninterrupted_run() {
    let baseline = TestActivity::new(task("task"))
        .behaviour(WaitingBehaviour::new().factory())
        .build()
        .unwrap();
    let baseline_events = recorded(&baseline);
    baseline.run(Content::new()).unwrap();
    baseline
        .get_api(None)
        .signal(content_from(json!({"output": "signalled"})))
        .unwrap();

    let activity = TestActivity::new(task("task"))
        .behaviour(WaitingBehaviour::new().factory())
        .build()
        .unwrap();
    let events = recorded(&activity);
    activity.run(Content::new()).unwrap();

    activity.stop().unwrap();
    assert!(activity.is_stopped());
    assert_status(&activity, Some(ActivityStatus::Executing)).unwrap();
    activity.stop().unwrap();

    activity.resume().unwrap();
    assert!(!activity.is_stopped());
    activity
        .get_api(None)
        .signal(content_from(json!({"output": "signalled"})))
        .unwrap();

    let interrupted: Vec<String> = events
        .routing_keys()
        .into_iter()
        .filter(|key| key != "activity.stop")
        .collect();
    assert_eq!(interrupted, baseline_events.routing_keys());
    assert_eq!(events.count("activity.stop"), 1);
    assert_eq!(events.count("activity.wait"), 1);
    assert_eq!(
        events.last("activity.end").unwrap().get("output"),
        Some(&json!("signalled"))
    );
    assert_counters(&activity, 1, 0).unwrap();
}

#[test]
fn test_resume_while_running_is_rejected() {
    let activity = TestActivity::new(task("task"))
        .behaviour(ManualBehaviour::new().factory())
        .build()
        .unwrap();
    activity.run(Content::new()).unwrap();

    assert!(matches!(activity.resume(), Err(EngineError::ResumeWhileRunning(_))));
}

#[test]
fn test_resume_idle_activity_is_a_no_op() {
    let activity = TestActivity::new(task("task")).build().unwrap();
    activity.resume().unwrap();
    assert_status(&activity, None).unwrap();
    assert_counters(&activity, 0, 0).unwrap();
}

#[test]
fn test_state_survives_json_and_recovers_in_new_instance() {
    let graph = empty_graph(environment());
    let activity = TestActivity::new(task("task"))
        .context(graph.clone())
        .behaviour(WaitingBehaviour::new().factory())
        .build()
        .unwrap();
    activity.run(content_from(json!({"input": 42}))).unwrap();
    let execution_id = activity.execution_id();

    let state = activity.get_state().unwrap();
    assert_eq!(state.status, Some(ActivityStatus::Executing));
    let encoded = serde_json::to_string(&state).unwrap();
    let decoded: ActivityState = serde_json::from_str(&encoded).unwrap();
    assert_eq!(decoded, state);

    let recovered = TestActivity::new(task("task"))
        .context(graph)
        .behaviour(WaitingBehaviour::new().factory())
        .build()
        .unwrap();
    let events = recorded(&recovered);
    recovered.recover(&decoded).unwrap();

    assert!(recovered.is_stopped());
    assert_status(&recovered, Some(ActivityStatus::Executing)).unwrap();
    assert_eq!(recovered.execution_id(), execution_id);

    recovered.resume().unwrap();
    assert!(events.routing_keys().is_empty());

    recovered
        .get_api(None)
        .signal(content_from(json!({"output": "late"})))
        .unwrap();

    assert_eq!(events.routing_keys(), vec!["activity.end", "activity.leave"]);
    let end = events.last("activity.end").unwrap();
    assert_eq!(end.get("output"), Some(&json!("late")));
    assert_eq!(end.get("input"), Some(&json!(42)));
    assert_counters(&recovered, 1, 0).unwrap();
}

#[test]
fn test_recover_checks_activity_id_and_status() {
    let activity = TestActivity::new(task("task")).build().unwrap();
    let state = activity.get_state().unwrap();

    let other = TestActivity::new(task("other")).build().unwrap();
    assert!(matches!(other.recover(&state), Err(EngineError::ConfigurationError(_))));

    let running = TestActivity::new(task("task"))
        .behaviour(ManualBehaviour::new().factory())
        .build()
        .unwrap();
    running.run(Content::new()).unwrap();
    assert!(matches!(
        running.recover(&state),
        Err(EngineError::RecoverWhileRunning(_))
    ));
}

#[test]
fn test_recover_idle_state_restores_counters() {
    let activity = TestActivity::new(task("task")).build().unwrap();
    activity.run(Content::new()).unwrap();
    activity.discard(Content::new()).unwrap();
    let state = activity.get_state().unwrap();
    assert_eq!(state.status, None);

    let recovered = TestActivity::new(task("task")).build().unwrap();
    recovered.recover(&state).unwrap();

    assert!(!recovered.is_stopped());
    assert_counters(&recovered, 1, 1).unwrap();
    recovered.run(Content::new()).unwrap();
    assert_counters(&recovered, 2, 1).unwrap();
}

#[test]
fn test_idle_state_is_skipped_when_tracking_is_disabled() {
    let environment = Arc::new(Environment::new(
        EngineSettings::default().with_disable_track_state(true),
    ));
    let activity = TestActivity::new(task("task"))
        .context(empty_graph(environment))
        .behaviour(ManualBehaviour::new().factory())
        .build()
        .unwrap();

    assert!(activity.get_state().is_none());
    activity.run(Content::new()).unwrap();
    assert!(activity.get_state().is_some());
}

#[test]
fn test_behaviour_state_is_persisted_with_execution() {
    let behaviour = ManualBehaviour::new();
    behaviour.set_state(json!({"attempt": 2}));
    let activity = TestActivity::new(task("task"))
        .behaviour(behaviour.factory())
        .build()
        .unwrap();
    activity.run(Content::new()).unwrap();

    let state = activity.get_state().unwrap();
    assert_eq!(
        state.execution.as_ref().and_then(|e| e.behaviour.clone()),
        Some(json!({"attempt": 2}))
    );

    let fresh = ManualBehaviour::new();
    let recovered = TestActivity::new(task("task"))
        .behaviour(fresh.factory())
        .build()
        .unwrap();
    recovered.recover(&state).unwrap();
    assert_eq!(fresh.state(), Some(json!({"attempt": 2})));

    recovered.resume().unwrap();
    assert_eq!(fresh.pending_ids(), vec![state.execution_id.clone().unwrap()]);
}

#[test]
fn test_step_mode_runs_one_message_per_next() {
    let activity = TestActivity::new(task("task"))
        .context(empty_graph(step_environment()))
        .build()
        .unwrap();
    let recorder = recorded(&activity);

    activity.run(Content::new()).unwrap();
    assert!(recorder.routing_keys().is_empty());

    let mut steps = Vec::new();
    while let Some(message) = activity.next().unwrap() {
        steps.push(message.routing_key().to_string());
    }

    assert_eq!(
        steps,
        vec!["run.enter", "run.start", "run.execute", "run.end", "run.leave"]
    );
    assert_event_sequence(
        &recorder,
        "task",
        &["activity.enter", "activity.start", "activity.end", "activity.leave"],
    )
    .unwrap();
    assert_counters(&activity, 1, 0).unwrap();
}

#[test]
fn test_next_outside_step_mode_does_nothing() {
    let activity = TestActivity::new(task("task")).build().unwrap();
    assert!(activity.next().unwrap().is_none());
}

#[test]
fn test_next_waits_for_pending_execution() {
    let behaviour = ManualBehaviour::new();
    let activity = TestActivity::new(task("task"))
        .context(empty_graph(step_environment()))
        .behaviour(behaviour.factory())
        .build()
        .unwrap();

    activity.run(Content::new()).unwrap();
    for expected in ["run.enter", "run.start", "run.execute"] {
        assert_eq!(activity.next().unwrap().unwrap().routing_key(), expected);
    }
    assert!(activity.next().unwrap().is_none());

    behaviour.complete_next(json!(null)).unwrap();
    assert_eq!(activity.next().unwrap().unwrap().routing_key(), "run.end");
    assert_eq!(activity.next().unwrap().unwrap().routing_key(), "run.leave");
    assert_status(&activity, None).unwrap();
}

#[test]
fn test_step_mode_stop_and_resume_continues_execution() {
    let behaviour = ManualBehaviour::new();
    let activity = TestActivity::new(task("task"))
        .context(empty_graph(step_environment()))
        .behaviour(behaviour.factory())
        .build()
        .unwrap();
    let recorder = recorded(&activity);

    activity.run(Content::new()).unwrap();
    for expected in ["run.enter", "run.start", "run.execute"] {
        assert_eq!(activity.next().unwrap().unwrap().routing_key(), expected);
    }
    let pending = behaviour.pending_ids();

    activity.stop().unwrap();
    behaviour.clear();
    activity.resume().unwrap();

    let redelivered = activity.next().unwrap().unwrap();
    assert_eq!(redelivered.routing_key(), "run.execute");
    assert!(redelivered.redelivered());
    assert_eq!(behaviour.pending_ids(), pending);

    behaviour.complete_next(json!("late")).unwrap();
    let mut steps = Vec::new();
    while let Some(message) = activity.next().unwrap() {
        steps.push(message.routing_key().to_string());
    }

    assert_eq!(steps, vec!["run.end", "run.leave"]);
    assert_event_sequence(
        &recorder,
        "task",
        &["activity.enter", "activity.start", "activity.stop", "activity.end", "activity.leave"],
    )
    .unwrap();
    assert_counters(&activity, 1, 0).unwrap();
}

#[test]
fn test_format_requests_hold_execution_until_completed() {
    let behaviour = CompleteBehaviour::with_output(json!(null));
    let activity = TestActivity::new(task("task"))
        .behaviour(behaviour.factory())
        .build()
        .unwrap();
    activity
        .on("enter", |activity, message| {
            activity
                .get_api(Some(message))
                .format_start("run.format.a.end", content_from(json!({"a": "pending"})))
        })
        .unwrap();

    activity.run(Content::new()).unwrap();
    assert_status(&activity, Some(ActivityStatus::Formatting)).unwrap();
    assert_eq!(behaviour.execution_count(), 0);

    activity
        .get_api(None)
        .format_end("run.format.a.end", content_from(json!({"a": "done", "id": "ignored"})))
        .unwrap();

    assert_status(&activity, None).unwrap();
    let start = &behaviour.executions()[0];
    assert_eq!(start.get("a"), Some(&json!("done")));
    assert_eq!(start.get_str("id"), Some("task"));
    assert!(start.get("endRoutingKey").is_none());
}

#[test]
fn test_format_message_without_end_key_merges_immediately() {
    let behaviour = CompleteBehaviour::with_output(json!(null));
    let activity = TestActivity::new(task("task"))
        .behaviour(behaviour.factory())
        .build()
        .unwrap();
    activity
        .on("start", |activity, message| {
            activity
                .get_api(Some(message))
                .format_end("run.format.b", content_from(json!({"b": 2})))
        })
        .unwrap();

    activity.run(Content::new()).unwrap();

    assert_counters(&activity, 1, 0).unwrap();
    assert_eq!(behaviour.executions()[0].get("b"), Some(&json!(2)));
}

struct RecordingExtension {
    calls: Arc<Mutex<Vec<String>>>,
}

impl Extension for RecordingExtension {
    fn activate(&self, message: &Message) {
        self.calls.lock().push(format!("activate:{}", message.routing_key()));
    }

    fn deactivate(&self, message: &Message) {
        self.calls.lock().push(format!("deactivate:{}", message.routing_key()));
    }
}

#[test]
fn test_extensions_are_active_for_the_duration_of_a_run() {
    let calls = Arc::new(Mutex::new(Vec::new()));
    let shared = calls.clone();
    let factory: ExtensionFactory = Arc::new(move |_| {
        Some(Arc::new(RecordingExtension { calls: shared.clone() }) as Arc<dyn Extension>)
    });
    let graph = ProcessGraph::builder(environment()).extension("task", factory).build();
    let activity = TestActivity::new(task("task")).context(graph).build().unwrap();

    activity.run(Content::new()).unwrap();

    assert_eq!(
        *calls.lock(),
        vec!["activate:run.enter".to_string(), "deactivate:run.leave".to_string()]
    );
}
