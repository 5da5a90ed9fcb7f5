//! Saving a running process and continuing it in a fresh one

use std::sync::Arc;

use pretty_assertions::assert_eq;
use runnel_core::{
    content_from, ActivityDefinition, ActivityStatus, Content, Environment, EngineSettings, LoopCharacteristics, ProcessGraph,
};
use runnel_integration_tests::{from_json, to_json, Process};
use runnel_test_utils::{CompleteBehaviour, ManualBehaviour, WaitingBehaviour};
use serde_json::{json, Value};

fn order_process(settings: EngineSettings) -> (Process, Arc<ManualBehaviour>) {
    let graph = ProcessGraph::builder(Arc::new(Environment::new(settings)))
        .flow("to-pick", "start", "pick")
        .flow("to-ship", "pick", "ship")
        .build();
    let pick = ManualBehaviour::new();
    let noop = CompleteBehaviour::with_output(Value::Null);

    let mut process = Process::new(graph);
    process.add(ActivityDefinition::new("start", "bpmn:StartEvent"), noop.factory()).unwrap();
    process
        .add(
            ActivityDefinition::new("pick", "bpmn:UserTask").with_loop(LoopCharacteristics::sequential(3)),
            pick.factory(),
        )
        .unwrap();
    process.add(ActivityDefinition::new("ship", "bpmn:EndEvent"), noop.factory()).unwrap();
    (process, pick)
}

#[test]
fn test_process_continues_from_persisted_json() {
    let (process, pick) = order_process(EngineSettings::default());
    process.activity("start").run(Content::new()).unwrap();
    pick.complete_next(json!("shelf-1")).unwrap();

    let saved = to_json(&process.get_state()).unwrap();
    drop(process);

    let (restored, resumed_pick) = order_process(EngineSettings::default());
    restored.recover(&from_json(&saved).unwrap()).unwrap();

    assert_eq!(restored.counters("start"), (1, 0));
    assert_eq!(restored.running(), vec!["pick".to_string()]);
    assert_eq!(resumed_pick.pending_ids().len(), 1);

    resumed_pick.complete_next(json!("shelf-2")).unwrap();
    resumed_pick.complete_next(json!("shelf-3")).unwrap();

    assert_eq!(restored.counters("pick"), (1, 0));
    assert_eq!(restored.counters("ship"), (1, 0));
    let end = restored.recorder().last("activity.end").unwrap();
    assert_eq!(end.get_str("id"), Some("ship"));
    let picked = restored
        .recorder()
        .messages("activity.end")
        .into_iter()
        .find(|m| m.get_str("id") == Some("pick"))
        .unwrap();
    assert_eq!(picked.get("output"), Some(&json!(["shelf-1", "shelf-2", "shelf-3"])));
}

#[test]
fn test_idle_activities_are_left_out_without_state_tracking() {
    let (process, pick) = order_process(EngineSettings::default().with_disable_track_state(true));
    process.activity("start").run(Content::new()).unwrap();

    let states = process.get_state();
    let ids: Vec<&str> = states.keys().map(String::as_str).collect();
    assert_eq!(ids, vec!["pick"]);
    assert_eq!(states["pick"].status, Some(ActivityStatus::Executing));
    assert_eq!(pick.pending_ids().len(), 1);
}

#[test]
fn test_stopped_waiting_task_resumes_where_it_left_off() {
    let graph = ProcessGraph::builder(Arc::new(Environment::default()))
        .flow("to-wait", "start", "wait")
        .flow("to-end", "wait", "end")
        .build();
    let waiting = WaitingBehaviour::new();
    let noop = CompleteBehaviour::with_output(Value::Null);

    let mut process = Process::new(graph);
    process.add(ActivityDefinition::new("start", "bpmn:StartEvent"), noop.factory()).unwrap();
    process.add(ActivityDefinition::new("wait", "bpmn:ReceiveTask"), waiting.factory()).unwrap();
    process.add(ActivityDefinition::new("end", "bpmn:EndEvent"), noop.factory()).unwrap();

    process.activity("start").run(Content::new()).unwrap();
    assert_eq!(process.recorder().count("activity.wait"), 1);

    let wait = process.activity("wait");
    wait.stop().unwrap();
    assert!(wait.is_stopped());
    wait.resume().unwrap();
    assert_eq!(process.recorder().count("activity.wait"), 1);

    wait.get_api(None)
        .signal(content_from(json!({"output": "message received"})))
        .unwrap();

    assert_eq!(process.counters("wait"), (1, 0));
    assert_eq!(process.counters("end"), (1, 0));
}
