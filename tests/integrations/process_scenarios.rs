//! Processes of several activities driven from their start event

use std::sync::Arc;

use pretty_assertions::assert_eq;
use runnel_core::{
    ActivityDefinition, Content, Environment, LoopCharacteristics, Message, ProcessGraph,
};
use runnel_integration_tests::Process;
use runnel_test_utils::{CompleteBehaviour, FailingBehaviour, ManualBehaviour};
use serde_json::{json, Map, Value};

fn environment(variables: Value) -> Arc<Environment> {
    let variables: Map<String, Value> = serde_json::from_value(variables).unwrap();
    Arc::new(Environment::default().with_variables(variables))
}

fn last_event_of(process: &Process, routing_key: &str, activity_id: &str) -> Option<Message> {
    process
        .recorder()
        .messages(routing_key)
        .into_iter()
        .filter(|m| m.get_str("id") == Some(activity_id))
        .last()
}

fn approval(approved: bool) -> (Process, Arc<ManualBehaviour>) {
    let graph = ProcessGraph::builder(environment(json!({
        "approved": approved,
        "reviewers": ["ann", "bob"],
    })))
    .flow("to-decide", "start", "decide")
    .conditional_flow("to-review", "decide", "review", "${environment.variables.approved}")
    .default_flow("to-rejected", "decide", "rejected")
    .flow("to-done", "review", "done")
    .build();

    let review = ManualBehaviour::new();
    let noop = CompleteBehaviour::with_output(Value::Null);

    let mut process = Process::new(graph);
    process
        .add(ActivityDefinition::new("start", "bpmn:StartEvent"), noop.factory())
        .unwrap();
    process
        .add(ActivityDefinition::new("decide", "bpmn:ExclusiveGateway"), noop.factory())
        .unwrap();
    process
        .add(
            ActivityDefinition::new("review", "bpmn:UserTask").with_loop(
                LoopCharacteristics::parallel(0).over_collection("${environment.variables.reviewers}", "reviewer"),
            ),
            review.factory(),
        )
        .unwrap();
    process
        .add(ActivityDefinition::new("done", "bpmn:EndEvent"), noop.factory())
        .unwrap();
    process
        .add(ActivityDefinition::new("rejected", "bpmn:EndEvent"), noop.factory())
        .unwrap();
    (process, review)
}

#[test]
fn test_approved_request_is_reviewed_by_every_reviewer() {
    let (process, review) = approval(true);

    process.activity("start").run(Content::new()).unwrap();

    assert_eq!(process.running(), vec!["review".to_string()]);
    assert_eq!(process.counters("rejected"), (0, 1));

    let ids = review.pending_ids();
    let reviewers: Vec<String> = ids
        .iter()
        .filter_map(|id| review.message(id))
        .filter_map(|m| m.get_str("reviewer").map(str::to_string))
        .collect();
    assert_eq!(reviewers, vec!["ann".to_string(), "bob".to_string()]);

    review.complete(&ids[1], json!("bob ok")).unwrap();
    assert_eq!(process.counters("done"), (0, 0));
    review.complete(&ids[0], json!("ann ok")).unwrap();

    let end = last_event_of(&process, "activity.end", "review").unwrap();
    assert_eq!(end.get("output"), Some(&json!(["ann ok", "bob ok"])));
    assert_eq!(process.counters("review"), (1, 0));
    assert_eq!(process.counters("done"), (1, 0));
    assert!(process.running().is_empty());
}

#[test]
fn test_rejected_request_discards_the_review_path() {
    let (process, review) = approval(false);

    process.activity("start").run(Content::new()).unwrap();

    assert!(process.running().is_empty());
    assert!(review.pending_ids().is_empty());
    assert_eq!(process.counters("review"), (0, 1));
    assert_eq!(process.counters("done"), (0, 1));
    assert_eq!(process.counters("rejected"), (1, 0));
}

#[test]
fn test_parallel_branches_meet_at_join() {
    let graph = ProcessGraph::builder(environment(json!({})))
        .flow("to-a", "start", "a")
        .flow("to-b", "start", "b")
        .flow("a-join", "a", "join")
        .flow("b-join", "b", "join")
        .flow("to-end", "join", "end")
        .build();
    let slow = ManualBehaviour::new();
    let noop = CompleteBehaviour::with_output(Value::Null);

    let mut process = Process::new(graph);
    for id in ["start", "a", "end"] {
        process.add(ActivityDefinition::new(id, "bpmn:Task"), noop.factory()).unwrap();
    }
    process.add(ActivityDefinition::new("b", "bpmn:Task"), slow.factory()).unwrap();
    process
        .add(
            ActivityDefinition::new("join", "bpmn:ParallelGateway").with_parallel_join(),
            noop.factory(),
        )
        .unwrap();

    process.activity("start").run(Content::new()).unwrap();

    assert_eq!(process.counters("a"), (1, 0));
    assert_eq!(process.counters("join"), (0, 0));
    assert_eq!(process.running(), vec!["b".to_string()]);

    slow.complete_next(Value::Null).unwrap();

    assert_eq!(process.counters("join"), (1, 0));
    assert_eq!(process.counters("end"), (1, 0));
    let enter = last_event_of(&process, "activity.enter", "join").unwrap();
    let inbound: Vec<&str> = enter
        .get("inbound")
        .and_then(Value::as_array)
        .unwrap()
        .iter()
        .filter_map(|t| t["id"].as_str())
        .collect();
    assert_eq!(inbound, vec!["a-join", "b-join"]);
}

#[test]
fn test_join_runs_once_when_one_branch_is_discarded() {
    let graph = ProcessGraph::builder(environment(json!({"left": true, "right": false})))
        .conditional_flow("to-a", "decide", "a", "${environment.variables.left}")
        .conditional_flow("to-b", "decide", "b", "${environment.variables.right}")
        .flow("a-join", "a", "join")
        .flow("b-join", "b", "join")
        .flow("to-end", "join", "end")
        .build();
    let noop = CompleteBehaviour::with_output(Value::Null);

    let mut process = Process::new(graph);
    for id in ["decide", "a", "b", "end"] {
        process.add(ActivityDefinition::new(id, "bpmn:Task"), noop.factory()).unwrap();
    }
    process
        .add(
            ActivityDefinition::new("join", "bpmn:InclusiveGateway").with_parallel_join(),
            noop.factory(),
        )
        .unwrap();

    process.activity("decide").run(Content::new()).unwrap();

    assert_eq!(process.counters("a"), (1, 0));
    assert_eq!(process.counters("b"), (0, 1));
    assert_eq!(process.counters("join"), (1, 0));
    assert_eq!(process.counters("end"), (1, 0));
}

#[test]
fn test_handled_failure_discards_the_rest_of_the_path() {
    let graph = ProcessGraph::builder(environment(json!({})))
        .flow("to-task", "start", "task")
        .flow("to-end", "task", "end")
        .build();
    let noop = CompleteBehaviour::with_output(Value::Null);

    let mut process = Process::new(graph);
    process.add(ActivityDefinition::new("start", "bpmn:StartEvent"), noop.factory()).unwrap();
    process
        .add(ActivityDefinition::new("task", "bpmn:ServiceTask"), FailingBehaviour::new("service down").factory())
        .unwrap();
    process.add(ActivityDefinition::new("end", "bpmn:EndEvent"), noop.factory()).unwrap();

    process.activity("start").run(Content::new()).unwrap();

    let error = last_event_of(&process, "activity.error", "task").unwrap();
    assert_eq!(error.get("error").unwrap()["message"], json!("Execution error: service down"));
    assert_eq!(process.counters("task"), (0, 1));
    assert_eq!(process.counters("end"), (0, 1));
}

#[test]
fn test_behaviour_can_publish_process_variables() {
    let graph = ProcessGraph::builder(environment(json!({})))
        .flow("to-check", "calculate", "check")
        .conditional_flow("to-big", "check", "big", "${environment.variables.total > `100`}")
        .default_flow("to-small", "check", "small")
        .build();
    let environment = runnel_core::ActivityContext::environment(graph.as_ref());
    let calculate = CompleteBehaviour::with(move |_| {
        environment.set_variable("total", json!(250));
        json!(250)
    });
    let noop = CompleteBehaviour::with_output(Value::Null);

    let mut process = Process::new(graph);
    process.add(ActivityDefinition::new("calculate", "bpmn:ScriptTask"), calculate.factory()).unwrap();
    for id in ["check", "big", "small"] {
        process.add(ActivityDefinition::new(id, "bpmn:Task"), noop.factory()).unwrap();
    }

    process.activity("calculate").run(Content::new()).unwrap();

    assert_eq!(process.environment().variables().get("total"), Some(&json!(250)));
    assert_eq!(process.counters("big"), (1, 0));
    assert_eq!(process.counters("small"), (0, 1));
}
