//! Behaviours completing on the Tokio runtime

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use pretty_assertions::assert_eq;
use runnel_core::{
    shared_behaviour, ActivityDefinition, AsyncBehaviour, Content, EngineError, EngineResult, Environment,
    LoopCharacteristics, Message, ProcessGraph, TokioBehaviour,
};
use runnel_integration_tests::Process;
use runnel_test_utils::CompleteBehaviour;
use serde_json::{json, Value};

/// Looks a price up after a short delay
struct PriceLookup {
    delay: Duration,
}

#[async_trait]
impl AsyncBehaviour for PriceLookup {
    async fn execute(&self, message: Message) -> EngineResult<Value> {
        tokio::time::sleep(self.delay).await;
        match message.get_str("sku") {
            Some("missing") => Err(EngineError::ExecutionError("unknown sku".to_string())),
            Some(sku) => Ok(json!({ "sku": sku, "price": sku.len() * 10 })),
            None => Ok(json!({ "price": 0 })),
        }
    }
}

fn pricing_process(characteristics: Option<LoopCharacteristics>) -> Process {
    let graph = ProcessGraph::builder(Arc::new(Environment::default()))
        .flow("to-end", "price", "end")
        .build();
    let lookup = TokioBehaviour::new(PriceLookup {
        delay: Duration::from_millis(5),
    })
    .unwrap();

    let mut definition = ActivityDefinition::new("price", "bpmn:ServiceTask");
    if let Some(characteristics) = characteristics {
        definition = definition.with_loop(characteristics);
    }

    let mut process = Process::new(graph);
    process.add(definition, shared_behaviour(Arc::new(lookup))).unwrap();
    process
        .add(
            ActivityDefinition::new("end", "bpmn:EndEvent"),
            CompleteBehaviour::with_output(Value::Null).factory(),
        )
        .unwrap();
    process
}

#[tokio::test]
async fn test_async_behaviour_completes_the_process() {
    let process = pricing_process(None);
    let ended = process.activity("end").wait_for("end").unwrap();

    let mut content = Content::new();
    content.insert("sku".to_string(), json!("abc"));
    process.activity("price").run(content).unwrap();
    assert_eq!(process.running(), vec!["price".to_string()]);

    tokio::time::timeout(Duration::from_secs(5), ended).await.unwrap().unwrap();

    let end = process
        .recorder()
        .messages("activity.end")
        .into_iter()
        .find(|m| m.get_str("id") == Some("price"))
        .unwrap();
    assert_eq!(end.get("output"), Some(&json!({"sku": "abc", "price": 30})));
    assert!(process.running().is_empty());
}

#[tokio::test]
async fn test_async_failure_is_published_as_error() {
    let process = pricing_process(None);
    let errored = process.activity("price").wait_for("error").unwrap();
    let left = process.activity("end").wait_for("leave").unwrap();

    let mut content = Content::new();
    content.insert("sku".to_string(), json!("missing"));
    process.activity("price").run(content).unwrap();

    let error = tokio::time::timeout(Duration::from_secs(5), errored).await.unwrap().unwrap();
    assert_eq!(error.get("error").unwrap()["type"], json!("ExecutionError"));

    tokio::time::timeout(Duration::from_secs(5), left).await.unwrap().unwrap();
    assert_eq!(process.counters("end"), (0, 1));
}

#[tokio::test]
async fn test_async_iterations_run_concurrently() {
    let process = pricing_process(Some(
        LoopCharacteristics::parallel(0).over_collection("${content.skus}", "sku"),
    ));
    let ended = process
        .activity("price")
        .wait_for_matching("end", |m| m.get("isRootScope") != Some(&json!(false)))
        .unwrap();

    process
        .activity("price")
        .run(runnel_core::content_from(json!({"skus": ["a", "bb", "ccc"]})))
        .unwrap();

    let end = tokio::time::timeout(Duration::from_secs(5), ended).await.unwrap().unwrap();
    let prices: Vec<i64> = end
        .get("output")
        .and_then(Value::as_array)
        .unwrap()
        .iter()
        .filter_map(|o| o["price"].as_i64())
        .collect();
    assert_eq!(prices, vec![10, 20, 30]);
    assert_eq!(process.counters("end"), (1, 0));
}
