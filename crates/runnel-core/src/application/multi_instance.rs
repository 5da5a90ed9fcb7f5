//! Multi-instance iteration scheduling
//!
//! The root execution of a looped activity never runs the behaviour itself.
//! It publishes one `execution.start` per iteration on the execution exchange
//! (one at a time when sequential, all at once when parallel) and collects
//! iteration outputs by index until every iteration settled or the
//! completion condition holds.

use std::collections::{BTreeMap, BTreeSet};

use runnel_broker::Content;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::debug;

use crate::environment::{is_truthy, Environment};
use crate::error::{EngineError, EngineResult};
use crate::types::{Cardinality, LoopCharacteristics, ParentRef};

/// Persisted iteration progress
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MultiInstanceProgress {
    /// Total number of iterations
    pub cardinality: usize,
    /// Iterations run one at a time
    pub is_sequential: bool,
    /// Next iteration index to start
    #[serde(default)]
    pub next_index: usize,
    /// Iterations started and not yet settled
    #[serde(default)]
    pub running: BTreeSet<usize>,
    /// Outputs of completed iterations by index
    #[serde(default)]
    pub outputs: BTreeMap<usize, Value>,
    /// Collection elements, when iterating a collection
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub elements: Option<Vec<Value>>,
    /// Root execution settled
    #[serde(default)]
    pub completed: bool,
}

/// What the coordinator wants done next
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Progress {
    /// Start these iterations
    Start(Vec<usize>),
    /// Complete the root with the collected output, halting in-flight iterations
    Complete {
        output: Value,
        halted: Vec<usize>,
    },
    /// Wait for running iterations
    Wait,
}

fn as_count(value: &Value) -> Option<usize> {
    match value {
        Value::Number(n) => n.as_u64().map(|n| n as usize),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

impl MultiInstanceProgress {
    /// Resolve cardinality and decide the first iterations
    pub(crate) fn begin(
        characteristics: &LoopCharacteristics,
        root_content: &Content,
        environment: &Environment,
    ) -> EngineResult<(Self, Progress)> {
        let context = json!({ "content": Value::Object(root_content.clone()) });

        let elements = match &characteristics.collection {
            Some(expression) => match environment.resolve_expression(expression, &context)? {
                Value::Array(items) => Some(items),
                other => {
                    return Err(EngineError::ExpressionError(format!(
                        "Loop collection {} resolved to {}, expected an array",
                        expression, other
                    )))
                }
            },
            None => None,
        };

        let cardinality = match (&characteristics.cardinality, &elements) {
            (Some(Cardinality::Fixed(count)), _) => *count,
            (Some(Cardinality::Expression(expression)), _) => {
                let value = environment.resolve_expression(expression, &context)?;
                as_count(&value).ok_or_else(|| {
                    EngineError::ExpressionError(format!(
                        "Loop cardinality {} resolved to {}, expected a count",
                        expression, value
                    ))
                })?
            }
            (None, Some(items)) => items.len(),
            (None, None) => {
                return Err(EngineError::ConfigurationError(
                    "Loop characteristics need a cardinality or a collection".to_string(),
                ))
            }
        };

        let mut progress = Self {
            cardinality,
            is_sequential: characteristics.is_sequential,
            next_index: 0,
            running: BTreeSet::new(),
            outputs: BTreeMap::new(),
            elements,
            completed: false,
        };

        let step = if cardinality == 0 {
            progress.completed = true;
            Progress::Complete {
                output: Value::Array(Vec::new()),
                halted: Vec::new(),
            }
        } else if progress.is_sequential {
            progress.running.insert(0);
            progress.next_index = 1;
            Progress::Start(vec![0])
        } else {
            progress.running.extend(0..cardinality);
            progress.next_index = cardinality;
            Progress::Start((0..cardinality).collect())
        };

        debug!(cardinality, sequential = progress.is_sequential, "multi-instance started");
        Ok((progress, step))
    }

    /// Start content of an iteration
    pub(crate) fn iteration_content(
        &self,
        index: usize,
        root_content: &Content,
        characteristics: &LoopCharacteristics,
        parent: &ParentRef,
    ) -> Content {
        let root_execution_id = parent.execution_id.clone().unwrap_or_default();
        let mut content = root_content.clone();
        content.remove("output");
        content.insert("executionId".to_string(), json!(iteration_id(&root_execution_id, index)));
        content.insert("isRootScope".to_string(), json!(false));
        content.insert("isMultiInstance".to_string(), json!(true));
        content.insert("index".to_string(), json!(index));
        content.insert("loopCardinality".to_string(), json!(self.cardinality));
        content.insert("isSequential".to_string(), json!(self.is_sequential));
        content.insert("parent".to_string(), json!(parent));
        if let Some(elements) = &self.elements {
            content.insert(
                characteristics.element_variable.clone(),
                elements.get(index).cloned().unwrap_or(Value::Null),
            );
        }
        content
    }

    /// Record a completed iteration
    pub(crate) fn on_completed(
        &mut self,
        index: usize,
        output: Value,
        iteration_content: &Content,
        characteristics: &LoopCharacteristics,
        environment: &Environment,
    ) -> EngineResult<Progress> {
        if self.completed || !self.running.remove(&index) {
            return Ok(Progress::Wait);
        }
        self.outputs.insert(index, output.clone());

        if let Some(condition) = &characteristics.completion_condition {
            let mut content = iteration_content.clone();
            content.insert("output".to_string(), output);
            let context = json!({ "content": Value::Object(content) });
            if is_truthy(&environment.resolve_expression(condition, &context)?) {
                let halted: Vec<usize> = std::mem::take(&mut self.running).into_iter().collect();
                self.next_index = self.cardinality;
                self.completed = true;
                debug!(index, halted = halted.len(), "completion condition met");
                return Ok(Progress::Complete {
                    output: self.output(),
                    halted,
                });
            }
        }

        Ok(self.advance())
    }

    /// Record a discarded iteration; it contributes no output
    pub(crate) fn on_discarded(&mut self, index: usize) -> Progress {
        if self.completed || !self.running.remove(&index) {
            return Progress::Wait;
        }
        self.advance()
    }

    fn advance(&mut self) -> Progress {
        if self.is_sequential && self.next_index < self.cardinality {
            let index = self.next_index;
            self.next_index += 1;
            self.running.insert(index);
            return Progress::Start(vec![index]);
        }
        if self.running.is_empty() && self.next_index >= self.cardinality {
            self.completed = true;
            return Progress::Complete {
                output: self.output(),
                halted: Vec::new(),
            };
        }
        Progress::Wait
    }

    /// Outputs ordered by index; missing outputs are omitted
    pub fn output(&self) -> Value {
        Value::Array(self.outputs.values().cloned().collect())
    }
}

/// Execution id of an iteration
pub fn iteration_id(root_execution_id: &str, index: usize) -> String {
    format!("{}_{}", root_execution_id, index)
}

/// Iteration index from an execution id of the root
pub fn iteration_index(root_execution_id: &str, execution_id: &str) -> Option<usize> {
    execution_id
        .strip_prefix(root_execution_id)?
        .strip_prefix('_')?
        .parse()
        .ok()
}
