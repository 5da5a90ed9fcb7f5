//! Shared environment: settings, variables, expression resolver, scripts
//! and the scoped logger factory.

use std::fmt;
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::RwLock;
use serde_json::{Map, Value};
use tracing::{debug, error, trace, warn};

use crate::config::EngineSettings;
use crate::error::{EngineError, EngineResult};

/// Resolves `${...}` expressions against a JSON context
#[cfg_attr(test, mockall::automock)]
pub trait ExpressionResolver: Send + Sync {
    /// Resolve an expression; strings without `${` are returned as literals
    fn resolve(&self, expression: &str, context: &Value) -> EngineResult<Value>;
}

/// JMESPath backed expression resolver
///
/// `${content.count}` evaluates `content.count`; a string made of a single
/// `${...}` yields the raw JSON result, embedded expressions are
/// interpolated into the surrounding text.
#[derive(Debug, Default, Clone, Copy)]
pub struct JmesPathResolver;

impl JmesPathResolver {
    fn search(path: &str, context: &Value) -> EngineResult<Value> {
        let compiled = jmespath::compile(path.trim()).map_err(|e| {
            EngineError::ExpressionError(format!(
                "Failed to compile JMESPath expression: {}: {}",
                path, e
            ))
        })?;
        let result = compiled.search(context).map_err(|e| {
            EngineError::ExpressionError(format!(
                "Failed to evaluate JMESPath expression: {}: {}",
                path, e
            ))
        })?;
        Ok(serde_json::to_value(&*result)?)
    }
}

impl ExpressionResolver for JmesPathResolver {
    fn resolve(&self, expression: &str, context: &Value) -> EngineResult<Value> {
        let trimmed = expression.trim();
        if let Some(inner) = trimmed
            .strip_prefix("${")
            .and_then(|rest| rest.strip_suffix('}'))
        {
            if !inner.contains("${") {
                return Self::search(inner, context);
            }
        }

        if !expression.contains("${") {
            return Ok(Value::String(expression.to_string()));
        }

        let mut output = String::new();
        let mut rest = expression;
        while let Some(start) = rest.find("${") {
            output.push_str(&rest[..start]);
            let after = &rest[start + 2..];
            let end = after.find('}').ok_or_else(|| {
                EngineError::ExpressionError(format!("Unterminated expression: {}", expression))
            })?;
            match Self::search(&after[..end], context)? {
                Value::String(s) => output.push_str(&s),
                Value::Null => {}
                other => output.push_str(&other.to_string()),
            }
            rest = &after[end + 1..];
        }
        output.push_str(rest);
        Ok(Value::String(output))
    }
}

/// Truthiness of a resolved expression value
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map_or(false, |f| f != 0.0),
        Value::String(s) => !s.is_empty() && s != "false",
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

/// Callback receiving a script result, possibly long after `execute` returned
pub type ScriptCallback = Box<dyn FnOnce(EngineResult<Value>) + Send>;

/// A runnable script, e.g. a sequence flow condition
pub trait Script: Send + Sync {
    /// Run the script with a JSON context; answer through the callback
    fn execute(&self, context: &Value, callback: ScriptCallback);
}

impl<F> Script for F
where
    F: Fn(&Value) -> EngineResult<Value> + Send + Sync,
{
    fn execute(&self, context: &Value, callback: ScriptCallback) {
        callback(self(context))
    }
}

/// Lookup of scripts by owner id
pub trait ScriptRegistry: Send + Sync {
    /// Script registered for the owner, if any
    fn get_script(&self, owner_id: &str) -> Option<Arc<dyn Script>>;
}

/// In-memory script registry
#[derive(Default)]
pub struct MemoryScriptRegistry {
    scripts: DashMap<String, Arc<dyn Script>>,
}

impl MemoryScriptRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a script for an owner id
    pub fn register(&self, owner_id: impl Into<String>, script: Arc<dyn Script>) {
        self.scripts.insert(owner_id.into(), script);
    }
}

impl ScriptRegistry for MemoryScriptRegistry {
    fn get_script(&self, owner_id: &str) -> Option<Arc<dyn Script>> {
        self.scripts.get(owner_id).map(|s| s.value().clone())
    }
}

/// Logger stamping every record with a scope such as an activity id
#[derive(Debug, Clone)]
pub struct Logger {
    scope: String,
}

impl Logger {
    /// Scope name
    pub fn scope(&self) -> &str {
        &self.scope
    }

    /// Trace record
    pub fn trace(&self, message: &str) {
        trace!(scope = %self.scope, "{}", message);
    }

    /// Debug record
    pub fn debug(&self, message: &str) {
        debug!(scope = %self.scope, "{}", message);
    }

    /// Warning record
    pub fn warn(&self, message: &str) {
        warn!(scope = %self.scope, "{}", message);
    }

    /// Error record
    pub fn error(&self, message: &str) {
        error!(scope = %self.scope, "{}", message);
    }
}

/// Environment shared by the activities and flows of one process
pub struct Environment {
    settings: EngineSettings,
    variables: RwLock<Map<String, Value>>,
    expressions: Arc<dyn ExpressionResolver>,
    scripts: Arc<dyn ScriptRegistry>,
}

impl fmt::Debug for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Environment")
            .field("settings", &self.settings)
            .field("variables", &*self.variables.read())
            .finish()
    }
}

impl Default for Environment {
    fn default() -> Self {
        Self::new(EngineSettings::default())
    }
}

impl Environment {
    /// Environment with the JMESPath resolver and an empty script registry
    pub fn new(settings: EngineSettings) -> Self {
        Self {
            settings,
            variables: RwLock::new(Map::new()),
            expressions: Arc::new(JmesPathResolver),
            scripts: Arc::new(MemoryScriptRegistry::new()),
        }
    }

    /// Replace the expression resolver
    pub fn with_expressions(mut self, expressions: Arc<dyn ExpressionResolver>) -> Self {
        self.expressions = expressions;
        self
    }

    /// Replace the script registry
    pub fn with_scripts(mut self, scripts: Arc<dyn ScriptRegistry>) -> Self {
        self.scripts = scripts;
        self
    }

    /// Seed environment variables
    pub fn with_variables(self, variables: Map<String, Value>) -> Self {
        *self.variables.write() = variables;
        self
    }

    /// Engine settings
    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    /// Copy of the environment variables
    pub fn variables(&self) -> Map<String, Value> {
        self.variables.read().clone()
    }

    /// Set a single variable
    pub fn set_variable(&self, name: impl Into<String>, value: Value) {
        self.variables.write().insert(name.into(), value);
    }

    /// Expression resolver
    pub fn expressions(&self) -> &Arc<dyn ExpressionResolver> {
        &self.expressions
    }

    /// Script registry
    pub fn scripts(&self) -> &Arc<dyn ScriptRegistry> {
        &self.scripts
    }

    /// Resolve an expression with `{environment: {variables}}` merged into the context
    pub fn resolve_expression(&self, expression: &str, context: &Value) -> EngineResult<Value> {
        let mut scope = match context {
            Value::Object(map) => map.clone(),
            Value::Null => Map::new(),
            other => {
                let mut map = Map::new();
                map.insert("value".to_string(), other.clone());
                map
            }
        };
        scope
            .entry("environment".to_string())
            .or_insert_with(|| serde_json::json!({ "variables": self.variables() }));
        self.expressions.resolve(expression, &Value::Object(scope))
    }

    /// Logger for a scope
    pub fn logger(&self, scope: impl Into<String>) -> Logger {
        Logger {
            scope: scope.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_resolve_whole_expression_returns_raw_value() {
        let resolver = JmesPathResolver;
        let context = json!({"content": {"count": 3}});
        assert_eq!(resolver.resolve("${content.count}", &context).unwrap(), json!(3));
    }

    #[test]
    fn test_resolve_literal_and_interpolation() {
        let resolver = JmesPathResolver;
        let context = json!({"name": "world"});
        assert_eq!(resolver.resolve("plain", &context).unwrap(), json!("plain"));
        assert_eq!(
            resolver.resolve("hello ${name}!", &context).unwrap(),
            json!("hello world!")
        );
    }

    #[test]
    fn test_resolve_invalid_expression() {
        let resolver = JmesPathResolver;
        let result = resolver.resolve("${content.[}", &json!({}));
        assert!(matches!(result, Err(EngineError::ExpressionError(_))));
    }

    #[test]
    fn test_environment_variables_in_scope() {
        let environment = Environment::default();
        environment.set_variable("limit", json!(2));
        let value = environment
            .resolve_expression("${environment.variables.limit}", &json!({}))
            .unwrap();
        assert_eq!(value, json!(2));
    }

    #[test]
    fn test_mocked_resolver() {
        let mut resolver = MockExpressionResolver::new();
        resolver
            .expect_resolve()
            .withf(|expression, _| expression == "${ok}")
            .times(1)
            .returning(|_, _| Ok(json!(true)));

        let environment = Environment::default().with_expressions(Arc::new(resolver));
        assert_eq!(environment.resolve_expression("${ok}", &json!({})).unwrap(), json!(true));
    }

    #[test]
    fn test_script_registry() {
        let registry = MemoryScriptRegistry::new();
        registry.register(
            "flow1",
            Arc::new(|context: &Value| {
                Ok::<_, EngineError>(json!(context["content"]["go"] == json!(true)))
            }),
        );

        let script = registry.get_script("flow1").unwrap();
        let result = Arc::new(parking_lot::Mutex::new(None));
        let sink = result.clone();
        script.execute(
            &json!({"content": {"go": true}}),
            Box::new(move |value| *sink.lock() = Some(value)),
        );
        assert_eq!(*result.lock(), Some(Ok(json!(true))));
        assert!(registry.get_script("flow2").is_none());
    }

    #[test]
    fn test_truthiness() {
        assert!(is_truthy(&json!(true)));
        assert!(is_truthy(&json!(1)));
        assert!(!is_truthy(&json!(0)));
        assert!(!is_truthy(&json!("")));
        assert!(!is_truthy(&json!(null)));
        assert!(!is_truthy(&json!([])));
    }
}
