//! Action registry.
//!
//! Per-gateway configuration mapping action names to a description, a
//! minimum reputation score, a parameter schema, and a handler. The public
//! view strips handlers; validation reports every violation rather than
//! stopping at the first.

use crate::error::Error;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// Parameter types accepted by action schemas.
///
/// `array` and `object` are distinct types; an array never satisfies an
/// `object` parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParamType {
    String,
    Number,
    Boolean,
    Object,
    Array,
}

impl ParamType {
    /// Whether a JSON value inhabits this type.
    pub fn matches(&self, value: &Value) -> bool {
        match self {
            ParamType::String => value.is_string(),
            ParamType::Number => value.is_number(),
            ParamType::Boolean => value.is_boolean(),
            ParamType::Object => value.is_object(),
            ParamType::Array => value.is_array(),
        }
    }

    /// Schema name of a JSON value, for violation messages.
    pub fn name_of(value: &Value) -> &'static str {
        match value {
            Value::Null => "null",
            Value::Bool(_) => "boolean",
            Value::Number(_) => "number",
            Value::String(_) => "string",
            Value::Array(_) => "array",
            Value::Object(_) => "object",
        }
    }
}

impl fmt::Display for ParamType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ParamType::String => "string",
            ParamType::Number => "number",
            ParamType::Boolean => "boolean",
            ParamType::Object => "object",
            ParamType::Array => "array",
        };
        f.write_str(s)
    }
}

/// Schema of one action parameter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParamSpec {
    /// Expected JSON type.
    #[serde(rename = "type")]
    pub param_type: ParamType,
    /// Whether the parameter must be present.
    pub required: bool,
    /// Human-readable description.
    pub description: String,
}

/// Identity of the agent executing an action, taken from its certificate.
#[derive(Debug, Clone)]
pub struct AgentContext {
    /// Internal agent UUID (`sub` claim).
    pub agent_id: String,
    /// Developer-scoped external id.
    pub external_id: String,
    /// Owning developer UUID.
    pub developer_id: String,
    /// Reputation score captured at issuance.
    pub score: i64,
}

/// Handler invoked when an action executes.
///
/// Errors returned here are trapped by the registry; the message becomes
/// the execution error string.
pub type ActionHandler =
    Arc<dyn Fn(&Map<String, Value>, &AgentContext) -> Result<Value, String> + Send + Sync>;

/// One registered action.
#[derive(Clone)]
pub struct ActionDef {
    /// Human-readable description.
    pub description: String,
    /// Minimum reputation score required to execute.
    pub min_score: i64,
    /// Parameter schema, keyed by parameter name.
    pub params: BTreeMap<String, ParamSpec>,
    handler: ActionHandler,
}

impl fmt::Debug for ActionDef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActionDef")
            .field("description", &self.description)
            .field("min_score", &self.min_score)
            .field("params", &self.params)
            .finish()
    }
}

impl ActionDef {
    /// Create an action with a description, score threshold, and handler.
    pub fn new<F>(description: impl Into<String>, min_score: i64, handler: F) -> Self
    where
        F: Fn(&Map<String, Value>, &AgentContext) -> Result<Value, String> + Send + Sync + 'static,
    {
        Self {
            description: description.into(),
            min_score,
            params: BTreeMap::new(),
            handler: Arc::new(handler),
        }
    }

    /// Add a parameter to the schema.
    pub fn with_param(
        mut self,
        name: impl Into<String>,
        param_type: ParamType,
        required: bool,
        description: impl Into<String>,
    ) -> Self {
        self.params.insert(
            name.into(),
            ParamSpec {
                param_type,
                required,
                description: description.into(),
            },
        );
        self
    }
}

/// Public view of an action: everything but the handler.
#[derive(Debug, Clone, Serialize)]
pub struct ActionView {
    /// Action name.
    pub name: String,
    /// Human-readable description.
    pub description: String,
    /// Minimum reputation score required to execute.
    #[serde(rename = "minScore")]
    pub min_score: i64,
    /// Parameter schema.
    pub parameters: BTreeMap<String, ParamSpec>,
}

/// Outcome of an execution attempt.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionResult {
    /// Whether the handler ran and returned a value.
    pub success: bool,
    /// Handler result on success.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    /// Error string on failure.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ExecutionResult {
    fn ok(data: Value) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    fn fail(error: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(error.into()),
        }
    }
}

/// The per-gateway action map.
#[derive(Debug, Clone, Default)]
pub struct ActionRegistry {
    actions: BTreeMap<String, ActionDef>,
}

impl ActionRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an action under a name, replacing any previous definition.
    pub fn register(&mut self, name: impl Into<String>, def: ActionDef) {
        self.actions.insert(name.into(), def);
    }

    /// Whether an action is registered.
    pub fn contains(&self, name: &str) -> bool {
        self.actions.contains_key(name)
    }

    /// Registered action names, sorted.
    pub fn names(&self) -> Vec<String> {
        self.actions.keys().cloned().collect()
    }

    /// The score threshold for an action, if registered.
    pub fn min_score(&self, name: &str) -> Option<i64> {
        self.actions.get(name).map(|a| a.min_score)
    }

    /// Public view of all actions, handlers stripped.
    pub fn list(&self) -> Vec<ActionView> {
        self.actions
            .iter()
            .map(|(name, def)| ActionView {
                name: name.clone(),
                description: def.description.clone(),
                min_score: def.min_score,
                parameters: def.params.clone(),
            })
            .collect()
    }

    /// Validate parameters against an action's schema.
    ///
    /// Returns an ordered list of violations: missing required fields,
    /// then type mismatches, then unknown parameter names.
    pub fn validate(&self, name: &str, params: &Map<String, Value>) -> Vec<String> {
        let Some(def) = self.actions.get(name) else {
            return vec![format!("unknown action: {name}")];
        };

        let mut violations = Vec::new();

        for (param, spec) in &def.params {
            if spec.required && !params.contains_key(param) {
                violations.push(format!("missing required parameter: {param}"));
            }
        }

        for (param, spec) in &def.params {
            if let Some(value) = params.get(param) {
                if !spec.param_type.matches(value) {
                    violations.push(format!(
                        "parameter '{}' expected {}, got {}",
                        param,
                        spec.param_type,
                        ParamType::name_of(value)
                    ));
                }
            }
        }

        for supplied in params.keys() {
            if !def.params.contains_key(supplied) {
                violations.push(format!("unknown parameter: {supplied}"));
            }
        }

        violations
    }

    /// Execute an action for an agent.
    ///
    /// Fails without running the handler on: unknown action, score below
    /// the threshold, or validation violations. Handler errors are trapped
    /// and surfaced as the error string.
    pub fn execute(
        &self,
        name: &str,
        params: &Map<String, Value>,
        ctx: &AgentContext,
    ) -> ExecutionResult {
        let Some(def) = self.actions.get(name) else {
            return ExecutionResult::fail(format!("unknown action: {name}"));
        };

        if ctx.score < def.min_score {
            return ExecutionResult::fail(
                Error::InsufficientScore {
                    score: ctx.score,
                    required: def.min_score,
                }
                .to_string(),
            );
        }

        let violations = self.validate(name, params);
        if !violations.is_empty() {
            return ExecutionResult::fail(format!(
                "parameter validation failed: {}",
                violations.join("; ")
            ));
        }

        match (def.handler)(params, ctx) {
            Ok(data) => ExecutionResult::ok(data),
            Err(message) => ExecutionResult::fail(message),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ctx(score: i64) -> AgentContext {
        AgentContext {
            agent_id: "agent-1".to_string(),
            external_id: "crawler-7".to_string(),
            developer_id: "dev-1".to_string(),
            score,
        }
    }

    fn search_registry() -> ActionRegistry {
        let mut registry = ActionRegistry::new();
        registry.register(
            "search",
            ActionDef::new("Search the index", 30, |params, _ctx| {
                let query = params
                    .get("query")
                    .and_then(Value::as_str)
                    .ok_or_else(|| "query missing".to_string())?;
                Ok(json!([query]))
            })
            .with_param("query", ParamType::String, true, "Search query")
            .with_param("limit", ParamType::Number, false, "Max results"),
        );
        registry
    }

    fn params(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_list_strips_handlers() {
        let registry = search_registry();
        let listed = registry.list();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].name, "search");
        assert_eq!(listed[0].min_score, 30);
        assert!(listed[0].parameters.contains_key("query"));
    }

    #[test]
    fn test_validate_reports_all_violations_in_order() {
        let registry = search_registry();
        let violations = registry.validate(
            "search",
            &params(json!({"limit": "five", "verbose": true})),
        );
        assert_eq!(
            violations,
            vec![
                "missing required parameter: query",
                "parameter 'limit' expected number, got string",
                "unknown parameter: verbose",
            ]
        );
    }

    #[test]
    fn test_validate_distinguishes_array_from_object() {
        let mut registry = ActionRegistry::new();
        registry.register(
            "ingest",
            ActionDef::new("Ingest a document", 0, |_p, _c| Ok(Value::Null))
                .with_param("doc", ParamType::Object, true, "Document body"),
        );
        let violations = registry.validate("ingest", &params(json!({"doc": [1, 2]})));
        assert_eq!(violations, vec!["parameter 'doc' expected object, got array"]);
    }

    #[test]
    fn test_execute_happy_path() {
        let registry = search_registry();
        let result = registry.execute("search", &params(json!({"query": "x"})), &ctx(50));
        assert!(result.success);
        assert_eq!(result.data, Some(json!(["x"])));
    }

    #[test]
    fn test_execute_score_gate() {
        let registry = search_registry();
        let mut gated = search_registry();
        gated.register(
            "order",
            ActionDef::new("Place an order", 60, |_p, _c| Ok(Value::Null)),
        );
        let result = gated.execute("order", &params(json!({})), &ctx(50));
        assert!(!result.success);
        assert_eq!(
            result.error.as_deref(),
            Some("Insufficient reputation score: 50 < 60")
        );
        // The lower-threshold action still runs.
        assert!(registry
            .execute("search", &params(json!({"query": "x"})), &ctx(50))
            .success);
    }

    #[test]
    fn test_execute_unknown_action() {
        let registry = search_registry();
        let result = registry.execute("checkout", &params(json!({})), &ctx(90));
        assert!(!result.success);
        assert_eq!(result.error.as_deref(), Some("unknown action: checkout"));
    }

    #[test]
    fn test_handler_error_is_trapped() {
        let mut registry = ActionRegistry::new();
        registry.register(
            "explode",
            ActionDef::new("Always fails", 0, |_p, _c| {
                Err("backend unavailable".to_string())
            }),
        );
        let result = registry.execute("explode", &params(json!({})), &ctx(90));
        assert!(!result.success);
        assert_eq!(result.error.as_deref(), Some("backend unavailable"));
    }
}
