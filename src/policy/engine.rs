//! Rego policy engine.
//!
//! The engine compiles the policy module once at startup into an immutable
//! [`PolicyBundle`]; preparation binds a named query
//! (`data.policies.<name>`) ahead of time so per-request work is limited to
//! cloning the compiled engine, setting the input document, and evaluating
//! the rule.
//!
//! A custom built-in `get_header(name, headers)` is registered on every
//! engine: it performs a case-insensitive lookup over a headers map and
//! returns the first value, or the empty string.

use std::collections::HashMap;
use std::sync::Arc;

use regorus::{Engine, Value};
use tracing::{debug, info};

use super::{partial, sanitize_policy_name, PolicyModule, ResidualQuery};
use crate::error::AuthgateError;

/// An immutable, compiled policy bundle shared across all requests.
#[derive(Clone)]
pub struct PolicyBundle {
    engine: Engine,
    module: Arc<PolicyModule>,
}

impl PolicyBundle {
    /// Compile the policy module.
    ///
    /// # Errors
    ///
    /// Returns `AuthgateError::Compile` describing the first syntactic or
    /// semantic error in the module.
    pub fn compile(module: PolicyModule) -> Result<Self, AuthgateError> {
        let mut engine = Engine::new();

        engine
            .add_policy(module.name.clone(), module.content.clone())
            .map_err(|e| AuthgateError::Compile {
                details: e.to_string(),
            })?;

        engine
            .add_extension("get_header".to_string(), 2, Box::new(get_header_builtin))
            .map_err(|e| AuthgateError::Compile {
                details: format!("failed to register get_header built-in: {e}"),
            })?;

        info!(module = %module.name, "Policy module compiled");

        Ok(Self {
            engine,
            module: Arc::new(module),
        })
    }

    /// Prepare an evaluator for the named top-level query.
    ///
    /// The policy name is sanitized (`.` → `_`) before binding, so the
    /// configuration name `foo.bar` targets `data.policies.foo_bar`.
    ///
    /// # Errors
    ///
    /// Returns `AuthgateError::Compile` if the module declares no rule with
    /// the sanitized name.
    pub fn prepare(&self, policy_name: &str) -> Result<PolicyEvaluator, AuthgateError> {
        let rule_name = sanitize_policy_name(policy_name);
        if !self.declares_rule(&rule_name) {
            return Err(AuthgateError::Compile {
                details: format!("policy module declares no rule named '{rule_name}'"),
            });
        }

        Ok(PolicyEvaluator {
            query: format!("data.policies.{rule_name}"),
            rule_name,
            engine: self.engine.clone(),
            module: self.module.clone(),
        })
    }

    fn declares_rule(&self, rule_name: &str) -> bool {
        let pattern = format!(
            r"(?m)^\s*(?:default\s+)?{}\s*(?:\{{|=|:=|if\b|\[)",
            regex::escape(rule_name)
        );
        match regex::Regex::new(&pattern) {
            Ok(re) => re.is_match(&self.module.content),
            Err(_) => false,
        }
    }
}

/// A prepared evaluator for one named policy query. Immutable and safe for
/// concurrent reuse; every evaluation clones the compiled engine.
#[derive(Clone)]
pub struct PolicyEvaluator {
    query: String,
    rule_name: String,
    engine: Engine,
    module: Arc<PolicyModule>,
}

impl PolicyEvaluator {
    /// Name of the rule this evaluator targets (already sanitized).
    pub fn rule_name(&self) -> &str {
        &self.rule_name
    }

    /// Evaluate the query in allow mode: true iff the query yields at
    /// least one truthy result for `input`. An undefined rule yields no
    /// results and therefore denies.
    ///
    /// # Errors
    ///
    /// Returns `AuthgateError::PolicyRuntime` on evaluation exceptions.
    pub fn evaluate_allow(&self, input: &serde_json::Value) -> Result<bool, AuthgateError> {
        let mut engine = self.engine.clone();
        engine.set_input(self.input_value(input)?);

        let results = engine
            .eval_query(self.query.clone(), false)
            .map_err(|e| AuthgateError::PolicyRuntime {
                policy: self.rule_name.clone(),
                details: e.to_string(),
            })?;

        let allowed = results.result.iter().any(|result| {
            result
                .expressions
                .iter()
                .any(|expression| is_truthy(&expression.value))
        });
        if !allowed {
            debug!(policy = %self.rule_name, "Policy query yielded no truthy result");
        }
        Ok(allowed)
    }

    /// Evaluate the query in partial mode: substitute the known input and
    /// return the residual query over the unknown `data.resources`.
    ///
    /// # Errors
    ///
    /// Returns `AuthgateError::PolicyRuntime` if the rule uses constructs
    /// outside the supported filter subset.
    pub fn evaluate_partial(
        &self,
        input: &serde_json::Value,
    ) -> Result<ResidualQuery, AuthgateError> {
        partial::evaluate_partial(&self.module.content, &self.rule_name, input)
    }

    fn input_value(&self, input: &serde_json::Value) -> Result<Value, AuthgateError> {
        Value::from_json_str(&input.to_string()).map_err(|e| AuthgateError::PolicyRuntime {
            policy: self.rule_name.clone(),
            details: format!("invalid input document: {e}"),
        })
    }
}

/// The compiled evaluator cache: one prepared evaluator per policy name
/// referenced by the route specification. Built once at startup.
#[derive(Clone, Default)]
pub struct EvaluatorSet {
    evaluators: HashMap<String, PolicyEvaluator>,
}

impl EvaluatorSet {
    /// Prepare evaluators for every (non-empty) policy name in `names`.
    ///
    /// # Errors
    ///
    /// Returns `AuthgateError::Compile` if any referenced rule is missing
    /// from the module; startup should abort in that case.
    pub fn prepare<I>(bundle: &PolicyBundle, names: I) -> Result<Self, AuthgateError>
    where
        I: IntoIterator<Item = String>,
    {
        let mut evaluators = HashMap::new();
        for name in names {
            if name.is_empty() {
                continue;
            }
            let key = sanitize_policy_name(&name);
            if evaluators.contains_key(&key) {
                continue;
            }
            let evaluator = bundle.prepare(&name)?;
            evaluators.insert(key, evaluator);
        }
        info!(count = evaluators.len(), "Prepared policy evaluators");
        Ok(Self { evaluators })
    }

    /// Look up the prepared evaluator for a policy name.
    pub fn get(&self, policy_name: &str) -> Option<&PolicyEvaluator> {
        self.evaluators.get(&sanitize_policy_name(policy_name))
    }

    pub fn len(&self) -> usize {
        self.evaluators.len()
    }

    pub fn is_empty(&self) -> bool {
        self.evaluators.is_empty()
    }
}

fn is_truthy(value: &Value) -> bool {
    !matches!(value, Value::Bool(false) | Value::Null | Value::Undefined)
}

/// `get_header(name, headers)` built-in: case-insensitive lookup, first
/// value wins, empty string when absent. Header values may be either a
/// plain string or an array of strings.
fn get_header_builtin(params: Vec<Value>) -> anyhow::Result<Value> {
    let name = match params.first() {
        Some(Value::String(s)) => s.to_string(),
        _ => return Ok(Value::from("")),
    };

    if let Some(Value::Object(headers)) = params.get(1) {
        for (key, value) in headers.iter() {
            let Value::String(key) = key else { continue };
            if !key.eq_ignore_ascii_case(&name) {
                continue;
            }
            return Ok(match value {
                Value::Array(values) => values
                    .first()
                    .cloned()
                    .unwrap_or_else(|| Value::from("")),
                Value::String(_) => value.clone(),
                _ => Value::from(""),
            });
        }
    }

    Ok(Value::from(""))
}
