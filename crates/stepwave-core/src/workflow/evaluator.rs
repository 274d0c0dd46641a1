//! Sandboxed evaluation of step bodies and control conditions.
//!
//! The engine only talks to the `Evaluator` trait. `JexlEvaluator` is the
//! shipped implementation: JEXL expressions with a small set of standard
//! transforms, evaluated against a read-only JSON context.
//!
//! Context values are always passed as the evaluation context, never
//! interpolated into expression strings.

use std::future::Future;

use serde_json::{Value, json};

/// Errors that can occur during evaluation.
#[derive(Debug, thiserror::Error)]
pub enum EvalError {
    #[error("expression evaluation failed: {0}")]
    EvalFailed(String),

    #[error("invalid context: {0}")]
    InvalidContext(String),
}

/// Runs function bodies and control conditions.
///
/// Implementations must not mutate anything reachable from `context`.
pub trait Evaluator: Send + Sync {
    /// Evaluate a function body and return its raw result.
    fn run_body(
        &self,
        body: &str,
        context: &Value,
    ) -> impl Future<Output = Result<Value, EvalError>> + Send;

    /// Evaluate a control condition to a boolean.
    fn eval_condition(
        &self,
        condition: &str,
        context: &Value,
    ) -> impl Future<Output = Result<bool, EvalError>> + Send;
}

/// JEXL evaluator with standard transforms pre-registered.
///
/// The underlying `jexl_eval::Evaluator` is built per evaluation, so the
/// struct itself carries no state and is trivially shareable across tasks.
#[derive(Debug, Clone, Copy, Default)]
pub struct JexlEvaluator;

impl JexlEvaluator {
    pub fn new() -> Self {
        Self
    }

    fn build() -> jexl_eval::Evaluator<'static> {
        jexl_eval::Evaluator::new()
            .with_transform("lower", |args: &[Value]| {
                let s = args.first().and_then(|v| v.as_str()).unwrap_or("");
                Ok(json!(s.to_lowercase()))
            })
            .with_transform("upper", |args: &[Value]| {
                let s = args.first().and_then(|v| v.as_str()).unwrap_or("");
                Ok(json!(s.to_uppercase()))
            })
            .with_transform("trim", |args: &[Value]| {
                let s = args.first().and_then(|v| v.as_str()).unwrap_or("");
                Ok(json!(s.trim()))
            })
            .with_transform("split", |args: &[Value]| {
                let s = args.first().and_then(|v| v.as_str()).unwrap_or("");
                let delimiter = args.get(1).and_then(|v| v.as_str()).unwrap_or(",");
                let parts: Vec<&str> = s.split(delimiter).collect();
                Ok(json!(parts))
            })
            .with_transform("not", |args: &[Value]| {
                let val = args.first().cloned().unwrap_or(Value::Null);
                Ok(json!(!truthy(&val)))
            })
            .with_transform("contains", |args: &[Value]| {
                let subject = args.first().and_then(|v| v.as_str()).unwrap_or("");
                let search = args.get(1).and_then(|v| v.as_str()).unwrap_or("");
                Ok(json!(subject.contains(search)))
            })
            .with_transform("startsWith", |args: &[Value]| {
                let subject = args.first().and_then(|v| v.as_str()).unwrap_or("");
                let prefix = args.get(1).and_then(|v| v.as_str()).unwrap_or("");
                Ok(json!(subject.starts_with(prefix)))
            })
            .with_transform("endsWith", |args: &[Value]| {
                let subject = args.first().and_then(|v| v.as_str()).unwrap_or("");
                let suffix = args.get(1).and_then(|v| v.as_str()).unwrap_or("");
                Ok(json!(subject.ends_with(suffix)))
            })
            .with_transform("length", |args: &[Value]| {
                let len = match args.first() {
                    Some(Value::String(s)) => s.chars().count(),
                    Some(Value::Array(a)) => a.len(),
                    Some(Value::Object(o)) => o.len(),
                    _ => 0,
                };
                Ok(json!(len as f64))
            })
    }

    /// Evaluate an expression and return the raw JSON value.
    pub fn evaluate_value(&self, expression: &str, context: &Value) -> Result<Value, EvalError> {
        if !context.is_object() {
            return Err(EvalError::InvalidContext(
                "context must be a JSON object".to_string(),
            ));
        }

        Self::build()
            .eval_in_context(expression, context)
            .map_err(|e| EvalError::EvalFailed(e.to_string()))
    }

    /// Evaluate an expression and coerce the result with JavaScript-like
    /// truthiness.
    pub fn evaluate_bool(&self, expression: &str, context: &Value) -> Result<bool, EvalError> {
        self.evaluate_value(expression, context)
            .map(|value| truthy(&value))
    }
}

impl Evaluator for JexlEvaluator {
    fn run_body(
        &self,
        body: &str,
        context: &Value,
    ) -> impl Future<Output = Result<Value, EvalError>> + Send {
        std::future::ready(self.evaluate_value(body, context))
    }

    fn eval_condition(
        &self,
        condition: &str,
        context: &Value,
    ) -> impl Future<Output = Result<bool, EvalError>> + Send {
        std::future::ready(self.evaluate_bool(condition, context))
    }
}

/// JavaScript-like truthiness.
pub fn truthy(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::Null => false,
        Value::Number(n) => n.as_f64().unwrap_or(0.0) != 0.0,
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}
