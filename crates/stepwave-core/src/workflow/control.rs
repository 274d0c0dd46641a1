//! Control-step directives.
//!
//! A control step's expression is a single directive:
//!
//! ```text
//! if <condition>: <continue|break|wait> [<target>];
//! ```
//!
//! The directive is parsed into a small AST up front (so malformed control
//! steps are rejected at registration time), and only the condition is
//! handed to the sandboxed evaluator. When the condition is false the step
//! behaves like an ordinary `proceed`.

use std::fmt;

use serde_json::Value;
use stepwave_types::workflow::{ControlDecision, FlowAction};

use super::evaluator::{EvalError, Evaluator};

/// Errors produced while parsing a control directive.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ControlParseError {
    #[error("control directive must start with 'if'")]
    MissingIf,

    #[error("control directive has no ':<action>' clause")]
    MissingAction,

    #[error("control directive has an empty condition")]
    EmptyCondition,

    #[error("'continue' requires a target step")]
    MissingTarget,

    #[error("unexpected trailing input: '{0}'")]
    TrailingInput(String),
}

/// Action named by a directive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlAction {
    Continue,
    Break,
    Wait,
}

impl ControlAction {
    fn parse(token: &str) -> Option<Self> {
        match token {
            "continue" => Some(ControlAction::Continue),
            "break" => Some(ControlAction::Break),
            "wait" => Some(ControlAction::Wait),
            _ => None,
        }
    }

    fn flow_action(self) -> FlowAction {
        match self {
            ControlAction::Continue => FlowAction::Continue,
            ControlAction::Break => FlowAction::Break,
            ControlAction::Wait => FlowAction::Wait,
        }
    }
}

impl fmt::Display for ControlAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ControlAction::Continue => "continue",
            ControlAction::Break => "break",
            ControlAction::Wait => "wait",
        })
    }
}

/// Parsed control directive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlDirective {
    pub condition: String,
    pub action: ControlAction,
    pub target: Option<String>,
}

/// Parse `if <condition>: <action> [<target>];`.
///
/// The condition may itself contain `:` (JEXL ternaries), so the split
/// point is the last `:` whose right-hand side is a well-formed action
/// clause.
pub fn parse_directive(source: &str) -> Result<ControlDirective, ControlParseError> {
    let trimmed = source.trim();
    let trimmed = trimmed.strip_suffix(';').unwrap_or(trimmed).trim_end();

    let rest = trimmed
        .strip_prefix("if")
        .filter(|r| r.starts_with(char::is_whitespace) || r.starts_with('('))
        .ok_or(ControlParseError::MissingIf)?;

    let mut trailing: Option<String> = None;
    for (pos, _) in rest.rmatch_indices(':') {
        let clause = rest[pos + 1..].trim();
        let mut tokens = clause.split_whitespace();
        let Some(action) = tokens.next().and_then(ControlAction::parse) else {
            continue;
        };
        let target = tokens.next().map(str::to_string);
        let extra: Vec<&str> = tokens.collect();
        if !extra.is_empty() {
            trailing.get_or_insert_with(|| extra.join(" "));
            continue;
        }

        let condition = rest[..pos].trim();
        if condition.is_empty() {
            return Err(ControlParseError::EmptyCondition);
        }
        if action == ControlAction::Continue && target.is_none() {
            return Err(ControlParseError::MissingTarget);
        }
        return Ok(ControlDirective {
            condition: condition.to_string(),
            action,
            target,
        });
    }

    Err(match trailing {
        Some(extra) => ControlParseError::TrailingInput(extra),
        None => ControlParseError::MissingAction,
    })
}

/// Evaluate a directive's condition and produce the scheduler decision.
pub async fn evaluate_directive<E: Evaluator>(
    directive: &ControlDirective,
    context: &Value,
    evaluator: &E,
) -> Result<ControlDecision, EvalError> {
    let met = evaluator
        .eval_condition(&directive.condition, context)
        .await?;

    if !met {
        return Ok(ControlDecision::proceed());
    }

    Ok(ControlDecision {
        action: directive.action.flow_action(),
        target_step: directive.target.clone(),
        condition_met: true,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::evaluator::JexlEvaluator;
    use serde_json::json;

    #[test]
    fn test_parse_continue_with_target() {
        let d = parse_directive("if x > 5: continue c;").unwrap();
        assert_eq!(d.condition, "x > 5");
        assert_eq!(d.action, ControlAction::Continue);
        assert_eq!(d.target.as_deref(), Some("c"));
    }

    #[test]
    fn test_parse_break_and_wait_without_target() {
        let d = parse_directive("if done == true: break;").unwrap();
        assert_eq!(d.action, ControlAction::Break);
        assert!(d.target.is_none());

        let d = parse_directive("  if pending|length > 0 : wait  ").unwrap();
        assert_eq!(d.action, ControlAction::Wait);
        assert_eq!(d.condition, "pending|length > 0");
    }

    #[test]
    fn test_parse_condition_with_ternary_colon() {
        let d = parse_directive("if (x > 5 ? 'hi' : 'lo') == 'hi': break;").unwrap();
        assert_eq!(d.condition, "(x > 5 ? 'hi' : 'lo') == 'hi'");
        assert_eq!(d.action, ControlAction::Break);
    }

    #[test]
    fn test_parse_errors() {
        assert_eq!(
            parse_directive("x > 5: break;"),
            Err(ControlParseError::MissingIf)
        );
        assert_eq!(
            parse_directive("iffy > 5: break;"),
            Err(ControlParseError::MissingIf)
        );
        assert_eq!(
            parse_directive("if x > 5: jump c;"),
            Err(ControlParseError::MissingAction)
        );
        assert_eq!(
            parse_directive("if : break;"),
            Err(ControlParseError::EmptyCondition)
        );
        assert_eq!(
            parse_directive("if x > 5: continue;"),
            Err(ControlParseError::MissingTarget)
        );
        assert_eq!(
            parse_directive("if x > 5: continue c d;"),
            Err(ControlParseError::TrailingInput("d".to_string()))
        );
    }

    #[tokio::test]
    async fn test_evaluate_condition_true() {
        let d = parse_directive("if x > 5: continue c;").unwrap();
        let decision = evaluate_directive(&d, &json!({"x": 10}), &JexlEvaluator::new())
            .await
            .unwrap();
        assert_eq!(decision.action, FlowAction::Continue);
        assert_eq!(decision.target_step.as_deref(), Some("c"));
        assert!(decision.condition_met);
    }

    #[tokio::test]
    async fn test_evaluate_condition_false_proceeds() {
        let d = parse_directive("if x > 5: break;").unwrap();
        let decision = evaluate_directive(&d, &json!({"x": 1}), &JexlEvaluator::new())
            .await
            .unwrap();
        assert_eq!(decision, ControlDecision::proceed());
    }
}
