//! Task assertions and the checklist evaluator.

pub mod expr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::{HarnessError, HarnessResult};
use crate::primitive::Termination;
use expr::{is_lambda, loose_eq, truthy, Lambda};

/// Assertion type checked against the episode's termination instead of
/// the application state.
pub const EARLY_STOP: &str = "stop";

const NEAR_TOLERANCE: f64 = 1e-6;

#[derive(Debug, Clone, PartialEq)]
pub enum KeySource {
    Field(String),
    Derived(Lambda),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Predicate {
    Eq,
    Ne,
    IsNear,
    Contains,
    Custom(Lambda),
}

impl Predicate {
    fn parse(src: Option<&str>) -> HarnessResult<Self> {
        Ok(match src.map(str::trim) {
            None | Some("") | Some("eq") => Self::Eq,
            Some("ne") => Self::Ne,
            Some("is_near") => Self::IsNear,
            Some("contains") => Self::Contains,
            Some(s) if is_lambda(s) => Self::Custom(Lambda::parse(s)?),
            Some(other) => {
                return Err(HarnessError::Expression(format!("unknown predicate '{other}'")))
            }
        })
    }

    fn holds(&self, left: &Value, right: &Value) -> HarnessResult<bool> {
        match self {
            Self::Eq => Ok(loose_eq(left, right)),
            Self::Ne => Ok(!loose_eq(left, right)),
            Self::IsNear => {
                let num = |v: &Value| match v {
                    Value::Number(n) => n.as_f64(),
                    Value::String(s) => s.trim().parse().ok(),
                    _ => None,
                };
                match (num(left), num(right)) {
                    (Some(l), Some(r)) => Ok((l - r).abs() <= NEAR_TOLERANCE),
                    _ => Err(HarnessError::Expression(format!("is_near needs numbers, got {left} and {right}"))),
                }
            }
            Self::Contains => match (left, right) {
                (Value::String(l), Value::String(r)) => Ok(l.contains(r.as_str())),
                (Value::Array(items), r) => Ok(items.iter().any(|x| loose_eq(x, r))),
                _ => Err(HarnessError::Expression(format!("{left} cannot contain {right}"))),
            },
            Self::Custom(lambda) => lambda.call(&[left, right]).map(|v| truthy(&v)),
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawAssertion {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    key: String,
    #[serde(default)]
    value: Value,
    #[serde(default)]
    pred: Option<String>,
    #[serde(default)]
    args: Option<Value>,
}

/// One checklist item from a task's `evaluate` list, compiled at load.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(try_from = "RawAssertion")]
pub struct TaskAssertion {
    pub kind: String,
    pub key: String,
    pub source: KeySource,
    pub predicate: Predicate,
    pub value: Value,
    pub args: Option<Value>,
}

impl TryFrom<RawAssertion> for TaskAssertion {
    type Error = HarnessError;

    fn try_from(raw: RawAssertion) -> Result<Self, Self::Error> {
        let source = if is_lambda(&raw.key) {
            KeySource::Derived(Lambda::parse(&raw.key)?)
        } else {
            KeySource::Field(raw.key.clone())
        };
        Ok(Self {
            predicate: Predicate::parse(raw.pred.as_deref())?,
            kind: raw.kind,
            key: raw.key,
            source,
            value: raw.value,
            args: raw.args,
        })
    }
}

impl TaskAssertion {
    pub fn is_stop(&self) -> bool {
        self.kind == EARLY_STOP
    }

    fn resolve(&self, state: &Value) -> HarnessResult<Value> {
        match &self.source {
            KeySource::Field(name) => state
                .get(name)
                .cloned()
                .ok_or_else(|| HarnessError::Expression(format!("missing key '{name}'"))),
            KeySource::Derived(lambda) => lambda.call(&[state]),
        }
    }

    fn check(&self, state: &Value) -> HarnessResult<bool> {
        let left = self.resolve(state)?;
        self.predicate.holds(&left, &self.value)
    }

    fn check_stop(&self, termination: Option<&Termination>) -> Result<(), String> {
        let Some(termination) = termination else {
            return Err("episode did not terminate".into());
        };
        let expected = self.value.as_str().unwrap_or_default();
        let actual = termination.primitive().name();
        if expected != actual {
            return Err(format!("expected {expected}, got {actual}"));
        }
        if let Termination::Answer(answer) = termination {
            if let Some(args) = &self.args {
                let wanted = answer_text(args);
                if wanted != *answer {
                    return Err(format!("answer '{answer}' != '{wanted}'"));
                }
            }
        }
        Ok(())
    }
}

/// `ANS` arguments are space-joined; task files may give a list or a string.
fn answer_text(args: &Value) -> String {
    match args {
        Value::String(s) => s.clone(),
        Value::Array(items) => items
            .iter()
            .map(|v| v.as_str().map(str::to_string).unwrap_or_else(|| v.to_string()))
            .collect::<Vec<_>>()
            .join(" "),
        other => other.to_string(),
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AssertionFailure {
    pub index: usize,
    pub kind: String,
    pub key: String,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EvalReport {
    pub passed: bool,
    pub failure: Option<AssertionFailure>,
}

impl EvalReport {
    fn pass() -> Self {
        Self { passed: true, failure: None }
    }

    fn fail(index: usize, assertion: &TaskAssertion, reason: impl Into<String>) -> Self {
        let reason = reason.into();
        tracing::info!(
            index,
            reason = %reason,
            "Evaluation failed at {} of {}",
            assertion.kind,
            assertion.key
        );
        Self {
            passed: false,
            failure: Some(AssertionFailure {
                index,
                kind: assertion.kind.clone(),
                key: assertion.key.clone(),
                reason,
            }),
        }
    }
}

/// True if any assertion reads application state.
pub fn needs_state(assertions: &[TaskAssertion]) -> bool {
    assertions.iter().any(|a| !a.is_stop())
}

/// Ordered AND over the state assertions; stops at the first failure.
pub fn evaluate(assertions: &[TaskAssertion], live_state: &Value) -> EvalReport {
    for (index, assertion) in assertions.iter().enumerate().filter(|(_, a)| !a.is_stop()) {
        match assertion.check(live_state) {
            Ok(true) => {}
            Ok(false) => {
                let reason = format!("predicate failed against {}", assertion.value);
                return EvalReport::fail(index, assertion, reason);
            }
            Err(e) => return EvalReport::fail(index, assertion, e.to_string()),
        }
    }
    EvalReport::pass()
}

/// Checks only the `stop` assertions against how the episode ended.
pub fn check_termination(assertions: &[TaskAssertion], termination: Option<&Termination>) -> EvalReport {
    for (index, assertion) in assertions.iter().enumerate().filter(|(_, a)| a.is_stop()) {
        if let Err(reason) = assertion.check_stop(termination) {
            return EvalReport::fail(index, assertion, reason);
        }
    }
    EvalReport::pass()
}

/// Full verdict: termination first, then state when any assertion needs it.
pub fn evaluate_episode(
    assertions: &[TaskAssertion],
    termination: Option<&Termination>,
    live_state: Option<&Value>,
) -> EvalReport {
    let report = check_termination(assertions, termination);
    if !report.passed || !needs_state(assertions) {
        return report;
    }
    if let Some(state) = live_state {
        return evaluate(assertions, state);
    }
    match assertions.iter().enumerate().find(|(_, a)| !a.is_stop()) {
        Some((index, first)) => EvalReport::fail(index, first, "application state unavailable"),
        None => report,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn assertions(v: Value) -> Vec<TaskAssertion> {
        serde_json::from_value(v).unwrap()
    }

    #[test]
    fn direct_key_equality() {
        let checks = assertions(json!([{"type": "value", "key": "zoom_level", "value": 5}]));
        assert!(evaluate(&checks, &json!({"zoom_level": 5})).passed);

        let report = evaluate(&checks, &json!({"zoom_level": 4}));
        assert!(!report.passed);
        assert_eq!(report.failure.unwrap().key, "zoom_level");
    }

    #[test]
    fn first_failure_is_reported() {
        let checks = assertions(json!([
            {"type": "a", "key": "x", "value": 1},
            {"type": "b", "key": "y", "value": 2},
            {"type": "c", "key": "z", "value": 3}
        ]));
        let report = evaluate(&checks, &json!({"x": 1, "y": 0, "z": 0}));
        assert_eq!(report.failure.unwrap().index, 1);
    }

    #[test]
    fn lambda_keys_and_predicates() {
        let checks = assertions(json!([{
            "type": "position",
            "key": "lambda info: info['pos'][0]",
            "value": 1.5,
            "pred": "lambda left, right: abs(left - right) < 0.1"
        }]));
        assert!(evaluate(&checks, &json!({"pos": [1.52, 0]})).passed);
        assert!(!evaluate(&checks, &json!({"pos": [2, 0]})).passed);
    }

    #[test]
    fn named_predicates() {
        let checks = assertions(json!([
            {"type": "var", "key": "a", "value": "0.3", "pred": "is_near"},
            {"type": "var", "key": "b", "value": "Moon", "pred": "contains"}
        ]));
        assert!(evaluate(&checks, &json!({"a": 0.3000000001, "b": "Earth Moon"})).passed);
    }

    #[test]
    fn bad_expressions_fail_at_load() {
        let bad: Result<Vec<TaskAssertion>, _> =
            serde_json::from_value(json!([{"type": "x", "key": "lambda i: open('f')", "value": 1}]));
        assert!(bad.is_err());
        let bad: Result<Vec<TaskAssertion>, _> =
            serde_json::from_value(json!([{"type": "x", "key": "k", "value": 1, "pred": "approx"}]));
        assert!(bad.is_err());
    }

    #[test]
    fn runtime_errors_fail_the_report() {
        let checks = assertions(json!([{"type": "value", "key": "missing", "value": 1}]));
        let report = evaluate(&checks, &json!({}));
        assert!(!report.passed);
        assert!(report.failure.unwrap().reason.contains("missing key"));
    }

    #[test]
    fn stop_assertions_check_termination() {
        let checks = assertions(json!([{"type": "stop", "value": "ANS", "args": ["42", "km"]}]));
        assert!(!needs_state(&checks));
        let ok = Termination::Answer("42 km".into());
        assert!(evaluate_episode(&checks, Some(&ok), None).passed);
        let wrong = Termination::Answer("41".into());
        assert!(!evaluate_episode(&checks, Some(&wrong), None).passed);
        assert!(!evaluate_episode(&checks, Some(&Termination::Done), None).passed);
        assert!(!evaluate_episode(&checks, None, None).passed);
    }

    #[test]
    fn state_needed_but_missing() {
        let checks = assertions(json!([
            {"type": "stop", "value": "DONE"},
            {"type": "value", "key": "k", "value": 1}
        ]));
        let report = evaluate_episode(&checks, Some(&Termination::Done), None);
        assert_eq!(report.failure.unwrap().index, 1);
        assert!(evaluate_episode(&checks, Some(&Termination::Done), Some(&json!({"k": 1.0}))).passed);
    }

    #[test]
    fn infeasible_task_passes_on_fail() {
        let checks = assertions(json!([{"type": "stop", "value": "FAIL"}]));
        assert!(evaluate_episode(&checks, Some(&Termination::Fail), None).passed);
        assert!(!evaluate_episode(&checks, Some(&Termination::Timeout), None).passed);
    }
}
