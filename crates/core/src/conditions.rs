//! Predicate DSL shared by flow routing (`trigger_conditions`) and
//! per-step skip logic (`skip_conditions`).
//!
//! Source rows carry conditions as a flat JSON map whose keys embed
//! the operator as a suffix (`amount_gte`, `region_in`, ...). The map
//! is parsed into tagged [`ConditionOp`] variants once at load time;
//! evaluation is pure, does no string parsing and never fails — a
//! malformed operand simply never matches.

use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::domain::request::Context;

/// Operator suffixes in match order. Longer suffixes first so that
/// `_not_in` is not mistaken for `_in`.
const SUFFIXES: [&str; 10] =
    ["_not_in", "_contains", "_exists", "_gte", "_lte", "_neq", "_in", "_gt", "_lt", "_eq"];

#[derive(Clone, Debug, PartialEq)]
pub enum ConditionOp {
    Eq(Value),
    Neq(Value),
    /// Numeric comparisons carry the pre-coerced bound; `None` means
    /// the configured operand was not numeric and can never match.
    Gt(Option<Decimal>),
    Gte(Option<Decimal>),
    Lt(Option<Decimal>),
    Lte(Option<Decimal>),
    /// Membership against a configured list; a non-list operand never
    /// matches.
    In(Option<Vec<Value>>),
    NotIn(Option<Vec<Value>>),
    /// Presence test; a non-boolean operand never matches.
    Exists(Option<bool>),
    /// Substring test against the string form of the actual value.
    Contains(String),
}

#[derive(Clone, Debug, PartialEq)]
pub struct Condition {
    pub field: String,
    pub op: ConditionOp,
}

impl Condition {
    fn parse(key: &str, operand: &Value) -> Self {
        for suffix in SUFFIXES {
            if let Some(field) = key.strip_suffix(suffix) {
                if field.is_empty() {
                    break;
                }
                let op = match suffix {
                    "_eq" => ConditionOp::Eq(operand.clone()),
                    "_neq" => ConditionOp::Neq(operand.clone()),
                    "_gt" => ConditionOp::Gt(coerce_numeric(operand)),
                    "_gte" => ConditionOp::Gte(coerce_numeric(operand)),
                    "_lt" => ConditionOp::Lt(coerce_numeric(operand)),
                    "_lte" => ConditionOp::Lte(coerce_numeric(operand)),
                    "_in" => ConditionOp::In(operand.as_array().cloned()),
                    "_not_in" => ConditionOp::NotIn(operand.as_array().cloned()),
                    "_exists" => ConditionOp::Exists(operand.as_bool()),
                    "_contains" => ConditionOp::Contains(value_text(operand).unwrap_or_default()),
                    _ => unreachable!("suffix table covers all arms"),
                };
                return Self { field: field.to_string(), op };
            }
        }
        Self { field: key.to_string(), op: ConditionOp::Eq(operand.clone()) }
    }

    fn matches(&self, context: &Context) -> bool {
        let actual = context.get(&self.field);
        match &self.op {
            ConditionOp::Eq(expected) => {
                matches!(actual, Some(value) if values_equal(value, expected))
            }
            // Absent fields satisfy inequality, mirroring the loose
            // source semantics (`ctx.get(field) != value`).
            ConditionOp::Neq(expected) => {
                !matches!(actual, Some(value) if values_equal(value, expected))
            }
            ConditionOp::Gt(bound) => numeric_cmp(actual, bound, |a, b| a > b),
            ConditionOp::Gte(bound) => numeric_cmp(actual, bound, |a, b| a >= b),
            ConditionOp::Lt(bound) => numeric_cmp(actual, bound, |a, b| a < b),
            ConditionOp::Lte(bound) => numeric_cmp(actual, bound, |a, b| a <= b),
            ConditionOp::In(members) => match (members, actual) {
                (Some(members), Some(value)) => {
                    members.iter().any(|member| values_equal(value, member))
                }
                _ => false,
            },
            ConditionOp::NotIn(members) => match members {
                Some(members) => match actual {
                    Some(value) => !members.iter().any(|member| values_equal(value, member)),
                    None => true,
                },
                None => false,
            },
            ConditionOp::Exists(expected) => match expected {
                Some(true) => actual.is_some(),
                Some(false) => actual.is_none(),
                None => false,
            },
            ConditionOp::Contains(needle) => match actual.and_then(value_text) {
                Some(haystack) => haystack.contains(needle),
                None => false,
            },
        }
    }
}

/// A parsed, AND-combined predicate set. An empty set always matches.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(
    from = "serde_json::Map<String, Value>",
    into = "serde_json::Map<String, Value>"
)]
pub struct ConditionSet {
    raw: serde_json::Map<String, Value>,
    conditions: Vec<Condition>,
}

impl ConditionSet {
    pub fn parse(raw: serde_json::Map<String, Value>) -> Self {
        let conditions =
            raw.iter().map(|(key, operand)| Condition::parse(key, operand)).collect();
        Self { raw, conditions }
    }

    pub fn is_empty(&self) -> bool {
        self.conditions.is_empty()
    }

    pub fn matches(&self, context: &Context) -> bool {
        self.conditions.iter().all(|condition| condition.matches(context))
    }

    pub fn raw(&self) -> &serde_json::Map<String, Value> {
        &self.raw
    }
}

impl From<serde_json::Map<String, Value>> for ConditionSet {
    fn from(raw: serde_json::Map<String, Value>) -> Self {
        Self::parse(raw)
    }
}

impl From<ConditionSet> for serde_json::Map<String, Value> {
    fn from(set: ConditionSet) -> Self {
        set.raw
    }
}

/// Numeric coercion tolerant of numeric-looking strings.
pub fn coerce_numeric(value: &Value) -> Option<Decimal> {
    match value {
        Value::Number(number) => {
            if let Some(int) = number.as_i64() {
                Some(Decimal::from(int))
            } else {
                number.as_f64().and_then(Decimal::from_f64)
            }
        }
        Value::String(text) => text.trim().parse().ok(),
        _ => None,
    }
}

fn numeric_cmp(
    actual: Option<&Value>,
    bound: &Option<Decimal>,
    cmp: impl Fn(Decimal, Decimal) -> bool,
) -> bool {
    match (actual.and_then(coerce_numeric), bound) {
        (Some(actual), Some(bound)) => cmp(actual, *bound),
        _ => false,
    }
}

/// Equality with cross-representation numeric comparison (5 == 5.0),
/// everything else compared structurally.
fn values_equal(left: &Value, right: &Value) -> bool {
    if left.is_number() && right.is_number() {
        return match (coerce_numeric(left), coerce_numeric(right)) {
            (Some(left), Some(right)) => left == right,
            _ => false,
        };
    }
    left == right
}

fn value_text(value: &Value) -> Option<String> {
    match value {
        Value::String(text) => Some(text.clone()),
        Value::Number(number) => Some(number.to_string()),
        Value::Bool(flag) => Some(flag.to_string()),
        _ => None,
    }
}
