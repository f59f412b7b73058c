//! `trigger_conditions` predicates.
//!
//! Rules are stored as JSON on the channel-bot binding and compiled into a
//! [`TriggerExpr`] tree before evaluation:
//!
//! ```json
//! {"all": [
//!     {"field": "message.text", "op": "contains", "value": "order"},
//!     {"not": {"field": "metadata.source", "op": "eq", "value": "ads"}}
//! ]}
//! ```
//!
//! `null`, `true` and `{}` match everything. Evaluation never fails: a missing
//! attribute simply does not satisfy the comparison.

use std::collections::HashMap;

use regex::{Regex, RegexBuilder};
use serde::Deserialize;
use serde_json::{Map, Value};
use thiserror::Error;

use crate::db::{Channel, Contact, Conversation};
use crate::parsers::InboundEvent;

#[derive(Debug, Error)]
pub enum TriggerError {
    #[error("invalid trigger shape: {0}")]
    InvalidShape(String),
    #[error("unknown operator {0}")]
    UnknownOperator(String),
    #[error("operator {op} expects {expected}")]
    InvalidValue { op: &'static str, expected: &'static str },
    #[error("invalid regex {pattern}: {source}")]
    InvalidRegex {
        pattern: String,
        #[source]
        source: regex::Error,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operator {
    Eq,
    Ne,
    Contains,
    StartsWith,
    EndsWith,
    Matches,
    In,
    Exists,
    Gt,
    Gte,
    Lt,
    Lte,
}

impl Operator {
    fn parse(raw: &str) -> Result<Self, TriggerError> {
        Ok(match raw {
            "eq" => Self::Eq,
            "ne" => Self::Ne,
            "contains" => Self::Contains,
            "starts_with" => Self::StartsWith,
            "ends_with" => Self::EndsWith,
            "matches" => Self::Matches,
            "in" => Self::In,
            "exists" => Self::Exists,
            "gt" => Self::Gt,
            "gte" => Self::Gte,
            "lt" => Self::Lt,
            "lte" => Self::Lte,
            other => return Err(TriggerError::UnknownOperator(other.to_string())),
        })
    }

    fn name(&self) -> &'static str {
        match self {
            Self::Eq => "eq",
            Self::Ne => "ne",
            Self::Contains => "contains",
            Self::StartsWith => "starts_with",
            Self::EndsWith => "ends_with",
            Self::Matches => "matches",
            Self::In => "in",
            Self::Exists => "exists",
            Self::Gt => "gt",
            Self::Gte => "gte",
            Self::Lt => "lt",
            Self::Lte => "lte",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Condition {
    field: String,
    op: Operator,
    value: Value,
    case_sensitive: bool,
    regex: Option<Regex>,
}

#[derive(Debug, Clone)]
pub enum TriggerExpr {
    /// True when every child is true; `All(vec![])` is the catch-all.
    All(Vec<TriggerExpr>),
    /// True when some child is true; `Any(vec![])` never matches.
    Any(Vec<TriggerExpr>),
    Not(Box<TriggerExpr>),
    Condition(Condition),
}

#[derive(Deserialize)]
struct RawCondition {
    field: String,
    #[serde(default = "default_op")]
    op: String,
    #[serde(default)]
    value: Value,
    #[serde(default)]
    case_sensitive: bool,
}

fn default_op() -> String {
    "eq".to_string()
}

impl TriggerExpr {
    pub fn catch_all() -> Self {
        Self::All(Vec::new())
    }

    pub fn compile(raw: &Value) -> Result<Self, TriggerError> {
        match raw {
            Value::Null | Value::Bool(true) => Ok(Self::catch_all()),
            Value::Bool(false) => Ok(Self::Any(Vec::new())),
            Value::Array(items) => Ok(Self::All(Self::compile_list(items)?)),
            Value::Object(object) if object.is_empty() => Ok(Self::catch_all()),
            Value::Object(object) => Self::compile_object(object),
            other => Err(TriggerError::InvalidShape(format!(
                "expected an object, array, boolean or null, got {other}"
            ))),
        }
    }

    fn compile_list(items: &[Value]) -> Result<Vec<Self>, TriggerError> {
        items.iter().map(Self::compile).collect()
    }

    fn compile_object(object: &Map<String, Value>) -> Result<Self, TriggerError> {
        let combinator = ["all", "any", "not"]
            .into_iter()
            .find(|key| object.contains_key(*key));

        if let Some(key) = combinator {
            if object.len() != 1 {
                return Err(TriggerError::InvalidShape(format!(
                    "`{key}` cannot be combined with other keys"
                )));
            }
            let inner = &object[key];
            return match (key, inner) {
                ("all", Value::Array(items)) => Ok(Self::All(Self::compile_list(items)?)),
                ("any", Value::Array(items)) => Ok(Self::Any(Self::compile_list(items)?)),
                ("not", inner) => Ok(Self::Not(Box::new(Self::compile(inner)?))),
                (key, _) => Err(TriggerError::InvalidShape(format!("`{key}` expects an array"))),
            };
        }

        let raw: RawCondition = serde_json::from_value(Value::Object(object.clone()))
            .map_err(|e| TriggerError::InvalidShape(e.to_string()))?;
        Condition::compile(raw).map(Self::Condition)
    }

    pub fn evaluate(&self, attributes: &EventAttributes) -> bool {
        match self {
            Self::All(children) => children.iter().all(|child| child.evaluate(attributes)),
            Self::Any(children) => children.iter().any(|child| child.evaluate(attributes)),
            Self::Not(inner) => !inner.evaluate(attributes),
            Self::Condition(condition) => condition.evaluate(attributes),
        }
    }
}

impl Condition {
    fn compile(raw: RawCondition) -> Result<Self, TriggerError> {
        let op = Operator::parse(&raw.op)?;
        if raw.field.trim().is_empty() {
            return Err(TriggerError::InvalidShape("condition field is empty".to_string()));
        }

        let invalid = |expected| TriggerError::InvalidValue {
            op: op.name(),
            expected,
        };
        let mut regex = None;
        match op {
            Operator::Contains | Operator::StartsWith | Operator::EndsWith => {
                if !raw.value.is_string() {
                    return Err(invalid("a string"));
                }
            }
            Operator::Matches => {
                let pattern = raw.value.as_str().ok_or_else(|| invalid("a regex string"))?;
                let compiled = RegexBuilder::new(pattern)
                    .case_insensitive(!raw.case_sensitive)
                    .build()
                    .map_err(|source| TriggerError::InvalidRegex {
                        pattern: pattern.to_string(),
                        source,
                    })?;
                regex = Some(compiled);
            }
            Operator::In => {
                if !raw.value.is_array() {
                    return Err(invalid("an array"));
                }
            }
            Operator::Exists => {
                if !(raw.value.is_null() || raw.value.is_boolean()) {
                    return Err(invalid("a boolean"));
                }
            }
            Operator::Gt | Operator::Gte | Operator::Lt | Operator::Lte => {
                if as_number(&raw.value).is_none() {
                    return Err(invalid("a number"));
                }
            }
            Operator::Eq | Operator::Ne => {}
        }

        Ok(Self {
            field: raw.field,
            op,
            value: raw.value,
            case_sensitive: raw.case_sensitive,
            regex,
        })
    }

    fn evaluate(&self, attributes: &EventAttributes) -> bool {
        let actual = attributes.get(&self.field);
        match self.op {
            Operator::Exists => {
                let present = actual.is_some_and(|v| !v.is_null());
                present == self.value.as_bool().unwrap_or(true)
            }
            Operator::Ne => !actual.is_some_and(|v| values_equal(v, &self.value, self.case_sensitive)),
            _ => actual.is_some_and(|actual| self.compare(actual)),
        }
    }

    fn compare(&self, actual: &Value) -> bool {
        let cs = self.case_sensitive;
        match self.op {
            Operator::Eq => values_equal(actual, &self.value, cs),
            Operator::In => self
                .value
                .as_array()
                .is_some_and(|items| items.iter().any(|item| values_equal(actual, item, cs))),
            Operator::Contains => match actual {
                Value::Array(items) => items.iter().any(|item| values_equal(item, &self.value, cs)),
                _ => string_test(actual, &self.value, cs, |a, b| a.contains(b)),
            },
            Operator::StartsWith => string_test(actual, &self.value, cs, |a, b| a.starts_with(b)),
            Operator::EndsWith => string_test(actual, &self.value, cs, |a, b| a.ends_with(b)),
            Operator::Matches => match (&self.regex, as_text(actual)) {
                (Some(regex), Some(text)) => regex.is_match(&text),
                _ => false,
            },
            Operator::Gt | Operator::Gte | Operator::Lt | Operator::Lte => {
                match (as_number(actual), as_number(&self.value)) {
                    (Some(a), Some(b)) => match self.op {
                        Operator::Gt => a > b,
                        Operator::Gte => a >= b,
                        Operator::Lt => a < b,
                        _ => a <= b,
                    },
                    _ => false,
                }
            }
            Operator::Ne | Operator::Exists => false,
        }
    }
}

fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
}

fn as_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn fold(text: &str, case_sensitive: bool) -> String {
    if case_sensitive {
        text.to_string()
    } else {
        text.to_lowercase()
    }
}

fn string_test(actual: &Value, expected: &Value, cs: bool, test: fn(&str, &str) -> bool) -> bool {
    match (as_text(actual), expected.as_str()) {
        (Some(actual), Some(expected)) => test(&fold(&actual, cs), &fold(expected, cs)),
        _ => false,
    }
}

fn values_equal(actual: &Value, expected: &Value, cs: bool) -> bool {
    match (actual, expected) {
        (Value::String(a), Value::String(b)) => fold(a, cs) == fold(b, cs),
        (Value::Number(_), _) | (_, Value::Number(_)) => {
            match (as_number(actual), as_number(expected)) {
                (Some(a), Some(b)) => a == b,
                _ => false,
            }
        }
        (Value::String(a), Value::Bool(b)) | (Value::Bool(b), Value::String(a)) => {
            a.eq_ignore_ascii_case(if *b { "true" } else { "false" })
        }
        _ => actual == expected,
    }
}

/// Flat attribute map a predicate is evaluated against.
#[derive(Debug, Clone, Default)]
pub struct EventAttributes {
    values: HashMap<String, Value>,
}

impl EventAttributes {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_context(
        event: &InboundEvent,
        contact: &Contact,
        contact_is_new: bool,
        conversation: &Conversation,
        channel: &Channel,
    ) -> Self {
        let mut attributes = Self::new();
        attributes.insert("event.type", Value::from(event.event_type.as_str()));
        attributes.insert("message.text", event.body.clone().map_or(Value::Null, Value::from));
        attributes.insert("message.type", Value::from(event.message_type.as_str()));
        attributes.insert("message.has_attachments", Value::from(event.has_attachments()));
        attributes.insert("contact.phone", Value::from(contact.phone.as_str()));
        attributes.insert("contact.name", contact.name.clone().map_or(Value::Null, Value::from));
        attributes.insert("contact.email", contact.email.clone().map_or(Value::Null, Value::from));
        attributes.insert("contact.is_new", Value::from(contact_is_new));
        attributes.insert("conversation.status", Value::from(conversation.status().as_str()));
        attributes.insert("channel.name", Value::from(channel.name.as_str()));

        for (key, value) in &event.metadata {
            attributes.insert(&format!("metadata.{key}"), value.clone());
        }
        if let Value::Object(metadata) = &contact.metadata {
            for (key, value) in metadata {
                attributes.insert(&format!("contact.metadata.{key}"), value.clone());
            }
        }
        attributes
    }

    pub fn insert(&mut self, key: &str, value: Value) {
        self.values.insert(key.to_string(), value);
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }
}
