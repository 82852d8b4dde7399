//! Query descriptors and record filters

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;

use super::range::{build_range, KeyRange, RangeQuery};
use crate::engine::adapter::key::lookup;
use crate::engine::adapter::{Direction, Key};

/// Condition operators
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionOp {
    /// Equality
    Eq(Value),
    /// Not equal
    Ne(Value),
    /// Greater than
    Gt(Value),
    /// Greater than or equal
    Gte(Value),
    /// Less than
    Lt(Value),
    /// Less than or equal
    Lte(Value),
    /// String contains
    Contains(String),
    /// String starts with
    StartsWith(String),
    /// String ends with
    EndsWith(String),
    /// In array of values
    In(Vec<Value>),
    /// Not in array of values
    NotIn(Vec<Value>),
    /// Field exists
    Exists(bool),
}

/// A single field condition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Condition {
    /// Dotted field path
    pub field: String,
    pub op: ConditionOp,
}

impl Condition {
    pub fn eq(field: &str, value: impl Into<Value>) -> Self {
        Self { field: field.to_string(), op: ConditionOp::Eq(value.into()) }
    }

    pub fn ne(field: &str, value: impl Into<Value>) -> Self {
        Self { field: field.to_string(), op: ConditionOp::Ne(value.into()) }
    }

    pub fn gt(field: &str, value: impl Into<Value>) -> Self {
        Self { field: field.to_string(), op: ConditionOp::Gt(value.into()) }
    }

    pub fn gte(field: &str, value: impl Into<Value>) -> Self {
        Self { field: field.to_string(), op: ConditionOp::Gte(value.into()) }
    }

    pub fn lt(field: &str, value: impl Into<Value>) -> Self {
        Self { field: field.to_string(), op: ConditionOp::Lt(value.into()) }
    }

    pub fn lte(field: &str, value: impl Into<Value>) -> Self {
        Self { field: field.to_string(), op: ConditionOp::Lte(value.into()) }
    }

    pub fn contains(field: &str, value: &str) -> Self {
        Self { field: field.to_string(), op: ConditionOp::Contains(value.to_string()) }
    }

    pub fn exists(field: &str, present: bool) -> Self {
        Self { field: field.to_string(), op: ConditionOp::Exists(present) }
    }

    /// Check if a record matches this condition
    pub fn matches(&self, record: &Value) -> bool {
        let value = lookup(record, &self.field);

        match (&self.op, value) {
            (ConditionOp::Exists(should_exist), val) => val.is_some() == *should_exist,
            (_, None) => false,
            (ConditionOp::Eq(expected), Some(actual)) => actual == expected,
            (ConditionOp::Ne(expected), Some(actual)) => actual != expected,
            (ConditionOp::Gt(expected), Some(actual)) => {
                compare_values(actual, expected) == Some(Ordering::Greater)
            }
            (ConditionOp::Gte(expected), Some(actual)) => {
                matches!(compare_values(actual, expected), Some(Ordering::Greater | Ordering::Equal))
            }
            (ConditionOp::Lt(expected), Some(actual)) => {
                compare_values(actual, expected) == Some(Ordering::Less)
            }
            (ConditionOp::Lte(expected), Some(actual)) => {
                matches!(compare_values(actual, expected), Some(Ordering::Less | Ordering::Equal))
            }
            (ConditionOp::Contains(substr), Some(Value::String(s))) => s.contains(substr),
            (ConditionOp::StartsWith(prefix), Some(Value::String(s))) => s.starts_with(prefix),
            (ConditionOp::EndsWith(suffix), Some(Value::String(s))) => s.ends_with(suffix),
            (ConditionOp::In(values), Some(actual)) => values.contains(actual),
            (ConditionOp::NotIn(values), Some(actual)) => !values.contains(actual),
            _ => false,
        }
    }
}

/// Compare two JSON values of the same kind
fn compare_values(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(a), Value::Number(b)) => a.as_f64()?.partial_cmp(&b.as_f64()?),
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        _ => None,
    }
}

type Predicate = Arc<dyn Fn(&Value) -> bool + Send + Sync>;

/// Post-filter applied to every record a cursor visits
#[derive(Clone)]
pub enum Filter {
    /// Caller-supplied predicate
    Predicate(Predicate),
    /// All conditions must hold
    All(Vec<Condition>),
}

impl Filter {
    pub fn predicate(f: impl Fn(&Value) -> bool + Send + Sync + 'static) -> Self {
        Filter::Predicate(Arc::new(f))
    }

    pub fn all(conditions: impl IntoIterator<Item = Condition>) -> Self {
        Filter::All(conditions.into_iter().collect())
    }

    pub fn matches(&self, record: &Value) -> bool {
        match self {
            Filter::Predicate(f) => f(record),
            Filter::All(conditions) => conditions.iter().all(|c| c.matches(record)),
        }
    }
}

impl fmt::Debug for Filter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Filter::Predicate(_) => f.write_str("Filter::Predicate(..)"),
            Filter::All(conditions) => f.debug_tuple("Filter::All").field(conditions).finish(),
        }
    }
}

/// Scan over a collection or one of its indexes
#[derive(Debug, Clone, Default)]
pub struct Query {
    /// Secondary index to scan; the primary key when absent
    pub index: Option<String>,
    pub order: Direction,
    pub filter: Option<Filter>,
    pub range: RangeQuery,
}

impl Query {
    pub fn new() -> Self {
        Self::default()
    }

    /// Scan a secondary index
    pub fn index(name: &str) -> Self {
        Self { index: Some(name.to_string()), ..Self::default() }
    }

    pub fn eq(mut self, key: impl Into<Key>) -> Self {
        self.range.eq = Some(key.into());
        self
    }

    pub fn gt(mut self, key: impl Into<Key>) -> Self {
        self.range = self.range.gt(key);
        self
    }

    pub fn gte(mut self, key: impl Into<Key>) -> Self {
        self.range = self.range.gte(key);
        self
    }

    pub fn lt(mut self, key: impl Into<Key>) -> Self {
        self.range = self.range.lt(key);
        self
    }

    pub fn lte(mut self, key: impl Into<Key>) -> Self {
        self.range = self.range.lte(key);
        self
    }

    pub fn order(mut self, order: Direction) -> Self {
        self.order = order;
        self
    }

    pub fn filter(mut self, filter: Filter) -> Self {
        self.filter = Some(filter);
        self
    }

    pub fn key_range(&self) -> KeyRange {
        build_range(&self.range)
    }
}
