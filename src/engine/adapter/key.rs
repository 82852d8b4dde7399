//! Keys and key paths
//!
//! Keys order the same way across every collection: numbers sort before
//! strings, strings before arrays. Arrays compare element by element and a
//! shorter array sorts first when it is a prefix of the longer one.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Number, Value};
use std::cmp::Ordering;
use std::fmt;

/// A valid record or index key
#[derive(Debug, Clone)]
pub enum Key {
    Number(f64),
    String(String),
    Array(Vec<Key>),
}

impl Key {
    /// Convert a JSON value into a key. `null`, booleans, objects and
    /// non-finite numbers are not keys.
    pub fn from_value(value: &Value) -> Option<Key> {
        match value {
            Value::Number(n) => n.as_f64().filter(|f| f.is_finite()).map(Key::from),
            Value::String(s) => Some(Key::String(s.clone())),
            Value::Array(items) => items
                .iter()
                .map(Key::from_value)
                .collect::<Option<Vec<_>>>()
                .map(Key::Array),
            _ => None,
        }
    }

    /// Back to JSON. Integral numbers come back as JSON integers.
    pub fn to_value(&self) -> Value {
        match self {
            Key::Number(f) => number_value(*f),
            Key::String(s) => Value::String(s.clone()),
            Key::Array(items) => Value::Array(items.iter().map(Key::to_value).collect()),
        }
    }

    fn rank(&self) -> u8 {
        match self {
            Key::Number(_) => 0,
            Key::String(_) => 1,
            Key::Array(_) => 2,
        }
    }
}

fn number_value(f: f64) -> Value {
    if f.fract() == 0.0 && f.abs() < 9_007_199_254_740_992.0 {
        Value::Number(Number::from(f as i64))
    } else {
        Number::from_f64(f).map(Value::Number).unwrap_or(Value::Null)
    }
}

impl Ord for Key {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Key::Number(a), Key::Number(b)) if *a == 0.0 && *b == 0.0 => Ordering::Equal,
            (Key::Number(a), Key::Number(b)) => a.total_cmp(b),
            (Key::String(a), Key::String(b)) => a.cmp(b),
            (Key::Array(a), Key::Array(b)) => a.cmp(b),
            _ => self.rank().cmp(&other.rank()),
        }
    }
}

impl PartialOrd for Key {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Key {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Key {}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_value())
    }
}

impl From<i64> for Key {
    fn from(n: i64) -> Self {
        Key::Number(n as f64)
    }
}

impl From<f64> for Key {
    /// `-0.0` becomes `0.0` so both zeros are the same key
    fn from(n: f64) -> Self {
        Key::Number(if n == 0.0 { 0.0 } else { n })
    }
}

impl From<&str> for Key {
    fn from(s: &str) -> Self {
        Key::String(s.to_string())
    }
}

impl From<String> for Key {
    fn from(s: String) -> Self {
        Key::String(s)
    }
}

impl<K: Into<Key>> From<Vec<K>> for Key {
    fn from(items: Vec<K>) -> Self {
        Key::Array(items.into_iter().map(Into::into).collect())
    }
}

impl Serialize for Key {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_value().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Key {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        Key::from_value(&value)
            .ok_or_else(|| serde::de::Error::custom(format!("not a valid key: {}", value)))
    }
}

/// Where a key lives inside a record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum KeyPath {
    /// A single field, dotted for nested objects (`"profile.email"`)
    Single(String),
    /// Several fields forming an array key
    Compound(Vec<String>),
}

impl KeyPath {
    pub fn is_compound(&self) -> bool {
        matches!(self, KeyPath::Compound(_))
    }

    /// The field paths this key path reads
    pub fn fields(&self) -> Vec<&str> {
        match self {
            KeyPath::Single(path) => vec![path.as_str()],
            KeyPath::Compound(paths) => paths.iter().map(String::as_str).collect(),
        }
    }

    /// Evaluate the path against a record. `None` when any component is
    /// missing or is not a valid key.
    pub fn extract(&self, record: &Value) -> Option<Key> {
        match self {
            KeyPath::Single(path) => lookup(record, path).and_then(Key::from_value),
            KeyPath::Compound(paths) => paths
                .iter()
                .map(|p| lookup(record, p).and_then(Key::from_value))
                .collect::<Option<Vec<_>>>()
                .map(Key::Array),
        }
    }

    /// Write a generated key into the record. Only single paths can be
    /// injected; intermediate objects are created as needed.
    pub fn inject(&self, record: &mut Value, key: &Key) -> bool {
        match self {
            KeyPath::Single(path) => assign(record, path, key.to_value()),
            KeyPath::Compound(_) => false,
        }
    }
}

impl From<&str> for KeyPath {
    fn from(path: &str) -> Self {
        KeyPath::Single(path.to_string())
    }
}

impl From<Vec<&str>> for KeyPath {
    fn from(paths: Vec<&str>) -> Self {
        KeyPath::Compound(paths.into_iter().map(str::to_string).collect())
    }
}

impl fmt::Display for KeyPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyPath::Single(path) => f.write_str(path),
            KeyPath::Compound(paths) => write!(f, "[{}]", paths.join(", ")),
        }
    }
}

/// Read a dotted path out of a record
pub fn lookup<'a>(record: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.').try_fold(record, |value, part| value.get(part))
}

/// Set a dotted path inside a record, creating intermediate objects.
/// Fails when something on the way is not an object.
pub fn assign(record: &mut Value, path: &str, value: Value) -> bool {
    let mut target = record;
    let mut parts = path.split('.').peekable();
    while let Some(part) = parts.next() {
        let Value::Object(map) = target else {
            return false;
        };
        if parts.peek().is_none() {
            map.insert(part.to_string(), value);
            return true;
        }
        target = map
            .entry(part.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_key_ordering() {
        let mut keys = vec![
            Key::from(vec![1i64]),
            Key::from("b"),
            Key::from(10i64),
            Key::from("a"),
            Key::from(-2i64),
            Key::from(Vec::<i64>::new()),
        ];
        keys.sort();

        assert_eq!(
            keys,
            vec![
                Key::from(-2i64),
                Key::from(10i64),
                Key::from("a"),
                Key::from("b"),
                Key::from(Vec::<i64>::new()),
                Key::from(vec![1i64]),
            ]
        );
    }

    #[test]
    fn test_invalid_keys() {
        assert!(Key::from_value(&json!(null)).is_none());
        assert!(Key::from_value(&json!(true)).is_none());
        assert!(Key::from_value(&json!({"a": 1})).is_none());
        assert!(Key::from_value(&json!([1, null])).is_none());
        assert_eq!(Key::from_value(&json!(3)).unwrap().to_value(), json!(3));
    }

    #[test]
    fn test_negative_zero_is_zero() {
        assert_eq!(Key::from(-0.0), Key::from(0i64));
        assert_eq!(Key::from_value(&json!(-0.0)), Some(Key::from(0i64)));
        assert_eq!(Key::Number(-0.0).cmp(&Key::Number(0.0)), Ordering::Equal);
        assert_eq!(Key::from(-0.0).to_value(), json!(0));
    }

    #[test]
    fn test_key_path_extract() {
        let record = json!({"username": "admin", "email": "a@x.com", "profile": {"age": 30}});

        assert_eq!(KeyPath::from("username").extract(&record), Some(Key::from("admin")));
        assert_eq!(KeyPath::from("profile.age").extract(&record), Some(Key::from(30i64)));
        assert_eq!(
            KeyPath::from(vec!["username", "email"]).extract(&record),
            Some(Key::from(vec!["admin", "a@x.com"]))
        );
        assert_eq!(KeyPath::from(vec!["username", "tel"]).extract(&record), None);
    }

    #[test]
    fn test_key_path_inject() {
        let mut record = json!({"name": "x"});
        assert!(KeyPath::from("id").inject(&mut record, &Key::from(7i64)));
        assert_eq!(record, json!({"name": "x", "id": 7}));

        let mut nested = json!({});
        assert!(KeyPath::from("meta.id").inject(&mut nested, &Key::from("k")));
        assert_eq!(nested, json!({"meta": {"id": "k"}}));
    }
}
