use crate::{Result, TaskError};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Maximum nesting accepted for lists and maps inside a task value.
pub const MAX_VALUE_DEPTH: usize = 32;

/// A JSON-representable value passed to or returned from a task.
///
/// Arguments cross a process boundary, so only these shapes are allowed.
/// Anything that cannot be expressed as one of them is rejected at the
/// serialization boundary with [`TaskError::Serialization`].
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TaskValue {
    #[default]
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    List(Vec<TaskValue>),
    Map(BTreeMap<String, TaskValue>),
}

impl TaskValue {
    /// Convert any serializable Rust value into a task value.
    pub fn from_serialize<T: Serialize>(value: &T) -> Result<Self> {
        let json = serde_json::to_value(value)?;
        let value = Self::from_json(json);
        value.validate()?;
        Ok(value)
    }

    /// Decode this value into a concrete Rust type.
    pub fn deserialize_into<T: DeserializeOwned>(&self) -> Result<T> {
        let json = serde_json::to_value(self)?;
        serde_json::from_value(json).map_err(TaskError::from)
    }

    pub fn from_json(json: serde_json::Value) -> Self {
        match json {
            serde_json::Value::Null => TaskValue::Null,
            serde_json::Value::Bool(b) => TaskValue::Bool(b),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => TaskValue::Int(i),
                None => TaskValue::Float(n.as_f64().unwrap_or(f64::NAN)),
            },
            serde_json::Value::String(s) => TaskValue::Str(s),
            serde_json::Value::Array(items) => {
                TaskValue::List(items.into_iter().map(Self::from_json).collect())
            }
            serde_json::Value::Object(map) => TaskValue::Map(
                map.into_iter()
                    .map(|(k, v)| (k, Self::from_json(v)))
                    .collect(),
            ),
        }
    }

    /// Check that the value survives a JSON round trip unchanged.
    ///
    /// Non-finite floats would silently become `null` and deep nesting is
    /// refused by most decoders, so both are rejected here.
    pub fn validate(&self) -> Result<()> {
        self.validate_at(0)
    }

    fn validate_at(&self, depth: usize) -> Result<()> {
        if depth > MAX_VALUE_DEPTH {
            return Err(TaskError::Serialization(format!(
                "value nested deeper than {} levels",
                MAX_VALUE_DEPTH
            )));
        }
        match self {
            TaskValue::Float(f) if !f.is_finite() => Err(TaskError::Serialization(format!(
                "non-finite float {} cannot be encoded",
                f
            ))),
            TaskValue::List(items) => items.iter().try_for_each(|v| v.validate_at(depth + 1)),
            TaskValue::Map(map) => map.values().try_for_each(|v| v.validate_at(depth + 1)),
            _ => Ok(()),
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, TaskValue::Null)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            TaskValue::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            TaskValue::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            TaskValue::Float(f) => Some(*f),
            TaskValue::Int(i) => Some(*i as f64),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            TaskValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&BTreeMap<String, TaskValue>> {
        match self {
            TaskValue::Map(map) => Some(map),
            _ => None,
        }
    }

    pub fn get(&self, key: &str) -> Option<&TaskValue> {
        self.as_map().and_then(|m| m.get(key))
    }
}

impl fmt::Display for TaskValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match serde_json::to_string(self) {
            Ok(s) => f.write_str(&s),
            Err(_) => f.write_str("<unencodable>"),
        }
    }
}

impl From<&str> for TaskValue {
    fn from(s: &str) -> Self {
        TaskValue::Str(s.to_string())
    }
}

impl From<String> for TaskValue {
    fn from(s: String) -> Self {
        TaskValue::Str(s)
    }
}

impl From<i64> for TaskValue {
    fn from(i: i64) -> Self {
        TaskValue::Int(i)
    }
}

impl From<i32> for TaskValue {
    fn from(i: i32) -> Self {
        TaskValue::Int(i as i64)
    }
}

impl From<f64> for TaskValue {
    fn from(f: f64) -> Self {
        TaskValue::Float(f)
    }
}

impl From<bool> for TaskValue {
    fn from(b: bool) -> Self {
        TaskValue::Bool(b)
    }
}

impl<T: Into<TaskValue>> From<Vec<T>> for TaskValue {
    fn from(items: Vec<T>) -> Self {
        TaskValue::List(items.into_iter().map(Into::into).collect())
    }
}

impl<T: Into<TaskValue>> From<Option<T>> for TaskValue {
    fn from(value: Option<T>) -> Self {
        value.map(Into::into).unwrap_or(TaskValue::Null)
    }
}

impl From<BTreeMap<String, TaskValue>> for TaskValue {
    fn from(map: BTreeMap<String, TaskValue>) -> Self {
        TaskValue::Map(map)
    }
}
