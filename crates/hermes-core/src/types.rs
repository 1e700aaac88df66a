/*!
 * Core data types for Hermes.
 *
 * This module defines the identifiers and the scalar value type shared by the
 * codec, the directory and the gateway sessions.
 */
use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Device identifier as reported by the device itself (0 means unaddressed)
pub type DeviceId = u32;

/// Peripheral identifier, local to its parent device (0 means unaddressed)
pub type PeripheralId = u32;

/// Parameter identifier, local to its parent peripheral (0 means unaddressed)
pub type ParameterId = u32;

/// A unique identifier for one client session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(Uuid);

impl SessionId {
    /// Create a new random session ID
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Get the underlying UUID
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for SessionId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

/// A scalar value carried by the device protocol
///
/// Parameter values, SET payloads and streamed samples are all one of these.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DataValue {
    /// Boolean value
    Bool(bool),
    /// Integer value
    Integer(i64),
    /// Floating-point value
    Float(f64),
    /// String value
    String(String),
}

impl DataValue {
    /// Check if the value is numeric (integer or float)
    pub fn is_numeric(&self) -> bool {
        matches!(self, DataValue::Integer(_) | DataValue::Float(_))
    }

    /// Try to get a boolean value
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            DataValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Try to get an integer value
    pub fn as_integer(&self) -> Option<i64> {
        match self {
            DataValue::Integer(i) => Some(*i),
            DataValue::Float(f) if *f == (*f as i64) as f64 => Some(*f as i64),
            DataValue::Bool(b) => Some(i64::from(*b)),
            _ => None,
        }
    }

    /// Try to get a float value
    pub fn as_float(&self) -> Option<f64> {
        match self {
            DataValue::Float(f) => Some(*f),
            DataValue::Integer(i) => Some(*i as f64),
            DataValue::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            _ => None,
        }
    }

    /// Try to get a string value
    pub fn as_str(&self) -> Option<&str> {
        match self {
            DataValue::String(s) => Some(s),
            _ => None,
        }
    }

    /// Convert a JSON scalar into a value; arrays, objects and null are rejected
    pub fn from_json(value: &serde_json::Value) -> Option<Self> {
        match value {
            serde_json::Value::Bool(b) => Some(DataValue::Bool(*b)),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => Some(DataValue::Integer(i)),
                None => n.as_f64().map(DataValue::Float),
            },
            serde_json::Value::String(s) => Some(DataValue::String(s.clone())),
            _ => None,
        }
    }

    /// Convert the value into JSON
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            DataValue::Bool(b) => serde_json::Value::Bool(*b),
            DataValue::Integer(i) => serde_json::Value::from(*i),
            DataValue::Float(f) => serde_json::Value::from(*f),
            DataValue::String(s) => serde_json::Value::String(s.clone()),
        }
    }
}

impl Default for DataValue {
    fn default() -> Self {
        DataValue::Integer(0)
    }
}

impl fmt::Display for DataValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DataValue::Bool(b) => write!(f, "{}", b),
            DataValue::Integer(i) => write!(f, "{}", i),
            DataValue::Float(v) => write!(f, "{}", v),
            DataValue::String(s) => write!(f, "{}", s),
        }
    }
}

impl From<bool> for DataValue {
    fn from(b: bool) -> Self {
        DataValue::Bool(b)
    }
}

impl From<i32> for DataValue {
    fn from(i: i32) -> Self {
        DataValue::Integer(i64::from(i))
    }
}

impl From<i64> for DataValue {
    fn from(i: i64) -> Self {
        DataValue::Integer(i)
    }
}

impl From<u32> for DataValue {
    fn from(i: u32) -> Self {
        DataValue::Integer(i64::from(i))
    }
}

impl From<f32> for DataValue {
    fn from(f: f32) -> Self {
        DataValue::Float(f64::from(f))
    }
}

impl From<f64> for DataValue {
    fn from(f: f64) -> Self {
        DataValue::Float(f)
    }
}

impl From<&str> for DataValue {
    fn from(s: &str) -> Self {
        DataValue::String(s.to_string())
    }
}

impl From<String> for DataValue {
    fn from(s: String) -> Self {
        DataValue::String(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_session_id_unique() {
        let a = SessionId::new();
        let b = SessionId::new();
        assert_ne!(a, b);
        assert_eq!(format!("{}", a), a.as_uuid().to_string());
    }

    #[test]
    fn test_value_from_json() {
        assert_eq!(DataValue::from_json(&json!(42)), Some(DataValue::Integer(42)));
        assert_eq!(DataValue::from_json(&json!(-7)), Some(DataValue::Integer(-7)));
        assert_eq!(DataValue::from_json(&json!(2.5)), Some(DataValue::Float(2.5)));
        assert_eq!(DataValue::from_json(&json!(true)), Some(DataValue::Bool(true)));
        assert_eq!(
            DataValue::from_json(&json!("on")),
            Some(DataValue::String("on".to_string()))
        );
        assert_eq!(DataValue::from_json(&json!(null)), None);
        assert_eq!(DataValue::from_json(&json!([1, 2])), None);
        assert_eq!(DataValue::from_json(&json!({"a": 1})), None);
    }

    #[test]
    fn test_value_serde_untagged() {
        let v: DataValue = serde_json::from_str("42").unwrap();
        assert_eq!(v, DataValue::Integer(42));

        let v: DataValue = serde_json::from_str("1.5").unwrap();
        assert_eq!(v, DataValue::Float(1.5));

        assert_eq!(serde_json::to_string(&DataValue::Bool(false)).unwrap(), "false");
        assert_eq!(DataValue::Integer(3).to_json(), json!(3));
    }

    #[test]
    fn test_value_as_methods() {
        let v = DataValue::Integer(42);
        assert_eq!(v.as_integer(), Some(42));
        assert_eq!(v.as_float(), Some(42.0));
        assert!(v.is_numeric());

        let v = DataValue::Float(3.0);
        assert_eq!(v.as_integer(), Some(3));

        let v = DataValue::Float(3.14);
        assert_eq!(v.as_integer(), None);

        let v = DataValue::Bool(true);
        assert_eq!(v.as_integer(), Some(1));
        assert!(!v.is_numeric());

        let v = DataValue::String("hello".to_string());
        assert_eq!(v.as_str(), Some("hello"));
        assert_eq!(v.as_float(), None);
    }
}
