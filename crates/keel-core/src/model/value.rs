use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::errors::KeelError;

/// A single column value as seen by snapshots, diffs and storage gateways
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Real(f64),
    Text(String),
    Bytes(Vec<u8>),
}

/// Column name to value, ordered for deterministic diffs and SQL
pub type Row = BTreeMap<String, Value>;

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Name of the variant, used in type-mismatch errors
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Real(_) => "real",
            Value::Text(_) => "text",
            Value::Bytes(_) => "bytes",
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Value::Text(v) => Some(v),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "NULL"),
            Value::Bool(v) => write!(f, "{}", v),
            Value::Int(v) => write!(f, "{}", v),
            Value::Real(v) => write!(f, "{}", v),
            Value::Text(v) => write!(f, "{:?}", v),
            Value::Bytes(v) => write!(f, "<{} bytes>", v.len()),
        }
    }
}

/// Marker for types that can be mapped to a column by the descriptor builder
pub trait FieldType: Clone + Into<Value> + TryFrom<Value, Error = KeelError> + 'static {}

impl<V> FieldType for V where V: Clone + Into<Value> + TryFrom<Value, Error = KeelError> + 'static {}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(i64::from(v))
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Real(v)
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Value::Bytes(v)
    }
}

impl TryFrom<Value> for i64 {
    type Error = KeelError;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        match value {
            Value::Int(v) => Ok(v),
            other => Err(KeelError::mismatch("int", other)),
        }
    }
}

impl TryFrom<Value> for i32 {
    type Error = KeelError;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        match value {
            Value::Int(v) => i32::try_from(v).map_err(|_| KeelError::mismatch("i32", v)),
            other => Err(KeelError::mismatch("int", other)),
        }
    }
}

// SQLite has no boolean storage class, so 0/1 integers are accepted.
impl TryFrom<Value> for bool {
    type Error = KeelError;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        match value {
            Value::Bool(v) => Ok(v),
            Value::Int(0) => Ok(false),
            Value::Int(1) => Ok(true),
            other => Err(KeelError::mismatch("bool", other)),
        }
    }
}

impl TryFrom<Value> for f64 {
    type Error = KeelError;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        match value {
            Value::Real(v) => Ok(v),
            Value::Int(v) => Ok(v as f64),
            other => Err(KeelError::mismatch("real", other)),
        }
    }
}

impl TryFrom<Value> for String {
    type Error = KeelError;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        match value {
            Value::Text(v) => Ok(v),
            other => Err(KeelError::mismatch("text", other)),
        }
    }
}

impl TryFrom<Value> for Vec<u8> {
    type Error = KeelError;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        match value {
            Value::Bytes(v) => Ok(v),
            other => Err(KeelError::mismatch("bytes", other)),
        }
    }
}

macro_rules! nullable_field {
    ($($ty:ty),*) => {
        $(
            impl From<Option<$ty>> for Value {
                fn from(v: Option<$ty>) -> Self {
                    v.map(Value::from).unwrap_or(Value::Null)
                }
            }

            impl TryFrom<Value> for Option<$ty> {
                type Error = KeelError;

                fn try_from(value: Value) -> Result<Self, Self::Error> {
                    match value {
                        Value::Null => Ok(None),
                        other => <$ty>::try_from(other).map(Some),
                    }
                }
            }
        )*
    };
}

nullable_field!(i64, i32, bool, f64, String, Vec<u8>);
