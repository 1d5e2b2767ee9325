//! Values, kinds and records: the logical data model shared by every backend.

use std::collections::BTreeMap;
use std::convert::Infallible;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::errors::{Result, TubError};
use crate::frame::ImageArray;

/// One sample: channel name to value.
pub type Record = BTreeMap<String, Value>;

/// A typed channel value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Bytes(Vec<u8>),
    List(Vec<Value>),
    Map(BTreeMap<String, Value>),
    Image(ImageArray),
}

impl Value {
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Bool(_) => "bool",
            Self::Int(_) => "int",
            Self::Float(_) => "float",
            Self::Str(_) => "str",
            Self::Bytes(_) => "bytes",
            Self::List(_) => "list",
            Self::Map(_) => "map",
            Self::Image(_) => "image",
        }
    }

    /// Numeric view; booleans count as 0/1.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Int(i) => Some(*i as f64),
            Self::Float(f) => Some(*f),
            Self::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int(i) => Some(*i),
            Self::Bool(b) => Some(*b as i64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_image(&self) -> Option<&ImageArray> {
        match self {
            Self::Image(img) => Some(img),
            _ => None,
        }
    }

    /// Untyped conversion from JSON; kind-directed conversion lives with the
    /// file store.
    pub fn from_json(json: serde_json::Value) -> Self {
        match json {
            serde_json::Value::Null => Self::Null,
            serde_json::Value::Bool(b) => Self::Bool(b),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => Self::Int(i),
                None => Self::Float(n.as_f64().unwrap_or(f64::NAN)),
            },
            serde_json::Value::String(s) => Self::Str(s),
            serde_json::Value::Array(items) => {
                Self::List(items.into_iter().map(Self::from_json).collect())
            }
            serde_json::Value::Object(map) => Self::Map(
                map.into_iter()
                    .map(|(k, v)| (k, Self::from_json(v)))
                    .collect(),
            ),
        }
    }

    /// Convert to JSON. Non-finite floats, raw bytes and images have no JSON
    /// form and fail with `TypeMismatch`.
    pub fn to_json(&self) -> Result<serde_json::Value> {
        Ok(match self {
            Self::Null => serde_json::Value::Null,
            Self::Bool(b) => serde_json::Value::Bool(*b),
            Self::Int(i) => serde_json::json!(i),
            Self::Float(f) => serde_json::Number::from_f64(*f)
                .map(serde_json::Value::Number)
                .ok_or_else(|| TubError::TypeMismatch {
                    kind: "json".into(),
                    actual: format!("non-finite float {f}"),
                })?,
            Self::Str(s) => serde_json::Value::String(s.clone()),
            Self::List(items) => serde_json::Value::Array(
                items.iter().map(Value::to_json).collect::<Result<_>>()?,
            ),
            Self::Map(map) => serde_json::Value::Object(
                map.iter()
                    .map(|(k, v)| Ok((k.clone(), v.to_json()?)))
                    .collect::<Result<_>>()?,
            ),
            Self::Bytes(_) | Self::Image(_) => {
                return Err(TubError::TypeMismatch {
                    kind: "json".into(),
                    actual: self.type_name().into(),
                })
            }
        })
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Self::Int(v as i64)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Self::Str(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Self::Str(v)
    }
}

impl From<ImageArray> for Value {
    fn from(v: ImageArray) -> Self {
        Self::Image(v)
    }
}

impl From<Vec<Value>> for Value {
    fn from(v: Vec<Value>) -> Self {
        Self::List(v)
    }
}

/// Declared type of a channel.
///
/// The known kinds are closed; `Other` carries names that only a custom
/// codec registration understands.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Kind {
    Int,
    Float,
    Str,
    Boolean,
    Image,
    ImageArray,
    List,
    Tuple,
    Dict,
    Blob,
    Other(String),
}

impl Kind {
    /// Canonical name, as written to `meta.json`.
    pub fn name(&self) -> &str {
        match self {
            Self::Int => "int",
            Self::Float => "float",
            Self::Str => "str",
            Self::Boolean => "boolean",
            Self::Image => "image",
            Self::ImageArray => "image_array",
            Self::List => "list",
            Self::Tuple => "tuple",
            Self::Dict => "dict",
            Self::Blob => "blob",
            Self::Other(name) => name,
        }
    }

    pub fn parse(name: &str) -> Self {
        match name.trim().to_ascii_lowercase().as_str() {
            "int" | "integer" => Self::Int,
            "float" | "real" => Self::Float,
            "str" | "string" | "text" => Self::Str,
            "boolean" | "bool" => Self::Boolean,
            "image" => Self::Image,
            "image_array" => Self::ImageArray,
            "list" => Self::List,
            "tuple" => Self::Tuple,
            "dict" => Self::Dict,
            "blob" => Self::Blob,
            _ => Self::Other(name.to_string()),
        }
    }

    /// Kinds stored inline in a JSON record document.
    pub fn is_scalar(&self) -> bool {
        matches!(self, Self::Int | Self::Float | Self::Str | Self::Boolean)
    }

    /// Kinds persisted as side files by the file store.
    pub fn is_image(&self) -> bool {
        matches!(self, Self::Image | Self::ImageArray)
    }
}

impl FromStr for Kind {
    type Err = Infallible;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self::parse(s))
    }
}

impl From<String> for Kind {
    fn from(s: String) -> Self {
        Self::parse(&s)
    }
}

impl From<Kind> for String {
    fn from(k: Kind) -> Self {
        k.name().to_string()
    }
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
