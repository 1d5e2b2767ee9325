//! Codec registry: how each channel kind is turned into a storable value and back.
//!
//! The file store only needs the scalar/image split from [`Kind`]; the
//! SQLite store routes every column through this registry, including the
//! native column type for its DDL.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use crate::errors::{Result, TubError};
use crate::value::{Kind, Value};
use crate::wire::{decode_value, encode_value};

/// Native SQLite column affinities a kind may map to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StorageTag {
    Text,
    Blob,
    Real,
    Integer,
}

impl StorageTag {
    pub fn as_sql(&self) -> &'static str {
        match self {
            Self::Text => "TEXT",
            Self::Blob => "BLOB",
            Self::Real => "REAL",
            Self::Integer => "INTEGER",
        }
    }
}

impl FromStr for StorageTag {
    type Err = TubError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "TEXT" => Ok(Self::Text),
            "BLOB" => Ok(Self::Blob),
            "REAL" => Ok(Self::Real),
            "INTEGER" => Ok(Self::Integer),
            _ => Err(TubError::InvalidConfiguration(format!(
                "unrecognized storage tag '{s}', expected TEXT, BLOB, REAL or INTEGER"
            ))),
        }
    }
}

impl fmt::Display for StorageTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_sql())
    }
}

/// The storable form of a value.
#[derive(Debug, Clone, PartialEq)]
pub enum Stored {
    Integer(i64),
    Real(f64),
    Text(String),
    Blob(Vec<u8>),
}

impl Stored {
    fn type_name(&self) -> &'static str {
        match self {
            Self::Integer(_) => "integer",
            Self::Real(_) => "real",
            Self::Text(_) => "text",
            Self::Blob(_) => "blob",
        }
    }
}

pub type EncodeFn = Arc<dyn Fn(&Value) -> Result<Stored> + Send + Sync>;
pub type DecodeFn = Arc<dyn Fn(&Stored) -> Result<Value> + Send + Sync>;

#[derive(Clone)]
pub struct Codec {
    pub encode: EncodeFn,
    pub decode: DecodeFn,
    pub storage_tag: Option<StorageTag>,
}

impl fmt::Debug for Codec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Codec")
            .field("storage_tag", &self.storage_tag)
            .finish_non_exhaustive()
    }
}

fn mismatch(kind: &str, actual: &str) -> TubError {
    TubError::TypeMismatch {
        kind: kind.to_string(),
        actual: actual.to_string(),
    }
}

/// Built-in codec for a known kind. Image kinds have none.
fn builtin_codec(kind: &Kind) -> Option<Codec> {
    let codec = match kind {
        Kind::Int => Codec {
            encode: Arc::new(|v: &Value| match v {
                Value::Int(i) => Ok(Stored::Integer(*i)),
                other => Err(mismatch("int", other.type_name())),
            }),
            decode: Arc::new(|s: &Stored| match s {
                Stored::Integer(i) => Ok(Value::Int(*i)),
                other => Err(mismatch("int", other.type_name())),
            }),
            storage_tag: Some(StorageTag::Integer),
        },
        Kind::Float => Codec {
            encode: Arc::new(|v: &Value| match v {
                Value::Float(f) => Ok(Stored::Real(*f)),
                Value::Int(i) => Ok(Stored::Real(*i as f64)),
                other => Err(mismatch("float", other.type_name())),
            }),
            decode: Arc::new(|s: &Stored| match s {
                Stored::Real(f) => Ok(Value::Float(*f)),
                // REAL affinity stores integral floats as integers.
                Stored::Integer(i) => Ok(Value::Float(*i as f64)),
                other => Err(mismatch("float", other.type_name())),
            }),
            storage_tag: Some(StorageTag::Real),
        },
        Kind::Str => Codec {
            encode: Arc::new(|v: &Value| match v {
                Value::Str(s) => Ok(Stored::Text(s.clone())),
                other => Err(mismatch("str", other.type_name())),
            }),
            decode: Arc::new(|s: &Stored| match s {
                Stored::Text(t) => Ok(Value::Str(t.clone())),
                other => Err(mismatch("str", other.type_name())),
            }),
            storage_tag: Some(StorageTag::Text),
        },
        Kind::Boolean => Codec {
            encode: Arc::new(|v: &Value| match v {
                Value::Bool(b) => Ok(Stored::Integer(*b as i64)),
                other => Err(mismatch("boolean", other.type_name())),
            }),
            decode: Arc::new(|s: &Stored| match s {
                Stored::Integer(i) => Ok(Value::Bool(*i != 0)),
                other => Err(mismatch("boolean", other.type_name())),
            }),
            storage_tag: Some(StorageTag::Integer),
        },
        Kind::List | Kind::Tuple | Kind::Dict | Kind::Blob => {
            let name = kind.name().to_string();
            let enc_name = name.clone();
            let check = kind.clone();
            Codec {
                encode: Arc::new(move |v: &Value| {
                    let ok = match (&check, v) {
                        (Kind::List | Kind::Tuple, Value::List(_)) => true,
                        (Kind::Dict, Value::Map(_)) => true,
                        (Kind::Blob, _) => true,
                        _ => false,
                    };
                    if !ok {
                        return Err(mismatch(&enc_name, v.type_name()));
                    }
                    Ok(Stored::Blob(encode_value(v)))
                }),
                decode: Arc::new(move |s: &Stored| match s {
                    Stored::Blob(b) => decode_value(b),
                    other => Err(mismatch(&name, other.type_name())),
                }),
                storage_tag: Some(StorageTag::Blob),
            }
        }
        Kind::Image | Kind::ImageArray | Kind::Other(_) => return None,
    };
    Some(codec)
}

/// Kind name → codec table.
#[derive(Debug, Clone)]
pub struct CodecRegistry {
    codecs: HashMap<String, Codec>,
}

impl Default for CodecRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl CodecRegistry {
    /// A registry with every built-in kind registered.
    pub fn new() -> Self {
        let mut codecs = HashMap::new();
        for kind in [
            Kind::Int,
            Kind::Float,
            Kind::Str,
            Kind::Boolean,
            Kind::List,
            Kind::Tuple,
            Kind::Dict,
            Kind::Blob,
        ] {
            if let Some(codec) = builtin_codec(&kind) {
                codecs.insert(kind.name().to_string(), codec);
            }
        }
        Self { codecs }
    }

    /// A registry with nothing registered.
    pub fn empty() -> Self {
        Self {
            codecs: HashMap::new(),
        }
    }

    // Aliases ("integer", "string") resolve to the canonical name.
    fn key(kind: &str) -> String {
        Kind::parse(kind).name().to_string()
    }

    /// Register (or replace) the codec for `kind`.
    pub fn register(
        &mut self,
        kind: &str,
        encode: EncodeFn,
        decode: DecodeFn,
        storage_tag: Option<&str>,
    ) -> Result<()> {
        let storage_tag = storage_tag.map(StorageTag::from_str).transpose()?;
        self.codecs.insert(
            Self::key(kind),
            Codec {
                encode,
                decode,
                storage_tag,
            },
        );
        Ok(())
    }

    pub fn contains(&self, kind: &str) -> bool {
        self.codecs.contains_key(&Self::key(kind))
    }

    fn get(&self, kind: &str) -> Result<&Codec> {
        self.codecs
            .get(&Self::key(kind))
            .ok_or_else(|| TubError::UnknownKind(kind.to_string()))
    }

    pub fn encode(&self, kind: &str, value: &Value) -> Result<Stored> {
        (self.get(kind)?.encode)(value)
    }

    pub fn decode(&self, kind: &str, stored: &Stored) -> Result<Value> {
        (self.get(kind)?.decode)(stored)
    }

    pub fn storage_tag(&self, kind: &str) -> Result<StorageTag> {
        self.get(kind)?
            .storage_tag
            .ok_or_else(|| TubError::MissingStorageTag(kind.to_string()))
    }

    /// Self-test hook: does `value` survive encode then decode?
    pub fn round_trip_check(&self, kind: &str, value: &Value) -> Result<bool> {
        let stored = self.encode(kind, value)?;
        Ok(self.decode(kind, &stored)? == *value)
    }

    pub fn encode_many(&self, kinds: &[Kind], values: &[Value]) -> Result<Vec<Stored>> {
        if kinds.len() != values.len() {
            return Err(TubError::InvalidConfiguration(format!(
                "{} values for {} kinds",
                values.len(),
                kinds.len()
            )));
        }
        kinds
            .iter()
            .zip(values)
            .map(|(k, v)| self.encode(k.name(), v))
            .collect()
    }

    pub fn decode_many(&self, kinds: &[Kind], stored: &[Stored]) -> Result<Vec<Value>> {
        if kinds.len() != stored.len() {
            return Err(TubError::InvalidConfiguration(format!(
                "{} stored values for {} kinds",
                stored.len(),
                kinds.len()
            )));
        }
        kinds
            .iter()
            .zip(stored)
            .map(|(k, s)| self.decode(k.name(), s))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn test_builtin_round_trips() {
        let reg = CodecRegistry::new();
        let mut map = BTreeMap::new();
        map.insert("k".to_string(), Value::List(vec![Value::Int(1), Value::Float(2.5)]));

        let cases = vec![
            ("int", Value::Int(-42)),
            ("float", Value::Float(0.125)),
            ("str", Value::Str("user".into())),
            ("boolean", Value::Bool(true)),
            ("list", Value::List(vec![Value::Int(1), Value::Str("a".into())])),
            ("tuple", Value::List(vec![Value::Float(1.0), Value::Float(2.0)])),
            ("dict", Value::Map(map)),
            ("blob", Value::Bytes(vec![1, 2, 3])),
        ];
        for (kind, value) in cases {
            assert!(reg.round_trip_check(kind, &value).unwrap(), "kind {kind}");
        }
    }

    #[test]
    fn test_storage_tags() {
        let reg = CodecRegistry::new();
        assert_eq!(reg.storage_tag("int").unwrap(), StorageTag::Integer);
        assert_eq!(reg.storage_tag("integer").unwrap(), StorageTag::Integer);
        assert_eq!(reg.storage_tag("float").unwrap(), StorageTag::Real);
        assert_eq!(reg.storage_tag("string").unwrap(), StorageTag::Text);
        assert_eq!(reg.storage_tag("dict").unwrap(), StorageTag::Blob);
    }

    #[test]
    fn test_unknown_kind() {
        let reg = CodecRegistry::new();
        assert!(matches!(
            reg.encode("lidar", &Value::Int(1)),
            Err(TubError::UnknownKind(_))
        ));
        assert!(matches!(
            reg.storage_tag("image_array"),
            Err(TubError::UnknownKind(_))
        ));
    }

    #[test]
    fn test_register_without_tag() {
        let mut reg = CodecRegistry::new();
        reg.register(
            "celsius",
            Arc::new(|v: &Value| -> Result<Stored> {
                Ok(Stored::Real(v.as_f64().unwrap_or(0.0)))
            }),
            Arc::new(|s: &Stored| -> Result<Value> {
                match s {
                    Stored::Real(f) => Ok(Value::Float(*f)),
                    _ => Ok(Value::Null),
                }
            }),
            None,
        )
        .unwrap();
        assert!(reg.round_trip_check("celsius", &Value::Float(21.5)).unwrap());
        assert!(matches!(
            reg.storage_tag("celsius"),
            Err(TubError::MissingStorageTag(_))
        ));
    }

    #[test]
    fn test_register_bad_tag() {
        let mut reg = CodecRegistry::new();
        let err = reg
            .register(
                "x",
                Arc::new(|_: &Value| -> Result<Stored> { Ok(Stored::Integer(0)) }),
                Arc::new(|_: &Stored| -> Result<Value> { Ok(Value::Null) }),
                Some("VARCHAR"),
            )
            .unwrap_err();
        assert!(matches!(err, TubError::InvalidConfiguration(_)));
        assert!(!reg.contains("x"));
    }

    #[test]
    fn test_register_overwrites() {
        let mut reg = CodecRegistry::new();
        reg.register(
            "int",
            Arc::new(|_: &Value| -> Result<Stored> { Ok(Stored::Text("fixed".into())) }),
            Arc::new(|_: &Stored| -> Result<Value> { Ok(Value::Int(0)) }),
            Some("text"),
        )
        .unwrap();
        assert_eq!(reg.storage_tag("int").unwrap(), StorageTag::Text);
        assert_eq!(
            reg.encode("int", &Value::Int(5)).unwrap(),
            Stored::Text("fixed".into())
        );
    }

    #[test]
    fn test_type_mismatch() {
        let reg = CodecRegistry::new();
        assert!(matches!(
            reg.encode("int", &Value::Str("1".into())),
            Err(TubError::TypeMismatch { .. })
        ));
        assert!(reg.encode("dict", &Value::Int(1)).is_err());
    }

    #[test]
    fn test_many_arity() {
        let reg = CodecRegistry::new();
        let kinds = [Kind::Float, Kind::Str];
        let stored = reg
            .encode_many(&kinds, &[Value::Float(1.5), Value::Str("a".into())])
            .unwrap();
        let back = reg.decode_many(&kinds, &stored).unwrap();
        assert_eq!(back, vec![Value::Float(1.5), Value::Str("a".into())]);
        assert!(reg.encode_many(&kinds, &[Value::Float(1.5)]).is_err());
    }
}
