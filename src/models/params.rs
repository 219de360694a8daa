//! Statement parameters.
//!
//! A [`Params`] bag holds named values in insertion order. Named placeholders
//! in statement text are resolved against it by name; positional statements
//! bind the values in the order they were added.

use crate::error::{SqlMapError, SqlMapResult};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// Default statement timeout in seconds when neither the statement nor the
/// mapper specifies one.
pub const DEFAULT_QUERY_TIMEOUT_SECS: u64 = 30;

/// A parameter value for parameterized statements.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged, try_from = "JsonValue")]
pub enum Param {
    Null,
    Bool(bool),
    /// Stored as i64 for maximum range
    Int(i64),
    Float(f64),
    String(String),
    /// Binary data (base64 encoded in JSON)
    #[serde(serialize_with = "base64_bytes::serialize")]
    Bytes(Vec<u8>),
    /// Nested arrays/objects, bound as JSON
    Json(JsonValue),
}

impl Param {
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Get the type name of this parameter for debugging.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Bool(_) => "bool",
            Self::Int(_) => "int",
            Self::Float(_) => "float",
            Self::String(_) => "string",
            Self::Bytes(_) => "bytes",
            Self::Json(_) => "json",
        }
    }

    /// Convert a JSON value into a parameter.
    ///
    /// Integers above `i64::MAX` are rejected rather than rounded to a float.
    pub fn from_json(value: JsonValue) -> SqlMapResult<Self> {
        Ok(match value {
            JsonValue::Null => Self::Null,
            JsonValue::Bool(b) => Self::Bool(b),
            JsonValue::Number(n) => match n.as_i64() {
                Some(i) => Self::Int(i),
                None if n.is_u64() => return Err(out_of_range(n)),
                None => n
                    .as_f64()
                    .map(Self::Float)
                    .unwrap_or_else(|| Self::String(n.to_string())),
            },
            JsonValue::String(s) => Self::String(s),
            other => Self::Json(other),
        })
    }
}

fn out_of_range(value: impl std::fmt::Display) -> SqlMapError {
    SqlMapError::invalid_parameter(format!(
        "integer {} does not fit a signed 64-bit parameter",
        value
    ))
}

macro_rules! impl_param_from {
    ($($ty:ty => $variant:ident),+ $(,)?) => {
        $(
            impl From<$ty> for Param {
                fn from(v: $ty) -> Self {
                    Param::$variant(v.into())
                }
            }
        )+
    };
}

impl_param_from!(
    bool => Bool,
    i8 => Int,
    i16 => Int,
    i32 => Int,
    i64 => Int,
    u8 => Int,
    u16 => Int,
    u32 => Int,
    f32 => Float,
    f64 => Float,
    String => String,
    Vec<u8> => Bytes,
);

impl From<&str> for Param {
    fn from(v: &str) -> Self {
        Param::String(v.to_string())
    }
}

impl TryFrom<u64> for Param {
    type Error = SqlMapError;

    fn try_from(v: u64) -> SqlMapResult<Self> {
        i64::try_from(v).map(Param::Int).map_err(|_| out_of_range(v))
    }
}

impl TryFrom<JsonValue> for Param {
    type Error = SqlMapError;

    fn try_from(v: JsonValue) -> SqlMapResult<Self> {
        Param::from_json(v)
    }
}

impl<T: Into<Param>> From<Option<T>> for Param {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(Param::Null)
    }
}

/// Binary data serializes as base64. Deserializing always goes through
/// [`Param::from_json`], where a base64 string stays a string.
mod base64_bytes {
    use base64::{Engine as _, engine::general_purpose::STANDARD};
    use serde::{Serialize, Serializer};

    pub fn serialize<S>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        STANDARD.encode(bytes).serialize(serializer)
    }
}

/// Named parameter bag, kept in insertion order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Params {
    entries: Vec<(String, Param)>,
}

impl Params {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a value, replacing any earlier value with the same name
    /// (names compare case-insensitively, keeping the first position).
    pub fn with(mut self, name: impl Into<String>, value: impl Into<Param>) -> Self {
        self.insert(name, value);
        self
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<Param>) {
        let name = name.into();
        let value = value.into();
        match self
            .entries
            .iter_mut()
            .find(|(existing, _)| existing.eq_ignore_ascii_case(&name))
        {
            Some(entry) => entry.1 = value,
            None => self.entries.push((name, value)),
        }
    }

    /// Build a bag from any serializable struct or map.
    ///
    /// Field order follows serialization order; `()` and `None` give an empty bag.
    pub fn from_serialize<T: Serialize + ?Sized>(value: &T) -> SqlMapResult<Self> {
        let json = serde_json::to_value(value).map_err(|e| {
            SqlMapError::configuration(
                format!("Parameters could not be serialized: {}", e),
                "Pass a struct or map with named fields",
            )
        })?;
        match json {
            JsonValue::Null => Ok(Self::new()),
            JsonValue::Object(map) => Ok(Self {
                entries: map
                    .into_iter()
                    .map(|(k, v)| Param::from_json(v).map(|param| (k, param)))
                    .collect::<SqlMapResult<_>>()?,
            }),
            other => Err(SqlMapError::configuration(
                format!("Parameters must be a named-field object, got {}", json_kind(&other)),
                "Wrap scalar values in a struct or use Params::new().with(name, value)",
            )),
        }
    }

    /// Look a parameter up by name (case-insensitive).
    pub fn get(&self, name: &str) -> Option<&Param> {
        self.entries
            .iter()
            .find(|(existing, _)| existing.eq_ignore_ascii_case(name))
            .map(|(_, v)| v)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Values in insertion order, used for positional binding.
    pub fn values(&self) -> impl Iterator<Item = &Param> {
        self.entries.iter().map(|(_, v)| v)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(k, _)| k.as_str())
    }
}

fn json_kind(value: &JsonValue) -> &'static str {
    match value {
        JsonValue::Null => "null",
        JsonValue::Bool(_) => "bool",
        JsonValue::Number(_) => "number",
        JsonValue::String(_) => "string",
        JsonValue::Array(_) => "array",
        JsonValue::Object(_) => "object",
    }
}
