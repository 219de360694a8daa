//! Row materialization.
//!
//! Every backend row becomes a [`JsonRow`] (column name to JSON value, in
//! select order) before it is deserialized into the caller's type.
//!
//! MySQL and PostgreSQL columns are decoded from their declared type, falling
//! back to text when the declared type has no richer decoder. SQLite columns
//! are dynamically typed, so decoding follows the storage class of each value
//! and the declared type is only used to recognise booleans and JSON text.
//!
//! Binary values become base64 strings, exact numerics become decimal strings
//! and temporal values become their ISO-8601 text. PostgreSQL intervals
//! become `{months, days, microseconds}` objects.

use crate::error::{SqlMapError, SqlMapResult};
use crate::models::DatabaseType;
use serde_json::Value as JsonValue;
use sqlx::error::BoxDynError;
use sqlx::mysql::{MySqlRow, MySqlTypeInfo, MySqlValueRef};
use sqlx::postgres::types::PgInterval;
use sqlx::postgres::{PgRow, PgTypeInfo, PgValueFormat, PgValueRef};
use sqlx::sqlite::SqliteRow;
use sqlx::{Column, Decode, MySql, Postgres, Row, Type, TypeInfo};

/// One materialized row, keyed by column name in select order.
pub type JsonRow = serde_json::Map<String, JsonValue>;

/// Shape of a column's values, derived from its declared type name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ColumnKind {
    Integer,
    Float,
    Numeric,
    Bool,
    Text,
    Bytes,
    Json,
    Uuid,
    DateTime,
    DateTimeTz,
    Date,
    Time,
    Interval,
    Other,
}

/// Substring rules applied in order once exact names have been checked.
const KIND_FRAGMENTS: &[(&str, ColumnKind)] = &[
    ("decimal", ColumnKind::Numeric),
    ("numeric", ColumnKind::Numeric),
    ("serial", ColumnKind::Integer),
    ("float", ColumnKind::Float),
    ("double", ColumnKind::Float),
    ("blob", ColumnKind::Bytes),
    ("binary", ColumnKind::Bytes),
    ("char", ColumnKind::Text),
    ("text", ColumnKind::Text),
];

impl ColumnKind {
    pub(crate) fn of(type_name: &str, db: DatabaseType) -> Self {
        let name = type_name.trim().to_ascii_lowercase();
        match name.as_str() {
            "bool" | "boolean" => Self::Bool,
            "json" | "jsonb" => Self::Json,
            "uuid" => Self::Uuid,
            "date" => Self::Date,
            "time" | "time without time zone" => Self::Time,
            "timestamptz" | "timestamp with time zone" => Self::DateTimeTz,
            "timestamp" | "timestamp without time zone" | "datetime" => Self::DateTime,
            // NUMERIC is an affinity in SQLite, not an exact type
            "numeric" if db == DatabaseType::SQLite => Self::Float,
            "real" | "float4" | "float8" => Self::Float,
            "bytea" => Self::Bytes,
            "name" => Self::Text,
            "interval" => Self::Interval,
            _ if is_integer_type(&name) => Self::Integer,
            _ => KIND_FRAGMENTS
                .iter()
                .find(|(fragment, _)| name.contains(fragment))
                .map_or(Self::Other, |(_, kind)| *kind),
        }
    }
}

/// INT, INTEGER, INT2/4/8 and TINYINT through BIGINT, with or without
/// modifiers such as UNSIGNED. Names merely containing "int" (INTERVAL,
/// POINT, INT4RANGE, INT4[]) do not count.
fn is_integer_type(name: &str) -> bool {
    name.split_whitespace().any(|word| {
        let base = ["tiny", "small", "medium", "big"]
            .iter()
            .find_map(|size| word.strip_prefix(size))
            .unwrap_or(word);
        matches!(base, "int" | "integer" | "int2" | "int4" | "int8")
    })
}

/// Exact numeric value kept as its decimal text.
#[derive(Debug)]
pub(crate) struct NumericText(pub String);

fn is_numeric_name(name: &str) -> bool {
    let name = name.to_ascii_lowercase();
    name.contains("decimal") || name.contains("numeric")
}

impl Type<MySql> for NumericText {
    fn type_info() -> MySqlTypeInfo {
        <String as Type<MySql>>::type_info()
    }

    fn compatible(ty: &MySqlTypeInfo) -> bool {
        is_numeric_name(ty.name())
    }
}

impl<'r> Decode<'r, MySql> for NumericText {
    // DECIMAL travels as text in both MySQL protocols
    fn decode(value: MySqlValueRef<'r>) -> Result<Self, BoxDynError> {
        Ok(Self(<&str as Decode<MySql>>::decode(value)?.to_string()))
    }
}

impl Type<Postgres> for NumericText {
    fn type_info() -> PgTypeInfo {
        <String as Type<Postgres>>::type_info()
    }

    fn compatible(ty: &PgTypeInfo) -> bool {
        is_numeric_name(ty.name())
    }
}

impl<'r> Decode<'r, Postgres> for NumericText {
    fn decode(value: PgValueRef<'r>) -> Result<Self, BoxDynError> {
        match value.format() {
            PgValueFormat::Text => Ok(Self(<&str as Decode<Postgres>>::decode(value)?.to_string())),
            PgValueFormat::Binary => {
                let bytes = <&[u8] as Decode<Postgres>>::decode(value)?;
                pg_numeric_text(bytes)
                    .map(Self)
                    .ok_or_else(|| "malformed binary NUMERIC value".into())
            }
        }
    }
}

/// Render a binary PostgreSQL NUMERIC as decimal text.
///
/// The wire value is `ndigits, weight, sign, dscale` followed by `ndigits`
/// base-10000 digit groups, all big-endian 16-bit words.
fn pg_numeric_text(buf: &[u8]) -> Option<String> {
    let word = |i: usize| {
        buf.get(i * 2..i * 2 + 2)
            .map(|b| i16::from_be_bytes([b[0], b[1]]))
    };
    let ndigits = usize::try_from(word(0)?).ok()?;
    let weight = i32::from(word(1)?);
    let sign = word(2)? as u16;
    let dscale = usize::try_from(word(3)?).ok()?;

    match sign {
        0xC000 => return Some("NaN".to_string()),
        0xD000 => return Some("Infinity".to_string()),
        0xF000 => return Some("-Infinity".to_string()),
        _ => {}
    }
    let groups: Vec<i16> = (0..ndigits).map(|i| word(4 + i)).collect::<Option<_>>()?;
    let group = |i: i32| {
        usize::try_from(i)
            .ok()
            .and_then(|i| groups.get(i).copied())
            .unwrap_or(0)
    };

    let mut text = String::new();
    if sign == 0x4000 {
        text.push('-');
    }
    if weight < 0 {
        text.push('0');
    } else {
        text.push_str(&group(0).to_string());
        for i in 1..=weight {
            text.push_str(&format!("{:04}", group(i)));
        }
    }
    if dscale > 0 {
        let mut fraction = String::new();
        let mut i = weight + 1;
        while fraction.len() < dscale {
            fraction.push_str(&format!("{:04}", group(i)));
            i += 1;
        }
        fraction.truncate(dscale);
        text.push('.');
        text.push_str(&fraction);
    }
    Some(text)
}

/// Encode binary data as a base64 JSON string.
pub fn encode_binary_value(bytes: &[u8]) -> JsonValue {
    use base64::{Engine as _, engine::general_purpose::STANDARD};
    JsonValue::String(STANDARD.encode(bytes))
}

/// Non-finite floats have no JSON number form.
fn float_value(v: f64) -> JsonValue {
    serde_json::Number::from_f64(v)
        .map(JsonValue::Number)
        .unwrap_or_else(|| JsonValue::String(v.to_string()))
}

fn json_text(v: String) -> JsonValue {
    serde_json::from_str::<JsonValue>(&v).unwrap_or(JsonValue::String(v))
}

fn display_value(v: impl std::fmt::Display) -> JsonValue {
    JsonValue::String(v.to_string())
}

/// Intervals keep their three components; months and days have no fixed
/// length in microseconds.
fn interval_value(months: i32, days: i32, microseconds: i64) -> JsonValue {
    serde_json::json!({
        "months": months,
        "days": days,
        "microseconds": microseconds,
    })
}

/// Decode with the first listed type the column accepts.
///
/// Evaluates to `None` when no listed type is compatible.
macro_rules! first_decoded {
    ($row:expr, $idx:expr; $($ty:ty => $to_json:expr),+ $(,)?) => {{
        let mut value: Option<JsonValue> = None;
        $(
            if value.is_none() {
                if let Ok(v) = $row.try_get::<Option<$ty>, _>($idx) {
                    value = Some(v.map_or(JsonValue::Null, $to_json));
                }
            }
        )+
        value
    }};
}

/// Converts a database row to a [`JsonRow`].
pub trait RowToJson {
    fn to_json_map(&self) -> SqlMapResult<JsonRow>;
}

fn undecodable(column: &str, type_name: &str) -> SqlMapError {
    SqlMapError::decode(format!(
        "column '{}' of type {} has no JSON representation",
        column, type_name
    ))
}

impl RowToJson for MySqlRow {
    fn to_json_map(&self) -> SqlMapResult<JsonRow> {
        let mut map = JsonRow::with_capacity(self.columns().len());
        for (idx, col) in self.columns().iter().enumerate() {
            let type_name = col.type_info().name();
            let value = mysql_value(self, idx, ColumnKind::of(type_name, DatabaseType::MySQL))
                .ok_or_else(|| undecodable(col.name(), type_name))?;
            map.insert(col.name().to_string(), value);
        }
        Ok(map)
    }
}

impl RowToJson for PgRow {
    fn to_json_map(&self) -> SqlMapResult<JsonRow> {
        let mut map = JsonRow::with_capacity(self.columns().len());
        for (idx, col) in self.columns().iter().enumerate() {
            let type_name = col.type_info().name();
            let value = pg_value(self, idx, ColumnKind::of(type_name, DatabaseType::PostgreSQL))
                .ok_or_else(|| undecodable(col.name(), type_name))?;
            map.insert(col.name().to_string(), value);
        }
        Ok(map)
    }
}

impl RowToJson for SqliteRow {
    fn to_json_map(&self) -> SqlMapResult<JsonRow> {
        let mut map = JsonRow::with_capacity(self.columns().len());
        for (idx, col) in self.columns().iter().enumerate() {
            let declared = ColumnKind::of(col.type_info().name(), DatabaseType::SQLite);
            map.insert(col.name().to_string(), sqlite_value(self, idx, declared)?);
        }
        Ok(map)
    }
}

fn mysql_value(row: &MySqlRow, idx: usize, kind: ColumnKind) -> Option<JsonValue> {
    use chrono::{NaiveDate, NaiveDateTime, NaiveTime};

    let typed = match kind {
        ColumnKind::Integer => first_decoded!(row, idx;
            i64 => JsonValue::from,
            u64 => JsonValue::from,
            i32 => JsonValue::from,
            u32 => JsonValue::from,
            i16 => JsonValue::from,
            u16 => JsonValue::from,
            i8 => JsonValue::from,
            u8 => JsonValue::from,
        ),
        ColumnKind::Float => first_decoded!(row, idx;
            f64 => float_value,
            f32 => |v: f32| float_value(f64::from(v)),
        ),
        ColumnKind::Numeric => first_decoded!(row, idx; NumericText => |v: NumericText| JsonValue::String(v.0)),
        ColumnKind::Bool => first_decoded!(row, idx; bool => JsonValue::Bool),
        ColumnKind::Bytes => first_decoded!(row, idx; Vec<u8> => |v: Vec<u8>| encode_binary_value(&v)),
        ColumnKind::Json => first_decoded!(row, idx; JsonValue => |v: JsonValue| v),
        ColumnKind::DateTime | ColumnKind::DateTimeTz => {
            first_decoded!(row, idx; NaiveDateTime => display_value)
        }
        ColumnKind::Date => first_decoded!(row, idx; NaiveDate => display_value),
        ColumnKind::Time => first_decoded!(row, idx; NaiveTime => display_value),
        ColumnKind::Text | ColumnKind::Uuid | ColumnKind::Interval | ColumnKind::Other => None,
    };
    typed.or_else(|| mysql_text(row, idx))
}

fn mysql_text(row: &MySqlRow, idx: usize) -> Option<JsonValue> {
    if let Some(value) = first_decoded!(row, idx; String => JsonValue::String) {
        return Some(value);
    }
    // Text protocol results (no bound params) arrive as bytes
    row.try_get_unchecked::<Option<Vec<u8>>, _>(idx)
        .ok()
        .map(|v| match v {
            None => JsonValue::Null,
            Some(bytes) => match String::from_utf8(bytes) {
                Ok(s) => JsonValue::String(s),
                Err(e) => encode_binary_value(e.as_bytes()),
            },
        })
}

fn pg_value(row: &PgRow, idx: usize, kind: ColumnKind) -> Option<JsonValue> {
    use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};

    let typed = match kind {
        ColumnKind::Integer => first_decoded!(row, idx;
            i64 => JsonValue::from,
            i32 => JsonValue::from,
            i16 => JsonValue::from,
            i8 => JsonValue::from,
        ),
        ColumnKind::Float => first_decoded!(row, idx;
            f64 => float_value,
            f32 => |v: f32| float_value(f64::from(v)),
        ),
        ColumnKind::Numeric => first_decoded!(row, idx; NumericText => |v: NumericText| JsonValue::String(v.0)),
        ColumnKind::Bool => first_decoded!(row, idx; bool => JsonValue::Bool),
        ColumnKind::Bytes => first_decoded!(row, idx; Vec<u8> => |v: Vec<u8>| encode_binary_value(&v)),
        ColumnKind::Json => first_decoded!(row, idx; JsonValue => |v: JsonValue| v),
        ColumnKind::Uuid => first_decoded!(row, idx; uuid::Uuid => display_value),
        ColumnKind::DateTimeTz => {
            first_decoded!(row, idx; DateTime<Utc> => |v: DateTime<Utc>| JsonValue::String(v.to_rfc3339()))
        }
        ColumnKind::DateTime => first_decoded!(row, idx; NaiveDateTime => display_value),
        ColumnKind::Date => first_decoded!(row, idx; NaiveDate => display_value),
        ColumnKind::Time => first_decoded!(row, idx; NaiveTime => display_value),
        ColumnKind::Interval => first_decoded!(row, idx; PgInterval => |v: PgInterval| {
            interval_value(v.months, v.days, v.microseconds)
        }),
        ColumnKind::Text | ColumnKind::Other => None,
    };
    typed.or_else(|| first_decoded!(row, idx; String => JsonValue::String))
}

fn sqlite_value(row: &SqliteRow, idx: usize, declared: ColumnKind) -> SqlMapResult<JsonValue> {
    use sqlx::ValueRef;

    let raw = row.try_get_raw(idx)?;
    if raw.is_null() {
        return Ok(JsonValue::Null);
    }
    let storage = raw.type_info().name().to_ascii_uppercase();

    // Storage classes are fixed per value, so unchecked reads cannot mismatch
    let value = match storage.as_str() {
        "INTEGER" if declared == ColumnKind::Bool => {
            JsonValue::Bool(row.try_get_unchecked::<i64, _>(idx)? != 0)
        }
        "INTEGER" => JsonValue::from(row.try_get_unchecked::<i64, _>(idx)?),
        "REAL" => float_value(row.try_get_unchecked::<f64, _>(idx)?),
        "BLOB" => encode_binary_value(&row.try_get_unchecked::<Vec<u8>, _>(idx)?),
        _ => {
            let text = row.try_get_unchecked::<String, _>(idx)?;
            if declared == ColumnKind::Json {
                json_text(text)
            } else {
                JsonValue::String(text)
            }
        }
    };
    Ok(value)
}
