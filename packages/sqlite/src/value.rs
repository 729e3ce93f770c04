//! Conversion between the caller-facing [`DynValue`] and the engine-native
//! [`SqlValue`].
//!
//! Numbers are classified explicitly rather than coerced:
//!
//! * integral and within `i32` → `Integer`
//! * integral and exactly representable as `i64` → `Integer`
//! * anything else → `Real`
//!
//! Integers read back from the engine become [`DynValue::Number`] while they
//! stay inside the 53-bit safe range and [`DynValue::BigInt`] beyond it, so no
//! precision is lost in either direction.

use rusqlite::types::{ToSql, ToSqlOutput, ValueRef};
use serde::{Serialize, Serializer};

/// Largest integer an `f64` represents exactly together with all its
/// neighbours (`2^53 - 1`).
pub const MAX_SAFE_INTEGER: i64 = (1 << 53) - 1;

/// `2^63` as an `f64`; the first magnitude that no longer fits in an `i64`.
const I64_BOUND: f64 = 9_223_372_036_854_775_808.0;

/// Dynamic value as produced and consumed by callers.
#[derive(Debug, Clone, PartialEq)]
pub enum DynValue {
    Null,
    Bool(bool),
    Number(f64),
    /// Integer outside the 53-bit safe range of [`DynValue::Number`]
    BigInt(i64),
    String(String),
    Binary(Vec<u8>),
    /// Ordered list, only meaningful as a parameter list
    List(Vec<DynValue>),
}

impl DynValue {
    #[must_use]
    pub const fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    #[must_use]
    #[allow(clippy::missing_const_for_fn)]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(value) => Some(value),
            _ => None,
        }
    }

    #[must_use]
    #[allow(clippy::cast_precision_loss, clippy::missing_const_for_fn)]
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Number(value) => Some(*value),
            Self::BigInt(value) => Some(*value as f64),
            _ => None,
        }
    }

    /// Integer view of the value, if it holds an exact integer.
    #[must_use]
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::BigInt(value) => Some(*value),
            Self::Number(value) => match number_to_sql(*value) {
                SqlValue::Integer(int) => Some(int),
                _ => None,
            },
            _ => None,
        }
    }

    #[must_use]
    pub const fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(value) => Some(*value),
            _ => None,
        }
    }

    #[must_use]
    #[allow(clippy::missing_const_for_fn)]
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Self::Binary(value) => Some(value),
            _ => None,
        }
    }

    #[must_use]
    #[allow(clippy::missing_const_for_fn)]
    pub fn as_list(&self) -> Option<&[Self]> {
        match self {
            Self::List(values) => Some(values),
            _ => None,
        }
    }
}

impl<T: Into<Self>> From<Option<T>> for DynValue {
    fn from(val: Option<T>) -> Self {
        val.map_or(Self::Null, std::convert::Into::into)
    }
}

impl From<bool> for DynValue {
    fn from(val: bool) -> Self {
        Self::Bool(val)
    }
}

impl From<&str> for DynValue {
    fn from(val: &str) -> Self {
        Self::String(val.to_string())
    }
}

impl From<String> for DynValue {
    fn from(val: String) -> Self {
        Self::String(val)
    }
}

impl From<f32> for DynValue {
    fn from(val: f32) -> Self {
        Self::Number(f64::from(val))
    }
}

impl From<f64> for DynValue {
    fn from(val: f64) -> Self {
        Self::Number(val)
    }
}

impl From<i32> for DynValue {
    fn from(val: i32) -> Self {
        Self::Number(f64::from(val))
    }
}

impl From<u32> for DynValue {
    fn from(val: u32) -> Self {
        Self::Number(f64::from(val))
    }
}

impl From<i64> for DynValue {
    #[allow(clippy::cast_precision_loss)]
    fn from(val: i64) -> Self {
        if (-MAX_SAFE_INTEGER..=MAX_SAFE_INTEGER).contains(&val) {
            Self::Number(val as f64)
        } else {
            Self::BigInt(val)
        }
    }
}

impl From<Vec<u8>> for DynValue {
    fn from(val: Vec<u8>) -> Self {
        Self::Binary(val)
    }
}

impl From<&[u8]> for DynValue {
    fn from(val: &[u8]) -> Self {
        Self::Binary(val.to_vec())
    }
}

impl From<Vec<Self>> for DynValue {
    fn from(val: Vec<Self>) -> Self {
        Self::List(val)
    }
}

/// Engine-native value used for binding parameters and reading columns.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
    Blob(Vec<u8>),
}

impl SqlValue {
    /// Name of the storage class, as `typeof()` would report it.
    #[must_use]
    pub const fn type_name(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Integer(_) => "integer",
            Self::Real(_) => "real",
            Self::Text(_) => "text",
            Self::Blob(_) => "blob",
        }
    }
}

impl From<ValueRef<'_>> for SqlValue {
    fn from(value: ValueRef<'_>) -> Self {
        match value {
            ValueRef::Null => Self::Null,
            ValueRef::Integer(value) => Self::Integer(value),
            ValueRef::Real(value) => Self::Real(value),
            // Length-delimited, so embedded NUL bytes survive.
            ValueRef::Text(bytes) => Self::Text(String::from_utf8_lossy(bytes).into_owned()),
            ValueRef::Blob(bytes) => Self::Blob(bytes.to_vec()),
        }
    }
}

impl ToSql for SqlValue {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::Borrowed(match self {
            Self::Null => ValueRef::Null,
            Self::Integer(value) => ValueRef::Integer(*value),
            Self::Real(value) => ValueRef::Real(*value),
            Self::Text(value) => ValueRef::Text(value.as_bytes()),
            Self::Blob(value) => ValueRef::Blob(value),
        }))
    }
}

impl Serialize for SqlValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Null => serializer.serialize_none(),
            Self::Integer(value) => serializer.serialize_i64(*value),
            Self::Real(value) => serializer.serialize_f64(*value),
            Self::Text(value) => serializer.serialize_str(value),
            Self::Blob(value) => value.serialize(serializer),
        }
    }
}

impl From<&DynValue> for SqlValue {
    fn from(value: &DynValue) -> Self {
        to_sql(value)
    }
}

impl From<DynValue> for SqlValue {
    fn from(value: DynValue) -> Self {
        match value {
            DynValue::String(value) => Self::Text(value),
            DynValue::Binary(value) => Self::Blob(value),
            other => to_sql(&other),
        }
    }
}

impl From<SqlValue> for DynValue {
    fn from(value: SqlValue) -> Self {
        from_sql(value)
    }
}

/// Classifies a dynamic number into the narrowest exact SQL representation.
#[must_use]
#[allow(
    clippy::cast_possible_truncation,
    clippy::cast_precision_loss,
    clippy::float_cmp
)]
pub fn number_to_sql(value: f64) -> SqlValue {
    if !value.is_finite() || value.fract() != 0.0 {
        return SqlValue::Real(value);
    }

    if value >= f64::from(i32::MIN) && value <= f64::from(i32::MAX) {
        return SqlValue::Integer(i64::from(value as i32));
    }

    // `as` saturates, so the range check has to happen before the cast.
    if (-I64_BOUND..I64_BOUND).contains(&value) {
        let int = value as i64;
        if int as f64 == value {
            return SqlValue::Integer(int);
        }
    }

    SqlValue::Real(value)
}

/// Converts a dynamic value to its engine-native form. Never fails; values
/// without a scalar representation map to `Null`.
#[must_use]
pub fn to_sql(value: &DynValue) -> SqlValue {
    match value {
        DynValue::Null | DynValue::List(_) => SqlValue::Null,
        DynValue::Bool(value) => SqlValue::Integer(i64::from(*value)),
        DynValue::Number(value) => number_to_sql(*value),
        DynValue::BigInt(value) => SqlValue::Integer(*value),
        DynValue::String(value) => SqlValue::Text(value.clone()),
        DynValue::Binary(value) => SqlValue::Blob(value.clone()),
    }
}

/// Converts an engine-native value back into a dynamic value. Never fails.
#[must_use]
pub fn from_sql(value: SqlValue) -> DynValue {
    match value {
        SqlValue::Null => DynValue::Null,
        SqlValue::Integer(value) => value.into(),
        SqlValue::Real(value) => DynValue::Number(value),
        SqlValue::Text(value) => DynValue::String(value),
        SqlValue::Blob(value) => DynValue::Binary(value),
    }
}

/// Converts a parameter list, flattening nothing: nested lists bind as `Null`.
#[must_use]
pub fn to_sql_params(params: &[DynValue]) -> Vec<SqlValue> {
    params.iter().map(to_sql).collect()
}
