//! The bound/fetched scalar value type.
//!
//! Integer widths smaller than 64 bits are widened; unsigned integers are
//! reinterpreted as signed 64-bit values (callers wanting the unsigned
//! reading back must reinterpret themselves, per §4.3).

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
    Blob(Vec<u8>),
}

impl Value {
    /// Decode as an integer; NULL decodes as zero (engine behaviour, §4.3).
    pub fn as_i64(&self) -> i64 {
        match self {
            Value::Integer(v) => *v,
            Value::Real(v) => *v as i64,
            Value::Null => 0,
            Value::Text(s) => s.parse().unwrap_or(0),
            Value::Blob(_) => 0,
        }
    }

    /// Decode as a float; NULL decodes as quiet NaN (§4.3) so numeric
    /// consumers can treat it as a sentinel.
    pub fn as_f64(&self) -> f64 {
        match self {
            Value::Real(v) => *v,
            Value::Integer(v) => *v as f64,
            Value::Null => f64::NAN,
            Value::Text(s) => s.parse().unwrap_or(f64::NAN),
            Value::Blob(_) => f64::NAN,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s.as_str()),
            _ => None,
        }
    }

    pub fn as_blob(&self) -> Option<&[u8]> {
        match self {
            Value::Blob(b) => Some(b.as_slice()),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }
}

macro_rules! impl_from_int {
    ($($t:ty),+) => {
        $(impl From<$t> for Value {
            fn from(v: $t) -> Self { Value::Integer(v as i64) }
        })+
    };
}
impl_from_int!(i8, i16, i32, i64, u8, u16, u32);

// Wider unsigned integers are reinterpreted as signed 64-bit, per §4.3:
// callers wanting the logical unsigned value back must re-interpret.
impl From<u64> for Value {
    fn from(v: u64) -> Self {
        Value::Integer(v as i64)
    }
}

impl From<f32> for Value {
    fn from(v: f32) -> Self {
        Value::Real(v as f64)
    }
}
impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Real(v)
    }
}
impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_owned())
    }
}
impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}
impl From<&[u8]> for Value {
    fn from(v: &[u8]) -> Self {
        Value::Blob(v.to_vec())
    }
}
impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Value::Blob(v)
    }
}

impl rusqlite::types::ToSql for Value {
    fn to_sql(&self) -> rusqlite::Result<rusqlite::types::ToSqlOutput<'_>> {
        use rusqlite::types::{ToSqlOutput, Value as SqlValue};
        Ok(match self {
            Value::Null => ToSqlOutput::Owned(SqlValue::Null),
            Value::Integer(v) => ToSqlOutput::Owned(SqlValue::Integer(*v)),
            Value::Real(v) => ToSqlOutput::Owned(SqlValue::Real(*v)),
            Value::Text(v) => ToSqlOutput::Owned(SqlValue::Text(v.clone())),
            Value::Blob(v) => ToSqlOutput::Owned(SqlValue::Blob(v.clone())),
        })
    }
}

impl From<rusqlite::types::ValueRef<'_>> for Value {
    fn from(v: rusqlite::types::ValueRef<'_>) -> Self {
        use rusqlite::types::ValueRef;
        match v {
            ValueRef::Null => Value::Null,
            ValueRef::Integer(i) => Value::Integer(i),
            ValueRef::Real(f) => Value::Real(f),
            ValueRef::Text(t) => Value::Text(String::from_utf8_lossy(t).into_owned()),
            ValueRef::Blob(b) => Value::Blob(b.to_vec()),
        }
    }
}
