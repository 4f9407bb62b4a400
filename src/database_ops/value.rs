use std::fmt;

use rusqlite::types::{ToSql, ToSqlOutput, Value as RawValue, ValueRef};

use crate::database_ops::identifier::Identifier;

/// A literal bound into a statement.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
}

impl SqlValue {
    pub fn is_null(&self) -> bool {
        matches!(self, SqlValue::Null)
    }

    /// Text form used when the value acts as a natural key. NULL never matches a key.
    pub fn as_key(&self) -> Option<String> {
        match self {
            SqlValue::Null => None,
            SqlValue::Integer(v) => Some(v.to_string()),
            SqlValue::Real(v) => Some(v.to_string()),
            SqlValue::Text(v) => Some(v.clone()),
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            SqlValue::Integer(v) => Some(*v),
            SqlValue::Text(v) => v.trim().parse().ok(),
            _ => None,
        }
    }

    /// Converts a JSON scalar; arrays and objects have no column representation.
    pub fn from_json(value: &serde_json::Value) -> Option<Self> {
        use serde_json::Value;

        match value {
            Value::Null => Some(SqlValue::Null),
            Value::Bool(b) => Some(SqlValue::Integer(i64::from(*b))),
            Value::Number(n) => n
                .as_i64()
                .map(SqlValue::Integer)
                .or_else(|| n.as_f64().map(SqlValue::Real)),
            Value::String(s) => Some(SqlValue::Text(s.clone())),
            Value::Array(_) | Value::Object(_) => None,
        }
    }
}

impl From<RawValue> for SqlValue {
    fn from(value: RawValue) -> Self {
        match value {
            RawValue::Null => SqlValue::Null,
            RawValue::Integer(v) => SqlValue::Integer(v),
            RawValue::Real(v) => SqlValue::Real(v),
            RawValue::Text(v) => SqlValue::Text(v),
            RawValue::Blob(v) => SqlValue::Text(String::from_utf8_lossy(&v).into_owned()),
        }
    }
}

impl fmt::Display for SqlValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SqlValue::Null => Ok(()),
            SqlValue::Integer(v) => write!(f, "{v}"),
            SqlValue::Real(v) => write!(f, "{v}"),
            SqlValue::Text(v) => f.write_str(v),
        }
    }
}

impl ToSql for SqlValue {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match self {
            SqlValue::Null => ToSqlOutput::Owned(RawValue::Null),
            SqlValue::Integer(v) => ToSqlOutput::Owned(RawValue::Integer(*v)),
            SqlValue::Real(v) => ToSqlOutput::Owned(RawValue::Real(*v)),
            SqlValue::Text(v) => ToSqlOutput::Borrowed(ValueRef::Text(v.as_bytes())),
        })
    }
}

impl From<i64> for SqlValue {
    fn from(v: i64) -> Self {
        SqlValue::Integer(v)
    }
}

impl From<i32> for SqlValue {
    fn from(v: i32) -> Self {
        SqlValue::Integer(i64::from(v))
    }
}

impl From<u32> for SqlValue {
    fn from(v: u32) -> Self {
        SqlValue::Integer(i64::from(v))
    }
}

impl From<bool> for SqlValue {
    fn from(v: bool) -> Self {
        SqlValue::Integer(i64::from(v))
    }
}

impl From<f64> for SqlValue {
    fn from(v: f64) -> Self {
        SqlValue::Real(v)
    }
}

impl From<&str> for SqlValue {
    fn from(v: &str) -> Self {
        SqlValue::Text(v.to_string())
    }
}

impl From<&String> for SqlValue {
    fn from(v: &String) -> Self {
        SqlValue::Text(v.clone())
    }
}

impl From<String> for SqlValue {
    fn from(v: String) -> Self {
        SqlValue::Text(v)
    }
}

impl<T: Into<SqlValue>> From<Option<T>> for SqlValue {
    fn from(v: Option<T>) -> Self {
        v.map_or(SqlValue::Null, Into::into)
    }
}

/// One field of a buffered row: a literal or a key that is resolved at flush time.
#[derive(Debug, PartialEq)]
pub enum Cell {
    Value(SqlValue),
    Id(Identifier),
}

impl Cell {
    pub fn null() -> Self {
        Cell::Value(SqlValue::Null)
    }
}

impl From<Identifier> for Cell {
    fn from(id: Identifier) -> Self {
        Cell::Id(id)
    }
}

impl From<SqlValue> for Cell {
    fn from(value: SqlValue) -> Self {
        Cell::Value(value)
    }
}

macro_rules! cell_from_literal {
    ($($ty:ty),* $(,)?) => {
        $(
            impl From<$ty> for Cell {
                fn from(v: $ty) -> Self {
                    Cell::Value(SqlValue::from(v))
                }
            }
        )*
    };
}

cell_from_literal!(
    i64,
    i32,
    u32,
    bool,
    f64,
    &str,
    &String,
    String,
    Option<i64>,
    Option<&str>,
    Option<String>,
);
