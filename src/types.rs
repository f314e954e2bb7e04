use compact_str::CompactString;
use rusqlite::types::{FromSql, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::sync::Arc;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Value {
    Null,
    Boolean(bool),
    Integer(i64),
    Float(f64),
    Text(CompactString),
    Blob(Vec<u8>),
}

impl Value {
    fn kind_rank(&self) -> u8 {
        match self {
            Value::Null => 0,
            Value::Boolean(_) => 1,
            Value::Integer(_) => 2,
            Value::Float(_) => 3,
            Value::Text(_) => 4,
            Value::Blob(_) => 5,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Value::Null => "Null",
            Value::Boolean(_) => "Boolean",
            Value::Integer(_) => "Integer",
            Value::Float(_) => "Float",
            Value::Text(_) => "Text",
            Value::Blob(_) => "Blob",
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Integer view used for routing; booleans are stored as 0/1.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Integer(v) => Some(*v),
            Value::Boolean(v) => Some(i64::from(*v)),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(v) => Some(v.as_str()),
            _ => None,
        }
    }

    pub(crate) fn from_sql_ref(value: ValueRef<'_>) -> Value {
        match value {
            ValueRef::Null => Value::Null,
            ValueRef::Integer(v) => Value::Integer(v),
            ValueRef::Real(v) => Value::Float(v),
            ValueRef::Text(bytes) => Value::Text(CompactString::from(
                String::from_utf8_lossy(bytes).as_ref(),
            )),
            ValueRef::Blob(bytes) => Value::Blob(bytes.to_vec()),
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Value {}

impl PartialOrd for Value {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Value {
    fn cmp(&self, other: &Self) -> Ordering {
        // Integers and floats come back from SQLite interchangeably, so compare
        // them numerically before falling back to the kind rank.
        match (self, other) {
            (Value::Integer(a), Value::Float(b)) => return (*a as f64).total_cmp(b),
            (Value::Float(a), Value::Integer(b)) => return a.total_cmp(&(*b as f64)),
            _ => {}
        }
        let rank_cmp = self.kind_rank().cmp(&other.kind_rank());
        if rank_cmp != Ordering::Equal {
            return rank_cmp;
        }

        match (self, other) {
            (Value::Null, Value::Null) => Ordering::Equal,
            (Value::Boolean(a), Value::Boolean(b)) => a.cmp(b),
            (Value::Integer(a), Value::Integer(b)) => a.cmp(b),
            (Value::Float(a), Value::Float(b)) => a.total_cmp(b),
            (Value::Text(a), Value::Text(b)) => a.cmp(b),
            (Value::Blob(a), Value::Blob(b)) => a.cmp(b),
            _ => Ordering::Equal,
        }
    }
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::Null => write!(f, "NULL"),
            Value::Boolean(v) => write!(f, "{v}"),
            Value::Integer(v) => write!(f, "{v}"),
            Value::Float(v) => write!(f, "{v}"),
            Value::Text(v) => write!(f, "'{v}'"),
            Value::Blob(v) => write!(f, "<{} bytes>", v.len()),
        }
    }
}

impl ToSql for Value {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match self {
            Value::Null => ToSqlOutput::Owned(rusqlite::types::Value::Null),
            Value::Boolean(v) => ToSqlOutput::Owned(rusqlite::types::Value::Integer(i64::from(*v))),
            Value::Integer(v) => ToSqlOutput::Owned(rusqlite::types::Value::Integer(*v)),
            Value::Float(v) => ToSqlOutput::Owned(rusqlite::types::Value::Real(*v)),
            Value::Text(v) => ToSqlOutput::Borrowed(ValueRef::Text(v.as_bytes())),
            Value::Blob(v) => ToSqlOutput::Borrowed(ValueRef::Blob(v)),
        })
    }
}

impl FromSql for Value {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        Ok(Value::from_sql_ref(value))
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Integer(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Integer(i64::from(v))
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Boolean(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.into())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v.into())
    }
}

impl From<CompactString> for Value {
    fn from(v: CompactString) -> Self {
        Value::Text(v)
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Value::Blob(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map_or(Value::Null, Into::into)
    }
}

/// A result row. Column names are shared by every row of one result set.
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    columns: Arc<[String]>,
    pub values: Vec<Value>,
}

impl Row {
    pub fn new(columns: Arc<[String]>, values: Vec<Value>) -> Self {
        Self { columns, values }
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn index_of(&self, column: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.eq_ignore_ascii_case(column))
    }

    pub fn get(&self, column: &str) -> Option<&Value> {
        self.index_of(column).and_then(|i| self.values.get(i))
    }

    pub fn into_values(self) -> Vec<Value> {
        self.values
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RowDecodeError {
    #[error("missing column '{column}' at index {index}")]
    MissingColumn { column: String, index: usize },
    #[error("column '{column}' type mismatch: expected {expected}, got {actual}")]
    TypeMismatch {
        column: String,
        expected: &'static str,
        actual: &'static str,
    },
    #[error("{message}")]
    Custom { message: String },
}

/// Conversion of a single selected cell into a Rust value.
pub trait FromValue: Sized {
    fn from_value(value: Value, column: &str) -> Result<Self, RowDecodeError>;
}

fn mismatch(column: &str, expected: &'static str, actual: &Value) -> RowDecodeError {
    RowDecodeError::TypeMismatch {
        column: column.to_string(),
        expected,
        actual: actual.kind(),
    }
}

impl FromValue for Value {
    fn from_value(value: Value, _column: &str) -> Result<Self, RowDecodeError> {
        Ok(value)
    }
}

impl FromValue for i64 {
    fn from_value(value: Value, column: &str) -> Result<Self, RowDecodeError> {
        value.as_i64().ok_or_else(|| mismatch(column, "Integer", &value))
    }
}

impl FromValue for f64 {
    fn from_value(value: Value, column: &str) -> Result<Self, RowDecodeError> {
        match value {
            Value::Float(v) => Ok(v),
            Value::Integer(v) => Ok(v as f64),
            other => Err(mismatch(column, "Float", &other)),
        }
    }
}

impl FromValue for bool {
    fn from_value(value: Value, column: &str) -> Result<Self, RowDecodeError> {
        match value {
            Value::Boolean(v) => Ok(v),
            Value::Integer(v) => Ok(v != 0),
            other => Err(mismatch(column, "Boolean", &other)),
        }
    }
}

impl FromValue for String {
    fn from_value(value: Value, column: &str) -> Result<Self, RowDecodeError> {
        match value {
            Value::Text(v) => Ok(v.into_string()),
            other => Err(mismatch(column, "Text", &other)),
        }
    }
}

impl FromValue for Vec<u8> {
    fn from_value(value: Value, column: &str) -> Result<Self, RowDecodeError> {
        match value {
            Value::Blob(v) => Ok(v),
            other => Err(mismatch(column, "Blob", &other)),
        }
    }
}

impl<T: FromValue> FromValue for Option<T> {
    fn from_value(value: Value, column: &str) -> Result<Self, RowDecodeError> {
        if value.is_null() {
            Ok(None)
        } else {
            T::from_value(value, column).map(Some)
        }
    }
}

fn cell<'a>(row: &'a Row, index: usize, column: &str) -> Result<&'a Value, RowDecodeError> {
    row.values
        .get(index)
        .ok_or_else(|| RowDecodeError::MissingColumn {
            column: column.to_string(),
            index,
        })
}

pub fn value_at<T: FromValue>(row: &Row, index: usize, column: &str) -> Result<T, RowDecodeError> {
    T::from_value(cell(row, index, column)?.clone(), column)
}

pub fn text_at<'a>(row: &'a Row, index: usize, column: &str) -> Result<&'a str, RowDecodeError> {
    match cell(row, index, column)? {
        Value::Text(v) => Ok(v.as_str()),
        other => Err(mismatch(column, "Text", other)),
    }
}

pub fn i64_at(row: &Row, index: usize, column: &str) -> Result<i64, RowDecodeError> {
    value_at(row, index, column)
}
