//! Value types for keyfill
//!
//! - [`Value`]: a scalar read from or written to a relational engine
//! - [`Row`]: ordered column values of one fetched row
//! - [`KeyTuple`]: one row's position in composite-key order
//! - [`Batch`]: the rows of one pump iteration, between fetch and commit

use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use uuid::Uuid;

use crate::error::{Error, Result};

/// SQL value type that can hold any key or payload value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    /// SQL NULL
    Null,
    /// Boolean value (BIT)
    Bool(bool),
    /// 16-bit signed integer (SMALLINT, TINYINT)
    Int16(i16),
    /// 32-bit signed integer (INT)
    Int32(i32),
    /// 64-bit signed integer (BIGINT)
    Int64(i64),
    /// 32-bit floating point (REAL)
    Float32(f32),
    /// 64-bit floating point (FLOAT, DOUBLE PRECISION)
    Float64(f64),
    /// Arbitrary precision decimal (NUMERIC, DECIMAL, MONEY)
    Decimal(Decimal),
    /// Text string (VARCHAR, NVARCHAR, TEXT)
    String(String),
    /// Binary data (VARBINARY, BYTEA)
    Bytes(Vec<u8>),
    /// Date without time (DATE)
    Date(NaiveDate),
    /// Time without date (TIME)
    Time(NaiveTime),
    /// Timestamp without timezone (DATETIME2, TIMESTAMP)
    DateTime(NaiveDateTime),
    /// Timestamp with timezone (DATETIMEOFFSET, TIMESTAMPTZ)
    DateTimeTz(DateTime<Utc>),
    /// UUID (UNIQUEIDENTIFIER)
    Uuid(Uuid),
    /// JSON value
    Json(serde_json::Value),
}

impl Value {
    /// Check if value is NULL
    #[inline]
    pub const fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Get SQL type name
    pub fn sql_type(&self) -> &'static str {
        match self {
            Self::Null => "NULL",
            Self::Bool(_) => "BOOLEAN",
            Self::Int16(_) => "SMALLINT",
            Self::Int32(_) => "INTEGER",
            Self::Int64(_) => "BIGINT",
            Self::Float32(_) => "REAL",
            Self::Float64(_) => "DOUBLE PRECISION",
            Self::Decimal(_) => "DECIMAL",
            Self::String(_) => "VARCHAR",
            Self::Bytes(_) => "VARBINARY",
            Self::Date(_) => "DATE",
            Self::Time(_) => "TIME",
            Self::DateTime(_) => "TIMESTAMP",
            Self::DateTimeTz(_) => "TIMESTAMPTZ",
            Self::Uuid(_) => "UUID",
            Self::Json(_) => "JSON",
        }
    }

    /// Try to convert to bool
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            Self::Int16(n) => Some(*n != 0),
            Self::Int32(n) => Some(*n != 0),
            Self::Int64(n) => Some(*n != 0),
            Self::String(s) => match s.to_lowercase().as_str() {
                "true" | "t" | "yes" | "y" | "1" => Some(true),
                "false" | "f" | "no" | "n" | "0" => Some(false),
                _ => None,
            },
            _ => None,
        }
    }

    /// Try to convert to i64
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int16(n) => Some(i64::from(*n)),
            Self::Int32(n) => Some(i64::from(*n)),
            Self::Int64(n) => Some(*n),
            Self::Decimal(d) if d.fract().is_zero() => d.to_i64(),
            Self::String(s) => s.parse().ok(),
            _ => None,
        }
    }

    /// Try to convert to f64
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Int16(n) => Some(f64::from(*n)),
            Self::Int32(n) => Some(f64::from(*n)),
            Self::Int64(n) => Some(*n as f64),
            Self::Float32(n) => Some(f64::from(*n)),
            Self::Float64(n) => Some(*n),
            Self::Decimal(d) => d.to_f64(),
            Self::String(s) => s.parse().ok(),
            _ => None,
        }
    }

    /// Try to borrow as string
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s.as_str()),
            _ => None,
        }
    }

    /// Compare two values the way a SQL predicate does.
    ///
    /// Returns `None` when either side is NULL or the values belong to
    /// unrelated type families; a predicate over such values is not true.
    pub fn sql_cmp(&self, other: &Value) -> Option<Ordering> {
        if self.is_null() || other.is_null() || self.family() != other.family() {
            return None;
        }
        Some(self.total_cmp(other))
    }

    /// Total order used for sorting key tuples.
    ///
    /// NULL sorts first, as it does in an ascending index scan. Values of
    /// different families are ordered by family so that the order stays total.
    pub fn total_cmp(&self, other: &Value) -> Ordering {
        match self.family().cmp(&other.family()) {
            Ordering::Equal => {}
            unequal => return unequal,
        }
        match (self, other) {
            (Self::Null, Self::Null) => Ordering::Equal,
            (Self::Bool(a), Self::Bool(b)) => a.cmp(b),
            (Self::String(a), Self::String(b)) => a.cmp(b),
            (Self::Bytes(a), Self::Bytes(b)) => a.cmp(b),
            (Self::Date(a), Self::Date(b)) => a.cmp(b),
            (Self::Time(a), Self::Time(b)) => a.cmp(b),
            (Self::Uuid(a), Self::Uuid(b)) => a.cmp(b),
            (Self::Json(a), Self::Json(b)) => a.to_string().cmp(&b.to_string()),
            (a, b) if a.family() == Family::Numeric => compare_numeric(a, b),
            (a, b) => a.timestamp_utc().cmp(&b.timestamp_utc()),
        }
    }

    fn family(&self) -> Family {
        match self {
            Self::Null => Family::Null,
            Self::Bool(_) => Family::Bool,
            Self::Int16(_)
            | Self::Int32(_)
            | Self::Int64(_)
            | Self::Float32(_)
            | Self::Float64(_)
            | Self::Decimal(_) => Family::Numeric,
            Self::String(_) => Family::Text,
            Self::Bytes(_) => Family::Binary,
            Self::Date(_) => Family::Date,
            Self::Time(_) => Family::Time,
            Self::DateTime(_) | Self::DateTimeTz(_) => Family::Timestamp,
            Self::Uuid(_) => Family::Uuid,
            Self::Json(_) => Family::Json,
        }
    }

    fn timestamp_utc(&self) -> Option<NaiveDateTime> {
        match self {
            Self::DateTime(ts) => Some(*ts),
            Self::DateTimeTz(ts) => Some(ts.naive_utc()),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Family {
    Null,
    Bool,
    Numeric,
    Text,
    Binary,
    Date,
    Time,
    Timestamp,
    Uuid,
    Json,
}

fn compare_numeric(a: &Value, b: &Value) -> Ordering {
    let is_float = |v: &Value| matches!(v, Value::Float32(_) | Value::Float64(_));
    if is_float(a) || is_float(b) {
        let (x, y) = (a.as_f64().unwrap_or(f64::NAN), b.as_f64().unwrap_or(f64::NAN));
        return x.total_cmp(&y);
    }
    match (a, b) {
        (Value::Decimal(x), Value::Decimal(y)) => x.cmp(y),
        (Value::Decimal(x), other) => other
            .as_i64()
            .map(|y| x.cmp(&Decimal::from(y)))
            .unwrap_or(Ordering::Less),
        (other, Value::Decimal(y)) => other
            .as_i64()
            .map(|x| Decimal::from(x).cmp(y))
            .unwrap_or(Ordering::Greater),
        (x, y) => x.as_i64().cmp(&y.as_i64()),
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => write!(f, "NULL"),
            Self::Bool(b) => write!(f, "{}", b),
            Self::Int16(n) => write!(f, "{}", n),
            Self::Int32(n) => write!(f, "{}", n),
            Self::Int64(n) => write!(f, "{}", n),
            Self::Float32(n) => write!(f, "{}", n),
            Self::Float64(n) => write!(f, "{}", n),
            Self::Decimal(d) => write!(f, "{}", d),
            Self::String(s) => write!(f, "'{}'", s.replace('\'', "''")),
            Self::Bytes(b) => {
                write!(f, "0x")?;
                b.iter().try_for_each(|byte| write!(f, "{:02X}", byte))
            }
            Self::Date(d) => write!(f, "'{}'", d),
            Self::Time(t) => write!(f, "'{}'", t),
            Self::DateTime(ts) => write!(f, "'{}'", ts),
            Self::DateTimeTz(ts) => write!(f, "'{}'", ts.to_rfc3339()),
            Self::Uuid(u) => write!(f, "'{}'", u),
            Self::Json(j) => write!(f, "'{}'", j),
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<i16> for Value {
    fn from(v: i16) -> Self {
        Self::Int16(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Self::Int32(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Self::Int64(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Self::Float64(v)
    }
}

impl From<Decimal> for Value {
    fn from(v: Decimal) -> Self {
        Self::Decimal(v)
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Self::String(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Self::String(v.to_string())
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Self::Bytes(v)
    }
}

impl From<NaiveDate> for Value {
    fn from(v: NaiveDate) -> Self {
        Self::Date(v)
    }
}

impl From<NaiveDateTime> for Value {
    fn from(v: NaiveDateTime) -> Self {
        Self::DateTime(v)
    }
}

impl From<DateTime<Utc>> for Value {
    fn from(v: DateTime<Utc>) -> Self {
        Self::DateTimeTz(v)
    }
}

impl From<Uuid> for Value {
    fn from(v: Uuid) -> Self {
        Self::Uuid(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        match v {
            Some(v) => v.into(),
            None => Self::Null,
        }
    }
}

/// Database row as ordered column values
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    /// Column names
    columns: Vec<String>,
    /// Column values (same order as columns)
    values: Vec<Value>,
}

impl Row {
    /// Create a new row
    pub fn new(columns: Vec<String>, values: Vec<Value>) -> Self {
        debug_assert_eq!(columns.len(), values.len());
        Self { columns, values }
    }

    /// Get column count
    #[inline]
    pub fn len(&self) -> usize {
        self.columns.len()
    }

    /// Check if row is empty
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    /// Get column names
    #[inline]
    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    /// Get all values
    #[inline]
    pub fn values(&self) -> &[Value] {
        &self.values
    }

    /// Get value by column index
    #[inline]
    pub fn get(&self, idx: usize) -> Option<&Value> {
        self.values.get(idx)
    }

    /// Get value by column name (case-insensitive)
    pub fn get_by_name(&self, name: &str) -> Option<&Value> {
        self.columns
            .iter()
            .position(|c| c.eq_ignore_ascii_case(name))
            .and_then(|idx| self.values.get(idx))
    }

    /// Build a new row holding only `columns`, in that order
    pub fn project(&self, columns: &[String]) -> Result<Row> {
        let values = columns
            .iter()
            .map(|c| {
                self.get_by_name(c)
                    .cloned()
                    .ok_or_else(|| Error::schema(format!("row has no column '{}'", c)))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Row::new(columns.to_vec(), values))
    }

    /// Read this row's key tuple over `key_columns`
    pub fn key(&self, key_columns: &[String]) -> Result<KeyTuple> {
        KeyTuple::from_row(self, key_columns)
    }

    /// Consume the row, returning its values
    pub fn into_values(self) -> Vec<Value> {
        self.values
    }
}

/// An ordered sequence of key values, compared lexicographically.
///
/// A tuple may be narrower than the key it is compared against; start, end and
/// restart tuples may name only a leading prefix of the key columns.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct KeyTuple(Vec<Value>);

impl KeyTuple {
    /// Create a tuple from values, first column most significant
    pub fn new(values: Vec<Value>) -> Self {
        Self(values)
    }

    /// Read `key_columns` out of a row
    pub fn from_row(row: &Row, key_columns: &[String]) -> Result<Self> {
        key_columns
            .iter()
            .map(|c| {
                row.get_by_name(c)
                    .cloned()
                    .ok_or_else(|| Error::schema(format!("row has no key column '{}'", c)))
            })
            .collect::<Result<Vec<_>>>()
            .map(Self)
    }

    /// Number of values
    #[inline]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// True if the tuple holds no values
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// The values, most significant first
    #[inline]
    pub fn values(&self) -> &[Value] {
        &self.0
    }

    /// Value at `idx`
    #[inline]
    pub fn get(&self, idx: usize) -> Option<&Value> {
        self.0.get(idx)
    }

    /// The leading `width` values
    pub fn prefix(&self, width: usize) -> KeyTuple {
        Self(self.0.iter().take(width).cloned().collect())
    }

    /// Compare over the shorter width of the two tuples only
    pub fn cmp_prefix(&self, other: &KeyTuple) -> Ordering {
        self.0
            .iter()
            .zip(other.0.iter())
            .map(|(a, b)| a.total_cmp(b))
            .find(|o| o.is_ne())
            .unwrap_or(Ordering::Equal)
    }

    /// Consume the tuple, returning its values
    pub fn into_values(self) -> Vec<Value> {
        self.0
    }
}

impl PartialEq for KeyTuple {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for KeyTuple {}

impl PartialOrd for KeyTuple {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for KeyTuple {
    fn cmp(&self, other: &Self) -> Ordering {
        self.cmp_prefix(other).then(self.len().cmp(&other.len()))
    }
}

impl From<Vec<Value>> for KeyTuple {
    fn from(values: Vec<Value>) -> Self {
        Self(values)
    }
}

impl FromIterator<Value> for KeyTuple {
    fn from_iter<I: IntoIterator<Item = Value>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl fmt::Display for KeyTuple {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(")?;
        for (i, v) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", v)?;
        }
        write!(f, ")")
    }
}

/// Rows fetched for one pump iteration.
///
/// Exists only between fetch and commit; `upper` is the probed limit the scan
/// was bounded by and becomes the next cursor once the batch commits.
#[derive(Debug, Clone)]
pub struct Batch {
    partition: u32,
    columns: Vec<String>,
    rows: Vec<Row>,
    upper: KeyTuple,
    is_final: bool,
}

impl Batch {
    /// Create a batch
    pub fn new(
        partition: u32,
        columns: Vec<String>,
        rows: Vec<Row>,
        upper: KeyTuple,
        is_final: bool,
    ) -> Self {
        Self {
            partition,
            columns,
            rows,
            upper,
            is_final,
        }
    }

    /// Partition the batch was read from
    #[inline]
    pub fn partition(&self) -> u32 {
        self.partition
    }

    /// Projected column names, in row order
    #[inline]
    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    /// The rows, in key order
    #[inline]
    pub fn rows(&self) -> &[Row] {
        &self.rows
    }

    /// Row count
    #[inline]
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// True if the scan returned nothing
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Inclusive upper bound of the scan
    #[inline]
    pub fn upper(&self) -> &KeyTuple {
        &self.upper
    }

    /// True if this is the last batch of its partition
    #[inline]
    pub fn is_final(&self) -> bool {
        self.is_final
    }
}
