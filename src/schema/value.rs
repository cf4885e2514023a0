//! ClickHouse literal values.
use std::fmt;

use chrono::NaiveDateTime;

/// ClickHouse row - columns in the destination table's declared order
pub type Row = Vec<Value>;

const DATETIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Single column value, rendered as a SQL literal by its `Display` impl.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    String(String),
    Float(f64),
    UInt(u64),
    DateTime(NaiveDateTime),
    Array(Vec<Value>),
    Tuple(Vec<Value>),
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(v.to_owned())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::String(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<u32> for Value {
    fn from(v: u32) -> Self {
        Value::UInt(u64::from(v))
    }
}

impl From<NaiveDateTime> for Value {
    fn from(v: NaiveDateTime) -> Self {
        Value::DateTime(v)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::String(s) => write_quoted(f, s),
            Value::Float(x) => write!(f, "{x}"),
            Value::UInt(x) => write!(f, "{x}"),
            Value::DateTime(ts) => write!(f, "'{}'", ts.format(DATETIME_FORMAT)),
            Value::Array(items) => {
                f.write_str("[")?;
                write_list(f, items)?;
                f.write_str("]")
            }
            Value::Tuple(items) => {
                f.write_str("(")?;
                write_list(f, items)?;
                f.write_str(")")
            }
        }
    }
}

fn write_quoted(f: &mut fmt::Formatter<'_>, s: &str) -> fmt::Result {
    f.write_str("'")?;
    for c in s.chars() {
        match c {
            '\\' => f.write_str("\\\\")?,
            '\'' => f.write_str("\\'")?,
            _ => fmt::Write::write_char(f, c)?,
        }
    }
    f.write_str("'")
}

fn write_list(f: &mut fmt::Formatter<'_>, items: &[Value]) -> fmt::Result {
    for (i, item) in items.iter().enumerate() {
        if i > 0 {
            f.write_str(", ")?;
        }
        write!(f, "{item}")?;
    }
    Ok(())
}

/// Appends `(v1, v2, ...), (...)` to an `INSERT ... VALUES` head.
pub fn insert_values(head: &str, rows: &[Row]) -> String {
    let mut sql = String::with_capacity(head.len() + rows.len() * 64);
    sql.push_str(head.trim_end());
    for (i, row) in rows.iter().enumerate() {
        sql.push_str(if i == 0 { " " } else { ", " });
        sql.push_str(&Value::Tuple(row.clone()).to_string());
    }
    sql
}
