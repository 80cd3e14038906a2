//! Bind parameter parsing.
//!
//! Scripts send bind parameters as JSON array text (`[1, "a", null]`). The
//! worker parses them into positional [`BindValue`]s before the engine is
//! touched, so a malformed payload never reaches SQLite.

use rusqlite::types::{ToSql, ToSqlOutput, Value};
use serde_json::Value as Json;

use crate::config::BindMode;
use crate::error::{Error, Result};

/// One positional bind parameter.
#[derive(Debug, Clone, PartialEq)]
pub enum BindValue {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
}

impl ToSql for BindValue {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match self {
            BindValue::Null => ToSqlOutput::Owned(Value::Null),
            BindValue::Integer(i) => ToSqlOutput::Owned(Value::Integer(*i)),
            BindValue::Real(f) => ToSqlOutput::Owned(Value::Real(*f)),
            BindValue::Text(s) => ToSqlOutput::Borrowed(s.as_str().into()),
        })
    }
}

/// Parses a bind parameter payload.
///
/// `None`, blank text and a JSON `null` all mean "no parameters". Anything
/// else must be a JSON array of scalars.
///
/// # Errors
///
/// `Error::Params` if the text is not JSON, not an array, or contains a
/// nested array or object.
pub fn parse_bind_params(raw: Option<&str>, mode: BindMode) -> Result<Vec<BindValue>> {
    let raw = match raw {
        Some(text) if !text.trim().is_empty() => text,
        _ => return Ok(Vec::new()),
    };

    let parsed: Json =
        serde_json::from_str(raw).map_err(|e| Error::Params(format!("not valid JSON: {e}")))?;

    let items = match parsed {
        Json::Null => return Ok(Vec::new()),
        Json::Array(items) => items,
        other => {
            return Err(Error::Params(format!(
                "expected a JSON array, got {}",
                json_kind(&other)
            )))
        }
    };

    items
        .into_iter()
        .enumerate()
        .map(|(position, item)| convert(position, item, mode))
        .collect()
}

fn convert(position: usize, item: Json, mode: BindMode) -> Result<BindValue> {
    match (item, mode) {
        (Json::Null, _) => Ok(BindValue::Null),
        (Json::String(s), _) => Ok(BindValue::Text(s)),
        (Json::Bool(b), BindMode::Text) => Ok(BindValue::Text(b.to_string())),
        (Json::Bool(b), BindMode::Typed) => Ok(BindValue::Integer(i64::from(b))),
        (Json::Number(n), BindMode::Text) => Ok(BindValue::Text(n.to_string())),
        (Json::Number(n), BindMode::Typed) => match n.as_i64() {
            Some(i) => Ok(BindValue::Integer(i)),
            None => n.as_f64().map(BindValue::Real).ok_or_else(|| {
                Error::Params(format!("parameter {position}: number {n} out of range"))
            }),
        },
        (other, _) => Err(Error::Params(format!(
            "parameter {position}: expected a scalar, got {}",
            json_kind(&other)
        ))),
    }
}

fn json_kind(value: &Json) -> &'static str {
    match value {
        Json::Null => "null",
        Json::Bool(_) => "boolean",
        Json::Number(_) => "number",
        Json::String(_) => "string",
        Json::Array(_) => "array",
        Json::Object(_) => "object",
    }
}

// =============================================================================
// Tests
// =============================================================================
