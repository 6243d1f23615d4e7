//! Property value typing: inference, strict date parsing, and casting.
//!
//! Every incoming property value is a JSON value. [`infer_type()`] decides
//! which [`PropertyType`] slot it belongs to, [`cast_value()`] coerces a value
//! into a declared type, and [`ValueTuple`] is the application-level tagged
//! value that flows through the schema registry and identity resolver.
//!
//! The wide nullable-slot physical encoding lives in [`crate::encoding`].

use std::fmt;
use std::str::FromStr;

use anyhow::{Result, anyhow};
use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PropertyType {
    Str,
    Num,
    Bool,
    Date,
}

impl PropertyType {
    pub fn as_str(&self) -> &'static str {
        match self {
            PropertyType::Str => "str",
            PropertyType::Num => "num",
            PropertyType::Bool => "bool",
            PropertyType::Date => "date",
        }
    }
}

impl fmt::Display for PropertyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PropertyType {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "str" | "string" => Ok(PropertyType::Str),
            "num" | "number" => Ok(PropertyType::Num),
            "bool" | "boolean" => Ok(PropertyType::Bool),
            "date" => Ok(PropertyType::Date),
            other => Err(anyhow!("Unknown property type '{other}'")),
        }
    }
}

/// A property value with at most one populated slot.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum ValueTuple {
    #[default]
    None,
    Str(String),
    Num(f64),
    Bool(bool),
    Date(DateTime<Utc>),
}

impl ValueTuple {
    /// Infers the slot for `value` and casts it there.
    pub fn from_json(value: &Value) -> Self {
        match infer_type(value) {
            Some(ty) => cast_value(value, ty).unwrap_or_default(),
            None => ValueTuple::None,
        }
    }

    pub fn property_type(&self) -> Option<PropertyType> {
        match self {
            ValueTuple::None => None,
            ValueTuple::Str(_) => Some(PropertyType::Str),
            ValueTuple::Num(_) => Some(PropertyType::Num),
            ValueTuple::Bool(_) => Some(PropertyType::Bool),
            ValueTuple::Date(_) => Some(PropertyType::Date),
        }
    }

    pub fn is_none(&self) -> bool {
        matches!(self, ValueTuple::None)
    }

    pub fn as_num(&self) -> Option<f64> {
        match self {
            ValueTuple::Num(n) => Some(*n),
            _ => None,
        }
    }
}

impl fmt::Display for ValueTuple {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValueTuple::None => f.write_str("null"),
            ValueTuple::Str(s) => f.write_str(s),
            ValueTuple::Num(n) => write!(f, "{n}"),
            ValueTuple::Bool(b) => write!(f, "{b}"),
            ValueTuple::Date(d) => write!(f, "{}", d.to_rfc3339()),
        }
    }
}

/// Classifies a raw value. `None` means the value carries nothing to store.
pub fn infer_type(value: &Value) -> Option<PropertyType> {
    match value {
        Value::Null => None,
        Value::Number(_) => Some(PropertyType::Num),
        Value::Bool(_) => Some(PropertyType::Bool),
        Value::String(s) => {
            if parse_strict_date(s).is_some() {
                Some(PropertyType::Date)
            } else {
                Some(PropertyType::Str)
            }
        }
        Value::Array(_) | Value::Object(_) => Some(PropertyType::Str),
    }
}

/// Attempts a strict ISO-8601 parse. Anything else is not a date.
pub fn parse_strict_date(value: &str) -> Option<DateTime<Utc>> {
    const DATETIME_FORMATS: &[&str] = &[
        "%Y-%m-%dT%H:%M:%S%.f",
        "%Y-%m-%d %H:%M:%S%.f",
        "%Y-%m-%dT%H:%M",
    ];
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return None;
    }
    if let Ok(parsed) = DateTime::parse_from_rfc3339(trimmed) {
        return Some(parsed.with_timezone(&Utc));
    }
    for fmt in DATETIME_FORMATS {
        if let Ok(parsed) = NaiveDateTime::parse_from_str(trimmed, fmt) {
            return Some(Utc.from_utc_datetime(&parsed));
        }
    }
    NaiveDate::parse_from_str(trimmed, "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|naive| Utc.from_utc_datetime(&naive))
}

/// Coerces `value` into `ty`. Returns `None` when the value cannot be
/// represented; callers drop the property rather than store a default.
pub fn cast_value(value: &Value, ty: PropertyType) -> Option<ValueTuple> {
    if value.is_null() {
        return None;
    }
    match ty {
        PropertyType::Bool => match value {
            Value::Bool(b) => Some(ValueTuple::Bool(*b)),
            Value::Number(n) => n.as_f64().map(|n| ValueTuple::Bool(n != 0.0)),
            _ => None,
        },
        PropertyType::Date => match value {
            Value::String(s) => parse_strict_date(s).map(ValueTuple::Date),
            _ => None,
        },
        PropertyType::Num => match value {
            Value::Number(n) => n.as_f64().map(ValueTuple::Num),
            Value::String(s) => s
                .trim()
                .parse::<f64>()
                .ok()
                .filter(|n| n.is_finite())
                .map(ValueTuple::Num),
            Value::Bool(b) => Some(ValueTuple::Num(if *b { 1.0 } else { 0.0 })),
            _ => None,
        },
        PropertyType::Str => match value {
            Value::String(s) => Some(ValueTuple::Str(s.clone())),
            other => Some(ValueTuple::Str(other.to_string())),
        },
    }
}
