//! Storage serialization boundary.
//!
//! Application code works with [`ValueTuple`]; the analytical store keeps each
//! dynamic property column as a tuple of four nullable slots. This module is
//! the only place that knows about that physical layout, and about the JSON
//! row shape of built-in attribute columns.

use chrono::{TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

use crate::value::{PropertyType, ValueTuple, cast_value};

/// Physical layout of a property column: `Tuple(str, num, bool, date)`,
/// every slot nullable, dates as epoch milliseconds.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TupleSlots {
    #[serde(default)]
    pub str: Option<String>,
    #[serde(default)]
    pub num: Option<f64>,
    #[serde(default)]
    pub bool: Option<bool>,
    #[serde(default)]
    pub date: Option<i64>,
}

impl From<&ValueTuple> for TupleSlots {
    fn from(value: &ValueTuple) -> Self {
        let mut slots = TupleSlots::default();
        match value {
            ValueTuple::None => {}
            ValueTuple::Str(s) => slots.str = Some(s.clone()),
            ValueTuple::Num(n) => slots.num = Some(*n),
            ValueTuple::Bool(b) => slots.bool = Some(*b),
            ValueTuple::Date(d) => slots.date = Some(d.timestamp_millis()),
        }
        slots
    }
}

impl From<TupleSlots> for ValueTuple {
    fn from(slots: TupleSlots) -> Self {
        if let Some(s) = slots.str {
            ValueTuple::Str(s)
        } else if let Some(n) = slots.num {
            ValueTuple::Num(n)
        } else if let Some(b) = slots.bool {
            ValueTuple::Bool(b)
        } else if let Some(d) = slots.date {
            Utc.timestamp_millis_opt(d)
                .single()
                .map(ValueTuple::Date)
                .unwrap_or_default()
        } else {
            ValueTuple::None
        }
    }
}

pub fn encode_tuple(value: &ValueTuple) -> Value {
    json!(TupleSlots::from(value))
}

/// Decodes a stored tuple column. Anything that is not a slot record reads as
/// an empty tuple.
pub fn decode_tuple(value: &Value) -> ValueTuple {
    serde_json::from_value::<TupleSlots>(value.clone())
        .map(ValueTuple::from)
        .unwrap_or_default()
}

/// Encodes a built-in attribute, which is stored as a plain scalar column.
pub fn encode_scalar(value: &ValueTuple) -> Value {
    match value {
        ValueTuple::None => Value::Null,
        ValueTuple::Str(s) => Value::String(s.clone()),
        ValueTuple::Num(n) => json!(n),
        ValueTuple::Bool(b) => Value::Bool(*b),
        ValueTuple::Date(d) => json!(d.timestamp_millis()),
    }
}

pub fn decode_scalar(value: &Value, ty: PropertyType) -> ValueTuple {
    match (ty, value) {
        (PropertyType::Date, Value::Number(n)) => n
            .as_i64()
            .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
            .map(ValueTuple::Date)
            .unwrap_or_default(),
        _ => cast_value(value, ty).unwrap_or_default(),
    }
}

/// Unwraps a `json!({...})` literal into a row.
pub fn row_of(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}

pub fn get_i64(row: &Map<String, Value>, key: &str) -> Option<i64> {
    row.get(key).and_then(|value| match value {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f.round() as i64)),
        _ => None,
    })
}

pub fn get_str<'a>(row: &'a Map<String, Value>, key: &str) -> Option<&'a str> {
    row.get(key).and_then(Value::as_str)
}

pub fn is_deleted(row: &Map<String, Value>) -> bool {
    get_i64(row, "is_deleted").unwrap_or(0) != 0
}
