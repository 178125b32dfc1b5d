//! Coercion of raw and rendered values into declared types

use crate::error::{ConfigResolutionError, ResolutionResult};
use crate::schema::SchemaType;
use serde::{Deserialize, Serialize};
use serde_json::{Number, Value};

/// Resolved value of a toggle property
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Toggle {
    On,
    Off,
    Toggle,
}

impl Toggle {
    /// Read a resolved toggle value (`true`, `false` or `"toggle"`)
    pub fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Bool(true) => Some(Toggle::On),
            Value::Bool(false) => Some(Toggle::Off),
            Value::String(s) if s == "toggle" => Some(Toggle::Toggle),
            _ => None,
        }
    }

    /// New on/off state given the current one
    pub fn apply(self, current: bool) -> bool {
        match self {
            Toggle::On => true,
            Toggle::Off => false,
            Toggle::Toggle => !current,
        }
    }

    pub fn to_value(self) -> Value {
        match self {
            Toggle::On => Value::Bool(true),
            Toggle::Off => Value::Bool(false),
            Toggle::Toggle => Value::String("toggle".to_string()),
        }
    }
}

fn describe(value: &Value) -> String {
    match value {
        Value::Null => "null".to_string(),
        Value::Bool(b) => format!("boolean {}", b),
        Value::Number(n) => format!("number {}", n),
        Value::String(s) => format!("string {:?}", s),
        Value::Array(_) => "array".to_string(),
        Value::Object(_) => "object".to_string(),
    }
}

fn mismatch(ty: &SchemaType, value: &Value) -> ConfigResolutionError {
    ConfigResolutionError::TypeMismatch {
        expected: ty.type_name(),
        found: describe(value),
    }
}

fn parse_bool(s: &str) -> Option<bool> {
    match s.trim().to_lowercase().as_str() {
        "true" | "yes" | "on" | "1" => Some(true),
        "false" | "no" | "off" | "0" => Some(false),
        _ => None,
    }
}

fn parse_number(s: &str) -> Option<Value> {
    let s = s.trim();
    if let Ok(i) = s.parse::<i64>() {
        return Some(Value::from(i));
    }
    s.parse::<f64>()
        .ok()
        .and_then(Number::from_f64)
        .map(Value::Number)
}

/// Parse a duration in seconds from `"90"`, `"1.5"`, `"1:30"` or `"1:02:03"`
pub fn parse_duration(s: &str) -> Option<f64> {
    let s = s.trim();
    if !s.contains(':') {
        return s.parse::<f64>().ok().filter(|secs| *secs >= 0.0);
    }

    let parts: Vec<&str> = s.split(':').collect();
    if parts.len() > 3 {
        return None;
    }
    let mut total = 0.0;
    for part in parts {
        let value: f64 = part.parse().ok()?;
        if value < 0.0 {
            return None;
        }
        total = total * 60.0 + value;
    }
    Some(total)
}

/// Coerce a scalar value to the declared type
pub(crate) fn coerce(ty: &SchemaType, value: Value) -> ResolutionResult<Value> {
    match ty {
        SchemaType::String => match value {
            Value::String(_) => Ok(value),
            Value::Number(n) => Ok(Value::String(n.to_string())),
            Value::Bool(b) => Ok(Value::String(b.to_string())),
            other => Err(mismatch(ty, &other)),
        },
        SchemaType::Number => match &value {
            Value::Number(_) => Ok(value),
            Value::String(s) => parse_number(s).ok_or_else(|| mismatch(ty, &value)),
            _ => Err(mismatch(ty, &value)),
        },
        SchemaType::Boolean => match &value {
            Value::Bool(_) => Ok(value),
            Value::String(s) => parse_bool(s)
                .map(Value::Bool)
                .ok_or_else(|| mismatch(ty, &value)),
            Value::Number(n) => Ok(Value::Bool(n.as_f64().map_or(false, |f| f != 0.0))),
            _ => Err(mismatch(ty, &value)),
        },
        SchemaType::Toggle => match &value {
            Value::Bool(_) => Ok(value),
            Value::String(s) if s.trim().eq_ignore_ascii_case("toggle") => {
                Ok(Toggle::Toggle.to_value())
            }
            Value::String(s) => parse_bool(s)
                .map(Value::Bool)
                .ok_or_else(|| mismatch(ty, &value)),
            _ => Err(mismatch(ty, &value)),
        },
        SchemaType::Duration => match &value {
            Value::Number(n) if n.as_f64().map_or(false, |f| f >= 0.0) => Ok(value),
            Value::String(s) => parse_duration(s)
                .and_then(Number::from_f64)
                .map(Value::Number)
                .ok_or_else(|| mismatch(ty, &value)),
            _ => Err(mismatch(ty, &value)),
        },
        SchemaType::Any => Ok(value),
        SchemaType::Object(_) | SchemaType::Array(_) | SchemaType::Resource(_) => {
            // Structured types are walked by the resolver
            Ok(value)
        }
    }
}
