//! Filters available to config templates

use minijinja::value::Value;
use minijinja::{Error, ErrorKind};
use regex::Regex;

fn as_f64(value: &Value) -> Option<f64> {
    f64::try_from(value.clone())
        .ok()
        .or_else(|| value.as_i64().map(|i| i as f64))
        .or_else(|| value.as_str().and_then(|s| s.trim().parse().ok()))
}

fn invalid(message: impl Into<String>) -> Error {
    Error::new(ErrorKind::InvalidOperation, message.into())
}

// ==================== String Filters ====================

pub fn regex_replace(value: &str, find: &str, replace: &str) -> Result<String, Error> {
    let re = Regex::new(find).map_err(|e| invalid(format!("invalid regex: {}", e)))?;
    Ok(re.replace_all(value, replace).into_owned())
}

pub fn regex_match(value: &str, pattern: &str) -> Result<bool, Error> {
    let re = Regex::new(pattern).map_err(|e| invalid(format!("invalid regex: {}", e)))?;
    Ok(re.is_match(value))
}

// ==================== Type Conversion Filters ====================

/// `| float`, falling back to `default` (or an error) when not numeric
pub fn to_float(value: Value, default: Option<f64>) -> Result<f64, Error> {
    match (as_f64(&value), default) {
        (Some(f), _) => Ok(f),
        (None, Some(d)) => Ok(d),
        (None, None) => Err(invalid("cannot convert to float")),
    }
}

/// `| int`, truncating floats
pub fn to_int(value: Value, default: Option<i64>) -> Result<i64, Error> {
    if let Some(i) = value.as_i64() {
        return Ok(i);
    }
    match (as_f64(&value), default) {
        (Some(f), _) => Ok(f as i64),
        (None, Some(d)) => Ok(d),
        (None, None) => Err(invalid("cannot convert to int")),
    }
}

/// `| bool` with the usual truthy strings
pub fn to_bool(value: Value) -> bool {
    if let Some(s) = value.as_str() {
        return matches!(
            s.trim().to_lowercase().as_str(),
            "true" | "yes" | "on" | "1"
        );
    }
    value.is_true()
}

// ==================== Math Filters ====================

pub fn round_filter(value: f64, precision: Option<i32>) -> f64 {
    let multiplier = 10_f64.powi(precision.unwrap_or(0));
    (value * multiplier).round() / multiplier
}

pub fn clamp(value: f64, min: f64, max: f64) -> Result<f64, Error> {
    if min > max {
        return Err(invalid("clamp: min is greater than max"));
    }
    Ok(value.clamp(min, max))
}
