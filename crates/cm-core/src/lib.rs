//! Core types for the automation runtime
//!
//! This crate provides the fundamental types shared by every other crate:
//! QualifiedId, TriggerMapping, Context, the AbortSignal used for cooperative
//! cancellation, and the SettingsStore that feeds profile activation and
//! contextual schema defaults.

mod abort;
mod context;
mod mapping;
mod qualified_id;
mod settings;

pub use abort::{abortable_sleep, AbortController, AbortSignal};
pub use context::Context;
pub use mapping::TriggerMapping;
pub use qualified_id::{QualifiedId, QualifiedIdError};
pub use settings::{SettingChange, SettingsStore, SharedSettings};

/// Context payload passed to triggers, handlers and templates
pub type ContextData = serde_json::Map<String, serde_json::Value>;

/// Plugin namespace used by actions and triggers shipped with the runtime
pub const CORE_PLUGIN: &str = "core";

/// Seconds as a `Duration`, saturating
///
/// NaN and non-positive values give zero; values past `Duration::MAX`
/// give `Duration::MAX`.
pub fn duration_from_secs(secs: f64) -> std::time::Duration {
    if secs.is_nan() || secs <= 0.0 {
        return std::time::Duration::ZERO;
    }
    std::time::Duration::try_from_secs_f64(secs).unwrap_or(std::time::Duration::MAX)
}

/// Human-readable message from a caught panic payload
pub fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_duration_from_secs() {
        assert_eq!(duration_from_secs(1.5), Duration::from_millis(1500));
        assert_eq!(duration_from_secs(0.0), Duration::ZERO);
        assert_eq!(duration_from_secs(-3.0), Duration::ZERO);
        assert_eq!(duration_from_secs(f64::NAN), Duration::ZERO);
        assert_eq!(duration_from_secs(1e20), Duration::MAX);
        assert_eq!(duration_from_secs(f64::INFINITY), Duration::MAX);
    }
}
