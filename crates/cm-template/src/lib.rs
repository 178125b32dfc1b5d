//! Jinja2-compatible templating for the automation runtime
//!
//! Config properties marked as templated are rendered against the trigger
//! context before an action runs, and profile activation conditions are
//! evaluated against the current settings.
//!
//! # Filters
//!
//! - `| float` / `| int` / `| bool` - Type conversion
//! - `| round(2)` / `| clamp(0, 100)` - Math
//! - `| regex_replace(pattern, replacement)` / `| regex_match(pattern)`
//!
//! # Functions
//!
//! - `now()` - Current local time (RFC 3339)
//! - `timestamp()` - Current UNIX timestamp
//! - `iif(condition, if_true, if_false)`
//!
//! # Example
//!
//! ```ignore
//! use cm_template::TemplateEngine;
//!
//! let engine = TemplateEngine::new();
//! let text = engine.render("Welcome {{ user }}", serde_json::json!({"user": "sam"}))?;
//! let active = engine.is_truthy("scene == 'gaming'", &settings.snapshot())?;
//! ```

mod engine;
mod error;
mod filters;

pub use engine::TemplateEngine;
pub use error::{TemplateError, TemplateResult};
