//! Typed config schemas and their resolution
//!
//! Actions and triggers declare their configuration as a [`Schema`]. At
//! invocation time the [`ConfigResolver`] turns the raw, user-entered value
//! into a concrete one:
//!
//! - absent values take static or contextual defaults
//! - templated strings are rendered against the trigger context and coerced
//!   to the declared type
//! - dynamically typed properties pick their schema from resolved siblings
//! - resource references resolve only while the resource exists
//!
//! Contextual enumerations are exposed through [`ConfigResolver::enumerate`]
//! for editors and explicit validation.

mod context;
mod error;
mod resolver;
mod schema;
mod value;

pub use context::{ResolveContext, ResourceLookup};
pub use error::{ConfigResolutionError, ResolutionResult};
pub use resolver::{apply_defaults, ConfigResolver, PropertyFailure, Resolution};
pub use schema::{
    DefaultFn, DefaultValue, DynamicTypeFn, EnumFn, EnumItem, EnumSource, Schema, SchemaType,
};
pub use value::{parse_duration, Toggle};
