//! Automation runtime composition
//!
//! Wires the template engine, config resolver, settings, action and trigger
//! registries, resource storages and the satellite link into one
//! [`Runtime`], and runs the action sequences of trigger activations.

mod runtime;
mod sequence;

pub use runtime::Runtime;
pub use sequence::{
    parse_sequence, FlowBranch, RunOutcome, SequenceError, SequenceResult, SequenceRunner, Step,
};
