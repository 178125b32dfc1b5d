//! Action sequences run on trigger activation
//!
//! A profile's trigger instance carries its sequence as plain data:
//!
//! ```yaml
//! sequence:
//!   - action: core.delay
//!     config: { duration: 2 }
//!   - action: core.random
//!     flows:
//!       greet: { weight: 3, steps: [ { action: chat.say, config: { message: "hi {{ user }}" } } ] }
//!       ignore: { weight: 1 }
//! ```
//!
//! Steps run in order. A flow step hands every branch's config (minus
//! `steps`) to the flow action and continues with the branch it selects.

use cm_actions::{ActionError, ActionRegistry};
use cm_core::{AbortController, AbortSignal, Context, ContextData, QualifiedId, QualifiedIdError};
use cm_triggers::{Activation, SequenceDispatcher};
use dashmap::DashMap;
use futures::future::BoxFuture;
use futures::FutureExt;
use indexmap::IndexMap;
use serde::Deserialize;
use serde_json::{Map, Value};
use std::sync::Arc;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, trace, warn};

/// Result type for sequence runs
pub type SequenceResult<T> = Result<T, SequenceError>;

#[derive(Debug, Error)]
pub enum SequenceError {
    #[error("invalid sequence: {0}")]
    Parse(#[from] serde_json::Error),

    #[error(transparent)]
    InvalidAction(#[from] QualifiedIdError),

    #[error(transparent)]
    Action(#[from] ActionError),

    #[error("{action} selected unknown flow {flow}")]
    UnknownFlow { action: QualifiedId, flow: String },
}

/// One action invocation in a sequence
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Step {
    /// Qualified action id, `plugin.action`
    pub action: String,
    #[serde(default)]
    pub config: Value,
    /// Present only for flow actions
    #[serde(default)]
    pub flows: Option<IndexMap<String, FlowBranch>>,
}

/// A flow choice and the steps it leads to
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct FlowBranch {
    #[serde(default)]
    pub steps: Vec<Step>,
    /// Everything else is flow config
    #[serde(flatten)]
    pub config: Map<String, Value>,
}

/// Parse a trigger instance's sequence; `null` is an empty sequence
pub fn parse_sequence(sequence: &Value) -> SequenceResult<Vec<Step>> {
    if sequence.is_null() {
        return Ok(Vec::new());
    }
    Ok(Vec::<Step>::deserialize(sequence)?)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    Completed,
    Aborted,
}

/// Runs activation sequences through the action registry
///
/// Cheap to clone; clones share the set of in-flight runs.
#[derive(Clone)]
pub struct SequenceRunner {
    actions: ActionRegistry,
    /// Abort switches of in-flight runs, keyed by run id
    runs: Arc<DashMap<String, Arc<AbortController>>>,
}

impl SequenceRunner {
    pub fn new(actions: ActionRegistry) -> Self {
        Self {
            actions,
            runs: Arc::new(DashMap::new()),
        }
    }

    /// Run `steps` to completion or abort
    pub async fn run(
        &self,
        steps: &[Step],
        context: Arc<ContextData>,
        abort: AbortSignal,
        run: &Context,
    ) -> SequenceResult<RunOutcome> {
        self.run_steps(steps, &context, &abort, run).await
    }

    fn run_steps<'a>(
        &'a self,
        steps: &'a [Step],
        context: &'a Arc<ContextData>,
        abort: &'a AbortSignal,
        run: &'a Context,
    ) -> BoxFuture<'a, SequenceResult<RunOutcome>> {
        async move {
            for step in steps {
                if abort.is_aborted() {
                    debug!(run_id = %run.id, "Sequence aborted");
                    return Ok(RunOutcome::Aborted);
                }

                let action: QualifiedId = step.action.parse()?;
                let Some(flows) = &step.flows else {
                    let result = self
                        .actions
                        .invoke_traced(
                            &action,
                            step.config.clone(),
                            context.clone(),
                            abort.clone(),
                            run.child(),
                        )
                        .await?;
                    trace!(run_id = %run.id, action = %action, result = %result, "Step finished");
                    continue;
                };

                let configs: IndexMap<String, Value> = flows
                    .iter()
                    .map(|(key, branch)| (key.clone(), Value::Object(branch.config.clone())))
                    .collect();
                let selected = self
                    .actions
                    .invoke_flow_traced(
                        &action,
                        step.config.clone(),
                        configs,
                        context.clone(),
                        abort.clone(),
                        run.child(),
                    )
                    .await?;

                let Some(key) = selected else {
                    debug!(run_id = %run.id, action = %action, "No flow selected");
                    continue;
                };
                let branch = flows.get(&key).ok_or_else(|| SequenceError::UnknownFlow {
                    action: action.clone(),
                    flow: key.clone(),
                })?;
                debug!(run_id = %run.id, action = %action, flow = %key, "Entering flow");
                if self.run_steps(&branch.steps, context, abort, run).await? == RunOutcome::Aborted {
                    return Ok(RunOutcome::Aborted);
                }
            }

            Ok(if abort.is_aborted() {
                RunOutcome::Aborted
            } else {
                RunOutcome::Completed
            })
        }
        .boxed()
    }

    /// Run an activation's sequence on its own task
    pub fn start(&self, activation: Activation) -> JoinHandle<SequenceResult<RunOutcome>> {
        let runner = self.clone();
        tokio::spawn(async move { runner.execute(activation).await })
    }

    #[instrument(skip(self, activation), fields(mapping = %activation.mapping))]
    async fn execute(&self, activation: Activation) -> SequenceResult<RunOutcome> {
        let steps = match parse_sequence(&activation.sequence) {
            Ok(steps) => steps,
            Err(e) => {
                warn!(mapping = %activation.mapping, error = %e, "Invalid sequence");
                return Err(e);
            }
        };

        let run = Context::with_origin(format!("trigger:{}", activation.trigger));
        let controller = Arc::new(AbortController::new());
        self.runs.insert(run.id.clone(), controller.clone());

        debug!(mapping = %activation.mapping, run_id = %run.id, steps = steps.len(), "Running sequence");
        let result = self
            .run(&steps, Arc::new(activation.context), controller.signal(), &run)
            .await;
        self.runs.remove(&run.id);

        match &result {
            Ok(RunOutcome::Completed) => {
                debug!(mapping = %activation.mapping, run_id = %run.id, "Sequence completed")
            }
            Ok(RunOutcome::Aborted) => {
                info!(mapping = %activation.mapping, run_id = %run.id, "Sequence aborted")
            }
            Err(e) => {
                error!(mapping = %activation.mapping, run_id = %run.id, error = %e, "Sequence failed")
            }
        }
        result
    }

    /// Abort every in-flight run; returns how many were signalled
    pub fn abort_all(&self) -> usize {
        let mut count = 0;
        for entry in self.runs.iter() {
            entry.value().abort();
            count += 1;
        }
        count
    }

    pub fn running_count(&self) -> usize {
        self.runs.len()
    }
}

impl SequenceDispatcher for SequenceRunner {
    fn dispatch(&self, activation: Activation) {
        self.start(activation);
    }
}
