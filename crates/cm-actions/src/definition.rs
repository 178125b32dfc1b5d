//! Action definitions

use crate::ActionResult;
use cm_core::{AbortSignal, Context, ContextData, QualifiedId};
use cm_schema::Schema;
use indexmap::IndexMap;
use serde_json::Value;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

/// Inputs handed to an action handler
#[derive(Debug, Clone)]
pub struct InvokeArgs {
    /// Config resolved against the action's config schema
    pub config: Value,
    /// Trigger context the sequence runs with
    pub context: Arc<ContextData>,
    /// Must be observed at every suspension point
    pub abort: AbortSignal,
    /// Run context for log correlation
    pub run: Context,
}

/// Inputs handed to a flow action handler
#[derive(Debug, Clone)]
pub struct FlowArgs {
    pub config: Value,
    /// Per-flow configs, resolved against the flow schema, in declaration order
    pub flows: IndexMap<String, Value>,
    pub context: Arc<ContextData>,
    pub abort: AbortSignal,
    pub run: Context,
}

/// Future type for action handlers
pub type ActionFuture = Pin<Box<dyn Future<Output = ActionResult<Value>> + Send>>;

/// Future type for flow handlers; resolves to the selected flow key
pub type FlowFuture = Pin<Box<dyn Future<Output = ActionResult<Option<String>>> + Send>>;

/// Action handler function type
pub type ActionHandler = Arc<dyn Fn(InvokeArgs) -> ActionFuture + Send + Sync>;

/// Flow handler function type
pub type FlowHandler = Arc<dyn Fn(FlowArgs) -> FlowFuture + Send + Sync>;

#[derive(Clone)]
pub enum ActionKind {
    /// Performs an effect and returns a result value
    Regular(ActionHandler),
    /// Chooses one of several flows, each configured with `flow_config`
    Flow {
        flow_config: Schema,
        handler: FlowHandler,
    },
}

/// A registered action
#[derive(Clone)]
pub struct ActionDefinition {
    pub id: QualifiedId,
    pub name: Option<String>,
    pub description: Option<String>,
    pub config: Schema,
    /// Defaults applied to the handler's return value
    pub result: Option<Schema>,
    pub kind: ActionKind,
}

impl ActionDefinition {
    /// Define a regular action
    pub fn action<F, Fut>(id: QualifiedId, config: Schema, handler: F) -> Self
    where
        F: Fn(InvokeArgs) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ActionResult<Value>> + Send + 'static,
    {
        let handler: ActionHandler = Arc::new(move |args| Box::pin(handler(args)) as ActionFuture);
        Self {
            id,
            name: None,
            description: None,
            config,
            result: None,
            kind: ActionKind::Regular(handler),
        }
    }

    /// Define a flow action
    pub fn flow<F, Fut>(id: QualifiedId, config: Schema, flow_config: Schema, handler: F) -> Self
    where
        F: Fn(FlowArgs) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ActionResult<Option<String>>> + Send + 'static,
    {
        let handler: FlowHandler = Arc::new(move |args| Box::pin(handler(args)) as FlowFuture);
        Self {
            id,
            name: None,
            description: None,
            config,
            result: None,
            kind: ActionKind::Flow {
                flow_config,
                handler,
            },
        }
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn described(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_result(mut self, result: Schema) -> Self {
        self.result = Some(result);
        self
    }

    pub fn is_flow(&self) -> bool {
        matches!(self.kind, ActionKind::Flow { .. })
    }
}

impl std::fmt::Debug for ActionDefinition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActionDefinition")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("flow", &self.is_flow())
            .finish()
    }
}
