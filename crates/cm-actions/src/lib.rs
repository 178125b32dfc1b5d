//! Action registry with cancellable, schema-configured handlers
//!
//! Plugins define actions at load time. Each action declares a config
//! [`Schema`] that is resolved against the trigger context before the
//! handler runs. Handlers receive an [`AbortSignal`] and must settle promptly
//! when it fires. Handler errors and panics are caught here and reported as
//! [`ActionError`], so a misbehaving plugin never takes the runtime down.

mod builtin;
mod definition;

pub use builtin::{delay_action, pick_weighted, random_action, register_core_actions};
pub use definition::{
    ActionDefinition, ActionFuture, ActionHandler, ActionKind, FlowArgs, FlowFuture, FlowHandler,
    InvokeArgs,
};

use cm_core::{
    panic_message, AbortSignal, Context, ContextData, QualifiedId, QualifiedIdError, SharedSettings,
};
use cm_schema::{
    apply_defaults, ConfigResolutionError, ConfigResolver, ResolveContext, ResourceLookup, Schema,
};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::FutureExt;
use indexmap::IndexMap;
use serde_json::Value;
use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error, instrument, warn};

/// Result type for action operations
pub type ActionResult<T> = Result<T, ActionError>;

/// Errors that can occur when defining or invoking actions
#[derive(Debug, Clone, Error)]
pub enum ActionError {
    #[error("action not found: {0}")]
    NotFound(QualifiedId),

    #[error("action already defined: {0}")]
    AlreadyDefined(QualifiedId),

    #[error("action {0} is not a flow action")]
    NotAFlow(QualifiedId),

    #[error("action {0} is a flow action")]
    IsAFlow(QualifiedId),

    #[error(transparent)]
    InvalidId(#[from] QualifiedIdError),

    #[error("invalid config for {id}: {source}")]
    InvalidConfig {
        id: QualifiedId,
        #[source]
        source: ConfigResolutionError,
    },

    #[error("action {id} failed: {message}")]
    Invocation { id: QualifiedId, message: String },

    #[error("action {id} panicked: {message}")]
    Panicked { id: QualifiedId, message: String },

    /// Raised by handlers; wrapped into `Invocation` by the registry
    #[error("{0}")]
    Failed(String),
}

impl ActionError {
    pub fn failed(message: impl std::fmt::Display) -> Self {
        ActionError::Failed(message.to_string())
    }
}

/// Handle returned by [`ActionRegistry::define`]
///
/// Used by sequencing code to invoke the action without a lookup by string.
#[derive(Clone)]
pub struct ActionHandle {
    id: QualifiedId,
    registry: ActionRegistry,
}

impl ActionHandle {
    pub fn id(&self) -> &QualifiedId {
        &self.id
    }

    pub async fn invoke(
        &self,
        config: Value,
        context: Arc<ContextData>,
        abort: AbortSignal,
    ) -> ActionResult<Value> {
        self.registry
            .invoke(&self.id, config, context, abort)
            .await
    }
}

impl std::fmt::Debug for ActionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActionHandle").field("id", &self.id).finish()
    }
}

/// The action registry
///
/// Cheap to clone; clones share the same definitions.
#[derive(Clone)]
pub struct ActionRegistry {
    /// Definitions indexed by qualified id
    actions: Arc<DashMap<QualifiedId, Arc<ActionDefinition>>>,
    resolver: Arc<ConfigResolver>,
    settings: SharedSettings,
    resources: Option<Arc<dyn ResourceLookup>>,
}

impl ActionRegistry {
    pub fn new(resolver: Arc<ConfigResolver>, settings: SharedSettings) -> Self {
        Self {
            actions: Arc::new(DashMap::new()),
            resolver,
            settings,
            resources: None,
        }
    }

    /// Resolve resource-typed config properties through `resources`
    pub fn with_resources(mut self, resources: Arc<dyn ResourceLookup>) -> Self {
        self.resources = Some(resources);
        self
    }

    /// Register an action
    ///
    /// Fails if an action with the same qualified id already exists.
    #[instrument(skip(self, definition), fields(action = %definition.id))]
    pub fn define(&self, definition: ActionDefinition) -> ActionResult<ActionHandle> {
        let id = definition.id.clone();
        match self.actions.entry(id.clone()) {
            Entry::Occupied(_) => {
                warn!(action = %id, "Action already defined");
                Err(ActionError::AlreadyDefined(id))
            }
            Entry::Vacant(slot) => {
                debug!(action = %id, flow = definition.is_flow(), "Defining action");
                slot.insert(Arc::new(definition));
                Ok(ActionHandle {
                    id,
                    registry: self.clone(),
                })
            }
        }
    }

    /// Register a regular action from a handler function
    pub fn define_action<F, Fut>(
        &self,
        id: QualifiedId,
        config: Schema,
        handler: F,
    ) -> ActionResult<ActionHandle>
    where
        F: Fn(InvokeArgs) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ActionResult<Value>> + Send + 'static,
    {
        self.define(ActionDefinition::action(id, config, handler))
    }

    fn resolve_context(&self, context: &Arc<ContextData>) -> ResolveContext {
        ResolveContext {
            data: context.clone(),
            settings: self.settings.clone(),
            resources: self.resources.clone(),
        }
    }

    fn lookup(&self, id: &QualifiedId) -> ActionResult<Arc<ActionDefinition>> {
        // Clone out of the map so no shard lock is held across the handler
        self.actions
            .get(id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| {
                warn!(action = %id, "Action not found");
                ActionError::NotFound(id.clone())
            })
    }

    async fn resolve_config(
        &self,
        id: &QualifiedId,
        schema: &Schema,
        config: Value,
        ctx: &ResolveContext,
    ) -> ActionResult<Value> {
        self.resolver
            .resolve(schema, config, ctx)
            .await
            .into_required()
            .map_err(|source| ActionError::InvalidConfig {
                id: id.clone(),
                source,
            })
    }

    /// Invoke an action with a fresh run context
    pub async fn invoke(
        &self,
        id: &QualifiedId,
        config: Value,
        context: Arc<ContextData>,
        abort: AbortSignal,
    ) -> ActionResult<Value> {
        self.invoke_traced(id, config, context, abort, Context::new())
            .await
    }

    /// Invoke an action
    ///
    /// The raw config is resolved against `context` first. Handler errors
    /// and panics are logged and returned as [`ActionError::Invocation`] and
    /// [`ActionError::Panicked`].
    #[instrument(skip(self, id, config, context, abort, run), fields(action = %id, run_id = %run.id))]
    pub async fn invoke_traced(
        &self,
        id: &QualifiedId,
        config: Value,
        context: Arc<ContextData>,
        abort: AbortSignal,
        run: Context,
    ) -> ActionResult<Value> {
        let definition = self.lookup(id)?;
        let handler = match &definition.kind {
            ActionKind::Regular(handler) => handler.clone(),
            ActionKind::Flow { .. } => return Err(ActionError::IsAFlow(id.clone())),
        };

        let ctx = self.resolve_context(&context);
        let config = self
            .resolve_config(id, &definition.config, config, &ctx)
            .await?;

        debug!(action = %id, run_id = %run.id, "Invoking action");
        let args = InvokeArgs {
            config,
            context,
            abort,
            run,
        };
        let outcome = AssertUnwindSafe(async move { handler(args).await })
            .catch_unwind()
            .await;

        let value = self.settle(id, outcome)?;
        Ok(match &definition.result {
            Some(schema) => apply_defaults(schema, value, &ctx),
            None => value,
        })
    }

    /// Invoke a flow action with a fresh run context
    pub async fn invoke_flow(
        &self,
        id: &QualifiedId,
        config: Value,
        flows: IndexMap<String, Value>,
        context: Arc<ContextData>,
        abort: AbortSignal,
    ) -> ActionResult<Option<String>> {
        self.invoke_flow_traced(id, config, flows, context, abort, Context::new())
            .await
    }

    /// Invoke a flow action and return the selected flow key
    ///
    /// Each entry of `flows` is resolved against the action's flow schema.
    /// `None` means no flow was selected.
    #[instrument(skip(self, id, config, flows, context, abort, run), fields(action = %id, run_id = %run.id))]
    pub async fn invoke_flow_traced(
        &self,
        id: &QualifiedId,
        config: Value,
        flows: IndexMap<String, Value>,
        context: Arc<ContextData>,
        abort: AbortSignal,
        run: Context,
    ) -> ActionResult<Option<String>> {
        let definition = self.lookup(id)?;
        let (flow_config, handler) = match &definition.kind {
            ActionKind::Flow {
                flow_config,
                handler,
            } => (flow_config, handler.clone()),
            ActionKind::Regular(_) => return Err(ActionError::NotAFlow(id.clone())),
        };

        let ctx = self.resolve_context(&context);
        let config = self
            .resolve_config(id, &definition.config, config, &ctx)
            .await?;

        let mut resolved = IndexMap::with_capacity(flows.len());
        for (key, raw) in flows {
            let flow = self.resolve_config(id, flow_config, raw, &ctx).await?;
            resolved.insert(key, flow);
        }

        debug!(action = %id, run_id = %run.id, flows = resolved.len(), "Invoking flow action");
        let args = FlowArgs {
            config,
            flows: resolved,
            context,
            abort,
            run,
        };
        let outcome = AssertUnwindSafe(async move { handler(args).await })
            .catch_unwind()
            .await;

        self.settle(id, outcome)
    }

    fn settle<T>(
        &self,
        id: &QualifiedId,
        outcome: Result<ActionResult<T>, Box<dyn Any + Send>>,
    ) -> ActionResult<T> {
        match outcome {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(err)) => {
                error!(action = %id, error = %err, "Action failed");
                Err(ActionError::Invocation {
                    id: id.clone(),
                    message: err.to_string(),
                })
            }
            Err(payload) => {
                let message = panic_message(payload);
                error!(action = %id, panic = %message, "Action panicked");
                Err(ActionError::Panicked {
                    id: id.clone(),
                    message,
                })
            }
        }
    }

    /// Get an action definition
    pub fn get(&self, id: &QualifiedId) -> Option<Arc<ActionDefinition>> {
        self.actions.get(id).map(|entry| entry.value().clone())
    }

    /// Check if an action exists
    pub fn contains(&self, id: &QualifiedId) -> bool {
        self.actions.contains_key(id)
    }

    /// Handle for an already defined action
    pub fn handle(&self, id: &QualifiedId) -> Option<ActionHandle> {
        self.contains(id).then(|| ActionHandle {
            id: id.clone(),
            registry: self.clone(),
        })
    }

    /// Ids of all actions defined by a plugin, sorted
    pub fn plugin_actions(&self, plugin: &str) -> Vec<QualifiedId> {
        let mut ids: Vec<_> = self
            .actions
            .iter()
            .filter(|entry| entry.key().plugin() == plugin)
            .map(|entry| entry.key().clone())
            .collect();
        ids.sort_by(|a, b| a.id().cmp(b.id()));
        ids
    }

    /// Remove an action
    #[instrument(skip(self, id), fields(action = %id))]
    pub fn unregister(&self, id: &QualifiedId) -> bool {
        let removed = self.actions.remove(id).is_some();
        if removed {
            debug!(action = %id, "Unregistered action");
        }
        removed
    }

    /// Remove every action of a plugin
    #[instrument(skip(self))]
    pub fn unregister_plugin(&self, plugin: &str) -> usize {
        let ids = self.plugin_actions(plugin);
        let count = ids.len();
        for id in ids {
            self.actions.remove(&id);
        }
        debug!(plugin = %plugin, count = count, "Unregistered plugin actions");
        count
    }

    pub fn action_count(&self) -> usize {
        self.actions.len()
    }
}

/// Thread-safe wrapper for ActionRegistry
pub type SharedActionRegistry = Arc<ActionRegistry>;
