//! Trigger definitions

use crate::cooldown::CooldownTable;
use crate::TriggerResult;
use cm_core::{duration_from_secs, ContextData, QualifiedId, TriggerMapping};
use cm_schema::Schema;
use serde_json::Value;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

/// Inputs handed to a trigger handler for one instance
#[derive(Debug, Clone)]
pub struct HandleArgs {
    /// Instance config, resolved against the trigger's config schema
    pub config: Value,
    /// Event context with defaults applied
    pub context: ContextData,
    pub mapping: TriggerMapping,
    pub cooldowns: Arc<CooldownTable>,
}

impl HandleArgs {
    /// Whether this instance is outside its cooldown; if so, start a new one
    ///
    /// A missing or non-positive cooldown never suppresses.
    pub fn cooldown(&self, seconds: Option<f64>) -> bool {
        match seconds {
            Some(secs) if secs > 0.0 => self
                .cooldowns
                .check_and_mark(&self.mapping, duration_from_secs(secs)),
            _ => true,
        }
    }
}

/// Result of handling one instance
#[derive(Debug, Clone, PartialEq)]
pub enum HandleOutcome {
    /// Not a match for this instance
    Skip,
    /// Run the instance's sequence with this context
    Activate(ContextData),
}

/// Future type for trigger handlers
pub type HandleFuture = Pin<Box<dyn Future<Output = TriggerResult<HandleOutcome>> + Send>>;

/// Trigger handler function type
pub type TriggerHandler = Arc<dyn Fn(HandleArgs) -> HandleFuture + Send + Sync>;

/// Per-instance context schema of a transform trigger
pub type ContextSchemaFn = Arc<dyn Fn(&Value) -> Schema + Send + Sync>;

/// A registered trigger
#[derive(Clone)]
pub struct TriggerDefinition {
    pub id: QualifiedId,
    pub name: Option<String>,
    pub description: Option<String>,
    /// Schema of each instance's match config
    pub config: Schema,
    /// Schema of the context passed to `fire`; its defaults fill omitted fields
    pub context: Schema,
    /// Set for transform triggers
    pub instance_context: Option<ContextSchemaFn>,
    pub handler: TriggerHandler,
}

impl TriggerDefinition {
    /// Define a trigger whose handler accepts or rejects the event as-is
    pub fn new<F, Fut>(id: QualifiedId, config: Schema, context: Schema, handle: F) -> Self
    where
        F: Fn(HandleArgs) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = TriggerResult<bool>> + Send + 'static,
    {
        let handle = Arc::new(handle);
        let handler: TriggerHandler = Arc::new(move |args: HandleArgs| {
            let context = args.context.clone();
            let matched = handle(args);
            Box::pin(async move {
                Ok(if matched.await? {
                    HandleOutcome::Activate(context)
                } else {
                    HandleOutcome::Skip
                })
            }) as HandleFuture
        });

        Self {
            id,
            name: None,
            description: None,
            config,
            context,
            instance_context: None,
            handler,
        }
    }

    /// Define a transform trigger
    ///
    /// `instance_context` builds each instance's context schema from its
    /// config; its defaults are applied before `handle` runs. `handle`
    /// returns the enriched context, or `None` to skip the instance.
    pub fn transform<C, F, Fut>(
        id: QualifiedId,
        config: Schema,
        context: Schema,
        instance_context: C,
        handle: F,
    ) -> Self
    where
        C: Fn(&Value) -> Schema + Send + Sync + 'static,
        F: Fn(HandleArgs) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = TriggerResult<Option<ContextData>>> + Send + 'static,
    {
        let handler: TriggerHandler = Arc::new(move |args: HandleArgs| {
            let transformed = handle(args);
            Box::pin(async move {
                Ok(match transformed.await? {
                    Some(context) => HandleOutcome::Activate(context),
                    None => HandleOutcome::Skip,
                })
            }) as HandleFuture
        });
        let instance_context: ContextSchemaFn = Arc::new(instance_context);

        Self {
            id,
            name: None,
            description: None,
            config,
            context,
            instance_context: Some(instance_context),
            handler,
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

    pub fn is_transform(&self) -> bool {
        self.instance_context.is_some()
    }

    /// Context schema for an instance with the given resolved config
    pub fn context_schema(&self, config: &Value) -> Schema {
        match &self.instance_context {
            Some(build) => build(config),
            None => self.context.clone(),
        }
    }
}

impl std::fmt::Debug for TriggerDefinition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TriggerDefinition")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("transform", &self.is_transform())
            .finish()
    }
}
