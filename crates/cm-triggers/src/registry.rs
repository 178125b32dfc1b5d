//! Trigger registry and the fire pipeline

use crate::cooldown::CooldownTable;
use crate::definition::{HandleArgs, HandleOutcome, TriggerDefinition};
use crate::profile::{SharedProfileManager, TriggerInstance};
use crate::{TriggerError, TriggerResult};
use cm_core::{panic_message, ContextData, QualifiedId, SharedSettings, TriggerMapping};
use cm_schema::{apply_defaults, ConfigResolver, ResolveContext, ResourceLookup, Schema};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::FutureExt;
use serde_json::Value;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tracing::{debug, instrument, trace, warn};

/// A matched trigger instance, ready to run its sequence
#[derive(Debug, Clone, PartialEq)]
pub struct Activation {
    pub mapping: TriggerMapping,
    pub trigger: QualifiedId,
    /// The instance's configured action sequence
    pub sequence: Value,
    /// Context after defaults and transformation
    pub context: ContextData,
}

/// Receives activations from [`TriggerHandle::fire`]
///
/// Called synchronously inside the fire loop; implementations should hand
/// the work off (spawn, queue) rather than run the sequence inline.
pub trait SequenceDispatcher: Send + Sync {
    fn dispatch(&self, activation: Activation);
}

/// Dispatcher that drops every activation
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopDispatcher;

impl SequenceDispatcher for NoopDispatcher {
    fn dispatch(&self, activation: Activation) {
        trace!(mapping = %activation.mapping, "Dropping activation");
    }
}

/// Outcome counts of one fire
#[derive(Debug, Default, Clone)]
pub struct FireReport {
    /// Instances considered across the active profiles
    pub evaluated: usize,
    pub activated: usize,
    pub skipped: usize,
    pub failed: usize,
    pub errors: Vec<TriggerError>,
}

/// Handle returned by [`TriggerRegistry::define`]; the notification path for
/// event sources
#[derive(Clone)]
pub struct TriggerHandle {
    id: QualifiedId,
    registry: TriggerRegistry,
}

impl TriggerHandle {
    pub fn id(&self) -> &QualifiedId {
        &self.id
    }

    /// Notify the runtime that this trigger's event occurred
    ///
    /// Safe to call with no profiles active. If the trigger was unregistered
    /// in the meantime the fire is a no-op.
    pub async fn fire(&self, context: ContextData) -> FireReport {
        match self.registry.get(&self.id) {
            Some(definition) => self.registry.fire_definition(definition, context).await,
            None => {
                debug!(trigger = %self.id, "Fired unregistered trigger");
                FireReport::default()
            }
        }
    }
}

impl std::fmt::Debug for TriggerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TriggerHandle").field("id", &self.id).finish()
    }
}

/// The trigger registry
///
/// Cheap to clone; clones share the same definitions and profiles.
#[derive(Clone)]
pub struct TriggerRegistry {
    triggers: Arc<DashMap<QualifiedId, Arc<TriggerDefinition>>>,
    profiles: SharedProfileManager,
    resolver: Arc<ConfigResolver>,
    settings: SharedSettings,
    resources: Option<Arc<dyn ResourceLookup>>,
    dispatcher: Arc<dyn SequenceDispatcher>,
}

impl TriggerRegistry {
    pub fn new(
        resolver: Arc<ConfigResolver>,
        settings: SharedSettings,
        profiles: SharedProfileManager,
        dispatcher: Arc<dyn SequenceDispatcher>,
    ) -> Self {
        Self {
            triggers: Arc::new(DashMap::new()),
            profiles,
            resolver,
            settings,
            resources: None,
            dispatcher,
        }
    }

    /// Resolve resource-typed config properties through `resources`
    pub fn with_resources(mut self, resources: Arc<dyn ResourceLookup>) -> Self {
        self.resources = Some(resources);
        self
    }

    pub fn profiles(&self) -> &SharedProfileManager {
        &self.profiles
    }

    /// Register a trigger
    ///
    /// Fails if a trigger with the same qualified id already exists.
    #[instrument(skip(self, definition), fields(trigger = %definition.id))]
    pub fn define(&self, definition: TriggerDefinition) -> TriggerResult<TriggerHandle> {
        let id = definition.id.clone();
        match self.triggers.entry(id.clone()) {
            Entry::Occupied(_) => {
                warn!(trigger = %id, "Trigger already defined");
                Err(TriggerError::AlreadyDefined(id))
            }
            Entry::Vacant(slot) => {
                debug!(trigger = %id, transform = definition.is_transform(), "Defining trigger");
                slot.insert(Arc::new(definition));
                Ok(TriggerHandle {
                    id,
                    registry: self.clone(),
                })
            }
        }
    }

    /// Register a plain trigger from a match function
    pub fn define_trigger<F, Fut>(
        &self,
        id: QualifiedId,
        config: Schema,
        context: Schema,
        handle: F,
    ) -> TriggerResult<TriggerHandle>
    where
        F: Fn(HandleArgs) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = TriggerResult<bool>> + Send + 'static,
    {
        self.define(TriggerDefinition::new(id, config, context, handle))
    }

    pub fn get(&self, id: &QualifiedId) -> Option<Arc<TriggerDefinition>> {
        self.triggers.get(id).map(|entry| entry.value().clone())
    }

    pub fn contains(&self, id: &QualifiedId) -> bool {
        self.triggers.contains_key(id)
    }

    pub fn handle(&self, id: &QualifiedId) -> Option<TriggerHandle> {
        self.contains(id).then(|| TriggerHandle {
            id: id.clone(),
            registry: self.clone(),
        })
    }

    /// Ids of all triggers defined by a plugin, sorted
    pub fn plugin_triggers(&self, plugin: &str) -> Vec<QualifiedId> {
        let mut ids: Vec<_> = self
            .triggers
            .iter()
            .filter(|entry| entry.key().plugin() == plugin)
            .map(|entry| entry.key().clone())
            .collect();
        ids.sort_by(|a, b| a.id().cmp(b.id()));
        ids
    }

    /// Remove every trigger of a plugin
    #[instrument(skip(self))]
    pub fn unregister_plugin(&self, plugin: &str) -> usize {
        let ids = self.plugin_triggers(plugin);
        let count = ids.len();
        for id in ids {
            self.triggers.remove(&id);
        }
        debug!(plugin = %plugin, count = count, "Unregistered plugin triggers");
        count
    }

    pub fn trigger_count(&self) -> usize {
        self.triggers.len()
    }

    /// Fire a trigger by id
    pub async fn fire_by_id(
        &self,
        id: &QualifiedId,
        context: ContextData,
    ) -> TriggerResult<FireReport> {
        let definition = self
            .get(id)
            .ok_or_else(|| TriggerError::NotFound(id.clone()))?;
        Ok(self.fire_definition(definition, context).await)
    }

    fn resolve_context(&self, data: ContextData) -> ResolveContext {
        let ctx = ResolveContext::new(data, self.settings.clone());
        match &self.resources {
            Some(resources) => ctx.with_resources(resources.clone()),
            None => ctx,
        }
    }

    #[instrument(skip(self, definition, context), fields(trigger = %definition.id))]
    async fn fire_definition(
        &self,
        definition: Arc<TriggerDefinition>,
        context: ContextData,
    ) -> FireReport {
        let base = self.resolve_context(ContextData::new());
        let context = into_context(apply_defaults(
            &definition.context,
            Value::Object(context),
            &base,
        ));

        // One snapshot for the whole fire
        let snapshot = self.profiles.snapshot();
        let cooldowns = self.profiles.cooldowns();
        let mut report = FireReport::default();

        for profile in &snapshot.active {
            for instance in profile.iter_triggers(&definition.id) {
                let mapping = profile.mapping(instance);
                report.evaluated += 1;

                let outcome = self
                    .evaluate(&definition, instance, &mapping, &context, &cooldowns)
                    .await;
                match outcome {
                    Ok(HandleOutcome::Activate(merged)) => {
                        report.activated += 1;
                        debug!(mapping = %mapping, "Trigger instance activated");
                        self.dispatcher.dispatch(Activation {
                            mapping,
                            trigger: definition.id.clone(),
                            sequence: instance.sequence.clone(),
                            context: merged,
                        });
                    }
                    Ok(HandleOutcome::Skip) => {
                        report.skipped += 1;
                        trace!(mapping = %mapping, "Trigger instance skipped");
                    }
                    Err(e) => {
                        report.failed += 1;
                        warn!(mapping = %mapping, error = %e, "Trigger instance failed");
                        report.errors.push(e);
                    }
                }
            }
        }

        debug!(
            evaluated = report.evaluated,
            activated = report.activated,
            failed = report.failed,
            "Fire complete"
        );
        report
    }

    async fn evaluate(
        &self,
        definition: &TriggerDefinition,
        instance: &TriggerInstance,
        mapping: &TriggerMapping,
        context: &ContextData,
        cooldowns: &Arc<CooldownTable>,
    ) -> TriggerResult<HandleOutcome> {
        let ctx = self.resolve_context(context.clone());
        let config = self
            .resolver
            .resolve(&definition.config, instance.config.clone(), &ctx)
            .await
            .into_required()
            .map_err(|source| TriggerError::InvalidConfig {
                mapping: mapping.clone(),
                source,
            })?;

        let context = if definition.is_transform() {
            let schema = definition.context_schema(&config);
            into_context(apply_defaults(&schema, Value::Object(context.clone()), &ctx))
        } else {
            context.clone()
        };

        let args = HandleArgs {
            config,
            context,
            mapping: mapping.clone(),
            cooldowns: cooldowns.clone(),
        };
        let handler = definition.handler.clone();
        let outcome = AssertUnwindSafe(async move { handler(args).await })
            .catch_unwind()
            .await;

        match outcome {
            Ok(Ok(outcome)) => Ok(outcome),
            Ok(Err(err)) => Err(TriggerError::Handle {
                mapping: mapping.clone(),
                message: err.to_string(),
            }),
            Err(payload) => Err(TriggerError::Panicked {
                mapping: mapping.clone(),
                message: panic_message(payload),
            }),
        }
    }
}

fn into_context(value: Value) -> ContextData {
    match value {
        Value::Object(map) => map,
        _ => ContextData::new(),
    }
}

/// Thread-safe wrapper for TriggerRegistry
pub type SharedTriggerRegistry = Arc<TriggerRegistry>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profile::{Profile, ProfileManager};
    use cm_core::SettingsStore;
    use cm_template::TemplateEngine;
    use serde_json::json;
    use std::sync::Mutex;
    use std::time::Duration;

    #[derive(Default)]
    struct Recorder {
        activations: Mutex<Vec<Activation>>,
    }

    impl Recorder {
        fn mappings(&self) -> Vec<String> {
            self.activations
                .lock()
                .unwrap()
                .iter()
                .map(|a| a.mapping.to_string())
                .collect()
        }
    }

    impl SequenceDispatcher for Recorder {
        fn dispatch(&self, activation: Activation) {
            self.activations.lock().unwrap().push(activation);
        }
    }

    fn setup() -> (TriggerRegistry, SharedProfileManager, Arc<Recorder>) {
        let templates = Arc::new(TemplateEngine::new());
        let profiles = Arc::new(ProfileManager::new(templates.clone()));
        let recorder = Arc::new(Recorder::default());
        let registry = TriggerRegistry::new(
            Arc::new(ConfigResolver::new(templates)),
            Arc::new(SettingsStore::new()),
            profiles.clone(),
            recorder.clone(),
        );
        (registry, profiles, recorder)
    }

    fn qid(plugin: &str, id: &str) -> QualifiedId {
        QualifiedId::new(plugin, id).unwrap()
    }

    fn instance(id: &str, trigger: &QualifiedId, config: Value) -> TriggerInstance {
        TriggerInstance {
            id: id.to_string(),
            plugin: trigger.plugin().to_string(),
            trigger: trigger.id().to_string(),
            config,
            sequence: json!({"steps": [{"action": "core.delay"}]}),
        }
    }

    fn context(value: Value) -> ContextData {
        into_context(value)
    }

    /// Trigger matching when `user` equals the instance's configured user
    fn define_user_trigger(registry: &TriggerRegistry) -> TriggerHandle {
        registry
            .define_trigger(
                qid("chat", "message"),
                Schema::object().property("user", Schema::string()),
                Schema::object()
                    .property("user", Schema::string().default_value(json!("viewer")))
                    .property("text", Schema::string()),
                |args: HandleArgs| async move {
                    Ok(match args.config.get("user") {
                        Some(user) => args.context.get("user") == Some(user),
                        None => true,
                    })
                },
            )
            .unwrap()
    }

    // ==================== Registration ====================

    #[test]
    fn test_duplicate_trigger_rejected() {
        let (registry, _, _) = setup();
        define_user_trigger(&registry);

        let second = registry.define_trigger(
            qid("chat", "message"),
            Schema::any(),
            Schema::any(),
            |_| async { Ok(true) },
        );
        assert!(matches!(second, Err(TriggerError::AlreadyDefined(_))));
        assert_eq!(registry.trigger_count(), 1);
    }

    #[test]
    fn test_plugin_triggers_and_unregister() {
        let (registry, _, _) = setup();
        for (plugin, id) in [("chat", "message"), ("chat", "raid"), ("obs", "scene")] {
            registry
                .define_trigger(qid(plugin, id), Schema::any(), Schema::any(), |_| async {
                    Ok(true)
                })
                .unwrap();
        }

        let chat: Vec<_> = registry
            .plugin_triggers("chat")
            .iter()
            .map(|id| id.to_string())
            .collect();
        assert_eq!(chat, vec!["chat.message", "chat.raid"]);

        assert_eq!(registry.unregister_plugin("chat"), 2);
        assert!(registry.contains(&qid("obs", "scene")));
    }

    #[tokio::test]
    async fn test_fire_by_unknown_id() {
        let (registry, _, _) = setup();
        let result = registry.fire_by_id(&qid("nope", "none"), ContextData::new()).await;
        assert!(matches!(result, Err(TriggerError::NotFound(_))));
    }

    // ==================== Fire ====================

    #[tokio::test]
    async fn test_fire_without_profiles_is_noop() {
        let (registry, _, recorder) = setup();
        let handle = define_user_trigger(&registry);

        let report = handle.fire(context(json!({"user": "ada"}))).await;

        assert_eq!(report.evaluated, 0);
        assert!(recorder.mappings().is_empty());
    }

    #[tokio::test]
    async fn test_fire_applies_context_defaults() {
        let (registry, profiles, recorder) = setup();
        let handle = define_user_trigger(&registry);
        let trigger = handle.id().clone();
        profiles
            .load(
                vec![Profile::new("main")
                    .with_trigger(instance("greet", &trigger, json!({"user": "viewer"})))],
                ContextData::new(),
            )
            .unwrap();

        let report = handle.fire(context(json!({"text": "hi"}))).await;

        assert_eq!(report.activated, 1);
        let activations = recorder.activations.lock().unwrap();
        assert_eq!(activations[0].context["user"], json!("viewer"));
        assert_eq!(activations[0].context["text"], json!("hi"));
        assert_eq!(activations[0].trigger, trigger);
        assert_eq!(activations[0].sequence["steps"][0]["action"], json!("core.delay"));
    }

    #[tokio::test]
    async fn test_only_active_profiles_evaluated() {
        let (registry, profiles, recorder) = setup();
        let handle = define_user_trigger(&registry);
        let trigger = handle.id().clone();
        profiles
            .load(
                vec![
                    Profile::new("on").with_trigger(instance("a", &trigger, json!({}))),
                    Profile::new("live")
                        .with_activation("{{ live }}")
                        .with_trigger(instance("b", &trigger, json!({}))),
                ],
                context(json!({"live": false})),
            )
            .unwrap();

        let report = handle.fire(ContextData::new()).await;
        assert_eq!(report.evaluated, 1);
        assert_eq!(recorder.mappings(), vec!["on.a"]);

        profiles.recompute(context(json!({"live": true})));
        handle.fire(ContextData::new()).await;
        assert_eq!(recorder.mappings(), vec!["on.a", "on.a", "live.b"]);
    }

    #[tokio::test]
    async fn test_instance_config_resolved_against_context() {
        let (registry, profiles, recorder) = setup();
        let handle = registry
            .define_trigger(
                qid("chat", "echo"),
                Schema::object().property("expect", Schema::string().templated().required()),
                Schema::any(),
                |args: HandleArgs| async move {
                    Ok(args.config["expect"] == json!("hello ada"))
                },
            )
            .unwrap();
        let trigger = handle.id().clone();
        profiles
            .load(
                vec![Profile::new("p")
                    .with_trigger(instance("t", &trigger, json!({"expect": "hello {{ user }}"})))],
                ContextData::new(),
            )
            .unwrap();

        let report = handle.fire(context(json!({"user": "ada"}))).await;

        assert_eq!(report.activated, 1);
        assert_eq!(recorder.mappings(), vec!["p.t"]);
    }

    #[tokio::test]
    async fn test_invalid_instance_config_isolated() {
        let (registry, profiles, recorder) = setup();
        let handle = registry
            .define_trigger(
                qid("chat", "strict"),
                Schema::object().property("target", Schema::string().required()),
                Schema::any(),
                |_| async { Ok(true) },
            )
            .unwrap();
        let trigger = handle.id().clone();
        profiles
            .load(
                vec![Profile::new("p")
                    .with_trigger(instance("broken", &trigger, json!({})))
                    .with_trigger(instance("fine", &trigger, json!({"target": "x"})))],
                ContextData::new(),
            )
            .unwrap();

        let report = handle.fire(ContextData::new()).await;

        assert_eq!(report.failed, 1);
        assert!(matches!(
            &report.errors[0],
            TriggerError::InvalidConfig { mapping, .. } if mapping.trigger_id == "broken"
        ));
        assert_eq!(recorder.mappings(), vec!["p.fine"]);
    }

    // ==================== Isolation ====================

    #[tokio::test]
    async fn test_failing_and_panicking_handlers_isolated() {
        let (registry, profiles, recorder) = setup();
        let handle = registry
            .define_trigger(
                qid("chat", "mode"),
                Schema::object().property("mode", Schema::string().required()),
                Schema::any(),
                |args: HandleArgs| async move {
                    match args.config["mode"].as_str() {
                        Some("error") => Err(TriggerError::failed("bad payload")),
                        Some("panic") => panic!("handler exploded"),
                        Some("skip") => Ok(false),
                        _ => Ok(true),
                    }
                },
            )
            .unwrap();
        let trigger = handle.id().clone();
        profiles
            .load(
                vec![
                    Profile::new("a")
                        .with_trigger(instance("err", &trigger, json!({"mode": "error"})))
                        .with_trigger(instance("boom", &trigger, json!({"mode": "panic"}))),
                    Profile::new("b")
                        .with_trigger(instance("skip", &trigger, json!({"mode": "skip"})))
                        .with_trigger(instance("ok", &trigger, json!({"mode": "match"}))),
                ],
                ContextData::new(),
            )
            .unwrap();

        let report = handle.fire(ContextData::new()).await;

        assert_eq!(report.evaluated, 4);
        assert_eq!(report.failed, 2);
        assert_eq!(report.skipped, 1);
        assert_eq!(report.activated, 1);
        assert!(matches!(&report.errors[0], TriggerError::Handle { message, .. } if message == "bad payload"));
        assert!(matches!(&report.errors[1], TriggerError::Panicked { message, .. } if message == "handler exploded"));
        assert_eq!(recorder.mappings(), vec!["b.ok"]);
    }

    // ==================== Cooldown ====================

    #[tokio::test(start_paused = true)]
    async fn test_cooldown_suppresses_refire() {
        let (registry, profiles, recorder) = setup();
        let handle = registry
            .define_trigger(
                qid("chat", "cooled"),
                Schema::object().property("cooldown", Schema::duration()),
                Schema::any(),
                |args: HandleArgs| async move {
                    Ok(args.cooldown(args.config.get("cooldown").and_then(Value::as_f64)))
                },
            )
            .unwrap();
        let trigger = handle.id().clone();
        profiles
            .load(
                vec![Profile::new("p")
                    .with_trigger(instance("t", &trigger, json!({"cooldown": 5})))],
                ContextData::new(),
            )
            .unwrap();

        let mut activated = 0;
        let mut suppressed = 0;
        for wait in [0, 3, 3] {
            tokio::time::advance(Duration::from_secs(wait)).await;
            let report = handle.fire(ContextData::new()).await;
            activated += report.activated;
            suppressed += report.skipped;
        }

        assert_eq!(activated, 2);
        assert_eq!(suppressed, 1);
        assert_eq!(recorder.mappings().len(), 2);
    }
}
