//! Context-aware schema resolution
//!
//! Resolution walks the schema in declaration order. Each property is
//! resolved on its own: a failure is recorded against the property's path
//! and the property is left absent, while its siblings keep resolving. The
//! caller then decides through [`Resolution`] whether the failures matter.

use crate::context::ResolveContext;
use crate::error::{ConfigResolutionError, ResolutionResult};
use crate::schema::{DefaultValue, EnumItem, EnumSource, Schema, SchemaType};
use crate::value::coerce;
use cm_core::ContextData;
use cm_template::TemplateEngine;
use futures::future::{BoxFuture, FutureExt};
use indexmap::IndexMap;
use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::{debug, warn};

/// A property that failed to resolve
#[derive(Debug, Clone)]
pub struct PropertyFailure {
    /// Dotted path from the schema root ("" for the root itself)
    pub path: String,
    pub required: bool,
    pub error: ConfigResolutionError,
}

/// Outcome of resolving a value against a schema
#[derive(Debug, Clone)]
pub struct Resolution {
    /// Resolved value, `None` if the root itself is absent
    pub value: Option<Value>,
    pub failures: Vec<PropertyFailure>,
}

impl Resolution {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }

    /// Fail on any property failure
    pub fn into_strict(self) -> ResolutionResult<Value> {
        if let Some(failure) = self.failures.into_iter().next() {
            return Err(attribute(failure));
        }
        Ok(self.value.unwrap_or(Value::Null))
    }

    /// Fail only if a required property failed; optional failures are logged
    /// and the property stays absent
    pub fn into_required(self) -> ResolutionResult<Value> {
        for failure in self.failures {
            if failure.required {
                return Err(attribute(failure));
            }
            warn!(
                path = %failure.path,
                error = %failure.error,
                "Optional property failed to resolve"
            );
        }
        Ok(self.value.unwrap_or(Value::Null))
    }
}

fn attribute(failure: PropertyFailure) -> ConfigResolutionError {
    if failure.path.is_empty() {
        failure.error
    } else {
        failure.error.at(&failure.path)
    }
}

fn join_path(parent: &str, key: &str) -> String {
    if parent.is_empty() {
        key.to_string()
    } else {
        format!("{}.{}", parent, key)
    }
}

fn default_for(schema: &Schema, ctx: &ResolveContext) -> Option<Value> {
    match &schema.default {
        Some(DefaultValue::Static(value)) => Some(value.clone()),
        Some(DefaultValue::Contextual(resolver)) => resolver(ctx),
        None => None,
    }
}

/// Fill omitted fields from static and contextual defaults
///
/// Synchronous and template-free. Unknown keys are kept, so extra context
/// fields supplied by an event source survive.
pub fn apply_defaults(schema: &Schema, value: Value, ctx: &ResolveContext) -> Value {
    match (&schema.ty, value) {
        (SchemaType::Object(properties), Value::Object(mut map)) => {
            for (key, property) in properties {
                let filled = match map.remove(key) {
                    Some(existing) if !existing.is_null() => {
                        Some(apply_defaults(property, existing, ctx))
                    }
                    _ => default_for(property, ctx)
                        .map(|default| apply_defaults(property, default, ctx)),
                };
                if let Some(filled) = filled {
                    map.insert(key.clone(), filled);
                }
            }
            Value::Object(map)
        }
        (SchemaType::Object(_), Value::Null) => {
            apply_defaults(schema, Value::Object(Map::new()), ctx)
        }
        (_, value) => value,
    }
}

/// Resolves config values against schemas
pub struct ConfigResolver {
    templates: Arc<TemplateEngine>,
}

impl ConfigResolver {
    pub fn new(templates: Arc<TemplateEngine>) -> Self {
        Self { templates }
    }

    pub fn templates(&self) -> &Arc<TemplateEngine> {
        &self.templates
    }

    /// Resolve `value` against `schema`
    ///
    /// A null value for an object schema resolves as `{}` so nested defaults
    /// apply.
    pub async fn resolve(&self, schema: &Schema, value: Value, ctx: &ResolveContext) -> Resolution {
        let mut failures = Vec::new();

        let raw = match (&schema.ty, value) {
            (SchemaType::Object(_), Value::Null) => Some(Value::Object(Map::new())),
            (_, Value::Null) => None,
            (_, value) => Some(value),
        };

        let value = match &schema.dynamic_type {
            Some(resolver) => match resolver(ContextData::new(), ctx.clone()).await {
                Ok(dynamic) => {
                    self.resolve_node(&dynamic, raw, ctx, String::new(), &mut failures)
                        .await
                }
                Err(error) => {
                    failures.push(PropertyFailure {
                        path: String::new(),
                        required: schema.required,
                        error,
                    });
                    None
                }
            },
            None => {
                self.resolve_node(schema, raw, ctx, String::new(), &mut failures)
                    .await
            }
        };

        Resolution { value, failures }
    }

    fn resolve_node<'a>(
        &'a self,
        schema: &'a Schema,
        raw: Option<Value>,
        ctx: &'a ResolveContext,
        path: String,
        failures: &'a mut Vec<PropertyFailure>,
    ) -> BoxFuture<'a, Option<Value>> {
        async move {
            let raw = raw
                .filter(|value| !value.is_null())
                .or_else(|| default_for(schema, ctx));

            let Some(raw) = raw else {
                if schema.required {
                    failures.push(PropertyFailure {
                        path,
                        required: true,
                        error: ConfigResolutionError::MissingRequired,
                    });
                }
                return None;
            };

            match &schema.ty {
                SchemaType::Object(properties) => match raw {
                    Value::Object(map) => Some(Value::Object(
                        self.resolve_object(properties, map, ctx, &path, failures)
                            .await,
                    )),
                    other => {
                        failures.push(PropertyFailure {
                            error: ConfigResolutionError::TypeMismatch {
                                expected: "object",
                                found: other.to_string(),
                            },
                            path,
                            required: schema.required,
                        });
                        None
                    }
                },
                SchemaType::Array(item) => match raw {
                    Value::Array(items) => {
                        let mut resolved = Vec::with_capacity(items.len());
                        for (index, element) in items.into_iter().enumerate() {
                            let element_path = format!("{}[{}]", path, index);
                            if let Some(value) = self
                                .resolve_node(item, Some(element), ctx, element_path, failures)
                                .await
                            {
                                resolved.push(value);
                            }
                        }
                        Some(Value::Array(resolved))
                    }
                    other => {
                        failures.push(PropertyFailure {
                            error: ConfigResolutionError::TypeMismatch {
                                expected: "array",
                                found: other.to_string(),
                            },
                            path,
                            required: schema.required,
                        });
                        None
                    }
                },
                SchemaType::Resource(kind) => match self.resolve_resource(schema, kind, raw, ctx) {
                    Ok(value) => value,
                    Err(error) => {
                        failures.push(PropertyFailure {
                            path,
                            required: schema.required,
                            error,
                        });
                        None
                    }
                },
                _ => match self.resolve_scalar(schema, raw, ctx) {
                    Ok(value) => Some(value),
                    Err(error) => {
                        failures.push(PropertyFailure {
                            path,
                            required: schema.required,
                            error,
                        });
                        None
                    }
                },
            }
        }
        .boxed()
    }

    async fn resolve_object(
        &self,
        properties: &IndexMap<String, Schema>,
        mut input: Map<String, Value>,
        ctx: &ResolveContext,
        path: &str,
        failures: &mut Vec<PropertyFailure>,
    ) -> Map<String, Value> {
        let mut resolved = Map::new();

        for (key, declared) in properties {
            let property_path = join_path(path, key);
            let dynamic;

            let schema = match &declared.dynamic_type {
                Some(resolver) => match resolver(resolved.clone(), ctx.clone()).await {
                    Ok(mut schema) => {
                        schema.required |= declared.required;
                        schema.template |= declared.template;
                        if schema.default.is_none() {
                            schema.default = declared.default.clone();
                        }
                        dynamic = schema;
                        &dynamic
                    }
                    Err(error) => {
                        failures.push(PropertyFailure {
                            path: property_path,
                            required: declared.required,
                            error,
                        });
                        continue;
                    }
                },
                None => declared,
            };

            if let Some(value) = self
                .resolve_node(schema, input.remove(key), ctx, property_path, failures)
                .await
            {
                resolved.insert(key.clone(), value);
            }
        }

        resolved
    }

    fn render_if_templated(
        &self,
        schema: &Schema,
        raw: Value,
        ctx: &ResolveContext,
    ) -> ResolutionResult<Value> {
        match raw {
            Value::String(text) if schema.template && TemplateEngine::is_template(&text) => {
                let rendered = self.templates.render(&text, ctx.data.as_ref())?;
                Ok(Value::String(rendered))
            }
            other => Ok(other),
        }
    }

    fn resolve_scalar(
        &self,
        schema: &Schema,
        raw: Value,
        ctx: &ResolveContext,
    ) -> ResolutionResult<Value> {
        let value = self.render_if_templated(schema, raw, ctx)?;
        let value = coerce(&schema.ty, value)?;

        if let Some(EnumSource::Static(items)) = &schema.enumeration {
            if !items.iter().any(|item| item.value == value) {
                return Err(ConfigResolutionError::NotInEnum(value.to_string()));
            }
        }

        Ok(value)
    }

    /// Resource ids resolve only while the resource exists
    fn resolve_resource(
        &self,
        schema: &Schema,
        kind: &str,
        raw: Value,
        ctx: &ResolveContext,
    ) -> ResolutionResult<Option<Value>> {
        let id = match self.render_if_templated(schema, raw, ctx)? {
            Value::String(id) => id,
            other => {
                return Err(ConfigResolutionError::TypeMismatch {
                    expected: "resource",
                    found: other.to_string(),
                })
            }
        };

        match &ctx.resources {
            Some(lookup) if !lookup.contains_resource(kind, &id) => {
                debug!(kind = %kind, id = %id, "Resource no longer exists, resolving as absent");
                Ok(None)
            }
            _ => Ok(Some(Value::String(id))),
        }
    }

    /// Options for a property, for UI and explicit validation
    pub async fn enumerate(
        &self,
        schema: &Schema,
        partial: Value,
        ctx: &ResolveContext,
    ) -> ResolutionResult<Vec<EnumItem>> {
        match &schema.enumeration {
            None => Ok(Vec::new()),
            Some(EnumSource::Static(items)) => Ok(items.clone()),
            Some(EnumSource::Contextual(resolver)) => resolver(partial, ctx.clone()).await,
        }
    }

    /// Options for a nested property addressed by a dotted path
    ///
    /// `partial` is the config being edited; dynamic types along the path are
    /// resolved from it.
    pub async fn enumerate_path(
        &self,
        schema: &Schema,
        path: &str,
        partial: Value,
        ctx: &ResolveContext,
    ) -> ResolutionResult<Vec<EnumItem>> {
        let mut current = schema.clone();
        let mut level = partial.as_object().cloned().unwrap_or_default();
        let mut parent = partial;

        for segment in path.split('.') {
            let declared = current
                .get_property(segment)
                .cloned()
                .ok_or_else(|| ConfigResolutionError::resolver(format!("unknown property '{}'", segment)))?;

            current = match declared.dynamic_type.clone() {
                Some(resolver) => resolver(level.clone(), ctx.clone()).await?,
                None => declared,
            };

            parent = Value::Object(level.clone());
            level = level
                .get(segment)
                .and_then(Value::as_object)
                .cloned()
                .unwrap_or_default();
        }

        self.enumerate(&current, parent, ctx).await
    }

    /// Check a value against static or contextual options
    pub async fn check_enum(
        &self,
        schema: &Schema,
        value: &Value,
        partial: Value,
        ctx: &ResolveContext,
    ) -> ResolutionResult<bool> {
        if schema.enumeration.is_none() {
            return Ok(true);
        }
        let items = self.enumerate(schema, partial, ctx).await?;
        Ok(items.iter().any(|item| &item.value == value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ResourceLookup;
    use serde_json::json;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn resolver() -> ConfigResolver {
        ConfigResolver::new(Arc::new(TemplateEngine::new()))
    }

    fn ctx_with(data: Value) -> ResolveContext {
        let data = data.as_object().cloned().unwrap_or_default();
        ResolveContext::empty().with_data(data)
    }

    struct Scenes(HashSet<String>);

    impl ResourceLookup for Scenes {
        fn contains_resource(&self, kind: &str, id: &str) -> bool {
            kind == "Scene" && self.0.contains(id)
        }
    }

    // ==================== Defaults ====================

    #[tokio::test]
    async fn test_static_default_returned_unchanged() {
        let resolver = resolver();
        let ctx = ResolveContext::empty();

        for default in [json!(1), json!("hello"), json!(true), json!({"nested": [1, 2]})] {
            let schema = Schema::object().property("value", Schema::any().default_value(default.clone()));
            let resolved = resolver.resolve(&schema, json!({}), &ctx).await.into_strict().unwrap();
            assert_eq!(resolved["value"], default);
        }
    }

    #[tokio::test]
    async fn test_optional_without_default_stays_absent() {
        let resolver = resolver();
        let schema = Schema::object()
            .property("message", Schema::string())
            .property("count", Schema::number().default_value(json!(3)));

        let resolved = resolver
            .resolve(&schema, json!({"message": null}), &ResolveContext::empty())
            .await
            .into_strict()
            .unwrap();

        assert_eq!(resolved, json!({"count": 3}));
    }

    #[tokio::test]
    async fn test_contextual_default_is_lazy() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let schema = Schema::object().property(
            "source",
            Schema::string().default_fn(move |ctx| {
                counter.fetch_add(1, Ordering::SeqCst);
                ctx.setting("obs.default_source")
            }),
        );

        let resolver = resolver();
        let ctx = ResolveContext::empty();
        ctx.settings.set("obs.default_source", json!("Webcam"));

        let supplied = resolver
            .resolve(&schema, json!({"source": "Mic"}), &ctx)
            .await
            .into_strict()
            .unwrap();
        assert_eq!(supplied["source"], "Mic");
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        let defaulted = resolver.resolve(&schema, json!({}), &ctx).await.into_strict().unwrap();
        assert_eq!(defaulted["source"], "Webcam");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_missing_required() {
        let schema = Schema::object().property("plug", Schema::string().required());
        let resolution = resolver().resolve(&schema, json!({}), &ResolveContext::empty()).await;

        assert_eq!(resolution.failures.len(), 1);
        assert_eq!(resolution.failures[0].path, "plug");
        assert!(matches!(
            resolution.into_required(),
            Err(ConfigResolutionError::Property { .. })
        ));
    }

    // ==================== Templates ====================

    #[tokio::test]
    async fn test_template_rendered_and_coerced() {
        let schema = Schema::object()
            .property("message", Schema::string().templated())
            .property("amount", Schema::number().templated())
            .property("literal", Schema::string());

        let ctx = ctx_with(json!({"user": "sam", "bits": 250}));
        let resolved = resolver()
            .resolve(
                &schema,
                json!({
                    "message": "Thanks {{ user }}",
                    "amount": "{{ bits // 50 }}",
                    "literal": "{{ user }}"
                }),
                &ctx,
            )
            .await
            .into_strict()
            .unwrap();

        assert_eq!(resolved["message"], "Thanks sam");
        assert_eq!(resolved["amount"], json!(5));
        // Not templated: left as written
        assert_eq!(resolved["literal"], "{{ user }}");
    }

    #[tokio::test]
    async fn test_failure_isolated_to_property() {
        let schema = Schema::object()
            .property("title", Schema::string().templated())
            .property("volume", Schema::number().default_value(json!(0.5)));

        let resolution = resolver()
            .resolve(&schema, json!({"title": "{{ undefined_var }}"}), &ResolveContext::empty())
            .await;

        assert_eq!(resolution.failures.len(), 1);
        assert_eq!(resolution.failures[0].path, "title");
        assert!(!resolution.failures[0].required);

        // Optional failure tolerated, sibling resolved
        let value = resolution.clone().into_required().unwrap();
        assert_eq!(value, json!({"volume": 0.5}));
        assert!(resolution.into_strict().is_err());
    }

    // ==================== Enums ====================

    #[tokio::test]
    async fn test_static_enum_validated() {
        let schema = Schema::object().property(
            "mode",
            Schema::string().enum_values(vec![json!("add"), json!("set")]),
        );
        let resolver = resolver();
        let ctx = ResolveContext::empty();

        assert!(resolver.resolve(&schema, json!({"mode": "add"}), &ctx).await.is_clean());

        let resolution = resolver.resolve(&schema, json!({"mode": "multiply"}), &ctx).await;
        assert!(matches!(
            resolution.failures[0].error,
            ConfigResolutionError::NotInEnum(_)
        ));
    }

    #[tokio::test]
    async fn test_contextual_enum_uses_partial_config() {
        let schema = Schema::object()
            .property("group", Schema::string())
            .property(
                "scene",
                Schema::string().enum_fn(|partial, _ctx| async move {
                    let group = partial["group"].as_str().unwrap_or_default().to_string();
                    Ok(vec![
                        EnumItem::new(format!("{} Bright", group), json!("bright")),
                        EnumItem::new(format!("{} Dim", group), json!("dim")),
                    ])
                }),
            );

        let resolver = resolver();
        let ctx = ResolveContext::empty();
        let items = resolver
            .enumerate_path(&schema, "scene", json!({"group": "Office"}), &ctx)
            .await
            .unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].name, "Office Bright");

        // Contextual options are not enforced during resolve
        assert!(resolver
            .resolve(&schema, json!({"scene": "party"}), &ctx)
            .await
            .is_clean());

        let scene = schema.get_property("scene").unwrap();
        assert!(resolver
            .check_enum(scene, &json!("dim"), json!({"group": "Office"}), &ctx)
            .await
            .unwrap());
        assert!(!resolver
            .check_enum(scene, &json!("party"), json!({}), &ctx)
            .await
            .unwrap());
    }

    // ==================== Dynamic Types ====================

    fn variable_schema() -> Schema {
        Schema::object()
            .property("variable", Schema::string().required())
            .property(
                "value",
                Schema::dynamic(|siblings, ctx| async move {
                    let name = siblings
                        .get("variable")
                        .and_then(Value::as_str)
                        .ok_or_else(|| ConfigResolutionError::resolver("no variable selected"))?;
                    match ctx.setting(&format!("variables.{}.type", name)) {
                        Some(ty) if ty == "number" => Ok(Schema::number().templated()),
                        Some(_) => Ok(Schema::string().templated()),
                        None => Err(ConfigResolutionError::resolver(format!(
                            "unknown variable {}",
                            name
                        ))),
                    }
                })
                .required(),
            )
    }

    #[tokio::test]
    async fn test_dynamic_type_sees_resolved_siblings() {
        let resolver = resolver();
        let ctx = ctx_with(json!({"bits": 100}));
        ctx.settings.set("variables.score.type", json!("number"));
        ctx.settings.set("variables.title.type", json!("string"));

        let score = resolver
            .resolve(&variable_schema(), json!({"variable": "score", "value": "{{ bits }}"}), &ctx)
            .await
            .into_strict()
            .unwrap();
        assert_eq!(score["value"], json!(100));

        let title = resolver
            .resolve(&variable_schema(), json!({"variable": "title", "value": 7}), &ctx)
            .await
            .into_strict()
            .unwrap();
        assert_eq!(title["value"], json!("7"));
    }

    #[tokio::test]
    async fn test_dynamic_type_failure_isolated() {
        let resolver = resolver();
        let resolution = resolver
            .resolve(&variable_schema(), json!({"variable": "ghost", "value": 1}), &ResolveContext::empty())
            .await;

        assert_eq!(resolution.failures.len(), 1);
        assert_eq!(resolution.failures[0].path, "value");
        assert_eq!(resolution.value.as_ref().unwrap()["variable"], "ghost");
        assert!(resolution.into_required().is_err());
    }

    // ==================== Resources & Nesting ====================

    #[tokio::test]
    async fn test_stale_resource_resolves_absent() {
        let schema = Schema::object().property("scene", Schema::resource("Scene").required());
        let lookup = Arc::new(Scenes(HashSet::from(["live".to_string()])));
        let ctx = ResolveContext::empty().with_resources(lookup);
        let resolver = resolver();

        let live = resolver.resolve(&schema, json!({"scene": "live"}), &ctx).await;
        assert_eq!(live.into_strict().unwrap(), json!({"scene": "live"}));

        let stale = resolver.resolve(&schema, json!({"scene": "deleted"}), &ctx).await;
        assert!(stale.is_clean());
        assert_eq!(stale.value.unwrap(), json!({}));
    }

    #[tokio::test]
    async fn test_nested_objects_and_arrays() {
        let schema = Schema::object()
            .property(
                "transform",
                Schema::object()
                    .property("x", Schema::number().default_value(json!(0)))
                    .property("y", Schema::number().default_value(json!(0)))
                    .required(),
            )
            .property("tags", Schema::array(Schema::string()));

        let resolution = resolver()
            .resolve(
                &schema,
                json!({"transform": {"x": "12"}, "tags": ["a", {"bad": true}, 3]}),
                &ResolveContext::empty(),
            )
            .await;

        assert_eq!(resolution.failures.len(), 1);
        assert_eq!(resolution.failures[0].path, "tags[1]");
        assert_eq!(
            resolution.value.unwrap(),
            json!({"transform": {"x": 12, "y": 0}, "tags": ["a", "3"]})
        );
    }

    #[test]
    fn test_apply_defaults() {
        let schema = Schema::object()
            .property("user", Schema::string())
            .property("message", Schema::string().default_value(json!("")))
            .property(
                "meta",
                Schema::object().property("source", Schema::string().default_value(json!("chat"))),
            );

        let filled = apply_defaults(
            &schema,
            json!({"user": "sam", "meta": {}, "extra": 1}),
            &ResolveContext::empty(),
        );
        assert_eq!(
            filled,
            json!({"user": "sam", "message": "", "meta": {"source": "chat"}, "extra": 1})
        );
    }
}
