//! Schema model and builder

use crate::context::ResolveContext;
use crate::error::ResolutionResult;
use cm_core::ContextData;
use futures::future::{BoxFuture, FutureExt};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

/// Default computed from the resolve context (typically a setting)
pub type DefaultFn = Arc<dyn Fn(&ResolveContext) -> Option<Value> + Send + Sync>;

/// Options computed from the partially filled config and the context
pub type EnumFn = Arc<
    dyn Fn(Value, ResolveContext) -> BoxFuture<'static, ResolutionResult<Vec<EnumItem>>>
        + Send
        + Sync,
>;

/// Schema chosen from already-resolved sibling values
pub type DynamicTypeFn = Arc<
    dyn Fn(ContextData, ResolveContext) -> BoxFuture<'static, ResolutionResult<Schema>>
        + Send
        + Sync,
>;

/// Declared value type of a property
#[derive(Debug, Clone)]
pub enum SchemaType {
    String,
    Number,
    Boolean,
    /// `true`, `false` or `"toggle"`
    Toggle,
    /// Seconds
    Duration,
    /// Ordered properties; resolution follows declaration order
    Object(IndexMap<String, Schema>),
    Array(Box<Schema>),
    /// Id of a resource of the named kind
    Resource(String),
    Any,
}

impl SchemaType {
    pub fn type_name(&self) -> &'static str {
        match self {
            SchemaType::String => "string",
            SchemaType::Number => "number",
            SchemaType::Boolean => "boolean",
            SchemaType::Toggle => "toggle",
            SchemaType::Duration => "duration",
            SchemaType::Object(_) => "object",
            SchemaType::Array(_) => "array",
            SchemaType::Resource(_) => "resource",
            SchemaType::Any => "any",
        }
    }
}

#[derive(Clone)]
pub enum DefaultValue {
    Static(Value),
    Contextual(DefaultFn),
}

#[derive(Clone)]
pub enum EnumSource {
    Static(Vec<EnumItem>),
    Contextual(EnumFn),
}

/// One selectable option
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnumItem {
    pub name: String,
    pub value: Value,
}

impl EnumItem {
    pub fn new(name: impl Into<String>, value: Value) -> Self {
        Self {
            name: name.into(),
            value,
        }
    }
}

impl From<Value> for EnumItem {
    fn from(value: Value) -> Self {
        let name = match &value {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        Self { name, value }
    }
}

/// Property descriptor
#[derive(Clone)]
pub struct Schema {
    pub ty: SchemaType,
    pub name: Option<String>,
    pub required: bool,
    pub default: Option<DefaultValue>,
    pub enumeration: Option<EnumSource>,
    /// String values containing template syntax are rendered before coercion
    pub template: bool,
    /// When set, replaces this schema at resolution time
    pub dynamic_type: Option<DynamicTypeFn>,
}

impl Schema {
    pub fn new(ty: SchemaType) -> Self {
        Self {
            ty,
            name: None,
            required: false,
            default: None,
            enumeration: None,
            template: false,
            dynamic_type: None,
        }
    }

    pub fn string() -> Self {
        Self::new(SchemaType::String)
    }

    pub fn number() -> Self {
        Self::new(SchemaType::Number)
    }

    pub fn boolean() -> Self {
        Self::new(SchemaType::Boolean)
    }

    pub fn toggle() -> Self {
        Self::new(SchemaType::Toggle)
    }

    pub fn duration() -> Self {
        Self::new(SchemaType::Duration)
    }

    pub fn any() -> Self {
        Self::new(SchemaType::Any)
    }

    pub fn object() -> Self {
        Self::new(SchemaType::Object(IndexMap::new()))
    }

    pub fn array(item: Schema) -> Self {
        Self::new(SchemaType::Array(Box::new(item)))
    }

    pub fn resource(kind: impl Into<String>) -> Self {
        Self::new(SchemaType::Resource(kind.into()))
    }

    /// A property whose schema depends on its resolved siblings
    pub fn dynamic<F, Fut>(resolver: F) -> Self
    where
        F: Fn(ContextData, ResolveContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ResolutionResult<Schema>> + Send + 'static,
    {
        let resolver: DynamicTypeFn =
            Arc::new(move |siblings: ContextData, ctx: ResolveContext| resolver(siblings, ctx).boxed());
        let mut schema = Self::any();
        schema.dynamic_type = Some(resolver);
        schema
    }

    /// Add a property. Ignored unless this is an object schema.
    pub fn property(mut self, key: impl Into<String>, schema: Schema) -> Self {
        if let SchemaType::Object(properties) = &mut self.ty {
            properties.insert(key.into(), schema);
        }
        self
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn templated(mut self) -> Self {
        self.template = true;
        self
    }

    pub fn default_value(mut self, value: Value) -> Self {
        self.default = Some(DefaultValue::Static(value));
        self
    }

    /// Default read from the context, invoked only when the value is absent
    pub fn default_fn<F>(mut self, resolver: F) -> Self
    where
        F: Fn(&ResolveContext) -> Option<Value> + Send + Sync + 'static,
    {
        let resolver: DefaultFn = Arc::new(resolver);
        self.default = Some(DefaultValue::Contextual(resolver));
        self
    }

    pub fn enum_values(self, values: Vec<Value>) -> Self {
        self.enum_items(values.into_iter().map(EnumItem::from).collect())
    }

    pub fn enum_items(mut self, items: Vec<EnumItem>) -> Self {
        self.enumeration = Some(EnumSource::Static(items));
        self
    }

    pub fn enum_fn<F, Fut>(mut self, resolver: F) -> Self
    where
        F: Fn(Value, ResolveContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ResolutionResult<Vec<EnumItem>>> + Send + 'static,
    {
        let resolver: EnumFn =
            Arc::new(move |partial: Value, ctx: ResolveContext| resolver(partial, ctx).boxed());
        self.enumeration = Some(EnumSource::Contextual(resolver));
        self
    }

    pub fn properties(&self) -> Option<&IndexMap<String, Schema>> {
        match &self.ty {
            SchemaType::Object(properties) => Some(properties),
            _ => None,
        }
    }

    pub fn get_property(&self, key: &str) -> Option<&Schema> {
        self.properties().and_then(|p| p.get(key))
    }
}

impl fmt::Debug for Schema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let default = match &self.default {
            None => "none",
            Some(DefaultValue::Static(_)) => "static",
            Some(DefaultValue::Contextual(_)) => "contextual",
        };
        let enumeration = match &self.enumeration {
            None => "none",
            Some(EnumSource::Static(_)) => "static",
            Some(EnumSource::Contextual(_)) => "contextual",
        };
        f.debug_struct("Schema")
            .field("ty", &self.ty)
            .field("name", &self.name)
            .field("required", &self.required)
            .field("default", &default)
            .field("enumeration", &enumeration)
            .field("template", &self.template)
            .field("dynamic", &self.dynamic_type.is_some())
            .finish()
    }
}
