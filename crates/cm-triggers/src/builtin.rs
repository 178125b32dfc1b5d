//! Triggers shipped with the runtime

use crate::command::CommandPattern;
use crate::definition::{HandleArgs, TriggerDefinition};
use crate::registry::{TriggerHandle, TriggerRegistry};
use crate::TriggerResult;
use cm_core::{QualifiedId, CORE_PLUGIN};
use cm_schema::Schema;
use serde_json::{json, Value};

fn chat_context() -> Schema {
    Schema::object()
        .property("user", Schema::string().default_value(json!("viewer")))
        .property("message", Schema::string().default_value(json!("!hello")))
}

/// `core.command`: matches chat messages against a command pattern
///
/// Each instance configures a `command` pattern and an optional `cooldown`
/// in seconds. On a match the parsed arguments are merged into the context.
pub fn command_trigger() -> TriggerResult<TriggerDefinition> {
    let id = QualifiedId::new(CORE_PLUGIN, "command")?;
    let config = Schema::object()
        .property("command", Schema::string().required())
        .property("cooldown", Schema::duration());

    let definition = TriggerDefinition::transform(
        id,
        config,
        chat_context(),
        |config: &Value| {
            match config
                .get("command")
                .and_then(Value::as_str)
                .map(CommandPattern::parse)
            {
                Some(Ok(pattern)) => pattern.extend_schema(chat_context()),
                _ => chat_context(),
            }
        },
        |args: HandleArgs| async move {
            let pattern = CommandPattern::parse(
                args.config
                    .get("command")
                    .and_then(Value::as_str)
                    .unwrap_or_default(),
            )?;
            let message = args
                .context
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or_default();
            let Some(fields) = pattern.matches(message) else {
                return Ok(None);
            };
            if !args.cooldown(args.config.get("cooldown").and_then(Value::as_f64)) {
                return Ok(None);
            }

            let mut context = args.context;
            context.extend(fields);
            Ok(Some(context))
        },
    );

    Ok(definition
        .named("Chat command")
        .described("Fires when a chat message matches the configured command"))
}

/// Define every core trigger on `registry`
pub fn register_core_triggers(registry: &TriggerRegistry) -> TriggerResult<Vec<TriggerHandle>> {
    Ok(vec![registry.define(command_trigger()?)?])
}
