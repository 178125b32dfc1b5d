//! Actions shipped with the runtime under the `core` plugin

use crate::{ActionDefinition, ActionRegistry, ActionResult, FlowArgs, InvokeArgs};
use cm_core::{abortable_sleep, duration_from_secs, QualifiedId, CORE_PLUGIN};
use cm_schema::Schema;
use indexmap::IndexMap;
use rand::Rng;
use serde_json::{json, Value};
use tracing::debug;

/// `core.delay`: wait `duration` seconds, ending early on abort
///
/// Returns `{"completed": false}` when aborted.
pub fn delay_action() -> ActionResult<ActionDefinition> {
    let id = QualifiedId::new(CORE_PLUGIN, "delay")?;
    let config = Schema::object().property(
        "duration",
        Schema::duration()
            .named("Duration")
            .templated()
            .required()
            .default_value(json!(1)),
    );
    let result = Schema::object().property("completed", Schema::boolean().default_value(json!(true)));

    Ok(ActionDefinition::action(id, config, |args: InvokeArgs| async move {
        let secs = args.config["duration"].as_f64().unwrap_or(0.0);

        let completed = abortable_sleep(duration_from_secs(secs), &args.abort).await;
        if !completed {
            debug!(run_id = %args.run.id, "Delay aborted");
        }
        Ok(json!({ "completed": completed }))
    })
    .named("Delay")
    .described("Wait before running the next action")
    .with_result(result))
}

/// `core.random`: pick one flow, weighted by each flow's `weight`
pub fn random_action() -> ActionResult<ActionDefinition> {
    let id = QualifiedId::new(CORE_PLUGIN, "random")?;
    let flow_config = Schema::object().property(
        "weight",
        Schema::number().named("Weight").default_value(json!(1)),
    );

    Ok(ActionDefinition::flow(
        id,
        Schema::object(),
        flow_config,
        |args: FlowArgs| async move { Ok(pick_weighted(&args.flows, &mut rand::thread_rng())) },
    )
    .named("Random")
    .described("Run one of several flows at random"))
}

/// Register the `core` actions
pub fn register_core_actions(registry: &ActionRegistry) -> ActionResult<()> {
    registry.define(delay_action()?)?;
    registry.define(random_action()?)?;
    Ok(())
}

fn weight_of(flow: &Value) -> f64 {
    flow.get("weight")
        .and_then(Value::as_f64)
        .filter(|w| w.is_finite() && *w > 0.0)
        .unwrap_or(0.0)
}

/// Choose a flow key with probability proportional to its weight
///
/// Flows with a missing, zero or negative weight are never chosen. Returns
/// `None` when no flow has a positive weight.
pub fn pick_weighted<R: Rng + ?Sized>(flows: &IndexMap<String, Value>, rng: &mut R) -> Option<String> {
    let weighted: Vec<(&String, f64)> = flows
        .iter()
        .map(|(key, flow)| (key, weight_of(flow)))
        .filter(|(_, weight)| *weight > 0.0)
        .collect();

    let total: f64 = weighted.iter().map(|(_, weight)| weight).sum();
    if total <= 0.0 {
        return None;
    }

    let mut target = rng.gen::<f64>() * total;
    for (key, weight) in &weighted {
        target -= weight;
        if target <= 0.0 {
            return Some((*key).clone());
        }
    }
    // Float rounding can leave a sliver past the last bucket
    weighted.last().map(|(key, _)| (*key).clone())
}
