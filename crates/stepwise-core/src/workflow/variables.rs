//! Variable resolution for step inputs.
//!
//! Each binding reads a path out of the trigger payload or a prior step's
//! successful output. A binding whose source is missing (or not a success)
//! is left out of the input instead of failing the step.

use std::collections::BTreeMap;

use serde_json::{Map, Value};
use stepwise_types::workflow::{BindingSource, VariableBinding, WorkflowContext};

use super::path;

/// Resolve every binding that has a value.
pub fn resolve_bindings(
    bindings: &BTreeMap<String, VariableBinding>,
    context: &WorkflowContext,
) -> Map<String, Value> {
    let mut resolved = Map::new();
    for (field, binding) in bindings {
        let source = match &binding.source {
            BindingSource::Trigger => Some(&context.trigger_data),
            BindingSource::Step(step_id) => context.step_output(step_id),
        };
        match source.and_then(|value| path::lookup(value, &binding.path)) {
            Some(value) => {
                resolved.insert(field.clone(), value.clone());
            }
            None => {
                tracing::trace!(field = %field, path = %binding.path, "binding unresolved");
            }
        }
    }
    resolved
}

/// Build a handler's input: carried-over `input_data` with the resolved
/// bindings layered on top.
///
/// A non-object `input_data` is passed through unchanged when the step has
/// no bindings.
pub fn build_input(
    bindings: &BTreeMap<String, VariableBinding>,
    context: &WorkflowContext,
) -> Value {
    let resolved = resolve_bindings(bindings, context);
    match &context.input_data {
        Value::Object(carried) => {
            let mut input = carried.clone();
            input.extend(resolved);
            Value::Object(input)
        }
        other if bindings.is_empty() && !other.is_null() => other.clone(),
        _ => Value::Object(resolved),
    }
}
