//! `any`, `merge`, `memo`, `fail` and `panic` tasks.

use std::collections::BTreeMap;

use crate::pipeline::graph::Node;
use crate::pipeline::task::check_inputs;
use crate::pipeline::vars::{resolve_map, Source, Vars};
use crate::pipeline::{PipelineError, RunInfo, TaskResult, Value};

/// First non-errored input. Inputs arrive ordered by upstream output index,
/// which makes the pick deterministic.
pub fn run_any(inputs: &[TaskResult]) -> TaskResult {
    if inputs.is_empty() {
        return Err(PipelineError::WrongInputCardinality {
            min: 1,
            max: usize::MAX,
            got: 0,
        });
    }
    for input in inputs {
        if let Ok(value) = input {
            return Ok(value.clone());
        }
    }
    Err(PipelineError::TooManyErrors)
}

/// Shallow right-biased merge of two maps. The right side comes either from
/// the second input or from the `right` parameter.
pub fn run_merge(node: &Node, vars: &Vars, inputs: &[TaskResult]) -> TaskResult {
    let values = check_inputs(inputs, Some(1), Some(2), 0)?;

    let left = values[0].as_map()?.clone();
    let right: BTreeMap<String, Value> = match values.get(1) {
        Some(v) => v.as_map()?.clone(),
        None => {
            let raw = node.attr("right").unwrap_or_default();
            resolve_map("right", &[Source::JsonWithVars(raw, vars)])?
                .ok_or_else(|| PipelineError::ParameterEmpty("right".to_string()))?
        }
    };

    let mut merged = left;
    for (key, value) in right {
        merged.insert(key, value);
    }
    Ok(Value::Map(merged))
}

/// Constant value. Decimals and booleans are typed, everything else stays a
/// string.
pub fn run_memo(node: &Node, vars: &Vars) -> TaskResult {
    let raw = node.attr("value").unwrap_or_default();
    let resolved = crate::pipeline::vars::resolve(
        "value",
        &[Source::VarExpr(raw, vars), Source::NonemptyString(raw)],
    )?;
    Ok(coerce_scalar(resolved))
}

fn coerce_scalar(value: Value) -> Value {
    match value {
        Value::String(s) => {
            if let Ok(d) = s.parse::<rust_decimal::Decimal>() {
                Value::Decimal(d)
            } else if s == "true" {
                Value::Bool(true)
            } else if s == "false" {
                Value::Bool(false)
            } else {
                Value::String(s)
            }
        }
        other => other,
    }
}

pub fn run_fail(node: &Node) -> TaskResult {
    let msg = node.attr("msg").unwrap_or("fail task").to_string();
    Err(PipelineError::TaskFailed(msg))
}

/// Panics on purpose; the runner catches the unwind at the join layer and
/// records it as a `Panicked` result.
pub fn run_panic(node: &Node) -> (TaskResult, RunInfo) {
    let msg = node.attr("msg").unwrap_or("panic task").to_string();
    panic!("{msg}");
}
