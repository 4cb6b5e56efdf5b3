//! Arithmetic tasks: `multiply`, `divide` and the N-ary reductions `mean`,
//! `median`, `mode`, `sum`.

use rust_decimal::Decimal;

use crate::pipeline::graph::Node;
use crate::pipeline::task::check_inputs;
use crate::pipeline::vars::{resolve_decimal, Source, Vars};
use crate::pipeline::{PipelineError, TaskResult, Value};

pub fn run_multiply(node: &Node, vars: &Vars, inputs: &[TaskResult]) -> TaskResult {
    let values = check_inputs(inputs, Some(1), Some(1), 0)?;
    let input = values[0].as_decimal()?;
    let raw = node.attr("times").unwrap_or_default();
    let times = resolve_decimal(
        "times",
        &[Source::VarExpr(raw, vars), Source::NonemptyString(raw)],
    )?;
    let product = input
        .checked_mul(times)
        .ok_or_else(|| PipelineError::BadInput(format!("multiply overflow: {input} * {times}")))?;
    Ok(Value::Decimal(product))
}

pub fn run_divide(node: &Node, vars: &Vars, inputs: &[TaskResult]) -> TaskResult {
    let values = check_inputs(inputs, Some(1), Some(1), 0)?;
    let input = values[0].as_decimal()?;
    let raw = node.attr("divisor").unwrap_or_default();
    let divisor = resolve_decimal(
        "divisor",
        &[Source::VarExpr(raw, vars), Source::NonemptyString(raw)],
    )?;
    if divisor.is_zero() {
        return Err(PipelineError::BadInput("division by zero".to_string()));
    }
    let quotient = input
        .checked_div(divisor)
        .ok_or_else(|| PipelineError::BadInput(format!("divide overflow: {input} / {divisor}")))?;
    Ok(Value::Decimal(quotient))
}

/// Collect the decimal inputs of a reduction, honoring `allowedFaults`
/// (default: all but one input may fail).
fn reduction_inputs(node: &Node, inputs: &[TaskResult]) -> Result<Vec<Decimal>, PipelineError> {
    let allowed_faults = match node.attr("allowedFaults") {
        Some(raw) => raw.parse::<usize>().map_err(|e| {
            PipelineError::BadInput(format!("bad allowedFaults {raw:?}: {e}"))
        })?,
        None => inputs.len().saturating_sub(1),
    };
    let values = check_inputs(inputs, Some(1), None, allowed_faults)?;
    if values.is_empty() {
        return Err(PipelineError::TooManyErrors);
    }
    values.iter().map(Value::as_decimal).collect()
}

pub fn run_mean(node: &Node, inputs: &[TaskResult]) -> TaskResult {
    let values = reduction_inputs(node, inputs)?;
    let sum: Decimal = values.iter().sum();
    let count = Decimal::from(values.len() as u64);
    Ok(Value::Decimal(sum / count))
}

pub fn run_median(node: &Node, inputs: &[TaskResult]) -> TaskResult {
    let mut values = reduction_inputs(node, inputs)?;
    values.sort();
    let n = values.len();
    let median = if n % 2 == 1 {
        values[n / 2]
    } else {
        (values[n / 2 - 1] + values[n / 2]) / Decimal::from(2)
    };
    Ok(Value::Decimal(median))
}

pub fn run_mode(node: &Node, inputs: &[TaskResult]) -> TaskResult {
    let mut values = reduction_inputs(node, inputs)?;
    // sorting makes the tie-break deterministic: smallest wins
    values.sort();

    let mut best = values[0];
    let mut best_count = 0usize;
    let mut i = 0;
    while i < values.len() {
        let mut j = i;
        while j < values.len() && values[j] == values[i] {
            j += 1;
        }
        if j - i > best_count {
            best = values[i];
            best_count = j - i;
        }
        i = j;
    }
    Ok(Value::Decimal(best))
}

pub fn run_sum(node: &Node, inputs: &[TaskResult]) -> TaskResult {
    let values = reduction_inputs(node, inputs)?;
    Ok(Value::Decimal(values.iter().sum()))
}
