//! Per-run variables and parameter resolution
//!
//! Task parameters may be literals, `$(dot.path)` references into the run
//! variables, or inline JSON with embedded variable expressions. Resolution
//! walks a prioritized chain of sources; the first one that yields a value
//! wins.

use std::collections::BTreeMap;

use crate::pipeline::{PipelineError, TaskResult, Value};

/// Variables visible to a run. Keys are dot-separated paths into nested maps.
#[derive(Debug, Clone, Default)]
pub struct Vars {
    vars: BTreeMap<String, Value>,
}

impl Vars {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_map(vars: BTreeMap<String, Value>) -> Self {
        Vars { vars }
    }

    pub fn set(&mut self, key: &str, value: Value) {
        self.vars.insert(key.to_string(), value);
    }

    /// Look up a dot-separated path, descending into nested maps.
    pub fn get(&self, path: &str) -> Option<&Value> {
        let mut segments = path.split('.');
        let head = segments.next()?;
        let mut current = self.vars.get(head)?;
        for segment in segments {
            match current {
                Value::Map(map) => current = map.get(segment)?,
                _ => return None,
            }
        }
        Some(current)
    }
}

/// A single source in a resolution chain.
pub enum Source<'a> {
    /// A `$(path)` expression resolved against the run vars; yields nothing
    /// when the raw text is not a variable expression.
    VarExpr(&'a str, &'a Vars),
    /// The raw text itself, if non-empty.
    NonemptyString(&'a str),
    /// A fixed fallback.
    Literal(&'a str),
    /// The value produced by the n-th upstream task.
    Input(&'a [TaskResult], usize),
    /// Inline JSON with embedded `$(path)` expressions substituted before
    /// decoding; yields nothing when the raw text is empty.
    JsonWithVars(&'a str, &'a Vars),
}

/// Extract `path` from a `$(path)` expression.
fn var_expr(raw: &str) -> Option<&str> {
    let raw = raw.trim();
    let inner = raw.strip_prefix("$(")?.strip_suffix(')')?;
    if inner.is_empty() {
        return None;
    }
    Some(inner)
}

fn resolve_source(source: &Source<'_>) -> Result<Option<Value>, PipelineError> {
    match source {
        Source::VarExpr(raw, vars) => Ok(var_expr(raw).and_then(|path| vars.get(path)).cloned()),
        Source::NonemptyString(raw) => {
            let trimmed = raw.trim();
            if trimmed.is_empty() {
                Ok(None)
            } else {
                Ok(Some(Value::String(trimmed.to_string())))
            }
        }
        Source::Literal(raw) => Ok(Some(Value::String(raw.to_string()))),
        Source::Input(inputs, n) => match inputs.get(*n) {
            Some(Ok(value)) => Ok(Some(value.clone())),
            Some(Err(err)) => Err(err.clone()),
            None => Ok(None),
        },
        Source::JsonWithVars(raw, vars) => {
            if raw.trim().is_empty() {
                return Ok(None);
            }
            let substituted = substitute_vars(raw, vars)?;
            let json: serde_json::Value = serde_json::from_str(&substituted)
                .map_err(|e| PipelineError::BadInput(format!("invalid JSON parameter: {e}")))?;
            Ok(Some(Value::from_json(&json)))
        }
    }
}

/// Replace every `$(path)` occurrence in `raw` with the JSON encoding of the
/// referenced variable.
fn substitute_vars(raw: &str, vars: &Vars) -> Result<String, PipelineError> {
    let mut out = String::with_capacity(raw.len());
    let mut rest = raw;
    while let Some(start) = rest.find("$(") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let end = after
            .find(')')
            .ok_or_else(|| PipelineError::BadInput("unterminated variable expression".into()))?;
        let path = &after[..end];
        let value = vars
            .get(path)
            .ok_or_else(|| PipelineError::ParameterEmpty(path.to_string()))?;
        out.push_str(&value.to_json().to_string());
        rest = &after[end + 1..];
    }
    out.push_str(rest);
    Ok(out)
}

/// Walk the chain and return the first value any source yields.
pub fn resolve(name: &str, chain: &[Source<'_>]) -> Result<Value, PipelineError> {
    for source in chain {
        if let Some(value) = resolve_source(source)? {
            return Ok(value);
        }
    }
    Err(PipelineError::ParameterEmpty(name.to_string()))
}

pub fn resolve_string(name: &str, chain: &[Source<'_>]) -> Result<String, PipelineError> {
    match resolve(name, chain)? {
        Value::String(s) => Ok(s),
        Value::Decimal(d) => Ok(d.to_string()),
        other => Err(PipelineError::BadInput(format!(
            "parameter {name} expected string, got {other:?}"
        ))),
    }
}

pub fn resolve_decimal(
    name: &str,
    chain: &[Source<'_>],
) -> Result<rust_decimal::Decimal, PipelineError> {
    resolve(name, chain)?
        .as_decimal()
        .map_err(|_| PipelineError::BadInput(format!("parameter {name} is not a decimal")))
}

/// Resolve an optional map-valued parameter; an empty raw value yields `None`.
pub fn resolve_map(
    name: &str,
    chain: &[Source<'_>],
) -> Result<Option<BTreeMap<String, Value>>, PipelineError> {
    for source in chain {
        if let Some(value) = resolve_source(source)? {
            return match value {
                Value::Map(map) => Ok(Some(map)),
                other => Err(PipelineError::BadInput(format!(
                    "parameter {name} expected map, got {other:?}"
                ))),
            };
        }
    }
    Ok(None)
}
