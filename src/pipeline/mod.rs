//! Observation-source pipeline
//!
//! Executes a DAG of tasks (HTTP fetch, JSON parsing, arithmetic, ABI
//! codecs) declared in a DOT-like text graph and produces a single numeric
//! observation per run.

pub mod graph;
pub mod runner;
pub mod task;
pub mod tasks;
pub mod vars;

pub use graph::{Graph, GraphError, Node};
pub use runner::Runner;
pub use task::TaskKind;
pub use vars::Vars;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

/// Errors produced while running pipeline tasks.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum PipelineError {
    #[error("wrong number of task inputs (min: {min}, max: {max}, got {got})")]
    WrongInputCardinality { min: usize, max: usize, got: usize },

    #[error("bad input for task: {0}")]
    BadInput(String),

    #[error("input task errored: {0}")]
    InputTaskErrored(String),

    #[error("parameter is empty: {0}")]
    ParameterEmpty(String),

    #[error("too many errors")]
    TooManyErrors,

    #[error("task run timed out")]
    Timeout,

    #[error("task run cancelled")]
    Cancelled,

    #[error("task panicked when executing run: {0}")]
    Panicked(String),

    #[error("got error from {url}: (status code {status}) {body}")]
    HttpStatus { url: String, status: u16, body: String },

    #[error("http request failed: {0}")]
    Http(String),

    #[error("{0}")]
    TaskFailed(String),
}

/// Additional information about a finished task run. A failed task is either
/// final (a repeat attempt cannot help), retryable (a repeat attempt might
/// succeed), or pending async resumption.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RunInfo {
    #[default]
    Final,
    Retryable,
    Pending,
}

/// The outcome of one task execution.
pub type TaskResult = Result<Value, PipelineError>;

/// A runtime value flowing along pipeline edges.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Decimal(Decimal),
    /// Numbers outside decimal range or precision stay floats; consumers that
    /// need exactness reject or lossily convert them.
    Float(f64),
    String(String),
    Bytes(Vec<u8>),
    Array(Vec<Value>),
    Map(BTreeMap<String, Value>),
}

impl Value {
    /// Decode a JSON document into a pipeline value. Numbers go through their
    /// exact textual representation first so decimal precision is not lost;
    /// only values no decimal can hold fall back to f64.
    pub fn from_json(v: &serde_json::Value) -> Value {
        match v {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(*b),
            serde_json::Value::Number(n) => {
                let text = n.to_string();
                if let Ok(d) = text.parse::<Decimal>() {
                    Value::Decimal(d)
                } else if let Ok(d) = Decimal::from_scientific(&text) {
                    Value::Decimal(d)
                } else {
                    Value::Float(n.as_f64().unwrap_or(f64::NAN))
                }
            }
            serde_json::Value::String(s) => Value::String(s.clone()),
            serde_json::Value::Array(items) => {
                Value::Array(items.iter().map(Value::from_json).collect())
            }
            serde_json::Value::Object(map) => Value::Map(
                map.iter()
                    .map(|(k, v)| (k.clone(), Value::from_json(v)))
                    .collect(),
            ),
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::Null => serde_json::Value::Null,
            Value::Bool(b) => serde_json::Value::Bool(*b),
            Value::Decimal(d) => serde_json::Value::String(d.to_string()),
            Value::Float(f) => serde_json::Number::from_f64(*f)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            Value::String(s) => serde_json::Value::String(s.clone()),
            Value::Bytes(b) => serde_json::Value::String(format!("0x{}", hex::encode(b))),
            Value::Array(items) => {
                serde_json::Value::Array(items.iter().map(Value::to_json).collect())
            }
            Value::Map(map) => serde_json::Value::Object(
                map.iter().map(|(k, v)| (k.clone(), v.to_json())).collect(),
            ),
        }
    }

    /// Coerce to a decimal: decimals pass through, strings are parsed, floats
    /// convert lossily when they fit.
    pub fn as_decimal(&self) -> Result<Decimal, PipelineError> {
        match self {
            Value::Decimal(d) => Ok(*d),
            Value::String(s) => s
                .trim()
                .parse::<Decimal>()
                .map_err(|e| PipelineError::BadInput(format!("not a decimal {s:?}: {e}"))),
            Value::Float(f) => Decimal::try_from(*f)
                .map_err(|e| PipelineError::BadInput(format!("float {f} has no decimal form: {e}"))),
            other => Err(PipelineError::BadInput(format!(
                "expected decimal, got {other:?}"
            ))),
        }
    }

    pub fn as_str(&self) -> Result<&str, PipelineError> {
        match self {
            Value::String(s) => Ok(s),
            other => Err(PipelineError::BadInput(format!(
                "expected string, got {other:?}"
            ))),
        }
    }

    pub fn as_map(&self) -> Result<&BTreeMap<String, Value>, PipelineError> {
        match self {
            Value::Map(m) => Ok(m),
            other => Err(PipelineError::BadInput(format!(
                "expected map, got {other:?}"
            ))),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::String(s) => write!(f, "{s}"),
            Value::Decimal(d) => write!(f, "{d}"),
            Value::Float(x) => write!(f, "{x}"),
            other => write!(f, "{}", other.to_json()),
        }
    }
}

#[cfg(test)]
mod value_tests {
    use super::*;

    #[test]
    fn json_numbers_prefer_exact_decimals() {
        let v: serde_json::Value = serde_json::from_str(r#"{"price": 4.948}"#).unwrap();
        let price = match Value::from_json(&v) {
            Value::Map(map) => map["price"].clone(),
            other => panic!("expected map, got {other:?}"),
        };
        assert_eq!(price, Value::Decimal("4.948".parse().unwrap()));
    }

    #[test]
    fn scientific_notation_lands_in_decimal_range() {
        let v: serde_json::Value = serde_json::from_str("2.5e3").unwrap();
        assert_eq!(
            Value::from_json(&v),
            Value::Decimal("2500".parse().unwrap())
        );
    }

    #[test]
    fn out_of_range_numbers_fall_back_to_float() {
        // beyond any decimal mantissa, so the float path is the only one left
        let v: serde_json::Value = serde_json::from_str("1e300").unwrap();
        let value = Value::from_json(&v);
        assert_eq!(value, Value::Float(1e300));
        assert!(value.as_decimal().is_err());
    }

    #[test]
    fn floats_in_range_convert_to_decimal() {
        assert_eq!(
            Value::Float(4.948).as_decimal().unwrap(),
            "4.948".parse().unwrap()
        );
    }
}

/// Binds a DAG source to a job name for one or more runs.
#[derive(Debug, Clone)]
pub struct Spec {
    pub id: u64,
    pub job_name: String,
    pub source: String,
}

/// Terminal state of a pipeline run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Running,
    Completed,
    Errored,
}

/// Result of one task inside a run.
#[derive(Debug, Clone)]
pub struct TaskRun {
    pub node: usize,
    pub dot_id: String,
    pub kind: TaskKind,
    pub output_index: i32,
    pub is_terminal: bool,
    pub result: TaskResult,
    pub created_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

/// One pipeline execution: per-task results plus the terminal state.
#[derive(Debug, Clone)]
pub struct Run {
    pub spec_id: u64,
    pub job_name: String,
    pub state: RunStatus,
    pub task_runs: Vec<TaskRun>,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Run {
    pub fn has_fatal_errors(&self) -> bool {
        self.final_result().has_fatal_errors()
    }

    /// Collect terminal-task results, sorted by output index.
    pub fn final_result(&self) -> FinalResult {
        let mut terminal: Vec<&TaskRun> =
            self.task_runs.iter().filter(|tr| tr.is_terminal).collect();
        terminal.sort_by_key(|tr| tr.output_index);

        FinalResult {
            terminal: terminal
                .iter()
                .map(|tr| (tr.dot_id.clone(), tr.result.clone()))
                .collect(),
            non_fatal: self
                .task_runs
                .iter()
                .filter(|tr| !tr.is_terminal)
                .filter_map(|tr| tr.result.as_ref().err().cloned())
                .collect(),
        }
    }
}

/// Result of a run: one entry per terminal task, ordered by output index,
/// plus the non-fatal errors from interior tasks.
#[derive(Debug, Clone)]
pub struct FinalResult {
    pub terminal: Vec<(String, TaskResult)>,
    pub non_fatal: Vec<PipelineError>,
}

impl FinalResult {
    pub fn has_fatal_errors(&self) -> bool {
        self.terminal.iter().any(|(_, res)| res.is_err())
    }

    pub fn has_errors(&self) -> bool {
        self.has_fatal_errors() || !self.non_fatal.is_empty()
    }

    pub fn fatal_errors(&self) -> Vec<&PipelineError> {
        self.terminal
            .iter()
            .filter_map(|(_, res)| res.as_ref().err())
            .collect()
    }

    /// The single terminal value. Errors when the pipeline has more than one
    /// terminal task or the terminal task failed.
    pub fn singular(&self) -> Result<Value, PipelineError> {
        match self.terminal.as_slice() {
            [(_, res)] => res.clone(),
            other => Err(PipelineError::BadInput(format!(
                "expected exactly 1 terminal result, got {}",
                other.len()
            ))),
        }
    }
}
