//! Task kinds and dispatch

use std::fmt;

use crate::pipeline::graph::Node;
use crate::pipeline::tasks;
use crate::pipeline::vars::Vars;
use crate::pipeline::{PipelineError, RunInfo, TaskResult, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskKind {
    Http,
    JsonParse,
    Multiply,
    Divide,
    Mean,
    Median,
    Mode,
    Sum,
    Any,
    Merge,
    EthAbiEncode,
    EthAbiEncode2,
    EthAbiDecode,
    EthAbiDecodeLog,
    Lowercase,
    Uppercase,
    Fail,
    Panic,
    Memo,
}

impl TaskKind {
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "http" => Some(TaskKind::Http),
            "jsonparse" => Some(TaskKind::JsonParse),
            "multiply" => Some(TaskKind::Multiply),
            "divide" => Some(TaskKind::Divide),
            "mean" => Some(TaskKind::Mean),
            "median" => Some(TaskKind::Median),
            "mode" => Some(TaskKind::Mode),
            "sum" => Some(TaskKind::Sum),
            "any" => Some(TaskKind::Any),
            "merge" => Some(TaskKind::Merge),
            "ethabiencode" => Some(TaskKind::EthAbiEncode),
            "ethabiencode2" => Some(TaskKind::EthAbiEncode2),
            "ethabidecode" => Some(TaskKind::EthAbiDecode),
            "ethabidecodelog" => Some(TaskKind::EthAbiDecodeLog),
            "lowercase" => Some(TaskKind::Lowercase),
            "uppercase" => Some(TaskKind::Uppercase),
            "fail" => Some(TaskKind::Fail),
            "panic" => Some(TaskKind::Panic),
            "memo" => Some(TaskKind::Memo),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskKind::Http => "http",
            TaskKind::JsonParse => "jsonparse",
            TaskKind::Multiply => "multiply",
            TaskKind::Divide => "divide",
            TaskKind::Mean => "mean",
            TaskKind::Median => "median",
            TaskKind::Mode => "mode",
            TaskKind::Sum => "sum",
            TaskKind::Any => "any",
            TaskKind::Merge => "merge",
            TaskKind::EthAbiEncode => "ethabiencode",
            TaskKind::EthAbiEncode2 => "ethabiencode2",
            TaskKind::EthAbiDecode => "ethabidecode",
            TaskKind::EthAbiDecodeLog => "ethabidecodelog",
            TaskKind::Lowercase => "lowercase",
            TaskKind::Uppercase => "uppercase",
            TaskKind::Fail => "fail",
            TaskKind::Panic => "panic",
            TaskKind::Memo => "memo",
        }
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Validate input cardinality and collect successful input values, failing
/// when more than `max_errors` upstream tasks errored.
pub fn check_inputs(
    inputs: &[TaskResult],
    min_len: Option<usize>,
    max_len: Option<usize>,
    max_errors: usize,
) -> Result<Vec<Value>, PipelineError> {
    let got = inputs.len();
    if let Some(min) = min_len {
        if got < min {
            return Err(PipelineError::WrongInputCardinality {
                min,
                max: max_len.unwrap_or(usize::MAX),
                got,
            });
        }
    }
    if let Some(max) = max_len {
        if got > max {
            return Err(PipelineError::WrongInputCardinality {
                min: min_len.unwrap_or(0),
                max,
                got,
            });
        }
    }

    let mut values = Vec::with_capacity(got);
    let mut errors = 0usize;
    let mut first_error: Option<&PipelineError> = None;
    for input in inputs {
        match input {
            Ok(value) => values.push(value.clone()),
            Err(err) => {
                errors += 1;
                first_error.get_or_insert(err);
            }
        }
    }

    if errors > max_errors {
        if max_errors == 0 {
            // propagate the upstream failure rather than a generic count error
            return Err(PipelineError::InputTaskErrored(
                first_error.map(|e| e.to_string()).unwrap_or_default(),
            ));
        }
        return Err(PipelineError::TooManyErrors);
    }

    Ok(values)
}

/// Execute one task. The caller wraps this with the node's timeout and retry
/// budget; panics inside tasks are caught at the join layer above.
pub async fn run_task(
    node: &Node,
    vars: &Vars,
    inputs: &[TaskResult],
    http: &reqwest::Client,
) -> (TaskResult, RunInfo) {
    match node.kind {
        TaskKind::Http => tasks::http::run(node, vars, inputs, http).await,
        TaskKind::JsonParse => finalize(tasks::json::run_jsonparse(node, vars, inputs)),
        TaskKind::Multiply => finalize(tasks::math::run_multiply(node, vars, inputs)),
        TaskKind::Divide => finalize(tasks::math::run_divide(node, vars, inputs)),
        TaskKind::Mean => finalize(tasks::math::run_mean(node, inputs)),
        TaskKind::Median => finalize(tasks::math::run_median(node, inputs)),
        TaskKind::Mode => finalize(tasks::math::run_mode(node, inputs)),
        TaskKind::Sum => finalize(tasks::math::run_sum(node, inputs)),
        TaskKind::Any => finalize(tasks::misc::run_any(inputs)),
        TaskKind::Merge => finalize(tasks::misc::run_merge(node, vars, inputs)),
        TaskKind::EthAbiEncode | TaskKind::EthAbiEncode2 => {
            finalize(tasks::abi::run_encode(node, vars, inputs))
        }
        TaskKind::EthAbiDecode => finalize(tasks::abi::run_decode(node, vars, inputs)),
        TaskKind::EthAbiDecodeLog => finalize(tasks::abi::run_decode_log(node, vars, inputs)),
        TaskKind::Lowercase => finalize(tasks::strings::run_lowercase(node, vars, inputs)),
        TaskKind::Uppercase => finalize(tasks::strings::run_uppercase(node, vars, inputs)),
        TaskKind::Fail => finalize(tasks::misc::run_fail(node)),
        TaskKind::Panic => tasks::misc::run_panic(node),
        TaskKind::Memo => finalize(tasks::misc::run_memo(node, vars)),
    }
}

fn finalize(result: TaskResult) -> (TaskResult, RunInfo) {
    (result, RunInfo::Final)
}
