//! Pipeline runner
//!
//! Walks the DAG, running every task whose inputs have settled. Independent
//! tasks run concurrently; panics inside a task are caught and recorded as a
//! result so the scheduler never deadlocks.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::FutureExt;
use tokio::task::JoinSet;
use tracing::{debug, warn};

use crate::pipeline::graph::Graph;
use crate::pipeline::task::{run_task, TaskKind};
use crate::pipeline::vars::Vars;
use crate::pipeline::{PipelineError, Run, RunInfo, RunStatus, Spec, TaskResult, TaskRun};

/// HTTP tasks that declare no timeout get this one.
const DEFAULT_HTTP_TIMEOUT: Duration = Duration::from_secs(15);

/// Hard ceiling for a whole run.
const RUN_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Clone)]
pub struct Runner {
    http: reqwest::Client,
}

impl Default for Runner {
    fn default() -> Self {
        Self::new()
    }
}

struct Settled {
    node: usize,
    result: TaskResult,
    created_at: DateTime<Utc>,
    finished_at: DateTime<Utc>,
}

impl Runner {
    pub fn new() -> Self {
        Runner {
            http: reqwest::Client::new(),
        }
    }

    pub fn with_http_client(http: reqwest::Client) -> Self {
        Runner { http }
    }

    /// Execute one run of the spec's graph. Always returns a `Run`; fatal
    /// task errors are reflected in the run state, not in a Result.
    pub async fn execute_run(&self, spec: &Spec, graph: &Graph, vars: &Vars) -> Run {
        debug!(job = %spec.job_name, spec_id = spec.id, "initiating tasks for pipeline run");

        let created_at = Utc::now();
        let vars = Arc::new(vars.clone());

        let n = graph.nodes.len();
        let mut settled: Vec<Option<Settled>> = (0..n).map(|_| None).collect();
        let mut remaining_inputs: Vec<usize> = graph.nodes.iter().map(|x| x.inputs.len()).collect();
        let mut join_set: JoinSet<Settled> = JoinSet::new();

        for id in 0..n {
            if remaining_inputs[id] == 0 {
                self.spawn_task(&mut join_set, graph, id, &vars, Vec::new());
            }
        }

        let deadline = tokio::time::Instant::now() + RUN_TIMEOUT;
        let mut settled_count = 0usize;

        while settled_count < n {
            let next = tokio::time::timeout_at(deadline, join_set.join_next()).await;
            let outcome = match next {
                Err(_) => {
                    warn!(job = %spec.job_name, "pipeline run exceeded the run deadline");
                    join_set.abort_all();
                    break;
                }
                Ok(None) => break,
                Ok(Some(Err(join_err))) => {
                    // spawn-level failure outside the unwind guard; nothing
                    // maps it back to a node, so give up on the run
                    warn!(job = %spec.job_name, error = %join_err, "pipeline task join error");
                    join_set.abort_all();
                    break;
                }
                Ok(Some(Ok(outcome))) => outcome,
            };

            let id = outcome.node;
            settled[id] = Some(outcome);
            settled_count += 1;

            for &out in &graph.nodes[id].outputs {
                remaining_inputs[out] -= 1;
                if remaining_inputs[out] == 0 {
                    let inputs: Vec<TaskResult> = graph.nodes[out]
                        .inputs
                        .iter()
                        .map(|&input| {
                            settled[input]
                                .as_ref()
                                .map(|s| s.result.clone())
                                .unwrap_or(Err(PipelineError::Cancelled))
                        })
                        .collect();
                    self.spawn_task(&mut join_set, graph, out, &vars, inputs);
                }
            }
        }

        let finished_at = Utc::now();
        let task_runs: Vec<TaskRun> = graph
            .nodes
            .iter()
            .map(|node| {
                let outcome = settled[node.id].take();
                let (result, task_created, task_finished) = match outcome {
                    Some(s) => (s.result, s.created_at, s.finished_at),
                    None => (Err(PipelineError::Cancelled), finished_at, finished_at),
                };
                TaskRun {
                    node: node.id,
                    dot_id: node.dot_id.clone(),
                    kind: node.kind,
                    output_index: node.output_index,
                    is_terminal: node.is_terminal(),
                    result,
                    created_at: task_created,
                    finished_at: task_finished,
                }
            })
            .collect();

        let errored = task_runs
            .iter()
            .filter(|tr| tr.is_terminal)
            .any(|tr| tr.result.is_err());

        let run = Run {
            spec_id: spec.id,
            job_name: spec.job_name.clone(),
            state: if errored {
                RunStatus::Errored
            } else {
                RunStatus::Completed
            },
            task_runs,
            created_at,
            finished_at: Some(finished_at),
        };

        debug!(
            job = %spec.job_name,
            state = ?run.state,
            run_time_ms = (finished_at - created_at).num_milliseconds(),
            "finished all tasks for pipeline run"
        );

        run
    }

    fn spawn_task(
        &self,
        join_set: &mut JoinSet<Settled>,
        graph: &Graph,
        id: usize,
        vars: &Arc<Vars>,
        inputs: Vec<TaskResult>,
    ) {
        let node = graph.nodes[id].clone();
        let vars = Arc::clone(vars);
        let http = self.http.clone();

        join_set.spawn(async move {
            let created_at = Utc::now();
            let timeout = match (node.timeout, node.kind) {
                (Some(t), _) => Some(t),
                (None, TaskKind::Http) => Some(DEFAULT_HTTP_TIMEOUT),
                (None, _) => None,
            };

            let mut attempt: u32 = 0;
            let result = loop {
                let fut = run_task(&node, &vars, &inputs, &http);
                let guarded = AssertUnwindSafe(fut).catch_unwind();

                let (result, info) = match timeout {
                    Some(t) => match tokio::time::timeout(t, guarded).await {
                        Ok(joined) => unwrap_panic(joined, &node.dot_id),
                        Err(_) => (Err(PipelineError::Timeout), RunInfo::Retryable),
                    },
                    None => unwrap_panic(guarded.await, &node.dot_id),
                };

                if result.is_ok() || info != RunInfo::Retryable || attempt >= node.retries {
                    break result;
                }

                let backoff = node
                    .min_backoff
                    .saturating_mul(2u32.saturating_pow(attempt))
                    .min(node.max_backoff);
                debug!(
                    task = %node.dot_id,
                    attempt,
                    backoff_ms = backoff.as_millis() as u64,
                    "retrying task after retryable failure"
                );
                tokio::time::sleep(backoff).await;
                attempt += 1;
            };

            Settled {
                node: id,
                result,
                created_at,
                finished_at: Utc::now(),
            }
        });
    }
}

type Caught = Result<(TaskResult, RunInfo), Box<dyn std::any::Any + Send>>;

fn unwrap_panic(caught: Caught, dot_id: &str) -> (TaskResult, RunInfo) {
    match caught {
        Ok(outcome) => outcome,
        Err(payload) => {
            let msg = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            warn!(task = %dot_id, panic = %msg, "recovered after task panic");
            (Err(PipelineError::Panicked(msg)), RunInfo::Final)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    use crate::pipeline::Value;

    fn spec(source: &str) -> (Spec, Graph) {
        let graph = Graph::parse(source).unwrap();
        (
            Spec {
                id: 1,
                job_name: "test_job".to_string(),
                source: source.to_string(),
            },
            graph,
        )
    }

    async fn run(source: &str) -> Run {
        let (spec, graph) = spec(source);
        Runner::new().execute_run(&spec, &graph, &Vars::new()).await
    }

    #[tokio::test]
    async fn memo_multiply_chain() {
        let run = run(r#"
            price [type=memo value=4.948];
            scale [type=multiply times=1000000];
            price -> scale
        "#)
        .await;
        assert_eq!(run.state, RunStatus::Completed);
        let value = run.final_result().singular().unwrap();
        assert_eq!(value, Value::Decimal(dec!(4948000)));
    }

    #[tokio::test]
    async fn fan_in_reduction() {
        let run = run(r#"
            a [type=memo value=1];
            b [type=memo value=2];
            c [type=memo value=6];
            avg [type=mean];
            a -> avg; b -> avg; c -> avg
        "#)
        .await;
        assert_eq!(run.state, RunStatus::Completed);
        assert_eq!(
            run.final_result().singular().unwrap(),
            Value::Decimal(dec!(3))
        );
    }

    #[tokio::test]
    async fn terminal_failure_marks_run_errored() {
        let run = run(r#"boom [type=fail msg="expected"];"#).await;
        assert_eq!(run.state, RunStatus::Errored);
        assert!(run.has_fatal_errors());
        assert_eq!(
            run.final_result().singular().unwrap_err(),
            PipelineError::TaskFailed("expected".to_string())
        );
    }

    #[tokio::test]
    async fn panic_is_caught_and_run_terminates() {
        let run = run(r#"
            kaboom [type=panic msg="scheduled detonation"];
            after [type=lowercase];
            kaboom -> after
        "#)
        .await;
        assert_eq!(run.state, RunStatus::Errored);
        let boom = &run.task_runs[0];
        assert!(matches!(boom.result, Err(PipelineError::Panicked(_))));
        // the dependent still settles instead of deadlocking
        assert!(run.task_runs[1].result.is_err());
    }

    #[tokio::test]
    async fn upstream_failure_propagates_to_terminal() {
        let run = run(r#"
            dead [type=fail msg="nope"];
            scale [type=multiply times=2];
            dead -> scale
        "#)
        .await;
        assert_eq!(run.state, RunStatus::Errored);
        assert!(matches!(
            run.task_runs[1].result,
            Err(PipelineError::InputTaskErrored(_))
        ));
    }

    #[tokio::test]
    async fn any_recovers_from_one_failed_branch() {
        let run = run(r#"
            primary [type=fail msg="down"];
            fallback [type=memo value=7 index=1];
            pick [type=any];
            primary -> pick; fallback -> pick
        "#)
        .await;
        assert_eq!(run.state, RunStatus::Completed);
        assert_eq!(
            run.final_result().singular().unwrap(),
            Value::Decimal(dec!(7))
        );
    }

    #[tokio::test]
    async fn non_fatal_errors_do_not_fail_the_run() {
        let run = run(r#"
            primary [type=fail msg="down"];
            fallback [type=memo value=7 index=1];
            pick [type=any];
            primary -> pick; fallback -> pick
        "#)
        .await;
        let final_result = run.final_result();
        assert!(final_result.has_errors());
        assert!(!final_result.has_fatal_errors());
    }
}
