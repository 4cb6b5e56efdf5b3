//! `http` task: fetch a URL and return the response body as a string.

use std::collections::BTreeMap;

use tracing::debug;

use crate::pipeline::graph::Node;
use crate::pipeline::task::check_inputs;
use crate::pipeline::vars::{resolve_map, resolve_string, Source, Vars};
use crate::pipeline::{PipelineError, RunInfo, TaskResult, Value};

/// Response bodies above this size are rejected.
const MAX_RESPONSE_BYTES: usize = 10 * 1024 * 1024;

pub async fn run(
    node: &Node,
    vars: &Vars,
    inputs: &[TaskResult],
    client: &reqwest::Client,
) -> (TaskResult, RunInfo) {
    let result = run_inner(node, vars, inputs, client).await;
    let info = match &result {
        Err(PipelineError::HttpStatus { status, .. }) if *status >= 500 => RunInfo::Retryable,
        Err(PipelineError::Http(_)) | Err(PipelineError::Timeout) => RunInfo::Retryable,
        _ => RunInfo::Final,
    };
    (result, info)
}

async fn run_inner(
    node: &Node,
    vars: &Vars,
    inputs: &[TaskResult],
    client: &reqwest::Client,
) -> TaskResult {
    check_inputs(inputs, None, None, 0)?;

    let raw_method = node.attr("method").unwrap_or_default();
    let raw_url = node.attr("url").unwrap_or_default();
    let raw_request_data = node.attr("requestData").unwrap_or_default();
    let raw_header_map = node.attr("headerMap").unwrap_or_default();

    let method = resolve_string(
        "method",
        &[Source::NonemptyString(raw_method), Source::Literal("GET")],
    )?;
    let url = resolve_string(
        "url",
        &[
            Source::VarExpr(raw_url, vars),
            Source::NonemptyString(raw_url),
        ],
    )?;
    let request_data = resolve_map(
        "requestData",
        &[
            Source::VarExpr(raw_request_data, vars),
            Source::JsonWithVars(raw_request_data, vars),
        ],
    )?;
    let header_map = resolve_map(
        "headerMap",
        &[
            Source::VarExpr(raw_header_map, vars),
            Source::JsonWithVars(raw_header_map, vars),
        ],
    )?;

    let method = reqwest::Method::from_bytes(method.to_ascii_uppercase().as_bytes())
        .map_err(|e| PipelineError::BadInput(format!("invalid HTTP method {method:?}: {e}")))?;

    debug!(url = %url, method = %method, task = %node.dot_id, "http task: sending request");

    let mut request = client
        .request(method, &url)
        .header(reqwest::header::CONTENT_TYPE, "application/json");

    if let Some(headers) = header_map {
        request = apply_headers(request, &headers)?;
    }

    if let Some(body) = request_data {
        let json = Value::Map(body).to_json();
        request = request.body(json.to_string());
    }

    let response = request
        .send()
        .await
        .map_err(|e| PipelineError::Http(e.to_string()))?;

    let status = response.status().as_u16();
    let body = response
        .bytes()
        .await
        .map_err(|e| PipelineError::Http(e.to_string()))?;

    if body.len() > MAX_RESPONSE_BYTES {
        return Err(PipelineError::Http(format!(
            "response body exceeds {MAX_RESPONSE_BYTES} bytes"
        )));
    }

    if status >= 400 {
        return Err(PipelineError::HttpStatus {
            url,
            status,
            body: best_effort_extract_error(&body),
        });
    }

    let text = String::from_utf8(body.to_vec())
        .map_err(|e| PipelineError::Http(format!("response body is not UTF-8: {e}")))?;

    debug!(url = %url, status, task = %node.dot_id, "http task got response");

    Ok(Value::String(text))
}

/// Merge user headers into the request; `Content-Type` override attempts are
/// skipped so the JSON default always wins.
fn apply_headers(
    mut request: reqwest::RequestBuilder,
    headers: &BTreeMap<String, Value>,
) -> Result<reqwest::RequestBuilder, PipelineError> {
    for (key, value) in headers {
        if key.eq_ignore_ascii_case("content-type") {
            continue;
        }
        let value = value
            .as_str()
            .map_err(|_| PipelineError::BadInput(format!("header {key} value is not a string")))?;
        request = request.header(key.as_str(), value);
    }
    Ok(request)
}

#[derive(serde::Deserialize)]
struct PossibleErrorResponse {
    #[serde(default)]
    error: String,
    #[serde(default, rename = "errorMessage")]
    error_message: String,
}

fn best_effort_extract_error(body: &[u8]) -> String {
    match serde_json::from_slice::<PossibleErrorResponse>(body) {
        Ok(resp) if !resp.error.is_empty() => resp.error,
        Ok(resp) if !resp.error_message.is_empty() => resp.error_message,
        _ => String::from_utf8_lossy(body).into_owned(),
    }
}
