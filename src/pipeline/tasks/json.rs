//! `jsonparse` task: decode a JSON document and extract the value at a
//! slash-separated path.

use crate::pipeline::graph::Node;
use crate::pipeline::task::check_inputs;
use crate::pipeline::vars::{resolve_string, Source, Vars};
use crate::pipeline::{PipelineError, TaskResult, Value};

pub fn run_jsonparse(node: &Node, vars: &Vars, inputs: &[TaskResult]) -> TaskResult {
    let values = check_inputs(inputs, Some(1), Some(1), 0)?;
    let raw_path = node.attr("path").unwrap_or_default();
    let path = resolve_string(
        "path",
        &[
            Source::VarExpr(raw_path, vars),
            Source::NonemptyString(raw_path),
        ],
    )?;
    // lax mode returns null instead of failing when the leaf is missing
    let lax = node.attr("lax").map(|v| v == "true").unwrap_or(false);

    let document = values[0].as_str()?;
    let parsed: serde_json::Value = serde_json::from_str(document)
        .map_err(|e| PipelineError::BadInput(format!("invalid JSON input: {e}")))?;

    let mut current = &parsed;
    for segment in path.split('/').filter(|s| !s.is_empty()) {
        let next = match current {
            serde_json::Value::Object(map) => map.get(segment),
            serde_json::Value::Array(items) => segment
                .parse::<usize>()
                .ok()
                .and_then(|idx| items.get(idx)),
            _ => None,
        };
        match next {
            Some(value) => current = value,
            None if lax => return Ok(Value::Null),
            None => {
                return Err(PipelineError::BadInput(format!(
                    "no value at path {path:?} (missing segment {segment:?})"
                )))
            }
        }
    }

    Ok(Value::from_json(current))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::Graph;
    use rust_decimal_macros::dec;

    fn node(path: &str, lax: bool) -> Node {
        let lax_attr = if lax { " lax=true" } else { "" };
        let src = format!("parse [type=jsonparse path=\"{path}\"{lax_attr}];");
        Graph::parse(&src).unwrap().nodes.remove(0)
    }

    fn input(doc: &str) -> Vec<TaskResult> {
        vec![Ok(Value::String(doc.to_string()))]
    }

    #[test]
    fn extracts_nested_value() {
        let doc = r#"{"data": {"price": "4.948"}}"#;
        let result = run_jsonparse(&node("data/price", false), &Vars::new(), &input(doc)).unwrap();
        assert_eq!(result, Value::String("4.948".to_string()));
    }

    #[test]
    fn extracts_array_element() {
        let doc = r#"{"prices": [1.5, 2.5]}"#;
        let result = run_jsonparse(&node("prices/1", false), &Vars::new(), &input(doc)).unwrap();
        assert_eq!(result, Value::Decimal(dec!(2.5)));
    }

    #[test]
    fn numbers_keep_decimal_precision() {
        let doc = r#"{"price": 4.948}"#;
        let result = run_jsonparse(&node("price", false), &Vars::new(), &input(doc)).unwrap();
        assert_eq!(result, Value::Decimal(dec!(4.948)));
    }

    #[test]
    fn missing_leaf_errors() {
        let doc = r#"{"price": 1}"#;
        let err = run_jsonparse(&node("nope", false), &Vars::new(), &input(doc)).unwrap_err();
        assert!(matches!(err, PipelineError::BadInput(_)));
    }

    #[test]
    fn missing_leaf_is_null_in_lax_mode() {
        let doc = r#"{"price": 1}"#;
        let result = run_jsonparse(&node("nope", true), &Vars::new(), &input(doc)).unwrap();
        assert_eq!(result, Value::Null);
    }

    #[test]
    fn upstream_error_propagates() {
        let inputs = vec![Err(PipelineError::TaskFailed("dead".into()))];
        let err = run_jsonparse(&node("price", false), &Vars::new(), &inputs).unwrap_err();
        assert!(matches!(err, PipelineError::InputTaskErrored(_)));
    }
}
