//! `lowercase` / `uppercase` tasks.

use crate::pipeline::graph::Node;
use crate::pipeline::task::check_inputs;
use crate::pipeline::vars::{resolve_string, Source, Vars};
use crate::pipeline::{TaskResult, Value};

fn resolve_input(node: &Node, vars: &Vars, inputs: &[TaskResult]) -> TaskResult {
    check_inputs(inputs, None, Some(1), 0)?;
    let raw = node.attr("input").unwrap_or_default();
    let text = resolve_string(
        "input",
        &[Source::VarExpr(raw, vars), Source::Input(inputs, 0)],
    )?;
    Ok(Value::String(text))
}

pub fn run_lowercase(node: &Node, vars: &Vars, inputs: &[TaskResult]) -> TaskResult {
    let text = resolve_input(node, vars, inputs)?;
    Ok(Value::String(text.as_str()?.to_lowercase()))
}

pub fn run_uppercase(node: &Node, vars: &Vars, inputs: &[TaskResult]) -> TaskResult {
    let text = resolve_input(node, vars, inputs)?;
    Ok(Value::String(text.as_str()?.to_uppercase()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::Graph;

    fn node(kind: &str) -> Node {
        Graph::parse(&format!("t [type={kind}];"))
            .unwrap()
            .nodes
            .remove(0)
    }

    #[test]
    fn lowercase_from_input() {
        let inputs = vec![Ok(Value::String("INJ/USDT".into()))];
        let result = run_lowercase(&node("lowercase"), &Vars::new(), &inputs).unwrap();
        assert_eq!(result, Value::String("inj/usdt".into()));
    }

    #[test]
    fn uppercase_from_input() {
        let inputs = vec![Ok(Value::String("inj/usdt".into()))];
        let result = run_uppercase(&node("uppercase"), &Vars::new(), &inputs).unwrap();
        assert_eq!(result, Value::String("INJ/USDT".into()));
    }
}
