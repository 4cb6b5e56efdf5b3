//! DOT-like observation source graphs
//!
//! Parses the textual task graph into a flat node/edge representation with a
//! precomputed topological order. Node indices are used for all references so
//! the runner never deals with pointer cycles.

use std::collections::BTreeMap;
use std::time::Duration;

use thiserror::Error;

use crate::pipeline::task::TaskKind;

#[derive(Debug, Error, PartialEq)]
pub enum GraphError {
    #[error("syntax error at line {line}: {msg}")]
    Syntax { line: usize, msg: String },

    #[error("unknown task type: {0:?}")]
    UnknownTaskKind(String),

    #[error("duplicate node: {0}")]
    DuplicateNode(String),

    #[error("edge references undeclared node: {0}")]
    UndeclaredNode(String),

    #[error("graph contains a cycle")]
    Cycle,

    #[error("graph has no terminal node")]
    NoTerminalNode,

    #[error("bad parameter {param} on node {node}: {msg}")]
    BadParam {
        node: String,
        param: String,
        msg: String,
    },
}

/// One task node. `attrs` keeps the kind-specific parameters as declared;
/// the base scheduling parameters are parsed out at graph build time.
#[derive(Debug, Clone, PartialEq)]
pub struct Node {
    pub id: usize,
    pub dot_id: String,
    pub kind: TaskKind,
    pub attrs: BTreeMap<String, String>,
    pub output_index: i32,
    pub timeout: Option<Duration>,
    pub retries: u32,
    pub min_backoff: Duration,
    pub max_backoff: Duration,
    /// Upstream node indices, in edge declaration order.
    pub inputs: Vec<usize>,
    /// Downstream node indices, in edge declaration order.
    pub outputs: Vec<usize>,
}

impl Node {
    pub fn attr(&self, key: &str) -> Option<&str> {
        self.attrs.get(key).map(String::as_str)
    }

    pub fn is_terminal(&self) -> bool {
        self.outputs.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Graph {
    pub nodes: Vec<Node>,
    pub edges: Vec<(usize, usize)>,
    /// Node indices in a valid execution order.
    pub topo_order: Vec<usize>,
}

const DEFAULT_MIN_BACKOFF: Duration = Duration::from_millis(100);
const DEFAULT_MAX_BACKOFF: Duration = Duration::from_secs(60);

impl Graph {
    /// Parse a DOT-like source into a validated DAG. Cycles, unknown task
    /// kinds and graphs without a terminal node are rejected here, before any
    /// run is attempted.
    pub fn parse(source: &str) -> Result<Graph, GraphError> {
        let stmts = tokenize(source)?;

        let mut nodes: Vec<Node> = Vec::new();
        let mut index: BTreeMap<String, usize> = BTreeMap::new();
        let mut edges: Vec<(usize, usize)> = Vec::new();

        for stmt in &stmts {
            match stmt {
                Stmt::Node { line, name, attrs } => {
                    if index.contains_key(name) {
                        return Err(GraphError::DuplicateNode(name.clone()));
                    }
                    let kind_str = attrs.get("type").cloned().ok_or_else(|| GraphError::Syntax {
                        line: *line,
                        msg: format!("node {name} is missing the type attribute"),
                    })?;
                    let kind = TaskKind::from_str(&kind_str)
                        .ok_or_else(|| GraphError::UnknownTaskKind(kind_str.clone()))?;

                    let id = nodes.len();
                    let node = Node {
                        id,
                        dot_id: name.clone(),
                        kind,
                        output_index: parse_attr(name, attrs, "index", 0, |s| {
                            s.parse::<i32>().ok()
                        })?,
                        timeout: parse_attr(name, attrs, "timeout", None, |s| {
                            parse_duration(s).map(Some)
                        })?,
                        retries: parse_attr(name, attrs, "retries", 0, |s| s.parse::<u32>().ok())?,
                        min_backoff: parse_attr(name, attrs, "minBackoff", DEFAULT_MIN_BACKOFF, parse_duration)?,
                        max_backoff: parse_attr(name, attrs, "maxBackoff", DEFAULT_MAX_BACKOFF, parse_duration)?,
                        attrs: attrs.clone(),
                        inputs: Vec::new(),
                        outputs: Vec::new(),
                    };
                    index.insert(name.clone(), id);
                    nodes.push(node);
                }
                Stmt::Edges { chain, .. } => {
                    for pair in chain.windows(2) {
                        let from = *index
                            .get(&pair[0])
                            .ok_or_else(|| GraphError::UndeclaredNode(pair[0].clone()))?;
                        let to = *index
                            .get(&pair[1])
                            .ok_or_else(|| GraphError::UndeclaredNode(pair[1].clone()))?;
                        edges.push((from, to));
                    }
                }
            }
        }

        for &(from, to) in &edges {
            nodes[from].outputs.push(to);
            nodes[to].inputs.push(from);
        }

        // order each node's inputs by the upstream output index (stable, so
        // declaration order breaks ties); `any` relies on this
        let output_indices: Vec<i32> = nodes.iter().map(|n| n.output_index).collect();
        for node in &mut nodes {
            node.inputs.sort_by_key(|&input| output_indices[input]);
        }

        let topo_order = topo_sort(&nodes)?;

        if !nodes.iter().any(Node::is_terminal) {
            return Err(GraphError::NoTerminalNode);
        }

        Ok(Graph {
            nodes,
            edges,
            topo_order,
        })
    }

    pub fn node_by_dot_id(&self, dot_id: &str) -> Option<&Node> {
        self.nodes.iter().find(|n| n.dot_id == dot_id)
    }

    pub fn terminal_nodes(&self) -> Vec<&Node> {
        let mut terminals: Vec<&Node> = self.nodes.iter().filter(|n| n.is_terminal()).collect();
        terminals.sort_by_key(|n| n.output_index);
        terminals
    }

    /// Emit a canonical source form that parses back to the same graph.
    pub fn pretty_print(&self) -> String {
        let mut out = String::new();
        for node in &self.nodes {
            out.push_str(&node.dot_id);
            out.push_str(" [");
            let mut first = true;
            // type first, then the rest in key order
            let mut keys: Vec<&String> = node.attrs.keys().collect();
            keys.sort_by_key(|k| (k.as_str() != "type", k.as_str()));
            for key in keys {
                if !first {
                    out.push(' ');
                }
                first = false;
                let value = &node.attrs[key];
                if is_bare(value) {
                    out.push_str(&format!("{key}={value}"));
                } else {
                    out.push_str(&format!("{key}=\"{}\"", value.replace('\"', "\\\"")));
                }
            }
            out.push_str("];\n");
        }
        for &(from, to) in &self.edges {
            out.push_str(&format!(
                "{} -> {};\n",
                self.nodes[from].dot_id, self.nodes[to].dot_id
            ));
        }
        out
    }
}

fn parse_attr<T>(
    node: &str,
    attrs: &BTreeMap<String, String>,
    key: &str,
    default: T,
    parse: impl Fn(&str) -> Option<T>,
) -> Result<T, GraphError> {
    match attrs.get(key) {
        None => Ok(default),
        Some(raw) => parse(raw).ok_or_else(|| GraphError::BadParam {
            node: node.to_string(),
            param: key.to_string(),
            msg: format!("cannot parse {raw:?}"),
        }),
    }
}

/// Parse `10ms`, `15s`, `1m`, `2h` style durations.
pub fn parse_duration(s: &str) -> Option<Duration> {
    let s = s.trim();
    let split = s.find(|c: char| !c.is_ascii_digit())?;
    let (num, unit) = s.split_at(split);
    let num: u64 = num.parse().ok()?;
    match unit {
        "ms" => Some(Duration::from_millis(num)),
        "s" => Some(Duration::from_secs(num)),
        "m" => Some(Duration::from_secs(num * 60)),
        "h" => Some(Duration::from_secs(num * 3600)),
        _ => None,
    }
}

/// Render a duration in the largest unit [`parse_duration`] reads back
/// exactly.
pub fn format_duration(d: Duration) -> String {
    let ms = d.as_millis();
    if ms % 1000 != 0 {
        return format!("{ms}ms");
    }
    let secs = d.as_secs();
    if secs != 0 && secs % 3600 == 0 {
        format!("{}h", secs / 3600)
    } else if secs != 0 && secs % 60 == 0 {
        format!("{}m", secs / 60)
    } else {
        format!("{secs}s")
    }
}

fn is_bare(value: &str) -> bool {
    !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-' | '+' | '$' | '(' | ')' | '%'))
}

fn topo_sort(nodes: &[Node]) -> Result<Vec<usize>, GraphError> {
    let mut indegree: Vec<usize> = nodes.iter().map(|n| n.inputs.len()).collect();
    let mut ready: Vec<usize> = (0..nodes.len()).filter(|&i| indegree[i] == 0).collect();
    let mut order = Vec::with_capacity(nodes.len());

    while let Some(id) = ready.pop() {
        order.push(id);
        for &out in &nodes[id].outputs {
            indegree[out] -= 1;
            if indegree[out] == 0 {
                ready.push(out);
            }
        }
    }

    if order.len() != nodes.len() {
        return Err(GraphError::Cycle);
    }
    Ok(order)
}

enum Stmt {
    Node {
        line: usize,
        name: String,
        attrs: BTreeMap<String, String>,
    },
    Edges {
        chain: Vec<String>,
    },
}

/// Split the source into node and edge statements. Supports `//` and `#`
/// comments, an optional `digraph name { ... }` wrapper, `;`-or-newline
/// statement separation, and quoted attribute values with `\"` escapes.
fn tokenize(source: &str) -> Result<Vec<Stmt>, GraphError> {
    let mut stmts = Vec::new();

    let body = strip_wrapper(source);

    for (lineno, raw_line) in body.lines().enumerate() {
        let line = strip_comment(raw_line);
        for stmt_text in split_statements(line) {
            let stmt_text = stmt_text.trim();
            if stmt_text.is_empty() {
                continue;
            }
            if !stmt_text.contains('[') && stmt_text.contains("->") {
                let chain: Vec<String> = stmt_text
                    .split("->")
                    .map(|part| part.trim().to_string())
                    .collect();
                if chain.iter().any(|name| !is_ident(name)) {
                    return Err(GraphError::Syntax {
                        line: lineno + 1,
                        msg: format!("malformed edge statement {stmt_text:?}"),
                    });
                }
                stmts.push(Stmt::Edges { chain });
            } else {
                let (name, attrs) = parse_node_stmt(stmt_text, lineno + 1)?;
                stmts.push(Stmt::Node {
                    line: lineno + 1,
                    name,
                    attrs,
                });
            }
        }
    }

    Ok(stmts)
}

fn strip_wrapper(source: &str) -> &str {
    let trimmed = source.trim();
    if trimmed.starts_with("digraph") {
        if let (Some(open), Some(close)) = (trimmed.find('{'), trimmed.rfind('}')) {
            if open < close {
                return &trimmed[open + 1..close];
            }
        }
    }
    source
}

fn strip_comment(line: &str) -> &str {
    let mut in_quotes = false;
    let bytes = line.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'"' => in_quotes = !in_quotes,
            b'\\' if in_quotes => i += 1,
            b'#' if !in_quotes => return &line[..i],
            b'/' if !in_quotes && i + 1 < bytes.len() && bytes[i + 1] == b'/' => {
                return &line[..i]
            }
            _ => {}
        }
        i += 1;
    }
    line
}

/// Split a line on `;` separators that are outside quotes.
fn split_statements(line: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut start = 0;
    let mut in_quotes = false;
    let bytes = line.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'"' => in_quotes = !in_quotes,
            b'\\' if in_quotes => i += 1,
            b';' if !in_quotes => {
                parts.push(&line[start..i]);
                start = i + 1;
            }
            _ => {}
        }
        i += 1;
    }
    parts.push(&line[start..]);
    parts
}

fn is_ident(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn parse_node_stmt(
    text: &str,
    line: usize,
) -> Result<(String, BTreeMap<String, String>), GraphError> {
    let open = text.find('[').ok_or_else(|| GraphError::Syntax {
        line,
        msg: format!("expected node statement, got {text:?}"),
    })?;
    let close = text.rfind(']').ok_or_else(|| GraphError::Syntax {
        line,
        msg: "missing closing bracket".to_string(),
    })?;
    if close < open {
        return Err(GraphError::Syntax {
            line,
            msg: "mismatched brackets".to_string(),
        });
    }

    let name = text[..open].trim().to_string();
    if !is_ident(&name) {
        return Err(GraphError::Syntax {
            line,
            msg: format!("invalid node name {name:?}"),
        });
    }

    let attrs = parse_attr_list(&text[open + 1..close], line)?;
    Ok((name, attrs))
}

fn parse_attr_list(text: &str, line: usize) -> Result<BTreeMap<String, String>, GraphError> {
    let mut attrs = BTreeMap::new();
    let chars: Vec<char> = text.chars().collect();
    let mut i = 0;

    while i < chars.len() {
        // skip separators
        while i < chars.len() && (chars[i].is_whitespace() || chars[i] == ',') {
            i += 1;
        }
        if i >= chars.len() {
            break;
        }

        // key
        let key_start = i;
        while i < chars.len() && chars[i] != '=' && !chars[i].is_whitespace() {
            i += 1;
        }
        let key: String = chars[key_start..i].iter().collect();

        while i < chars.len() && chars[i].is_whitespace() {
            i += 1;
        }
        if i >= chars.len() || chars[i] != '=' {
            return Err(GraphError::Syntax {
                line,
                msg: format!("attribute {key:?} is missing a value"),
            });
        }
        i += 1; // consume '='
        while i < chars.len() && chars[i].is_whitespace() {
            i += 1;
        }

        // value: quoted or bare
        let value = if i < chars.len() && chars[i] == '"' {
            i += 1;
            let mut value = String::new();
            loop {
                if i >= chars.len() {
                    return Err(GraphError::Syntax {
                        line,
                        msg: format!("unterminated quoted value for {key:?}"),
                    });
                }
                match chars[i] {
                    '"' => {
                        i += 1;
                        break;
                    }
                    '\\' if i + 1 < chars.len() => {
                        value.push(chars[i + 1]);
                        i += 2;
                    }
                    c => {
                        value.push(c);
                        i += 1;
                    }
                }
            }
            value
        } else {
            let value_start = i;
            while i < chars.len() && !chars[i].is_whitespace() && chars[i] != ',' {
                i += 1;
            }
            chars[value_start..i].iter().collect()
        };

        attrs.insert(key, value);
    }

    Ok(attrs)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
        ticker [type=http method=GET url="https://api.example.com/api/v3/ticker/price?symbol=INJUSDT"];
        parsePrice [type=jsonparse path="price"];
        multiplyDecimals [type=multiply times=1000000];
        ticker -> parsePrice -> multiplyDecimals
    "#;

    #[test]
    fn parses_sample_graph() {
        let graph = Graph::parse(SAMPLE).unwrap();
        assert_eq!(graph.nodes.len(), 3);
        assert_eq!(graph.edges, vec![(0, 1), (1, 2)]);

        let ticker = graph.node_by_dot_id("ticker").unwrap();
        assert_eq!(ticker.kind, TaskKind::Http);
        assert_eq!(ticker.attr("method"), Some("GET"));
        assert!(ticker.attr("url").unwrap().starts_with("https://"));

        let terminals = graph.terminal_nodes();
        assert_eq!(terminals.len(), 1);
        assert_eq!(terminals[0].dot_id, "multiplyDecimals");
    }

    #[test]
    fn rejects_unknown_task_kind() {
        let err = Graph::parse("a [type=teleport];").unwrap_err();
        assert_eq!(err, GraphError::UnknownTaskKind("teleport".to_string()));
    }

    #[test]
    fn rejects_cycles() {
        let src = r#"
            a [type=memo value=1];
            b [type=multiply times=2];
            a -> b
            b -> a
        "#;
        assert_eq!(Graph::parse(src).unwrap_err(), GraphError::Cycle);
    }

    #[test]
    fn rejects_duplicate_nodes() {
        let src = "a [type=memo value=1];\na [type=memo value=2];";
        assert_eq!(
            Graph::parse(src).unwrap_err(),
            GraphError::DuplicateNode("a".to_string())
        );
    }

    #[test]
    fn rejects_undeclared_edge_target() {
        let src = "a [type=memo value=1];\na -> ghost";
        assert_eq!(
            Graph::parse(src).unwrap_err(),
            GraphError::UndeclaredNode("ghost".to_string())
        );
    }

    #[test]
    fn topo_order_respects_dependencies() {
        let graph = Graph::parse(SAMPLE).unwrap();
        let pos = |dot_id: &str| {
            let id = graph.node_by_dot_id(dot_id).unwrap().id;
            graph.topo_order.iter().position(|&n| n == id).unwrap()
        };
        assert!(pos("ticker") < pos("parsePrice"));
        assert!(pos("parsePrice") < pos("multiplyDecimals"));
    }

    #[test]
    fn pretty_print_round_trips() {
        let graph = Graph::parse(SAMPLE).unwrap();
        let printed = graph.pretty_print();
        let reparsed = Graph::parse(&printed).unwrap();
        assert_eq!(graph, reparsed);
    }

    #[test]
    fn parses_base_task_params() {
        let src = r#"fetch [type=http url="https://x.test" timeout=30s retries=2 minBackoff=50ms maxBackoff=5s index=1];"#;
        let graph = Graph::parse(src).unwrap();
        let node = &graph.nodes[0];
        assert_eq!(node.timeout, Some(Duration::from_secs(30)));
        assert_eq!(node.retries, 2);
        assert_eq!(node.min_backoff, Duration::from_millis(50));
        assert_eq!(node.max_backoff, Duration::from_secs(5));
        assert_eq!(node.output_index, 1);
    }

    #[test]
    fn strips_comments_and_wrapper() {
        let src = r#"
            digraph price {
                // fetch leg
                a [type=memo value=42]; # trailing comment
            }
        "#;
        let graph = Graph::parse(src).unwrap();
        assert_eq!(graph.nodes.len(), 1);
        assert_eq!(graph.nodes[0].attr("value"), Some("42"));
    }

    #[test]
    fn duration_suffixes() {
        assert_eq!(parse_duration("10ms"), Some(Duration::from_millis(10)));
        assert_eq!(parse_duration("15s"), Some(Duration::from_secs(15)));
        assert_eq!(parse_duration("1m"), Some(Duration::from_secs(60)));
        assert_eq!(parse_duration("2h"), Some(Duration::from_secs(7200)));
        assert_eq!(parse_duration("nope"), None);
    }

    #[test]
    fn durations_round_trip_through_format() {
        for d in [
            Duration::from_millis(500),
            Duration::from_secs(15),
            Duration::from_secs(60),
            Duration::from_secs(90),
            Duration::from_secs(7200),
        ] {
            assert_eq!(parse_duration(&format_duration(d)), Some(d), "{d:?}");
        }
        assert_eq!(format_duration(Duration::from_secs(60)), "1m");
        assert_eq!(format_duration(Duration::from_secs(7200)), "2h");
    }
}
