//! Ethereum ABI codec tasks: `ethabiencode`, `ethabiencode2`, `ethabidecode`
//! and `ethabidecodelog`.
//!
//! Schemas use the human-readable form `method(uint256 amount, address to)`
//! (the method name is optional; when present a 4-byte selector is
//! prepended) and `Event(address indexed from, uint256 value)` for logs.

use std::collections::BTreeMap;

use ethers::abi::{decode as abi_decode, encode as abi_encode, ParamType, Token};
use ethers::types::{I256, U256};
use ethers::utils::keccak256;

use crate::pipeline::graph::Node;
use crate::pipeline::task::check_inputs;
use crate::pipeline::vars::{resolve_map, Source, Vars};
use crate::pipeline::{PipelineError, TaskResult, Value};

struct AbiArg {
    name: String,
    kind: ParamType,
    indexed: bool,
}

struct AbiSchema {
    method: Option<String>,
    args: Vec<AbiArg>,
}

impl AbiSchema {
    fn parse(raw: &str) -> Result<AbiSchema, PipelineError> {
        let raw = raw.trim();
        let open = raw
            .find('(')
            .ok_or_else(|| bad_schema(raw, "missing opening parenthesis"))?;
        let close = raw
            .rfind(')')
            .ok_or_else(|| bad_schema(raw, "missing closing parenthesis"))?;
        if close < open {
            return Err(bad_schema(raw, "mismatched parentheses"));
        }

        let method = raw[..open].trim();
        let method = if method.is_empty() {
            None
        } else {
            Some(method.to_string())
        };

        let mut args = Vec::new();
        for part in raw[open + 1..close].split(',') {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }
            let mut words = part.split_whitespace();
            let type_str = words
                .next()
                .ok_or_else(|| bad_schema(raw, "empty argument"))?;
            let mut next = words.next();
            let indexed = next == Some("indexed");
            if indexed {
                next = words.next();
            }
            let name = next.unwrap_or_default().to_string();
            let kind = parse_param_type(type_str)
                .ok_or_else(|| bad_schema(raw, &format!("unsupported type {type_str:?}")))?;
            args.push(AbiArg {
                name,
                kind,
                indexed,
            });
        }

        Ok(AbiSchema { method, args })
    }

    /// Canonical signature, e.g. `transfer(address,uint256)`.
    fn canonical(&self) -> String {
        let types: Vec<String> = self.args.iter().map(|a| a.kind.to_string()).collect();
        format!(
            "{}({})",
            self.method.as_deref().unwrap_or_default(),
            types.join(",")
        )
    }

    fn param_types(&self) -> Vec<ParamType> {
        self.args.iter().map(|a| a.kind.clone()).collect()
    }
}

fn bad_schema(raw: &str, msg: &str) -> PipelineError {
    PipelineError::BadInput(format!("invalid ABI schema {raw:?}: {msg}"))
}

fn parse_param_type(s: &str) -> Option<ParamType> {
    if let Some(inner) = s.strip_suffix("[]") {
        return Some(ParamType::Array(Box::new(parse_param_type(inner)?)));
    }
    match s {
        "address" => Some(ParamType::Address),
        "bool" => Some(ParamType::Bool),
        "string" => Some(ParamType::String),
        "bytes" => Some(ParamType::Bytes),
        _ => {
            if let Some(n) = s.strip_prefix("bytes") {
                let n: usize = n.parse().ok()?;
                (1..=32).contains(&n).then(|| ParamType::FixedBytes(n))
            } else if let Some(bits) = s.strip_prefix("uint") {
                let bits: usize = if bits.is_empty() { 256 } else { bits.parse().ok()? };
                (bits % 8 == 0 && bits <= 256).then(|| ParamType::Uint(bits))
            } else if let Some(bits) = s.strip_prefix("int") {
                let bits: usize = if bits.is_empty() { 256 } else { bits.parse().ok()? };
                (bits % 8 == 0 && bits <= 256).then(|| ParamType::Int(bits))
            } else {
                None
            }
        }
    }
}

fn schema_from_node(node: &Node) -> Result<AbiSchema, PipelineError> {
    let raw = node
        .attr("abi")
        .ok_or_else(|| PipelineError::ParameterEmpty("abi".to_string()))?;
    AbiSchema::parse(raw)
}

fn hex_bytes(s: &str) -> Result<Vec<u8>, PipelineError> {
    hex::decode(s.trim().trim_start_matches("0x"))
        .map_err(|e| PipelineError::BadInput(format!("invalid hex {s:?}: {e}")))
}

fn value_to_bytes(value: &Value) -> Result<Vec<u8>, PipelineError> {
    match value {
        Value::Bytes(b) => Ok(b.clone()),
        Value::String(s) => hex_bytes(s),
        other => Err(PipelineError::BadInput(format!(
            "expected bytes, got {other:?}"
        ))),
    }
}

fn value_to_token(value: &Value, kind: &ParamType) -> Result<Token, PipelineError> {
    let err = |msg: String| PipelineError::BadInput(msg);
    match kind {
        ParamType::Address => {
            let s = value.as_str()?;
            let bytes = hex_bytes(s)?;
            if bytes.len() != 20 {
                return Err(err(format!("address must be 20 bytes, got {}", bytes.len())));
            }
            Ok(Token::Address(ethers::types::H160::from_slice(&bytes)))
        }
        ParamType::Bool => match value {
            Value::Bool(b) => Ok(Token::Bool(*b)),
            Value::String(s) => Ok(Token::Bool(s == "true")),
            other => Err(err(format!("expected bool, got {other:?}"))),
        },
        ParamType::String => Ok(Token::String(value.as_str()?.to_string())),
        ParamType::Bytes => Ok(Token::Bytes(value_to_bytes(value)?)),
        ParamType::FixedBytes(n) => {
            let bytes = value_to_bytes(value)?;
            if bytes.len() != *n {
                return Err(err(format!("expected bytes{n}, got {} bytes", bytes.len())));
            }
            Ok(Token::FixedBytes(bytes))
        }
        ParamType::Uint(_) => {
            let d = value.as_decimal()?;
            if !d.fract().is_zero() || d.is_sign_negative() {
                return Err(err(format!("uint value must be a non-negative integer: {d}")));
            }
            U256::from_dec_str(&d.trunc().to_string())
                .map(Token::Uint)
                .map_err(|e| err(format!("uint out of range {d}: {e}")))
        }
        ParamType::Int(_) => {
            let d = value.as_decimal()?;
            if !d.fract().is_zero() {
                return Err(err(format!("int value must be an integer: {d}")));
            }
            I256::from_dec_str(&d.trunc().to_string())
                .map(|i| Token::Int(i.into_raw()))
                .map_err(|e| err(format!("int out of range {d}: {e}")))
        }
        ParamType::Array(inner) => match value {
            Value::Array(items) => {
                let tokens: Result<Vec<Token>, PipelineError> =
                    items.iter().map(|v| value_to_token(v, inner)).collect();
                Ok(Token::Array(tokens?))
            }
            other => Err(err(format!("expected array, got {other:?}"))),
        },
        other => Err(err(format!("unsupported ABI type {other}"))),
    }
}

fn token_to_value(token: Token) -> Value {
    match token {
        Token::Address(a) => Value::String(format!("0x{}", hex::encode(a.as_bytes()))),
        Token::Bool(b) => Value::Bool(b),
        Token::String(s) => Value::String(s),
        Token::Bytes(b) | Token::FixedBytes(b) => Value::Bytes(b),
        Token::Uint(u) => u
            .to_string()
            .parse()
            .map(Value::Decimal)
            .unwrap_or_else(|_| Value::String(u.to_string())),
        Token::Int(raw) => {
            let i = I256::from_raw(raw);
            i.to_string()
                .parse()
                .map(Value::Decimal)
                .unwrap_or_else(|_| Value::String(i.to_string()))
        }
        Token::Array(items) | Token::FixedArray(items) | Token::Tuple(items) => {
            Value::Array(items.into_iter().map(token_to_value).collect())
        }
    }
}

/// Encode the `data` map against the schema. With a method name present the
/// 4-byte selector is prepended, matching calldata layout.
pub fn run_encode(node: &Node, vars: &Vars, inputs: &[TaskResult]) -> TaskResult {
    let input_values = check_inputs(inputs, None, Some(1), 0)?;
    let schema = schema_from_node(node)?;

    let raw_data = node.attr("data").unwrap_or_default();
    let data = match resolve_map("data", &[Source::JsonWithVars(raw_data, vars)])? {
        Some(map) => map,
        None => match input_values.first() {
            Some(value) => value.as_map()?.clone(),
            None => BTreeMap::new(),
        },
    };

    let mut tokens = Vec::with_capacity(schema.args.len());
    for arg in &schema.args {
        let value = data
            .get(&arg.name)
            .ok_or_else(|| PipelineError::ParameterEmpty(arg.name.clone()))?;
        tokens.push(value_to_token(value, &arg.kind)?);
    }

    let mut encoded = Vec::new();
    if schema.method.is_some() {
        encoded.extend_from_slice(&keccak256(schema.canonical().as_bytes())[..4]);
    }
    encoded.extend_from_slice(&abi_encode(&tokens));
    Ok(Value::Bytes(encoded))
}

/// Decode bytes against a tuple schema into a name → value map.
pub fn run_decode(node: &Node, vars: &Vars, inputs: &[TaskResult]) -> TaskResult {
    let input_values = check_inputs(inputs, None, Some(1), 0)?;
    let schema = schema_from_node(node)?;

    let raw_data = node.attr("data").unwrap_or_default();
    let bytes = if let Some(value) = input_values.first() {
        value_to_bytes(value)?
    } else {
        let data = crate::pipeline::vars::resolve(
            "data",
            &[
                Source::VarExpr(raw_data, vars),
                Source::NonemptyString(raw_data),
            ],
        )?;
        value_to_bytes(&data)?
    };

    let tokens = abi_decode(&schema.param_types(), &bytes)
        .map_err(|e| PipelineError::BadInput(format!("abi decode failed: {e}")))?;

    let mut out = BTreeMap::new();
    for (arg, token) in schema.args.iter().zip(tokens) {
        out.insert(arg.name.clone(), token_to_value(token));
    }
    Ok(Value::Map(out))
}

/// Decode an event log: indexed params come from `topics[1..]`, the rest from
/// `data`.
pub fn run_decode_log(node: &Node, vars: &Vars, inputs: &[TaskResult]) -> TaskResult {
    let input_values = check_inputs(inputs, None, Some(1), 0)?;
    let schema = schema_from_node(node)?;

    // data/topics either from the input map or from parameters
    let (data, topics) = if let Some(value) = input_values.first() {
        let map = value.as_map()?;
        let data = map
            .get("data")
            .ok_or_else(|| PipelineError::ParameterEmpty("data".to_string()))?;
        let topics = map
            .get("topics")
            .ok_or_else(|| PipelineError::ParameterEmpty("topics".to_string()))?;
        (value_to_bytes(data)?, topics_to_bytes(topics)?)
    } else {
        let raw_data = node.attr("data").unwrap_or_default();
        let raw_topics = node.attr("topics").unwrap_or_default();
        let data = crate::pipeline::vars::resolve(
            "data",
            &[
                Source::VarExpr(raw_data, vars),
                Source::NonemptyString(raw_data),
            ],
        )?;
        let topics = crate::pipeline::vars::resolve(
            "topics",
            &[
                Source::VarExpr(raw_topics, vars),
                Source::JsonWithVars(raw_topics, vars),
            ],
        )?;
        (value_to_bytes(&data)?, topics_to_bytes(&topics)?)
    };

    let mut out = BTreeMap::new();

    let indexed: Vec<&AbiArg> = schema.args.iter().filter(|a| a.indexed).collect();
    // topics[0] is the event signature hash
    for (i, arg) in indexed.iter().enumerate() {
        let topic = topics
            .get(i + 1)
            .ok_or_else(|| PipelineError::BadInput(format!("missing topic for {}", arg.name)))?;
        let value = match &arg.kind {
            // dynamic indexed params are stored as their hash; surface the raw topic
            ParamType::String | ParamType::Bytes | ParamType::Array(_) => {
                Value::Bytes(topic.clone())
            }
            kind => {
                let tokens = abi_decode(&[kind.clone()], topic)
                    .map_err(|e| PipelineError::BadInput(format!("bad topic: {e}")))?;
                token_to_value(tokens.into_iter().next().unwrap_or(Token::Bool(false)))
            }
        };
        out.insert(arg.name.clone(), value);
    }

    let unindexed: Vec<&AbiArg> = schema.args.iter().filter(|a| !a.indexed).collect();
    let types: Vec<ParamType> = unindexed.iter().map(|a| a.kind.clone()).collect();
    let tokens = abi_decode(&types, &data)
        .map_err(|e| PipelineError::BadInput(format!("abi decode failed: {e}")))?;
    for (arg, token) in unindexed.iter().zip(tokens) {
        out.insert(arg.name.clone(), token_to_value(token));
    }

    Ok(Value::Map(out))
}

fn topics_to_bytes(value: &Value) -> Result<Vec<Vec<u8>>, PipelineError> {
    match value {
        Value::Array(items) => items.iter().map(value_to_bytes).collect(),
        other => Err(PipelineError::BadInput(format!(
            "topics must be an array, got {other:?}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::Graph;
    use rust_decimal_macros::dec;

    fn node(src: &str) -> Node {
        Graph::parse(src).unwrap().nodes.remove(0)
    }

    #[test]
    fn schema_parsing() {
        let schema = AbiSchema::parse("transfer(address to, uint256 amount)").unwrap();
        assert_eq!(schema.method.as_deref(), Some("transfer"));
        assert_eq!(schema.canonical(), "transfer(address,uint256)");
        assert_eq!(schema.args.len(), 2);
        assert_eq!(schema.args[0].kind, ParamType::Address);
        assert_eq!(schema.args[1].kind, ParamType::Uint(256));
    }

    #[test]
    fn encode_decode_round_trip() {
        let encode_node = node(
            r#"enc [type=ethabiencode abi="(uint256 value, bool flag)" data="{\"value\": 42, \"flag\": true}"];"#,
        );
        let encoded = run_encode(&encode_node, &Vars::new(), &[]).unwrap();
        let bytes = match &encoded {
            Value::Bytes(b) => b.clone(),
            other => panic!("expected bytes, got {other:?}"),
        };
        assert_eq!(bytes.len(), 64);

        let decode_node = node(r#"dec [type=ethabidecode abi="(uint256 value, bool flag)"];"#);
        let decoded =
            run_decode(&decode_node, &Vars::new(), &[Ok(Value::Bytes(bytes))]).unwrap();
        let map = decoded.as_map().unwrap();
        assert_eq!(map["value"], Value::Decimal(dec!(42)));
        assert_eq!(map["flag"], Value::Bool(true));
    }

    #[test]
    fn encode_with_method_prepends_selector() {
        let n = node(
            r#"enc [type=ethabiencode abi="store(uint256 value)" data="{\"value\": 1}"];"#,
        );
        let encoded = run_encode(&n, &Vars::new(), &[]).unwrap();
        let bytes = match encoded {
            Value::Bytes(b) => b,
            other => panic!("expected bytes, got {other:?}"),
        };
        // 4-byte selector + one word
        assert_eq!(bytes.len(), 36);
        let selector = &keccak256("store(uint256)".as_bytes())[..4];
        assert_eq!(&bytes[..4], selector);
    }

    #[test]
    fn rejects_unsupported_schema_types() {
        assert!(AbiSchema::parse("f(tensor x)").is_err());
        assert!(AbiSchema::parse("no parens").is_err());
    }

    #[test]
    fn uint_rejects_fractional_values() {
        let err = value_to_token(&Value::Decimal(dec!(1.5)), &ParamType::Uint(256)).unwrap_err();
        assert!(matches!(err, PipelineError::BadInput(_)));
    }
}
