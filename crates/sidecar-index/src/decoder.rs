//! Runtime ABI decoding of event logs and transaction input.
//!
//! ABIs arrive as JSON at runtime (explorer lookups, lookalike contracts),
//! so decoding goes through `alloy::dyn_abi` rather than `sol!` bindings.
//! Missing ABIs and unknown selectors are not errors: the log keeps its raw
//! topic hash as event name, the call its `"unknown"` method name.

use alloy::dyn_abi::{DynSolType, DynSolValue, Specifier};
use alloy::hex;
use alloy::json_abi::{EventParam, JsonAbi, Param};
use alloy::primitives::B256;
use serde_json::{Map, Value};

use sidecar_data::chain::EthereumLog;
use sidecar_data::types::LogArgument;

/// Method name recorded when a selector is not in the ABI.
pub const UNKNOWN_METHOD: &str = "unknown";

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    /// A hex field could not be decoded.
    #[error("invalid hex in {field}: {value}")]
    InvalidHex { field: &'static str, value: String },
    /// A topic was not a 32-byte word.
    #[error("topic is not a 32-byte word: {0}")]
    BadTopic(String),
    /// A bool word was not `0x00..00` or `0x00..01`.
    #[error("abi: improperly encoded boolean value")]
    BadBool,
    /// ABI unpacking of log data or call data failed.
    #[error("failed to unpack: {0}")]
    Unpack(String),
    /// The ABI JSON could not be parsed.
    #[error("invalid ABI: {0}")]
    InvalidAbi(String),
}

/// A log with its event resolved against an ABI.
#[derive(Clone, Debug, PartialEq)]
pub struct DecodedLog {
    pub address: String,
    pub log_index: u64,
    /// Event name, or the `0x`-prefixed topic0 hash when unresolved.
    pub event_name: String,
    /// Every event input in declaration order. Indexed inputs carry the
    /// topic value; unindexed inputs are `null` here and live in
    /// `output_data`.
    pub arguments: Vec<LogArgument>,
    pub output_data: Map<String, Value>,
}

/// Decoded transaction call data.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct DecodedInput {
    pub method_name: String,
    pub arguments: Map<String, Value>,
}

/// Parses a JSON ABI, possibly the concatenation of several contracts' ABIs.
///
/// Only the first constructor, fallback and receive entry is kept, since a
/// combined ABI commonly repeats them.
///
/// # Errors
/// Returns [`DecodeError::InvalidAbi`] if the JSON is not an ABI array.
pub fn parse_abi(json: &str) -> Result<JsonAbi, DecodeError> {
    let items: Vec<Value> =
        serde_json::from_str(json).map_err(|err| DecodeError::InvalidAbi(err.to_string()))?;

    let mut seen_singletons: Vec<String> = Vec::new();
    let items: Vec<Value> = items
        .into_iter()
        .filter(|item| {
            let kind = item.get("type").and_then(Value::as_str).unwrap_or_default();
            if !matches!(kind, "constructor" | "fallback" | "receive") {
                return true;
            }
            if seen_singletons.iter().any(|seen| seen == kind) {
                return false;
            }
            seen_singletons.push(kind.to_string());
            true
        })
        .collect();

    serde_json::from_value(Value::Array(items)).map_err(|err| DecodeError::InvalidAbi(err.to_string()))
}

fn decode_hex(field: &'static str, value: &str) -> Result<Vec<u8>, DecodeError> {
    hex::decode(value.trim_start_matches("0x")).map_err(|_| DecodeError::InvalidHex {
        field,
        value: value.to_string(),
    })
}

fn decode_topic(topic: &str) -> Result<B256, DecodeError> {
    let bytes = decode_hex("topic", topic)?;
    if bytes.len() != 32 {
        return Err(DecodeError::BadTopic(topic.to_string()));
    }
    Ok(B256::from_slice(&bytes))
}

/// Strict ABI bool: 31 zero bytes followed by `0x00` or `0x01`.
pub fn read_bool(word: &[u8]) -> Result<bool, DecodeError> {
    if word.len() != 32 || word[..31].iter().any(|byte| *byte != 0) {
        return Err(DecodeError::BadBool);
    }
    match word[31] {
        0 => Ok(false),
        1 => Ok(true),
        _ => Err(DecodeError::BadBool),
    }
}

/// Decodes one indexed topic according to the parameter type.
///
/// Integers, bools and addresses are decoded. Strings, bytes and every
/// other type are hashed when indexed, so the topic is kept as hex.
pub fn parse_log_value_for_type(param: &EventParam, topic: &str) -> Result<Value, DecodeError> {
    let word = decode_topic(topic)?;
    let ty: Option<DynSolType> = param.resolve().ok();
    match ty {
        Some(DynSolType::Bool) => read_bool(word.as_slice()).map(Value::Bool),
        Some(ty @ (DynSolType::Address | DynSolType::Uint(_) | DynSolType::Int(_))) => {
            let value = ty
                .abi_decode(word.as_slice())
                .map_err(|err| DecodeError::Unpack(err.to_string()))?;
            Ok(dyn_value_to_json(&value))
        }
        _ => Ok(Value::String(topic.to_lowercase())),
    }
}

/// JSON rendering used for decoded values: integers as decimal strings,
/// addresses and byte strings as lowercase `0x` hex.
pub fn dyn_value_to_json(value: &DynSolValue) -> Value {
    match value {
        DynSolValue::Bool(b) => Value::Bool(*b),
        DynSolValue::Int(i, _) => Value::String(i.to_string()),
        DynSolValue::Uint(u, _) => Value::String(u.to_string()),
        DynSolValue::FixedBytes(word, size) => {
            Value::String(format!("0x{}", hex::encode(&word[..(*size).min(32)])))
        }
        DynSolValue::Address(address) => Value::String(format!("{address:#x}")),
        DynSolValue::Bytes(bytes) => Value::String(format!("0x{}", hex::encode(bytes))),
        DynSolValue::String(s) => Value::String(s.clone()),
        DynSolValue::Array(items) | DynSolValue::FixedArray(items) | DynSolValue::Tuple(items) => {
            Value::Array(items.iter().map(dyn_value_to_json).collect())
        }
        DynSolValue::Function(function) => {
            Value::String(format!("0x{}", hex::encode(function.as_slice())))
        }
        #[allow(unreachable_patterns)]
        other => Value::String(format!("{other:?}")),
    }
}

/// Like [`dyn_value_to_json`], but tuples whose `components` are all named
/// become objects keyed by those names.
fn named_value_to_json(value: &DynSolValue, components: &[Param]) -> Value {
    match value {
        DynSolValue::Tuple(items)
            if items.len() == components.len()
                && components.iter().all(|component| !component.name.is_empty()) =>
        {
            Value::Object(
                items
                    .iter()
                    .zip(components)
                    .map(|(item, component)| {
                        (component.name.clone(), named_value_to_json(item, &component.components))
                    })
                    .collect(),
            )
        }
        DynSolValue::Array(items) | DynSolValue::FixedArray(items) if !components.is_empty() => {
            Value::Array(items.iter().map(|item| named_value_to_json(item, components)).collect())
        }
        other => dyn_value_to_json(other),
    }
}

fn resolve_types<'a, P: Specifier<DynSolType> + 'a>(
    params: impl Iterator<Item = &'a P>,
) -> Result<Vec<DynSolType>, DecodeError> {
    params
        .map(|param| param.resolve().map_err(|err| DecodeError::Unpack(err.to_string())))
        .collect()
}

/// Whether `ty` is dynamically sized in the ABI encoding.
fn is_dynamic(ty: &DynSolType) -> bool {
    match ty {
        DynSolType::Bool
        | DynSolType::Int(_)
        | DynSolType::Uint(_)
        | DynSolType::FixedBytes(_)
        | DynSolType::Address
        | DynSolType::Function => false,
        DynSolType::Bytes | DynSolType::String | DynSolType::Array(_) => true,
        DynSolType::FixedArray(inner, _) => is_dynamic(inner),
        DynSolType::Tuple(types) => types.iter().any(is_dynamic),
    }
}

/// Number of 32-byte head words `ty` occupies inside a tuple encoding.
fn head_words(ty: &DynSolType) -> usize {
    if is_dynamic(ty) {
        return 1;
    }
    match ty {
        DynSolType::Tuple(types) => types.iter().map(head_words).sum(),
        DynSolType::FixedArray(inner, len) => head_words(inner) * len,
        _ => 1,
    }
}

fn word_at(data: &[u8], pos: usize) -> Result<&[u8], DecodeError> {
    data.get(pos..pos + 32)
        .ok_or_else(|| DecodeError::Unpack(format!("word at {pos} is out of bounds")))
}

fn offset_at(data: &[u8], pos: usize) -> Result<usize, DecodeError> {
    let word = word_at(data, pos)?;
    if word[..24].iter().any(|byte| *byte != 0) {
        return Err(DecodeError::Unpack(format!("offset at {pos} is too large")));
    }
    let mut low = [0u8; 8];
    low.copy_from_slice(&word[24..]);
    usize::try_from(u64::from_be_bytes(low))
        .map_err(|_| DecodeError::Unpack(format!("offset at {pos} is too large")))
}

/// Checks every bool word of a tuple encoded at `start`.
fn check_tuple_bools<'a>(
    types: impl IntoIterator<Item = &'a DynSolType>,
    data: &[u8],
    start: usize,
) -> Result<(), DecodeError> {
    let mut head = start;
    for ty in types {
        check_bools(ty, data, start, head)?;
        head += head_words(ty) * 32;
    }
    Ok(())
}

/// Rejects bool words that are not exactly `0` or `1`, which the
/// dynamic decoder would otherwise read as `true`.
fn check_bools(ty: &DynSolType, data: &[u8], base: usize, head: usize) -> Result<(), DecodeError> {
    match ty {
        DynSolType::Bool => read_bool(word_at(data, head)?).map(|_| ()),
        DynSolType::Array(inner) => {
            let start = base + offset_at(data, head)?;
            let len = offset_at(data, start)?;
            check_tuple_bools(std::iter::repeat(inner.as_ref()).take(len), data, start + 32)
        }
        DynSolType::FixedArray(inner, len) => {
            let start = if is_dynamic(ty) { base + offset_at(data, head)? } else { head };
            check_tuple_bools(std::iter::repeat(inner.as_ref()).take(*len), data, start)
        }
        DynSolType::Tuple(types) => {
            let start = if is_dynamic(ty) { base + offset_at(data, head)? } else { head };
            check_tuple_bools(types.iter(), data, start)
        }
        _ => Ok(()),
    }
}

/// ABI-unpacks `data` into a `name → value` map.
fn unpack_into_map(
    names: &[String],
    components: &[&[Param]],
    types: Vec<DynSolType>,
    data: &[u8],
) -> Result<Map<String, Value>, DecodeError> {
    check_tuple_bools(types.iter(), data, 0)?;
    let decoded = DynSolType::Tuple(types)
        .abi_decode_params(data)
        .map_err(|err| DecodeError::Unpack(err.to_string()))?;
    let values = match decoded {
        DynSolValue::Tuple(values) => values,
        other => vec![other],
    };

    Ok(names
        .iter()
        .zip(values.iter())
        .zip(components)
        .map(|((name, value), components)| (name.clone(), named_value_to_json(value, components)))
        .collect())
}

fn param_name(name: &str, index: usize) -> String {
    if name.is_empty() {
        format!("arg{index}")
    } else {
        name.to_string()
    }
}

/// Decodes `log` with `abi`.
///
/// With no ABI, or when the ABI has no event for topic0, the result carries
/// the topic0 hash as event name and no arguments. A topic0 that is not a
/// 32-byte word is kept verbatim (lowercased) and never matches an event.
///
/// # Errors
/// Returns [`DecodeError`] for malformed indexed topics, bool words or data
/// of an event found in `abi`.
pub fn decode_log(abi: Option<&JsonAbi>, log: &EthereumLog) -> Result<DecodedLog, DecodeError> {
    let topic_hash = match log.topics.first() {
        Some(topic) => decode_topic(topic).ok(),
        None => Some(B256::ZERO),
    };
    let event_name = match (topic_hash, log.topics.first()) {
        (Some(hash), _) => format!("{hash:#x}"),
        (None, Some(raw)) => raw.to_lowercase(),
        (None, None) => format!("{:#x}", B256::ZERO),
    };

    let mut decoded = DecodedLog {
        address: log.address.to_lowercase(),
        log_index: log.log_index,
        event_name,
        arguments: Vec::new(),
        output_data: Map::new(),
    };

    let (Some(abi), Some(topic_hash)) = (abi, topic_hash) else {
        return Ok(decoded);
    };
    let Some(event) = abi
        .events()
        .find(|event| !event.anonymous && event.selector() == topic_hash)
    else {
        tracing::debug!(topic = %topic_hash, address = %log.address, "event not found in ABI");
        return Ok(decoded);
    };

    decoded.event_name = event.name.clone();
    decoded.arguments = event
        .inputs
        .iter()
        .enumerate()
        .map(|(index, input)| LogArgument {
            name: param_name(&input.name, index),
            kind: input.ty.clone(),
            value: Value::Null,
            indexed: input.indexed,
        })
        .collect();

    let mut topics = log.topics.iter().skip(1);
    for (index, input) in event.inputs.iter().enumerate().filter(|(_, input)| input.indexed) {
        let Some(topic) = topics.next() else {
            break;
        };
        decoded.arguments[index].value = parse_log_value_for_type(input, topic)?;
    }

    let data = decode_hex("data", &log.data)?;
    if !data.is_empty() {
        let body: Vec<(usize, &EventParam)> = event
            .inputs
            .iter()
            .enumerate()
            .filter(|(_, input)| !input.indexed)
            .collect();
        let names: Vec<String> = body
            .iter()
            .map(|(index, input)| param_name(&input.name, *index))
            .collect();
        let components: Vec<&[Param]> = body.iter().map(|(_, input)| input.components.as_slice()).collect();
        let types = resolve_types(body.iter().map(|(_, input)| *input))?;
        decoded.output_data = unpack_into_map(&names, &components, types, &data)?;
    }

    Ok(decoded)
}

/// Decodes transaction call data against `abi`.
///
/// Returns `None` when the input is too short to carry a selector, and a
/// [`UNKNOWN_METHOD`] result when the selector is not in the ABI.
///
/// # Errors
/// Returns [`DecodeError`] if the input is not hex or the arguments do not
/// unpack.
pub fn decode_transaction_input(abi: &JsonAbi, input: &str) -> Result<Option<DecodedInput>, DecodeError> {
    if input.len() < 10 {
        return Ok(None);
    }
    let bytes = decode_hex("input", input)?;
    if bytes.len() < 4 {
        return Ok(None);
    }

    let Some(function) = abi
        .functions()
        .find(|function| function.selector().as_slice() == &bytes[..4])
    else {
        return Ok(Some(DecodedInput {
            method_name: UNKNOWN_METHOD.to_string(),
            arguments: Map::new(),
        }));
    };

    let names: Vec<String> = function
        .inputs
        .iter()
        .enumerate()
        .map(|(index, input)| param_name(&input.name, index))
        .collect();
    let components: Vec<&[Param]> = function
        .inputs
        .iter()
        .map(|input| input.components.as_slice())
        .collect();
    let types = resolve_types(function.inputs.iter())?;
    let arguments = unpack_into_map(&names, &components, types, &bytes[4..])?;

    Ok(Some(DecodedInput {
        method_name: function.name.clone(),
        arguments,
    }))
}
