//! Helpers shared by the state models.

use alloy::hex;
use alloy::primitives::{I256, U256};
use eyre::{eyre, Context, Result};
use serde_json::Value;
use std::collections::HashMap;

use sidecar_data::types::TransactionLog;

/// Contract address → event names a model reacts to.
#[derive(Clone, Debug, Default)]
pub struct InterestingLogs {
    by_address: HashMap<String, Vec<String>>,
}

impl InterestingLogs {
    pub fn new(entries: &[(&str, &[&str])]) -> Self {
        let by_address = entries
            .iter()
            .map(|(address, events)| {
                (
                    address.to_lowercase(),
                    events.iter().map(|event| event.to_string()).collect(),
                )
            })
            .collect();
        Self { by_address }
    }

    /// Address comparison is case-insensitive; event names are exact.
    pub fn matches(&self, log: &TransactionLog) -> bool {
        self.by_address
            .get(&log.address.to_lowercase())
            .is_some_and(|events| events.iter().any(|event| *event == log.event_name))
    }
}

/// Slot id of a row derived from a single log.
pub fn slot_id(transaction_hash: &str, log_index: u64) -> String {
    format!("{transaction_hash}_{log_index:016x}")
}

/// Reads an integer carried as a JSON number, a decimal string or a
/// `0x` hex string.
pub fn value_as_u64(value: &Value, field: &str) -> Result<u64> {
    match value {
        Value::Number(number) => number
            .as_u64()
            .ok_or_else(|| eyre!("{field} is not an unsigned integer: {number}")),
        Value::String(text) => match text.strip_prefix("0x") {
            Some(hex_digits) => u64::from_str_radix(hex_digits, 16)
                .wrap_err_with(|| format!("{field} is not valid hex: {text}")),
            None => text
                .parse()
                .wrap_err_with(|| format!("{field} is not a number: {text}")),
        },
        other => Err(eyre!("{field} has unexpected type: {other}")),
    }
}

/// Normalizes an arbitrary-size unsigned integer to its decimal string.
pub fn value_as_decimal_string(value: &Value, field: &str) -> Result<String> {
    let text = match value {
        Value::Number(number) => match (number.as_u64(), number.as_f64()) {
            (Some(int), _) => int.to_string(),
            (None, Some(float)) if float >= 0.0 && float.fract() == 0.0 => format!("{float:.0}"),
            _ => return Err(eyre!("{field} is not an unsigned integer: {number}")),
        },
        Value::String(text) => text.clone(),
        other => return Err(eyre!("{field} has unexpected type: {other}")),
    };
    let parsed = match text.strip_prefix("0x") {
        Some(hex_digits) => U256::from_str_radix(hex_digits, 16),
        None => U256::from_str_radix(&text, 10),
    }
    .map_err(|err| eyre!("{field} is not a valid integer '{text}': {err}"))?;
    Ok(parsed.to_string())
}

/// Normalizes a signed integer (decimal string or JSON number) to its
/// decimal string.
pub fn value_as_signed_decimal(value: &Value, field: &str) -> Result<String> {
    let text = match value {
        Value::Number(number) => match number.as_i64() {
            Some(int) => int.to_string(),
            None => return Err(eyre!("{field} is not an integer: {number}")),
        },
        Value::String(text) => text.clone(),
        other => return Err(eyre!("{field} has unexpected type: {other}")),
    };
    let parsed = I256::from_dec_str(&text).map_err(|err| eyre!("{field} is not a valid integer '{text}': {err}"))?;
    Ok(parsed.to_string())
}

/// Lowercased string field of a decoded JSON object.
pub fn string_field(object: &Value, field: &str) -> Result<String> {
    object
        .get(field)
        .and_then(Value::as_str)
        .map(str::to_lowercase)
        .ok_or_else(|| eyre!("{field} is missing or not a string"))
}

/// Reads bytes carried either as a hex string or as a JSON array of byte
/// values, returning lowercase `0x` hex.
pub fn value_as_hex(value: &Value, field: &str) -> Result<String> {
    match value {
        Value::String(text) => Ok(text.to_lowercase()),
        Value::Array(items) => {
            let bytes = items
                .iter()
                .map(|item| {
                    item.as_u64()
                        .and_then(|byte| u8::try_from(byte).ok())
                        .ok_or_else(|| eyre!("{field} contains a non-byte value: {item}"))
                })
                .collect::<Result<Vec<u8>>>()?;
            Ok(format!("0x{}", hex::encode(bytes)))
        }
        other => Err(eyre!("{field} has unexpected type: {other}")),
    }
}

/// Required, lowercased address argument at `index`.
pub fn required_address(log: &TransactionLog, index: usize, field: &str) -> Result<String> {
    log.argument_str(index).ok_or_else(|| {
        eyre!(
            "{} log {}:{} is missing {field}",
            log.event_name,
            log.transaction_hash,
            log.log_index
        )
    })
}

/// Field of the log's unindexed output data, or an error naming it.
pub fn output_field<'a>(log: &'a TransactionLog, field: &str) -> Result<&'a Value> {
    log.output_data.get(field).ok_or_else(|| {
        eyre!(
            "{} log {}:{} has no output field {field}",
            log.event_name,
            log.transaction_hash,
            log.log_index
        )
    })
}
