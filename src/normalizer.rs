use alloy_primitives::U256;
use serde_json::Value;
use thiserror::Error;

use crate::types::{PendingTx, TxStatus};

/// spec.md §7 taxonomy: a malformed or incomplete raw transaction payload.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum NormalizationError {
    #[error("missing field `{0}`")]
    MissingField(&'static str),
    #[error("field `{field}` is not valid hex: {value}")]
    BadHex { field: &'static str, value: String },
}

/// Decode a raw upstream transaction object into the canonical record.
///
/// Pure: everything it needs comes from `raw` and `chain_id`, except the
/// ingestion-time `timestamp`, which is set to "now" at the moment of
/// decode (spec.md §4.1).
pub fn normalize(
    raw: &Value,
    chain_id: u64,
    status: TxStatus,
) -> Result<PendingTx, NormalizationError> {
    let hash = required_str(raw, "hash")?;
    let from = required_str(raw, "from")?;
    let to = optional_address(raw, "to");

    let value = hex_or_zero(raw, "value")?;
    let gas_limit = hex_or_zero(raw, "gas")
        .or_else(|_| hex_or_zero(raw, "gasLimit"))?;

    let gas_price_field = hex_opt(raw, "gasPrice")?;
    let max_fee_per_gas = hex_opt(raw, "maxFeePerGas")?;
    let max_priority_fee_per_gas = hex_opt(raw, "maxPriorityFeePerGas")?;

    // Effective gasPrice: first defined of gasPrice, maxFeePerGas, 0.
    let gas_price = gas_price_field
        .clone()
        .or_else(|| max_fee_per_gas.clone())
        .unwrap_or(U256::ZERO);

    let nonce = hex_or_zero(raw, "nonce")?;
    let nonce: u64 = nonce.try_into().unwrap_or(u64::MAX);

    let tx_type = raw
        .get("type")
        .and_then(Value::as_str)
        .map(|s| decode_hex_u64(s, "type"))
        .transpose()?
        .map(|t| if t == 0 || t == 2 { t as u8 } else { 0 })
        .unwrap_or(0);

    let input = raw
        .get("input")
        .and_then(Value::as_str)
        .unwrap_or("0x")
        .to_string();

    Ok(PendingTx {
        hash: hash.to_lowercase(),
        chain_id,
        from: from.to_lowercase(),
        to,
        value: value.to_string(),
        gas_price: gas_price.to_string(),
        gas_limit: gas_limit.to_string(),
        max_fee_per_gas: max_fee_per_gas.map(|v| v.to_string()),
        max_priority_fee_per_gas: max_priority_fee_per_gas.map(|v| v.to_string()),
        input,
        nonce,
        tx_type,
        timestamp: chrono::Utc::now(),
        status,
    })
}

fn required_str<'a>(raw: &'a Value, field: &'static str) -> Result<&'a str, NormalizationError> {
    raw.get(field)
        .and_then(Value::as_str)
        .ok_or(NormalizationError::MissingField(field))
}

/// `to` is either a 20-byte hex string or JSON `null`; both collapse to the
/// canonical "absent" representation.
fn optional_address(raw: &Value, field: &'static str) -> Option<String> {
    match raw.get(field) {
        Some(Value::String(s)) => Some(s.to_lowercase()),
        _ => None,
    }
}

fn hex_opt(raw: &Value, field: &'static str) -> Result<Option<U256>, NormalizationError> {
    match raw.get(field) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(decode_hex_u256(s, field)?)),
        Some(_) => Err(NormalizationError::BadHex {
            field,
            value: raw.get(field).map(|v| v.to_string()).unwrap_or_default(),
        }),
    }
}

fn hex_or_zero(raw: &Value, field: &'static str) -> Result<U256, NormalizationError> {
    Ok(hex_opt(raw, field)?.unwrap_or(U256::ZERO))
}

fn decode_hex_u256(s: &str, field: &'static str) -> Result<U256, NormalizationError> {
    let trimmed = s.strip_prefix("0x").unwrap_or(s);
    let trimmed = if trimmed.is_empty() { "0" } else { trimmed };
    U256::from_str_radix(trimmed, 16).map_err(|_| NormalizationError::BadHex {
        field,
        value: s.to_string(),
    })
}

fn decode_hex_u64(s: &str, field: &'static str) -> Result<u64, NormalizationError> {
    let v = decode_hex_u256(s, field)?;
    Ok(v.try_into().unwrap_or(u64::MAX))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample() -> Value {
        json!({
            "hash": "0xa000000000000000000000000000000000000000000000000000000000000a",
            "from": "0x0100000000000000000000000000000000000001",
            "to": "0x0200000000000000000000000000000000000002",
            "value": "0xde0b6b3a7640000",
            "gas": "0x5208",
            "gasPrice": "0x4a817c800",
            "input": "0x",
            "nonce": "0x5",
            "type": "0x0",
        })
    }

    #[test]
    fn s1_full_pending_happy_path() {
        let tx = normalize(&sample(), 1, TxStatus::Pending).unwrap();
        assert_eq!(tx.value, "1000000000000000000");
        assert_eq!(tx.gas_limit, "21000");
        assert_eq!(tx.gas_price, "20000000000");
        assert_eq!(tx.status, TxStatus::Pending);
        assert_eq!(tx.chain_id, 1);
    }

    #[test]
    fn missing_to_is_absent() {
        let mut raw = sample();
        raw.as_object_mut().unwrap().remove("to");
        let tx = normalize(&raw, 1, TxStatus::Pending).unwrap();
        assert_eq!(tx.to, None);

        let mut raw_null = sample();
        raw_null["to"] = Value::Null;
        let tx = normalize(&raw_null, 1, TxStatus::Pending).unwrap();
        assert_eq!(tx.to, None);
    }

    #[test]
    fn value_zero_renders_as_zero_string() {
        let mut raw = sample();
        raw["value"] = json!("0x0");
        let tx = normalize(&raw, 1, TxStatus::Pending).unwrap();
        assert_eq!(tx.value, "0");
    }

    #[test]
    fn type_absent_or_unknown_collapses_to_zero() {
        let mut raw = sample();
        raw.as_object_mut().unwrap().remove("type");
        let tx = normalize(&raw, 1, TxStatus::Pending).unwrap();
        assert_eq!(tx.tx_type, 0);

        raw["type"] = json!("0x7f");
        let tx = normalize(&raw, 1, TxStatus::Pending).unwrap();
        assert_eq!(tx.tx_type, 0);
    }

    #[test]
    fn gas_price_falls_back_to_max_fee_per_gas() {
        let mut raw = sample();
        raw.as_object_mut().unwrap().remove("gasPrice");
        raw["maxFeePerGas"] = json!("0x3b9aca00");
        let tx = normalize(&raw, 1, TxStatus::Pending).unwrap();
        assert_eq!(tx.gas_price, tx.max_fee_per_gas.clone().unwrap());
        assert_eq!(tx.gas_price, "1000000000");
    }

    #[test]
    fn missing_hash_is_an_error() {
        let mut raw = sample();
        raw.as_object_mut().unwrap().remove("hash");
        let err = normalize(&raw, 1, TxStatus::Pending).unwrap_err();
        assert_eq!(err, NormalizationError::MissingField("hash"));
    }

    #[test]
    fn missing_from_is_an_error() {
        let mut raw = sample();
        raw.as_object_mut().unwrap().remove("from");
        let err = normalize(&raw, 1, TxStatus::Pending).unwrap_err();
        assert_eq!(err, NormalizationError::MissingField("from"));
    }

    #[test]
    fn bad_hex_numeric_field_is_an_error() {
        let mut raw = sample();
        raw["value"] = json!("not-hex");
        let err = normalize(&raw, 1, TxStatus::Pending).unwrap_err();
        assert!(matches!(err, NormalizationError::BadHex { field: "value", .. }));
    }

    #[test]
    fn p5_stable_modulo_timestamp() {
        let raw = sample();
        let a = normalize(&raw, 1, TxStatus::Pending).unwrap();
        let b = normalize(&raw, 1, TxStatus::Pending).unwrap();
        assert_eq!(a.hash, b.hash);
        assert_eq!(a.value, b.value);
        assert_eq!(a.gas_price, b.gas_price);
        assert_eq!(a.gas_limit, b.gas_limit);
        assert_eq!(a.nonce, b.nonce);
        assert_eq!(a.tx_type, b.tx_type);
        assert_eq!(a.status, b.status);
    }

    #[test]
    fn p6_base10_rendering_round_trips_full_256_bit_range() {
        let max_hex = "f".repeat(64);
        let mut raw = sample();
        raw["value"] = json!(format!("0x{max_hex}"));
        let tx = normalize(&raw, 1, TxStatus::Pending).unwrap();
        assert_eq!(tx.value, U256::MAX.to_string());
    }
}
