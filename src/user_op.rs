//! ERC-4337 (EntryPoint v0.6) user operations carried in payment headers.
//!
//! [`validate_structure`] turns a decoded [`HeaderRecord`] into a typed
//! [`UserOperation`]. Byte fields must be `0x`-prefixed hex with an even digit
//! count. Quantities may be decimal strings, `0x`-hex strings or JSON integers.

use alloy_primitives::{Address, Bytes, U256};
use serde::Serialize;
use serde_json::Value;

use crate::header::HeaderRecord;

/// Field names that every payment header must carry, in reporting order.
pub const REQUIRED_FIELDS: [&str; 9] = [
    "sender",
    "nonce",
    "callData",
    "callGasLimit",
    "verificationGasLimit",
    "preVerificationGas",
    "maxFeePerGas",
    "maxPriorityFeePerGas",
    "signature",
];

/// Length of an ECDSA `r || s || v` signature.
const MIN_SIGNATURE_LEN: usize = 65;

/// A v0.6 user operation.
///
/// Serializes in JSON-RPC form (quantities as `0x`-hex), which is what bundlers
/// and the gas manager expect.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UserOperation {
    pub sender: Address,
    pub nonce: U256,
    pub init_code: Bytes,
    pub call_data: Bytes,
    pub call_gas_limit: U256,
    pub verification_gas_limit: U256,
    pub pre_verification_gas: U256,
    pub max_fee_per_gas: U256,
    pub max_priority_fee_per_gas: U256,
    pub paymaster_and_data: Bytes,
    pub signature: Bytes,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StructuralError {
    #[error("Invalid UserOp: missing required field '{0}'")]
    MissingField(&'static str),
    #[error("Invalid UserOp: '{0}' must be a hex string")]
    NotHex(&'static str),
    #[error("Invalid UserOp: '{0}' must not be empty")]
    EmptyBytes(&'static str),
    #[error("Invalid UserOp: '{0}' must be a 20-byte address")]
    InvalidAddress(&'static str),
    #[error("Invalid UserOp: '{0}' must be a non-negative integer")]
    InvalidQuantity(&'static str),
    #[error("UserOp signature is empty")]
    EmptySignature,
    #[error("UserOp signature is too short: {0} bytes")]
    ShortSignature(usize),
}

impl UserOperation {
    /// Short `sender...nonce` label for logs. Not a cryptographic hash.
    pub fn tag(&self) -> String {
        let sender = format!("{:#x}", self.sender);
        format!("{}...{}", &sender[..10], self.nonce)
    }

    /// Copy of this operation with sponsor-provided paymaster data.
    pub fn with_paymaster_and_data(&self, paymaster_and_data: Bytes) -> Self {
        Self {
            paymaster_and_data,
            ..self.clone()
        }
    }

    /// Shape-only signature check: non-empty, not a lone zero byte, at least 65 bytes.
    ///
    /// Recovering the signer against the account is not performed here.
    pub fn check_signature_shape(&self) -> Result<(), StructuralError> {
        let signature = &self.signature[..];
        if signature.is_empty() || signature == [0u8].as_slice() {
            return Err(StructuralError::EmptySignature);
        }
        if signature.len() < MIN_SIGNATURE_LEN {
            return Err(StructuralError::ShortSignature(signature.len()));
        }
        Ok(())
    }
}

/// Checks presence and types of every field, without touching the input.
pub fn validate_structure(record: &HeaderRecord) -> Result<UserOperation, StructuralError> {
    if let Some(missing) = REQUIRED_FIELDS
        .iter()
        .find(|field| !record.contains_key(**field))
    {
        return Err(StructuralError::MissingField(missing));
    }

    let sender = required_bytes(record, "sender")?;
    let call_data = required_bytes(record, "callData")?;
    let signature = required_bytes(record, "signature")?;
    let init_code = optional_bytes(record, "initCode")?;
    let paymaster_and_data = optional_bytes(record, "paymasterAndData")?;

    if sender.len() != 20 {
        return Err(StructuralError::InvalidAddress("sender"));
    }

    Ok(UserOperation {
        sender: Address::from_slice(&sender),
        nonce: quantity(record, "nonce")?,
        init_code,
        call_data,
        call_gas_limit: quantity(record, "callGasLimit")?,
        verification_gas_limit: quantity(record, "verificationGasLimit")?,
        pre_verification_gas: quantity(record, "preVerificationGas")?,
        max_fee_per_gas: quantity(record, "maxFeePerGas")?,
        max_priority_fee_per_gas: quantity(record, "maxPriorityFeePerGas")?,
        paymaster_and_data,
        signature,
    })
}

fn hex_bytes(value: &Value, field: &'static str) -> Result<Bytes, StructuralError> {
    let digits = value
        .as_str()
        .and_then(|s| s.strip_prefix("0x"))
        .ok_or(StructuralError::NotHex(field))?;
    let bytes = hex::decode(digits).map_err(|_| StructuralError::NotHex(field))?;
    Ok(Bytes::from(bytes))
}

fn required_bytes(record: &HeaderRecord, field: &'static str) -> Result<Bytes, StructuralError> {
    let value = record
        .get(field)
        .ok_or(StructuralError::MissingField(field))?;
    let bytes = hex_bytes(value, field)?;
    if bytes.is_empty() {
        return Err(StructuralError::EmptyBytes(field));
    }
    Ok(bytes)
}

/// Absent or `"0x"` both mean empty.
fn optional_bytes(record: &HeaderRecord, field: &'static str) -> Result<Bytes, StructuralError> {
    match record.get(field) {
        None => Ok(Bytes::new()),
        Some(value) => hex_bytes(value, field),
    }
}

fn quantity(record: &HeaderRecord, field: &'static str) -> Result<U256, StructuralError> {
    let value = record
        .get(field)
        .ok_or(StructuralError::MissingField(field))?;
    let parsed = match value {
        Value::String(s) => match s.strip_prefix("0x") {
            Some("") => None,
            Some(hex) => U256::from_str_radix(hex, 16).ok(),
            None if s.is_empty() => None,
            None if s.bytes().all(|b| b.is_ascii_digit()) => U256::from_str_radix(s, 10).ok(),
            None => None,
        },
        Value::Number(n) => n.as_u64().map(U256::from),
        _ => None,
    };
    parsed.ok_or(StructuralError::InvalidQuantity(field))
}
