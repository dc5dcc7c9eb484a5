//! Payment matching: does a decoded user operation pay what the seller asked for?
//!
//! Checks run in a fixed order and the first failure wins:
//! scheme, network, asset, transfer presence, recipient, amount.

use alloy_primitives::{Address, U256};

use crate::calldata::{TransferClaim, extract_transfer};
use crate::header::{self, DecodeError};
use crate::networks::NetworkRegistry;
use crate::proto::{PaymentRequirements, SCHEME, VerifyResponse};
use crate::user_op::{StructuralError, UserOperation, validate_structure};

#[derive(Debug, thiserror::Error)]
pub enum VerificationError {
    #[error("Failed to decode payment header: {0}")]
    Decode(#[from] DecodeError),
    #[error(transparent)]
    Structural(#[from] StructuralError),
    #[error("Unsupported payment scheme: {0}")]
    SchemeMismatch(String),
    #[error("Unsupported network: {0}")]
    NetworkUnsupported(String),
    #[error("USDC contract mismatch: expected {expected}, got {actual}")]
    AssetMismatch { expected: Address, actual: String },
    #[error("No valid transfer in operation")]
    TransferNotFound,
    #[error("Transfer recipient mismatch: expected {expected}, got {actual}")]
    RecipientMismatch { expected: String, actual: String },
    #[error("Transfer amount insufficient: required {required}, got {actual}")]
    InsufficientAmount { required: String, actual: U256 },
    #[error("Invalid maxAmountRequired: {0}")]
    InvalidRequiredAmount(String),
}

impl From<VerificationError> for VerifyResponse {
    fn from(error: VerificationError) -> Self {
        VerifyResponse::invalid(error.to_string())
    }
}

fn same_address(address: &Address, text: &str) -> bool {
    format!("{address:#x}").eq_ignore_ascii_case(text.trim())
}

/// Compares the transfer inside `op` against `requirements`. Pure.
pub fn match_payment<R: NetworkRegistry>(
    op: &UserOperation,
    requirements: &PaymentRequirements,
    registry: &R,
) -> Result<TransferClaim, VerificationError> {
    if requirements.scheme != SCHEME {
        return Err(VerificationError::SchemeMismatch(
            requirements.scheme.clone(),
        ));
    }

    let network = requirements.network.as_str();
    let expected_asset = registry
        .is_supported(network)
        .then(|| registry.canonical_asset(network))
        .flatten()
        .ok_or_else(|| VerificationError::NetworkUnsupported(network.to_string()))?;

    if !same_address(&expected_asset, &requirements.asset) {
        return Err(VerificationError::AssetMismatch {
            expected: expected_asset,
            actual: requirements.asset.clone(),
        });
    }

    let claim = extract_transfer(op).ok_or(VerificationError::TransferNotFound)?;

    if !same_address(&claim.recipient, &requirements.pay_to) {
        return Err(VerificationError::RecipientMismatch {
            expected: requirements.pay_to.clone(),
            actual: format!("{:#x}", claim.recipient),
        });
    }

    let text = requirements.max_amount_required.trim();
    if text.is_empty() || !text.bytes().all(|b| b.is_ascii_digit()) {
        return Err(VerificationError::InvalidRequiredAmount(
            requirements.max_amount_required.clone(),
        ));
    }

    // Digits beyond U256::MAX cannot be met by any transfer.
    let sufficient =
        U256::from_str_radix(text, 10).is_ok_and(|required| claim.amount >= required);
    if !sufficient {
        return Err(VerificationError::InsufficientAmount {
            required: text.trim_start_matches('0').to_string(),
            actual: claim.amount,
        });
    }

    Ok(claim)
}

/// Decodes, validates and matches a payment header in one go.
///
/// Returns the validated operation so settlement can reuse it.
#[tracing::instrument(skip_all, fields(network = %requirements.network))]
pub fn verify_payment<R: NetworkRegistry>(
    payment_header: &str,
    requirements: &PaymentRequirements,
    registry: &R,
) -> Result<UserOperation, VerificationError> {
    let result = header::decode(payment_header)
        .map_err(VerificationError::from)
        .and_then(|record| Ok(validate_structure(&record)?))
        .and_then(|op| {
            tracing::debug!(user_op = %op.tag(), sender = %op.sender, "UserOp parsed");
            match_payment(&op, requirements, registry).map(|claim| (op, claim))
        });
    match result {
        Ok((op, claim)) => {
            tracing::info!(
                user_op = %op.tag(),
                recipient = %claim.recipient,
                amount = %claim.amount,
                "Payment verification successful"
            );
            Ok(op)
        }
        Err(error) => {
            tracing::warn!(error = %error, "Payment verification failed");
            Err(error)
        }
    }
}
