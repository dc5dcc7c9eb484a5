//! Interpretation of user-operation call data.
//!
//! Only two call shapes are recognized, by their 4-byte selector. A direct ERC-20
//! `transfer` yields a [`TransferClaim`]. A smart-account `execute` wrapper is
//! recognized but its nested call is not unpacked, so it yields nothing.

use alloy_primitives::{Address, U256};
use alloy_sol_types::{SolCall, sol};

use crate::user_op::UserOperation;

sol! {
    function transfer(address to, uint256 amount) external returns (bool);
    function execute(address dest, uint256 value, bytes func) external;
}

const SELECTOR_LEN: usize = 4;
const WORD_LEN: usize = 32;

/// Recipient and amount of a token transfer found in call data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferClaim {
    pub recipient: Address,
    pub amount: U256,
}

/// Call data classified by selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallShape<'a> {
    /// `transfer(address,uint256)`, arguments not yet validated.
    Transfer(&'a [u8]),
    /// `execute(address,uint256,bytes)`; the inner call stays opaque.
    Execute(&'a [u8]),
    Unknown,
}

impl<'a> CallShape<'a> {
    pub fn classify(call_data: &'a [u8]) -> Self {
        if call_data.len() < SELECTOR_LEN {
            return CallShape::Unknown;
        }
        let (selector, args) = call_data.split_at(SELECTOR_LEN);
        if selector == transferCall::SELECTOR.as_slice() {
            CallShape::Transfer(args)
        } else if selector == executeCall::SELECTOR.as_slice() {
            CallShape::Execute(args)
        } else {
            CallShape::Unknown
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            CallShape::Transfer(_) => "transfer",
            CallShape::Execute(_) => "execute",
            CallShape::Unknown => "unknown",
        }
    }

    /// Recipient is the low 20 bytes of the first word, amount the full second word.
    pub fn transfer_claim(&self) -> Option<TransferClaim> {
        match self {
            CallShape::Transfer(args) => {
                if args.len() < 2 * WORD_LEN {
                    return None;
                }
                let recipient = Address::from_slice(&args[WORD_LEN - 20..WORD_LEN]);
                let amount = U256::from_be_slice(&args[WORD_LEN..2 * WORD_LEN]);
                Some(TransferClaim { recipient, amount })
            }
            CallShape::Execute(_) => None,
            CallShape::Unknown => None,
        }
    }
}

/// Extracts the transfer carried by `op`, if its call data has a supported shape.
pub fn extract_transfer(op: &UserOperation) -> Option<TransferClaim> {
    let shape = CallShape::classify(&op.call_data);
    let claim = shape.transfer_claim();
    if claim.is_none() {
        tracing::debug!(shape = shape.name(), sender = %op.sender, "No transfer in call data");
    }
    claim
}
