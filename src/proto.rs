//! Wire types of the facilitator HTTP API (x402 version 1).
//!
//! Requests carry the payment header as an opaque base64 string next to the
//! seller's [`PaymentRequirements`]. Verdicts are Rust enums; their JSON forms
//! go through private `*Wire` structs so that a valid verdict can never carry a
//! reason and a successful settlement always carries a transaction hash.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_with::{VecSkipError, serde_as};
use std::fmt::{self, Display};

/// The only payment scheme this facilitator settles.
pub const SCHEME: &str = "aa-erc4337";

/// Version marker that serializes as `1`.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct X402Version1;

impl X402Version1 {
    pub const VALUE: u64 = 1;
}

impl Serialize for X402Version1 {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(Self::VALUE)
    }
}

impl<'de> Deserialize<'de> for X402Version1 {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let num = u64::deserialize(deserializer)?;
        if num == Self::VALUE {
            Ok(X402Version1)
        } else {
            Err(serde::de::Error::custom(format!(
                "expected version {}, got {}",
                Self::VALUE,
                num
            )))
        }
    }
}

impl Display for X402Version1 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", Self::VALUE)
    }
}

/// What the seller demands for a resource. Read-only to the facilitator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentRequirements {
    pub scheme: String,
    pub network: String,
    /// Minimum amount in token base units, as a decimal string.
    pub max_amount_required: String,
    #[serde(default)]
    pub resource: String,
    pub pay_to: String,
    pub asset: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_timeout_seconds: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extra: Option<serde_json::Value>,
}

/// Body of `POST /verify`.
///
/// The version is kept as a plain number so an unsupported value can be reported
/// instead of failing deserialization.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerifyRequest {
    pub x402_version: u64,
    pub payment_header: String,
    pub payment_requirements: PaymentRequirements,
}

/// Body of `POST /settle`. Same shape as [`VerifyRequest`].
pub type SettleRequest = VerifyRequest;

/// Outcome of `/verify`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerifyResponse {
    Valid,
    Invalid { reason: String },
}

impl VerifyResponse {
    pub fn invalid(reason: impl Into<String>) -> Self {
        VerifyResponse::Invalid {
            reason: reason.into(),
        }
    }

    pub fn is_valid(&self) -> bool {
        matches!(self, VerifyResponse::Valid)
    }
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct VerifyResponseWire {
    is_valid: bool,
    #[serde(default)]
    invalid_reason: Option<String>,
}

impl Serialize for VerifyResponse {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let wire = match self {
            VerifyResponse::Valid => VerifyResponseWire {
                is_valid: true,
                invalid_reason: None,
            },
            VerifyResponse::Invalid { reason } => VerifyResponseWire {
                is_valid: false,
                invalid_reason: Some(reason.clone()),
            },
        };
        wire.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for VerifyResponse {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let wire = VerifyResponseWire::deserialize(deserializer)?;
        match (wire.is_valid, wire.invalid_reason) {
            (true, None) => Ok(VerifyResponse::Valid),
            (true, Some(_)) => Err(serde::de::Error::custom(
                "valid verdict must not carry invalidReason",
            )),
            (false, Some(reason)) => Ok(VerifyResponse::Invalid { reason }),
            (false, None) => Err(serde::de::Error::missing_field("invalidReason")),
        }
    }
}

/// Outcome of `/settle`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SettleResponse {
    Success { tx_hash: String, network: String },
    Error { reason: String, network: String },
}

impl SettleResponse {
    pub fn is_success(&self) -> bool {
        matches!(self, SettleResponse::Success { .. })
    }
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SettleResponseWire {
    success: bool,
    #[serde(default)]
    tx_hash: Option<String>,
    network_id: String,
    #[serde(default)]
    error: Option<String>,
}

impl Serialize for SettleResponse {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let wire = match self {
            SettleResponse::Success { tx_hash, network } => SettleResponseWire {
                success: true,
                tx_hash: Some(tx_hash.clone()),
                network_id: network.clone(),
                error: None,
            },
            SettleResponse::Error { reason, network } => SettleResponseWire {
                success: false,
                tx_hash: None,
                network_id: network.clone(),
                error: Some(reason.clone()),
            },
        };
        wire.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for SettleResponse {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let wire = SettleResponseWire::deserialize(deserializer)?;
        match wire.success {
            true => {
                let tx_hash = wire
                    .tx_hash
                    .ok_or_else(|| serde::de::Error::missing_field("txHash"))?;
                Ok(SettleResponse::Success {
                    tx_hash,
                    network: wire.network_id,
                })
            }
            false => {
                let reason = wire
                    .error
                    .ok_or_else(|| serde::de::Error::missing_field("error"))?;
                Ok(SettleResponse::Error {
                    reason,
                    network: wire.network_id,
                })
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SupportedPaymentKind {
    pub x402_version: X402Version1,
    pub scheme: String,
    pub network: String,
}

/// Body of `GET /supported`.
#[serde_as]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SupportedResponse {
    #[serde_as(as = "VecSkipError<_>")]
    pub kinds: Vec<SupportedPaymentKind>,
}

/// Body of `GET /health`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: HealthStatus,
    pub timestamp: crate::timestamp::Timestamp,
    pub version: String,
    pub alchemy: AlchemyHealth,
    pub networks: NetworksHealth,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlchemyHealth {
    pub connected: bool,
    pub policy_configured: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworksHealth {
    pub supported: usize,
    pub list: Vec<String>,
}

/// Error body for rejected HTTP requests.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
}
