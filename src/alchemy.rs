//! Alchemy Gas Manager and bundler over JSON-RPC.
//!
//! Both roles share the per-network [`RpcClient`](alloy_rpc_client::RpcClient)
//! from the [`ProviderCache`]:
//!
//! - `alchemy_requestGasAndPaymasterAndData` for sponsorship,
//! - `eth_sendUserOperation` for submission,
//! - `eth_getUserOperationReceipt` for confirmation.

use alloy_primitives::{Address, B256, Bytes};
use alloy_provider::Provider;
use alloy_transport::TransportError;
use serde::{Deserialize, Serialize};
use std::future::IntoFuture;
use std::sync::Arc;
use tracing::Instrument;

use crate::facilitator_local::ChainProbe;
use crate::networks::Network;
use crate::provider_cache::{ProviderCache, ProviderError};
use crate::settle::{Bundler, FeeSponsor, RelayError};
use crate::user_op::UserOperation;

const GAS_MANAGER_ERROR: &str = "Alchemy Gas Manager error";
const BUNDLER_ERROR: &str = "Bundler error";

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct PaymasterRequest {
    policy_id: String,
    entry_point: Address,
    user_operation: UserOperation,
}

/// Only `paymasterAndData` is used; gas estimates in the answer are ignored.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PaymasterResponse {
    #[serde(default)]
    paymaster_and_data: Option<Bytes>,
}

#[derive(Debug, Deserialize)]
struct UserOperationReceipt {
    receipt: IncludedIn,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct IncludedIn {
    transaction_hash: B256,
}

/// Prefers the JSON-RPC error message over the transport's rendering.
fn relay_error(context: &'static str, error: TransportError) -> RelayError {
    let message = match error.as_error_resp() {
        Some(payload) => payload.message.to_string(),
        None => error.to_string(),
    };
    RelayError::Rpc { context, message }
}

/// [`FeeSponsor`] and [`Bundler`] backed by Alchemy endpoints.
#[derive(Clone)]
pub struct AlchemyClient {
    providers: Arc<ProviderCache>,
    entry_point: Address,
}

impl AlchemyClient {
    pub fn new(providers: Arc<ProviderCache>, entry_point: Address) -> Self {
        Self {
            providers,
            entry_point,
        }
    }

    pub fn entry_point(&self) -> Address {
        self.entry_point
    }

    /// Latest block number seen by the chain RPC for `network`.
    pub async fn block_number(&self, network: Network) -> Result<u64, ProbeError> {
        let provider = self.providers.get_or_create(network)?;
        let block = provider
            .rpc()
            .get_block_number()
            .into_future()
            .instrument(tracing::info_span!("eth_blockNumber", %network, otel.kind = "client"))
            .await?;
        Ok(block)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ProbeError {
    #[error(transparent)]
    Provider(#[from] ProviderError),
    #[error(transparent)]
    Transport(#[from] TransportError),
}

impl ChainProbe for AlchemyClient {
    async fn is_reachable(&self, network: Network) -> bool {
        match self.block_number(network).await {
            Ok(block) => {
                tracing::debug!(%network, block, "Chain RPC reachable");
                true
            }
            Err(error) => {
                tracing::warn!(%network, error = %error, "Chain RPC unreachable");
                false
            }
        }
    }
}

impl FeeSponsor for AlchemyClient {
    async fn sponsor(
        &self,
        op: &UserOperation,
        policy_id: &str,
        network: Network,
    ) -> Result<Option<Bytes>, RelayError> {
        let provider = self.providers.get_or_create(network)?;
        let params = [PaymasterRequest {
            policy_id: policy_id.to_string(),
            entry_point: self.entry_point,
            user_operation: op.clone(),
        }];
        let response: Option<PaymasterResponse> = provider
            .bundler()
            .request("alchemy_requestGasAndPaymasterAndData", params)
            .into_future()
            .instrument(tracing::info_span!(
                "alchemy_requestGasAndPaymasterAndData",
                %network,
                user_op = %op.tag(),
                otel.kind = "client"
            ))
            .await
            .map_err(|e| relay_error(GAS_MANAGER_ERROR, e))?;
        let response = response.ok_or(RelayError::EmptyResult(GAS_MANAGER_ERROR))?;
        Ok(response.paymaster_and_data)
    }
}

impl Bundler for AlchemyClient {
    async fn submit(&self, op: &UserOperation, network: Network) -> Result<B256, RelayError> {
        let provider = self.providers.get_or_create(network)?;
        let user_op_hash: Option<B256> = provider
            .bundler()
            .request("eth_sendUserOperation", (op.clone(), self.entry_point))
            .into_future()
            .instrument(tracing::info_span!(
                "eth_sendUserOperation",
                %network,
                user_op = %op.tag(),
                otel.kind = "client"
            ))
            .await
            .map_err(|e| relay_error(BUNDLER_ERROR, e))?;
        user_op_hash.ok_or(RelayError::EmptyResult(BUNDLER_ERROR))
    }

    async fn poll_receipt(
        &self,
        user_op_hash: B256,
        network: Network,
    ) -> Result<Option<B256>, RelayError> {
        let provider = self.providers.get_or_create(network)?;
        let receipt: Option<UserOperationReceipt> = provider
            .bundler()
            .request("eth_getUserOperationReceipt", (user_op_hash,))
            .into_future()
            .instrument(tracing::debug_span!(
                "eth_getUserOperationReceipt",
                %network,
                %user_op_hash,
                otel.kind = "client"
            ))
            .await
            .map_err(|e| relay_error(BUNDLER_ERROR, e))?;
        Ok(receipt.map(|r| r.receipt.transaction_hash))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ENTRY_POINT_V06;
    use crate::user_op::tests::sample_record;
    use crate::user_op::validate_structure;
    use alloy_transport::TransportErrorKind;
    use serde_json::json;

    fn sample_op() -> UserOperation {
        validate_structure(&sample_record()).unwrap()
    }

    #[test]
    fn paymaster_request_shape() {
        let params = [PaymasterRequest {
            policy_id: "policy".into(),
            entry_point: ENTRY_POINT_V06,
            user_operation: sample_op(),
        }];
        let value = serde_json::to_value(&params).unwrap();
        let request = &value[0];
        assert_eq!(request["policyId"], "policy");
        let entry_point: Address = serde_json::from_value(request["entryPoint"].clone()).unwrap();
        assert_eq!(entry_point, ENTRY_POINT_V06);
        let sender: Address =
            serde_json::from_value(request["userOperation"]["sender"].clone()).unwrap();
        assert_eq!(sender, sample_op().sender);
        assert_eq!(request["userOperation"]["nonce"], "0x0");
        assert!(request["userOperation"]["callData"].as_str().unwrap().starts_with("0xa9059cbb"));
    }

    #[test]
    fn send_params_are_positional() {
        let value = serde_json::to_value((sample_op(), ENTRY_POINT_V06)).unwrap();
        let params = value.as_array().unwrap();
        assert_eq!(params.len(), 2);
        assert!(params[0].get("signature").is_some());
        assert!(params[1].is_string());

        let hash = B256::repeat_byte(0x11);
        assert_eq!(
            serde_json::to_value((hash,)).unwrap(),
            json!([format!("{hash:#x}")])
        );
    }

    #[test]
    fn paymaster_response_without_data() {
        let response: PaymasterResponse =
            serde_json::from_value(json!({"callGasLimit": "0x1"})).unwrap();
        assert!(response.paymaster_and_data.is_none());
        let response: PaymasterResponse =
            serde_json::from_value(json!({"paymasterAndData": "0xbeef"})).unwrap();
        assert_eq!(response.paymaster_and_data, Some(Bytes::from(vec![0xbe, 0xef])));
    }

    #[test]
    fn receipt_yields_transaction_hash() {
        let tx = B256::repeat_byte(0x22);
        let receipt: Option<UserOperationReceipt> = serde_json::from_value(json!({
            "userOpHash": format!("{:#x}", B256::repeat_byte(0x11)),
            "success": true,
            "receipt": {"transactionHash": format!("{tx:#x}"), "blockNumber": "0x10"}
        }))
        .unwrap();
        assert_eq!(receipt.map(|r| r.receipt.transaction_hash), Some(tx));

        let pending: Option<UserOperationReceipt> = serde_json::from_value(json!(null)).unwrap();
        assert!(pending.is_none());
    }

    #[test]
    fn transport_errors_carry_context() {
        let error = relay_error(BUNDLER_ERROR, TransportErrorKind::custom_str("connection refused"));
        let message = error.to_string();
        assert!(message.starts_with("Bundler error: "));
        assert!(message.contains("connection refused"));
    }
}
