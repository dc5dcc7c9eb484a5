//! [`Facilitator`] that verifies locally and settles through a sponsor and bundler.
//!
//! Verification is pure: the header is decoded, structurally validated and
//! matched against the requirements without any network I/O. Settlement repeats
//! verification, then hands the validated operation to the [`Orchestrator`].

use tracing::instrument;

use crate::facilitator::{Facilitator, FacilitatorError};
use crate::networks::{KnownNetworks, Network};
use crate::proto::{
    self, AlchemyHealth, HealthResponse, HealthStatus, NetworksHealth, SCHEME, SettleResponse,
    SupportedPaymentKind, SupportedResponse, VerifyResponse, X402Version1,
};
use crate::settle::{Bundler, FeeSponsor, Orchestrator, PollPolicy};
use crate::timestamp::Timestamp;
use crate::verify::verify_payment;

/// Liveness check of a network's chain RPC.
pub trait ChainProbe {
    fn is_reachable(&self, network: Network) -> impl Future<Output = bool> + Send;
}

impl<T: ChainProbe + Sync + Send> ChainProbe for std::sync::Arc<T> {
    fn is_reachable(&self, network: Network) -> impl Future<Output = bool> + Send {
        self.as_ref().is_reachable(network)
    }
}

pub struct FacilitatorLocal<C> {
    networks: KnownNetworks,
    client: C,
    orchestrator: Orchestrator<C, C>,
    policy_configured: bool,
}

impl<C> FacilitatorLocal<C>
where
    C: FeeSponsor + Bundler + ChainProbe + Clone + Sync + Send,
{
    pub fn new(
        networks: KnownNetworks,
        client: C,
        policy_id: impl Into<String>,
        poll: PollPolicy,
    ) -> Self {
        let policy_id = policy_id.into();
        let policy_configured = !policy_id.is_empty();
        let orchestrator = Orchestrator::new(client.clone(), client.clone(), policy_id, poll);
        Self {
            networks,
            client,
            orchestrator,
            policy_configured,
        }
    }

    pub fn networks(&self) -> &KnownNetworks {
        &self.networks
    }

    fn check_version(version: u64) -> Result<(), FacilitatorError> {
        if version == X402Version1::VALUE {
            Ok(())
        } else {
            Err(FacilitatorError::UnsupportedVersion(version))
        }
    }
}

impl<C> Facilitator for FacilitatorLocal<C>
where
    C: FeeSponsor + Bundler + ChainProbe + Clone + Sync + Send,
{
    type Error = FacilitatorError;

    async fn verify(&self, request: &proto::VerifyRequest) -> Result<VerifyResponse, Self::Error> {
        Self::check_version(request.x402_version)?;
        let verdict = match verify_payment(
            &request.payment_header,
            &request.payment_requirements,
            &self.networks,
        ) {
            Ok(_) => VerifyResponse::Valid,
            Err(error) => error.into(),
        };
        Ok(verdict)
    }

    #[instrument(skip_all, fields(network = %request.payment_requirements.network))]
    async fn settle(&self, request: &proto::SettleRequest) -> Result<SettleResponse, Self::Error> {
        Self::check_version(request.x402_version)?;
        let requirements = &request.payment_requirements;
        let op = match verify_payment(&request.payment_header, requirements, &self.networks) {
            Ok(op) => op,
            Err(error) => {
                return Ok(SettleResponse::Error {
                    reason: error.to_string(),
                    network: requirements.network.clone(),
                });
            }
        };
        let verdict = self.orchestrator.settle_operation(op, requirements).await?;
        Ok(verdict)
    }

    async fn supported(&self) -> Result<SupportedResponse, Self::Error> {
        let kinds = self
            .networks
            .enabled()
            .iter()
            .map(|network| SupportedPaymentKind {
                x402_version: X402Version1,
                scheme: SCHEME.to_string(),
                network: network.to_string(),
            })
            .collect();
        Ok(SupportedResponse { kinds })
    }

    /// Probes the first enabled network.
    async fn health(&self) -> HealthResponse {
        let connected = match self.networks.enabled().first() {
            Some(network) => self.client.is_reachable(*network).await,
            None => false,
        };
        let status = if connected {
            HealthStatus::Healthy
        } else {
            HealthStatus::Degraded
        };
        let list: Vec<String> = self
            .networks
            .enabled()
            .iter()
            .map(ToString::to_string)
            .collect();
        HealthResponse {
            status,
            timestamp: Timestamp::now(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            alchemy: AlchemyHealth {
                connected,
                policy_configured: self.policy_configured,
            },
            networks: NetworksHealth {
                supported: list.len(),
                list,
            },
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::header;
    use crate::proto::VerifyRequest;
    use crate::settle::tests::{FakeRelay, TX_HASH, fast_poll};
    use crate::user_op::tests::sample_record;
    use crate::verify::tests::{requirements, sample_header};
    use std::sync::Arc;
    use std::sync::atomic::Ordering;

    impl ChainProbe for FakeRelay {
        async fn is_reachable(&self, _network: Network) -> bool {
            true
        }
    }

    pub(crate) fn facilitator(relay: &Arc<FakeRelay>) -> FacilitatorLocal<Arc<FakeRelay>> {
        FacilitatorLocal::new(KnownNetworks::all(), Arc::clone(relay), "policy", fast_poll(5))
    }

    pub(crate) fn request(amount: &str) -> VerifyRequest {
        VerifyRequest {
            x402_version: 1,
            payment_header: sample_header(),
            payment_requirements: requirements(amount),
        }
    }

    #[tokio::test]
    async fn verify_reports_verdicts() {
        let relay = Arc::new(FakeRelay::happy(1));
        let facilitator = facilitator(&relay);
        assert_eq!(
            facilitator.verify(&request("1000000")).await.unwrap(),
            VerifyResponse::Valid
        );
        assert_eq!(
            facilitator.verify(&request("1000001")).await.unwrap(),
            VerifyResponse::invalid("Transfer amount insufficient: required 1000001, got 1000000")
        );
        assert_eq!(relay.sponsor_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn rejects_unsupported_version() {
        let relay = Arc::new(FakeRelay::happy(1));
        let mut req = request("1");
        req.x402_version = 2;
        let err = facilitator(&relay).verify(&req).await.unwrap_err();
        assert!(matches!(err, FacilitatorError::UnsupportedVersion(2)));
        let err = facilitator(&relay).settle(&req).await.unwrap_err();
        assert_eq!(err.to_string(), "Unsupported x402 version: 2");
    }

    #[tokio::test]
    async fn settle_verifies_before_sponsoring() {
        let relay = Arc::new(FakeRelay::happy(1));
        let verdict = facilitator(&relay).settle(&request("1000001")).await.unwrap();
        assert!(!verdict.is_success());
        assert_eq!(relay.sponsor_calls.load(Ordering::SeqCst), 0);

        let mut record = sample_record();
        record.remove("nonce");
        let mut req = request("1");
        req.payment_header = header::encode(&record).unwrap();
        let verdict = facilitator(&relay).settle(&req).await.unwrap();
        assert_eq!(
            verdict,
            SettleResponse::Error {
                reason: "Invalid UserOp: missing required field 'nonce'".into(),
                network: "base-sepolia".into(),
            }
        );
    }

    #[tokio::test]
    async fn settle_returns_transaction_hash() {
        let relay = Arc::new(FakeRelay::happy(2));
        let verdict = facilitator(&relay).settle(&request("1000000")).await.unwrap();
        assert_eq!(
            verdict,
            SettleResponse::Success {
                tx_hash: format!("{TX_HASH:#x}"),
                network: "base-sepolia".into(),
            }
        );
        assert_eq!(relay.poll_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn supported_lists_enabled_networks() {
        let relay = Arc::new(FakeRelay::happy(1));
        let facilitator = FacilitatorLocal::new(
            KnownNetworks::only([Network::BaseMainnet, Network::BaseSepolia]),
            relay,
            "policy",
            fast_poll(1),
        );
        let supported = facilitator.supported().await.unwrap();
        let networks: Vec<&str> = supported.kinds.iter().map(|k| k.network.as_str()).collect();
        assert_eq!(networks, ["base-sepolia", "base-mainnet"]);
        assert!(supported.kinds.iter().all(|k| k.scheme == SCHEME));
    }

    #[tokio::test]
    async fn health_reflects_probe() {
        let relay = Arc::new(FakeRelay::happy(1));
        let health = facilitator(&relay).health().await;
        assert_eq!(health.status, HealthStatus::Healthy);
        assert!(health.alchemy.connected);
        assert!(health.alchemy.policy_configured);
        assert_eq!(health.networks.supported, 7);
        assert_eq!(health.networks.list[0], "base-sepolia");

        let empty = FacilitatorLocal::new(KnownNetworks::only([]), relay, "", fast_poll(1));
        let health = empty.health().await;
        assert_eq!(health.status, HealthStatus::Degraded);
        assert!(!health.alchemy.policy_configured);
    }
}
