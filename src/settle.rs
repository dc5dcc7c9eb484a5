//! Settlement of a validated user operation.
//!
//! A settlement walks `Parsed -> Augmented -> Submitted -> Confirmed`:
//!
//! 1. the fee sponsor (a gas manager policy) returns `paymasterAndData`, which
//!    replaces the field on a copy of the operation;
//! 2. the bundler accepts the sponsored operation and returns its hash;
//! 3. the bundler is polled for a receipt until one arrives or the [`PollPolicy`]
//!    runs out.
//!
//! Any failure ends the walk. [`Orchestrator::settle`] turns failures into a
//! failed [`SettleResponse`]; only [`ProviderError`] escapes as a hard error.

use alloy_primitives::{B256, Bytes};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::instrument;

use crate::header::{self, DecodeError};
use crate::networks::Network;
use crate::proto::{PaymentRequirements, SettleResponse};
use crate::provider_cache::ProviderError;
use crate::user_op::{StructuralError, UserOperation, validate_structure};

/// Failure reported by a sponsor or bundler backend.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error(transparent)]
    Provider(#[from] ProviderError),
    #[error("{context}: {message}")]
    Rpc {
        context: &'static str,
        message: String,
    },
    #[error("{0} returned no result")]
    EmptyResult(&'static str),
}

/// Third party that pays gas for operations matching a policy.
pub trait FeeSponsor {
    /// Returns the `paymasterAndData` to attach, or `None` when the sponsor
    /// answered without one.
    fn sponsor(
        &self,
        op: &UserOperation,
        policy_id: &str,
        network: Network,
    ) -> impl Future<Output = Result<Option<Bytes>, RelayError>> + Send;
}

/// ERC-4337 bundler.
pub trait Bundler {
    /// Submits `op` and returns the user operation hash.
    fn submit(
        &self,
        op: &UserOperation,
        network: Network,
    ) -> impl Future<Output = Result<B256, RelayError>> + Send;

    /// Transaction hash that included `user_op_hash`, once mined.
    fn poll_receipt(
        &self,
        user_op_hash: B256,
        network: Network,
    ) -> impl Future<Output = Result<Option<B256>, RelayError>> + Send;
}

impl<T: FeeSponsor + Sync + Send> FeeSponsor for Arc<T> {
    fn sponsor(
        &self,
        op: &UserOperation,
        policy_id: &str,
        network: Network,
    ) -> impl Future<Output = Result<Option<Bytes>, RelayError>> + Send {
        self.as_ref().sponsor(op, policy_id, network)
    }
}

impl<T: Bundler + Sync + Send> Bundler for Arc<T> {
    fn submit(
        &self,
        op: &UserOperation,
        network: Network,
    ) -> impl Future<Output = Result<B256, RelayError>> + Send {
        self.as_ref().submit(op, network)
    }

    fn poll_receipt(
        &self,
        user_op_hash: B256,
        network: Network,
    ) -> impl Future<Output = Result<Option<B256>, RelayError>> + Send {
        self.as_ref().poll_receipt(user_op_hash, network)
    }
}

/// How long to wait for a receipt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPolicy {
    pub max_attempts: u32,
    /// Pause between attempts. Not applied after the last one.
    pub interval: Duration,
    /// Optional wall-clock bound over all attempts.
    pub deadline: Option<Duration>,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 30,
            interval: Duration::from_secs(1),
            deadline: None,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SettlementError {
    #[error("Failed to decode payment header: {0}")]
    Decode(#[from] DecodeError),
    #[error(transparent)]
    Structural(#[from] StructuralError),
    #[error("Unsupported network: {0}")]
    NetworkUnsupported(String),
    #[error("Failed to get paymaster data: {0}")]
    Sponsorship(RelayError),
    #[error("Failed to submit UserOp: {0}")]
    Submission(RelayError),
    #[error("Timeout waiting for UserOp receipt after {attempts} attempts")]
    Timeout { attempts: u32 },
    #[error("Timeout waiting for UserOp receipt after {0:?}")]
    DeadlineExceeded(Duration),
    #[error(transparent)]
    Provider(ProviderError),
}

impl SettlementError {
    fn sponsorship(error: RelayError) -> Self {
        match error {
            RelayError::Provider(e) => SettlementError::Provider(e),
            other => SettlementError::Sponsorship(other),
        }
    }

    fn submission(error: RelayError) -> Self {
        match error {
            RelayError::Provider(e) => SettlementError::Provider(e),
            other => SettlementError::Submission(other),
        }
    }
}

/// Where a settlement currently stands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SettlementState {
    Parsed(UserOperation),
    Augmented(UserOperation),
    Submitted(B256),
    Confirmed(B256),
}

/// Drives one operation through sponsorship, submission and confirmation.
pub struct Orchestrator<S, B> {
    sponsor: S,
    bundler: B,
    policy_id: String,
    poll: PollPolicy,
}

impl<S, B> Orchestrator<S, B>
where
    S: FeeSponsor + Sync,
    B: Bundler + Sync,
{
    pub fn new(sponsor: S, bundler: B, policy_id: impl Into<String>, poll: PollPolicy) -> Self {
        Self {
            sponsor,
            bundler,
            policy_id: policy_id.into(),
            poll,
        }
    }

    async fn augment(
        &self,
        op: &UserOperation,
        network: Network,
    ) -> Result<UserOperation, SettlementError> {
        let paymaster_and_data = self
            .sponsor
            .sponsor(op, &self.policy_id, network)
            .await
            .map_err(SettlementError::sponsorship)?;
        let paymaster_and_data = paymaster_and_data.unwrap_or_else(|| {
            tracing::warn!(user_op = %op.tag(), "Sponsor returned no paymasterAndData, submitting unsponsored");
            Bytes::new()
        });
        Ok(op.with_paymaster_and_data(paymaster_and_data))
    }

    async fn poll_until_mined(
        &self,
        user_op_hash: B256,
        network: Network,
    ) -> Result<B256, SettlementError> {
        let attempts = self.poll.max_attempts;
        for attempt in 1..=attempts {
            match self.bundler.poll_receipt(user_op_hash, network).await {
                Ok(Some(tx_hash)) => {
                    tracing::info!(%user_op_hash, %tx_hash, attempt, "UserOp receipt received");
                    return Ok(tx_hash);
                }
                Ok(None) => tracing::debug!(%user_op_hash, attempt, "UserOp not mined yet"),
                Err(RelayError::Provider(e)) => return Err(SettlementError::Provider(e)),
                Err(e) => tracing::debug!(%user_op_hash, attempt, error = %e, "Receipt poll failed, retrying"),
            }
            if attempt < attempts {
                tokio::time::sleep(self.poll.interval).await;
            }
        }
        Err(SettlementError::Timeout { attempts })
    }

    async fn confirm(&self, user_op_hash: B256, network: Network) -> Result<B256, SettlementError> {
        let polling = self.poll_until_mined(user_op_hash, network);
        match self.poll.deadline {
            Some(deadline) => tokio::time::timeout(deadline, polling)
                .await
                .unwrap_or(Err(SettlementError::DeadlineExceeded(deadline))),
            None => polling.await,
        }
    }

    /// Moves `state` one step forward. `Confirmed` is terminal and returned as is.
    pub async fn step(
        &self,
        state: SettlementState,
        network: Network,
    ) -> Result<SettlementState, SettlementError> {
        let next = match state {
            SettlementState::Parsed(op) => SettlementState::Augmented(self.augment(&op, network).await?),
            SettlementState::Augmented(op) => {
                let user_op_hash = self
                    .bundler
                    .submit(&op, network)
                    .await
                    .map_err(SettlementError::submission)?;
                tracing::info!(user_op = %op.tag(), %user_op_hash, "UserOp submitted to bundler");
                SettlementState::Submitted(user_op_hash)
            }
            SettlementState::Submitted(user_op_hash) => {
                SettlementState::Confirmed(self.confirm(user_op_hash, network).await?)
            }
            confirmed @ SettlementState::Confirmed(_) => confirmed,
        };
        Ok(next)
    }

    /// Runs a validated operation to confirmation and returns the transaction hash.
    pub async fn run(&self, op: UserOperation, network: Network) -> Result<B256, SettlementError> {
        let mut state = SettlementState::Parsed(op);
        loop {
            state = match self.step(state, network).await? {
                SettlementState::Confirmed(tx_hash) => return Ok(tx_hash),
                next => next,
            };
        }
    }

    async fn run_on(&self, op: UserOperation, network: &str) -> Result<B256, SettlementError> {
        let network = Network::from_str(network)
            .map_err(|_| SettlementError::NetworkUnsupported(network.to_string()))?;
        tracing::info!(user_op = %op.tag(), %network, "Starting payment settlement");
        self.run(op, network).await
    }

    /// Settles an already validated operation for `requirements.network`.
    ///
    /// Every failure other than [`ProviderError`] becomes a failed verdict.
    #[instrument(skip_all, fields(network = %requirements.network))]
    pub async fn settle_operation(
        &self,
        op: UserOperation,
        requirements: &PaymentRequirements,
    ) -> Result<SettleResponse, ProviderError> {
        let outcome = self.run_on(op, &requirements.network).await;
        verdict(requirements.network.clone(), outcome)
    }

    /// Decodes and validates a payment header, then settles it.
    pub async fn settle(
        &self,
        payment_header: &str,
        requirements: &PaymentRequirements,
    ) -> Result<SettleResponse, ProviderError> {
        let op = header::decode(payment_header)
            .map_err(SettlementError::from)
            .and_then(|record| Ok(validate_structure(&record)?));
        match op {
            Ok(op) => self.settle_operation(op, requirements).await,
            Err(error) => verdict(requirements.network.clone(), Err(error)),
        }
    }
}

fn verdict(
    network: String,
    outcome: Result<B256, SettlementError>,
) -> Result<SettleResponse, ProviderError> {
    match outcome {
        Ok(tx_hash) => {
            tracing::info!(%tx_hash, "Payment settled successfully");
            Ok(SettleResponse::Success {
                tx_hash: format!("{tx_hash:#x}"),
                network,
            })
        }
        Err(SettlementError::Provider(e)) => Err(e),
        Err(error) => {
            tracing::error!(error = %error, "Payment settlement failed");
            Ok(SettleResponse::Error {
                reason: error.to_string(),
                network,
            })
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::user_op::tests::sample_record;
    use crate::verify::tests::{requirements, sample_header};
    use alloy_primitives::b256;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    pub(crate) const USER_OP_HASH: B256 =
        b256!("0x1111111111111111111111111111111111111111111111111111111111111111");
    pub(crate) const TX_HASH: B256 =
        b256!("0x2222222222222222222222222222222222222222222222222222222222222222");

    /// Sponsor and bundler double with scripted answers and call counters.
    #[derive(Default)]
    pub(crate) struct FakeRelay {
        pub sponsor_result: Mutex<Option<Result<Option<Bytes>, RelayError>>>,
        pub submit_result: Mutex<Option<Result<B256, RelayError>>>,
        pub receipts: Mutex<VecDeque<Result<Option<B256>, RelayError>>>,
        pub sponsor_calls: AtomicUsize,
        pub submit_calls: AtomicUsize,
        pub poll_calls: AtomicUsize,
        pub submitted: Mutex<Option<UserOperation>>,
    }

    impl FakeRelay {
        /// Sponsors with `0xbeef`, accepts submission, mines on the `mined_at`-th poll.
        pub(crate) fn happy(mined_at: usize) -> Self {
            let relay = FakeRelay::default();
            *relay.sponsor_result.lock().unwrap() = Some(Ok(Some(Bytes::from(vec![0xbe, 0xef]))));
            *relay.submit_result.lock().unwrap() = Some(Ok(USER_OP_HASH));
            let mut receipts = VecDeque::new();
            for _ in 1..mined_at {
                receipts.push_back(Ok(None));
            }
            receipts.push_back(Ok(Some(TX_HASH)));
            *relay.receipts.lock().unwrap() = receipts;
            relay
        }
    }

    fn rpc_error(context: &'static str) -> RelayError {
        RelayError::Rpc {
            context,
            message: "boom".into(),
        }
    }

    impl FeeSponsor for FakeRelay {
        async fn sponsor(
            &self,
            _op: &UserOperation,
            _policy_id: &str,
            _network: Network,
        ) -> Result<Option<Bytes>, RelayError> {
            self.sponsor_calls.fetch_add(1, Ordering::SeqCst);
            self.sponsor_result
                .lock()
                .unwrap()
                .take()
                .unwrap_or(Err(RelayError::EmptyResult("sponsor")))
        }
    }

    impl Bundler for FakeRelay {
        async fn submit(&self, op: &UserOperation, _network: Network) -> Result<B256, RelayError> {
            self.submit_calls.fetch_add(1, Ordering::SeqCst);
            *self.submitted.lock().unwrap() = Some(op.clone());
            self.submit_result
                .lock()
                .unwrap()
                .take()
                .unwrap_or(Err(RelayError::EmptyResult("submit")))
        }

        async fn poll_receipt(
            &self,
            _user_op_hash: B256,
            _network: Network,
        ) -> Result<Option<B256>, RelayError> {
            self.poll_calls.fetch_add(1, Ordering::SeqCst);
            self.receipts.lock().unwrap().pop_front().unwrap_or(Ok(None))
        }
    }

    pub(crate) fn fast_poll(max_attempts: u32) -> PollPolicy {
        PollPolicy {
            max_attempts,
            interval: Duration::ZERO,
            deadline: None,
        }
    }

    fn orchestrator(relay: &Arc<FakeRelay>, poll: PollPolicy) -> Orchestrator<Arc<FakeRelay>, Arc<FakeRelay>> {
        Orchestrator::new(Arc::clone(relay), Arc::clone(relay), "policy", poll)
    }

    fn sample_op() -> UserOperation {
        validate_structure(&sample_record()).unwrap()
    }

    #[tokio::test]
    async fn settles_through_every_state() {
        let relay = Arc::new(FakeRelay::happy(3));
        let tx_hash = orchestrator(&relay, fast_poll(30))
            .run(sample_op(), Network::BaseSepolia)
            .await
            .unwrap();
        assert_eq!(tx_hash, TX_HASH);
        assert_eq!(relay.sponsor_calls.load(Ordering::SeqCst), 1);
        assert_eq!(relay.submit_calls.load(Ordering::SeqCst), 1);
        assert_eq!(relay.poll_calls.load(Ordering::SeqCst), 3);

        let submitted = relay.submitted.lock().unwrap().clone().unwrap();
        assert_eq!(&submitted.paymaster_and_data[..], &[0xbe, 0xef]);
        assert_eq!(submitted.call_data, sample_op().call_data);
    }

    #[tokio::test]
    async fn step_walks_states_in_order() {
        let relay = Arc::new(FakeRelay::happy(1));
        let orchestrator = orchestrator(&relay, fast_poll(5));
        let network = Network::BaseSepolia;
        let state = SettlementState::Parsed(sample_op());
        let state = orchestrator.step(state, network).await.unwrap();
        assert!(matches!(&state, SettlementState::Augmented(op) if !op.paymaster_and_data.is_empty()));
        let state = orchestrator.step(state, network).await.unwrap();
        assert_eq!(state, SettlementState::Submitted(USER_OP_HASH));
        let state = orchestrator.step(state, network).await.unwrap();
        assert_eq!(state, SettlementState::Confirmed(TX_HASH));
        let state = orchestrator.step(state, network).await.unwrap();
        assert_eq!(state, SettlementState::Confirmed(TX_HASH));
    }

    #[tokio::test]
    async fn sponsorship_failure_skips_submission() {
        let relay = Arc::new(FakeRelay::happy(1));
        *relay.sponsor_result.lock().unwrap() = Some(Err(rpc_error("Alchemy Gas Manager error")));
        let err = orchestrator(&relay, fast_poll(5))
            .run(sample_op(), Network::BaseSepolia)
            .await
            .unwrap_err();
        assert!(matches!(err, SettlementError::Sponsorship(_)));
        assert_eq!(
            err.to_string(),
            "Failed to get paymaster data: Alchemy Gas Manager error: boom"
        );
        assert_eq!(relay.submit_calls.load(Ordering::SeqCst), 0);
        assert_eq!(relay.poll_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn missing_paymaster_data_falls_back_to_empty() {
        let relay = Arc::new(FakeRelay::happy(1));
        *relay.sponsor_result.lock().unwrap() = Some(Ok(None));
        orchestrator(&relay, fast_poll(5))
            .run(sample_op(), Network::BaseSepolia)
            .await
            .unwrap();
        let submitted = relay.submitted.lock().unwrap().clone().unwrap();
        assert!(submitted.paymaster_and_data.is_empty());
    }

    #[tokio::test]
    async fn submission_failure_skips_polling() {
        let relay = Arc::new(FakeRelay::happy(1));
        *relay.submit_result.lock().unwrap() = Some(Err(rpc_error("Bundler error")));
        let err = orchestrator(&relay, fast_poll(5))
            .run(sample_op(), Network::BaseSepolia)
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "Failed to submit UserOp: Bundler error: boom");
        assert_eq!(relay.sponsor_calls.load(Ordering::SeqCst), 1);
        assert_eq!(relay.poll_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn times_out_after_exact_attempt_budget() {
        let relay = Arc::new(FakeRelay::happy(1));
        relay.receipts.lock().unwrap().clear();
        let err = orchestrator(&relay, fast_poll(7))
            .run(sample_op(), Network::BaseSepolia)
            .await
            .unwrap_err();
        assert!(matches!(err, SettlementError::Timeout { attempts: 7 }));
        assert_eq!(relay.poll_calls.load(Ordering::SeqCst), 7);
    }

    #[tokio::test]
    async fn transient_poll_errors_are_retried() {
        let relay = Arc::new(FakeRelay::happy(1));
        {
            let mut receipts = relay.receipts.lock().unwrap();
            receipts.clear();
            receipts.push_back(Err(rpc_error("Bundler error")));
            receipts.push_back(Ok(None));
            receipts.push_back(Ok(Some(TX_HASH)));
        }
        let tx_hash = orchestrator(&relay, fast_poll(5))
            .run(sample_op(), Network::BaseSepolia)
            .await
            .unwrap();
        assert_eq!(tx_hash, TX_HASH);
        assert_eq!(relay.poll_calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn deadline_bounds_the_wait() {
        let relay = Arc::new(FakeRelay::happy(1));
        relay.receipts.lock().unwrap().clear();
        let poll = PollPolicy {
            max_attempts: u32::MAX,
            interval: Duration::from_millis(5),
            deadline: Some(Duration::from_millis(40)),
        };
        let err = orchestrator(&relay, poll)
            .run(sample_op(), Network::BaseSepolia)
            .await
            .unwrap_err();
        assert!(matches!(err, SettlementError::DeadlineExceeded(_)));
    }

    #[tokio::test]
    async fn settle_reports_success_verdict() {
        let relay = Arc::new(FakeRelay::happy(2));
        let verdict = orchestrator(&relay, fast_poll(5))
            .settle(&sample_header(), &requirements("1000000"))
            .await
            .unwrap();
        assert_eq!(
            verdict,
            SettleResponse::Success {
                tx_hash: format!("{TX_HASH:#x}"),
                network: "base-sepolia".into(),
            }
        );
    }

    #[tokio::test]
    async fn settle_turns_errors_into_failed_verdicts() {
        let relay = Arc::new(FakeRelay::happy(1));
        let orchestrator = orchestrator(&relay, fast_poll(5));

        let verdict = orchestrator
            .settle("%%%", &requirements("1"))
            .await
            .unwrap();
        assert!(matches!(
            &verdict,
            SettleResponse::Error { reason, network }
                if reason.starts_with("Failed to decode payment header") && network == "base-sepolia"
        ));

        let mut req = requirements("1");
        req.network = "solana".into();
        let verdict = orchestrator.settle(&sample_header(), &req).await.unwrap();
        assert_eq!(
            verdict,
            SettleResponse::Error {
                reason: "Unsupported network: solana".into(),
                network: "solana".into(),
            }
        );
        assert_eq!(relay.sponsor_calls.load(Ordering::SeqCst), 0);
    }
}
