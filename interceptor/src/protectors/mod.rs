//! Protector pipeline: independent heuristics that inspect a transaction in
//! the context of the simulation stack and flag risk.
//!
//! All protectors for a transaction run concurrently; the pipeline waits
//! for the slowest one. A protector that cannot finish its check reports
//! `FAILED_CHECK` instead of failing the pipeline.

mod accounts;
mod chain;
mod erc20;

pub use accounts::{EoaCalldata, SendToUnknownAddress};
pub use chain::{signature_chain_mismatch, BigFee, ChainMismatch};
pub use erc20::{EoaApproval, Erc20Itself, KnownBadDestination, TokenToContract};

use crate::abi::{AbiDecoder, KnownCall};
use crate::collaborators::{AddressMetadataStore, Settings};
use crate::error::SimulationError;
use crate::rpc::EthereumClient;
use crate::simulation::{SimulationEngine, SimulationState};
use crate::types::{chain_name, UnsignedTransaction};
use alloy_primitives::{Address, B256, U256};
use async_trait::async_trait;
use futures::future::join_all;
use serde::Serialize;
use std::collections::BTreeSet;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

/// Closed set of risk flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(tag = "code", rename_all = "SCREAMING_SNAKE_CASE", rename_all_fields = "camelCase")]
pub enum QuarantineCode {
    Erc20UnintendedContract,
    Erc20Itself,
    EoaApproval,
    EoaCalldata,
    BigFee,
    FailedCheck,
    ChainIdDoesNotMatch {
        transaction_chain: u64,
        connected_chain: u64,
    },
    SignatureChainIdDoesNotMatch {
        signature_chain: u64,
        connected_chain: u64,
    },
    SendToUnknownAddress,
    TokenToContract,
}

impl QuarantineCode {
    pub fn label(&self) -> &'static str {
        match self {
            QuarantineCode::Erc20UnintendedContract => "Token sent to a contract that cannot receive it",
            QuarantineCode::Erc20Itself => "Token sent to its own contract",
            QuarantineCode::EoaApproval => "Approval granted to a plain account",
            QuarantineCode::EoaCalldata => "Calldata sent to a plain account",
            QuarantineCode::BigFee => "Unusually high fee",
            QuarantineCode::FailedCheck => "A safety check could not be completed",
            QuarantineCode::ChainIdDoesNotMatch { .. } => "Transaction is for a different chain",
            QuarantineCode::SignatureChainIdDoesNotMatch { .. } => "Signature is for a different chain",
            QuarantineCode::SendToUnknownAddress => "Recipient is unknown",
            QuarantineCode::TokenToContract => "Token sent to an unrecognized contract",
        }
    }

    pub fn explanation(&self) -> String {
        match self {
            QuarantineCode::Erc20UnintendedContract => {
                "The recipient is a contract such as a swap router that is not designed to receive token transfers. Tokens sent there are usually lost.".into()
            }
            QuarantineCode::Erc20Itself => {
                "The tokens are being sent to the token contract itself, where nobody can retrieve them.".into()
            }
            QuarantineCode::EoaApproval => {
                "The approved spender is a regular account, not a contract. Approving a plain account to move your tokens is almost never intended.".into()
            }
            QuarantineCode::EoaCalldata => {
                "The transaction carries call data but the destination has no code. This is malformed or crafted to mislead.".into()
            }
            QuarantineCode::BigFee => {
                "The fee offered is well above what the network currently needs.".into()
            }
            QuarantineCode::FailedCheck => {
                "One of the safety checks failed to run, so this transaction could not be fully verified.".into()
            }
            QuarantineCode::ChainIdDoesNotMatch {
                transaction_chain,
                connected_chain,
            } => format!(
                "The transaction is for {} (chain id {}) but the wallet is connected to {} (chain id {}).",
                chain_name(*transaction_chain),
                transaction_chain,
                chain_name(*connected_chain),
                connected_chain
            ),
            QuarantineCode::SignatureChainIdDoesNotMatch {
                signature_chain,
                connected_chain,
            } => format!(
                "The message is bound to {} (chain id {}) but the wallet is connected to {} (chain id {}).",
                chain_name(*signature_chain),
                signature_chain,
                chain_name(*connected_chain),
                connected_chain
            ),
            QuarantineCode::SendToUnknownAddress => {
                "The recipient is not in your address book and has never been seen on chain. Add it to your address book if this is intended.".into()
            }
            QuarantineCode::TokenToContract => {
                "The tokens are being sent to a contract that is not a recognized recipient.".into()
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QuarantineReason {
    #[serde(flatten)]
    pub code: QuarantineCode,
    pub label: &'static str,
    pub explanation: String,
}

/// Aggregated pipeline result for one transaction.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QuarantineReport {
    pub quarantine: bool,
    pub quarantine_codes: BTreeSet<QuarantineCode>,
}

impl QuarantineReport {
    pub fn from_codes(codes: impl IntoIterator<Item = QuarantineCode>) -> Self {
        let quarantine_codes: BTreeSet<_> = codes.into_iter().collect();
        Self {
            quarantine: !quarantine_codes.is_empty(),
            quarantine_codes,
        }
    }

    pub fn reasons(&self) -> Vec<QuarantineReason> {
        self.quarantine_codes
            .iter()
            .map(|code| QuarantineReason {
                code: *code,
                label: code.label(),
                explanation: code.explanation(),
            })
            .collect()
    }
}

/// Why a protector could not complete.
#[derive(Debug, Error)]
pub enum ProtectorFailure {
    #[error(transparent)]
    Simulation(#[from] SimulationError),
    #[error(transparent)]
    Rpc(#[from] crate::error::RpcError),
}

/// Fee thresholds for [`BigFee`].
#[derive(Debug, Clone, Copy)]
pub struct FeePolicy {
    pub priority_fee_floor: u128,
    pub legacy_gas_multiplier: u128,
}

/// Everything a protector may look at.
///
/// Balances and nonces are read from `state`, which by default is the
/// committed stack. A transaction already in the stack is judged against
/// the state before it (see [`ProtectorContext::before`]).
pub struct ProtectorContext<'a> {
    pub transaction: &'a UnsignedTransaction,
    pub decoded: Option<KnownCall>,
    pub simulation: &'a SimulationEngine,
    pub state: Arc<SimulationState>,
    pub client: &'a EthereumClient,
    pub settings: &'a Settings,
    pub metadata: &'a dyn AddressMetadataStore,
}

impl<'a> ProtectorContext<'a> {
    pub fn new(
        transaction: &'a UnsignedTransaction,
        decoder: &dyn AbiDecoder,
        simulation: &'a SimulationEngine,
        client: &'a EthereumClient,
        settings: &'a Settings,
        metadata: &'a dyn AddressMetadataStore,
    ) -> Self {
        Self {
            transaction,
            decoded: decoder.decode_known_call(&transaction.input),
            state: simulation.snapshot(),
            simulation,
            client,
            settings,
            metadata,
        }
    }

    /// Judge against `state` instead of the committed stack.
    pub fn with_state(mut self, state: Arc<SimulationState>) -> Self {
        self.state = state;
        self
    }

    /// Leave `id` and anything stacked after it out of balance and nonce
    /// reads, so a transaction's own effects do not vouch for it.
    pub fn before(mut self, id: &B256) -> Self {
        self.state = Arc::new(self.state.before(id));
        self
    }

    /// Whether `address` has no deployed code (an externally owned account).
    pub async fn is_eoa(&self, address: Address) -> Result<bool, ProtectorFailure> {
        Ok(self.simulation.get_code(address).await?.is_empty())
    }

    pub async fn eth_balance(&self, address: Address) -> Result<U256, ProtectorFailure> {
        Ok(self.simulation.eth_balance_in(&self.state, address).await?)
    }

    pub async fn transaction_count(&self, address: Address) -> Result<u64, ProtectorFailure> {
        Ok(self.simulation.transaction_count_in(&self.state, address).await?)
    }
}

#[async_trait]
pub trait Protector: Send + Sync {
    fn name(&self) -> &'static str;

    async fn check(
        &self,
        ctx: &ProtectorContext<'_>,
    ) -> Result<Option<QuarantineCode>, ProtectorFailure>;
}

pub struct ProtectorPipeline {
    protectors: Vec<Box<dyn Protector>>,
}

impl ProtectorPipeline {
    pub fn new(protectors: Vec<Box<dyn Protector>>) -> Self {
        Self { protectors }
    }

    /// The full battery of heuristics.
    pub fn standard(fees: FeePolicy) -> Self {
        Self::new(vec![
            Box::new(ChainMismatch),
            Box::new(BigFee::new(fees)),
            Box::new(EoaApproval),
            Box::new(EoaCalldata),
            Box::new(Erc20Itself),
            Box::new(KnownBadDestination),
            Box::new(SendToUnknownAddress),
            Box::new(TokenToContract),
        ])
    }

    pub fn len(&self) -> usize {
        self.protectors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.protectors.is_empty()
    }

    /// Run every protector concurrently and join their verdicts.
    pub async fn evaluate(&self, ctx: &ProtectorContext<'_>) -> QuarantineReport {
        let checks = self.protectors.iter().map(|protector| async move {
            match protector.check(ctx).await {
                Ok(Some(code)) => {
                    debug!(protector = protector.name(), ?code, "Protector flagged transaction");
                    Some(code)
                }
                Ok(None) => None,
                Err(e) => {
                    warn!(protector = protector.name(), error = %e, "Protector could not complete");
                    Some(QuarantineCode::FailedCheck)
                }
            }
        });
        QuarantineReport::from_codes(join_all(checks).await.into_iter().flatten())
    }
}

// ── Test fixtures ───────────────────────────────────────────────


// ── Tests ───────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::fixtures::*;
    use super::*;
    use alloy_primitives::Address;
    use std::time::Duration;

    struct Fixed(Option<QuarantineCode>, u64);

    #[async_trait]
    impl Protector for Fixed {
        fn name(&self) -> &'static str {
            "fixed"
        }

        async fn check(
            &self,
            _ctx: &ProtectorContext<'_>,
        ) -> Result<Option<QuarantineCode>, ProtectorFailure> {
            tokio::time::sleep(Duration::from_millis(self.1)).await;
            Ok(self.0)
        }
    }

    struct Broken;

    #[async_trait]
    impl Protector for Broken {
        fn name(&self) -> &'static str {
            "broken"
        }

        async fn check(
            &self,
            _ctx: &ProtectorContext<'_>,
        ) -> Result<Option<QuarantineCode>, ProtectorFailure> {
            Err(ProtectorFailure::Rpc(crate::error::RpcError::FailedToFetch("down".into())))
        }
    }

    fn five(order_reversed: bool) -> ProtectorPipeline {
        let mut protectors: Vec<Box<dyn Protector>> = vec![
            Box::new(Fixed(None, 5)),
            Box::new(Fixed(Some(QuarantineCode::EoaApproval), 40)),
            Box::new(Fixed(None, 1)),
            Box::new(Fixed(None, 20)),
            Box::new(Fixed(Some(QuarantineCode::BigFee), 10)),
        ];
        if order_reversed {
            protectors.reverse();
        }
        ProtectorPipeline::new(protectors)
    }

    #[tokio::test(start_paused = true)]
    async fn test_codes_aggregate_regardless_of_order() {
        let world = World::new(&[], &[]);
        let tx = call(Address::ZERO, Address::ZERO, vec![]);
        let ctx = world.context(&tx);

        let expected: BTreeSet<_> = [QuarantineCode::EoaApproval, QuarantineCode::BigFee].into();
        for reversed in [false, true] {
            let report = five(reversed).evaluate(&ctx).await;
            assert!(report.quarantine);
            assert_eq!(report.quarantine_codes, expected);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_latency_is_bounded_by_slowest_protector() {
        let world = World::new(&[], &[]);
        let tx = call(Address::ZERO, Address::ZERO, vec![]);
        let ctx = world.context(&tx);

        let started = tokio::time::Instant::now();
        five(false).evaluate(&ctx).await;
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(40));
        assert!(elapsed < Duration::from_millis(76));
    }

    #[tokio::test]
    async fn test_failure_becomes_failed_check() {
        let world = World::new(&[], &[]);
        let tx = call(Address::ZERO, Address::ZERO, vec![]);
        let ctx = world.context(&tx);

        let pipeline = ProtectorPipeline::new(vec![
            Box::new(Broken),
            Box::new(Fixed(Some(QuarantineCode::Erc20Itself), 0)),
        ]);
        let report = pipeline.evaluate(&ctx).await;
        assert_eq!(
            report.quarantine_codes,
            [QuarantineCode::FailedCheck, QuarantineCode::Erc20Itself].into()
        );
    }

    #[tokio::test]
    async fn test_clean_transaction_is_not_quarantined() {
        let world = World::new(&[], &[]);
        let tx = call(Address::ZERO, Address::ZERO, vec![]);
        let report = ProtectorPipeline::new(vec![Box::new(Fixed(None, 0))])
            .evaluate(&world.context(&tx))
            .await;
        assert!(!report.quarantine);
        assert!(report.quarantine_codes.is_empty());
    }

    #[test]
    fn test_reason_serialization_names_code() {
        let report = QuarantineReport::from_codes([QuarantineCode::ChainIdDoesNotMatch {
            transaction_chain: 1,
            connected_chain: 5,
        }]);
        let json = serde_json::to_value(report.reasons()).unwrap();
        assert_eq!(json[0]["code"], "CHAIN_ID_DOES_NOT_MATCH");
        assert_eq!(json[0]["transactionChain"], 1);
        assert!(json[0]["explanation"].as_str().unwrap().contains("Goerli"));
    }
}
