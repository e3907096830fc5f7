//! Chain binding and fee checks.

use super::{FeePolicy, Protector, ProtectorContext, ProtectorFailure, QuarantineCode};
use crate::types::{quantity, FeeModel};
use async_trait::async_trait;
use tracing::warn;

/// Transaction names a chain other than the one the wallet is on.
pub struct ChainMismatch;

#[async_trait]
impl Protector for ChainMismatch {
    fn name(&self) -> &'static str {
        "chain_mismatch"
    }

    async fn check(
        &self,
        ctx: &ProtectorContext<'_>,
    ) -> Result<Option<QuarantineCode>, ProtectorFailure> {
        let connected_chain = ctx.settings.active_chain;
        Ok(match ctx.transaction.chain_id {
            Some(transaction_chain) if transaction_chain != connected_chain => {
                Some(QuarantineCode::ChainIdDoesNotMatch {
                    transaction_chain,
                    connected_chain,
                })
            }
            _ => None,
        })
    }
}

/// Fee above what the network needs. An EIP-1559 tip below the floor, or
/// a legacy gas price below `multiplier ×` the node's estimate, passes;
/// anything at or above is flagged.
pub struct BigFee {
    policy: FeePolicy,
}

impl BigFee {
    pub fn new(policy: FeePolicy) -> Self {
        Self { policy }
    }
}

#[async_trait]
impl Protector for BigFee {
    fn name(&self) -> &'static str {
        "big_fee"
    }

    async fn check(
        &self,
        ctx: &ProtectorContext<'_>,
    ) -> Result<Option<QuarantineCode>, ProtectorFailure> {
        match ctx.transaction.fees {
            FeeModel::Eip1559 {
                max_priority_fee_per_gas,
                ..
            } => {
                if max_priority_fee_per_gas < self.policy.priority_fee_floor {
                    return Ok(None);
                }
                Ok(Some(QuarantineCode::BigFee))
            }
            FeeModel::Legacy { gas_price } => {
                let estimate = ctx.client.gas_price().await?;
                if gas_price < estimate.saturating_mul(self.policy.legacy_gas_multiplier) {
                    return Ok(None);
                }
                Ok(Some(QuarantineCode::BigFee))
            }
            FeeModel::Unspecified => Ok(None),
        }
    }
}

/// Compare an EIP-712 payload's `domain.chainId` with the connected chain.
/// A missing domain or chain id binds nothing and is not flagged; a chain id
/// that cannot be read is a failed check.
pub fn signature_chain_mismatch(
    typed_data: &serde_json::Value,
    connected_chain: u64,
) -> Option<QuarantineCode> {
    let chain_id_val = typed_data.get("domain")?.get("chainId")?;
    let Some(signature_chain) = quantity::parse(chain_id_val).and_then(|v| u64::try_from(v).ok())
    else {
        warn!(chain_id = %chain_id_val, "EIP-712 domain chainId unparseable");
        return Some(QuarantineCode::FailedCheck);
    };
    (signature_chain != connected_chain).then_some(QuarantineCode::SignatureChainIdDoesNotMatch {
        signature_chain,
        connected_chain,
    })
}

#[cfg(test)]
mod tests {
    use super::super::fixtures::*;
    use super::*;
    use alloy_primitives::Address;

    const POLICY: FeePolicy = FeePolicy {
        priority_fee_floor: 1_000_000_000,
        legacy_gas_multiplier: 10,
    };

    #[tokio::test]
    async fn test_chain_mismatch_names_both_chains() {
        let mut world = World::new(&[], &[]);
        world.settings.active_chain = 5;
        let mut tx = call(Address::ZERO, Address::ZERO, vec![]);
        tx.chain_id = Some(1);

        let code = ChainMismatch.check(&world.context(&tx)).await.unwrap().unwrap();
        assert_eq!(
            code,
            QuarantineCode::ChainIdDoesNotMatch {
                transaction_chain: 1,
                connected_chain: 5
            }
        );
        let explanation = code.explanation();
        assert!(explanation.contains("Ethereum Mainnet"));
        assert!(explanation.contains("Goerli"));
    }

    #[tokio::test]
    async fn test_matching_or_absent_chain_passes() {
        let world = World::new(&[], &[]);
        let mut tx = call(Address::ZERO, Address::ZERO, vec![]);
        assert_eq!(ChainMismatch.check(&world.context(&tx)).await.unwrap(), None);
        tx.chain_id = Some(1);
        assert_eq!(ChainMismatch.check(&world.context(&tx)).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_priority_fee_floor() {
        let world = World::new(&[], &[]);
        let mut tx = call(Address::ZERO, Address::ZERO, vec![]);
        tx.fees = FeeModel::Eip1559 {
            max_fee_per_gas: 100_000_000_000,
            max_priority_fee_per_gas: 999_999_999,
        };
        let fee = BigFee::new(POLICY);
        assert_eq!(fee.check(&world.context(&tx)).await.unwrap(), None);

        tx.fees = FeeModel::Eip1559 {
            max_fee_per_gas: 100_000_000_000,
            max_priority_fee_per_gas: 1_000_000_000,
        };
        assert_eq!(
            fee.check(&world.context(&tx)).await.unwrap(),
            Some(QuarantineCode::BigFee)
        );
    }

    #[tokio::test]
    async fn test_legacy_gas_price_against_estimate() {
        // Network estimate is 1 gwei.
        let world = World::new(&[], &[]);
        let mut tx = call(Address::ZERO, Address::ZERO, vec![]);
        let fee = BigFee::new(POLICY);

        tx.fees = FeeModel::Legacy {
            gas_price: 9_000_000_000,
        };
        assert_eq!(fee.check(&world.context(&tx)).await.unwrap(), None);

        tx.fees = FeeModel::Legacy {
            gas_price: 10_000_000_000,
        };
        assert_eq!(
            fee.check(&world.context(&tx)).await.unwrap(),
            Some(QuarantineCode::BigFee)
        );
    }

    #[test]
    fn test_signature_chain_id_forms() {
        let data = |chain: serde_json::Value| serde_json::json!({"domain": {"chainId": chain}});
        assert_eq!(signature_chain_mismatch(&data(serde_json::json!(1)), 1), None);
        assert_eq!(signature_chain_mismatch(&data(serde_json::json!("0x1")), 1), None);
        assert_eq!(
            signature_chain_mismatch(&data(serde_json::json!("137")), 1),
            Some(QuarantineCode::SignatureChainIdDoesNotMatch {
                signature_chain: 137,
                connected_chain: 1
            })
        );
        assert_eq!(signature_chain_mismatch(&serde_json::json!({"domain": {}}), 1), None);
        assert_eq!(signature_chain_mismatch(&serde_json::json!({}), 1), None);
    }

    #[test]
    fn test_unreadable_signature_chain_id_fails_the_check() {
        let data = |chain: serde_json::Value| serde_json::json!({"domain": {"chainId": chain}});
        for chain in [
            serde_json::json!("banana"),
            serde_json::json!(true),
            serde_json::json!({"id": 1}),
            serde_json::json!("0x10000000000000000"),
        ] {
            assert_eq!(
                signature_chain_mismatch(&data(chain), 1),
                Some(QuarantineCode::FailedCheck)
            );
        }
    }
}
