//! Checks on the account a transaction talks to.

use super::{Protector, ProtectorContext, ProtectorFailure, QuarantineCode};
use crate::abi::KnownCall;
use async_trait::async_trait;

/// Calldata sent to an address with no code.
pub struct EoaCalldata;

#[async_trait]
impl Protector for EoaCalldata {
    fn name(&self) -> &'static str {
        "eoa_calldata"
    }

    async fn check(
        &self,
        ctx: &ProtectorContext<'_>,
    ) -> Result<Option<QuarantineCode>, ProtectorFailure> {
        let Some(to) = ctx.transaction.to else {
            return Ok(None);
        };
        if ctx.transaction.input.is_empty() {
            return Ok(None);
        }
        Ok(ctx.is_eoa(to).await?.then_some(QuarantineCode::EoaCalldata))
    }
}

/// Value or tokens sent to an address that is neither in the address book
/// nor has any on-chain history.
pub struct SendToUnknownAddress;

impl SendToUnknownAddress {
    fn recipient(ctx: &ProtectorContext<'_>) -> Option<alloy_primitives::Address> {
        if let Some(destination) = ctx.decoded.as_ref().and_then(KnownCall::transfer_destination) {
            return Some(destination);
        }
        let tx = ctx.transaction;
        if tx.input.is_empty() && !tx.value.is_zero() {
            return tx.to;
        }
        None
    }
}

#[async_trait]
impl Protector for SendToUnknownAddress {
    fn name(&self) -> &'static str {
        "send_to_unknown_address"
    }

    async fn check(
        &self,
        ctx: &ProtectorContext<'_>,
    ) -> Result<Option<QuarantineCode>, ProtectorFailure> {
        let Some(recipient) = Self::recipient(ctx) else {
            return Ok(None);
        };
        if ctx.metadata.lookup(&recipient).is_some() || !ctx.is_eoa(recipient).await? {
            return Ok(None);
        }
        let (nonce, balance) = tokio::try_join!(
            ctx.transaction_count(recipient),
            ctx.eth_balance(recipient),
        )?;
        Ok((nonce == 0 && balance.is_zero()).then_some(QuarantineCode::SendToUnknownAddress))
    }
}

#[cfg(test)]
mod tests {
    use super::super::fixtures::*;
    use super::*;
    use crate::abi::transferCall;
    use crate::collaborators::AddressKind;
    use alloy_primitives::{address, Address, U256};
    use alloy_sol_types::SolCall;

    const USER: Address = address!("1111111111111111111111111111111111111111");
    const FRIEND: Address = address!("2222222222222222222222222222222222222222");
    const TOKEN: Address = address!("3333333333333333333333333333333333333333");
    const STRANGER: Address = address!("5555555555555555555555555555555555555555");

    fn value_transfer(to: Address) -> crate::types::UnsignedTransaction {
        let mut tx = call(USER, to, vec![]);
        tx.value = U256::from(1_000_000_000_000_000u64);
        tx
    }

    #[tokio::test]
    async fn test_calldata_to_eoa() {
        let world = World::new(&[TOKEN], &[]);
        let tx = call(USER, FRIEND, vec![0xde, 0xad, 0xbe, 0xef]);
        assert_eq!(
            EoaCalldata.check(&world.context(&tx)).await.unwrap(),
            Some(QuarantineCode::EoaCalldata)
        );

        let tx = call(USER, TOKEN, vec![0xde, 0xad, 0xbe, 0xef]);
        assert_eq!(EoaCalldata.check(&world.context(&tx)).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_plain_value_transfer_has_no_calldata() {
        let world = World::new(&[], &[]);
        let tx = value_transfer(FRIEND);
        assert_eq!(EoaCalldata.check(&world.context(&tx)).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_value_to_fresh_address_is_flagged() {
        let world = World::new(&[], &[FRIEND]);
        let tx = value_transfer(STRANGER);
        assert_eq!(
            SendToUnknownAddress.check(&world.context(&tx)).await.unwrap(),
            Some(QuarantineCode::SendToUnknownAddress)
        );

        let tx = value_transfer(FRIEND);
        assert_eq!(SendToUnknownAddress.check(&world.context(&tx)).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_address_book_entry_suppresses_unknown_flag() {
        let mut world = World::new(&[], &[]);
        world.metadata.insert(STRANGER, "Alice", AddressKind::Contact);
        let tx = value_transfer(STRANGER);
        assert_eq!(SendToUnknownAddress.check(&world.context(&tx)).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_token_transfer_to_fresh_address() {
        let world = World::new(&[TOKEN], &[]);
        let input = transferCall {
            to: STRANGER,
            value: U256::from(10),
        }
        .abi_encode();
        let tx = call(USER, TOKEN, input);
        assert_eq!(
            SendToUnknownAddress.check(&world.context(&tx)).await.unwrap(),
            Some(QuarantineCode::SendToUnknownAddress)
        );
    }

    #[tokio::test]
    async fn test_failed_lookup_surfaces_as_error() {
        let world = World::with_failing_code_lookups(&[], &[], true);
        let tx = value_transfer(STRANGER);
        assert!(SendToUnknownAddress.check(&world.context(&tx)).await.is_err());
        assert!(EoaCalldata
            .check(&world.context(&call(USER, STRANGER, vec![1])))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_pipeline_reports_failed_check() {
        let world = World::with_failing_code_lookups(&[], &[], true);
        let pipeline = super::super::ProtectorPipeline::new(vec![
            Box::new(EoaCalldata),
            Box::new(super::super::ChainMismatch),
        ]);
        let tx = call(USER, STRANGER, vec![1]);
        let report = pipeline.evaluate(&world.context(&tx)).await;
        assert!(report.quarantine);
        assert!(report.quarantine_codes.contains(&QuarantineCode::FailedCheck));
    }
}
