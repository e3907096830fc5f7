//! Token call checks: approvals and transfer destinations.

use super::{Protector, ProtectorContext, ProtectorFailure, QuarantineCode};
use crate::abi::KnownCall;
use crate::collaborators::AddressKind;
use async_trait::async_trait;

/// `approve`/`setApprovalForAll` to an account with no code. Revocations
/// (zero value, `approved = false`) are exempt.
pub struct EoaApproval;

#[async_trait]
impl Protector for EoaApproval {
    fn name(&self) -> &'static str {
        "eoa_approval"
    }

    async fn check(
        &self,
        ctx: &ProtectorContext<'_>,
    ) -> Result<Option<QuarantineCode>, ProtectorFailure> {
        let grantee = match &ctx.decoded {
            Some(KnownCall::Approve { spender, value }) if !value.is_zero() => *spender,
            Some(KnownCall::SetApprovalForAll { operator, approved: true }) => *operator,
            _ => return Ok(None),
        };
        Ok(ctx.is_eoa(grantee).await?.then_some(QuarantineCode::EoaApproval))
    }
}

/// Token transfer whose destination is the token contract itself.
pub struct Erc20Itself;

#[async_trait]
impl Protector for Erc20Itself {
    fn name(&self) -> &'static str {
        "erc20_itself"
    }

    async fn check(
        &self,
        ctx: &ProtectorContext<'_>,
    ) -> Result<Option<QuarantineCode>, ProtectorFailure> {
        let destination = ctx.decoded.as_ref().and_then(KnownCall::transfer_destination);
        Ok(match (destination, ctx.transaction.to) {
            (Some(destination), Some(token)) if destination == token => {
                Some(QuarantineCode::Erc20Itself)
            }
            _ => None,
        })
    }
}

/// Token transfer to a router or similar contract that cannot handle raw
/// token transfers.
pub struct KnownBadDestination;

#[async_trait]
impl Protector for KnownBadDestination {
    fn name(&self) -> &'static str {
        "known_bad_destination"
    }

    async fn check(
        &self,
        ctx: &ProtectorContext<'_>,
    ) -> Result<Option<QuarantineCode>, ProtectorFailure> {
        let Some(destination) = ctx.decoded.as_ref().and_then(KnownCall::transfer_destination)
        else {
            return Ok(None);
        };
        Ok(match ctx.metadata.lookup(&destination) {
            Some(meta) if meta.kind == AddressKind::Router => {
                Some(QuarantineCode::Erc20UnintendedContract)
            }
            _ => None,
        })
    }
}

/// Token transfer to a contract that is not a recognized recipient.
/// Routers and the token itself have their own checks.
pub struct TokenToContract;

#[async_trait]
impl Protector for TokenToContract {
    fn name(&self) -> &'static str {
        "token_to_contract"
    }

    async fn check(
        &self,
        ctx: &ProtectorContext<'_>,
    ) -> Result<Option<QuarantineCode>, ProtectorFailure> {
        let Some(destination) = ctx.decoded.as_ref().and_then(KnownCall::transfer_destination)
        else {
            return Ok(None);
        };
        if ctx.transaction.to == Some(destination) {
            return Ok(None);
        }
        match ctx.metadata.lookup(&destination).map(|m| m.kind) {
            Some(AddressKind::Contact | AddressKind::Contract | AddressKind::Router) => {
                return Ok(None)
            }
            Some(AddressKind::Token) | None => {}
        }
        Ok((!ctx.is_eoa(destination).await?).then_some(QuarantineCode::TokenToContract))
    }
}

#[cfg(test)]
mod tests {
    use super::super::fixtures::*;
    use super::*;
    use crate::abi::{approveCall, setApprovalForAllCall, transferCall, transferFromCall};
    use crate::collaborators::AddressKind;
    use alloy_primitives::{address, Address, U256};
    use alloy_sol_types::SolCall;

    const USER: Address = address!("1111111111111111111111111111111111111111");
    const SPENDER: Address = address!("aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa");
    const TOKEN: Address = address!("3333333333333333333333333333333333333333");
    const VAULT: Address = address!("4444444444444444444444444444444444444444");
    const ROUTER: Address = address!("7a250d5630B4cF539739dF2C5dAcb4c659F2488D");

    fn approve(value: u64) -> Vec<u8> {
        approveCall {
            spender: SPENDER,
            value: U256::from(value),
        }
        .abi_encode()
    }

    fn transfer(to: Address) -> Vec<u8> {
        transferCall {
            to,
            value: U256::from(10),
        }
        .abi_encode()
    }

    #[tokio::test]
    async fn test_approval_to_eoa_is_flagged() {
        let world = World::new(&[TOKEN], &[]);
        let tx = call(USER, TOKEN, approve(1000));
        assert_eq!(
            EoaApproval.check(&world.context(&tx)).await.unwrap(),
            Some(QuarantineCode::EoaApproval)
        );
    }

    #[tokio::test]
    async fn test_zero_approval_is_a_revocation() {
        let world = World::new(&[TOKEN], &[]);
        let tx = call(USER, TOKEN, approve(0));
        assert_eq!(EoaApproval.check(&world.context(&tx)).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_approval_to_contract_passes() {
        let world = World::new(&[TOKEN, SPENDER], &[]);
        let tx = call(USER, TOKEN, approve(1000));
        assert_eq!(EoaApproval.check(&world.context(&tx)).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_set_approval_for_all() {
        let world = World::new(&[TOKEN], &[]);
        let grant = setApprovalForAllCall {
            operator: SPENDER,
            approved: true,
        }
        .abi_encode();
        let tx = call(USER, TOKEN, grant);
        assert_eq!(
            EoaApproval.check(&world.context(&tx)).await.unwrap(),
            Some(QuarantineCode::EoaApproval)
        );

        let revoke = setApprovalForAllCall {
            operator: SPENDER,
            approved: false,
        }
        .abi_encode();
        let tx = call(USER, TOKEN, revoke);
        assert_eq!(EoaApproval.check(&world.context(&tx)).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_failed_code_lookup_is_an_error() {
        let world = World::with_failing_code_lookups(&[], &[], true);
        let tx = call(USER, TOKEN, approve(1000));
        assert!(EoaApproval.check(&world.context(&tx)).await.is_err());
    }

    #[tokio::test]
    async fn test_transfer_from_to_token_itself() {
        let world = World::new(&[TOKEN], &[]);
        let input = transferFromCall {
            from: USER,
            to: TOKEN,
            value: U256::from(5),
        }
        .abi_encode();
        let tx = call(USER, TOKEN, input);
        assert_eq!(
            Erc20Itself.check(&world.context(&tx)).await.unwrap(),
            Some(QuarantineCode::Erc20Itself)
        );
        assert_eq!(TokenToContract.check(&world.context(&tx)).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_transfer_to_router() {
        let mut world = World::new(&[TOKEN, ROUTER], &[]);
        world.metadata = world.metadata.with_known_routers();
        let tx = call(USER, TOKEN, transfer(ROUTER));
        assert_eq!(
            KnownBadDestination.check(&world.context(&tx)).await.unwrap(),
            Some(QuarantineCode::Erc20UnintendedContract)
        );
        assert_eq!(TokenToContract.check(&world.context(&tx)).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_transfer_to_unrecognized_contract() {
        let world = World::new(&[TOKEN, VAULT], &[]);
        let tx = call(USER, TOKEN, transfer(VAULT));
        assert_eq!(
            TokenToContract.check(&world.context(&tx)).await.unwrap(),
            Some(QuarantineCode::TokenToContract)
        );
        assert_eq!(KnownBadDestination.check(&world.context(&tx)).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_transfer_to_recognized_contract_passes() {
        let mut world = World::new(&[TOKEN, VAULT], &[]);
        world.metadata.insert(VAULT, "My Safe", AddressKind::Contract);
        let tx = call(USER, TOKEN, transfer(VAULT));
        assert_eq!(TokenToContract.check(&world.context(&tx)).await.unwrap(), None);
    }
}
