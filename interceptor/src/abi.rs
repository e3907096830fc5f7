//! Decoding of the handful of token calls the protectors inspect, plus
//! `Transfer` logs and revert payloads.

use alloy_primitives::{Address, B256, U256};
use alloy_sol_types::{sol, Revert, SolCall, SolError, SolEvent};
use serde::Serialize;

sol! {
    function transfer(address to, uint256 value) external returns (bool);
    function transferFrom(address from, address to, uint256 value) external returns (bool);
    function approve(address spender, uint256 value) external returns (bool);
    function setApprovalForAll(address operator, bool approved) external;

    event Transfer(address indexed from, address indexed to, uint256 value);
}

/// A recognized token call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "name", content = "args", rename_all = "camelCase")]
pub enum KnownCall {
    Transfer {
        to: Address,
        value: U256,
    },
    TransferFrom {
        from: Address,
        to: Address,
        value: U256,
    },
    Approve {
        spender: Address,
        value: U256,
    },
    SetApprovalForAll {
        operator: Address,
        approved: bool,
    },
}

impl KnownCall {
    pub fn name(&self) -> &'static str {
        match self {
            KnownCall::Transfer { .. } => "transfer",
            KnownCall::TransferFrom { .. } => "transferFrom",
            KnownCall::Approve { .. } => "approve",
            KnownCall::SetApprovalForAll { .. } => "setApprovalForAll",
        }
    }

    /// Destination of a token transfer, if this is one.
    pub fn transfer_destination(&self) -> Option<Address> {
        match self {
            KnownCall::Transfer { to, .. } | KnownCall::TransferFrom { to, .. } => Some(*to),
            _ => None,
        }
    }
}

/// Calldata decoder collaborator.
pub trait AbiDecoder: Send + Sync {
    fn decode_known_call(&self, input: &[u8]) -> Option<KnownCall>;
}

/// Decoder for the fixed ERC-20 / ERC-721 signature set.
#[derive(Debug, Default, Clone, Copy)]
pub struct TokenCallDecoder;

impl AbiDecoder for TokenCallDecoder {
    fn decode_known_call(&self, input: &[u8]) -> Option<KnownCall> {
        decode_known_call(input)
    }
}

pub fn decode_known_call(input: &[u8]) -> Option<KnownCall> {
    let selector: [u8; 4] = input.get(..4)?.try_into().ok()?;
    match selector {
        transferCall::SELECTOR => {
            let call = transferCall::abi_decode(input, true).ok()?;
            Some(KnownCall::Transfer {
                to: call.to,
                value: call.value,
            })
        }
        transferFromCall::SELECTOR => {
            let call = transferFromCall::abi_decode(input, true).ok()?;
            Some(KnownCall::TransferFrom {
                from: call.from,
                to: call.to,
                value: call.value,
            })
        }
        approveCall::SELECTOR => {
            let call = approveCall::abi_decode(input, true).ok()?;
            Some(KnownCall::Approve {
                spender: call.spender,
                value: call.value,
            })
        }
        setApprovalForAllCall::SELECTOR => {
            let call = setApprovalForAllCall::abi_decode(input, true).ok()?;
            Some(KnownCall::SetApprovalForAll {
                operator: call.operator,
                approved: call.approved,
            })
        }
        _ => None,
    }
}

/// ERC-20 `Transfer(from, to, value)`; ERC-721 transfers (three indexed
/// topics, empty data) are not matched.
pub fn decode_transfer_log(topics: &[B256], data: &[u8]) -> Option<(Address, Address, U256)> {
    if topics.len() != 3 || topics[0] != Transfer::SIGNATURE_HASH || data.len() != 32 {
        return None;
    }
    let from = Address::from_word(topics[1]);
    let to = Address::from_word(topics[2]);
    Some((from, to, U256::from_be_slice(data)))
}

/// Text of a revert payload: `Error(string)` is ABI-decoded, other bytes
/// are returned as UTF-8 when they are printable. `None` means opaque.
pub fn decode_revert_payload(data: &[u8]) -> Option<String> {
    if data.starts_with(&Revert::SELECTOR) {
        if let Ok(revert) = Revert::abi_decode(data, true) {
            return Some(revert.reason);
        }
    }
    let text = std::str::from_utf8(data).ok()?;
    let printable = !text.is_empty() && text.chars().all(|c| !c.is_control() || c == '\n');
    printable.then(|| text.to_string())
}

// ── Tests ───────────────────────────────────────────────────────
