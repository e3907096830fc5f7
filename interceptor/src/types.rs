//! Shared wire types: JSON-RPC envelopes, hex quantities, unsigned
//! transactions and chain naming.

use alloy_primitives::{keccak256, Address, Bytes, B256, U256};
use serde::{Deserialize, Serialize};

use crate::error::RequestError;

/// Standard JSON-RPC 2.0 request as sent upstream.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    pub id: u64,
    pub method: String,
    pub params: serde_json::Value,
}

impl JsonRpcRequest {
    pub fn new(id: u64, method: &str, params: serde_json::Value) -> Self {
        Self {
            jsonrpc: "2.0".into(),
            id,
            method: method.to_string(),
            params,
        }
    }
}

/// Standard JSON-RPC 2.0 response. Exactly one of `result`/`error` is set
/// on a well-formed reply; [`crate::rpc`] rejects anything else.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: String,
    #[serde(default)]
    pub id: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct JsonRpcError {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

// ── Hex quantities ──────────────────────────────────────────────

/// Serde helpers for `0x`-prefixed quantities. Decoding also accepts JSON
/// numbers and decimal strings, since pages send all three.
pub mod quantity {
    use serde::de::Error as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn parse(value: &serde_json::Value) -> Option<u128> {
        match value {
            serde_json::Value::Number(n) => n.as_u64().map(u128::from),
            serde_json::Value::String(s) => parse_str(s),
            _ => None,
        }
    }

    pub fn parse_str(s: &str) -> Option<u128> {
        if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
            if hex.is_empty() {
                return Some(0);
            }
            u128::from_str_radix(hex, 16).ok()
        } else {
            s.parse().ok()
        }
    }

    pub fn serialize<S, T>(value: &T, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
        T: Into<u128> + Copy,
    {
        serializer.serialize_str(&format!("{:#x}", (*value).into()))
    }

    pub fn deserialize<'de, D, T>(deserializer: D) -> Result<T, D::Error>
    where
        D: Deserializer<'de>,
        T: TryFrom<u128>,
    {
        let raw = serde_json::Value::deserialize(deserializer)?;
        parse(&raw)
            .and_then(|v| T::try_from(v).ok())
            .ok_or_else(|| D::Error::custom(format!("invalid quantity: {raw}")))
    }

    pub mod opt {
        use super::*;

        pub fn serialize<S, T>(value: &Option<T>, serializer: S) -> Result<S::Ok, S::Error>
        where
            S: Serializer,
            T: Into<u128> + Copy,
        {
            match value {
                Some(v) => super::serialize(v, serializer),
                None => serializer.serialize_none(),
            }
        }

        pub fn deserialize<'de, D, T>(deserializer: D) -> Result<Option<T>, D::Error>
        where
            D: Deserializer<'de>,
            T: TryFrom<u128>,
        {
            let raw = serde_json::Value::deserialize(deserializer)?;
            if raw.is_null() {
                return Ok(None);
            }
            parse(&raw)
                .and_then(|v| T::try_from(v).ok())
                .map(Some)
                .ok_or_else(|| D::Error::custom(format!("invalid quantity: {raw}")))
        }
    }
}

// ── Transactions ────────────────────────────────────────────────

/// Transaction object exactly as a page submits it to `eth_sendTransaction`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionRequest {
    pub from: Address,
    #[serde(default)]
    pub to: Option<Address>,
    #[serde(default)]
    pub value: Option<U256>,
    #[serde(default, alias = "input")]
    pub data: Option<Bytes>,
    #[serde(default, with = "quantity::opt")]
    pub gas: Option<u64>,
    #[serde(default, with = "quantity::opt")]
    pub nonce: Option<u64>,
    #[serde(default, with = "quantity::opt")]
    pub chain_id: Option<u64>,
    #[serde(default, with = "quantity::opt")]
    pub gas_price: Option<u128>,
    #[serde(default, with = "quantity::opt")]
    pub max_fee_per_gas: Option<u128>,
    #[serde(default, with = "quantity::opt")]
    pub max_priority_fee_per_gas: Option<u128>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum FeeModel {
    #[serde(rename_all = "camelCase")]
    Legacy {
        #[serde(with = "quantity")]
        gas_price: u128,
    },
    #[serde(rename_all = "camelCase")]
    Eip1559 {
        #[serde(with = "quantity")]
        max_fee_per_gas: u128,
        #[serde(with = "quantity")]
        max_priority_fee_per_gas: u128,
    },
    /// The page left pricing to the wallet; the transaction pays the base fee.
    Unspecified,
}

/// A normalized, not-yet-signed transaction.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnsignedTransaction {
    pub from: Address,
    pub to: Option<Address>,
    pub value: U256,
    pub input: Bytes,
    #[serde(with = "quantity::opt")]
    pub gas: Option<u64>,
    #[serde(with = "quantity::opt")]
    pub nonce: Option<u64>,
    #[serde(with = "quantity::opt")]
    pub chain_id: Option<u64>,
    pub fees: FeeModel,
}

impl TryFrom<TransactionRequest> for UnsignedTransaction {
    type Error = RequestError;

    fn try_from(req: TransactionRequest) -> Result<Self, Self::Error> {
        let fees = match (req.gas_price, req.max_fee_per_gas, req.max_priority_fee_per_gas) {
            (Some(_), Some(_), _) | (Some(_), _, Some(_)) => {
                return Err(RequestError::InvalidParams(
                    "both gasPrice and EIP-1559 fee fields set".into(),
                ))
            }
            (Some(gas_price), None, None) => FeeModel::Legacy { gas_price },
            (None, Some(max_fee), priority) => FeeModel::Eip1559 {
                max_fee_per_gas: max_fee,
                max_priority_fee_per_gas: priority.unwrap_or(0).min(max_fee),
            },
            (None, None, Some(priority)) => FeeModel::Eip1559 {
                max_fee_per_gas: u128::MAX,
                max_priority_fee_per_gas: priority,
            },
            (None, None, None) => FeeModel::Unspecified,
        };
        Ok(Self {
            from: req.from,
            to: req.to,
            value: req.value.unwrap_or_default(),
            input: req.data.unwrap_or_default(),
            gas: req.gas,
            nonce: req.nonce,
            chain_id: req.chain_id,
            fees,
        })
    }
}

impl UnsignedTransaction {
    /// Stable identifier used to address the transaction inside the
    /// simulation stack before it has a real hash.
    pub fn identifier(&self) -> B256 {
        // Serializing a struct without maps is deterministic.
        let encoded = serde_json::to_vec(self).unwrap_or_default();
        keccak256(encoded)
    }

    /// Call object for `eth_simulateV1`.
    pub fn to_call_object(&self) -> serde_json::Value {
        let mut call = serde_json::json!({
            "from": self.from,
            "value": self.value,
            "input": self.input,
        });
        if let Some(to) = self.to {
            call["to"] = serde_json::json!(to);
        }
        if let Some(gas) = self.gas {
            call["gas"] = serde_json::json!(format!("{gas:#x}"));
        }
        if let Some(nonce) = self.nonce {
            call["nonce"] = serde_json::json!(format!("{nonce:#x}"));
        }
        match self.fees {
            FeeModel::Legacy { gas_price } => {
                call["gasPrice"] = serde_json::json!(format!("{gas_price:#x}"));
            }
            FeeModel::Eip1559 {
                max_fee_per_gas,
                max_priority_fee_per_gas,
            } => {
                call["maxFeePerGas"] = serde_json::json!(format!("{max_fee_per_gas:#x}"));
                call["maxPriorityFeePerGas"] =
                    serde_json::json!(format!("{max_priority_fee_per_gas:#x}"));
            }
            FeeModel::Unspecified => {}
        }
        call
    }

    /// Gas price this transaction pays in a block with `base_fee`.
    pub fn realized_gas_price(&self, base_fee: u128) -> u128 {
        match self.fees {
            FeeModel::Legacy { gas_price } => gas_price,
            FeeModel::Eip1559 {
                max_fee_per_gas,
                max_priority_fee_per_gas,
            } => base_fee
                .saturating_add(max_priority_fee_per_gas)
                .min(max_fee_per_gas),
            FeeModel::Unspecified => base_fee,
        }
    }
}

// ── Chains ──────────────────────────────────────────────────────

pub fn chain_name(chain_id: u64) -> String {
    match chain_id {
        1 => "Ethereum Mainnet".into(),
        5 => "Goerli".into(),
        10 => "Optimism".into(),
        137 => "Polygon".into(),
        8453 => "Base".into(),
        17000 => "Holesky".into(),
        42161 => "Arbitrum One".into(),
        11155111 => "Sepolia".into(),
        other => format!("Chain {other}"),
    }
}

// ── Tests ───────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn request(json: serde_json::Value) -> TransactionRequest {
        serde_json::from_value(json).unwrap()
    }

    #[test]
    fn test_quantity_accepts_hex_number_and_decimal() {
        assert_eq!(quantity::parse(&serde_json::json!("0x10")), Some(16));
        assert_eq!(quantity::parse(&serde_json::json!(16)), Some(16));
        assert_eq!(quantity::parse(&serde_json::json!("16")), Some(16));
        assert_eq!(quantity::parse(&serde_json::json!("0x")), Some(0));
        assert_eq!(quantity::parse(&serde_json::json!("0xzz")), None);
    }

    #[test]
    fn test_eip1559_request_normalizes() {
        let tx: UnsignedTransaction = request(serde_json::json!({
            "from": "0x1111111111111111111111111111111111111111",
            "to": "0x2222222222222222222222222222222222222222",
            "value": "0x64",
            "input": "0xdeadbeef",
            "maxFeePerGas": "0x77359400",
            "maxPriorityFeePerGas": "0x3b9aca00",
            "chainId": "0x1"
        }))
        .try_into()
        .unwrap();
        assert_eq!(tx.value, U256::from(100));
        assert_eq!(tx.input.as_ref(), &[0xde, 0xad, 0xbe, 0xef]);
        assert_eq!(tx.chain_id, Some(1));
        assert_eq!(
            tx.fees,
            FeeModel::Eip1559 {
                max_fee_per_gas: 2_000_000_000,
                max_priority_fee_per_gas: 1_000_000_000
            }
        );
    }

    #[test]
    fn test_mixed_fee_fields_rejected() {
        let result: Result<UnsignedTransaction, _> = request(serde_json::json!({
            "from": "0x1111111111111111111111111111111111111111",
            "gasPrice": "0x1",
            "maxFeePerGas": "0x2"
        }))
        .try_into();
        assert!(result.is_err());
    }

    #[test]
    fn test_realized_gas_price_is_clamped_to_max_fee() {
        let mut tx: UnsignedTransaction = request(serde_json::json!({
            "from": "0x1111111111111111111111111111111111111111",
            "maxFeePerGas": "100",
            "maxPriorityFeePerGas": "30"
        }))
        .try_into()
        .unwrap();
        assert_eq!(tx.realized_gas_price(50), 80);
        assert_eq!(tx.realized_gas_price(90), 100);
        tx.fees = FeeModel::Legacy { gas_price: 7 };
        assert_eq!(tx.realized_gas_price(90), 7);
    }

    #[test]
    fn test_identifier_is_stable() {
        let tx: UnsignedTransaction = request(serde_json::json!({
            "from": "0x1111111111111111111111111111111111111111",
            "value": "0x1"
        }))
        .try_into()
        .unwrap();
        assert_eq!(tx.identifier(), tx.clone().identifier());
        let mut other = tx.clone();
        other.value = U256::from(2);
        assert_ne!(tx.identifier(), other.identifier());
    }

    #[test]
    fn test_chain_names() {
        assert_eq!(chain_name(1), "Ethereum Mainnet");
        assert_eq!(chain_name(5), "Goerli");
        assert_eq!(chain_name(999), "Chain 999");
    }
}
