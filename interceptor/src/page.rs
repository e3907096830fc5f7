//! Messages exchanged with page connections.
//!
//! A raw page message is parsed exactly once into [`PageRequest`]; anything
//! that does not fit a known shape is rejected here with
//! [`RequestError::InvalidParams`] before it reaches the router.

use crate::error::{DecisionError, RequestError, RpcError, SimulationError, SubscriptionError};
use crate::types::{quantity, TransactionRequest, UnsignedTransaction};
use alloy_primitives::Address;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// EIP-1193 "user rejected request".
pub const USER_REJECTED: i64 = 4001;
/// EIP-3085 "unrecognized chain ID" for chains with no configured endpoint.
pub const UNRECOGNIZED_CHAIN: i64 = 4902;
/// JSON-RPC "invalid params", used for parse failures.
pub const INVALID_PARAMS: i64 = -32602;
pub const METHOD_NOT_FOUND: i64 = -32601;
pub const INTERNAL_ERROR: i64 = -32603;

/// Outer frame on the page connection, in both directions.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PageEnvelope {
    pub data: Value,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawPageRequest {
    pub request_id: u64,
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PageRequest {
    SendTransaction(UnsignedTransaction),
    PersonalSign { message: Value, address: Value },
    SignTypedData { address: Value, typed_data: Value },
    SwitchChain { chain_id: u64 },
    ChainId,
    BlockNumber,
    RequestAccounts,
    GetBalance { address: Address },
    GetCode { address: Address },
    Subscribe { kind: String },
    Unsubscribe { id: String },
    Passthrough { method: String, params: Value },
}

fn param(params: &Value, index: usize) -> Option<&Value> {
    params.as_array().and_then(|a| a.get(index))
}

fn invalid(method: &str, detail: impl std::fmt::Display) -> RequestError {
    RequestError::InvalidParams(format!("{method}: {detail}"))
}

/// Reads against the simulated head; anything pinned to another block goes
/// straight upstream.
fn reads_latest(tag: Option<&Value>) -> bool {
    match tag {
        None | Some(Value::Null) => true,
        Some(Value::String(s)) => s == "latest" || s == "pending",
        Some(_) => false,
    }
}

fn address_param(method: &str, params: &Value) -> Result<Address, RequestError> {
    let value = param(params, 0).ok_or_else(|| invalid(method, "missing address"))?;
    serde_json::from_value(value.clone()).map_err(|e| invalid(method, e))
}

impl PageRequest {
    pub fn parse(raw: &RawPageRequest) -> Result<Self, RequestError> {
        let method = raw.method.as_str();
        let params = &raw.params;
        Ok(match method {
            "eth_sendTransaction" => {
                let object = param(params, 0).ok_or_else(|| invalid(method, "missing transaction"))?;
                let request: TransactionRequest =
                    serde_json::from_value(object.clone()).map_err(|e| invalid(method, e))?;
                PageRequest::SendTransaction(UnsignedTransaction::try_from(request)?)
            }
            "personal_sign" => PageRequest::PersonalSign {
                message: param(params, 0).cloned().ok_or_else(|| invalid(method, "missing message"))?,
                address: param(params, 1).cloned().unwrap_or(Value::Null),
            },
            "eth_signTypedData_v4" => {
                let raw_data = param(params, 1).ok_or_else(|| invalid(method, "missing typed data"))?;
                // Pages send the payload either as an object or as a JSON string.
                let typed_data = match raw_data {
                    Value::String(s) => serde_json::from_str(s).map_err(|e| invalid(method, e))?,
                    other => other.clone(),
                };
                PageRequest::SignTypedData {
                    address: param(params, 0).cloned().unwrap_or(Value::Null),
                    typed_data,
                }
            }
            "wallet_switchEthereumChain" => {
                let chain_id = param(params, 0)
                    .and_then(|p| p.get("chainId"))
                    .and_then(quantity::parse)
                    .and_then(|v| u64::try_from(v).ok())
                    .ok_or_else(|| invalid(method, "missing or invalid chainId"))?;
                PageRequest::SwitchChain { chain_id }
            }
            "eth_chainId" => PageRequest::ChainId,
            "eth_blockNumber" => PageRequest::BlockNumber,
            "eth_requestAccounts" | "eth_accounts" => PageRequest::RequestAccounts,
            "eth_getBalance" if reads_latest(param(params, 1)) => PageRequest::GetBalance {
                address: address_param(method, params)?,
            },
            "eth_getCode" if reads_latest(param(params, 1)) => PageRequest::GetCode {
                address: address_param(method, params)?,
            },
            "eth_subscribe" => PageRequest::Subscribe {
                kind: param(params, 0)
                    .and_then(Value::as_str)
                    .ok_or_else(|| invalid(method, "missing subscription kind"))?
                    .to_string(),
            },
            "eth_unsubscribe" => PageRequest::Unsubscribe {
                id: param(params, 0)
                    .and_then(Value::as_str)
                    .ok_or_else(|| invalid(method, "missing subscription id"))?
                    .to_string(),
            },
            _ => PageRequest::Passthrough {
                method: raw.method.clone(),
                params: params.clone(),
            },
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PageError {
    pub code: i64,
    pub message: String,
}

impl PageError {
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn user_rejected() -> Self {
        Self::new(USER_REJECTED, "User rejected the request.")
    }
}

impl From<RequestError> for PageError {
    fn from(e: RequestError) -> Self {
        Self::new(INVALID_PARAMS, e.to_string())
    }
}

impl From<DecisionError> for PageError {
    fn from(_: DecisionError) -> Self {
        Self::user_rejected()
    }
}

/// Upstream protocol errors keep their code; everything else is internal.
impl From<RpcError> for PageError {
    fn from(e: RpcError) -> Self {
        match e {
            RpcError::Protocol { code, message, .. } => Self::new(code, message),
            other => Self::new(INTERNAL_ERROR, other.to_string()),
        }
    }
}

impl From<SimulationError> for PageError {
    fn from(e: SimulationError) -> Self {
        match e {
            SimulationError::Rpc(rpc) => rpc.into(),
            other => Self::new(INTERNAL_ERROR, other.to_string()),
        }
    }
}

impl From<SubscriptionError> for PageError {
    fn from(e: SubscriptionError) -> Self {
        let code = match e {
            SubscriptionError::NotImplemented(_) => METHOD_NOT_FOUND,
            SubscriptionError::UnknownKind(_) => INVALID_PARAMS,
            _ => INTERNAL_ERROR,
        };
        Self::new(code, e.to_string())
    }
}

/// Reply to one page request.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PageResponse {
    pub request_id: u64,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<PageError>,
}

impl PageResponse {
    pub fn new(raw: &RawPageRequest, outcome: Result<Value, PageError>) -> Self {
        let (result, error) = match outcome {
            Ok(value) => (Some(value), None),
            Err(e) => (None, Some(e)),
        };
        Self {
            request_id: raw.request_id,
            method: raw.method.clone(),
            result,
            error,
        }
    }
}

// ── Tests ───────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::FeeModel;
    use serde_json::json;

    fn raw(method: &str, params: Value) -> RawPageRequest {
        RawPageRequest {
            request_id: 7,
            method: method.into(),
            params,
        }
    }

    #[test]
    fn test_send_transaction_parses_fees() {
        let req = raw(
            "eth_sendTransaction",
            json!([{
                "from": "0x1111111111111111111111111111111111111111",
                "to": "0x2222222222222222222222222222222222222222",
                "value": "0xde0b6b3a7640000",
                "maxFeePerGas": "0x77359400",
                "maxPriorityFeePerGas": "0x3b9aca00",
            }]),
        );
        let PageRequest::SendTransaction(tx) = PageRequest::parse(&req).unwrap() else {
            panic!("expected a transaction");
        };
        assert_eq!(
            tx.fees,
            FeeModel::Eip1559 {
                max_fee_per_gas: 2_000_000_000,
                max_priority_fee_per_gas: 1_000_000_000
            }
        );
    }

    #[test]
    fn test_conflicting_fees_are_invalid_params() {
        let req = raw(
            "eth_sendTransaction",
            json!([{
                "from": "0x1111111111111111111111111111111111111111",
                "gasPrice": "0x1",
                "maxFeePerGas": "0x2",
            }]),
        );
        assert!(matches!(
            PageRequest::parse(&req),
            Err(RequestError::InvalidParams(_))
        ));
    }

    #[test]
    fn test_typed_data_accepts_string_payload() {
        let payload = json!({"domain": {"chainId": 5}}).to_string();
        let req = raw("eth_signTypedData_v4", json!(["0x1111111111111111111111111111111111111111", payload]));
        let PageRequest::SignTypedData { typed_data, .. } = PageRequest::parse(&req).unwrap() else {
            panic!("expected typed data");
        };
        assert_eq!(typed_data["domain"]["chainId"], 5);
    }

    #[test]
    fn test_switch_chain_hex() {
        let req = raw("wallet_switchEthereumChain", json!([{"chainId": "0x5"}]));
        assert_eq!(
            PageRequest::parse(&req).unwrap(),
            PageRequest::SwitchChain { chain_id: 5 }
        );
        let bad = raw("wallet_switchEthereumChain", json!([]));
        assert!(PageRequest::parse(&bad).is_err());
    }

    #[test]
    fn test_historical_reads_pass_through() {
        let latest = raw("eth_getBalance", json!(["0x1111111111111111111111111111111111111111", "latest"]));
        assert!(matches!(
            PageRequest::parse(&latest).unwrap(),
            PageRequest::GetBalance { .. }
        ));
        let pinned = raw("eth_getBalance", json!(["0x1111111111111111111111111111111111111111", "0x10"]));
        assert!(matches!(
            PageRequest::parse(&pinned).unwrap(),
            PageRequest::Passthrough { .. }
        ));
    }

    #[test]
    fn test_response_shapes() {
        let req = raw("eth_chainId", json!([]));
        let ok = serde_json::to_value(PageResponse::new(&req, Ok(json!("0x1")))).unwrap();
        assert_eq!(ok, json!({"requestId": 7, "method": "eth_chainId", "result": "0x1"}));

        let denied = serde_json::to_value(PageResponse::new(&req, Err(PageError::user_rejected()))).unwrap();
        assert_eq!(denied["error"]["code"], 4001);
        assert!(denied.get("result").is_none());
    }
}
