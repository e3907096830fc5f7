//! JSON-RPC client for the upstream Ethereum node.
//!
//! Every call gets a strictly increasing id and is classified into one of
//! four outcomes: a result, a transport failure (`FailedToFetch`, retryable),
//! an HTTP-level failure, or a JSON-RPC protocol error. Bodies that do not
//! match the envelope are reported to the [`ErrorSink`] and fail closed.

use crate::error::{ErrorSink, RpcError};
use crate::types::{quantity, JsonRpcError, JsonRpcRequest};
use alloy_primitives::{Address, Bytes, B256, U256};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tracing::{debug, info};

/// Moves one serialized request to the node and returns the raw body.
#[async_trait]
pub trait RpcTransport: Send + Sync {
    async fn post(&self, request: &JsonRpcRequest) -> Result<serde_json::Value, RpcError>;
}

/// HTTP transport backed by `reqwest`.
pub struct HttpTransport {
    client: reqwest::Client,
    url: String,
}

impl HttpTransport {
    pub fn new(url: &str, timeout: Duration) -> Result<Self, RpcError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| RpcError::FailedToFetch(e.to_string()))?;
        Ok(Self {
            client,
            url: url.to_string(),
        })
    }
}

#[async_trait]
impl RpcTransport for HttpTransport {
    async fn post(&self, request: &JsonRpcRequest) -> Result<serde_json::Value, RpcError> {
        let resp = self
            .client
            .post(&self.url)
            .json(request)
            .send()
            .await
            .map_err(|e| RpcError::FailedToFetch(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            return Err(RpcError::Http {
                status: status.as_u16(),
            });
        }

        resp.json::<serde_json::Value>().await.map_err(|e| {
            if e.is_timeout() {
                RpcError::FailedToFetch(e.to_string())
            } else {
                RpcError::Malformed(format!("body is not JSON: {e}"))
            }
        })
    }
}

/// Subset of a block header the engine and poller need.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockHeader {
    #[serde(with = "quantity")]
    pub number: u64,
    pub hash: B256,
    #[serde(with = "quantity")]
    pub timestamp: u64,
    #[serde(with = "quantity")]
    pub gas_used: u64,
    #[serde(with = "quantity")]
    pub gas_limit: u64,
    #[serde(default, with = "quantity::opt")]
    pub base_fee_per_gas: Option<u128>,
}

pub struct EthereumClient {
    transport: RwLock<Arc<dyn RpcTransport>>,
    next_id: AtomicU64,
    errors: ErrorSink,
}

impl EthereumClient {
    pub fn new(transport: Arc<dyn RpcTransport>, errors: ErrorSink) -> Self {
        Self {
            transport: RwLock::new(transport),
            next_id: AtomicU64::new(1),
            errors,
        }
    }

    /// Point every later call at another node. Calls already in flight
    /// finish on the old one.
    pub fn set_transport(&self, transport: Arc<dyn RpcTransport>) {
        *self.transport.write().unwrap_or_else(|e| e.into_inner()) = transport;
        info!("RPC transport replaced");
    }

    fn transport(&self) -> Arc<dyn RpcTransport> {
        self.transport
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Issue one JSON-RPC call and return its `result`.
    pub async fn call(
        &self,
        method: &str,
        params: serde_json::Value,
    ) -> Result<serde_json::Value, RpcError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let request = JsonRpcRequest::new(id, method, params);
        debug!(id, method, "RPC call");

        let outcome = self
            .transport()
            .post(&request)
            .await
            .and_then(|body| parse_envelope(id, body));
        match outcome {
            Err(RpcError::Malformed(detail)) => {
                self.errors
                    .report("rpc", format!("{method} returned a malformed response: {detail}"));
                Err(RpcError::Malformed(detail))
            }
            other => other,
        }
    }

    async fn call_typed<T: DeserializeOwned>(
        &self,
        method: &str,
        params: serde_json::Value,
    ) -> Result<T, RpcError> {
        let value = self.call(method, params).await?;
        serde_json::from_value(value).map_err(|e| {
            let detail = format!("{method} result did not match schema: {e}");
            self.errors.report("rpc", detail.clone());
            RpcError::Malformed(detail)
        })
    }

    async fn call_quantity(
        &self,
        method: &str,
        params: serde_json::Value,
    ) -> Result<u128, RpcError> {
        let value = self.call(method, params).await?;
        quantity::parse(&value).ok_or_else(|| {
            let detail = format!("{method} returned a non-quantity: {value}");
            self.errors.report("rpc", detail.clone());
            RpcError::Malformed(detail)
        })
    }

    pub async fn block_number(&self) -> Result<u64, RpcError> {
        let n = self.call_quantity("eth_blockNumber", serde_json::json!([])).await?;
        Ok(n as u64)
    }

    pub async fn chain_id(&self) -> Result<u64, RpcError> {
        let n = self.call_quantity("eth_chainId", serde_json::json!([])).await?;
        Ok(n as u64)
    }

    pub async fn gas_price(&self) -> Result<u128, RpcError> {
        self.call_quantity("eth_gasPrice", serde_json::json!([])).await
    }

    pub async fn get_block(&self, number: u64) -> Result<BlockHeader, RpcError> {
        self.call_typed(
            "eth_getBlockByNumber",
            serde_json::json!([format!("{number:#x}"), false]),
        )
        .await
    }

    pub async fn get_code(&self, address: Address, block: u64) -> Result<Bytes, RpcError> {
        self.call_typed(
            "eth_getCode",
            serde_json::json!([address, format!("{block:#x}")]),
        )
        .await
    }

    pub async fn get_balance(&self, address: Address, block: u64) -> Result<U256, RpcError> {
        self.call_typed(
            "eth_getBalance",
            serde_json::json!([address, format!("{block:#x}")]),
        )
        .await
    }

    pub async fn get_transaction_count(
        &self,
        address: Address,
        block: u64,
    ) -> Result<u64, RpcError> {
        let n = self
            .call_quantity(
                "eth_getTransactionCount",
                serde_json::json!([address, format!("{block:#x}")]),
            )
            .await?;
        Ok(n as u64)
    }

    /// Batched call emulation against `parent_block`.
    pub async fn simulate_v1(
        &self,
        payload: serde_json::Value,
        parent_block: u64,
    ) -> Result<serde_json::Value, RpcError> {
        self.call(
            "eth_simulateV1",
            serde_json::json!([payload, format!("{parent_block:#x}")]),
        )
        .await
    }
}

/// Validate a response envelope and split it into result or error.
fn parse_envelope(id: u64, body: serde_json::Value) -> Result<serde_json::Value, RpcError> {
    let obj = body
        .as_object()
        .ok_or_else(|| RpcError::Malformed("response is not an object".into()))?;

    if obj.get("jsonrpc").and_then(|v| v.as_str()) != Some("2.0") {
        return Err(RpcError::Malformed("missing jsonrpc version".into()));
    }
    if let Some(resp_id) = obj.get("id") {
        if !resp_id.is_null() && quantity::parse(resp_id) != Some(u128::from(id)) {
            return Err(RpcError::Malformed(format!(
                "response id {resp_id} does not match request id {id}"
            )));
        }
    }

    if let Some(error) = obj.get("error") {
        let err: JsonRpcError = serde_json::from_value(error.clone())
            .map_err(|e| RpcError::Malformed(format!("error object: {e}")))?;
        return Err(RpcError::Protocol {
            code: err.code,
            message: err.message,
            data: err.data,
        });
    }

    obj.get("result")
        .cloned()
        .ok_or_else(|| RpcError::Malformed("neither result nor error present".into()))
}

// ── Test transport ──────────────────────────────────────────────


// ── Tests ───────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use std::sync::Mutex;

    struct Recording {
        ids: Mutex<Vec<u64>>,
        body: serde_json::Value,
    }

    #[async_trait]
    impl RpcTransport for Recording {
        async fn post(&self, request: &JsonRpcRequest) -> Result<serde_json::Value, RpcError> {
            self.ids.lock().unwrap().push(request.id);
            let mut body = self.body.clone();
            body["id"] = serde_json::json!(request.id);
            Ok(body)
        }
    }

    #[tokio::test]
    async fn test_ids_strictly_increase() {
        let transport = Arc::new(Recording {
            ids: Mutex::new(Vec::new()),
            body: serde_json::json!({"jsonrpc": "2.0", "result": "0x10"}),
        });
        let (sink, _rx) = ErrorSink::new();
        let client = EthereumClient::new(transport.clone(), sink);
        for _ in 0..3 {
            assert_eq!(client.block_number().await.unwrap(), 16);
        }
        let ids = transport.ids.lock().unwrap().clone();
        assert!(ids.windows(2).all(|w| w[0] < w[1]));
    }

    #[tokio::test]
    async fn test_protocol_error_is_typed() {
        let transport = ScriptedTransport::new(|_, _| {
            Err(RpcError::Protocol {
                code: -32000,
                message: "header not found".into(),
                data: None,
            })
        });
        let err = client(transport).block_number().await.unwrap_err();
        assert_eq!(
            err,
            RpcError::Protocol {
                code: -32000,
                message: "header not found".into(),
                data: None
            }
        );
    }

    #[tokio::test]
    async fn test_transport_failure_passes_through() {
        let transport =
            ScriptedTransport::new(|_, _| Err(RpcError::FailedToFetch("connection refused".into())));
        let err = client(transport).chain_id().await.unwrap_err();
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_malformed_result_reaches_error_sink() {
        let transport = ScriptedTransport::new(|_, _| Ok(serde_json::json!({"not": "a number"})));
        let (sink, mut rx) = ErrorSink::new();
        let client = EthereumClient::new(transport, sink);
        let err = client.block_number().await.unwrap_err();
        assert!(matches!(err, RpcError::Malformed(_)));
        assert_eq!(rx.recv().await.unwrap().source, "rpc");
    }

    #[tokio::test]
    async fn test_unreadable_body_reaches_error_sink() {
        let transport = ScriptedTransport::new(|_, _| {
            Err(RpcError::Malformed("body is not JSON: eof".into()))
        });
        let (sink, mut rx) = ErrorSink::new();
        let client = EthereumClient::new(transport, sink);
        let err = client.chain_id().await.unwrap_err();
        assert!(matches!(err, RpcError::Malformed(_)));
        let report = rx.recv().await.unwrap();
        assert_eq!(report.source, "rpc");
        assert!(report.message.contains("eth_chainId"));
    }

    #[tokio::test]
    async fn test_replaced_transport_serves_later_calls() {
        let mainnet = ScriptedTransport::new(|_, _| Ok(serde_json::json!("0x1")));
        let goerli = ScriptedTransport::new(|_, _| Ok(serde_json::json!("0x5")));
        let client = client(mainnet.clone());
        assert_eq!(client.chain_id().await.unwrap(), 1);

        client.set_transport(goerli.clone());
        assert_eq!(client.chain_id().await.unwrap(), 5);
        assert_eq!(mainnet.total_calls(), 1);
        assert_eq!(goerli.total_calls(), 1);
    }

    #[tokio::test]
    async fn test_transport_failure_is_not_reported() {
        let transport =
            ScriptedTransport::new(|_, _| Err(RpcError::FailedToFetch("timeout".into())));
        let (sink, mut rx) = ErrorSink::new();
        let client = EthereumClient::new(transport, sink);
        assert!(client.chain_id().await.is_err());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_envelope_without_result_or_error_is_malformed() {
        let err = parse_envelope(1, serde_json::json!({"jsonrpc": "2.0", "id": 1})).unwrap_err();
        assert!(matches!(err, RpcError::Malformed(_)));
    }

    #[test]
    fn test_envelope_null_result_is_ok() {
        let result =
            parse_envelope(7, serde_json::json!({"jsonrpc": "2.0", "id": 7, "result": null}))
                .unwrap();
        assert!(result.is_null());
    }

    #[test]
    fn test_envelope_id_mismatch_is_malformed() {
        let err = parse_envelope(
            7,
            serde_json::json!({"jsonrpc": "2.0", "id": 8, "result": "0x1"}),
        )
        .unwrap_err();
        assert!(matches!(err, RpcError::Malformed(_)));
    }

    #[tokio::test]
    async fn test_block_header_decodes() {
        let transport = ScriptedTransport::new(|_, _| {
            Ok(serde_json::json!({
                "number": "0x10",
                "hash": format!("0x{}", "ab".repeat(32)),
                "timestamp": "0x5",
                "gasUsed": "0x0",
                "gasLimit": "0x1c9c380",
                "baseFeePerGas": "0x3b9aca00",
                "transactions": []
            }))
        });
        let header = client(transport).get_block(16).await.unwrap();
        assert_eq!(header.number, 16);
        assert_eq!(header.base_fee_per_gas, Some(1_000_000_000));
        assert_eq!(header.gas_limit, 30_000_000);
    }
}
