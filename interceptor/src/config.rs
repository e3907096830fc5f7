//! Configuration for the Interceptor.

use alloy_primitives::Address;
use anyhow::{bail, Context, Result};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Config {
    /// Upstream Ethereum RPC URL (HTTP)
    pub rpc_url: String,

    /// Upstream WebSocket URL used for `eth_subscribe`
    pub ws_url: String,

    /// Host to bind to
    pub host: String,

    /// Port to listen on
    pub port: u16,

    /// Chain the wallet starts connected to
    pub chain_id: u64,

    /// Expected block interval; also the polling interval
    pub block_time: Duration,

    /// How long without a focused decision surface before polling sleeps
    pub idle_window: Duration,

    /// Network timeout for a single RPC call
    pub rpc_timeout: Duration,

    /// EIP-1559 priority fee (wei) at or above which BIG_FEE fires
    pub priority_fee_floor: u128,

    /// Legacy gas price multiple of the network estimate at which BIG_FEE fires
    pub legacy_gas_multiplier: u128,

    /// Bounded outbound queue depth per page connection
    pub socket_queue: usize,

    /// Capacity of the per-block code lookup cache
    pub code_cache_capacity: usize,

    /// Keep approved transactions in the simulation stack instead of
    /// forwarding them to the signer
    pub simulation_mode: bool,

    /// Account the wallet acts for, if known up front
    pub active_address: Option<Address>,

    /// Optional JSON address book merged into the metadata store
    pub address_book: Option<PathBuf>,

    /// HTTP endpoints of further chains pages may switch to, by chain id
    pub chain_rpc_urls: BTreeMap<u64, String>,

    /// Bearer token the decision API requires, if set
    pub decision_token: Option<String>,

    /// Browser origin allowed to call the decision API (the wallet UI)
    pub decision_origin: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            rpc_url: "https://ethereum.publicnode.com".into(),
            ws_url: "wss://ethereum.publicnode.com".into(),
            host: "127.0.0.1".into(),
            port: 8547,
            chain_id: 1,
            block_time: Duration::from_secs(12),
            idle_window: Duration::from_secs(24),
            rpc_timeout: Duration::from_millis(10_000),
            priority_fee_floor: 1_000_000_000,
            legacy_gas_multiplier: 10,
            socket_queue: 64,
            code_cache_capacity: 512,
            simulation_mode: true,
            active_address: None,
            address_book: None,
            chain_rpc_urls: BTreeMap::new(),
            decision_token: None,
            decision_origin: None,
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let rpc_url = std::env::var("INTERCEPTOR_RPC_URL")
            .unwrap_or_else(|_| "https://ethereum.publicnode.com".into());
        let ws_url = std::env::var("INTERCEPTOR_WS_URL")
            .unwrap_or_else(|_| derive_ws_url(&rpc_url));
        let block_time_secs: u64 = std::env::var("INTERCEPTOR_BLOCK_TIME_SECS")
            .unwrap_or_else(|_| "12".into())
            .parse()
            .context("Invalid INTERCEPTOR_BLOCK_TIME_SECS")?;
        let idle_secs: u64 = match std::env::var("INTERCEPTOR_IDLE_SECS") {
            Ok(raw) => raw.parse().context("Invalid INTERCEPTOR_IDLE_SECS")?,
            Err(_) => block_time_secs * 2,
        };
        let priority_floor_gwei: u128 = std::env::var("INTERCEPTOR_PRIORITY_FEE_FLOOR_GWEI")
            .unwrap_or_else(|_| "1".into())
            .parse()
            .context("Invalid INTERCEPTOR_PRIORITY_FEE_FLOOR_GWEI")?;

        Ok(Config {
            rpc_url,
            ws_url,
            host: std::env::var("INTERCEPTOR_HOST").unwrap_or_else(|_| "127.0.0.1".into()),
            port: std::env::var("INTERCEPTOR_PORT")
                .unwrap_or_else(|_| "8547".into())
                .parse()
                .context("Invalid INTERCEPTOR_PORT")?,
            chain_id: std::env::var("INTERCEPTOR_CHAIN_ID")
                .unwrap_or_else(|_| "1".into())
                .parse()
                .context("Invalid INTERCEPTOR_CHAIN_ID")?,
            block_time: Duration::from_secs(block_time_secs),
            idle_window: Duration::from_secs(idle_secs),
            rpc_timeout: Duration::from_millis(
                std::env::var("INTERCEPTOR_RPC_TIMEOUT_MS")
                    .unwrap_or_else(|_| "10000".into())
                    .parse()
                    .context("Invalid INTERCEPTOR_RPC_TIMEOUT_MS")?,
            ),
            priority_fee_floor: priority_floor_gwei * 1_000_000_000,
            legacy_gas_multiplier: std::env::var("INTERCEPTOR_LEGACY_GAS_MULTIPLIER")
                .unwrap_or_else(|_| "10".into())
                .parse()
                .unwrap_or(10),
            socket_queue: std::env::var("INTERCEPTOR_SOCKET_QUEUE")
                .unwrap_or_else(|_| "64".into())
                .parse()
                .unwrap_or(64),
            code_cache_capacity: std::env::var("INTERCEPTOR_CODE_CACHE")
                .unwrap_or_else(|_| "512".into())
                .parse()
                .unwrap_or(512),
            simulation_mode: std::env::var("INTERCEPTOR_SIMULATION_MODE")
                .unwrap_or_else(|_| "true".into())
                .parse()
                .unwrap_or(true),
            active_address: match std::env::var("INTERCEPTOR_ACTIVE_ADDRESS") {
                Ok(raw) => Some(raw.parse::<Address>().context("Invalid INTERCEPTOR_ACTIVE_ADDRESS")?),
                Err(_) => None,
            },
            address_book: std::env::var("INTERCEPTOR_ADDRESS_BOOK").ok().map(PathBuf::from),
            chain_rpc_urls: match std::env::var("INTERCEPTOR_CHAIN_RPC_URLS") {
                Ok(raw) => parse_chain_rpc_urls(&raw).context("Invalid INTERCEPTOR_CHAIN_RPC_URLS")?,
                Err(_) => BTreeMap::new(),
            },
            decision_token: std::env::var("INTERCEPTOR_DECISION_TOKEN").ok(),
            decision_origin: std::env::var("INTERCEPTOR_DECISION_ORIGIN").ok(),
        })
    }

    /// Every chain with an endpoint: the primary chain plus the extras, as
    /// `(rpc_url, ws_url)`.
    pub fn chain_endpoints(&self) -> BTreeMap<u64, (String, String)> {
        let mut endpoints: BTreeMap<u64, (String, String)> = self
            .chain_rpc_urls
            .iter()
            .map(|(chain, url)| (*chain, (url.clone(), derive_ws_url(url))))
            .collect();
        endpoints.insert(self.chain_id, (self.rpc_url.clone(), self.ws_url.clone()));
        endpoints
    }
}

/// `5=https://goerli.example,137=https://polygon.example`
fn parse_chain_rpc_urls(raw: &str) -> Result<BTreeMap<u64, String>> {
    let mut urls = BTreeMap::new();
    for entry in raw.split(',').map(str::trim).filter(|e| !e.is_empty()) {
        let Some((chain, url)) = entry.split_once('=') else {
            bail!("expected <chainId>=<url>, got {entry:?}");
        };
        let chain: u64 = chain
            .trim()
            .parse()
            .with_context(|| format!("bad chain id in {entry:?}"))?;
        urls.insert(chain, url.trim().to_string());
    }
    Ok(urls)
}

/// `https://host/path` → `wss://host/path`, `http` → `ws`.
fn derive_ws_url(rpc_url: &str) -> String {
    if let Some(rest) = rpc_url.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = rpc_url.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        rpc_url.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ws_url_derivation() {
        assert_eq!(derive_ws_url("https://node.example/v1"), "wss://node.example/v1");
        assert_eq!(derive_ws_url("http://127.0.0.1:8545"), "ws://127.0.0.1:8545");
        assert_eq!(derive_ws_url("wss://already"), "wss://already");
    }

    #[test]
    fn test_chain_rpc_urls() {
        let urls = parse_chain_rpc_urls("5=https://goerli.example, 137=http://polygon.local").unwrap();
        assert_eq!(urls[&5], "https://goerli.example");
        assert_eq!(urls[&137], "http://polygon.local");
        assert!(parse_chain_rpc_urls("goerli").is_err());
        assert!(parse_chain_rpc_urls("x=https://a").is_err());

        let config = Config {
            chain_rpc_urls: urls,
            ..Config::default()
        };
        let endpoints = config.chain_endpoints();
        assert_eq!(endpoints.len(), 3);
        assert_eq!(endpoints[&1].1, "wss://ethereum.publicnode.com");
        assert_eq!(endpoints[&137].1, "ws://polygon.local");
    }

    #[test]
    fn test_default_idle_window_is_two_blocks() {
        let config = Config::default();
        assert_eq!(config.idle_window, config.block_time * 2);
    }
}
