//! Application state: every long-lived component, built once at startup and
//! shared by `Arc`.

use crate::abi::TokenCallDecoder;
use crate::board::DecisionBoard;
use crate::collaborators::{AddressMetadataStore, InMemoryMetadata, InMemorySettings, Settings};
use crate::config::Config;
use crate::error::ErrorSink;
use crate::polling::BlockPoller;
use crate::protectors::{FeePolicy, ProtectorPipeline};
use crate::router::{ChainEndpoint, MessageRouter, RouterParts};
use crate::rpc::{EthereumClient, HttpTransport, RpcTransport};
use crate::simulation::SimulationEngine;
use crate::socket::SocketRegistry;
use crate::subscriptions::SubscriptionMultiplexer;
use anyhow::{Context, Result};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::info;

pub struct AppState {
    pub config: Config,
    pub settings: Arc<InMemorySettings>,
    pub client: Arc<EthereumClient>,
    pub poller: Arc<BlockPoller>,
    pub simulation: Arc<SimulationEngine>,
    pub subscriptions: Arc<SubscriptionMultiplexer>,
    pub sockets: Arc<SocketRegistry>,
    pub board: Arc<DecisionBoard>,
    pub router: Arc<MessageRouter>,
    pub errors: ErrorSink,
}

impl AppState {
    /// Wire the components together over an arbitrary upstream transport,
    /// with no chain to switch to besides the configured one.
    pub fn new(
        config: Config,
        transport: Arc<dyn RpcTransport>,
        metadata: Arc<dyn AddressMetadataStore>,
        errors: ErrorSink,
    ) -> Arc<Self> {
        Self::with_chains(config, transport, BTreeMap::new(), metadata, errors)
    }

    /// `transport` serves `config.chain_id`; `others` are the chains pages
    /// may switch to.
    pub fn with_chains(
        config: Config,
        transport: Arc<dyn RpcTransport>,
        others: BTreeMap<u64, ChainEndpoint>,
        metadata: Arc<dyn AddressMetadataStore>,
        errors: ErrorSink,
    ) -> Arc<Self> {
        let mut chains = others;
        chains.insert(
            config.chain_id,
            ChainEndpoint {
                transport: transport.clone(),
                ws_url: config.ws_url.clone(),
            },
        );
        let client = Arc::new(EthereumClient::new(transport, errors.clone()));
        let poller = Arc::new(BlockPoller::new(
            client.clone(),
            config.block_time,
            config.idle_window,
        ));
        let simulation = Arc::new(SimulationEngine::new(
            client.clone(),
            errors.clone(),
            config.code_cache_capacity,
        ));
        let subscriptions = Arc::new(SubscriptionMultiplexer::new(
            config.ws_url.clone(),
            config.rpc_timeout,
        ));
        let settings = Arc::new(InMemorySettings::new(Settings {
            active_chain: config.chain_id,
            active_address: config.active_address,
            simulation_mode: config.simulation_mode,
        }));
        let sockets = Arc::new(SocketRegistry::new());
        let board = Arc::new(DecisionBoard::new(poller.clone()));

        let router = Arc::new(MessageRouter::new(RouterParts {
            settings: settings.clone(),
            client: client.clone(),
            poller: poller.clone(),
            simulation: simulation.clone(),
            pipeline: ProtectorPipeline::standard(FeePolicy {
                priority_fee_floor: config.priority_fee_floor,
                legacy_gas_multiplier: config.legacy_gas_multiplier,
            }),
            decoder: Arc::new(TokenCallDecoder),
            metadata,
            subscriptions: subscriptions.clone(),
            sockets: sockets.clone(),
            surface: board.clone(),
            chains,
        }));

        Arc::new(Self {
            config,
            settings,
            client,
            poller,
            simulation,
            subscriptions,
            sockets,
            board,
            router,
            errors,
        })
    }

    /// Production wiring: HTTP upstream, known routers plus the configured
    /// address book.
    pub fn from_config(config: Config, errors: ErrorSink) -> Result<Arc<Self>> {
        let transport = HttpTransport::new(&config.rpc_url, config.rpc_timeout)
            .context("Failed to build RPC transport")?;

        let mut others = BTreeMap::new();
        for (chain_id, (rpc_url, ws_url)) in config.chain_endpoints() {
            if chain_id == config.chain_id {
                continue;
            }
            let transport = HttpTransport::new(&rpc_url, config.rpc_timeout)
                .with_context(|| format!("Failed to build RPC transport for chain {chain_id}"))?;
            others.insert(
                chain_id,
                ChainEndpoint {
                    transport: Arc::new(transport),
                    ws_url,
                },
            );
        }
        info!(chains = ?others.keys().collect::<Vec<_>>(), "Configured switchable chains");

        let mut metadata = InMemoryMetadata::new().with_known_routers();
        if let Some(path) = &config.address_book {
            metadata = metadata.load_address_book(path)?;
            info!(path = %path.display(), "Loaded address book");
        }

        Ok(Self::with_chains(
            config,
            Arc::new(transport),
            others,
            Arc::new(metadata),
            errors,
        ))
    }

    /// Start the block poller and the stack refresher.
    pub fn spawn_background(&self) -> Vec<JoinHandle<()>> {
        vec![
            tokio::spawn(self.poller.clone().run()),
            tokio::spawn(self.router.clone().follow_blocks()),
        ]
    }
}

// ── Tests ───────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::SettingsStore;
    use crate::rpc::testing::ScriptedTransport;
    use alloy_primitives::address;

    #[test]
    fn test_settings_follow_config() {
        let config = Config {
            chain_id: 5,
            simulation_mode: false,
            active_address: Some(address!("1111111111111111111111111111111111111111")),
            ..Config::default()
        };
        let (sink, _rx) = ErrorSink::new();
        let transport = ScriptedTransport::new(|_, _| Ok(serde_json::json!("0x1")));
        let state = AppState::new(config, transport, Arc::new(InMemoryMetadata::new()), sink);

        let settings = state.settings.settings();
        assert_eq!(settings.active_chain, 5);
        assert!(!settings.simulation_mode);
        assert!(settings.active_address.is_some());
        assert_eq!(state.sockets.connection_count(), 0);
        assert_eq!(state.router.pending_decisions(), 0);
    }

    #[tokio::test]
    async fn test_extra_chains_are_switchable() {
        let (sink, _rx) = ErrorSink::new();
        let mainnet = ScriptedTransport::new(|_, _| Ok(serde_json::json!("0x1")));
        let polygon = ScriptedTransport::new(|_, _| Ok(serde_json::json!("0x2a")));
        let state = AppState::with_chains(
            Config::default(),
            mainnet,
            BTreeMap::from([(
                137,
                ChainEndpoint {
                    transport: polygon.clone(),
                    ws_url: "ws://127.0.0.1:1".into(),
                },
            )]),
            Arc::new(InMemoryMetadata::new()),
            sink,
        );

        assert!(state.router.apply_chain(10).await.is_err());
        state.router.apply_chain(137).await.unwrap();
        assert_eq!(state.settings.settings().active_chain, 137);
        assert_eq!(state.poller.latest_block(), Some(42));
        assert_eq!(polygon.calls("eth_blockNumber"), 1);
    }

    #[tokio::test]
    async fn test_from_config_rejects_missing_address_book() {
        let config = Config {
            address_book: Some("/nonexistent/address-book.json".into()),
            ..Config::default()
        };
        let (sink, _rx) = ErrorSink::new();
        assert!(AppState::from_config(config, sink).is_err());
    }
}
