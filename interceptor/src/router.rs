//! Message router: top-level orchestration of page requests.
//!
//! Each page request is parsed once, then either answered directly, proxied
//! upstream, or run through simulation and the protector pipeline before a
//! user decision is opened. Decisions are tracked per kind in a
//! [`DecisionBook`]; the surface for a decision stays open exactly as long
//! as the request that opened it is in flight.

use crate::abi::AbiDecoder;
use crate::collaborators::{
    AddressMetadataStore, DecisionSurface, SettingsPatch, SettingsStore, SurfaceHandle,
};
use crate::decision::{DecisionBook, DecisionFuture, DecisionKind, RequestId};
use crate::error::{DecisionError, SimulationError, TransportError};
use crate::page::{
    PageError, PageRequest, PageResponse, RawPageRequest, INTERNAL_ERROR, UNRECOGNIZED_CHAIN,
};
use crate::polling::BlockPoller;
use crate::protectors::{
    signature_chain_mismatch, ProtectorContext, ProtectorPipeline, QuarantineCode,
    QuarantineReport,
};
use crate::rpc::{EthereumClient, RpcTransport};
use crate::simulation::{SimulatedTransaction, SimulationEngine, SimulationState};
use crate::socket::{PageTransport, SocketRegistry, WebsiteSocket};
use crate::subscriptions::{SubscriptionCallback, SubscriptionMultiplexer};
use crate::types::{chain_name, UnsignedTransaction};
use alloy_primitives::B256;
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Where a chain's node is reached.
#[derive(Clone)]
pub struct ChainEndpoint {
    pub transport: Arc<dyn RpcTransport>,
    pub ws_url: String,
}

/// Everything the router drives.
pub struct RouterParts {
    pub settings: Arc<dyn SettingsStore>,
    pub client: Arc<EthereumClient>,
    pub poller: Arc<BlockPoller>,
    pub simulation: Arc<SimulationEngine>,
    pub pipeline: ProtectorPipeline,
    pub decoder: Arc<dyn AbiDecoder>,
    pub metadata: Arc<dyn AddressMetadataStore>,
    pub subscriptions: Arc<SubscriptionMultiplexer>,
    pub sockets: Arc<SocketRegistry>,
    pub surface: Arc<dyn DecisionSurface>,
    /// Chains a page may switch to, the active one included.
    pub chains: BTreeMap<u64, ChainEndpoint>,
}

/// A stacked transaction whose decision is still open.
#[derive(Clone)]
struct OpenTransaction {
    socket: WebsiteSocket,
    id: B256,
}

pub struct MessageRouter {
    settings: Arc<dyn SettingsStore>,
    client: Arc<EthereumClient>,
    poller: Arc<BlockPoller>,
    simulation: Arc<SimulationEngine>,
    pipeline: ProtectorPipeline,
    decoder: Arc<dyn AbiDecoder>,
    metadata: Arc<dyn AddressMetadataStore>,
    subscriptions: Arc<SubscriptionMultiplexer>,
    sockets: Arc<SocketRegistry>,
    surface: Arc<dyn DecisionSurface>,
    chains: BTreeMap<u64, ChainEndpoint>,
    decisions: DecisionBook,
    open_transactions: Mutex<HashMap<RequestId, OpenTransaction>>,
    page_subscriptions: Mutex<HashMap<WebsiteSocket, HashSet<String>>>,
}

/// Closes the surface and denies the decision when dropped. Denying an
/// already answered decision is a no-op, so this runs on every exit path,
/// including the request future being dropped when its page disconnects.
struct OpenSurface<'a> {
    router: &'a MessageRouter,
    handle: SurfaceHandle,
}

impl Drop for OpenSurface<'_> {
    fn drop(&mut self) {
        if self.handle.kind == DecisionKind::Transaction {
            self.router
                .open_transactions
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .remove(&self.handle.id);
        }
        self.router
            .decisions
            .table(self.handle.kind)
            .reject(self.handle.id);
        self.router.surface.close(self.handle);
    }
}

/// Takes an appended transaction back out of the stack unless disarmed.
/// Covers the request future being dropped while its decision is open.
struct StackEntry {
    simulation: Arc<SimulationEngine>,
    id: B256,
    armed: bool,
}

impl Drop for StackEntry {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let simulation = self.simulation.clone();
        let id = self.id;
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            runtime.spawn(async move { remove_from_stack(&simulation, &id).await });
        }
    }
}

async fn remove_from_stack(simulation: &SimulationEngine, id: &B256) {
    match simulation.remove_transaction(id).await {
        Ok(_) => {}
        // A chain switch may have cleared the stack meanwhile.
        Err(SimulationError::UnknownTransaction(_)) => {}
        Err(e) => warn!(id = %id, error = %e, "Failed to remove transaction from stack"),
    }
}

impl MessageRouter {
    pub fn new(parts: RouterParts) -> Self {
        Self {
            settings: parts.settings,
            client: parts.client,
            poller: parts.poller,
            simulation: parts.simulation,
            pipeline: parts.pipeline,
            decoder: parts.decoder,
            metadata: parts.metadata,
            subscriptions: parts.subscriptions,
            sockets: parts.sockets,
            surface: parts.surface,
            chains: parts.chains,
            decisions: DecisionBook::default(),
            open_transactions: Mutex::new(HashMap::new()),
            page_subscriptions: Mutex::new(HashMap::new()),
        }
    }

    // ── Connections ─────────────────────────────────────────────

    pub fn register_connection(&self, socket: &WebsiteSocket, transport: Arc<dyn PageTransport>) {
        self.sockets.register(socket, transport);
    }

    /// Tear down everything tied to a page connection.
    pub fn on_disconnect(&self, socket: &WebsiteSocket) {
        self.sockets.unregister(socket);
        let owned = self
            .page_subscriptions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(socket)
            .unwrap_or_default();
        for id in &owned {
            self.subscriptions.unsubscribe(id);
        }
        if !owned.is_empty() {
            debug!(socket = %socket, count = owned.len(), "Dropped page subscriptions");
        }
    }

    // ── Requests ────────────────────────────────────────────────

    /// Handle one request and deliver the reply to its socket.
    pub async fn dispatch(
        &self,
        socket: &WebsiteSocket,
        raw: RawPageRequest,
    ) -> Result<(), TransportError> {
        let response = self.handle(socket, &raw).await;
        let message = serde_json::to_value(&response)
            .map_err(|e| TransportError::Failed(e.to_string()))?;
        self.sockets.forward(socket, message).await
    }

    pub async fn handle(&self, socket: &WebsiteSocket, raw: &RawPageRequest) -> PageResponse {
        debug!(socket = %socket, method = %raw.method, request_id = raw.request_id, "Page request");
        let outcome = match PageRequest::parse(raw) {
            Ok(request) => self.route(socket, request).await,
            Err(e) => {
                warn!(socket = %socket, method = %raw.method, error = %e, "Rejecting malformed page request");
                Err(e.into())
            }
        };
        PageResponse::new(raw, outcome)
    }

    async fn route(&self, socket: &WebsiteSocket, request: PageRequest) -> Result<Value, PageError> {
        match request {
            PageRequest::SendTransaction(transaction) => {
                self.send_transaction(socket, transaction).await
            }
            PageRequest::PersonalSign { message, address } => {
                let request = json!({ "message": message, "address": address });
                self.sign(socket, "personal_sign", request, None).await
            }
            PageRequest::SignTypedData {
                address,
                typed_data,
            } => {
                let flag =
                    signature_chain_mismatch(&typed_data, self.settings.settings().active_chain);
                let request = json!({ "address": address, "typedData": typed_data });
                self.sign(socket, "eth_signTypedData_v4", request, flag).await
            }
            PageRequest::SwitchChain { chain_id } => self.switch_chain(socket, chain_id).await,
            PageRequest::ChainId => Ok(json!(format!(
                "{:#x}",
                self.settings.settings().active_chain
            ))),
            PageRequest::BlockNumber => {
                let block = match self.poller.latest_block() {
                    Some(block) => block,
                    None => self.client.block_number().await?,
                };
                Ok(json!(format!("{block:#x}")))
            }
            PageRequest::RequestAccounts => {
                let accounts: Vec<_> = self.settings.settings().active_address.into_iter().collect();
                Ok(json!(accounts))
            }
            PageRequest::GetBalance { address } => {
                Ok(json!(self.simulation.get_eth_balance(address).await?))
            }
            PageRequest::GetCode { address } => Ok(json!(self.simulation.get_code(address).await?)),
            PageRequest::Subscribe { kind } => self.subscribe(socket, &kind).await,
            PageRequest::Unsubscribe { id } => Ok(json!(self.unsubscribe(socket, &id))),
            PageRequest::Passthrough { method, params } => {
                Ok(self.client.call(&method, params).await?)
            }
        }
    }

    // ── Decisions ───────────────────────────────────────────────

    /// Open a decision surface and wait for the user.
    async fn decide(&self, kind: DecisionKind, payload: Value) -> Result<(), DecisionError> {
        let (decision, _open) = self.open_decision(kind, payload);
        decision.await
    }

    /// The surface stays open until the returned guard is dropped.
    fn open_decision(
        &self,
        kind: DecisionKind,
        payload: Value,
    ) -> (DecisionFuture<()>, OpenSurface<'_>) {
        let decision = self.decisions.table(kind).create();
        let handle = SurfaceHandle {
            kind,
            id: decision.id(),
        };
        self.surface.open(handle, payload);
        (
            decision,
            OpenSurface {
                router: self,
                handle,
            },
        )
    }

    /// Explicit answer from the user.
    pub fn answer(&self, kind: DecisionKind, id: RequestId, approve: bool) -> bool {
        let settled = self.decisions.answer(kind, id, approve);
        if settled {
            info!(%kind, id, approve, "Decision answered");
        }
        settled
    }

    /// The surface went away without an answer.
    pub fn surface_closed(&self, handle: SurfaceHandle) -> bool {
        self.decisions.table(handle.kind).window_closed(handle.id)
    }

    pub fn pending_decisions(&self) -> usize {
        [
            DecisionKind::ChainChange,
            DecisionKind::Signature,
            DecisionKind::Transaction,
        ]
        .into_iter()
        .map(|kind| self.decisions.table(kind).pending_count())
        .sum()
    }

    // ── Transactions ────────────────────────────────────────────

    async fn send_transaction(
        &self,
        socket: &WebsiteSocket,
        transaction: UnsignedTransaction,
    ) -> Result<Value, PageError> {
        self.poller.wake();
        let status = self.poller.status();
        if status.retrying {
            warn!(socket = %socket, error = ?status.last_error, "RPC connection down, not simulating");
            return Err(PageError::new(
                INTERNAL_ERROR,
                "RPC connection is unavailable, the transaction cannot be simulated",
            ));
        }

        let appended = self.simulation.append_transaction(transaction).await?;
        let mut entry = StackEntry {
            simulation: self.simulation.clone(),
            id: appended.id,
            armed: true,
        };
        let state = self.simulation.snapshot();
        let simulated = state.get(&appended.id).cloned().unwrap_or(appended);
        let payload = self.transaction_payload(socket, &simulated, state.clone()).await;
        let (decision, surface) = self.open_decision(DecisionKind::Transaction, payload);

        let open = OpenTransaction {
            socket: socket.clone(),
            id: simulated.id,
        };
        self.open_transactions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(decision.id(), open.clone());
        // A refresh committed while the payload was built would have missed
        // this decision.
        let latest = self.simulation.snapshot();
        if latest.block_number != state.block_number {
            self.refresh_decision(decision.id(), &open, latest).await;
        }

        let decision = decision.await;
        drop(surface);
        entry.armed = false;
        match decision {
            Ok(()) if self.settings.settings().simulation_mode => {
                info!(id = %simulated.id, "Transaction approved into the simulation stack");
                Ok(json!(simulated.id))
            }
            Ok(()) => {
                remove_from_stack(&self.simulation, &simulated.id).await;
                info!(id = %simulated.id, "Transaction approved, forwarding to signer");
                Ok(json!({ "forwardToSigner": true }))
            }
            Err(e) => {
                remove_from_stack(&self.simulation, &simulated.id).await;
                Err(e.into())
            }
        }
    }

    /// Evaluate `simulated` against the stack before it and describe it for
    /// the decision surface.
    async fn transaction_payload(
        &self,
        socket: &WebsiteSocket,
        simulated: &SimulatedTransaction,
        state: Arc<SimulationState>,
    ) -> Value {
        let settings = self.settings.settings();
        let ctx = ProtectorContext::new(
            &simulated.transaction,
            self.decoder.as_ref(),
            &self.simulation,
            &self.client,
            &settings,
            self.metadata.as_ref(),
        )
        .with_state(state.clone())
        .before(&simulated.id);
        let report = self.pipeline.evaluate(&ctx).await;
        info!(
            socket = %socket,
            id = %simulated.id,
            block = state.block_number,
            quarantine = report.quarantine,
            codes = ?report.quarantine_codes,
            "Transaction evaluated"
        );

        json!({
            "socket": socket,
            "method": "eth_sendTransaction",
            "blockNumber": state.block_number,
            "simulatedTransaction": simulated,
            "quarantine": report.quarantine,
            "quarantineReasons": report.reasons(),
        })
    }

    /// Re-describe every open transaction decision against `state`.
    async fn refresh_open_decisions(&self, state: Arc<SimulationState>) {
        let open: Vec<(RequestId, OpenTransaction)> = self
            .open_transactions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(id, open)| (*id, open.clone()))
            .collect();
        for (id, open) in open {
            self.refresh_decision(id, &open, state.clone()).await;
        }
    }

    async fn refresh_decision(
        &self,
        decision: RequestId,
        open: &OpenTransaction,
        state: Arc<SimulationState>,
    ) {
        let Some(simulated) = state.get(&open.id).cloned() else {
            return;
        };
        let payload = self.transaction_payload(&open.socket, &simulated, state.clone()).await;
        if self.simulation.snapshot().block_number > state.block_number {
            debug!(decision, block = state.block_number, "Skipping outdated decision refresh");
            return;
        }
        self.surface.update(
            SurfaceHandle {
                kind: DecisionKind::Transaction,
                id: decision,
            },
            payload,
        );
    }

    // ── Signatures ──────────────────────────────────────────────

    async fn sign(
        &self,
        socket: &WebsiteSocket,
        method: &str,
        request: Value,
        flag: Option<QuarantineCode>,
    ) -> Result<Value, PageError> {
        let report = QuarantineReport::from_codes(flag);
        if report.quarantine {
            warn!(socket = %socket, method, codes = ?report.quarantine_codes, "Signature request flagged");
        }
        let payload = json!({
            "socket": socket,
            "method": method,
            "request": request,
            "quarantine": report.quarantine,
            "quarantineReasons": report.reasons(),
        });
        self.decide(DecisionKind::Signature, payload).await?;
        Ok(json!({ "forwardToSigner": true }))
    }

    // ── Chains ──────────────────────────────────────────────────

    async fn switch_chain(&self, socket: &WebsiteSocket, chain_id: u64) -> Result<Value, PageError> {
        let current = self.settings.settings().active_chain;
        if chain_id == current {
            return Ok(Value::Null);
        }
        if !self.chains.contains_key(&chain_id) {
            warn!(socket = %socket, chain_id, "Switch to a chain with no endpoint");
            return Err(unrecognized_chain(chain_id));
        }
        let payload = json!({
            "socket": socket,
            "method": "wallet_switchEthereumChain",
            "fromChain": { "id": current, "name": chain_name(current) },
            "toChain": { "id": chain_id, "name": chain_name(chain_id) },
        });
        self.decide(DecisionKind::ChainChange, payload).await?;
        self.apply_chain(chain_id).await?;
        Ok(Value::Null)
    }

    /// Make `chain_id` active. Reads, simulation, polling and subscriptions
    /// move to its endpoint, the old chain's stack and subscriptions are
    /// dropped, and every page hears about it.
    pub async fn apply_chain(&self, chain_id: u64) -> Result<(), PageError> {
        let endpoint = self
            .chains
            .get(&chain_id)
            .cloned()
            .ok_or_else(|| unrecognized_chain(chain_id))?;
        self.simulation.cancel_in_flight();
        self.client.set_transport(endpoint.transport);
        self.subscriptions.set_ws_url(endpoint.ws_url);
        self.settings.update(SettingsPatch {
            active_chain: Some(chain_id),
            ..Default::default()
        });
        self.simulation.reset().await;
        self.poller.reset_head();

        let dropped: Vec<String> = self
            .page_subscriptions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain()
            .flat_map(|(_, ids)| ids)
            .collect();
        for id in &dropped {
            self.subscriptions.unsubscribe(id);
        }

        let delivered = self
            .sockets
            .broadcast(json!({ "method": "chainChanged", "params": format!("{chain_id:#x}") }))
            .await;
        info!(
            chain_id,
            chain = %chain_name(chain_id),
            delivered,
            subscriptions = dropped.len(),
            "Active chain changed"
        );
        if let Err(e) = self.poller.tick().await {
            warn!(chain_id, error = %e, "First poll of the new chain failed");
        }
        Ok(())
    }

    // ── Subscriptions ───────────────────────────────────────────

    async fn subscribe(&self, socket: &WebsiteSocket, kind: &str) -> Result<Value, PageError> {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let callback: SubscriptionCallback = Arc::new(move |event| {
            let _ = tx.send(event);
        });
        let id = self.subscriptions.subscribe(kind, callback).await?;
        self.page_subscriptions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(socket.clone())
            .or_default()
            .insert(id.clone());

        // Ends once the multiplexer drops the callback.
        let sockets = self.sockets.clone();
        let target = socket.clone();
        let subscription = id.clone();
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                let params = match event {
                    Ok(result) => json!({ "subscription": subscription, "result": result }),
                    Err(e) => json!({ "subscription": subscription, "error": e.to_string() }),
                };
                let message = json!({ "method": "eth_subscription", "params": params });
                if let Err(e) = sockets.forward(&target, message).await {
                    warn!(socket = %target, error = %e, "Failed to forward subscription event");
                    break;
                }
            }
        });
        Ok(json!(id))
    }

    /// Only the socket that opened a subscription may close it.
    fn unsubscribe(&self, socket: &WebsiteSocket, id: &str) -> bool {
        let owned = self
            .page_subscriptions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get_mut(socket)
            .is_some_and(|ids| ids.remove(id));
        owned && self.subscriptions.unsubscribe(id)
    }

    // ── Blocks ──────────────────────────────────────────────────

    /// Re-simulate the stack on every new head and re-describe the open
    /// transaction decisions. Each refresh runs on its own task so a newer
    /// head aborts the one still in flight.
    pub async fn follow_blocks(self: Arc<Self>) {
        let mut blocks = self.poller.subscribe_blocks();
        while blocks.changed().await.is_ok() {
            let block = *blocks.borrow_and_update();
            if block == 0 {
                continue;
            }
            let router = self.clone();
            tokio::spawn(async move {
                match router.simulation.refresh_against_new_block(block).await {
                    Ok(state) => {
                        debug!(block, depth = state.simulated_transactions.len(), "Stack refreshed");
                        router.refresh_open_decisions(state).await;
                    }
                    Err(SimulationError::Stale { .. } | SimulationError::Cancelled) => {}
                    Err(e) => warn!(block, error = %e, "Stack refresh failed"),
                }
            });
        }
    }
}

fn unrecognized_chain(chain_id: u64) -> PageError {
    PageError::new(UNRECOGNIZED_CHAIN, format!("Unrecognized chain ID {chain_id:#x}"))
}

// ── Tests ───────────────────────────────────────────────────────
