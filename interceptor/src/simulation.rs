//! Stateful simulation of not-yet-broadcast transactions.
//!
//! The engine keeps an ordered stack of unsigned transactions and replays
//! the whole stack as one `eth_simulateV1` batch on every change, so
//! transaction `i` always sees the effects of `0..i` plus the base
//! overrides. Mutations (append, remove, replace, refresh) are serialized
//! through a FIFO queue; readers see the last committed snapshot.
//!
//! Every batch is raced against the head-block watch and an explicit cancel
//! signal. A result computed for block N is never committed once the engine
//! has seen block N+1.

use crate::abi::{decode_revert_payload, decode_transfer_log};
use crate::error::{ErrorSink, SimulationError};
use crate::rpc::{BlockHeader, EthereumClient};
use crate::types::{quantity, UnsignedTransaction};
use alloy_primitives::{address, Address, Bytes, B256, I256, U256};
use lru::LruCache;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::future::Future;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex, RwLock};
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Emitter of the pseudo-logs `traceTransfers` adds for ETH movements.
pub const ETH_TRANSFER_EMITTER: Address = address!("EeeeeEeeeEeEeeEeEeEeeEEEeeeeEeeeeeeeEEeE");

/// Attempts to land an append when the head keeps moving underneath it.
const MAX_APPEND_ATTEMPTS: usize = 3;

// ── State ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountOverride {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub balance: Option<U256>,
    #[serde(default, skip_serializing_if = "Option::is_none", with = "quantity::opt")]
    pub nonce: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<Bytes>,
    #[serde(default, rename = "stateDiff", skip_serializing_if = "Option::is_none")]
    pub storage_slots: Option<BTreeMap<B256, B256>>,
}

/// Synthetic account state injected into every batch.
pub type AddressOverrideMap = BTreeMap<Address, AccountOverride>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Success,
    Failure,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SimulatedLog {
    pub address: Address,
    pub topics: Vec<B256>,
    pub data: Bytes,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "kind", content = "address", rename_all = "lowercase")]
pub enum Asset {
    Ether,
    Token(Address),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BalanceDelta {
    pub address: Address,
    pub asset: Asset,
    pub delta: I256,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SimulationOutcome {
    pub status: ExecutionStatus,
    pub gas_spent: u64,
    pub logs: Vec<SimulatedLog>,
    pub return_data: Bytes,
    pub revert_reason: Option<String>,
    pub realized_gas_price: u128,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SimulatedTransaction {
    pub id: B256,
    pub transaction: UnsignedTransaction,
    pub outcome: SimulationOutcome,
    pub balance_deltas: Vec<BalanceDelta>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SimulationState {
    /// Parent block the stack was simulated on top of.
    pub block_number: u64,
    /// Base fee of the simulated block (`block_number + 1`).
    pub base_fee: Option<u128>,
    pub base_state_overrides: AddressOverrideMap,
    pub simulated_transactions: Vec<SimulatedTransaction>,
}

impl SimulationState {
    fn transactions(&self) -> Vec<UnsignedTransaction> {
        self.simulated_transactions
            .iter()
            .map(|s| s.transaction.clone())
            .collect()
    }

    fn position(&self, id: &B256) -> Option<usize> {
        self.simulated_transactions.iter().position(|s| s.id == *id)
    }

    pub fn get(&self, id: &B256) -> Option<&SimulatedTransaction> {
        self.simulated_transactions.iter().find(|s| s.id == *id)
    }

    /// The stack as it stood before `id` was appended: `id` and everything
    /// after it are left out. Unknown ids leave the stack whole.
    pub fn before(&self, id: &B256) -> SimulationState {
        let end = self.position(id).unwrap_or(self.simulated_transactions.len());
        SimulationState {
            block_number: self.block_number,
            base_fee: self.base_fee,
            base_state_overrides: self.base_state_overrides.clone(),
            simulated_transactions: self.simulated_transactions[..end].to_vec(),
        }
    }

    /// Net ETH change for `address` across the whole stack.
    pub fn ether_delta(&self, address: Address) -> I256 {
        self.simulated_transactions
            .iter()
            .flat_map(|s| s.balance_deltas.iter())
            .filter(|d| d.address == address && d.asset == Asset::Ether)
            .fold(I256::ZERO, |acc, d| acc.saturating_add(d.delta))
    }
}

// ── Engine ──────────────────────────────────────────────────────

pub struct SimulationEngine {
    client: Arc<EthereumClient>,
    errors: ErrorSink,
    queue: tokio::sync::Mutex<()>,
    committed: RwLock<Arc<SimulationState>>,
    head: watch::Sender<u64>,
    cancel: watch::Sender<u64>,
    code_cache: Mutex<LruCache<(u64, Address), Bytes>>,
}

impl SimulationEngine {
    pub fn new(client: Arc<EthereumClient>, errors: ErrorSink, code_cache_capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(code_cache_capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            client,
            errors,
            queue: tokio::sync::Mutex::new(()),
            committed: RwLock::new(Arc::new(SimulationState::default())),
            head: watch::channel(0).0,
            cancel: watch::channel(0).0,
            code_cache: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// Last committed state.
    pub fn snapshot(&self) -> Arc<SimulationState> {
        self.committed
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn commit(&self, state: SimulationState) -> Arc<SimulationState> {
        let state = Arc::new(state);
        *self.committed.write().unwrap_or_else(|e| e.into_inner()) = state.clone();
        state
    }

    pub fn head(&self) -> u64 {
        *self.head.borrow()
    }

    /// Record a newly observed head. Returns whether it advanced.
    fn note_head(&self, block: u64) -> bool {
        self.head.send_if_modified(|head| {
            if block > *head {
                *head = block;
                true
            } else {
                false
            }
        })
    }

    /// Abandon whatever batch is in flight.
    pub fn cancel_in_flight(&self) {
        self.cancel.send_modify(|generation| *generation += 1);
    }

    /// Simulate `transaction` on top of the current stack and keep it there.
    pub async fn append_transaction(
        &self,
        transaction: UnsignedTransaction,
    ) -> Result<SimulatedTransaction, SimulationError> {
        let _turn = self.queue.lock().await;
        let current = self.snapshot();
        let id = transaction.identifier();
        if current.position(&id).is_some() {
            return Err(SimulationError::DuplicateTransaction(id.to_string()));
        }

        let mut transactions = current.transactions();
        transactions.push(transaction);
        let next = self
            .simulate_latest(current.block_number, &current.base_state_overrides, &transactions)
            .await?;
        let simulated = next
            .simulated_transactions
            .last()
            .cloned()
            .ok_or_else(|| SimulationError::Malformed("empty batch result".into()))?;
        self.commit(next);
        info!(
            id = %simulated.id,
            status = ?simulated.outcome.status,
            gas = simulated.outcome.gas_spent,
            "Transaction appended to simulation stack"
        );
        Ok(simulated)
    }

    /// Drop a transaction and re-simulate everything that followed it.
    pub async fn remove_transaction(
        &self,
        id: &B256,
    ) -> Result<Arc<SimulationState>, SimulationError> {
        let _turn = self.queue.lock().await;
        let current = self.snapshot();
        let index = current
            .position(id)
            .ok_or_else(|| SimulationError::UnknownTransaction(id.to_string()))?;

        let mut transactions = current.transactions();
        transactions.remove(index);
        let next = self
            .simulate_latest(current.block_number, &current.base_state_overrides, &transactions)
            .await?;
        info!(id = %id, remaining = transactions.len(), "Transaction removed from simulation stack");
        Ok(self.commit(next))
    }

    /// Swap one transaction for another in place.
    pub async fn replace_transaction(
        &self,
        id: &B256,
        replacement: UnsignedTransaction,
    ) -> Result<Arc<SimulationState>, SimulationError> {
        let _turn = self.queue.lock().await;
        let current = self.snapshot();
        let index = current
            .position(id)
            .ok_or_else(|| SimulationError::UnknownTransaction(id.to_string()))?;

        let mut transactions = current.transactions();
        transactions[index] = replacement;
        let next = self
            .simulate_latest(current.block_number, &current.base_state_overrides, &transactions)
            .await?;
        Ok(self.commit(next))
    }

    /// Replace the base overrides and re-simulate the stack.
    pub async fn set_base_overrides(
        &self,
        overrides: AddressOverrideMap,
    ) -> Result<Arc<SimulationState>, SimulationError> {
        let _turn = self.queue.lock().await;
        let current = self.snapshot();
        let next = self
            .simulate_latest(current.block_number, &overrides, &current.transactions())
            .await?;
        Ok(self.commit(next))
    }

    /// Re-run the stack against the block it was last simulated on.
    pub async fn resimulate(&self) -> Result<Arc<SimulationState>, SimulationError> {
        let _turn = self.queue.lock().await;
        let current = self.snapshot();
        let next = self
            .guarded(
                current.block_number,
                self.run_batch(
                    current.block_number,
                    &current.base_state_overrides,
                    &current.transactions(),
                ),
            )
            .await?;
        Ok(self.commit(next))
    }

    /// Re-simulate the stack on top of `block`. Refreshes must be applied in
    /// block order: one for a block older than the newest seen is rejected.
    pub async fn refresh_against_new_block(
        &self,
        block: u64,
    ) -> Result<Arc<SimulationState>, SimulationError> {
        let latest = self.head();
        if block < latest {
            debug!(block, latest, "Discarding refresh for an older block");
            return Err(SimulationError::Stale {
                simulated: block,
                latest,
            });
        }
        if self.note_head(block) {
            self.clear_code_cache();
        }

        let _turn = self.queue.lock().await;
        let current = self.snapshot();
        if current.block_number >= block {
            return Ok(current);
        }
        let next = self
            .guarded(
                block,
                self.run_batch(block, &current.base_state_overrides, &current.transactions()),
            )
            .await
            .inspect_err(|e| warn!(block, error = %e, "Simulation refresh abandoned"))?;
        debug!(block, depth = next.simulated_transactions.len(), "Simulation refreshed");
        Ok(self.commit(next))
    }

    /// Empty the stack and overrides and forget the head (used on chain
    /// switch, where block numbers start over).
    pub async fn reset(&self) {
        let _turn = self.queue.lock().await;
        self.commit(SimulationState::default());
        self.head.send_replace(0);
        self.clear_code_cache();
        info!("Simulation stack reset");
    }

    /// ETH balance of `address` with the whole stack applied.
    pub async fn get_eth_balance(&self, address: Address) -> Result<U256, SimulationError> {
        self.eth_balance_in(&self.snapshot(), address).await
    }

    /// ETH balance of `address` with `state`'s transactions applied.
    pub async fn eth_balance_in(
        &self,
        state: &SimulationState,
        address: Address,
    ) -> Result<U256, SimulationError> {
        let base = match state
            .base_state_overrides
            .get(&address)
            .and_then(|o| o.balance)
        {
            Some(balance) => balance,
            None => {
                let block = self.block_for_reads(state).await?;
                self.client.get_balance(address, block).await?
            }
        };
        let delta = state.ether_delta(address);
        let adjusted = if delta.is_negative() {
            base.saturating_sub(delta.unsigned_abs())
        } else {
            base.saturating_add(delta.unsigned_abs())
        };
        Ok(adjusted)
    }

    /// Deployed code at `address`, honoring overrides. Cached per block.
    pub async fn get_code(&self, address: Address) -> Result<Bytes, SimulationError> {
        let state = self.snapshot();
        if let Some(code) = state
            .base_state_overrides
            .get(&address)
            .and_then(|o| o.code.clone())
        {
            return Ok(code);
        }
        let block = self.block_for_reads(&state).await?;
        if let Some(code) = self
            .code_cache
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&(block, address))
        {
            return Ok(code.clone());
        }
        let code = self.client.get_code(address, block).await?;
        self.code_cache
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .put((block, address), code.clone());
        Ok(code)
    }

    /// Nonce of `address` after every stacked transaction it sends.
    pub async fn get_transaction_count(&self, address: Address) -> Result<u64, SimulationError> {
        self.transaction_count_in(&self.snapshot(), address).await
    }

    pub async fn transaction_count_in(
        &self,
        state: &SimulationState,
        address: Address,
    ) -> Result<u64, SimulationError> {
        let base = match state
            .base_state_overrides
            .get(&address)
            .and_then(|o| o.nonce)
        {
            Some(nonce) => nonce,
            None => {
                let block = self.block_for_reads(state).await?;
                self.client.get_transaction_count(address, block).await?
            }
        };
        let sent = state
            .simulated_transactions
            .iter()
            .filter(|s| s.transaction.from == address)
            .count() as u64;
        Ok(base + sent)
    }

    fn clear_code_cache(&self) {
        self.code_cache
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }

    async fn block_for_reads(&self, state: &SimulationState) -> Result<u64, SimulationError> {
        match state.block_number.max(self.head()) {
            0 => {
                let block = self.client.block_number().await?;
                self.note_head(block);
                Ok(block)
            }
            block => Ok(block),
        }
    }

    // ── Batch execution ─────────────────────────────────────────

    /// Simulate against the newest known head, retrying when the head moves
    /// while the batch is in flight.
    async fn simulate_latest(
        &self,
        block_hint: u64,
        overrides: &AddressOverrideMap,
        transactions: &[UnsignedTransaction],
    ) -> Result<SimulationState, SimulationError> {
        let mut hint = block_hint;
        let mut last_err = SimulationError::NoBlock;
        for _ in 0..MAX_APPEND_ATTEMPTS {
            let target = match hint.max(self.head()) {
                0 => {
                    let block = self.client.block_number().await?;
                    self.note_head(block);
                    block
                }
                block => block,
            };
            match self
                .guarded(target, self.run_batch(target, overrides, transactions))
                .await
            {
                Err(SimulationError::Stale { latest, simulated }) => {
                    debug!(simulated, latest, "Head moved during simulation, retrying");
                    hint = latest;
                    last_err = SimulationError::Stale { simulated, latest };
                }
                other => return other,
            }
        }
        Err(last_err)
    }

    /// Run `work` for `target` unless a newer head or an explicit cancel
    /// arrives first. A result is rejected if the head moved past `target`.
    async fn guarded<T>(
        &self,
        target: u64,
        work: impl Future<Output = Result<T, SimulationError>>,
    ) -> Result<T, SimulationError> {
        let mut head = self.head.subscribe();
        let mut cancel = self.cancel.subscribe();
        tokio::select! {
            result = work => {
                let latest = self.head();
                if latest > target {
                    Err(SimulationError::Stale { simulated: target, latest })
                } else {
                    result
                }
            }
            moved = head.wait_for(|latest| *latest > target) => {
                let latest = moved.map(|latest| *latest).unwrap_or(target);
                Err(SimulationError::Stale { simulated: target, latest })
            }
            _ = cancel.changed() => Err(SimulationError::Cancelled),
        }
    }

    async fn run_batch(
        &self,
        parent: u64,
        overrides: &AddressOverrideMap,
        transactions: &[UnsignedTransaction],
    ) -> Result<SimulationState, SimulationError> {
        if transactions.is_empty() {
            return Ok(SimulationState {
                block_number: parent,
                base_fee: None,
                base_state_overrides: overrides.clone(),
                simulated_transactions: Vec::new(),
            });
        }

        let header = self.client.get_block(parent).await?;
        let base_fee = next_base_fee(&header);
        let payload = serde_json::json!({
            "blockStateCalls": [{
                "blockOverrides": {
                    "number": format!("{:#x}", parent + 1),
                    "baseFeePerGas": format!("{base_fee:#x}"),
                },
                "stateOverrides": overrides,
                "calls": transactions.iter().map(UnsignedTransaction::to_call_object).collect::<Vec<_>>(),
            }],
            "traceTransfers": true,
            "validation": false,
        });

        let raw = self.client.simulate_v1(payload, parent).await?;
        let calls = self.parse_calls(raw, transactions.len())?;

        let simulated_transactions = transactions
            .iter()
            .zip(calls)
            .map(|(transaction, call)| {
                let realized_gas_price = transaction.realized_gas_price(base_fee);
                let outcome = call.into_outcome(realized_gas_price);
                let balance_deltas = balance_deltas(transaction, &outcome);
                SimulatedTransaction {
                    id: transaction.identifier(),
                    transaction: transaction.clone(),
                    outcome,
                    balance_deltas,
                }
            })
            .collect();

        Ok(SimulationState {
            block_number: parent,
            base_fee: Some(base_fee),
            base_state_overrides: overrides.clone(),
            simulated_transactions,
        })
    }

    fn parse_calls(
        &self,
        raw: serde_json::Value,
        expected: usize,
    ) -> Result<Vec<CallResult>, SimulationError> {
        let blocks: Vec<SimulatedBlock> = serde_json::from_value(raw).map_err(|e| {
            let detail = format!("eth_simulateV1 result did not match schema: {e}");
            self.errors.report("simulation", detail.clone());
            SimulationError::Malformed(detail)
        })?;
        let calls = blocks
            .into_iter()
            .next()
            .map(|block| block.calls)
            .unwrap_or_default();
        if calls.len() != expected {
            let detail = format!("expected {expected} call results, got {}", calls.len());
            self.errors.report("simulation", detail.clone());
            return Err(SimulationError::Malformed(detail));
        }
        Ok(calls)
    }
}

// ── eth_simulateV1 result schema ────────────────────────────────

#[derive(Debug, Deserialize)]
struct SimulatedBlock {
    calls: Vec<CallResult>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CallResult {
    #[serde(with = "quantity")]
    status: u64,
    #[serde(with = "quantity")]
    gas_used: u64,
    #[serde(default)]
    logs: Vec<SimulatedLog>,
    #[serde(default)]
    return_data: Bytes,
    #[serde(default)]
    error: Option<CallError>,
}

#[derive(Debug, Deserialize)]
struct CallError {
    #[serde(default)]
    message: String,
    #[serde(default)]
    data: Option<Bytes>,
}

impl CallResult {
    fn into_outcome(self, realized_gas_price: u128) -> SimulationOutcome {
        let status = if self.status == 1 {
            ExecutionStatus::Success
        } else {
            ExecutionStatus::Failure
        };
        let revert_reason = match status {
            ExecutionStatus::Success => None,
            ExecutionStatus::Failure => Some(revert_reason(self.error.as_ref(), &self.return_data)),
        };
        SimulationOutcome {
            status,
            gas_spent: self.gas_used,
            logs: self.logs,
            return_data: self.return_data,
            revert_reason,
            realized_gas_price,
        }
    }
}

/// Human text for a failed call. `"Reverted <hex>"` payloads are decoded
/// when they hold text; otherwise the message is kept as is.
fn revert_reason(error: Option<&CallError>, return_data: &[u8]) -> String {
    if let Some(error) = error {
        if let Some(hex_payload) = error.message.strip_prefix("Reverted ") {
            return hex::decode(hex_payload.trim_start_matches("0x"))
                .ok()
                .and_then(|bytes| decode_revert_payload(&bytes))
                .unwrap_or_else(|| error.message.clone());
        }
        if let Some(text) = error.data.as_ref().and_then(|data| decode_revert_payload(data)) {
            return text;
        }
        if !error.message.is_empty() {
            return error.message.clone();
        }
    }
    decode_revert_payload(return_data).unwrap_or_else(|| "execution reverted".into())
}

// ── Fees and balances ───────────────────────────────────────────

/// Base fee of the block after `parent`, per the EIP-1559 update rule.
pub fn next_base_fee(parent: &BlockHeader) -> u128 {
    let base_fee = parent.base_fee_per_gas.unwrap_or(0);
    let target = u128::from(parent.gas_limit / 2);
    let used = u128::from(parent.gas_used);
    if target == 0 || used == target {
        return base_fee;
    }
    if used > target {
        let delta = (base_fee * (used - target) / target / 8).max(1);
        base_fee + delta
    } else {
        let delta = base_fee * (target - used) / target / 8;
        base_fee - delta
    }
}

fn to_signed(value: U256) -> I256 {
    I256::try_from(value).unwrap_or(I256::MAX)
}

fn balance_deltas(transaction: &UnsignedTransaction, outcome: &SimulationOutcome) -> Vec<BalanceDelta> {
    let mut deltas: BTreeMap<(Address, Asset), I256> = BTreeMap::new();
    let mut add = |address: Address, asset: Asset, delta: I256| {
        let entry = deltas.entry((address, asset)).or_insert(I256::ZERO);
        *entry = entry.saturating_add(delta);
    };

    let gas_cost = U256::from(outcome.gas_spent) * U256::from(outcome.realized_gas_price);
    add(transaction.from, Asset::Ether, -to_signed(gas_cost));

    for log in &outcome.logs {
        let Some((from, to, value)) = decode_transfer_log(&log.topics, &log.data) else {
            continue;
        };
        let asset = if log.address == ETH_TRANSFER_EMITTER {
            Asset::Ether
        } else {
            Asset::Token(log.address)
        };
        let value = to_signed(value);
        add(from, asset, -value);
        add(to, asset, value);
    }

    deltas
        .into_iter()
        .filter(|(_, delta)| !delta.is_zero())
        .map(|((address, asset), delta)| BalanceDelta {
            address,
            asset,
            delta,
        })
        .collect()
}

// ── Tests ───────────────────────────────────────────────────────
