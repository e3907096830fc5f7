//! External collaborators the core talks to: persisted settings, address
//! metadata and decision surfaces. Each is a trait with an in-memory
//! implementation.

use crate::decision::{DecisionKind, RequestId};
use alloy_primitives::{address, Address};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::RwLock;

// ── Settings ────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Settings {
    pub active_chain: u64,
    pub active_address: Option<Address>,
    pub simulation_mode: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SettingsPatch {
    pub active_chain: Option<u64>,
    pub active_address: Option<Address>,
    pub simulation_mode: Option<bool>,
}

pub trait SettingsStore: Send + Sync {
    fn settings(&self) -> Settings;
    fn update(&self, patch: SettingsPatch) -> Settings;
}

pub struct InMemorySettings {
    inner: RwLock<Settings>,
}

impl InMemorySettings {
    pub fn new(settings: Settings) -> Self {
        Self {
            inner: RwLock::new(settings),
        }
    }
}

impl SettingsStore for InMemorySettings {
    fn settings(&self) -> Settings {
        self.inner.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn update(&self, patch: SettingsPatch) -> Settings {
        let mut settings = self.inner.write().unwrap_or_else(|e| e.into_inner());
        if let Some(chain) = patch.active_chain {
            settings.active_chain = chain;
        }
        if let Some(address) = patch.active_address {
            settings.active_address = Some(address);
        }
        if let Some(mode) = patch.simulation_mode {
            settings.simulation_mode = mode;
        }
        settings.clone()
    }
}

// ── Address metadata ────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AddressKind {
    /// Entry in the user's address book.
    Contact,
    Token,
    Contract,
    /// AMM router or similar; never meant to receive raw token transfers.
    Router,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressMetadata {
    pub name: String,
    pub kind: AddressKind,
}

pub trait AddressMetadataStore: Send + Sync {
    fn lookup(&self, address: &Address) -> Option<AddressMetadata>;
}

#[derive(Debug, Clone, Deserialize)]
struct AddressBookEntry {
    address: Address,
    name: String,
    kind: AddressKind,
}

#[derive(Debug, Default)]
pub struct InMemoryMetadata {
    entries: HashMap<Address, AddressMetadata>,
}

impl InMemoryMetadata {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_entry(mut self, address: Address, name: &str, kind: AddressKind) -> Self {
        self.insert(address, name, kind);
        self
    }

    pub fn insert(&mut self, address: Address, name: &str, kind: AddressKind) {
        self.entries.insert(
            address,
            AddressMetadata {
                name: name.to_string(),
                kind,
            },
        );
    }

    /// Mainnet swap routers that tokens are routinely lost to.
    pub fn with_known_routers(self) -> Self {
        self.with_entry(
            address!("7a250d5630B4cF539739dF2C5dAcb4c659F2488D"),
            "Uniswap V2: Router 2",
            AddressKind::Router,
        )
        .with_entry(
            address!("E592427A0AEce92De3Edee1F18E0157C05861564"),
            "Uniswap V3: Router",
            AddressKind::Router,
        )
        .with_entry(
            address!("68b3465833fb72A70ecDF485E0e4C7bD8665Fc45"),
            "Uniswap V3: Router 2",
            AddressKind::Router,
        )
        .with_entry(
            address!("3fC91A3afd70395Cd496C647d5a6CC9D4B2b7FAD"),
            "Uniswap: Universal Router",
            AddressKind::Router,
        )
    }

    /// Load `[{address, name, kind}]` entries from a JSON file.
    pub fn load_address_book(mut self, path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read address book {}", path.display()))?;
        let entries: Vec<AddressBookEntry> =
            serde_json::from_str(&raw).context("Invalid address book JSON")?;
        for entry in entries {
            self.insert(entry.address, &entry.name, entry.kind);
        }
        Ok(self)
    }
}

impl AddressMetadataStore for InMemoryMetadata {
    fn lookup(&self, address: &Address) -> Option<AddressMetadata> {
        self.entries.get(address).cloned()
    }
}

// ── Decision surfaces ───────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SurfaceHandle {
    pub kind: DecisionKind,
    pub id: RequestId,
}

/// Where decisions are shown to the user. The core only needs "open with
/// payload", "replace payload" and "close"; the user's answer and
/// window-closed signals come back through the message router.
pub trait DecisionSurface: Send + Sync {
    fn open(&self, handle: SurfaceHandle, payload: serde_json::Value);
    /// Swap the payload of a surface that is still open. A closed or unknown
    /// handle is ignored.
    fn update(&self, handle: SurfaceHandle, payload: serde_json::Value);
    fn close(&self, handle: SurfaceHandle);
}

// ── Tests ───────────────────────────────────────────────────────
