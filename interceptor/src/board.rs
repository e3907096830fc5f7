//! In-process decision surface. Open decisions are listed over HTTP and
//! answered there; opening one counts as focus for the block poller.

use crate::collaborators::{DecisionSurface, SurfaceHandle};
use crate::polling::BlockPoller;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OpenDecision {
    #[serde(flatten)]
    pub handle: SurfaceHandle,
    pub payload: serde_json::Value,
    pub opened_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

pub struct DecisionBoard {
    poller: Arc<BlockPoller>,
    open: Mutex<BTreeMap<SurfaceHandle, OpenDecision>>,
}

impl DecisionBoard {
    pub fn new(poller: Arc<BlockPoller>) -> Self {
        Self {
            poller,
            open: Mutex::new(BTreeMap::new()),
        }
    }

    /// Open decisions, oldest kind/id first.
    pub fn list(&self) -> Vec<OpenDecision> {
        self.open
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect()
    }

    pub fn get(&self, handle: SurfaceHandle) -> Option<OpenDecision> {
        self.open
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&handle)
            .cloned()
    }

    pub fn is_empty(&self) -> bool {
        self.open.lock().unwrap_or_else(|e| e.into_inner()).is_empty()
    }

    /// A viewer looked at the board.
    pub fn focus(&self) {
        self.poller.wake();
    }
}

impl DecisionSurface for DecisionBoard {
    fn open(&self, handle: SurfaceHandle, payload: serde_json::Value) {
        let fresh = self
            .open
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(
                handle,
                OpenDecision {
                    handle,
                    payload,
                    opened_at: Utc::now(),
                    updated_at: None,
                },
            )
            .is_none();
        if fresh {
            debug!(kind = %handle.kind, id = handle.id, "Decision surface opened");
            self.poller.focus_gained();
        }
    }

    fn update(&self, handle: SurfaceHandle, payload: serde_json::Value) {
        let mut open = self.open.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(decision) = open.get_mut(&handle) {
            decision.payload = payload;
            decision.updated_at = Some(Utc::now());
            debug!(kind = %handle.kind, id = handle.id, "Decision surface updated");
        }
    }

    fn close(&self, handle: SurfaceHandle) {
        let removed = self
            .open
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&handle)
            .is_some();
        if removed {
            debug!(kind = %handle.kind, id = handle.id, "Decision surface closed");
            self.poller.focus_lost();
        }
    }
}

// ── Tests ───────────────────────────────────────────────────────
