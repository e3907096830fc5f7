//! Pending user decisions: exactly-once settled handles keyed by request id.
//!
//! A [`PendingDecisions`] table owns the resolver side of every open
//! decision of one kind. Settling removes the resolver from the table under
//! the lock, so a second resolve, or a resolve racing a window close, finds
//! nothing and is a no-op.

use crate::error::DecisionError;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::task::{Context, Poll};
use tokio::sync::oneshot;
use tracing::{debug, info};

pub type RequestId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionKind {
    ChainChange,
    Signature,
    Transaction,
}

impl fmt::Display for DecisionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            DecisionKind::ChainChange => "chain_change",
            DecisionKind::Signature => "signature",
            DecisionKind::Transaction => "transaction",
        })
    }
}

type Outcome<T> = Result<T, DecisionError>;

/// Awaitable side of a decision. Resolves with the user's answer; a dropped
/// resolver counts as a denial.
pub struct DecisionFuture<T> {
    id: RequestId,
    rx: oneshot::Receiver<Outcome<T>>,
}

impl<T> DecisionFuture<T> {
    pub fn id(&self) -> RequestId {
        self.id
    }
}

impl<T> Future for DecisionFuture<T> {
    type Output = Outcome<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(Ok(outcome)) => Poll::Ready(outcome),
            Poll::Ready(Err(_)) => Poll::Ready(Err(DecisionError::UserDenied)),
            Poll::Pending => Poll::Pending,
        }
    }
}

pub struct PendingDecisions<T> {
    kind: DecisionKind,
    next_id: AtomicU64,
    pending: Mutex<HashMap<RequestId, oneshot::Sender<Outcome<T>>>>,
}

impl<T> PendingDecisions<T> {
    pub fn new(kind: DecisionKind) -> Self {
        Self {
            kind,
            next_id: AtomicU64::new(1),
            pending: Mutex::new(HashMap::new()),
        }
    }

    pub fn kind(&self) -> DecisionKind {
        self.kind
    }

    /// Open a new decision and return its awaitable.
    pub fn create(&self) -> DecisionFuture<T> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id, tx);
        debug!(kind = %self.kind, id, "Decision opened");
        DecisionFuture { id, rx }
    }

    pub fn resolve(&self, id: RequestId, value: T) -> bool {
        self.settle(id, Ok(value))
    }

    pub fn reject(&self, id: RequestId) -> bool {
        self.settle(id, Err(DecisionError::UserDenied))
    }

    /// The decision surface closed without an explicit answer.
    pub fn window_closed(&self, id: RequestId) -> bool {
        let settled = self.reject(id);
        if settled {
            info!(kind = %self.kind, id, "Decision window closed, treating as denial");
        }
        settled
    }

    /// The one settle path. Returns `false` when the decision was already
    /// settled or never existed.
    fn settle(&self, id: RequestId, outcome: Outcome<T>) -> bool {
        let resolver = self
            .pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&id);
        match resolver {
            Some(tx) => {
                // Awaiting side may have been cancelled; the decision is
                // settled either way.
                let _ = tx.send(outcome);
                true
            }
            None => {
                debug!(kind = %self.kind, id, "Ignoring settle of already settled decision");
                false
            }
        }
    }

    pub fn is_pending(&self, id: RequestId) -> bool {
        self.pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(&id)
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Deny everything still open (shutdown, chain reset).
    pub fn reject_all(&self) -> usize {
        let drained: Vec<_> = self
            .pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain()
            .collect();
        let count = drained.len();
        for (_, tx) in drained {
            let _ = tx.send(Err(DecisionError::UserDenied));
        }
        count
    }
}

/// One table per decision kind, owned by the message router.
pub struct DecisionBook {
    pub chain_change: PendingDecisions<()>,
    pub signature: PendingDecisions<()>,
    pub transaction: PendingDecisions<()>,
}

impl Default for DecisionBook {
    fn default() -> Self {
        Self {
            chain_change: PendingDecisions::new(DecisionKind::ChainChange),
            signature: PendingDecisions::new(DecisionKind::Signature),
            transaction: PendingDecisions::new(DecisionKind::Transaction),
        }
    }
}

impl DecisionBook {
    pub fn table(&self, kind: DecisionKind) -> &PendingDecisions<()> {
        match kind {
            DecisionKind::ChainChange => &self.chain_change,
            DecisionKind::Signature => &self.signature,
            DecisionKind::Transaction => &self.transaction,
        }
    }

    /// Apply an explicit answer from the user.
    pub fn answer(&self, kind: DecisionKind, id: RequestId, approve: bool) -> bool {
        let table = self.table(kind);
        if approve {
            table.resolve(id, ())
        } else {
            table.reject(id)
        }
    }
}

// ── Tests ───────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_resolve_delivers_value() {
        let table = PendingDecisions::new(DecisionKind::Transaction);
        let fut = table.create();
        assert!(table.resolve(fut.id(), 42u32));
        assert_eq!(fut.await, Ok(42));
    }

    #[tokio::test]
    async fn test_second_resolve_is_noop() {
        let table = PendingDecisions::new(DecisionKind::Signature);
        let fut = table.create();
        let id = fut.id();
        assert!(table.resolve(id, 1u32));
        assert!(!table.resolve(id, 2u32));
        assert!(!table.reject(id));
        assert_eq!(fut.await, Ok(1));
    }

    #[tokio::test]
    async fn test_resolve_after_window_close_is_noop() {
        let table = PendingDecisions::new(DecisionKind::ChainChange);
        let fut = table.create();
        let id = fut.id();
        assert!(table.window_closed(id));
        assert!(!table.resolve(id, ()));
        assert!(!table.window_closed(id));
        assert_eq!(fut.await, Err(DecisionError::UserDenied));
    }

    #[test]
    fn test_ids_are_monotonic_per_kind() {
        let a = PendingDecisions::<()>::new(DecisionKind::Transaction);
        let b = PendingDecisions::<()>::new(DecisionKind::Signature);
        let (a1, a2) = (a.create().id(), a.create().id());
        let b1 = b.create().id();
        assert!(a2 > a1);
        assert_eq!(b1, 1);
    }

    #[tokio::test]
    async fn test_reject_all_denies_open_decisions() {
        let book = DecisionBook::default();
        let first = book.transaction.create();
        let second = book.transaction.create();
        assert_eq!(book.transaction.reject_all(), 2);
        assert_eq!(first.await, Err(DecisionError::UserDenied));
        assert_eq!(second.await, Err(DecisionError::UserDenied));
        assert_eq!(book.transaction.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_book_answer_routes_by_kind() {
        let book = DecisionBook::default();
        let fut = book.signature.create();
        assert!(!book.answer(DecisionKind::Transaction, fut.id() + 100, true));
        assert!(book.answer(DecisionKind::Signature, fut.id(), false));
        assert_eq!(fut.await, Err(DecisionError::UserDenied));
    }
}
