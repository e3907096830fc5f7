//! Error taxonomy and the process-wide unexpected-error sink.

use thiserror::Error;
use tokio::sync::mpsc;
use tracing::error;

/// Failures of a single upstream JSON-RPC call.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum RpcError {
    /// Timeout, DNS, connection refused. Retryable.
    #[error("failed to fetch: {0}")]
    FailedToFetch(String),
    #[error("upstream returned HTTP {status}")]
    Http { status: u16 },
    #[error("json-rpc error {code}: {message}")]
    Protocol {
        code: i64,
        message: String,
        data: Option<serde_json::Value>,
    },
    /// Body failed to parse or did not match the envelope schema.
    #[error("malformed response: {0}")]
    Malformed(String),
}

impl RpcError {
    pub fn is_transient(&self) -> bool {
        matches!(self, RpcError::FailedToFetch(_))
    }
}

/// Failures delivering a message to a page connection.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    /// The page navigated away or the connection was torn down.
    #[error("connection is gone")]
    Disconnected,
    #[error("no tab with id {0}")]
    NoTab(i64),
    #[error("transport failure: {0}")]
    Failed(String),
}

/// Substrings that mark a port failure as an expected race rather than a
/// real fault. Browsers report these when the page or tab vanished.
const GONE_MARKERS: &[&str] = &[
    "disconnected port",
    "Receiving end does not exist",
    "Could not establish connection",
    "message channel is closed",
];

impl TransportError {
    /// Map a raw transport error message onto a typed variant.
    pub fn classify(message: &str) -> Self {
        if GONE_MARKERS.iter().any(|marker| message.contains(marker)) {
            return TransportError::Disconnected;
        }
        if let Some(rest) = message.split("No tab with id").nth(1) {
            let tab = rest
                .trim_start_matches([':', ' '])
                .split(|c: char| !c.is_ascii_digit() && c != '-')
                .next()
                .and_then(|digits| digits.parse().ok())
                .unwrap_or(-1);
            return TransportError::NoTab(tab);
        }
        TransportError::Failed(message.to_string())
    }

    /// Whether the failure is an expected race that callers drop silently.
    pub fn is_gone(&self) -> bool {
        matches!(self, TransportError::Disconnected | TransportError::NoTab(_))
    }
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum SimulationError {
    #[error(transparent)]
    Rpc(#[from] RpcError),
    #[error("simulation for block {simulated} is stale, chain is at {latest}")]
    Stale { simulated: u64, latest: u64 },
    #[error("simulation cancelled")]
    Cancelled,
    #[error("transaction {0} is not in the simulation stack")]
    UnknownTransaction(String),
    #[error("transaction {0} is already in the simulation stack")]
    DuplicateTransaction(String),
    #[error("no block has been observed yet")]
    NoBlock,
    #[error("malformed simulation result: {0}")]
    Malformed(String),
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum SubscriptionError {
    #[error("subscription kind {0} is not implemented")]
    NotImplemented(String),
    #[error("unknown subscription kind {0}")]
    UnknownKind(String),
    #[error("failed to connect upstream: {0}")]
    Connect(String),
    #[error("upstream protocol error: {0}")]
    Protocol(String),
    #[error("upstream socket closed abnormally ({code}): {reason}")]
    ClosedAbnormally { code: u16, reason: String },
}

#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
pub enum DecisionError {
    #[error("user denied the request")]
    UserDenied,
}

/// Page requests that fail validation at the deserialization boundary.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RequestError {
    #[error("invalid params: {0}")]
    InvalidParams(String),
    #[error("malformed message: {0}")]
    Malformed(String),
}

// ── Unexpected-error sink ───────────────────────────────────────

/// An error that indicates systemic trouble (malformed upstream data,
/// broken invariants). Surfaced process-wide instead of to one caller.
#[derive(Debug, Clone, PartialEq)]
pub struct UnexpectedError {
    pub source: &'static str,
    pub message: String,
}

#[derive(Debug, Clone)]
pub struct ErrorSink {
    tx: mpsc::UnboundedSender<UnexpectedError>,
}

impl ErrorSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<UnexpectedError>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn report(&self, source: &'static str, message: impl Into<String>) {
        let message = message.into();
        error!(source, %message, "Unexpected error");
        // Receiver gone means the process is shutting down.
        let _ = self.tx.send(UnexpectedError { source, message });
    }
}

// ── Tests ───────────────────────────────────────────────────────
