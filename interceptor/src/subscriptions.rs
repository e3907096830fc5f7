//! `eth_subscribe` fan-out over upstream WebSockets.
//!
//! Each logical subscription owns one upstream socket. The socket's reader
//! task registers the subscription when the upstream acknowledges it and
//! removes it again when the socket goes away, so the id and socket maps
//! never disagree.

use crate::error::SubscriptionError;
use crate::types::JsonRpcRequest;
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

/// Receives every notification of one subscription, and a final error if
/// the upstream socket dies.
pub type SubscriptionCallback = Arc<dyn Fn(Result<Value, SubscriptionError>) + Send + Sync>;

const SUBSCRIBE_REQUEST_ID: u64 = 1;
/// Close code used when the connection drops without a close frame.
const ABNORMAL_CLOSURE: u16 = 1006;

struct Subscription {
    kind: &'static str,
    socket: u64,
    callback: SubscriptionCallback,
    close: oneshot::Sender<()>,
}

#[derive(Default)]
struct Registry {
    by_id: HashMap<String, Subscription>,
    by_socket: HashMap<u64, String>,
}

impl Registry {
    fn remove_socket(&mut self, socket: u64) -> Option<Subscription> {
        let id = self.by_socket.remove(&socket)?;
        self.by_id.remove(&id)
    }
}

pub struct SubscriptionMultiplexer {
    ws_url: RwLock<String>,
    ack_timeout: Duration,
    next_socket: AtomicU64,
    registry: Arc<Mutex<Registry>>,
}

fn supported_kind(kind: &str) -> Result<&'static str, SubscriptionError> {
    match kind {
        "newHeads" => Ok("newHeads"),
        "logs" | "newPendingTransactions" | "syncing" => {
            Err(SubscriptionError::NotImplemented(kind.to_string()))
        }
        other => Err(SubscriptionError::UnknownKind(other.to_string())),
    }
}

impl SubscriptionMultiplexer {
    pub fn new(ws_url: impl Into<String>, ack_timeout: Duration) -> Self {
        Self {
            ws_url: RwLock::new(ws_url.into()),
            ack_timeout,
            next_socket: AtomicU64::new(1),
            registry: Arc::default(),
        }
    }

    /// Upstream endpoint for subscriptions opened from now on.
    pub fn set_ws_url(&self, ws_url: impl Into<String>) {
        *self.ws_url.write().unwrap_or_else(|e| e.into_inner()) = ws_url.into();
    }

    fn ws_url(&self) -> String {
        self.ws_url
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Open an upstream subscription and return the upstream-assigned id.
    pub async fn subscribe(
        &self,
        kind: &str,
        callback: SubscriptionCallback,
    ) -> Result<String, SubscriptionError> {
        let kind = supported_kind(kind)?;
        let (ws, _) = connect_async(self.ws_url())
            .await
            .map_err(|e| SubscriptionError::Connect(e.to_string()))?;
        let (mut write, mut read) = ws.split();

        let request = JsonRpcRequest::new(
            SUBSCRIBE_REQUEST_ID,
            "eth_subscribe",
            serde_json::json!([kind]),
        );
        let text = serde_json::to_string(&request)
            .map_err(|e| SubscriptionError::Protocol(e.to_string()))?;
        write
            .send(Message::Text(text))
            .await
            .map_err(|e| SubscriptionError::Connect(e.to_string()))?;

        let socket = self.next_socket.fetch_add(1, Ordering::Relaxed);
        let registry = self.registry.clone();
        let (ack_tx, ack_rx) = oneshot::channel::<Result<String, SubscriptionError>>();
        let (close_tx, mut close_rx) = oneshot::channel::<()>();

        tokio::spawn(async move {
            // Held until the upstream acknowledges; then moved into the registry.
            let mut pending = Some((ack_tx, close_tx, callback));
            let ending: Result<(), SubscriptionError> = loop {
                let frame = tokio::select! {
                    _ = &mut close_rx, if pending.is_none() => {
                        let frame = CloseFrame {
                            code: CloseCode::Normal,
                            reason: "unsubscribe".into(),
                        };
                        let _ = write.send(Message::Close(Some(frame))).await;
                        debug!(socket, "Upstream subscription socket closed by caller");
                        return;
                    }
                    frame = read.next() => frame,
                };
                let text = match frame {
                    Some(Ok(Message::Text(text))) => text,
                    Some(Ok(Message::Binary(bytes))) => match String::from_utf8(bytes) {
                        Ok(text) => text,
                        Err(_) => continue,
                    },
                    Some(Ok(Message::Close(frame))) => {
                        break match frame {
                            Some(f) if f.code != CloseCode::Normal => {
                                Err(SubscriptionError::ClosedAbnormally {
                                    code: u16::from(f.code),
                                    reason: f.reason.into_owned(),
                                })
                            }
                            _ => Ok(()),
                        };
                    }
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => {
                        break Err(SubscriptionError::ClosedAbnormally {
                            code: ABNORMAL_CLOSURE,
                            reason: e.to_string(),
                        })
                    }
                    None => {
                        break Err(SubscriptionError::ClosedAbnormally {
                            code: ABNORMAL_CLOSURE,
                            reason: "connection dropped".into(),
                        })
                    }
                };
                let Ok(message) = serde_json::from_str::<Value>(&text) else {
                    warn!(socket, "Unparseable upstream subscription frame");
                    continue;
                };

                if let Some((ack_tx, close_tx, callback)) = pending.take() {
                    if message.get("id").and_then(Value::as_u64) != Some(SUBSCRIBE_REQUEST_ID) {
                        pending = Some((ack_tx, close_tx, callback));
                        continue;
                    }
                    match message.get("result").and_then(Value::as_str) {
                        Some(id) => {
                            {
                                let mut reg = registry.lock().unwrap_or_else(|e| e.into_inner());
                                reg.by_socket.insert(socket, id.to_string());
                                reg.by_id.insert(
                                    id.to_string(),
                                    Subscription {
                                        kind,
                                        socket,
                                        callback,
                                        close: close_tx,
                                    },
                                );
                            }
                            if ack_tx.send(Ok(id.to_string())).is_err() {
                                // The caller stopped waiting for the acknowledgement.
                                registry
                                    .lock()
                                    .unwrap_or_else(|e| e.into_inner())
                                    .remove_socket(socket);
                                let _ = write.send(Message::Close(None)).await;
                                return;
                            }
                            info!(socket, subscription = id, kind, "Upstream subscription opened");
                        }
                        None => {
                            let reason = message
                                .get("error")
                                .map(|e| e.to_string())
                                .unwrap_or_else(|| "acknowledgement without result".into());
                            let _ = ack_tx.send(Err(SubscriptionError::Protocol(reason)));
                            return;
                        }
                    }
                    continue;
                }

                if message.get("method").and_then(Value::as_str) != Some("eth_subscription") {
                    continue;
                }
                let params = &message["params"];
                let Some(id) = params.get("subscription").and_then(Value::as_str) else {
                    continue;
                };
                let callback = registry
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .by_id
                    .get(id)
                    .map(|s| s.callback.clone());
                if let Some(callback) = callback {
                    callback(Ok(params.get("result").cloned().unwrap_or(Value::Null)));
                }
            };

            if let Some((ack_tx, _, _)) = pending {
                let err = ending.err().unwrap_or_else(|| {
                    SubscriptionError::Protocol("socket closed before acknowledgement".into())
                });
                let _ = ack_tx.send(Err(err));
                return;
            }
            let removed = registry
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .remove_socket(socket);
            match (ending, removed) {
                (Err(e), Some(subscription)) => {
                    warn!(socket, error = %e, "Upstream subscription socket failed");
                    (subscription.callback)(Err(e));
                }
                (Ok(()), Some(_)) => info!(socket, "Upstream subscription socket closed"),
                (_, None) => {}
            }
        });

        match tokio::time::timeout(self.ack_timeout, ack_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(SubscriptionError::Protocol("subscription task ended".into())),
            Err(_) => {
                // The reader may have registered in the meantime.
                let removed = self
                    .registry
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .remove_socket(socket);
                if let Some(subscription) = removed {
                    let _ = subscription.close.send(());
                }
                Err(SubscriptionError::Protocol("no acknowledgement from upstream".into()))
            }
        }
    }

    /// Close a subscription. Unknown ids return `false`.
    pub fn unsubscribe(&self, id: &str) -> bool {
        let removed = {
            let mut reg = self.registry.lock().unwrap_or_else(|e| e.into_inner());
            let removed = reg.by_id.remove(id);
            if let Some(subscription) = &removed {
                reg.by_socket.remove(&subscription.socket);
            }
            removed
        };
        match removed {
            Some(subscription) => {
                info!(subscription = id, kind = subscription.kind, "Unsubscribed");
                let _ = subscription.close.send(());
                true
            }
            None => false,
        }
    }

    pub fn subscription_count(&self) -> usize {
        self.registry
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .by_id
            .len()
    }
}

// ── Tests ───────────────────────────────────────────────────────
