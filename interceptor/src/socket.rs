//! Socket registry: which page connections are alive, per tab.

use crate::error::TransportError;
use async_trait::async_trait;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// One page-to-extension channel.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebsiteSocket {
    pub tab_id: i64,
    pub connection_name: String,
}

impl WebsiteSocket {
    pub fn new(tab_id: i64, connection_name: impl Into<String>) -> Self {
        Self {
            tab_id,
            connection_name: connection_name.into(),
        }
    }

    pub fn key(&self) -> String {
        format!("{}-{}", self.tab_id, self.connection_name)
    }
}

impl fmt::Display for WebsiteSocket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key())
    }
}

/// Delivery side of a page connection.
#[async_trait]
pub trait PageTransport: Send + Sync {
    async fn deliver(&self, message: serde_json::Value) -> Result<(), TransportError>;
}

/// Bounded per-connection queue; a full queue makes the sender wait.
#[async_trait]
impl PageTransport for mpsc::Sender<serde_json::Value> {
    async fn deliver(&self, message: serde_json::Value) -> Result<(), TransportError> {
        self.send(message)
            .await
            .map_err(|_| TransportError::Disconnected)
    }
}

type TabConnections = HashMap<i64, HashMap<String, Arc<dyn PageTransport>>>;

#[derive(Default)]
pub struct SocketRegistry {
    tabs: Mutex<TabConnections>,
}

impl SocketRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, socket: &WebsiteSocket, transport: Arc<dyn PageTransport>) {
        let mut tabs = self.tabs.lock().unwrap_or_else(|e| e.into_inner());
        tabs.entry(socket.tab_id)
            .or_default()
            .insert(socket.key(), transport);
        info!(socket = %socket, "Page connected");
    }

    /// Returns whether the socket was registered.
    pub fn unregister(&self, socket: &WebsiteSocket) -> bool {
        let mut tabs = self.tabs.lock().unwrap_or_else(|e| e.into_inner());
        let Some(sockets) = tabs.get_mut(&socket.tab_id) else {
            return false;
        };
        let removed = sockets.remove(&socket.key()).is_some();
        if sockets.is_empty() {
            tabs.remove(&socket.tab_id);
        }
        if removed {
            info!(socket = %socket, "Page disconnected");
        }
        removed
    }

    fn lookup(&self, socket: &WebsiteSocket) -> Option<Arc<dyn PageTransport>> {
        let tabs = self.tabs.lock().unwrap_or_else(|e| e.into_inner());
        tabs.get(&socket.tab_id)
            .and_then(|sockets| sockets.get(&socket.key()))
            .cloned()
    }

    /// Send to one socket. A connection that is already gone is dropped
    /// silently; any other transport failure propagates.
    pub async fn forward(
        &self,
        socket: &WebsiteSocket,
        message: serde_json::Value,
    ) -> Result<(), TransportError> {
        let Some(transport) = self.lookup(socket) else {
            debug!(socket = %socket, "Dropping message for unknown socket");
            return Ok(());
        };
        match transport.deliver(message).await {
            Err(e) if e.is_gone() => {
                debug!(socket = %socket, error = %e, "Dropping message for closed socket");
                Ok(())
            }
            other => other,
        }
    }

    /// Send to every connection in every tab. Returns how many deliveries
    /// succeeded; one failing recipient never stops the rest.
    pub async fn broadcast(&self, message: serde_json::Value) -> usize {
        let targets: Vec<(String, Arc<dyn PageTransport>)> = {
            let tabs = self.tabs.lock().unwrap_or_else(|e| e.into_inner());
            tabs.values()
                .flat_map(|sockets| sockets.iter())
                .map(|(key, transport)| (key.clone(), transport.clone()))
                .collect()
        };

        let deliveries = targets.iter().map(|(key, transport)| {
            let message = message.clone();
            async move {
                match transport.deliver(message).await {
                    Ok(()) => true,
                    Err(e) if e.is_gone() => false,
                    Err(e) => {
                        warn!(socket = %key, error = %e, "Broadcast delivery failed");
                        false
                    }
                }
            }
        });
        join_all(deliveries).await.into_iter().filter(|ok| *ok).count()
    }

    pub fn connection_count(&self) -> usize {
        let tabs = self.tabs.lock().unwrap_or_else(|e| e.into_inner());
        tabs.values().map(HashMap::len).sum()
    }

    pub fn tab_count(&self) -> usize {
        self.tabs.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

// ── Tests ───────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    struct Failing(TransportError);

    #[async_trait]
    impl PageTransport for Failing {
        async fn deliver(&self, _message: serde_json::Value) -> Result<(), TransportError> {
            Err(self.0.clone())
        }
    }

    #[test]
    fn test_socket_key_format() {
        assert_eq!(WebsiteSocket::new(7, "abc").key(), "7-abc");
    }

    #[tokio::test]
    async fn test_forward_reaches_registered_socket() {
        let registry = SocketRegistry::new();
        let socket = WebsiteSocket::new(1, "a");
        let (tx, mut rx) = mpsc::channel(4);
        registry.register(&socket, Arc::new(tx));

        registry
            .forward(&socket, serde_json::json!({"hello": 1}))
            .await
            .unwrap();
        assert_eq!(rx.recv().await.unwrap()["hello"], 1);
    }

    #[tokio::test]
    async fn test_forward_to_closed_socket_is_silent() {
        let registry = SocketRegistry::new();
        let socket = WebsiteSocket::new(1, "a");
        let (tx, rx) = mpsc::channel(4);
        registry.register(&socket, Arc::new(tx));
        drop(rx);

        assert!(registry.forward(&socket, serde_json::json!({})).await.is_ok());
        assert!(registry
            .forward(&WebsiteSocket::new(9, "missing"), serde_json::json!({}))
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_forward_propagates_other_failures() {
        let registry = SocketRegistry::new();
        let socket = WebsiteSocket::new(1, "a");
        registry.register(
            &socket,
            Arc::new(Failing(TransportError::Failed("boom".into()))),
        );
        let err = registry.forward(&socket, serde_json::json!({})).await.unwrap_err();
        assert_eq!(err, TransportError::Failed("boom".into()));
    }

    #[tokio::test]
    async fn test_broadcast_isolates_dead_recipients() {
        let registry = SocketRegistry::new();
        let (tx1, mut rx1) = mpsc::channel(4);
        let (tx2, rx2) = mpsc::channel(4);
        let (tx3, mut rx3) = mpsc::channel(4);
        registry.register(&WebsiteSocket::new(1, "a"), Arc::new(tx1));
        registry.register(&WebsiteSocket::new(1, "b"), Arc::new(tx2));
        registry.register(&WebsiteSocket::new(2, "a"), Arc::new(tx3));
        registry.register(
            &WebsiteSocket::new(3, "x"),
            Arc::new(Failing(TransportError::Failed("boom".into()))),
        );
        drop(rx2);

        let delivered = registry.broadcast(serde_json::json!({"method": "chainChanged"})).await;
        assert_eq!(delivered, 2);
        assert!(rx1.recv().await.is_some());
        assert!(rx3.recv().await.is_some());
    }

    #[test]
    fn test_unregister_removes_empty_tabs() {
        let registry = SocketRegistry::new();
        let (tx, _rx) = mpsc::channel(1);
        let socket = WebsiteSocket::new(5, "a");
        registry.register(&socket, Arc::new(tx));
        assert_eq!(registry.tab_count(), 1);
        assert!(registry.unregister(&socket));
        assert!(!registry.unregister(&socket));
        assert_eq!(registry.tab_count(), 0);
        assert_eq!(registry.connection_count(), 0);
    }
}
