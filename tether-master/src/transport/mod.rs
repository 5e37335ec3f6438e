//! Master side of the worker streams
//!
//! Every worker holds one long-lived connection. The reader half feeds the
//! router; the writer half drains a per-connection queue that the rest of the
//! master reaches through `Connections`. Sends that cannot be delivered are
//! reported as `SendFailure`s so the engine can evict the node and redispatch.

pub mod router;
mod server;

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::SendError;

use tether_core::dto::message::Message;
use tether_core::transport::TransportError;

pub use server::{handle_connection, serve};

/// Outbound queue depth per connection
const OUTBOUND_CAPACITY: usize = 64;

/// A message that could not be delivered to a node
#[derive(Debug)]
pub struct SendFailure {
    pub node_key: String,
    pub message: Message,
    pub reason: String,
}

/// Outbound queues of connected nodes, keyed by node key
#[derive(Clone)]
pub struct Connections {
    outbound: Arc<DashMap<String, mpsc::Sender<Message>>>,
    failures: mpsc::UnboundedSender<SendFailure>,
}

impl Connections {
    pub fn new(failures: mpsc::UnboundedSender<SendFailure>) -> Self {
        Self {
            outbound: Arc::new(DashMap::new()),
            failures,
        }
    }

    /// Creates the queue a connection's writer drains
    pub fn channel() -> (mpsc::Sender<Message>, mpsc::Receiver<Message>) {
        mpsc::channel(OUTBOUND_CAPACITY)
    }

    pub fn bind(&self, key: String, outbound: mpsc::Sender<Message>) {
        if self.outbound.insert(key.clone(), outbound).is_some() {
            tracing::debug!("Connection for {} replaced", key);
        }
    }

    pub fn unbind(&self, key: &str) {
        self.outbound.remove(key);
    }

    /// Unbinds `key` only if it still points at `outbound`
    pub fn unbind_if_same(&self, key: &str, outbound: &mpsc::Sender<Message>) -> bool {
        self.outbound
            .remove_if(key, |_, current| current.same_channel(outbound))
            .is_some()
    }

    pub fn is_connected(&self, key: &str) -> bool {
        self.outbound.contains_key(key)
    }

    /// Queues a message for a node
    ///
    /// A missing or closed connection is reported as a send failure as well
    /// as returned to the caller.
    pub async fn send(&self, key: &str, message: Message) -> Result<(), TransportError> {
        let Some(outbound) = self.outbound.get(key).map(|entry| entry.value().clone()) else {
            self.report_failure(key, message, "not connected");
            return Err(TransportError::NotConnected(key.to_string()));
        };

        if let Err(SendError(message)) = outbound.send(message).await {
            self.report_failure(key, message, "connection closed");
            return Err(TransportError::Closed(key.to_string()));
        }
        Ok(())
    }

    pub fn report_failure(&self, key: &str, message: Message, reason: impl Into<String>) {
        let failure = SendFailure {
            node_key: key.to_string(),
            message,
            reason: reason.into(),
        };
        if self.failures.send(failure).is_err() {
            tracing::warn!("Send failure for {} dropped, engine is gone", key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tether_core::domain::node::Node;

    #[tokio::test]
    async fn test_send_to_closed_connection_reports_failure() {
        let (failures_tx, mut failures) = mpsc::unbounded_channel();
        let connections = Connections::new(failures_tx);

        let (tx, rx) = Connections::channel();
        connections.bind("w1@h".into(), tx);
        drop(rx);

        let message = Message::heartbeat(Node::new("master", "m"));
        assert!(matches!(
            connections.send("w1@h", message.clone()).await,
            Err(TransportError::Closed(_))
        ));
        assert!(matches!(
            connections.send("ghost@h", message).await,
            Err(TransportError::NotConnected(_))
        ));

        assert_eq!(failures.recv().await.unwrap().node_key, "w1@h");
        assert_eq!(failures.recv().await.unwrap().node_key, "ghost@h");
    }

    #[tokio::test]
    async fn test_unbind_if_same_keeps_newer_connection() {
        let (failures_tx, _failures) = mpsc::unbounded_channel();
        let connections = Connections::new(failures_tx);

        let (old, _old_rx) = Connections::channel();
        let (new, mut new_rx) = Connections::channel();
        connections.bind("w1@h".into(), old.clone());
        connections.bind("w1@h".into(), new);

        assert!(!connections.unbind_if_same("w1@h", &old));
        assert!(connections.is_connected("w1@h"));

        connections
            .send("w1@h", Message::heartbeat(Node::new("master", "m")))
            .await
            .unwrap();
        assert!(new_rx.recv().await.is_some());
    }
}
