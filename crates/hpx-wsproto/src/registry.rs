//! Server-wide registry of live connections using `scc::HashMap`.
//!
//! The registry is the only state shared across connections. It holds each
//! connection's [`Sender`], so broadcasting never touches a connection's inbound
//! side.

use futures::future::join_all;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::{
    assembler::Message,
    close::CloseCode,
    connection::{ConnectionId, Sender, State},
};

/// Concurrent map from [`ConnectionId`] to the connection's [`Sender`].
///
/// Inserts and removals from different tasks only contend on the bucket they touch.
pub struct ConnectionRegistry<S> {
    connections: scc::HashMap<ConnectionId, Sender<S>>,
}

impl<S: 'static> Default for ConnectionRegistry<S> {
    fn default() -> Self {
        Self {
            connections: scc::HashMap::new(),
        }
    }
}

impl<S> ConnectionRegistry<S>
where
    S: AsyncRead + AsyncWrite + Unpin + 'static,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a connection. Returns `false` if its id is already present.
    pub fn insert(&self, sender: Sender<S>) -> bool {
        let id = sender.id();
        let inserted = self.connections.insert_sync(id, sender).is_ok();
        if inserted {
            tracing::debug!(%id, "connection registered");
        }
        inserted
    }

    pub fn remove(&self, id: ConnectionId) -> Option<Sender<S>> {
        let removed = self.connections.remove_sync(&id).map(|(_, sender)| sender);
        if removed.is_some() {
            tracing::debug!(%id, "connection unregistered");
        }
        removed
    }

    pub fn get(&self, id: ConnectionId) -> Option<Sender<S>> {
        self.connections.update_sync(&id, |_, sender| sender.clone())
    }

    pub fn contains(&self, id: ConnectionId) -> bool {
        self.connections.update_sync(&id, |_, _| ()).is_some()
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Ids of all registered connections, in no particular order.
    pub fn ids(&self) -> Vec<ConnectionId> {
        let mut ids = Vec::new();
        self.connections.retain_sync(|id, _| {
            ids.push(*id);
            true
        });
        ids
    }

    /// Sends `message` to every registered connection concurrently.
    ///
    /// Best effort: returns how many sends failed. A failing connection is left in
    /// the registry; see [`prune_closed`](Self::prune_closed).
    pub async fn broadcast(&self, message: &Message) -> usize {
        let senders = self.snapshot();
        let results = join_all(
            senders
                .iter()
                .map(|sender| sender.send_message(message.clone())),
        )
        .await;

        let failed = results.iter().filter(|result| result.is_err()).count();
        if failed > 0 {
            tracing::debug!(failed, total = senders.len(), "broadcast incomplete");
        }
        failed
    }

    /// Runs the close handshake on every registered connection and empties the
    /// registry.
    pub async fn close_all(&self, code: CloseCode, reason: &str) {
        let senders = self.snapshot();
        self.connections.clear_sync();
        join_all(senders.iter().map(|sender| async move {
            if let Err(err) = sender.close(code, reason).await {
                tracing::debug!(id = %sender.id(), error = %err, "close failed");
            }
        }))
        .await;
    }

    /// Drops every connection that has reached CLOSED. Returns how many were removed.
    pub fn prune_closed(&self) -> usize {
        let mut pruned = 0;
        self.connections.retain_sync(|_, sender| {
            let keep = sender.state() != State::Closed;
            if !keep {
                pruned += 1;
            }
            keep
        });
        pruned
    }

    fn snapshot(&self) -> Vec<Sender<S>> {
        let mut senders = Vec::with_capacity(self.connections.len());
        self.connections.retain_sync(|_, sender| {
            senders.push(sender.clone());
            true
        });
        senders
    }
}
