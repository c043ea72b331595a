use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{RwLock, mpsc};
use tracing::debug;
use uuid::Uuid;

use courier_types::events::ServerEvent;

/// In-memory map of live sessions: one connection per identity.
///
/// Constructed once at startup and handed by clone to every component
/// that delivers events — there is no global state. All access goes
/// through the single RwLock; the lock is only ever held for map
/// access, never across store I/O.
#[derive(Clone)]
pub struct Registry {
    inner: Arc<RegistryInner>,
}

struct Session {
    conn_id: Uuid,
    tx: mpsc::UnboundedSender<ServerEvent>,
}

struct RegistryInner {
    sessions: RwLock<HashMap<Uuid, Session>>,
}

impl Registry {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                sessions: RwLock::new(HashMap::new()),
            }),
        }
    }

    /// Register a connection for `user_id`, replacing any existing one
    /// (last-connection-wins: the replaced sender is dropped, which
    /// closes the old connection's receive loop). Returns the
    /// connection id used to guard unregistration.
    ///
    /// Every registration broadcasts the full online snapshot to all
    /// live connections, including the new one.
    pub async fn register(
        &self,
        user_id: Uuid,
        tx: mpsc::UnboundedSender<ServerEvent>,
    ) -> Uuid {
        let conn_id = Uuid::new_v4();
        self.inner
            .sessions
            .write()
            .await
            .insert(user_id, Session { conn_id, tx });

        self.broadcast_presence().await;
        conn_id
    }

    /// Remove the session for `user_id`, but only if `conn_id` still
    /// owns it — a stale disconnect must not evict a newer connection.
    /// Returns whether the mapping was actually removed.
    pub async fn unregister(&self, user_id: Uuid, conn_id: Uuid) -> bool {
        let removed = {
            let mut sessions = self.inner.sessions.write().await;
            match sessions.get(&user_id) {
                Some(session) if session.conn_id == conn_id => {
                    sessions.remove(&user_id);
                    true
                }
                _ => false,
            }
        };

        if removed {
            self.broadcast_presence().await;
        }
        removed
    }

    /// Deliver an event to a single user's live connection.
    /// An absent mapping means offline — not an error, nothing happens.
    pub async fn push(&self, user_id: Uuid, event: ServerEvent) {
        let sessions = self.inner.sessions.read().await;
        if let Some(session) = sessions.get(&user_id) {
            if session.tx.send(event).is_err() {
                debug!("push to {} failed, connection closing", user_id);
            }
        }
    }

    /// Deliver an event to each of `user_ids`. Per-recipient failures
    /// are swallowed; one dead connection never blocks the rest.
    pub async fn push_many(&self, user_ids: &[Uuid], event: ServerEvent) {
        let sessions = self.inner.sessions.read().await;
        for user_id in user_ids {
            if let Some(session) = sessions.get(user_id) {
                if session.tx.send(event.clone()).is_err() {
                    debug!("push to {} failed, connection closing", user_id);
                }
            }
        }
    }

    pub async fn is_online(&self, user_id: Uuid) -> bool {
        self.inner.sessions.read().await.contains_key(&user_id)
    }

    /// Identities currently holding a live connection.
    pub async fn snapshot(&self) -> Vec<Uuid> {
        self.inner.sessions.read().await.keys().copied().collect()
    }

    async fn broadcast_presence(&self) {
        let (online, txs): (Vec<Uuid>, Vec<mpsc::UnboundedSender<ServerEvent>>) = {
            let sessions = self.inner.sessions.read().await;
            (
                sessions.keys().copied().collect(),
                sessions.values().map(|s| s.tx.clone()).collect(),
            )
        };

        let event = ServerEvent::UsersUpdated { online };
        for tx in txs {
            let _ = tx.send(event.clone());
        }
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn connect(
        registry: &Registry,
        user: Uuid,
    ) -> (Uuid, mpsc::UnboundedReceiver<ServerEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let conn_id = registry.register(user, tx).await;
        (conn_id, rx)
    }

    #[tokio::test]
    async fn register_broadcasts_full_snapshot() {
        let registry = Registry::new();
        let alice = Uuid::new_v4();
        let bob = Uuid::new_v4();

        let (_, mut alice_rx) = connect(&registry, alice).await;
        // Alice sees herself in the first snapshot
        match alice_rx.recv().await.unwrap() {
            ServerEvent::UsersUpdated { online } => assert_eq!(online, vec![alice]),
            other => panic!("unexpected event: {:?}", other),
        }

        let (_, _bob_rx) = connect(&registry, bob).await;
        // Bob's arrival reaches Alice with both identities
        match alice_rx.recv().await.unwrap() {
            ServerEvent::UsersUpdated { online } => {
                assert_eq!(online.len(), 2);
                assert!(online.contains(&alice) && online.contains(&bob));
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn later_register_replaces_earlier_connection() {
        let registry = Registry::new();
        let alice = Uuid::new_v4();

        let (first_conn, mut first_rx) = connect(&registry, alice).await;
        let (_, _second_rx) = connect(&registry, alice).await;

        // The first connection's channel is closed by the replacement
        first_rx.recv().await.unwrap(); // its own presence snapshot
        assert!(first_rx.recv().await.is_none());

        // A stale unregister from the replaced connection is a no-op
        assert!(!registry.unregister(alice, first_conn).await);
        assert!(registry.is_online(alice).await);
    }

    #[tokio::test]
    async fn push_to_offline_user_is_silent() {
        let registry = Registry::new();
        registry
            .push(
                Uuid::new_v4(),
                ServerEvent::MessageDeleted {
                    message_id: Uuid::new_v4(),
                },
            )
            .await;
        // nothing to assert — absence of a session is not an error
    }

    #[tokio::test]
    async fn unregister_removes_from_snapshot() {
        let registry = Registry::new();
        let alice = Uuid::new_v4();
        let (conn_id, _rx) = connect(&registry, alice).await;

        assert!(registry.unregister(alice, conn_id).await);
        assert!(registry.snapshot().await.is_empty());
    }
}
