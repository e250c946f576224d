//! Registry of live sessions, keyed by client key
//!
//! Besides the sessions of directly attached clients, the manager tracks
//! links to peer servers and which client keys each peer has announced, so
//! a dial for a client attached elsewhere can be routed over one hop.

use dialback_proto::{ConnectRequest, Frame};
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Weak};
use tracing::{debug, info};

use crate::connection::MuxStream;
use crate::error::{DialError, SessionError};
use crate::metrics::{MetricsSink, NoopMetrics};
use crate::session::Session;

/// Receives client-key announcements arriving over peer links
pub trait ClientDirectory: Send + Sync {
    fn add_remote(&self, peer_id: &str, client_key: &str);
    fn remove_remote(&self, peer_id: &str, client_key: &str);
}

#[derive(Default)]
struct Registry {
    /// Directly attached clients
    clients: HashMap<String, Session>,
    /// Our outbound links to peer servers, by peer id
    peers: HashMap<String, Session>,
    /// Inbound links from peer servers, by session id
    listeners: HashMap<u64, Session>,
    /// Client key to the peers that announced it
    remote: HashMap<String, BTreeSet<String>>,
}

struct ManagerInner {
    registry: Mutex<Registry>,
    metrics: Arc<dyn MetricsSink>,
}

#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<ManagerInner>,
}

impl std::fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let registry = self.inner.registry.lock();
        f.debug_struct("SessionManager")
            .field("clients", &registry.clients.len())
            .field("peers", &registry.peers.len())
            .field("listeners", &registry.listeners.len())
            .finish()
    }
}

impl Default for SessionManager {
    fn default() -> Self {
        Self::new(Arc::new(NoopMetrics))
    }
}

/// Non-owning handle, held by sessions and their watchers
#[derive(Clone)]
pub struct WeakSessionManager {
    inner: Weak<ManagerInner>,
}

impl std::fmt::Debug for WeakSessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WeakSessionManager").finish()
    }
}

impl WeakSessionManager {
    pub fn upgrade(&self) -> Option<SessionManager> {
        self.inner.upgrade().map(|inner| SessionManager { inner })
    }
}

impl ClientDirectory for WeakSessionManager {
    fn add_remote(&self, peer_id: &str, client_key: &str) {
        if let Some(manager) = self.upgrade() {
            manager.add_remote(peer_id, client_key);
        }
    }

    fn remove_remote(&self, peer_id: &str, client_key: &str) {
        if let Some(manager) = self.upgrade() {
            manager.remove_remote(peer_id, client_key);
        }
    }
}

impl SessionManager {
    pub fn new(metrics: Arc<dyn MetricsSink>) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                registry: Mutex::new(Registry::default()),
                metrics,
            }),
        }
    }

    pub fn downgrade(&self) -> WeakSessionManager {
        WeakSessionManager {
            inner: Arc::downgrade(&self.inner),
        }
    }

    pub fn metrics(&self) -> Arc<dyn MetricsSink> {
        self.inner.metrics.clone()
    }

    /// Make `session` the one serving `client_key`
    ///
    /// A session already registered under the key is closed with
    /// [`SessionError::Replaced`]. The entry is removed once the session
    /// ends, unless a newer one has taken its place by then.
    pub fn register(&self, client_key: &str, session: Session) {
        let (previous, listeners) = {
            let mut registry = self.inner.registry.lock();
            let previous = registry
                .clients
                .insert(client_key.to_string(), session.clone());
            let listeners: Vec<Session> = registry.listeners.values().cloned().collect();
            (previous, listeners)
        };

        if let Some(previous) = previous {
            info!(
                client_key = %client_key,
                old_session = previous.id(),
                new_session = session.id(),
                "Replacing session"
            );
            previous.terminate(SessionError::Replaced);
        }

        info!(client_key = %client_key, session_id = session.id(), "Client registered");
        self.inner.metrics.session_added(client_key, false);
        for listener in listeners {
            listener.queue_frame(Frame::add_client(client_key));
        }

        let manager = self.downgrade();
        let client_key = client_key.to_string();
        tokio::spawn(async move {
            session.closed().await;
            if let Some(manager) = manager.upgrade() {
                manager.unregister(&client_key, &session);
            }
        });
    }

    fn unregister(&self, client_key: &str, session: &Session) {
        let listeners = {
            let mut registry = self.inner.registry.lock();
            match registry.clients.get(client_key) {
                Some(current) if current.same_session(session) => {
                    registry.clients.remove(client_key);
                    Some(registry.listeners.values().cloned().collect::<Vec<_>>())
                }
                _ => None,
            }
        };

        self.inner.metrics.session_removed(client_key, false);
        info!(
            client_key = %client_key,
            session_id = session.id(),
            reason = ?session.close_reason(),
            "Client session ended"
        );

        // A replaced session must not withdraw the key from peers
        if let Some(listeners) = listeners {
            for listener in listeners {
                listener.queue_frame(Frame::remove_client(client_key));
            }
        }
    }

    /// Track an inbound link from peer server `peer_id` and announce every
    /// locally attached client over it
    pub fn register_peer_listener(&self, peer_id: &str, session: Session) {
        let keys = {
            let mut registry = self.inner.registry.lock();
            registry.listeners.insert(session.id(), session.clone());
            registry.clients.keys().cloned().collect::<Vec<_>>()
        };

        info!(peer_id = %peer_id, session_id = session.id(), clients = keys.len(), "Peer attached");
        self.inner.metrics.session_added(peer_id, true);
        for key in &keys {
            session.queue_frame(Frame::add_client(key));
        }

        let manager = self.downgrade();
        let peer_id = peer_id.to_string();
        tokio::spawn(async move {
            session.closed().await;
            if let Some(manager) = manager.upgrade() {
                manager.inner.registry.lock().listeners.remove(&session.id());
                manager.inner.metrics.session_removed(&peer_id, true);
                info!(peer_id = %peer_id, session_id = session.id(), "Peer detached");
            }
        });
    }

    /// Track our outbound link to peer server `peer_id`
    ///
    /// When the link ends, every client key the peer announced is forgotten.
    pub fn add_peer_session(&self, peer_id: &str, session: Session) {
        let previous = self
            .inner
            .registry
            .lock()
            .peers
            .insert(peer_id.to_string(), session.clone());
        if let Some(previous) = previous {
            previous.terminate(SessionError::Replaced);
        }
        debug!(peer_id = %peer_id, session_id = session.id(), "Peer link added");

        let manager = self.downgrade();
        let peer_id = peer_id.to_string();
        tokio::spawn(async move {
            session.closed().await;
            if let Some(manager) = manager.upgrade() {
                manager.remove_peer_session(&peer_id, &session);
            }
        });
    }

    fn remove_peer_session(&self, peer_id: &str, session: &Session) {
        let mut registry = self.inner.registry.lock();
        match registry.peers.get(peer_id) {
            Some(current) if current.same_session(session) => {
                registry.peers.remove(peer_id);
            }
            _ => return,
        }
        registry.remote.retain(|_, peers| {
            peers.remove(peer_id);
            !peers.is_empty()
        });
        debug!(peer_id = %peer_id, "Peer link removed");
    }

    pub fn add_remote(&self, peer_id: &str, client_key: &str) {
        debug!(peer_id = %peer_id, client_key = %client_key, "Remote client announced");
        self.inner
            .registry
            .lock()
            .remote
            .entry(client_key.to_string())
            .or_default()
            .insert(peer_id.to_string());
    }

    pub fn remove_remote(&self, peer_id: &str, client_key: &str) {
        debug!(peer_id = %peer_id, client_key = %client_key, "Remote client withdrawn");
        let mut registry = self.inner.registry.lock();
        if let Some(peers) = registry.remote.get_mut(client_key) {
            peers.remove(peer_id);
            if peers.is_empty() {
                registry.remote.remove(client_key);
            }
        }
    }

    /// Open a logical connection to `address` through the client `client_key`
    ///
    /// A locally attached client is preferred; otherwise the dial goes over
    /// the link to a peer that announced the key. Fails with
    /// [`DialError::NotFound`] when neither exists, creating no state.
    pub async fn dial(
        &self,
        client_key: &str,
        proto: &str,
        address: &str,
    ) -> Result<MuxStream, DialError> {
        if let Some(session) = self.session(client_key) {
            return session.dial(proto, address).await;
        }

        let peer = {
            let registry = self.inner.registry.lock();
            registry
                .remote
                .get(client_key)
                .into_iter()
                .flatten()
                .find_map(|peer_id| registry.peers.get(peer_id).cloned())
        };

        let Some(peer) = peer else {
            return Err(DialError::NotFound(client_key.to_string()));
        };

        debug!(client_key = %client_key, peer_id = %peer.client_key(), "Dialing through peer");
        let request =
            ConnectRequest::for_client(client_key, proto, address, peer.config().dial_timeout);
        peer.dial_request(request).await
    }

    /// Dial through a locally attached client only
    pub async fn dial_local(
        &self,
        client_key: &str,
        request: ConnectRequest,
    ) -> Result<MuxStream, DialError> {
        let session = self
            .session(client_key)
            .ok_or_else(|| DialError::NotFound(client_key.to_string()))?;
        session.dial_request(request).await
    }

    /// Session serving a locally attached client
    pub fn session(&self, client_key: &str) -> Option<Session> {
        self.inner.registry.lock().clients.get(client_key).cloned()
    }

    /// Whether `client_key` can be dialed, locally or through a peer
    pub fn has_session(&self, client_key: &str) -> bool {
        let registry = self.inner.registry.lock();
        registry.clients.contains_key(client_key)
            || registry
                .remote
                .get(client_key)
                .is_some_and(|peers| peers.iter().any(|peer| registry.peers.contains_key(peer)))
    }

    /// Keys of locally attached clients, sorted
    pub fn client_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.inner.registry.lock().clients.keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Ids of peers we hold an outbound link to, sorted
    pub fn peer_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.inner.registry.lock().peers.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Client keys announced by peers, sorted
    pub fn remote_client_keys(&self) -> Vec<String> {
        self.inner.registry.lock().remote.keys().cloned().collect::<BTreeSet<_>>().into_iter().collect()
    }

    /// Close and forget the session serving `client_key`
    pub fn remove(&self, client_key: &str) -> bool {
        let session = self.inner.registry.lock().clients.get(client_key).cloned();
        match session {
            Some(session) => {
                session.close();
                true
            }
            None => false,
        }
    }

    /// Close every session the manager knows about
    pub fn shutdown(&self) {
        let sessions: Vec<Session> = {
            let registry = self.inner.registry.lock();
            registry
                .clients
                .values()
                .chain(registry.peers.values())
                .chain(registry.listeners.values())
                .cloned()
                .collect()
        };
        for session in sessions {
            session.close();
        }
    }
}
