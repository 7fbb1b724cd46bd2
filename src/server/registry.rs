use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};

use tracing::{debug, info, warn};

use crate::control::NodeIdentity;
use crate::error::RegistryError;
use crate::server::session::{NodeSession, StreamSink};

/// Receives node-down transitions.
pub trait NodeDownObserver: Send + Sync + 'static {
    /// Called exactly once per registered address that goes away.
    fn on_node_down(&self, kind: &str, address: &str);
}

impl<F> NodeDownObserver for F
where
    F: Fn(&str, &str) + Send + Sync + 'static,
{
    fn on_node_down(&self, kind: &str, address: &str) {
        self(kind, address)
    }
}

type AddrMap<V> = HashMap<String, V, ahash::RandomState>;

/// kind → (tag → address). Only consulted for tag-addressed lookups.
#[derive(Debug, Default)]
struct KindIndex {
    kinds: AddrMap<AddrMap<String>>,
}

impl KindIndex {
    /// Point `(kind, tag)` at `address`. Returns the address it pointed at
    /// before, if any.
    fn insert(&mut self, identity: &NodeIdentity, address: &str) -> Option<String> {
        if identity.kind.is_empty() || identity.tag.is_empty() {
            return None;
        }
        self.kinds
            .entry(identity.kind.clone())
            .or_default()
            .insert(identity.tag.clone(), address.to_owned())
    }

    /// Remove `(kind, tag)` only while it still points at `address`.
    fn remove(&mut self, identity: &NodeIdentity, address: &str) {
        let Some(tags) = self.kinds.get_mut(&identity.kind) else {
            return;
        };
        if tags.get(&identity.tag).is_some_and(|owner| owner == address) {
            tags.remove(&identity.tag);
        }
        if tags.is_empty() {
            self.kinds.remove(&identity.kind);
        }
    }

    fn address_of(&self, kind: &str, tag: &str) -> Option<&String> {
        self.kinds.get(kind)?.get(tag)
    }

    fn any_tag(&self, kind: &str) -> Option<&String> {
        self.kinds.get(kind)?.keys().next()
    }
}

#[derive(Debug, Default)]
struct Nodes {
    sessions: AddrMap<Arc<NodeSession>>,
    index: KindIndex,
}

/// Tracks connected nodes by remote address, plus a secondary (kind, tag)
/// index.
///
/// Both maps live behind one lock and are always mutated together, so the
/// index never names an address that is not registered.
pub struct NodeRegistry {
    nodes: Mutex<Nodes>,
    down_observer: OnceLock<Arc<dyn NodeDownObserver>>,
    queue_capacity: usize,
}

impl NodeRegistry {
    pub fn new(queue_capacity: usize) -> Self {
        Self {
            nodes: Mutex::new(Nodes::default()),
            down_observer: OnceLock::new(),
            queue_capacity,
        }
    }

    /// Register the node-down observer. Only the first registration wins.
    pub fn set_down_observer(&self, observer: Arc<dyn NodeDownObserver>) -> bool {
        self.down_observer.set(observer).is_ok()
    }

    /// Register a node. Returns `Ok(true)` when a session was created and
    /// `Ok(false)` when the address was already registered, in which case
    /// nothing changes.
    pub fn node_up(
        &self,
        address: &str,
        identity: NodeIdentity,
        sink: StreamSink,
    ) -> Result<bool, RegistryError> {
        Ok(self.register(address, identity, sink)?.is_some())
    }

    /// Like [`node_up`](Self::node_up), handing back the new session.
    pub(crate) fn register(
        &self,
        address: &str,
        identity: NodeIdentity,
        sink: StreamSink,
    ) -> Result<Option<Arc<NodeSession>>, RegistryError> {
        if address.is_empty() {
            return Err(RegistryError::EmptyAddress);
        }

        let mut nodes = self.lock();
        if nodes.sessions.contains_key(address) {
            debug!(address = %address, "Node already registered");
            return Ok(None);
        }

        let session = NodeSession::new(address, identity.clone(), sink, self.queue_capacity);
        if let Some(previous) = nodes.index.insert(&identity, address) {
            warn!(
                kind = %identity.kind,
                tag = %identity.tag,
                previous = %previous,
                address = %address,
                "Tag taken over by a new node"
            );
        }
        nodes.sessions.insert(address.to_owned(), Arc::clone(&session));

        info!(address = %address, kind = %identity.kind, tag = %identity.tag, "Node up");
        Ok(Some(session))
    }

    /// Update the kind and tag of a registered node. Returns false if the
    /// address is unknown.
    pub fn announce(&self, address: &str, identity: NodeIdentity) -> bool {
        let mut nodes = self.lock();
        let Nodes { sessions, index } = &mut *nodes;

        let Some(session) = sessions.get(address) else {
            return false;
        };

        index.remove(&session.identity(), address);
        if let Some(previous) = index.insert(&identity, address) {
            if previous != address {
                warn!(
                    kind = %identity.kind,
                    tag = %identity.tag,
                    previous = %previous,
                    address = %address,
                    "Tag taken over by a new node"
                );
            }
        }
        session.set_identity(identity.clone());

        info!(address = %address, kind = %identity.kind, tag = %identity.tag, "Node announced");
        true
    }

    /// Remove a node. Safe to call from several triggers for the same
    /// disconnect: only the call that actually removes the node stops its
    /// session and notifies the observer.
    pub fn node_down(&self, address: &str) -> bool {
        self.remove_if(address, |_| true)
    }

    /// Remove `session` only while it is still the one registered under its
    /// address. A newer session on the same address is left alone.
    pub(crate) fn release(&self, session: &Arc<NodeSession>) -> bool {
        self.remove_if(session.remote_address(), |current| {
            Arc::ptr_eq(current, session)
        })
    }

    fn remove_if(&self, address: &str, matches: impl FnOnce(&Arc<NodeSession>) -> bool) -> bool {
        let removed = {
            let mut nodes = self.lock();
            if !nodes.sessions.get(address).is_some_and(matches) {
                return false;
            }
            let removed = nodes.sessions.remove(address);
            if let Some(session) = &removed {
                nodes.index.remove(&session.identity(), address);
            }
            removed
        };

        let Some(session) = removed else {
            return false;
        };

        session.quit();
        let kind = session.kind();
        info!(address = %address, kind = %kind, "Node down");

        if let Some(observer) = self.down_observer.get() {
            observer.on_node_down(&kind, address);
        }
        true
    }

    pub fn get_by_address(&self, address: &str) -> Option<Arc<NodeSession>> {
        self.lock().sessions.get(address).cloned()
    }

    /// Snapshot of every registered session.
    pub fn sessions(&self) -> Vec<Arc<NodeSession>> {
        self.lock().sessions.values().cloned().collect()
    }

    /// Snapshot of every session of the given kind.
    pub fn sessions_of_kind(&self, kind: &str) -> Vec<Arc<NodeSession>> {
        self.lock()
            .sessions
            .values()
            .filter(|session| session.kind() == kind)
            .cloned()
            .collect()
    }

    pub fn pick_address_by_kind_tag(&self, kind: &str, tag: &str) -> Option<String> {
        self.lock().index.address_of(kind, tag).cloned()
    }

    /// Any tag announced under `kind`, in no particular order.
    pub fn pick_any_tag_of_kind(&self, kind: &str) -> Option<String> {
        self.lock().index.any_tag(kind).cloned()
    }

    pub fn len(&self) -> usize {
        self.lock().sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every node without notifying the observer.
    pub fn quit(&self) {
        let sessions: Vec<_> = {
            let mut nodes = self.lock();
            nodes.index = KindIndex::default();
            nodes.sessions.drain().map(|(_, session)| session).collect()
        };
        for session in sessions {
            session.quit();
        }
    }

    fn lock(&self) -> MutexGuard<'_, Nodes> {
        self.nodes
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl fmt::Debug for NodeRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeRegistry")
            .field("nodes", &self.len())
            .field("queue_capacity", &self.queue_capacity)
            .finish()
    }
}

impl Default for NodeRegistry {
    fn default() -> Self {
        Self::new(2048)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::mpsc;

    fn sink() -> StreamSink {
        mpsc::channel(8).0
    }

    fn counting_observer(registry: &NodeRegistry) -> Arc<AtomicUsize> {
        let count = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&count);
        registry.set_down_observer(Arc::new(move |_kind: &str, _address: &str| {
            seen.fetch_add(1, Ordering::SeqCst);
        }));
        count
    }

    #[tokio::test]
    async fn test_node_up_twice_keeps_one_session() {
        let registry = NodeRegistry::default();

        assert!(registry.node_up("10.0.0.1:1", NodeIdentity::default(), sink()).unwrap());
        let first = registry.get_by_address("10.0.0.1:1").unwrap();

        assert!(!registry.node_up("10.0.0.1:1", NodeIdentity::new("game", "g-1"), sink()).unwrap());
        let second = registry.get_by_address("10.0.0.1:1").unwrap();

        assert_eq!(registry.len(), 1);
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(second.kind(), "");
    }

    #[tokio::test]
    async fn test_node_up_rejects_empty_address() {
        let registry = NodeRegistry::default();
        assert!(matches!(
            registry.node_up("", NodeIdentity::default(), sink()),
            Err(RegistryError::EmptyAddress)
        ));
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_announce_indexes_kind_and_tag() {
        let registry = NodeRegistry::default();
        registry.node_up("10.0.0.1:1", NodeIdentity::default(), sink()).unwrap();

        assert!(registry.announce("10.0.0.1:1", NodeIdentity::new("game", "g-1")));
        assert_eq!(
            registry.pick_address_by_kind_tag("game", "g-1").as_deref(),
            Some("10.0.0.1:1")
        );
        assert_eq!(registry.pick_any_tag_of_kind("game").as_deref(), Some("g-1"));
        assert_eq!(registry.get_by_address("10.0.0.1:1").unwrap().tag(), "g-1");

        // Re-announcing moves the index entry.
        assert!(registry.announce("10.0.0.1:1", NodeIdentity::new("game", "g-2")));
        assert_eq!(registry.pick_address_by_kind_tag("game", "g-1"), None);
        assert_eq!(
            registry.pick_address_by_kind_tag("game", "g-2").as_deref(),
            Some("10.0.0.1:1")
        );
    }

    #[tokio::test]
    async fn test_announce_unknown_address() {
        let registry = NodeRegistry::default();
        assert!(!registry.announce("10.0.0.9:1", NodeIdentity::new("game", "g-1")));
        assert_eq!(registry.pick_any_tag_of_kind("game"), None);
    }

    #[tokio::test]
    async fn test_node_down_twice_fires_once() {
        let registry = NodeRegistry::default();
        let downs = counting_observer(&registry);
        registry
            .node_up("10.0.0.1:1", NodeIdentity::new("game", "g-1"), sink())
            .unwrap();
        let session = registry.get_by_address("10.0.0.1:1").unwrap();

        assert!(registry.node_down("10.0.0.1:1"));
        assert!(!registry.node_down("10.0.0.1:1"));

        assert_eq!(downs.load(Ordering::SeqCst), 1);
        assert!(registry.get_by_address("10.0.0.1:1").is_none());
        assert_eq!(registry.pick_address_by_kind_tag("game", "g-1"), None);
        assert!(session.is_closed());
    }

    #[tokio::test]
    async fn test_down_observer_receives_kind() {
        let registry = NodeRegistry::default();
        let (tx, mut rx) = mpsc::unbounded_channel();
        registry.set_down_observer(Arc::new(move |kind: &str, address: &str| {
            let _ = tx.send((kind.to_owned(), address.to_owned()));
        }));
        assert!(!registry.set_down_observer(Arc::new(|_: &str, _: &str| {})));

        registry
            .node_up("10.0.0.1:1", NodeIdentity::new("chat", "c-1"), sink())
            .unwrap();
        registry.node_down("10.0.0.1:1");

        assert_eq!(
            rx.recv().await.unwrap(),
            ("chat".to_owned(), "10.0.0.1:1".to_owned())
        );
    }

    #[tokio::test]
    async fn test_taken_over_tag_survives_old_owner_leaving() {
        let registry = NodeRegistry::default();
        registry
            .node_up("10.0.0.1:1", NodeIdentity::new("game", "g-1"), sink())
            .unwrap();
        registry
            .node_up("10.0.0.2:1", NodeIdentity::new("game", "g-1"), sink())
            .unwrap();

        registry.node_down("10.0.0.1:1");

        assert_eq!(
            registry.pick_address_by_kind_tag("game", "g-1").as_deref(),
            Some("10.0.0.2:1")
        );
    }

    #[tokio::test]
    async fn test_sessions_of_kind() {
        let registry = NodeRegistry::default();
        registry.node_up("a:1", NodeIdentity::new("game", "a"), sink()).unwrap();
        registry.node_up("b:1", NodeIdentity::new("game", "b"), sink()).unwrap();
        registry.node_up("c:1", NodeIdentity::new("chat", "c"), sink()).unwrap();

        let mut game: Vec<_> = registry
            .sessions_of_kind("game")
            .iter()
            .map(|s| s.remote_address().to_owned())
            .collect();
        game.sort();
        assert_eq!(game, vec!["a:1", "b:1"]);
        assert_eq!(registry.sessions().len(), 3);
    }

    #[tokio::test]
    async fn test_quit_drops_everything_silently() {
        let registry = NodeRegistry::default();
        let downs = counting_observer(&registry);
        registry.node_up("a:1", NodeIdentity::new("game", "a"), sink()).unwrap();
        let session = registry.get_by_address("a:1").unwrap();

        registry.quit();

        assert!(registry.is_empty());
        assert!(session.is_closed());
        assert_eq!(registry.pick_any_tag_of_kind("game"), None);
        assert_eq!(downs.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_release_leaves_newer_session_alone() {
        let registry = NodeRegistry::default();
        let downs = counting_observer(&registry);
        let old = registry
            .register("10.0.0.1:1", NodeIdentity::new("game", "g-1"), sink())
            .unwrap()
            .unwrap();
        assert!(registry.node_down("10.0.0.1:1"));

        let new = registry
            .register("10.0.0.1:1", NodeIdentity::new("game", "g-1"), sink())
            .unwrap()
            .unwrap();

        assert!(!registry.release(&old));
        assert!(Arc::ptr_eq(&registry.get_by_address("10.0.0.1:1").unwrap(), &new));
        assert_eq!(downs.load(Ordering::SeqCst), 1);

        assert!(registry.release(&new));
        assert!(registry.is_empty());
        assert_eq!(downs.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_debug_reports_node_count() {
        let registry = NodeRegistry::default();
        registry.node_up("a:1", NodeIdentity::new("game", "a"), sink()).unwrap();

        let printed = format!("{registry:?}");
        assert!(printed.starts_with("NodeRegistry"));
        assert!(printed.contains("nodes: 1"));
    }
}
