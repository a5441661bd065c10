//! In-memory coordination service (for testing and demos)
//!
//! Models the parts of a ZooKeeper-style service the election relies on:
//! a hierarchical namespace, per-parent sequence counters, session-bound
//! ephemeral nodes and one-shot watches. Sessions can be expired or closed
//! to simulate crashes and shutdowns, and transient failures can be injected.

use crate::candidate::{format_sequence, validate_path};
use crate::error::ServiceError;
use crate::service::{
    Connector, CoordinationService, CreateMode, SessionId, SessionState, Stat, WatchEvent,
    WatchEventKind, Watcher,
};
use async_trait::async_trait;
use rand::seq::SliceRandom;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, RwLock};

#[derive(Debug, Default)]
struct NodeEntry {
    ephemeral_owner: Option<SessionId>,
    child_sequence: u64,
}

#[derive(Debug)]
struct SessionSlot {
    state_tx: watch::Sender<SessionState>,
    timeout: Duration,
}

impl SessionSlot {
    fn state(&self) -> SessionState {
        *self.state_tx.borrow()
    }
}

#[derive(Debug)]
struct Registered {
    owner: SessionId,
    watcher: Watcher,
}

#[derive(Debug)]
struct Tree {
    nodes: BTreeMap<String, NodeEntry>,
    data_watches: HashMap<String, Vec<Registered>>,
    child_watches: HashMap<String, Vec<Registered>>,
    sessions: HashMap<SessionId, SessionSlot>,
    next_session: u64,
    injected_failures: u32,
    lose_create_responses: u32,
}

impl Tree {
    fn new() -> Self {
        let mut nodes = BTreeMap::new();
        nodes.insert("/".to_string(), NodeEntry::default());

        Self {
            nodes,
            data_watches: HashMap::new(),
            child_watches: HashMap::new(),
            sessions: HashMap::new(),
            next_session: 1,
            injected_failures: 0,
            lose_create_responses: 0,
        }
    }

    fn check_session(&mut self, id: SessionId) -> Result<(), ServiceError> {
        match self.sessions.get(&id).map(SessionSlot::state) {
            Some(SessionState::Connected) | Some(SessionState::Disconnected) => {}
            Some(SessionState::Closed) => return Err(ServiceError::Closed),
            Some(SessionState::Expired) | None => return Err(ServiceError::SessionExpired),
        }

        if self.injected_failures > 0 {
            self.injected_failures -= 1;
            return Err(ServiceError::connection("injected connection loss"));
        }

        Ok(())
    }

    fn children_of(&self, path: &str) -> Vec<String> {
        let prefix = if path == "/" {
            "/".to_string()
        } else {
            format!("{}/", path)
        };

        self.nodes
            .range(prefix.clone()..)
            .take_while(|(key, _)| key.starts_with(&prefix))
            .filter_map(|(key, _)| {
                let rest = &key[prefix.len()..];
                (!rest.is_empty() && !rest.contains('/')).then(|| rest.to_string())
            })
            .collect()
    }

    fn stat(&self, path: &str) -> Option<Stat> {
        self.nodes.get(path).map(|entry| Stat {
            ephemeral_owner: entry.ephemeral_owner,
            num_children: self.children_of(path).len(),
        })
    }

    fn fire(watches: &mut HashMap<String, Vec<Registered>>, path: &str, kind: WatchEventKind) {
        if let Some(registered) = watches.remove(path) {
            for entry in registered {
                entry.watcher.fire(WatchEvent::new(kind, path));
            }
        }
    }

    fn insert(&mut self, path: String, entry: NodeEntry) {
        let parent = parent_of(&path).to_string();
        self.nodes.insert(path.clone(), entry);
        Self::fire(&mut self.data_watches, &path, WatchEventKind::NodeCreated);
        Self::fire(&mut self.child_watches, &parent, WatchEventKind::NodeChildrenChanged);
    }

    fn remove(&mut self, path: &str) {
        if self.nodes.remove(path).is_some() {
            Self::fire(&mut self.data_watches, path, WatchEventKind::NodeDeleted);
            Self::fire(&mut self.child_watches, path, WatchEventKind::NodeDeleted);
            Self::fire(
                &mut self.child_watches,
                parent_of(path),
                WatchEventKind::NodeChildrenChanged,
            );
        }
    }

    fn create(
        &mut self,
        owner: SessionId,
        path: &str,
        mode: CreateMode,
    ) -> Result<String, ServiceError> {
        validate_path(path).map_err(|_| ServiceError::NoNode(path.to_string()))?;
        if path == "/" {
            return Err(ServiceError::NodeExists(path.to_string()));
        }

        let parent = parent_of(path);
        let parent_entry = self
            .nodes
            .get_mut(parent)
            .ok_or_else(|| ServiceError::NoParent(path.to_string()))?;

        // Every child creation advances the parent's counter, as with a
        // ZooKeeper cversion, so sequence numbers may have gaps.
        let sequence = parent_entry.child_sequence;
        let (created, entry) = match mode {
            CreateMode::Persistent => (path.to_string(), NodeEntry::default()),
            CreateMode::EphemeralSequential => (
                format!("{}{}", path, format_sequence(sequence)),
                NodeEntry {
                    ephemeral_owner: Some(owner),
                    child_sequence: 0,
                },
            ),
        };

        if self.nodes.contains_key(&created) {
            return Err(ServiceError::NodeExists(created));
        }

        if let Some(parent_entry) = self.nodes.get_mut(parent) {
            parent_entry.child_sequence += 1;
        }

        self.insert(created.clone(), entry);
        Ok(created)
    }

    fn delete(&mut self, caller: SessionId, path: &str) -> Result<(), ServiceError> {
        let entry = self
            .nodes
            .get(path)
            .ok_or_else(|| ServiceError::NoNode(path.to_string()))?;

        if let Some(owner) = entry.ephemeral_owner {
            if owner != caller {
                return Err(ServiceError::NotOwner(path.to_string()));
            }
        }

        if !self.children_of(path).is_empty() {
            return Err(ServiceError::NotEmpty(path.to_string()));
        }

        self.remove(path);
        Ok(())
    }

    /// Drop the session's ephemeral nodes and outstanding watches
    fn end_session(&mut self, id: SessionId, state: SessionState) -> bool {
        let Some(slot) = self.sessions.get(&id) else {
            return false;
        };
        if slot.state().is_terminal() {
            return false;
        }

        let owned: Vec<String> = self
            .nodes
            .iter()
            .filter(|(_, entry)| entry.ephemeral_owner == Some(id))
            .map(|(path, _)| path.clone())
            .collect();

        for watches in [&mut self.data_watches, &mut self.child_watches] {
            for registered in watches.values_mut() {
                registered.retain(|entry| entry.owner != id);
            }
            watches.retain(|_, registered| !registered.is_empty());
        }

        for path in owned {
            self.remove(&path);
        }

        if let Some(slot) = self.sessions.get(&id) {
            slot.state_tx.send_replace(state);
        }
        true
    }
}

fn parent_of(path: &str) -> &str {
    match path.rfind('/') {
        Some(0) | None => "/",
        Some(index) => &path[..index],
    }
}

const DEFAULT_SESSION_TIMEOUT: Duration = Duration::from_secs(6);

/// Shared in-memory namespace. Cloning shares the same tree.
#[derive(Debug, Clone)]
pub struct MemoryCoordinator {
    tree: Arc<RwLock<Tree>>,
}

impl Default for MemoryCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryCoordinator {
    pub fn new() -> Self {
        Self {
            tree: Arc::new(RwLock::new(Tree::new())),
        }
    }

    /// Open a new session with the default timeout
    pub async fn connect(&self) -> Arc<MemorySession> {
        self.connect_with_timeout(DEFAULT_SESSION_TIMEOUT).await
    }

    /// Open a new session negotiating `timeout`.
    ///
    /// Nothing expires on its own here; tests call [`Self::expire_session`]
    /// where the real service would act after `timeout`.
    pub async fn connect_with_timeout(&self, timeout: Duration) -> Arc<MemorySession> {
        let mut tree = self.tree.write().await;
        let id = SessionId(tree.next_session);
        tree.next_session += 1;

        let (state_tx, state_rx) = watch::channel(SessionState::Connected);
        tree.sessions.insert(id, SessionSlot { state_tx, timeout });

        tracing::debug!("Opened in-memory session {}", id);
        Arc::new(MemorySession {
            id,
            tree: self.tree.clone(),
            state_rx,
        })
    }

    /// Timeout negotiated by a session
    pub async fn session_timeout(&self, id: SessionId) -> Option<Duration> {
        self.tree
            .read()
            .await
            .sessions
            .get(&id)
            .map(|slot| slot.timeout)
    }

    /// Expire a session as the service would after missed heartbeats
    pub async fn expire_session(&self, id: SessionId) -> bool {
        let mut tree = self.tree.write().await;
        let expired = tree.end_session(id, SessionState::Expired);
        if expired {
            tracing::debug!("Expired in-memory session {}", id);
        }
        expired
    }

    /// Fail the next `count` calls from any session with a connection error
    pub async fn fail_next_calls(&self, count: u32) {
        self.tree.write().await.injected_failures = count;
    }

    /// Perform the next `count` creates but report a connection error,
    /// leaving the caller unsure whether the node exists
    pub async fn lose_next_create_responses(&self, count: u32) {
        self.tree.write().await.lose_create_responses = count;
    }

    /// Fire a data-changed event on `path` without altering the tree
    pub async fn touch(&self, path: &str) -> bool {
        let mut tree = self.tree.write().await;
        if !tree.nodes.contains_key(path) {
            return false;
        }
        Tree::fire(&mut tree.data_watches, path, WatchEventKind::NodeDataChanged);
        true
    }

    /// Remove a node regardless of its owner
    pub async fn force_delete(&self, path: &str) -> bool {
        let mut tree = self.tree.write().await;
        let existed = tree.nodes.contains_key(path);
        tree.remove(path);
        existed
    }

    pub async fn node_exists(&self, path: &str) -> bool {
        self.tree.read().await.nodes.contains_key(path)
    }

    /// Sorted child names of `path`
    pub async fn children(&self, path: &str) -> Vec<String> {
        self.tree.read().await.children_of(path)
    }

    /// Session owning an ephemeral node
    pub async fn owner_of(&self, path: &str) -> Option<SessionId> {
        self.tree
            .read()
            .await
            .nodes
            .get(path)
            .and_then(|entry| entry.ephemeral_owner)
    }

    /// Number of live watches on `path`, counting only those still listened to
    pub async fn watch_count(&self, path: &str) -> usize {
        let tree = self.tree.read().await;
        tree.data_watches
            .get(path)
            .map(|registered| {
                registered
                    .iter()
                    .filter(|entry| !entry.watcher.is_closed())
                    .count()
            })
            .unwrap_or(0)
    }

    /// Live data watches per path
    pub async fn watches(&self) -> BTreeMap<String, usize> {
        let tree = self.tree.read().await;
        tree.data_watches
            .iter()
            .map(|(path, registered)| {
                let live = registered
                    .iter()
                    .filter(|entry| !entry.watcher.is_closed())
                    .count();
                (path.clone(), live)
            })
            .filter(|(_, live)| *live > 0)
            .collect()
    }

    /// Total live data watches held by all sessions
    pub async fn total_watch_count(&self) -> usize {
        self.watches().await.values().sum()
    }
}

/// A single session against a [`MemoryCoordinator`]
#[derive(Debug)]
pub struct MemorySession {
    id: SessionId,
    tree: Arc<RwLock<Tree>>,
    state_rx: watch::Receiver<SessionState>,
}

#[async_trait]
impl CoordinationService for MemorySession {
    async fn create_node(&self, path: &str, mode: CreateMode) -> Result<String, ServiceError> {
        let mut tree = self.tree.write().await;
        tree.check_session(self.id)?;
        let created = tree.create(self.id, path, mode)?;

        if tree.lose_create_responses > 0 {
            tree.lose_create_responses -= 1;
            return Err(ServiceError::connection("response lost after create"));
        }
        Ok(created)
    }

    async fn exists(
        &self,
        path: &str,
        watcher: Option<Watcher>,
    ) -> Result<Option<Stat>, ServiceError> {
        let mut tree = self.tree.write().await;
        tree.check_session(self.id)?;

        if let Some(watcher) = watcher {
            tree.data_watches
                .entry(path.to_string())
                .or_default()
                .push(Registered {
                    owner: self.id,
                    watcher,
                });
        }

        Ok(tree.stat(path))
    }

    async fn get_children(
        &self,
        path: &str,
        watcher: Option<Watcher>,
    ) -> Result<Vec<String>, ServiceError> {
        let mut tree = self.tree.write().await;
        tree.check_session(self.id)?;

        if !tree.nodes.contains_key(path) {
            return Err(ServiceError::NoNode(path.to_string()));
        }

        if let Some(watcher) = watcher {
            tree.child_watches
                .entry(path.to_string())
                .or_default()
                .push(Registered {
                    owner: self.id,
                    watcher,
                });
        }

        // The real service makes no ordering promise
        let mut children = tree.children_of(path);
        children.shuffle(&mut rand::thread_rng());
        Ok(children)
    }

    async fn delete(&self, path: &str) -> Result<(), ServiceError> {
        let mut tree = self.tree.write().await;
        tree.check_session(self.id)?;
        tree.delete(self.id, path)
    }

    fn session_id(&self) -> SessionId {
        self.id
    }

    fn session_state(&self) -> watch::Receiver<SessionState> {
        self.state_rx.clone()
    }

    async fn close(&self) -> Result<(), ServiceError> {
        let mut tree = self.tree.write().await;
        if tree.end_session(self.id, SessionState::Closed) {
            tracing::debug!("Closed in-memory session {}", self.id);
        }
        Ok(())
    }
}

/// Opens [`MemorySession`]s on a shared coordinator
#[derive(Debug, Clone, Default)]
pub struct MemoryConnector {
    coordinator: MemoryCoordinator,
}

impl MemoryConnector {
    pub fn new(coordinator: MemoryCoordinator) -> Self {
        Self { coordinator }
    }

    pub fn coordinator(&self) -> &MemoryCoordinator {
        &self.coordinator
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(
        &self,
        session_timeout: Duration,
    ) -> Result<Arc<dyn CoordinationService>, ServiceError> {
        let session: Arc<dyn CoordinationService> =
            self.coordinator.connect_with_timeout(session_timeout).await;
        Ok(session)
    }
}
