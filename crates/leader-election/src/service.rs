//! Coordination service capability interface
//!
//! The election only needs a small slice of what a ZooKeeper-style service
//! offers: node creation (persistent and ephemeral-sequential), existence
//! checks, child listing, deletion and one-shot watches. Each
//! [`CoordinationService`] value represents exactly one client session.

use crate::error::ServiceError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, watch};

/// Identifier of a client session
#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionId(pub u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:016x}", self.0)
    }
}

/// How a node is created
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CreateMode {
    /// Survives the creating session
    Persistent,

    /// Bound to the creating session, name suffixed with a sequence number
    EphemeralSequential,
}

/// Node metadata returned by `exists`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Stat {
    /// Owning session for ephemeral nodes, `None` for persistent ones
    pub ephemeral_owner: Option<SessionId>,

    /// Number of direct children
    pub num_children: usize,
}

/// Connection state of a session, as reported by the service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionState {
    Connected,

    /// Temporarily unreachable; the session may still be recovered
    Disconnected,

    /// The service has discarded the session and its ephemeral nodes
    Expired,

    /// Closed by its owner
    Closed,
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Expired | Self::Closed)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connected => write!(f, "connected"),
            Self::Disconnected => write!(f, "disconnected"),
            Self::Expired => write!(f, "expired"),
            Self::Closed => write!(f, "closed"),
        }
    }
}

/// Kind of change a watch reports
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WatchEventKind {
    NodeCreated,
    NodeDeleted,
    NodeDataChanged,
    NodeChildrenChanged,
}

/// A delivered watch notification
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchEvent {
    pub kind: WatchEventKind,
    pub path: String,
}

impl WatchEvent {
    pub fn new<T: Into<String>>(kind: WatchEventKind, path: T) -> Self {
        Self {
            kind,
            path: path.into(),
        }
    }
}

/// Receiving half of a one-shot watch
pub type WatchReceiver = oneshot::Receiver<WatchEvent>;

/// Sending half of a one-shot watch, handed to the service.
///
/// Firing consumes the watcher, so a watch can be delivered at most once.
/// Observing further changes requires registering a new watcher.
#[derive(Debug)]
pub struct Watcher {
    tx: oneshot::Sender<WatchEvent>,
}

impl Watcher {
    pub fn new() -> (Self, WatchReceiver) {
        let (tx, rx) = oneshot::channel();
        (Self { tx }, rx)
    }

    /// Deliver the event. Returns false if nobody is listening any more.
    pub fn fire(self, event: WatchEvent) -> bool {
        self.tx.send(event).is_ok()
    }

    /// True once the receiving side has been dropped
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Capability set consumed from the coordination service, scoped to one session
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CoordinationService: Send + Sync {
    /// Create a node and return its full path (including any sequence suffix)
    async fn create_node(&self, path: &str, mode: CreateMode) -> Result<String, ServiceError>;

    /// Stat a node, optionally leaving a one-shot watch on it
    async fn exists(&self, path: &str, watcher: Option<Watcher>)
        -> Result<Option<Stat>, ServiceError>;

    /// Names of the direct children of `path`, optionally leaving a one-shot watch
    async fn get_children(
        &self,
        path: &str,
        watcher: Option<Watcher>,
    ) -> Result<Vec<String>, ServiceError>;

    /// Delete a node owned by this session
    async fn delete(&self, path: &str) -> Result<(), ServiceError>;

    /// Id of this session
    fn session_id(&self) -> SessionId;

    /// Session state notifications
    fn session_state(&self) -> watch::Receiver<SessionState>;

    /// End the session. The service removes its ephemeral nodes.
    async fn close(&self) -> Result<(), ServiceError>;
}

/// Establishes new sessions with the coordination service
#[async_trait]
pub trait Connector: Send + Sync {
    /// Open a session. The service expires it once `session_timeout` passes
    /// without contact, which bounds how long a crashed leader keeps its entry.
    async fn connect(
        &self,
        session_timeout: Duration,
    ) -> Result<Arc<dyn CoordinationService>, ServiceError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_watcher_fires_once() {
        let (watcher, rx) = Watcher::new();
        assert!(!watcher.is_closed());

        assert!(watcher.fire(WatchEvent::new(WatchEventKind::NodeDeleted, "/chroot/a")));
        let event = rx.await.unwrap();
        assert_eq!(event.kind, WatchEventKind::NodeDeleted);
        assert_eq!(event.path, "/chroot/a");
    }

    #[test]
    fn test_watcher_detects_dropped_receiver() {
        let (watcher, rx) = Watcher::new();
        drop(rx);
        assert!(watcher.is_closed());
        assert!(!watcher.fire(WatchEvent::new(WatchEventKind::NodeDeleted, "/chroot/a")));
    }

    #[test]
    fn test_session_display() {
        assert_eq!(SessionId(255).to_string(), "0x00000000000000ff");
        assert_eq!(SessionState::Expired.to_string(), "expired");
        assert!(SessionState::Closed.is_terminal());
        assert!(!SessionState::Disconnected.is_terminal());
    }
}
