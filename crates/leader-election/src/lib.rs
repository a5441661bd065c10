//! Leader Election
//!
//! This crate implements leader election on top of a ZooKeeper-style
//! coordination service. Every participant registers an ephemeral,
//! sequence-numbered candidate entry under a shared root; the smallest
//! sequence number leads, and every other candidate watches only the entry
//! immediately ahead of it, so a departure wakes exactly one successor.
//!
//! The service is consumed through the [`CoordinationService`] trait. An
//! in-memory implementation ([`MemoryCoordinator`]) is included for tests
//! and demos.

pub mod candidate;
pub mod config;
pub mod election;
pub mod error;
pub mod memory;
pub mod observer;
pub mod registrar;
pub mod resolver;
pub mod retry;
pub mod service;
pub mod watch;

pub use candidate::{CandidateId, CandidateSet, ElectionRoot};
pub use config::{ElectionConfig, RetryConfig};
pub use election::{ElectionHandle, ElectionLoop, LeadershipState};
pub use error::{ElectionError, Result, ServiceError};
pub use memory::{MemoryConnector, MemoryCoordinator, MemorySession};
pub use observer::{ElectionObserver, TracingObserver};
pub use registrar::CandidateRegistrar;
pub use resolver::{resolve_role, ElectionResolver, Resolution, Role};
pub use service::{
    Connector, CoordinationService, CreateMode, SessionId, SessionState, Stat, WatchEvent,
    WatchEventKind, Watcher,
};
pub use watch::{WatchFired, WatchManager, WatchSubscription};
