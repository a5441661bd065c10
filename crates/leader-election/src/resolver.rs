//! Candidate ordering and role resolution

use crate::candidate::{CandidateId, CandidateSet, ElectionRoot};
use crate::config::RetryConfig;
use crate::error::{ElectionError, Result};
use crate::retry::with_retry;
use crate::service::CoordinationService;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Role of a candidate after resolution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    Leader,
    Follower,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Leader => write!(f, "leader"),
            Self::Follower => write!(f, "follower"),
        }
    }
}

/// Outcome of [`resolve_role`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// We hold the minimal sequence number
    Leader,

    /// Someone ranks ahead of us; watch the candidate immediately before us
    Follower { predecessor: CandidateId },
}

impl Resolution {
    pub fn role(&self) -> Role {
        match self {
            Self::Leader => Role::Leader,
            Self::Follower { .. } => Role::Follower,
        }
    }

    /// Candidate to watch, `None` for the leader
    pub fn watch_target(&self) -> Option<&CandidateId> {
        match self {
            Self::Leader => None,
            Self::Follower { predecessor } => Some(predecessor),
        }
    }
}

/// Decide the role of `self_id` within `candidates`.
///
/// The leader is the minimum; every follower watches the largest candidate
/// strictly smaller than itself, never the leader unless it is adjacent.
pub fn resolve_role(self_id: &CandidateId, candidates: &CandidateSet) -> Result<Resolution> {
    if !candidates.contains(self_id) {
        return Err(ElectionError::self_not_registered(self_id.path()));
    }

    match candidates.predecessor_of(self_id) {
        None => Ok(Resolution::Leader),
        Some(predecessor) => Ok(Resolution::Follower {
            predecessor: predecessor.clone(),
        }),
    }
}

/// Reads the live candidate set from the coordination service
pub struct ElectionResolver {
    service: Arc<dyn CoordinationService>,
    prefix: String,
    retry: RetryConfig,
}

impl ElectionResolver {
    pub fn new<T: Into<String>>(
        service: Arc<dyn CoordinationService>,
        prefix: T,
        retry: RetryConfig,
    ) -> Self {
        Self {
            service,
            prefix: prefix.into(),
            retry,
        }
    }

    /// All live candidates under `root`, ascending by sequence number.
    ///
    /// Read-only. Children that are not candidate entries are skipped.
    pub async fn list_candidates(&self, root: &ElectionRoot) -> Result<CandidateSet> {
        let children = with_retry(&self.retry, "get_children", || {
            self.service.get_children(root.as_str(), None)
        })
        .await
        .map_err(|e| ElectionError::resolution(root.as_str(), e))?;

        let candidates = children
            .iter()
            .filter_map(|name| match CandidateId::from_child(root, &self.prefix, name) {
                Ok(candidate) => Some(candidate),
                Err(_) => {
                    tracing::debug!("Ignoring non-candidate child {} under {}", name, root);
                    None
                }
            })
            .collect();

        Ok(CandidateSet::new(candidates))
    }

    /// List the candidates and resolve our role in one step
    pub async fn resolve(&self, root: &ElectionRoot, self_id: &CandidateId) -> Result<Resolution> {
        let candidates = self.list_candidates(root).await?;
        let resolution = resolve_role(self_id, &candidates)?;

        if let Some(leader) = candidates.leader() {
            tracing::debug!(
                candidates = candidates.len(),
                role = %resolution.role(),
                "Candidate {} resolved, leader is {}",
                self_id,
                leader
            );
        }
        Ok(resolution)
    }
}
